//! Zerodha Kite Connect (v3) client.
//!
//! - Session: POST /session/token and /session/refresh_token, signed with
//!   `sha256(api_key + token + api_secret)`
//! - Equity holdings via /portfolio/holdings, mutual funds via /mf/holdings
//! - Positions via /portfolio/positions (net book)
//!
//! API documentation: https://kite.trade/docs/connect/v3/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use finsight_core::brokers::{BrokerClient, BrokerError, TokenGrant};
use finsight_core::errors::Result;
use finsight_core::{BrokerType, Error, Holding, HoldingType};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::common::{http_client, lenient_decimal, request_error, sha256_hex};

pub const KITE_API_URL: &str = "https://api.kite.trade";
pub const KITE_LOGIN_URL: &str = "https://kite.zerodha.com/connect/login";
const KITE_VERSION: &str = "3";
const BROKER: BrokerType = BrokerType::Zerodha;

// ============================================================================
// API Response Structures
// ============================================================================

/// Envelope wrapping every Kite response.
#[derive(Debug, Deserialize)]
struct KiteEnvelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KiteHolding {
    tradingsymbol: String,
    #[serde(default)]
    isin: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    quantity: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    average_price: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    last_price: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pnl: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    day_change: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    day_change_percentage: Decimal,
}

/// Mutual fund holding. Kite uses the scheme ISIN as the trading symbol.
#[derive(Debug, Deserialize)]
struct KiteMfHolding {
    tradingsymbol: String,
    #[serde(default)]
    fund: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    quantity: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    average_price: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    last_price: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pnl: Decimal,
}

#[derive(Debug, Deserialize)]
struct KitePositions {
    #[serde(default)]
    net: Vec<KitePosition>,
}

#[derive(Debug, Deserialize)]
struct KitePosition {
    tradingsymbol: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    quantity: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    average_price: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    last_price: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pnl: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    m2m: Decimal,
}

// ============================================================================
// Normalization
// ============================================================================

fn map_holding(h: KiteHolding, now: DateTime<Utc>) -> Holding {
    Holding {
        item_name: h.tradingsymbol,
        isin: h.isin,
        quantity: h.quantity,
        average_price: h.average_price,
        last_traded_price: h.last_price,
        current_value: h.quantity * h.last_price,
        day_change: h.day_change,
        day_change_percent: h.day_change_percentage,
        total_pnl: h.pnl,
        platform: BROKER,
        holding_type: HoldingType::Stock,
        last_updated: now,
    }
}

fn map_mf_holding(h: KiteMfHolding, now: DateTime<Utc>) -> Holding {
    Holding {
        item_name: h.fund.filter(|f| !f.is_empty()).unwrap_or_else(|| h.tradingsymbol.clone()),
        isin: h.tradingsymbol,
        quantity: h.quantity,
        average_price: h.average_price,
        last_traded_price: h.last_price,
        current_value: h.quantity * h.last_price,
        day_change: Decimal::ZERO,
        day_change_percent: Decimal::ZERO,
        total_pnl: h.pnl,
        platform: BROKER,
        holding_type: HoldingType::MutualFund,
        last_updated: now,
    }
}

fn map_position(p: KitePosition, now: DateTime<Utc>) -> Holding {
    Holding {
        item_name: p.tradingsymbol,
        isin: String::new(),
        quantity: p.quantity,
        average_price: p.average_price,
        last_traded_price: p.last_price,
        current_value: p.quantity * p.last_price,
        day_change: p.m2m,
        day_change_percent: Decimal::ZERO,
        total_pnl: p.pnl,
        platform: BROKER,
        holding_type: HoldingType::Stock,
        last_updated: now,
    }
}

fn unwrap_envelope<T>(operation: &str, status: reqwest::StatusCode, body: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let envelope: KiteEnvelope<T> = serde_json::from_str(body).map_err(|e| {
        BrokerError::upstream(
            BROKER,
            operation,
            format!("HTTP {} - unreadable response: {}", status, e),
        )
    })?;

    if !status.is_success() || envelope.status != "success" {
        let kind = envelope.error_type.unwrap_or_else(|| status.to_string());
        let message = envelope.message.unwrap_or_default();
        return Err(BrokerError::upstream(BROKER, operation, format!("{}: {}", kind, message)).into());
    }

    envelope
        .data
        .ok_or_else(|| BrokerError::upstream(BROKER, operation, "response carried no data").into())
}

// ============================================================================
// ZerodhaClient
// ============================================================================

pub struct ZerodhaClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
}

impl ZerodhaClient {
    pub fn new(api_key: &str, api_secret: &str) -> Self {
        Self::with_http(http_client(), api_key, api_secret)
    }

    /// Builds a client on a shared HTTP connection pool.
    pub fn with_http(http: Client, api_key: &str, api_secret: &str) -> Self {
        Self {
            http,
            base_url: KITE_API_URL.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            access_token: None,
            refresh_token: None,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// `sha256(api_key + token + api_secret)`, used to sign session calls.
    pub fn checksum(&self, token: &str) -> String {
        sha256_hex(&[&self.api_key, token, &self.api_secret])
    }

    fn auth_headers(&self, operation: &str) -> Result<HeaderMap> {
        let access_token = self.access_token.as_deref().ok_or_else(|| {
            Error::from(BrokerError::upstream(BROKER, operation, "no access token"))
        })?;
        let mut headers = HeaderMap::new();
        headers.insert("X-Kite-Version", HeaderValue::from_static(KITE_VERSION));
        let auth = HeaderValue::from_str(&format!("token {}:{}", self.api_key, access_token))
            .map_err(|e| BrokerError::upstream(BROKER, operation, format!("invalid token: {}", e)))?;
        headers.insert(AUTHORIZATION, auth);
        Ok(headers)
    }

    async fn execute<T: DeserializeOwned>(&self, operation: &str, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| request_error(BROKER, operation, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| request_error(BROKER, operation, e))?;
        unwrap_envelope(operation, status, &body)
    }

    async fn get<T: DeserializeOwned>(&self, operation: &str, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("[Kite] GET {}", path);
        let request = self.http.get(&url).headers(self.auth_headers(operation)?);
        self.execute(operation, request).await
    }

    async fn post_session(&self, operation: &str, path: &str, form: &[(&str, &str)]) -> Result<SessionData> {
        let url = format!("{}{}", self.base_url, path);
        debug!("[Kite] POST {}", path);
        let request = self
            .http
            .post(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .form(form);
        self.execute(operation, request).await
    }

    fn store_session(&mut self, session: SessionData) -> TokenGrant {
        let refresh_token = session.refresh_token.filter(|t| !t.is_empty());
        self.access_token = Some(session.access_token.clone());
        if refresh_token.is_some() {
            self.refresh_token = refresh_token.clone();
        }
        TokenGrant {
            access_token: session.access_token,
            refresh_token,
        }
    }
}

#[async_trait]
impl BrokerClient for ZerodhaClient {
    fn broker_type(&self) -> BrokerType {
        BROKER
    }

    fn login_url(&self) -> String {
        format!(
            "{}?v={}&api_key={}",
            KITE_LOGIN_URL,
            KITE_VERSION,
            urlencoding::encode(&self.api_key)
        )
    }

    async fn login(&mut self, request_token: &str) -> Result<TokenGrant> {
        let checksum = self.checksum(request_token);
        let session = self
            .post_session(
                "login",
                "/session/token",
                &[
                    ("api_key", self.api_key.as_str()),
                    ("request_token", request_token),
                    ("checksum", checksum.as_str()),
                ],
            )
            .await
            .map_err(|e| BrokerError::authentication(BROKER, e.to_string()))?;
        Ok(self.store_session(session))
    }

    fn can_auto_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty()) && !self.api_secret.is_empty()
    }

    async fn refresh_token(&mut self) -> Result<TokenGrant> {
        let refresh_token = self
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BrokerError::refresh(BROKER, "no refresh token"))?;
        let checksum = self.checksum(&refresh_token);
        let session = self
            .post_session(
                "refresh",
                "/session/refresh_token",
                &[
                    ("api_key", self.api_key.as_str()),
                    ("refresh_token", refresh_token.as_str()),
                    ("checksum", checksum.as_str()),
                ],
            )
            .await
            .map_err(|e| BrokerError::refresh(BROKER, e.to_string()))?;
        Ok(self.store_session(session))
    }

    fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    fn set_access_token(&mut self, access_token: String) {
        self.access_token = Some(access_token);
    }

    fn set_refresh_token(&mut self, refresh_token: Option<String>) {
        self.refresh_token = refresh_token;
    }

    async fn get_holdings(&self) -> Result<Vec<Holding>> {
        let now = Utc::now();
        let equities: Vec<KiteHolding> = self.get("holdings", "/portfolio/holdings").await?;
        let mut holdings: Vec<Holding> = equities.into_iter().map(|h| map_holding(h, now)).collect();

        match self.get::<Vec<KiteMfHolding>>("mf holdings", "/mf/holdings").await {
            Ok(funds) => holdings.extend(funds.into_iter().map(|h| map_mf_holding(h, now))),
            Err(e) => warn!("Kite mutual fund holdings unavailable: {}", e),
        }
        Ok(holdings)
    }

    async fn get_positions(&self) -> Result<Vec<Holding>> {
        let now = Utc::now();
        let positions: KitePositions = self.get("positions", "/portfolio/positions").await?;
        Ok(positions.net.into_iter().map(|p| map_position(p, now)).collect())
    }
}
