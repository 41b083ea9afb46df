//! ICICI Direct Breeze Connect client.
//!
//! Breeze exchanges the API session obtained from the browser login for a
//! session token via `customerdetails`. Every other call is signed with
//! `X-Checksum: token sha256(timestamp + body + secret)`.
//!
//! API documentation: https://api.icicidirect.com/breezeapi/documents/index.html

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use finsight_core::brokers::{BrokerClient, BrokerError, TokenGrant};
use finsight_core::errors::Result;
use finsight_core::{BrokerType, Holding, HoldingType};
use log::debug;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::common::{http_client, lenient_decimal, request_error, sha256_hex};

pub const BREEZE_API_URL: &str = "https://api.icicidirect.com/breezeapi/api/v1";
pub const BREEZE_LOGIN_URL: &str = "https://api.icicidirect.com/apiuser/login";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.000Z";
const BROKER: BrokerType = BrokerType::IciciDirect;

// ============================================================================
// API Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct BreezeEnvelope<T> {
    #[serde(rename = "Success")]
    success: Option<T>,
    #[serde(rename = "Status")]
    status: Option<i64>,
    #[serde(rename = "Error")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CustomerDetails {
    session_token: String,
}

#[derive(Debug, Deserialize)]
struct BreezeHolding {
    stock_code: String,
    #[serde(default, alias = "stock_ISIN")]
    isin: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    quantity: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    average_price: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    current_market_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct BreezePosition {
    stock_code: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    quantity: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    average_price: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    ltp: Decimal,
}

// ============================================================================
// Normalization
// ============================================================================

fn map_holding(h: BreezeHolding, now: DateTime<Utc>) -> Holding {
    let current_value = h.quantity * h.current_market_price;
    Holding {
        item_name: h.stock_code,
        isin: h.isin.unwrap_or_default(),
        quantity: h.quantity,
        average_price: h.average_price,
        last_traded_price: h.current_market_price,
        current_value,
        day_change: Decimal::ZERO,
        day_change_percent: Decimal::ZERO,
        total_pnl: current_value - h.quantity * h.average_price,
        platform: BROKER,
        holding_type: HoldingType::Stock,
        last_updated: now,
    }
}

fn map_position(p: BreezePosition, now: DateTime<Utc>) -> Holding {
    Holding {
        item_name: p.stock_code,
        isin: String::new(),
        quantity: p.quantity,
        average_price: p.average_price,
        last_traded_price: p.ltp,
        current_value: p.quantity * p.ltp,
        day_change: Decimal::ZERO,
        day_change_percent: Decimal::ZERO,
        total_pnl: (p.ltp - p.average_price) * p.quantity,
        platform: BROKER,
        holding_type: HoldingType::Stock,
        last_updated: now,
    }
}

fn unwrap_envelope<T>(operation: &str, status: reqwest::StatusCode, body: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let envelope: BreezeEnvelope<T> = serde_json::from_str(body).map_err(|e| {
        BrokerError::upstream(
            BROKER,
            operation,
            format!("HTTP {} - unreadable response: {}", status, e),
        )
    })?;

    if let Some(error) = envelope.error.filter(|e| !e.is_empty()) {
        return Err(BrokerError::upstream(BROKER, operation, error).into());
    }
    let ok_status = envelope.status.map_or(true, |s| s == 200);
    if !status.is_success() || !ok_status {
        let code = envelope.status.unwrap_or_else(|| i64::from(status.as_u16()));
        return Err(BrokerError::upstream(BROKER, operation, format!("status {}", code)).into());
    }

    envelope
        .success
        .ok_or_else(|| BrokerError::upstream(BROKER, operation, "response carried no data").into())
}

/// `token sha256(timestamp + body + secret)`.
pub fn request_checksum(timestamp: &str, body: &str, api_secret: &str) -> String {
    format!("token {}", sha256_hex(&[timestamp, body, api_secret]))
}

// ============================================================================
// IciciDirectClient
// ============================================================================

pub struct IciciDirectClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    session_token: Option<String>,
    /// API session from the browser login; exchanged again on refresh.
    api_session: Option<String>,
}

impl IciciDirectClient {
    pub fn new(api_key: &str, api_secret: &str) -> Self {
        Self::with_http(http_client(), api_key, api_secret)
    }

    pub fn with_http(http: Client, api_key: &str, api_secret: &str) -> Self {
        Self {
            http,
            base_url: BREEZE_API_URL.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            session_token: None,
            api_session: None,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
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

    /// Exchanges an API session for a session token.
    async fn customer_details(&self, operation: &str, api_session: &str) -> Result<CustomerDetails> {
        let body = json!({
            "SessionToken": api_session,
            "AppKey": self.api_key,
        });
        debug!("[Breeze] GET customerdetails");
        let request = self
            .http
            .get(self.url("customerdetails"))
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string());
        self.execute(operation, request).await
    }

    /// Signed call used for everything after the session exchange.
    async fn signed_get<T: DeserializeOwned>(
        &self,
        operation: &str,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let session_token = self.session_token.as_deref().ok_or_else(|| {
            BrokerError::upstream(BROKER, operation, "no session token")
        })?;
        let payload = body.to_string();
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let checksum = request_checksum(&timestamp, &payload, &self.api_secret);

        debug!("[Breeze] GET {}", endpoint);
        let request = self
            .http
            .get(self.url(endpoint))
            .header(CONTENT_TYPE, "application/json")
            .header("X-Checksum", checksum)
            .header("X-Timestamp", timestamp)
            .header("X-AppKey", self.api_key.as_str())
            .header("X-SessionToken", session_token)
            .body(payload);
        self.execute(operation, request).await
    }
}

#[async_trait]
impl BrokerClient for IciciDirectClient {
    fn broker_type(&self) -> BrokerType {
        BROKER
    }

    fn login_url(&self) -> String {
        format!(
            "{}?api_key={}",
            BREEZE_LOGIN_URL,
            urlencoding::encode(&self.api_key)
        )
    }

    async fn login(&mut self, request_token: &str) -> Result<TokenGrant> {
        if request_token.is_empty() || self.api_secret.is_empty() {
            return Err(BrokerError::authentication(BROKER, "missing api session or api secret").into());
        }
        let details = self
            .customer_details("login", request_token)
            .await
            .map_err(|e| BrokerError::authentication(BROKER, e.to_string()))?;

        self.session_token = Some(details.session_token.clone());
        self.api_session = Some(request_token.to_string());
        Ok(TokenGrant {
            access_token: details.session_token,
            refresh_token: Some(request_token.to_string()),
        })
    }

    fn can_auto_refresh(&self) -> bool {
        self.api_session.as_deref().is_some_and(|s| !s.is_empty()) && !self.api_secret.is_empty()
    }

    async fn refresh_token(&mut self) -> Result<TokenGrant> {
        if !self.can_auto_refresh() {
            return Err(BrokerError::refresh(BROKER, "missing api session or api secret").into());
        }
        let api_session = self.api_session.clone().unwrap_or_default();
        let details = self
            .customer_details("refresh", &api_session)
            .await
            .map_err(|e| BrokerError::refresh(BROKER, e.to_string()))?;

        self.session_token = Some(details.session_token.clone());
        Ok(TokenGrant {
            access_token: details.session_token,
            refresh_token: None,
        })
    }

    fn access_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    fn set_access_token(&mut self, access_token: String) {
        self.session_token = Some(access_token);
    }

    fn set_refresh_token(&mut self, refresh_token: Option<String>) {
        self.api_session = refresh_token;
    }

    async fn get_holdings(&self) -> Result<Vec<Holding>> {
        let body = json!({
            "exchange_code": "NSE",
            "from_date": "",
            "to_date": "",
            "stock_code": "",
            "portfolio_type": "",
        });
        let rows: Vec<BreezeHolding> = self
            .signed_get("holdings", "portfolioholdings", body)
            .await?;
        let now = Utc::now();
        Ok(rows.into_iter().map(|h| map_holding(h, now)).collect())
    }

    async fn get_positions(&self) -> Result<Vec<Holding>> {
        let rows: Vec<BreezePosition> = self
            .signed_get("positions", "portfoliopositions", json!({}))
            .await?;
        let now = Utc::now();
        Ok(rows.into_iter().map(|p| map_position(p, now)).collect())
    }
}
