//! Helpers shared by the broker clients.

use std::str::FromStr;
use std::time::Duration;

use finsight_core::brokers::BrokerError;
use finsight_core::{BrokerType, Error};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};

/// Default timeout for broker API requests.
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub(crate) fn http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Lowercase hex SHA-256 of the concatenated parts.
pub fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub(crate) fn request_error(broker: BrokerType, operation: &str, err: reqwest::Error) -> Error {
    let reason = if err.is_timeout() {
        "request timed out".to_string()
    } else {
        format!("request failed: {}", err)
    };
    BrokerError::upstream(broker, operation, reason).into()
}

/// Deserializes a decimal sent as a JSON number, a numeric string, or null.
///
/// Missing, null, and blank values become zero.
pub(crate) fn lenient_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(Decimal::ZERO),
        Some(serde_json::Value::Number(n)) => parse_decimal(&n.to_string()).map_err(D::Error::custom),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(Decimal::ZERO),
        Some(serde_json::Value::String(s)) => parse_decimal(s.trim()).map_err(D::Error::custom),
        Some(other) => Err(D::Error::custom(format!("expected a number, got {}", other))),
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, rust_decimal::Error> {
    Decimal::from_str(raw).or_else(|_| Decimal::from_scientific(raw))
}
