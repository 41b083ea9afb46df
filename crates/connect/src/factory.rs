use finsight_core::brokers::{BrokerClient, BrokerClientFactory};
use finsight_core::BrokerType;
use reqwest::Client;

use crate::common::http_client;
use crate::icici_direct::IciciDirectClient;
use crate::zerodha::ZerodhaClient;

/// Builds the REST client for each supported broker.
///
/// All clients share one HTTP connection pool.
#[derive(Clone)]
pub struct DefaultBrokerClientFactory {
    http: Client,
}

impl DefaultBrokerClientFactory {
    pub fn new() -> Self {
        Self::with_http(http_client())
    }

    pub fn with_http(http: Client) -> Self {
        Self { http }
    }
}

impl Default for DefaultBrokerClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClientFactory for DefaultBrokerClientFactory {
    fn create(
        &self,
        broker_type: BrokerType,
        api_key: &str,
        api_secret: &str,
    ) -> Box<dyn BrokerClient> {
        match broker_type {
            BrokerType::Zerodha => Box::new(ZerodhaClient::with_http(
                self.http.clone(),
                api_key,
                api_secret,
            )),
            BrokerType::IciciDirect => Box::new(IciciDirectClient::with_http(
                self.http.clone(),
                api_key,
                api_secret,
            )),
        }
    }
}
