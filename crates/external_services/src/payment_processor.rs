//! Payment processor REST client.
//!
//! Asks the processor for a fresh receive address that forwards incoming
//! funds to a broker cold wallet and notifies a callback URL.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Parameters for one address issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAddressRequest {
    /// Cold wallet the issued address forwards to.
    pub cold_wallet: String,
    /// URL the processor calls when funds arrive.
    pub callback_url: String,
    pub currency: String,
}

/// Address pair returned by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssuedAddress {
    pub input_address: String,
    pub destination: String,
}

/// Payment processor REST client.
#[derive(Debug, Clone)]
pub struct PaymentProcessorClient {
    http: reqwest::Client,
    base_url: String,
}

impl PaymentProcessorClient {
    /// Create a client whose every request is bounded by `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Request a new receive address.
    pub async fn create_address(&self, req: &CreateAddressRequest) -> Result<IssuedAddress> {
        debug!(
            "Requesting {} receive address from {} for {}",
            req.currency, self.base_url, req.cold_wallet
        );

        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("method", "create"),
                ("address", req.cold_wallet.as_str()),
                ("callback", req.callback_url.as_str()),
                ("currency", req.currency.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let issued: IssuedAddress = response.json().await?;
        if issued.input_address.is_empty() {
            return Err(Error::InvalidResponse(
                "processor returned an empty input_address".to_string(),
            ));
        }

        Ok(issued)
    }
}
