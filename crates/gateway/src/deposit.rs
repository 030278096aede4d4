//! Deposit address issuance.
//!
//! A deposit request that names neither a deposit method nor an existing
//! deposit is answered by asking the payment processor for a fresh address
//! that forwards to the broker's cold wallet. The request is then completed
//! with `InputAddress`, `Destination` and `Secret` and forwarded to the
//! engine like any other message.

use crate::protocol::{ErrorReply, RawMessage};
use async_trait::async_trait;
use external_services::{CreateAddressRequest, IssuedAddress, PaymentProcessorClient};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Wallet type holding deposits.
const COLD_WALLET: &str = "cold";

/// Issues forwarding addresses.
#[async_trait]
pub trait AddressIssuer: Send + Sync {
    async fn create_address(
        &self,
        request: &CreateAddressRequest,
    ) -> external_services::Result<IssuedAddress>;
}

#[async_trait]
impl AddressIssuer for PaymentProcessorClient {
    async fn create_address(
        &self,
        request: &CreateAddressRequest,
    ) -> external_services::Result<IssuedAddress> {
        PaymentProcessorClient::create_address(self, request).await
    }
}

#[derive(Debug, Error)]
pub enum DepositError {
    #[error("no {0} cold wallet is known for this session")]
    WalletUnavailable(String),

    #[error("payment processor unreachable: {0}")]
    Unreachable(String),

    #[error("payment processor request timed out after {0:?}")]
    TimedOut(Duration),

    #[error("payment processor failed: {0}")]
    Failed(String),

    #[error("session closed while waiting for a deposit address")]
    Cancelled,
}

impl DepositError {
    /// ERROR reply for the client, tied to the deposit request id.
    pub fn reply(&self, req_id: Value) -> ErrorReply {
        let description = match self {
            DepositError::Unreachable(_) | DepositError::TimedOut(_) => {
                "Blockchain.info is not available at this moment, please try again within few minutes"
            }
            DepositError::Failed(_) => "Error retrieving a new deposit address from Blockchain.info",
            DepositError::WalletUnavailable(_) => "No deposit wallet available for this currency",
            DepositError::Cancelled => "Deposit request cancelled",
        };
        ErrorReply {
            req_id: Some(req_id),
            description: description.to_string(),
            detail: self.to_string(),
        }
    }
}

/// Address and secret for one deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositGrant {
    pub input_address: String,
    pub destination: String,
    pub secret: String,
}

impl DepositGrant {
    /// Complete the client's deposit request before forwarding.
    pub fn apply(&self, message: &mut RawMessage) {
        message.set("InputAddress", self.input_address.clone());
        message.set("Destination", self.destination.clone());
        message.set("Secret", self.secret.clone());
    }
}

/// Cold wallet address for `currency` from the cached login response.
///
/// The path is `Broker.CryptoCurrencies[CurrencyCode == currency]
/// .Wallets[type == "cold"].address`.
pub fn resolve_cold_wallet(user_response: Option<&RawMessage>, currency: &str) -> Option<String> {
    user_response?
        .get("Broker")?
        .get("CryptoCurrencies")?
        .as_array()?
        .iter()
        .filter(|c| c.get("CurrencyCode").and_then(Value::as_str) == Some(currency))
        .flat_map(|c| c.get("Wallets").and_then(Value::as_array).into_iter().flatten())
        .find(|w| w.get("type").and_then(Value::as_str) == Some(COLD_WALLET))
        .and_then(|w| w.get("address").and_then(Value::as_str))
        .map(str::to_string)
}

/// Fresh per-deposit secret.
pub fn new_secret() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Ask `issuer` for an address forwarding to `cold_wallet`.
///
/// Gives up after `timeout`, or as soon as `cancelled` resolves.
pub async fn issue_address(
    issuer: &dyn AddressIssuer,
    callback_base: &str,
    timeout: Duration,
    cold_wallet: &str,
    currency: &str,
    cancelled: impl Future<Output = ()>,
) -> Result<DepositGrant, DepositError> {
    let secret = new_secret();
    let request = CreateAddressRequest {
        cold_wallet: cold_wallet.to_string(),
        callback_url: format!("{}{}", callback_base, secret),
        currency: currency.to_string(),
    };
    debug!("Requesting {} deposit address forwarding to {}", currency, cold_wallet);

    let issued = tokio::select! {
        result = tokio::time::timeout(timeout, issuer.create_address(&request)) => match result {
            Err(_) => return Err(DepositError::TimedOut(timeout)),
            Ok(Err(e)) if e.is_unreachable() => {
                warn!("Payment processor unreachable: {}", e);
                return Err(DepositError::Unreachable(e.to_string()));
            }
            Ok(Err(e)) => {
                warn!("Payment processor error: {}", e);
                return Err(DepositError::Failed(e.to_string()));
            }
            Ok(Ok(issued)) => issued,
        },
        _ = cancelled => return Err(DepositError::Cancelled),
    };

    Ok(DepositGrant {
        input_address: issued.input_address,
        destination: issued.destination,
        secret,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{login_response, FakeIssuer};
    use serde_json::json;

    #[test]
    fn test_resolve_cold_wallet() {
        let login = login_response("BTC", "1ColdWallet");
        assert_eq!(resolve_cold_wallet(Some(&login), "BTC").as_deref(), Some("1ColdWallet"));
        assert_eq!(resolve_cold_wallet(Some(&login), "LTC"), None);
        assert_eq!(resolve_cold_wallet(None, "BTC"), None);

        let hot_only = RawMessage::from_value(json!({
            "MsgType": "BF",
            "Broker": {"CryptoCurrencies": [
                {"CurrencyCode": "BTC", "Wallets": [{"type": "hot", "address": "1Hot"}]}
            ]}
        }))
        .unwrap();
        assert_eq!(resolve_cold_wallet(Some(&hot_only), "BTC"), None);
    }

    #[test]
    fn test_secrets_are_distinct() {
        let a = new_secret();
        let b = new_secret();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn test_issue_address_builds_callback_from_secret() {
        let issuer = FakeIssuer::ok("1Input");
        let grant = issue_address(
            issuer.as_ref(),
            "https://example.com/cb/",
            Duration::from_secs(1),
            "1Cold",
            "BTC",
            std::future::pending(),
        )
        .await
        .unwrap();

        assert_eq!(grant.input_address, "1Input");
        assert_eq!(grant.destination, "1Cold");
        let requests = issuer.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].callback_url, format!("https://example.com/cb/{}", grant.secret));
        assert_eq!(requests[0].cold_wallet, "1Cold");
    }

    #[tokio::test]
    async fn test_issue_address_error_kinds() {
        let unreachable = FakeIssuer::unreachable();
        let err = issue_address(unreachable.as_ref(), "cb/", Duration::from_secs(1), "1Cold", "BTC", std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, DepositError::Unreachable(_)));

        let failing = FakeIssuer::failing();
        let err = issue_address(failing.as_ref(), "cb/", Duration::from_secs(1), "1Cold", "BTC", std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, DepositError::Failed(_)));
        assert_ne!(
            DepositError::Unreachable(String::new()).reply(json!(1)).description,
            err.reply(json!(1)).description
        );
    }

    #[tokio::test]
    async fn test_issue_address_times_out_and_cancels() {
        let slow = FakeIssuer::stalled();
        let err = issue_address(slow.as_ref(), "cb/", Duration::from_millis(20), "1Cold", "BTC", std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, DepositError::TimedOut(_)));

        let err = issue_address(slow.as_ref(), "cb/", Duration::from_secs(60), "1Cold", "BTC", async {})
            .await
            .unwrap_err();
        assert!(matches!(err, DepositError::Cancelled));
    }

    #[test]
    fn test_grant_applies_fields() {
        let mut msg = RawMessage::parse(r#"{"MsgType":"U18","DepositReqID":9,"Currency":"BTC"}"#).unwrap();
        DepositGrant {
            input_address: "1In".to_string(),
            destination: "1Cold".to_string(),
            secret: "s".to_string(),
        }
        .apply(&mut msg);
        assert_eq!(msg.get_str("InputAddress"), Some("1In"));
        assert_eq!(msg.get_str("Destination"), Some("1Cold"));
        assert_eq!(msg.get_str("Secret"), Some("s"));
        assert_eq!(msg.get("DepositReqID"), Some(&json!(9)));
    }
}
