//! WebSocket protocol message types.
//!
//! Frames are FIX-derived JSON objects keyed by `MsgType`. Inbound frames are
//! parsed once into an [`InboundFrame`]: the untouched field map (forwarded
//! verbatim to the engine when the gateway does not answer locally) plus a
//! typed [`Inbound`] kind used for dispatch.

use crate::error::{GatewayError, Result};
use crate::market_data::{EntryType, MarketDataFullRefresh, MarketDataIncremental, SecurityStatus};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Heartbeat.
pub const MSG_HEARTBEAT: &str = "0";
/// Test request.
pub const MSG_TEST_REQUEST: &str = "1";
/// Trade history request / response.
pub const MSG_TRADE_HISTORY_REQUEST: &str = "U32";
pub const MSG_TRADE_HISTORY_RESPONSE: &str = "U33";
/// Market data request.
pub const MSG_MARKET_DATA_REQUEST: &str = "V";
/// Security status request.
pub const MSG_SECURITY_STATUS_REQUEST: &str = "e";
/// Deposit request.
pub const MSG_DEPOSIT_REQUEST: &str = "U18";
/// User (login) request / response.
pub const MSG_USER_REQUEST: &str = "BE";
pub const MSG_USER_RESPONSE: &str = "BF";

/// Fields whose values never reach the audit log.
const PASSWORD_FIELDS: [&str; 2] = ["Password", "NewPassword"];

/// Columns of a trade history reply, in order.
pub const TRADE_HISTORY_COLUMNS: [&str; 8] = [
    "TradeID", "Market", "Side", "Price", "Size", "Buyer", "Seller", "Created",
];

pub const DEFAULT_PAGE_SIZE: u64 = 100;

// ============================================================================
// Raw messages
// ============================================================================

/// A parsed JSON protocol message with a string `MsgType`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    fields: Map<String, Value>,
}

impl RawMessage {
    /// Parse a text frame. Anything that is not a JSON object with a string
    /// `MsgType` is a protocol error.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| GatewayError::Protocol(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(GatewayError::Protocol("message is not a JSON object".to_string()));
        };
        match fields.get("MsgType") {
            Some(Value::String(_)) => Ok(Self { fields }),
            Some(_) => Err(GatewayError::Protocol("MsgType must be a string".to_string())),
            None => Err(GatewayError::Protocol("missing MsgType".to_string())),
        }
    }

    pub fn msg_type(&self) -> &str {
        self.fields
            .get("MsgType")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// True when the field is present and not null, false, zero, or empty.
    pub fn is_truthy(&self, key: &str) -> bool {
        match self.fields.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }

    /// Text for the audit log with password values masked.
    pub fn redacted(&self) -> String {
        if !PASSWORD_FIELDS.iter().any(|f| self.fields.contains_key(*f)) {
            return self.to_json();
        }
        let mut masked = self.fields.clone();
        for field in PASSWORD_FIELDS {
            if let Some(v) = masked.get_mut(field) {
                *v = Value::from("*");
            }
        }
        Value::Object(masked).to_string()
    }

    fn typed<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|e| GatewayError::Protocol(format!("{} ({})", e, self.msg_type())))
    }
}

// ============================================================================
// Client → Server
// ============================================================================

/// Client-supplied request id, echoed back with its original JSON type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Value);

impl RequestId {
    /// Map key for the id: strings as-is, anything else as its JSON text.
    pub fn key(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Subscription request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionRequestType {
    /// 0: one full refresh.
    Snapshot,
    /// 1: full refresh plus incremental updates.
    SnapshotAndUpdates,
    /// 2: cancel a previous snapshot+updates request.
    Cancel,
}

impl<'de> Deserialize<'de> for SubscriptionRequestType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match lenient_u64(deserializer)? {
            Some(0) => Ok(Self::Snapshot),
            Some(1) => Ok(Self::SnapshotAndUpdates),
            Some(2) => Ok(Self::Cancel),
            Some(other) => Err(de::Error::custom(format!(
                "invalid SubscriptionRequestType {}",
                other
            ))),
            None => Err(de::Error::custom("missing SubscriptionRequestType")),
        }
    }
}

/// Heartbeat or test request.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(rename = "TestReqID", default)]
    pub test_req_id: Value,
    #[serde(rename = "SendTime", default)]
    pub send_time: Value,
}

/// Trade history query.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeHistoryRequest {
    #[serde(rename = "TradeHistoryReqID", default)]
    pub req_id: RequestId,
    #[serde(rename = "Page", default, deserialize_with = "lenient_u64")]
    page: Option<u64>,
    #[serde(rename = "PageSize", default, deserialize_with = "lenient_u64")]
    page_size: Option<u64>,
    #[serde(rename = "Filter", default)]
    pub filter: Value,
}

impl TradeHistoryRequest {
    pub fn page(&self) -> u64 {
        self.page.unwrap_or(0)
    }

    pub fn page_size(&self) -> u64 {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

/// Market data subscription request.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataRequest {
    #[serde(rename = "MDReqID", default)]
    pub req_id: RequestId,
    #[serde(rename = "SubscriptionRequestType")]
    pub request_type: SubscriptionRequestType,
    #[serde(rename = "MarketDepth", default, deserialize_with = "lenient_u64")]
    market_depth: Option<u64>,
    #[serde(rename = "MDEntryTypes", default)]
    entry_types: Vec<EntryType>,
    #[serde(rename = "Instruments", default)]
    pub instruments: Vec<String>,
}

impl MarketDataRequest {
    /// Requested book depth; 0 means the full book.
    pub fn market_depth(&self) -> u64 {
        self.market_depth.unwrap_or(0)
    }

    /// Requested entry types; none requested means all of them.
    pub fn entry_types(&self) -> Vec<EntryType> {
        if self.entry_types.is_empty() {
            EntryType::ALL.to_vec()
        } else {
            self.entry_types.clone()
        }
    }
}

/// Security status subscription request.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityStatusRequest {
    #[serde(rename = "SecurityStatusReqID", default)]
    pub req_id: RequestId,
    #[serde(rename = "SubscriptionRequestType")]
    pub request_type: SubscriptionRequestType,
    #[serde(rename = "Instruments", default)]
    pub instruments: Vec<String>,
}

/// Deposit request that needs a freshly issued address.
#[derive(Debug, Clone, Deserialize)]
pub struct DepositAddressRequest {
    #[serde(rename = "DepositReqID", default)]
    pub req_id: Value,
    #[serde(rename = "Currency", default)]
    pub currency: Option<String>,
}

/// Kind of an inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    Heartbeat(HeartbeatRequest),
    TradeHistory(TradeHistoryRequest),
    MarketData(MarketDataRequest),
    SecurityStatus(SecurityStatusRequest),
    /// Deposit request carrying neither a deposit method nor a deposit id.
    DepositAddress(DepositAddressRequest),
    /// Everything else goes to the engine unchanged.
    Forward,
}

/// An inbound frame, parsed once at ingress.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub raw: RawMessage,
    pub kind: Inbound,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let raw = RawMessage::parse(text)?;
        let kind = match raw.msg_type() {
            MSG_TEST_REQUEST | MSG_HEARTBEAT => Inbound::Heartbeat(raw.typed()?),
            MSG_TRADE_HISTORY_REQUEST => Inbound::TradeHistory(raw.typed()?),
            MSG_MARKET_DATA_REQUEST => Inbound::MarketData(raw.typed()?),
            MSG_SECURITY_STATUS_REQUEST => Inbound::SecurityStatus(raw.typed()?),
            MSG_DEPOSIT_REQUEST
                if !raw.is_truthy("DepositMethodID") && !raw.is_truthy("DepositID") =>
            {
                Inbound::DepositAddress(raw.typed()?)
            }
            _ => Inbound::Forward,
        };
        Ok(Self { raw, kind })
    }
}

/// Accept a non-negative integer given as a JSON number or numeric string.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<u64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("expected a non-negative integer, got {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected a non-negative integer, got {:?}", s))),
        Some(other) => Err(de::Error::custom(format!(
            "expected a non-negative integer, got {}",
            other
        ))),
    }
}

// ============================================================================
// Server → Client
// ============================================================================

/// Message produced locally by the gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "MsgType")]
pub enum ServerMessage {
    /// Reply to a heartbeat or test request.
    #[serde(rename = "0")]
    Heartbeat(HeartbeatReply),
    /// One page of trade history.
    #[serde(rename = "U33")]
    TradeHistory(TradeHistoryReply),
    /// Market data full refresh.
    #[serde(rename = "W")]
    MarketDataFullRefresh(MarketDataFullRefresh),
    /// Market data incremental refresh.
    #[serde(rename = "X")]
    MarketDataIncremental(MarketDataIncremental),
    /// Security status.
    #[serde(rename = "f")]
    SecurityStatus(SecurityStatus),
    /// Failure.
    #[serde(rename = "ERROR")]
    Error(ErrorReply),
}

impl ServerMessage {
    pub fn error(description: impl Into<String>, detail: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorReply {
            req_id: None,
            description: description.into(),
            detail: detail.into(),
        })
    }

    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReply {
    #[serde(rename = "TestReqID")]
    pub test_req_id: Value,
    #[serde(rename = "SendTime", skip_serializing_if = "Option::is_none")]
    pub send_time: Option<Value>,
    /// Milliseconds since the epoch.
    #[serde(rename = "ServerTimestamp")]
    pub server_timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeHistoryReply {
    #[serde(rename = "TradeHistoryReqID")]
    pub req_id: RequestId,
    #[serde(rename = "Page")]
    pub page: u64,
    #[serde(rename = "PageSize")]
    pub page_size: u64,
    #[serde(rename = "Columns")]
    pub columns: Vec<&'static str>,
    #[serde(rename = "TradeHistoryGrp")]
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReply {
    #[serde(rename = "ReqID", skip_serializing_if = "Option::is_none")]
    pub req_id: Option<Value>,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Detail")]
    pub detail: String,
}
