//! Request/reply channel to the trading engine.
//!
//! Each client session owns one [`BackendChannel`]; the server owns one more
//! (the application channel) for security lists, trade backfill and
//! keep-alives. Channels come from a [`BackendConnector`], which also
//! provides the per-instrument market data feeds.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use external_services::trade::CREATED_FORMAT;
use external_services::Trade;
use futures::StreamExt;
use nats_client::NatsClient;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Engine reply that ends the connection.
pub const MSG_CLOSE: &str = "CLOSE";

/// Callback for unsolicited engine messages.
pub type PushCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Error establishing connection with trade: {0}")]
    Connect(String),

    #[error("Trading engine unavailable: {0}")]
    Unavailable(String),

    #[error("Not connected to the trading engine")]
    NotConnected,

    #[error("Invalid reply from trading engine: {0}")]
    InvalidReply(String),
}

impl BackendError {
    /// Client-facing description.
    pub fn description(&self) -> &'static str {
        match self {
            BackendError::Connect(_) => "Error establishing connection with trade",
            BackendError::Unavailable(_)
            | BackendError::NotConnected
            | BackendError::InvalidReply(_) => "Invalid message",
        }
    }
}

/// One logical connection to the engine.
#[async_trait]
pub trait BackendChannel: Send {
    /// Open the connection and return the engine-assigned connection id.
    async fn connect(&mut self) -> Result<String, BackendError>;

    /// Send one message and wait for the reply, if any. After a call the
    /// channel may report itself disconnected.
    async fn send_message(&mut self, message: &str) -> Result<Option<String>, BackendError>;

    fn is_connected(&self) -> bool;

    fn connection_id(&self) -> Option<&str>;

    /// Close the connection. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Create an unconnected channel. `on_push` receives engine-initiated
    /// messages for this connection.
    fn open_channel(&self, on_push: Option<PushCallback>) -> Box<dyn BackendChannel>;

    /// Start delivering the instrument's market data events to `on_event`.
    async fn subscribe_market_data(
        &self,
        symbol: &str,
        on_event: PushCallback,
    ) -> Result<(), BackendError>;
}

// ============================================================================
// Engine calls made by the server
// ============================================================================

/// Instruments and currencies offered by the engine.
#[derive(Debug, Clone, Default)]
pub struct SecurityList {
    pub symbols: Vec<String>,
    pub currencies: Vec<Value>,
}

async fn call_json(
    channel: &mut dyn BackendChannel,
    request: Value,
) -> Result<Value, BackendError> {
    let reply = channel
        .send_message(&request.to_string())
        .await?
        .ok_or_else(|| BackendError::InvalidReply("empty reply".to_string()))?;
    serde_json::from_str(&reply).map_err(|e| BackendError::InvalidReply(e.to_string()))
}

pub async fn request_security_list(
    channel: &mut dyn BackendChannel,
) -> Result<SecurityList, BackendError> {
    let reply = call_json(
        channel,
        json!({"MsgType": "x", "SecurityReqID": "x", "SecurityListRequestType": 0}),
    )
    .await?;

    let instruments = reply
        .get("Instruments")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::InvalidReply("security list without Instruments".to_string()))?;
    let symbols = instruments
        .iter()
        .filter_map(|i| i.get("Symbol").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    let currencies = reply
        .get("Currencies")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(SecurityList { symbols, currencies })
}

/// Trades with an id above `last_trade_id`, oldest first.
pub async fn request_trades_since(
    channel: &mut dyn BackendChannel,
    last_trade_id: i64,
) -> Result<Vec<Trade>, BackendError> {
    let reply = call_json(channel, json!({"MsgType": "U34", "TradeID": last_trade_id})).await?;
    let rows = reply
        .get("Trades")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::InvalidReply("last trades reply without Trades".to_string()))?;
    let mut trades = rows.iter().map(parse_trade_row).collect::<Result<Vec<_>, _>>()?;
    trades.sort_by_key(|t| t.id);
    Ok(trades)
}

pub async fn send_keepalive(channel: &mut dyn BackendChannel) -> Result<(), BackendError> {
    channel
        .send_message(&json!({"MsgType": "1", "TestReqID": "0"}).to_string())
        .await
        .map(|_| ())
}

/// Parse one engine trade row:
/// `[id, symbol, side, price, size, buyer, seller, created, order_id, counter_order_id]`.
pub fn parse_trade_row(row: &Value) -> Result<Trade, BackendError> {
    let invalid = |what: &str| BackendError::InvalidReply(format!("trade row {}: {}", what, row));
    let cols = row.as_array().filter(|c| c.len() >= 10).ok_or_else(|| invalid("too short"))?;

    let int = |i: usize| -> Result<i64, BackendError> {
        match &cols[i] {
            Value::Number(n) => n.as_i64().ok_or_else(|| invalid("non-integer column")),
            Value::String(s) => s.parse().map_err(|_| invalid("non-integer column")),
            _ => Err(invalid("non-integer column")),
        }
    };
    let text = |i: usize| -> Result<String, BackendError> {
        match &cols[i] {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(invalid("non-text column")),
        }
    };

    let created = NaiveDateTime::parse_from_str(&text(7)?, CREATED_FORMAT)
        .map_err(|_| invalid("bad timestamp"))?;
    Ok(Trade {
        id: int(0)?,
        symbol: text(1)?,
        side: text(2)?,
        price: int(3)?,
        size: int(4)?,
        buyer_username: text(5)?,
        seller_username: text(6)?,
        created,
        order_id: int(8)?,
        counter_order_id: int(9)?,
    })
}

fn reply_msg_type(reply: &str) -> Option<String> {
    serde_json::from_str::<Value>(reply)
        .ok()?
        .get("MsgType")?
        .as_str()
        .map(str::to_string)
}

// ============================================================================
// NATS transport
// ============================================================================

/// Engine reachable over NATS request/reply.
///
/// Subjects:
/// - `<request>.open` opens a connection and replies `{"ConnectionID": ..}`
/// - `<request>.<id>` carries session calls
/// - `<request>.<id>.close` closes the connection
/// - `<publish>.session.<id>` pushes engine-initiated messages
/// - `<publish>.md.<symbol>` carries market data events
pub struct NatsBackend {
    nats: NatsClient,
    request_subject: String,
    publish_subject: String,
}

impl NatsBackend {
    pub fn new(
        nats: NatsClient,
        request_subject: impl Into<String>,
        publish_subject: impl Into<String>,
    ) -> Self {
        Self {
            nats,
            request_subject: request_subject.into(),
            publish_subject: publish_subject.into(),
        }
    }
}

fn spawn_forwarder(
    mut subscriber: async_nats::Subscriber,
    subject: String,
    callback: PushCallback,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = subscriber.next().await {
            match String::from_utf8(msg.payload.to_vec()) {
                Ok(text) => callback(text),
                Err(e) => warn!("Dropping non UTF-8 message on {}: {}", subject, e),
            }
        }
        debug!("Subscription {} ended", subject);
    })
}

#[async_trait]
impl BackendConnector for NatsBackend {
    fn open_channel(&self, on_push: Option<PushCallback>) -> Box<dyn BackendChannel> {
        Box::new(NatsChannel {
            nats: self.nats.clone(),
            request_subject: self.request_subject.clone(),
            publish_subject: self.publish_subject.clone(),
            on_push,
            connection_id: None,
            connected: false,
            push_task: None,
        })
    }

    async fn subscribe_market_data(
        &self,
        symbol: &str,
        on_event: PushCallback,
    ) -> Result<(), BackendError> {
        let subject = format!("{}.md.{}", self.publish_subject, symbol);
        let subscriber = self
            .nats
            .subscribe(&subject)
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        info!("Subscribed to market data on {}", subject);
        spawn_forwarder(subscriber, subject, on_event);
        Ok(())
    }
}

struct NatsChannel {
    nats: NatsClient,
    request_subject: String,
    publish_subject: String,
    on_push: Option<PushCallback>,
    connection_id: Option<String>,
    connected: bool,
    push_task: Option<JoinHandle<()>>,
}

#[async_trait]
impl BackendChannel for NatsChannel {
    async fn connect(&mut self) -> Result<String, BackendError> {
        let reply = self
            .nats
            .request(&format!("{}.open", self.request_subject), Bytes::from_static(b"{}"))
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        let value: Value =
            serde_json::from_slice(&reply).map_err(|e| BackendError::Connect(e.to_string()))?;
        let id = match value.get("ConnectionID") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(BackendError::Connect("reply without ConnectionID".to_string())),
        };

        if let Some(callback) = self.on_push.clone() {
            let subject = format!("{}.session.{}", self.publish_subject, id);
            let subscriber = self
                .nats
                .subscribe(&subject)
                .await
                .map_err(|e| BackendError::Connect(e.to_string()))?;
            self.push_task = Some(spawn_forwarder(subscriber, subject, callback));
        }

        debug!("Opened engine connection {}", id);
        self.connection_id = Some(id.clone());
        self.connected = true;
        Ok(id)
    }

    async fn send_message(&mut self, message: &str) -> Result<Option<String>, BackendError> {
        let Some(id) = self.connection_id.as_deref().filter(|_| self.connected) else {
            return Err(BackendError::NotConnected);
        };
        let subject = format!("{}.{}", self.request_subject, id);
        let reply = match self.nats.request(&subject, Bytes::from(message.to_string())).await {
            Ok(reply) => reply,
            Err(e) => {
                self.connected = false;
                return Err(BackendError::Unavailable(e.to_string()));
            }
        };
        let (text, closed) = decode_reply(&reply)?;
        if closed {
            info!("Engine closed connection {}", id);
            self.connected = false;
        }
        Ok(text)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    async fn close(&mut self) {
        if let Some(task) = self.push_task.take() {
            task.abort();
        }
        if !self.connected {
            return;
        }
        self.connected = false;
        if let Some(id) = &self.connection_id {
            let subject = format!("{}.{}.close", self.request_subject, id);
            if let Err(e) = self.nats.publish_fast(&subject, Bytes::new()).await {
                warn!("Failed to close engine connection {}: {}", id, e);
            }
        }
    }
}

/// Decode a request reply. The flag is set when the engine closed the
/// connection; the CLOSE reply itself is still relayed.
fn decode_reply(reply: &[u8]) -> Result<(Option<String>, bool), BackendError> {
    if reply.is_empty() {
        return Ok((None, false));
    }
    let text = String::from_utf8(reply.to_vec()).map_err(|e| BackendError::InvalidReply(e.to_string()))?;
    let closed = reply_msg_type(&text).as_deref() == Some(MSG_CLOSE);
    Ok((Some(text), closed))
}

impl Drop for NatsChannel {
    fn drop(&mut self) {
        if let Some(task) = self.push_task.take() {
            task.abort();
        }
    }
}
