//! Test doubles: an in-process engine, a scripted address issuer and an
//! in-memory audit sink.

use crate::audit::AuditLog;
use crate::backend::{BackendChannel, BackendConnector, BackendError, PushCallback};
use crate::client::Outbound;
use crate::config::GatewayConfig;
use crate::deposit::AddressIssuer;
use crate::protocol::RawMessage;
use crate::server::{GatewayContext, GatewayServer};
use async_trait::async_trait;
use chrono::NaiveDate;
use external_services::{
    CreateAddressRequest, IssuedAddress, MemoryTradeStore, Trade, TradeStore,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

pub fn trade(id: i64, symbol: &str) -> Trade {
    let created = NaiveDate::from_ymd_opt(2014, 1, 2)
        .and_then(|d| d.and_hms_opt(10, 0, (id % 60) as u32))
        .unwrap();
    Trade {
        id,
        symbol: symbol.to_string(),
        side: if id % 2 == 0 { "1" } else { "2" }.to_string(),
        price: 800_00000000 + id,
        size: 1_00000000,
        buyer_username: "alice".to_string(),
        seller_username: "bob".to_string(),
        created,
        order_id: id * 10,
        counter_order_id: id * 10 + 1,
    }
}

fn trade_row(trade: &Trade) -> Value {
    json!([
        trade.id,
        trade.symbol,
        trade.side,
        trade.price,
        trade.size,
        trade.buyer_username,
        trade.seller_username,
        trade.created.format(external_services::trade::CREATED_FORMAT).to_string(),
        trade.order_id,
        trade.counter_order_id,
    ])
}

/// Login response carrying one crypto currency with a cold wallet.
pub fn login_response(currency: &str, cold_wallet: &str) -> RawMessage {
    RawMessage::from_value(json!({
        "MsgType": "BF",
        "UserStatus": 1,
        "Broker": {"CryptoCurrencies": [{
            "CurrencyCode": currency,
            "Wallets": [
                {"type": "hot", "address": "1HotWallet"},
                {"type": "cold", "address": cold_wallet}
            ]
        }]}
    }))
    .unwrap()
}

/// Drain queued frames as JSON, ignoring the close marker.
pub fn frames(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Frame(text) = item {
            out.push(serde_json::from_str(&text).unwrap());
        }
    }
    out
}

pub fn test_config() -> GatewayConfig {
    let vars: HashMap<&str, &str> = [
        ("BACKEND_REQUEST_SUBJECT", "trade.req"),
        ("BACKEND_PUBLISH_SUBJECT", "trade.pub"),
        ("AUDIT_LOG_PATH", "/tmp/ws_gateway_test.log"),
        ("CALLBACK_URL", "https://example.com/deposit/"),
        ("HTTP_PORT", "8445"),
        ("STORAGE_URL", "memory://"),
    ]
    .into_iter()
    .collect();
    GatewayConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap()
}

// ============================================================================
// Audit sink
// ============================================================================

#[derive(Clone, Default)]
pub struct AuditBuffer(Arc<Mutex<Vec<u8>>>);

impl AuditBuffer {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for AuditBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Engine
// ============================================================================

pub enum FakeReply {
    Reply(Option<String>),
    /// Reply, then report the channel disconnected.
    Disconnect(Option<String>),
    Fail(String),
}

type Responder = Arc<dyn Fn(&str) -> FakeReply + Send + Sync>;

struct FakeState {
    symbols: Vec<String>,
    trades: Vec<Trade>,
    next_id: AtomicU64,
    forced_ids: Mutex<VecDeque<String>>,
    fail_connect: AtomicBool,
    fail_keepalives: AtomicBool,
    keepalives: AtomicUsize,
    closes: AtomicUsize,
    responder: Mutex<Responder>,
    sent: Mutex<Vec<String>>,
    feeds: Mutex<HashMap<String, PushCallback>>,
    on_subscribe: Mutex<HashMap<String, Vec<String>>>,
    pushes: Mutex<HashMap<String, PushCallback>>,
}

/// In-process engine.
pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    /// Engine listing BTCUSD and BTCBRL with no trades.
    pub fn new() -> Arc<Self> {
        Self::with_engine(&["BTCUSD", "BTCBRL"], Vec::new())
    }

    pub fn with_engine(symbols: &[&str], trades: Vec<Trade>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(FakeState {
                symbols: symbols.iter().map(|s| s.to_string()).collect(),
                trades,
                next_id: AtomicU64::new(1),
                forced_ids: Mutex::new(VecDeque::new()),
                fail_connect: AtomicBool::new(false),
                fail_keepalives: AtomicBool::new(false),
                keepalives: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                responder: Mutex::new(Arc::new(|_: &str| FakeReply::Reply(None))),
                sent: Mutex::new(Vec::new()),
                feeds: Mutex::new(HashMap::new()),
                on_subscribe: Mutex::new(HashMap::new()),
                pushes: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Answer session calls with `f`.
    pub fn respond_with(&self, f: impl Fn(&str) -> FakeReply + Send + Sync + 'static) {
        *self.state.responder.lock() = Arc::new(f);
    }

    pub fn fail_next_connect(&self) {
        self.state.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_keepalives(&self) {
        self.state.fail_keepalives.store(true, Ordering::SeqCst);
    }

    pub fn keepalive_count(&self) -> usize {
        self.state.keepalives.load(Ordering::SeqCst)
    }

    /// Id handed to the next connecting channel.
    pub fn next_connection_id(&self, id: &str) {
        self.state.forced_ids.lock().push_back(id.to_string());
    }

    /// Channels closed so far.
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Every message sent to the engine, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.sent.lock().clone()
    }

    /// Deliver `event` as soon as the instrument is subscribed.
    pub fn emit_on_subscribe(&self, symbol: &str, event: &str) {
        self.state
            .on_subscribe
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .push(event.to_string());
    }

    pub fn emit_market_data(&self, symbol: &str, event: &str) {
        let feed = self.state.feeds.lock().get(symbol).cloned();
        if let Some(feed) = feed {
            feed(event.to_string());
        }
    }

    /// Push an engine-initiated message to a connection.
    pub fn push(&self, connection_id: &str, message: &str) -> bool {
        let callback = self.state.pushes.lock().get(connection_id).cloned();
        match callback {
            Some(callback) => {
                callback(message.to_string());
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BackendConnector for FakeConnector {
    fn open_channel(&self, on_push: Option<PushCallback>) -> Box<dyn BackendChannel> {
        Box::new(FakeChannel {
            state: self.state.clone(),
            on_push,
            id: None,
            connected: false,
            closed: false,
        })
    }

    async fn subscribe_market_data(
        &self,
        symbol: &str,
        on_event: PushCallback,
    ) -> Result<(), BackendError> {
        self.state
            .feeds
            .lock()
            .insert(symbol.to_string(), on_event.clone());
        let early = self.state.on_subscribe.lock().remove(symbol).unwrap_or_default();
        for event in early {
            on_event(event);
        }
        Ok(())
    }
}

struct FakeChannel {
    state: Arc<FakeState>,
    on_push: Option<PushCallback>,
    id: Option<String>,
    connected: bool,
    closed: bool,
}

impl FakeChannel {
    fn engine_reply(&self, message: &Value) -> Option<Result<Option<String>, BackendError>> {
        match message.get("MsgType").and_then(Value::as_str)? {
            "x" => {
                let instruments: Vec<Value> = self
                    .state
                    .symbols
                    .iter()
                    .map(|s| json!({"Symbol": s}))
                    .collect();
                Some(Ok(Some(
                    json!({"MsgType": "y", "Instruments": instruments, "Currencies": []}).to_string(),
                )))
            }
            "U34" => {
                let after = message.get("TradeID").and_then(Value::as_i64).unwrap_or(0);
                let rows: Vec<Value> = self
                    .state
                    .trades
                    .iter()
                    .filter(|t| t.id > after)
                    .map(trade_row)
                    .collect();
                Some(Ok(Some(json!({"MsgType": "U35", "Trades": rows}).to_string())))
            }
            "1" if message.get("TestReqID") == Some(&json!("0")) && self.on_push.is_none() => {
                self.state.keepalives.fetch_add(1, Ordering::SeqCst);
                if self.state.fail_keepalives.load(Ordering::SeqCst) {
                    Some(Err(BackendError::Unavailable("keep-alive refused".to_string())))
                } else {
                    Some(Ok(Some(json!({"MsgType": "0", "TestReqID": "0"}).to_string())))
                }
            }
            _ => None,
        }
    }
}

#[async_trait]
impl BackendChannel for FakeChannel {
    async fn connect(&mut self) -> Result<String, BackendError> {
        if self.state.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Connect("connection refused".to_string()));
        }
        let id = self
            .state
            .forced_ids
            .lock()
            .pop_front()
            .unwrap_or_else(|| format!("conn-{}", self.state.next_id.fetch_add(1, Ordering::SeqCst)));
        if let Some(callback) = &self.on_push {
            self.state.pushes.lock().insert(id.clone(), callback.clone());
        }
        self.id = Some(id.clone());
        self.connected = true;
        Ok(id)
    }

    async fn send_message(&mut self, message: &str) -> Result<Option<String>, BackendError> {
        if !self.connected {
            return Err(BackendError::NotConnected);
        }
        self.state.sent.lock().push(message.to_string());

        let parsed: Value = serde_json::from_str(message).unwrap_or(Value::Null);
        if let Some(reply) = self.engine_reply(&parsed) {
            return reply;
        }

        let responder = self.state.responder.lock().clone();
        match responder(message) {
            FakeReply::Reply(reply) => Ok(reply),
            FakeReply::Disconnect(reply) => {
                self.connected = false;
                Ok(reply)
            }
            FakeReply::Fail(reason) => {
                self.connected = false;
                Err(BackendError::Unavailable(reason))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connection_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.connected = false;
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = &self.id {
            self.state.pushes.lock().remove(id);
        }
    }
}

// ============================================================================
// Address issuer
// ============================================================================

enum IssuerMode {
    Ok(String),
    Unreachable,
    Failing,
    Stalled,
}

pub struct FakeIssuer {
    mode: IssuerMode,
    requests: Mutex<Vec<CreateAddressRequest>>,
}

impl FakeIssuer {
    fn with_mode(mode: IssuerMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn ok(input_address: &str) -> Arc<Self> {
        Self::with_mode(IssuerMode::Ok(input_address.to_string()))
    }

    pub fn unreachable() -> Arc<Self> {
        Self::with_mode(IssuerMode::Unreachable)
    }

    pub fn failing() -> Arc<Self> {
        Self::with_mode(IssuerMode::Failing)
    }

    /// Never answers.
    pub fn stalled() -> Arc<Self> {
        Self::with_mode(IssuerMode::Stalled)
    }

    pub fn requests(&self) -> Vec<CreateAddressRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl AddressIssuer for FakeIssuer {
    async fn create_address(
        &self,
        request: &CreateAddressRequest,
    ) -> external_services::Result<IssuedAddress> {
        self.requests.lock().push(request.clone());
        match &self.mode {
            IssuerMode::Ok(address) => Ok(IssuedAddress {
                input_address: address.clone(),
                destination: request.cold_wallet.clone(),
            }),
            IssuerMode::Unreachable => Err(external_services::Error::Api {
                status: 503,
                message: "Service Unavailable".to_string(),
            }),
            IssuerMode::Failing => Err(external_services::Error::InvalidResponse(
                "missing input_address".to_string(),
            )),
            IssuerMode::Stalled => std::future::pending().await,
        }
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct TestServer {
    server: GatewayServer,
    store: Arc<dyn TradeStore>,
}

impl TestServer {
    pub fn context(&self) -> Arc<GatewayContext> {
        self.server.context()
    }

    pub fn store(&self) -> &Arc<dyn TradeStore> {
        &self.store
    }
}

pub async fn start_test_server(connector: Arc<FakeConnector>) -> (TestServer, AuditBuffer) {
    start_test_server_with_issuer(connector, FakeIssuer::ok("1TestAddress")).await
}

pub async fn start_test_server_with_issuer(
    connector: Arc<FakeConnector>,
    issuer: Arc<FakeIssuer>,
) -> (TestServer, AuditBuffer) {
    let audit = AuditBuffer::default();
    let store: Arc<dyn TradeStore> = Arc::new(MemoryTradeStore::new());
    let server = GatewayServer::start(
        test_config(),
        AuditLog::from_writer("test", audit.clone()),
        connector,
        store.clone(),
        issuer,
    )
    .await
    .unwrap();
    (TestServer { server, store }, audit)
}
