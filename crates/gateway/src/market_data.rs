//! Per-instrument market state: order book, recent trades and daily stats.
//!
//! Prices and sizes are fixed-point integers scaled by [`PRICE_SCALE`].

use external_services::Trade;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};

use crate::protocol::RequestId;

pub const PRICE_SCALE: i64 = 100_000_000;

/// Trades kept per instrument for snapshots.
pub const MAX_RECENT_TRADES: usize = 100;

/// Market data entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    Bid,
    Offer,
    Trade,
}

impl EntryType {
    pub const ALL: [EntryType; 3] = [EntryType::Bid, EntryType::Offer, EntryType::Trade];

    pub fn code(self) -> &'static str {
        match self {
            EntryType::Bid => "0",
            EntryType::Offer => "1",
            EntryType::Trade => "2",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(EntryType::Bid),
            "1" => Some(EntryType::Offer),
            "2" => Some(EntryType::Trade),
            _ => None,
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Self::from_code(s.trim()),
            Value::Number(n) => n.as_u64().and_then(|n| Self::from_code(&n.to_string())),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for EntryType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        EntryType::from_value(&value)
            .ok_or_else(|| de::Error::custom(format!("unknown MDEntryType {}", value)))
    }
}

/// Book update action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    New,
    Change,
    Delete,
}

impl UpdateAction {
    fn from_value(value: Option<&Value>) -> Option<Self> {
        let code = match value {
            None | Some(Value::Null) => return Some(UpdateAction::New),
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => return None,
        };
        match code.as_str() {
            "0" => Some(UpdateAction::New),
            "1" => Some(UpdateAction::Change),
            "2" => Some(UpdateAction::Delete),
            _ => None,
        }
    }
}

/// A trade as shown in snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeEntry {
    pub id: i64,
    pub side: String,
    pub price: i64,
    pub size: i64,
    pub buyer: String,
    pub seller: String,
    pub date: String,
    pub time: String,
}

impl From<&Trade> for TradeEntry {
    fn from(trade: &Trade) -> Self {
        Self {
            id: trade.id,
            side: trade.side.clone(),
            price: trade.price,
            size: trade.size,
            buyer: trade.buyer_username.clone(),
            seller: trade.seller_username.clone(),
            date: trade.trade_date(),
            time: trade.trade_time(),
        }
    }
}

/// One entry of an engine incremental update.
#[derive(Debug, Clone)]
pub struct IncrementalEntry {
    pub action: UpdateAction,
    pub entry_type: EntryType,
    pub price: i64,
    pub size: i64,
    /// Entry as received, relayed to subscribers.
    pub fields: Map<String, Value>,
}

impl IncrementalEntry {
    fn trade(&self) -> TradeEntry {
        let text = |key: &str| match self.fields.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        TradeEntry {
            id: self.fields.get("TradeID").and_then(int_value).unwrap_or_default(),
            side: text("Side"),
            price: self.price,
            size: self.size,
            buyer: text("MDEntryBuyer"),
            seller: text("MDEntrySeller"),
            date: text("MDEntryDate"),
            time: text("MDEntryTime"),
        }
    }
}

/// An engine market data event (`X`) for one instrument.
#[derive(Debug, Clone)]
pub struct IncrementalUpdate {
    pub entries: Vec<IncrementalEntry>,
}

impl IncrementalUpdate {
    /// Parse an engine event. Entries of types the gateway does not track are
    /// skipped.
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let group = value
            .get("MDIncGrp")
            .and_then(Value::as_array)
            .ok_or_else(|| "missing MDIncGrp".to_string())?;

        let mut entries = Vec::with_capacity(group.len());
        for item in group {
            let Value::Object(fields) = item else {
                return Err("MDIncGrp entry is not an object".to_string());
            };
            let Some(entry_type) = fields.get("MDEntryType").and_then(EntryType::from_value) else {
                tracing::debug!("Skipping entry with unsupported type: {:?}", fields.get("MDEntryType"));
                continue;
            };
            let action = UpdateAction::from_value(fields.get("MDUpdateAction"))
                .ok_or_else(|| format!("invalid MDUpdateAction {:?}", fields.get("MDUpdateAction")))?;
            let price = fields.get("MDEntryPx").and_then(int_value).unwrap_or_default();
            let size = fields.get("MDEntrySize").and_then(int_value).unwrap_or_default();
            entries.push(IncrementalEntry {
                action,
                entry_type,
                price,
                size,
                fields: fields.clone(),
            });
        }
        Ok(Self { entries })
    }

    pub fn has_trade(&self) -> bool {
        self.entries.iter().any(|e| e.entry_type == EntryType::Trade)
    }

    /// Entries of the given types, in arrival order.
    pub fn filtered(&self, types: &[EntryType]) -> Vec<Value> {
        self.entries
            .iter()
            .filter(|e| types.contains(&e.entry_type))
            .map(|e| Value::Object(e.fields.clone()))
            .collect()
    }
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Outbound payloads
// ============================================================================

/// Entry of a full refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MdEntry {
    #[serde(rename = "MDEntryType")]
    pub entry_type: &'static str,
    #[serde(rename = "MDEntryPx")]
    pub price: i64,
    #[serde(rename = "MDEntrySize")]
    pub size: i64,
    #[serde(rename = "MDEntryPositionNo", skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(rename = "TradeID", skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<i64>,
    #[serde(rename = "Side", skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    #[serde(rename = "MDEntryBuyer", skip_serializing_if = "Option::is_none")]
    pub buyer: Option<String>,
    #[serde(rename = "MDEntrySeller", skip_serializing_if = "Option::is_none")]
    pub seller: Option<String>,
    #[serde(rename = "MDEntryDate", skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "MDEntryTime", skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl MdEntry {
    fn level(entry_type: EntryType, price: i64, size: i64, position: usize) -> Self {
        Self {
            entry_type: entry_type.code(),
            price,
            size,
            position: Some(position),
            trade_id: None,
            side: None,
            buyer: None,
            seller: None,
            date: None,
            time: None,
        }
    }

    fn trade(trade: &TradeEntry) -> Self {
        Self {
            entry_type: EntryType::Trade.code(),
            price: trade.price,
            size: trade.size,
            position: None,
            trade_id: Some(trade.id),
            side: Some(trade.side.clone()),
            buyer: Some(trade.buyer.clone()),
            seller: Some(trade.seller.clone()),
            date: Some(trade.date.clone()),
            time: Some(trade.time.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketDataFullRefresh {
    #[serde(rename = "MDReqID")]
    pub req_id: RequestId,
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "MarketDepth")]
    pub market_depth: u64,
    #[serde(rename = "MDFullGrp")]
    pub entries: Vec<MdEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketDataIncremental {
    #[serde(rename = "MDReqID")]
    pub req_id: RequestId,
    #[serde(rename = "MDBkTyp")]
    pub book_type: &'static str,
    #[serde(rename = "MDIncGrp")]
    pub entries: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityStatus {
    #[serde(rename = "SecurityStatusReqID")]
    pub req_id: RequestId,
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "LastPx")]
    pub last_px: i64,
    #[serde(rename = "HighPx")]
    pub high_px: i64,
    #[serde(rename = "LowPx")]
    pub low_px: i64,
    #[serde(rename = "BuyVolume")]
    pub buy_volume: i64,
    #[serde(rename = "SellVolume")]
    pub sell_volume: i64,
    #[serde(rename = "BestBid")]
    pub best_bid: i64,
    #[serde(rename = "BestAsk")]
    pub best_ask: i64,
    #[serde(rename = "TradeDate", skip_serializing_if = "Option::is_none")]
    pub trade_date: Option<String>,
}

// ============================================================================
// Instrument state
// ============================================================================

#[derive(Debug, Clone, Default)]
struct DailyStats {
    trade_date: Option<String>,
    last_px: i64,
    high_px: i64,
    low_px: i64,
    buy_volume: i64,
    sell_volume: i64,
}

impl DailyStats {
    fn record(&mut self, trade: &TradeEntry) {
        let later_day = match &self.trade_date {
            Some(current) => trade.date.as_str() > current.as_str(),
            None => true,
        };
        if later_day {
            *self = DailyStats {
                trade_date: Some(trade.date.clone()),
                high_px: trade.price,
                low_px: trade.price,
                ..DailyStats::default()
            };
        }
        self.last_px = trade.price;
        self.high_px = self.high_px.max(trade.price);
        self.low_px = self.low_px.min(trade.price);
        self.buy_volume += trade.size;
        self.sell_volume += (i128::from(trade.price) * i128::from(trade.size) / i128::from(PRICE_SCALE)) as i64;
    }
}

/// Book, recent trades and daily statistics of one instrument.
#[derive(Debug, Clone)]
pub struct InstrumentState {
    symbol: String,
    bids: BTreeMap<i64, i64>,
    asks: BTreeMap<i64, i64>,
    trades: VecDeque<TradeEntry>,
    stats: DailyStats,
}

impl InstrumentState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            trades: VecDeque::with_capacity(MAX_RECENT_TRADES),
            stats: DailyStats::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn push_trade(&mut self, trade: TradeEntry) {
        self.stats.record(&trade);
        if self.trades.len() == MAX_RECENT_TRADES {
            self.trades.pop_front();
        }
        self.trades.push_back(trade);
    }

    pub fn apply(&mut self, update: &IncrementalUpdate) {
        for entry in &update.entries {
            let book = match entry.entry_type {
                EntryType::Bid => &mut self.bids,
                EntryType::Offer => &mut self.asks,
                EntryType::Trade => {
                    self.push_trade(entry.trade());
                    continue;
                }
            };
            match entry.action {
                UpdateAction::New | UpdateAction::Change if entry.size > 0 => {
                    book.insert(entry.price, entry.size);
                }
                _ => {
                    book.remove(&entry.price);
                }
            }
        }
    }

    pub fn best_bid(&self) -> Option<i64> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<i64> {
        self.asks.keys().next().copied()
    }

    /// Recent trades, newest first.
    pub fn recent_trades(&self) -> impl Iterator<Item = &TradeEntry> {
        self.trades.iter().rev()
    }

    pub fn full_refresh(
        &self,
        req_id: RequestId,
        market_depth: u64,
        entry_types: &[EntryType],
    ) -> MarketDataFullRefresh {
        let depth = match market_depth {
            0 => usize::MAX,
            n => usize::try_from(n).unwrap_or(usize::MAX),
        };
        let mut entries = Vec::new();
        if entry_types.contains(&EntryType::Bid) {
            entries.extend(
                self.bids
                    .iter()
                    .rev()
                    .take(depth)
                    .enumerate()
                    .map(|(i, (px, sz))| MdEntry::level(EntryType::Bid, *px, *sz, i + 1)),
            );
        }
        if entry_types.contains(&EntryType::Offer) {
            entries.extend(
                self.asks
                    .iter()
                    .take(depth)
                    .enumerate()
                    .map(|(i, (px, sz))| MdEntry::level(EntryType::Offer, *px, *sz, i + 1)),
            );
        }
        if entry_types.contains(&EntryType::Trade) {
            entries.extend(self.recent_trades().map(MdEntry::trade));
        }
        MarketDataFullRefresh {
            req_id,
            symbol: self.symbol.clone(),
            market_depth,
            entries,
        }
    }

    pub fn security_status(&self, req_id: RequestId) -> SecurityStatus {
        SecurityStatus {
            req_id,
            symbol: self.symbol.clone(),
            last_px: self.stats.last_px,
            high_px: self.stats.high_px,
            low_px: self.stats.low_px,
            buy_volume: self.stats.buy_volume,
            sell_volume: self.stats.sell_volume,
            best_bid: self.best_bid().unwrap_or_default(),
            best_ask: self.best_ask().unwrap_or_default(),
            trade_date: self.stats.trade_date.clone(),
        }
    }
}
