//! Persisted trade records and the store they live in.

use crate::error::{Error, Result};
use crate::redis_client::RedisTradeStore;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Timestamp layout used by the engine and by trade history rows.
pub const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A trade as persisted by the gateway.
///
/// Ids are assigned by the engine and only ever grow; the highest stored id
/// is the watermark used to fetch newer trades at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub symbol: String,
    /// "1" buy, "2" sell (aggressor side).
    pub side: String,
    pub price: i64,
    pub size: i64,
    pub buyer_username: String,
    pub seller_username: String,
    pub created: NaiveDateTime,
    pub order_id: i64,
    pub counter_order_id: i64,
}

impl Trade {
    /// Creation date as `YYYY-MM-DD`.
    pub fn trade_date(&self) -> String {
        self.created.format("%Y-%m-%d").to_string()
    }

    /// Creation time as `HH:MM:SS`.
    pub fn trade_time(&self) -> String {
        self.created.format("%H:%M:%S").to_string()
    }

    /// Row in trade history column order:
    /// TradeID, Market, Side, Price, Size, Buyer, Seller, Created.
    pub fn history_row(&self) -> Vec<Value> {
        vec![
            Value::from(self.id),
            Value::from(self.symbol.clone()),
            Value::from(self.side.clone()),
            Value::from(self.price),
            Value::from(self.size),
            Value::from(self.buyer_username.clone()),
            Value::from(self.seller_username.clone()),
            Value::from(self.created.format(CREATED_FORMAT).to_string()),
        ]
    }
}

/// Opaque trade history filter supplied by the client.
///
/// A trade matches when its symbol, buyer or seller equals any term.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradeFilter {
    terms: Vec<String>,
}

impl TradeFilter {
    pub fn new(terms: Vec<String>) -> Self {
        Self { terms }
    }

    /// Build a filter from the raw `Filter` field of a request.
    /// Accepts a single string or an array of strings; anything else is ignored.
    pub fn from_value(value: &Value) -> Option<Self> {
        let terms: Vec<String> = match value {
            Value::String(s) if !s.is_empty() => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        if terms.is_empty() {
            None
        } else {
            Some(Self { terms })
        }
    }

    pub fn matches(&self, trade: &Trade) -> bool {
        self.terms.iter().any(|t| {
            *t == trade.symbol || *t == trade.buyer_username || *t == trade.seller_username
        })
    }
}

/// Storage for the trade history.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Highest stored trade id, or 0 when the store is empty.
    async fn last_trade_id(&self) -> Result<i64>;

    /// Append a trade. Fails with [`Error::NonMonotonicTrade`] unless the id
    /// is strictly greater than the current watermark.
    async fn append(&self, trade: &Trade) -> Result<()>;

    /// Every stored trade, ascending by id.
    async fn all_trades(&self) -> Result<Vec<Trade>>;

    /// One page of trades, ascending by id.
    async fn page(
        &self,
        page_size: usize,
        offset: usize,
        filter: Option<&TradeFilter>,
    ) -> Result<Vec<Trade>>;
}

/// Open the store named by a storage connection string.
///
/// `memory://` gives a process-local store; `redis://` and `rediss://` use Redis.
pub fn open_trade_store(url: &str) -> Result<Arc<dyn TradeStore>> {
    if url.starts_with("memory://") {
        info!("Using in-memory trade store");
        return Ok(Arc::new(MemoryTradeStore::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        return Ok(Arc::new(RedisTradeStore::new(url)?));
    }
    Err(Error::UnsupportedStorage(url.to_string()))
}

/// Process-local trade store.
#[derive(Debug, Default)]
pub struct MemoryTradeStore {
    trades: Mutex<Vec<Trade>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn last_trade_id(&self) -> Result<i64> {
        Ok(self.trades.lock().last().map(|t| t.id).unwrap_or(0))
    }

    async fn append(&self, trade: &Trade) -> Result<()> {
        let mut trades = self.trades.lock();
        let last_id = trades.last().map(|t| t.id).unwrap_or(0);
        if trade.id <= last_id {
            return Err(Error::NonMonotonicTrade {
                id: trade.id,
                last_id,
            });
        }
        trades.push(trade.clone());
        Ok(())
    }

    async fn all_trades(&self) -> Result<Vec<Trade>> {
        Ok(self.trades.lock().clone())
    }

    async fn page(
        &self,
        page_size: usize,
        offset: usize,
        filter: Option<&TradeFilter>,
    ) -> Result<Vec<Trade>> {
        let trades = self.trades.lock();
        Ok(trades
            .iter()
            .filter(|t| filter.map_or(true, |f| f.matches(t)))
            .skip(offset)
            .take(page_size)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn make_trade(id: i64, symbol: &str) -> Trade {
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
            seller_username: if id % 3 == 0 { "carol" } else { "bob" }.to_string(),
            created,
            order_id: id * 10,
            counter_order_id: id * 10 + 1,
        }
    }

    #[tokio::test]
    async fn test_append_rejects_non_monotonic_ids() {
        let store = MemoryTradeStore::new();
        store.append(&make_trade(5, "BTCUSD")).await.unwrap();

        let err = store.append(&make_trade(5, "BTCUSD")).await.unwrap_err();
        assert!(matches!(err, Error::NonMonotonicTrade { id: 5, last_id: 5 }));
        assert_eq!(store.last_trade_id().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_empty_store_watermark_is_zero() {
        let store = MemoryTradeStore::new();
        assert_eq!(store.last_trade_id().await.unwrap(), 0);
        assert!(store.all_trades().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_page_returns_rows_at_offset() {
        let store = MemoryTradeStore::new();
        for id in 1..=25 {
            store.append(&make_trade(id, "BTCUSD")).await.unwrap();
        }

        let page = store.page(10, 10, None).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|t| t.id).collect();
        assert_eq!(ids, (11..=20).collect::<Vec<_>>());

        let again = store.page(10, 10, None).await.unwrap();
        assert_eq!(page, again);

        assert_eq!(store.page(10, 20, None).await.unwrap().len(), 5);
        assert!(store.page(10, 30, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_page_applies_filter_before_offset() {
        let store = MemoryTradeStore::new();
        for id in 1..=9 {
            store.append(&make_trade(id, "BTCUSD")).await.unwrap();
        }

        let filter = TradeFilter::new(vec!["carol".to_string()]);
        let page = store.page(10, 1, Some(&filter)).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![6, 9]);
    }

    #[test]
    fn test_history_row_column_order() {
        let trade = make_trade(7, "BTCBRL");
        let row = trade.history_row();
        assert_eq!(row.len(), 8);
        assert_eq!(row[0], Value::from(7));
        assert_eq!(row[1], Value::from("BTCBRL"));
        assert_eq!(row[2], Value::from("2"));
        assert_eq!(row[5], Value::from("alice"));
        assert_eq!(row[7], Value::from("2014-01-02 10:00:07"));
    }

    #[test]
    fn test_filter_from_value() {
        assert!(TradeFilter::from_value(&Value::Null).is_none());
        assert!(TradeFilter::from_value(&Value::from("")).is_none());
        assert_eq!(
            TradeFilter::from_value(&serde_json::json!(["BTCUSD", 3])),
            Some(TradeFilter::new(vec!["BTCUSD".to_string()]))
        );
    }

    #[test]
    fn test_open_trade_store_rejects_unknown_scheme() {
        assert!(open_trade_store("memory://").is_ok());
        assert!(matches!(
            open_trade_store("postgres://localhost/db"),
            Err(Error::UnsupportedStorage(_))
        ));
    }
}
