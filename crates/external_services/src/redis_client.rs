//! Redis-backed trade store.
//!
//! Trades live in one sorted set scored by trade id, with the JSON encoded
//! trade as the member, so ordering and paging come straight from ZRANGE.

use crate::error::{Error, Result};
use crate::trade::{Trade, TradeFilter, TradeStore};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};

/// Sorted set holding every persisted trade.
pub const TRADES_KEY: &str = "trades";

/// Trade store backed by a Redis sorted set.
#[derive(Clone)]
pub struct RedisTradeStore {
    client: Arc<redis::Client>,
}

impl RedisTradeStore {
    /// Create a new store. No connection is made until the first call.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        info!("Using Redis trade store at {}", redis_url);
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Get an async connection.
    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    fn decode(members: Vec<String>) -> Result<Vec<Trade>> {
        members
            .iter()
            .map(|m| serde_json::from_str(m).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl TradeStore for RedisTradeStore {
    async fn last_trade_id(&self) -> Result<i64> {
        let mut conn = self.get_connection().await?;
        let newest: Vec<String> = conn.zrevrange(TRADES_KEY, 0, 0).await?;

        match newest.into_iter().next() {
            Some(member) => {
                let trade: Trade = serde_json::from_str(&member)?;
                Ok(trade.id)
            }
            None => Ok(0),
        }
    }

    async fn append(&self, trade: &Trade) -> Result<()> {
        let last_id = self.last_trade_id().await?;
        if trade.id <= last_id {
            return Err(Error::NonMonotonicTrade {
                id: trade.id,
                last_id,
            });
        }

        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(trade)?;
        conn.zadd::<_, _, _, ()>(TRADES_KEY, json, trade.id).await?;
        debug!("Stored trade {} ({})", trade.id, trade.symbol);

        Ok(())
    }

    async fn all_trades(&self) -> Result<Vec<Trade>> {
        let mut conn = self.get_connection().await?;
        let members: Vec<String> = conn.zrange(TRADES_KEY, 0, -1).await?;
        Self::decode(members)
    }

    async fn page(
        &self,
        page_size: usize,
        offset: usize,
        filter: Option<&TradeFilter>,
    ) -> Result<Vec<Trade>> {
        if page_size == 0 {
            return Ok(Vec::new());
        }

        if let Some(filter) = filter {
            let trades = self.all_trades().await?;
            return Ok(trades
                .into_iter()
                .filter(|t| filter.matches(t))
                .skip(offset)
                .take(page_size)
                .collect());
        }

        let Some((start, stop)) = zrange_bounds(page_size, offset) else {
            return Ok(Vec::new());
        };
        let mut conn = self.get_connection().await?;
        let members: Vec<String> = conn.zrange(TRADES_KEY, start, stop).await?;
        Self::decode(members)
    }
}

/// Inclusive ZRANGE indices for a page, or `None` when the page is empty or
/// lies beyond what a Redis index can address.
fn zrange_bounds(page_size: usize, offset: usize) -> Option<(isize, isize)> {
    if page_size == 0 {
        return None;
    }
    let last = offset.checked_add(page_size - 1)?;
    Some((isize::try_from(offset).ok()?, isize::try_from(last).ok()?))
}
