//! Clients for collaborators that live outside the gateway process.
//!
//! - Payment processor: issues receive addresses for crypto deposits
//! - Trade store: the persisted trade history (Redis, or in-memory for
//!   local runs and tests)
//!
//! # Example
//!
//! ```ignore
//! use external_services::{open_trade_store, PaymentProcessorClient};
//!
//! let store = open_trade_store("redis://localhost:6379")?;
//! let last_id = store.last_trade_id().await?;
//!
//! let processor = PaymentProcessorClient::new("https://blockchain.info/api/receive", timeout)?;
//! ```

pub mod error;
pub mod payment_processor;
pub mod redis_client;
pub mod trade;

pub use error::{Error, Result};
pub use payment_processor::{CreateAddressRequest, IssuedAddress, PaymentProcessorClient};
pub use redis_client::RedisTradeStore;
pub use trade::{open_trade_store, MemoryTradeStore, Trade, TradeFilter, TradeStore};
