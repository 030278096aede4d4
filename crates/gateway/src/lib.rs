//! WebSocket gateway between browser clients and the trading engine.
//!
//! This service:
//! - Accepts WebSocket connections and opens one engine connection per client
//! - Answers heartbeats, trade history, market data and security status
//!   requests locally
//! - Issues deposit addresses through the payment processor
//! - Forwards every other message to the engine and relays the reply
//!
//! ## Architecture
//!
//! ```text
//! NATS: <publish>.md.<symbol>
//!         ↓
//! Publisher (one per instrument: book, trades, daily stats)
//!         ↓
//! SubscriptionRegistry (per session)
//!         ↓
//! Outbox → WebSocket client
//!
//! WebSocket client → Session → Dispatcher → BackendChannel (NATS request/reply)
//! ```
//!
//! Startup replays persisted trades into the publishers before any client is
//! accepted; live events arriving meanwhile are buffered.

pub mod audit;
pub mod backend;
pub mod client;
pub mod config;
pub mod deposit;
pub mod dispatcher;
pub mod error;
pub mod market_data;
pub mod protocol;
pub mod publisher;
pub mod server;
pub mod session;
pub mod subscription;
pub mod ws_server;

#[cfg(test)]
pub(crate) mod testing;

pub use audit::AuditLog;
pub use backend::{BackendChannel, BackendConnector, BackendError, NatsBackend};
pub use client::{ConnectionRegistry, SessionHandle, SessionState};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use protocol::ServerMessage;
pub use server::{GatewayContext, GatewayServer};
pub use ws_server::{create_router, AppState};
