//! NATS transport to the matching engine.
//!
//! The engine exposes a request subject (one request outstanding per
//! connection, answered on the NATS reply inbox) and a publish subject
//! tree that carries per-connection pushes and per-instrument market data.

pub mod client;

pub use client::{NatsClient, DEFAULT_REQUEST_TIMEOUT};
