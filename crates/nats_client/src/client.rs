//! NATS client wrapper with request/reply support.

use anyhow::{anyhow, Result};
use async_nats::{Client, Subscriber};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info};

/// Default time to wait for a reply from the engine.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wrapper around the NATS client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    request_timeout: Duration,
}

impl NatsClient {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;

        Ok(Self {
            client,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Override the request/reply timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Send a request and wait for the single reply.
    pub async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes> {
        debug!("Request on {} ({} bytes)", subject, payload.len());
        let reply = tokio::time::timeout(
            self.request_timeout,
            self.client.request(subject.to_string(), payload),
        )
        .await
        .map_err(|_| anyhow!("request on {} timed out after {:?}", subject, self.request_timeout))??;

        Ok(reply.payload)
    }

    /// Subscribe to a subject pattern using NATS Core (low-latency push).
    /// Messages are delivered immediately as they arrive - no polling.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        info!("Subscribing to subject pattern: {}", subject);
        let subscriber = self.client.subscribe(subject.to_string()).await?;
        Ok(subscriber)
    }

    /// Publish a message using NATS Core (fire-and-forget, lowest latency).
    pub async fn publish_fast(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    /// Flush pending publishes to the server.
    pub async fn flush(&self) -> Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}
