//! Gateway startup, shared context and shutdown.
//!
//! Startup order:
//! 1. audit the configuration
//! 2. open the application channel to the engine
//! 3. fetch the security list and create one publisher per instrument
//! 4. subscribe to every instrument's market data (events are buffered)
//! 5. backfill trades newer than the store watermark, then replay the whole
//!    store into the publishers
//! 6. mark publishers ready, flushing buffered events
//! 7. start the keep-alive heartbeat
//!
//! Only then does the caller start accepting client connections.

use crate::audit::AuditLog;
use crate::backend::{
    request_security_list, request_trades_since, send_keepalive, BackendChannel,
    BackendConnector, SecurityList,
};
use crate::client::ConnectionRegistry;
use crate::config::GatewayConfig;
use crate::deposit::AddressIssuer;
use crate::error::Result;
use crate::publisher::PublisherSet;
use external_services::TradeStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How long shutdown waits for sessions to close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State shared by every session and HTTP handler.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub audit: AuditLog,
    pub registry: ConnectionRegistry,
    pub publishers: PublisherSet,
    pub security_list: SecurityList,
    pub store: Arc<dyn TradeStore>,
    pub backend: Arc<dyn BackendConnector>,
    pub issuer: Arc<dyn AddressIssuer>,
}

pub struct GatewayServer {
    ctx: Arc<GatewayContext>,
    app_channel: Arc<Mutex<Box<dyn BackendChannel>>>,
    heartbeat: JoinHandle<()>,
}

impl GatewayServer {
    /// Run the startup sequence. Any failure aborts startup.
    pub async fn start(
        config: GatewayConfig,
        audit: AuditLog,
        backend: Arc<dyn BackendConnector>,
        store: Arc<dyn TradeStore>,
        issuer: Arc<dyn AddressIssuer>,
    ) -> Result<Self> {
        audit.record_startup(&config);

        let mut channel = backend.open_channel(None);
        let app_id = channel.connect().await?;
        audit.info("APPLICATION_CONNECTION_OPEN", &app_id);

        let security_list = request_security_list(channel.as_mut()).await?;
        info!(
            "Security list: {} instruments, {} currencies",
            security_list.symbols.len(),
            security_list.currencies.len()
        );

        let publishers = PublisherSet::new(security_list.symbols.iter().cloned());
        for publisher in publishers.iter() {
            let target = publisher.clone();
            backend
                .subscribe_market_data(
                    publisher.symbol(),
                    Arc::new(move |text: String| target.publish_raw(&text)),
                )
                .await?;
        }

        let replayed = replay_trades(channel.as_mut(), store.as_ref(), &publishers).await?;
        info!("Replayed {} trades", replayed);
        publishers.mark_all_ready();

        let app_channel = Arc::new(Mutex::new(channel));
        let heartbeat = spawn_heartbeat(app_channel.clone(), config.heartbeat_interval);

        Ok(Self {
            ctx: Arc::new(GatewayContext {
                config,
                audit,
                registry: ConnectionRegistry::new(),
                publishers,
                security_list,
                store,
                backend,
                issuer,
            }),
            app_channel,
            heartbeat,
        })
    }

    pub fn context(&self) -> Arc<GatewayContext> {
        self.ctx.clone()
    }

    /// Stop the heartbeat, close every session and the application channel.
    pub async fn shutdown(self) {
        self.heartbeat.abort();

        let open = self.ctx.registry.close_all();
        info!("Closing {} sessions", open);
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.ctx.registry.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.ctx.registry.is_empty() {
            warn!("{} sessions still open at shutdown", self.ctx.registry.len());
        }

        self.app_channel.lock().await.close().await;
        self.ctx.audit.info(self.ctx.audit.instance(), "stopped");
    }
}

/// Store engine trades above the watermark, then load the full store into
/// the publishers. Returns the number of trades replayed.
async fn replay_trades(
    channel: &mut dyn BackendChannel,
    store: &dyn TradeStore,
    publishers: &PublisherSet,
) -> Result<usize> {
    let last_id = store.last_trade_id().await?;
    let fresh = request_trades_since(channel, last_id).await?;
    debug!("Engine returned {} trades after {}", fresh.len(), last_id);

    for trade in &fresh {
        match store.append(trade).await {
            Ok(()) => {}
            Err(external_services::Error::NonMonotonicTrade { id, last_id }) => {
                warn!("Skipping trade {} at or below watermark {}", id, last_id);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let trades = store.all_trades().await?;
    for trade in &trades {
        match publishers.get(&trade.symbol) {
            Some(publisher) => publisher.replay_trade(trade),
            None => debug!("No publisher for stored trade {} ({})", trade.id, trade.symbol),
        }
    }
    Ok(trades.len())
}

fn spawn_heartbeat(
    channel: Arc<Mutex<Box<dyn BackendChannel>>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut channel = channel.lock().await;
            if let Err(e) = send_keepalive(&mut **channel).await {
                debug!("Keep-alive failed: {}", e);
            }
        }
    })
}
