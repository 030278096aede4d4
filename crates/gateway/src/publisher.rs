//! Per-instrument publishers.
//!
//! A [`Publisher`] owns one instrument's [`InstrumentState`] and its
//! subscribers. Engine events are applied and fanned out under a single lock,
//! so every subscriber sees events in arrival order and a snapshot is always
//! queued before the first incremental that follows it.
//!
//! Until [`Publisher::mark_ready`] is called, live events are buffered; they
//! are applied after the backlog replay.

use crate::client::Outbox;
use crate::market_data::{
    EntryType, IncrementalUpdate, InstrumentState, MarketDataIncremental, TradeEntry,
};
use crate::protocol::{RequestId, ServerMessage};
use external_services::Trade;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Subscriber key within one publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionToken(u64);

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Feed {
    MarketData {
        market_depth: u64,
        entry_types: Vec<EntryType>,
    },
    SecurityStatus,
}

/// A live subscriber of one instrument.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub session: String,
    pub req_id: RequestId,
    pub feed: Feed,
    pub outbox: Outbox,
}

struct PublisherInner {
    ready: bool,
    state: InstrumentState,
    pending: VecDeque<IncrementalUpdate>,
    subscribers: BTreeMap<SubscriptionToken, Subscriber>,
}

pub struct Publisher {
    symbol: String,
    inner: Mutex<PublisherInner>,
    next_token: AtomicU64,
}

impl Publisher {
    pub fn new(symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        Self {
            inner: Mutex::new(PublisherInner {
                ready: false,
                state: InstrumentState::new(symbol.clone()),
                pending: VecDeque::new(),
                subscribers: BTreeMap::new(),
            }),
            symbol,
            next_token: AtomicU64::new(1),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    /// Load a historical trade during startup replay.
    pub fn replay_trade(&self, trade: &Trade) {
        self.inner.lock().state.push_trade(TradeEntry::from(trade));
    }

    /// Apply a raw engine event.
    pub fn publish_raw(&self, text: &str) {
        match IncrementalUpdate::parse(text) {
            Ok(update) => self.publish(update),
            Err(e) => warn!("Dropping malformed market data for {}: {}", self.symbol, e),
        }
    }

    /// Apply an engine event and deliver it, or buffer it until ready.
    pub fn publish(&self, update: IncrementalUpdate) {
        let mut inner = self.inner.lock();
        if !inner.ready {
            debug!("Buffering market data for {} until replay completes", self.symbol);
            inner.pending.push_back(update);
            return;
        }
        Self::apply_and_fan_out(&mut inner, &update);
    }

    /// Flush buffered events in arrival order and start live delivery.
    pub fn mark_ready(&self) {
        let mut inner = self.inner.lock();
        inner.ready = true;
        while let Some(update) = inner.pending.pop_front() {
            Self::apply_and_fan_out(&mut inner, &update);
        }
    }

    fn apply_and_fan_out(inner: &mut PublisherInner, update: &IncrementalUpdate) {
        inner.state.apply(update);
        let has_trade = update.has_trade();

        let mut gone = Vec::new();
        for (token, sub) in &inner.subscribers {
            let msg = match &sub.feed {
                Feed::MarketData { entry_types, .. } => {
                    let entries = update.filtered(entry_types);
                    if entries.is_empty() {
                        continue;
                    }
                    ServerMessage::MarketDataIncremental(MarketDataIncremental {
                        req_id: sub.req_id.clone(),
                        book_type: "3",
                        entries,
                    })
                }
                Feed::SecurityStatus if has_trade => {
                    ServerMessage::SecurityStatus(inner.state.security_status(sub.req_id.clone()))
                }
                Feed::SecurityStatus => continue,
            };
            if sub.outbox.send(&msg) {
                counter!("gateway_deliveries_total").increment(1);
            } else {
                gone.push(*token);
            }
        }
        for token in gone {
            if let Some(sub) = inner.subscribers.remove(&token) {
                debug!("Dropped subscriber {} ({}) with closed outbox", sub.req_id, sub.session);
            }
        }
    }

    pub(crate) fn snapshot_of(state: &InstrumentState, req_id: RequestId, feed: &Feed) -> ServerMessage {
        match feed {
            Feed::MarketData {
                market_depth,
                entry_types,
            } => ServerMessage::MarketDataFullRefresh(state.full_refresh(
                req_id,
                *market_depth,
                entry_types,
            )),
            Feed::SecurityStatus => ServerMessage::SecurityStatus(state.security_status(req_id)),
        }
    }

    /// Snapshot of an instrument with no publisher: no book, no trades.
    pub(crate) fn empty_snapshot(symbol: &str, req_id: RequestId, feed: &Feed) -> ServerMessage {
        Self::snapshot_of(&InstrumentState::new(symbol), req_id, feed)
    }

    /// Current snapshot for a one-shot request.
    pub fn snapshot(&self, req_id: RequestId, feed: &Feed) -> ServerMessage {
        Self::snapshot_of(&self.inner.lock().state, req_id, feed)
    }

    /// Queue a snapshot for the subscriber and start live delivery to it.
    pub fn subscribe(&self, subscriber: Subscriber) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock();
        let snapshot = Self::snapshot_of(&inner.state, subscriber.req_id.clone(), &subscriber.feed);
        subscriber.outbox.send(&snapshot);
        inner.subscribers.insert(token, subscriber);
        token
    }

    /// Stop delivery. Returns false if the token was not subscribed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.inner.lock().subscribers.remove(&token).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Security status without a request id, for the REST surface.
    pub fn ticker(&self) -> ServerMessage {
        self.snapshot(RequestId::default(), &Feed::SecurityStatus)
    }

    /// Recent trades, newest first.
    pub fn recent_trades(&self) -> Vec<TradeEntry> {
        self.inner.lock().state.recent_trades().cloned().collect()
    }
}

/// Publishers for every instrument of the security list.
#[derive(Clone, Default)]
pub struct PublisherSet {
    publishers: HashMap<String, Arc<Publisher>>,
}

impl PublisherSet {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let publishers = symbols
            .into_iter()
            .map(|s| {
                let publisher = Arc::new(Publisher::new(s));
                (publisher.symbol().to_string(), publisher)
            })
            .collect();
        Self { publishers }
    }

    pub fn get(&self, symbol: &str) -> Option<&Arc<Publisher>> {
        self.publishers.get(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Publisher>> {
        self.publishers.values()
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    pub fn mark_all_ready(&self) {
        for publisher in self.publishers.values() {
            publisher.mark_ready();
        }
    }
}
