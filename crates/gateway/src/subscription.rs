//! Per-session subscription registry.
//!
//! Tracks the session's active snapshot+updates subscriptions, keyed by kind
//! and client request id, along with the publisher registrations that feed
//! them. Only snapshot+updates subscriptions are held; cancelling removes
//! the entry. Re-using a request id replaces the earlier subscription.

use crate::client::Outbox;
use crate::publisher::{Feed, Publisher, PublisherSet, Subscriber, SubscriptionToken};
use crate::protocol::RequestId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    MarketData,
    SecurityStatus,
}

pub struct Subscription {
    pub kind: SubscriptionKind,
    pub req_id: RequestId,
    pub instruments: Vec<String>,
    registrations: Vec<(Arc<Publisher>, SubscriptionToken)>,
}

impl Subscription {
    fn cancel(self) {
        for (publisher, token) in self.registrations {
            publisher.unsubscribe(token);
        }
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<(SubscriptionKind, String), Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register with every known instrument's publisher; each one queues its
    /// snapshot before any update. Instruments without a publisher get an
    /// empty snapshot in their request position and are returned.
    pub fn activate(
        &mut self,
        kind: SubscriptionKind,
        req_id: RequestId,
        instruments: &[String],
        feed: Feed,
        publishers: &PublisherSet,
        session: &str,
        outbox: &Outbox,
    ) -> Vec<String> {
        if self.cancel(kind, &req_id) {
            debug!("Replacing {:?} subscription {} for {}", kind, req_id, session);
        }

        let mut registrations = Vec::with_capacity(instruments.len());
        let mut unknown = Vec::new();
        for symbol in instruments {
            let Some(publisher) = publishers.get(symbol) else {
                warn!("Subscription {} for unknown instrument {}", req_id, symbol);
                outbox.send(&Publisher::empty_snapshot(symbol, req_id.clone(), &feed));
                unknown.push(symbol.clone());
                continue;
            };
            let token = publisher.subscribe(Subscriber {
                session: session.to_string(),
                req_id: req_id.clone(),
                feed: feed.clone(),
                outbox: outbox.clone(),
            });
            registrations.push((publisher.clone(), token));
        }

        self.entries.insert(
            (kind, req_id.key()),
            Subscription {
                kind,
                req_id,
                instruments: instruments.to_vec(),
                registrations,
            },
        );
        unknown
    }

    /// Cancel one subscription. Returns false if it was not active.
    pub fn cancel(&mut self, kind: SubscriptionKind, req_id: &RequestId) -> bool {
        match self.entries.remove(&(kind, req_id.key())) {
            Some(sub) => {
                sub.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything. Returns the number of subscriptions removed.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, sub) in self.entries.drain() {
            sub.cancel();
        }
        count
    }

    pub fn get(&self, kind: SubscriptionKind, req_id: &RequestId) -> Option<&Subscription> {
        self.entries.get(&(kind, req_id.key()))
    }

    pub fn contains(&self, kind: SubscriptionKind, req_id: &RequestId) -> bool {
        self.get(kind, req_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
