// Copyright 2024 AION Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(missing_docs)]

//! # Event Bus Module
//!
//! A process-local publish/subscribe layer that fans transfer lifecycle
//! transitions out to live observers.
//!
//! Global events (`payment_confirmed` and friends) reach every registered
//! subscriber; per-transfer topics (`transfer:<id>`) only reach
//! subscribers that opted in. Delivery is best-effort: a subscriber whose
//! channel is full or closed is evicted. The durable record lives in the
//! store's event log, never here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use aion_relayer_utils::probe;

/// Identifies a registered subscriber.
pub type SubscriberId = u64;

/// The topic prefix for per-transfer fan-out.
pub const TRANSFER_TOPIC_PREFIX: &str = "transfer:";

/// The per-transfer topic for the given id.
pub fn transfer_topic(transfer_id: u64) -> String {
    format!("{TRANSFER_TOPIC_PREFIX}{transfer_id}")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

/// A lifecycle event flowing through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// The event kind, e.g. `payment_confirmed`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Structured payload, usually containing at least `transferId`.
    pub data: serde_json::Value,
    /// Unix ms when the event was published.
    pub timestamp: u64,
}

impl BusEvent {
    /// Creates an event stamped with the current wall-clock time.
    pub fn new(
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: now_ms(),
        }
    }
}

#[derive(Default)]
struct Inner {
    next_id: SubscriberId,
    subscribers: HashMap<SubscriberId, mpsc::Sender<BusEvent>>,
    topics: HashMap<String, HashSet<SubscriberId>>,
}

impl Inner {
    fn evict(&mut self, id: SubscriberId) {
        self.subscribers.remove(&id);
        for members in self.topics.values_mut() {
            members.remove(&id);
        }
        self.topics.retain(|_, members| !members.is_empty());
    }
}

/// The shared pub/sub handle. Cheap to clone; all clones observe the same
/// subscriber set.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish()
    }
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns its id together with the
    /// receiving half of its event channel. `buffer` bounds how far the
    /// subscriber may fall behind before it gets evicted.
    pub fn register(
        &self,
        buffer: usize,
    ) -> (SubscriberId, mpsc::Receiver<BusEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.insert(id, tx);
        tracing::debug!(subscriber = id, "Subscriber registered");
        (id, rx)
    }

    /// Removes a subscriber and all of its topic subscriptions.
    pub fn unregister(&self, id: SubscriberId) {
        self.inner.lock().evict(id);
        tracing::debug!(subscriber = id, "Subscriber unregistered");
    }

    /// Subscribes `id` to a topic. Unknown subscriber ids are ignored.
    pub fn subscribe(&self, id: SubscriberId, topic: &str) {
        let mut inner = self.inner.lock();
        if !inner.subscribers.contains_key(&id) {
            return;
        }
        inner.topics.entry(topic.to_string()).or_default().insert(id);
    }

    /// Drops `id`'s subscription to a topic.
    pub fn unsubscribe(&self, id: SubscriberId, topic: &str) {
        let mut inner = self.inner.lock();
        if let Some(members) = inner.topics.get_mut(topic) {
            members.remove(&id);
            if members.is_empty() {
                inner.topics.remove(topic);
            }
        }
    }

    /// Delivers an event to every registered subscriber (global topics).
    pub fn broadcast(&self, event: BusEvent) {
        let targets: Vec<(SubscriberId, mpsc::Sender<BusEvent>)> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        self.deliver(&event, targets);
    }

    /// Delivers an event only to the subscribers of `topic`.
    pub fn publish(&self, topic: &str, event: BusEvent) {
        let targets: Vec<(SubscriberId, mpsc::Sender<BusEvent>)> = {
            let inner = self.inner.lock();
            let Some(members) = inner.topics.get(topic) else {
                return;
            };
            members
                .iter()
                .filter_map(|id| {
                    inner.subscribers.get(id).map(|tx| (*id, tx.clone()))
                })
                .collect()
        };
        self.deliver(&event, targets);
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn deliver(
        &self,
        event: &BusEvent,
        targets: Vec<(SubscriberId, mpsc::Sender<BusEvent>)>,
    ) {
        let mut lagging = vec![];
        for (id, tx) in targets {
            if tx.try_send(event.clone()).is_err() {
                lagging.push(id);
            }
        }
        if lagging.is_empty() {
            return;
        }
        // best-effort delivery: a slow or disconnected observer loses its
        // copy and its registration, never blocks the pipeline.
        let mut inner = self.inner.lock();
        for id in lagging {
            inner.evict(id);
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::DEBUG,
                kind = %probe::Kind::EventBus,
                evicted = true,
                subscriber = id,
                ty = %event.event_type,
            );
        }
    }
}
