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

//! # Relayer Context Module
//!
//! A module for managing the context of the relayer: configuration, the
//! transfer store handle, the event bus, the execution concurrency state,
//! and the shutdown signal. Components receive the context explicitly at
//! construction; there is no process-wide state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Notify};

use ethers::core::k256::SecretKey;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};

use aion_event_bus::EventBus;
use aion_relayer_config::{AionRelayerConfig, MAX_CONCURRENT_LIMIT};
use aion_relayer_store::SledStore;
use aion_relayer_utils::metric::Metrics;

/// RelayerContext contains the relayer's configuration, shared handles and
/// shutdown signal.
#[derive(Clone)]
pub struct RelayerContext {
    /// The configuration of the relayer.
    pub config: AionRelayerConfig,
    /// Broadcasts the shutdown signal to every long-lived task.
    ///
    /// The binary triggers it from its signal handler; the queue
    /// scheduler and each subscription connection hold a [`Shutdown`]
    /// receiver and wind down to a safe state when the `()` value
    /// arrives.
    notify_shutdown: broadcast::Sender<()>,
    /// Represents the metrics for the relayer
    pub metrics: Arc<Metrics>,
    store: Option<SledStore>,
    bus: EventBus,
    processing: Arc<ProcessingState>,
    wallet: LocalWallet,
    started_at: Instant,
}

impl RelayerContext {
    /// Creates a new RelayerContext.
    ///
    /// A missing store is tolerated: the relayer still starts, with the
    /// ingress API degraded. A missing, malformed, or all-zero gas-payer
    /// key is replaced with a randomly generated development key after a
    /// warning.
    pub fn new(
        config: AionRelayerConfig,
        store: Option<SledStore>,
    ) -> aion_relayer_utils::Result<Self> {
        let (notify_shutdown, _) = broadcast::channel(2);
        let metrics = Arc::new(Metrics::new()?);
        let processing =
            Arc::new(ProcessingState::new(config.queue.max_concurrent));
        let wallet = Self::build_wallet(&config);
        Ok(Self {
            config,
            notify_shutdown,
            metrics,
            store,
            bus: EventBus::new(),
            processing,
            wallet,
            started_at: Instant::now(),
        })
    }

    fn build_wallet(config: &AionRelayerConfig) -> LocalWallet {
        let chain_id = config.evm.chain_id;
        let configured = config.evm.private_key.as_ref().and_then(|key| {
            if key.is_zero() {
                tracing::warn!(
                    "Configured gas-payer key is all zeros, generating a development key"
                );
                return None;
            }
            match SecretKey::from_slice(key.as_bytes()) {
                Ok(secret) => Some(LocalWallet::from(secret)),
                Err(e) => {
                    tracing::warn!(
                        "Configured gas-payer key is invalid ({e}), generating a development key"
                    );
                    None
                }
            }
        });
        let wallet = configured.unwrap_or_else(|| {
            let wallet = LocalWallet::new(&mut rand::thread_rng());
            tracing::warn!(
                "Using development gas-payer key for {}; do not use in production",
                wallet.address()
            );
            wallet
        });
        wallet.with_chain_id(chain_id)
    }

    /// Returns a broadcast receiver handle for the shutdown signal.
    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Sends a shutdown signal to all subscribed tasks/connections.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }

    /// Returns a new RPC provider for the escrow chain.
    pub fn evm_provider(
        &self,
    ) -> aion_relayer_utils::Result<Provider<Http>> {
        let endpoint = self
            .config
            .evm
            .http_endpoint
            .as_ref()
            .ok_or(aion_relayer_utils::Error::Generic(
                "RPC endpoint is not configured",
            ))?;
        let provider = Provider::try_from(endpoint.as_url().as_str())?
            .interval(Duration::from_millis(5u64));
        Ok(provider)
    }

    /// The gas-payer wallet for submission transactions.
    pub fn evm_wallet(&self) -> LocalWallet {
        self.wallet.clone()
    }

    /// Returns the transfer store, if one was available at startup.
    pub fn store(&self) -> Option<&SledStore> {
        self.store.as_ref()
    }

    /// Returns the transfer store or the single observable "unavailable"
    /// error the ingress layer maps to a degraded response.
    pub fn require_store(
        &self,
    ) -> aion_relayer_utils::Result<&SledStore> {
        self.store
            .as_ref()
            .ok_or(aion_relayer_utils::Error::StoreUnavailable)
    }

    /// The lifecycle event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The execution concurrency state shared between the queue and the
    /// admin endpoint.
    pub fn processing(&self) -> &Arc<ProcessingState> {
        &self.processing
    }

    /// Seconds since the relayer started.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Tracks how many execution slots are in flight and the configured cap.
///
/// The cap is enforced by counting active slots; slots are not serialized
/// against each other. Ingress wakes the scheduler through [`Self::wake`]
/// whenever capacity might be free.
#[derive(Debug)]
pub struct ProcessingState {
    current: AtomicUsize,
    max: AtomicUsize,
    notify: Notify,
}

impl ProcessingState {
    /// Creates the state with the configured cap.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(
                max_concurrent.clamp(1, MAX_CONCURRENT_LIMIT),
            ),
            notify: Notify::new(),
        }
    }

    /// Number of slots currently executing.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// The configured concurrency cap.
    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Updates the cap, clamped to `[1, MAX_CONCURRENT_LIMIT]`, and
    /// returns the applied value.
    pub fn set_max(&self, max_concurrent: usize) -> usize {
        let clamped = max_concurrent.clamp(1, MAX_CONCURRENT_LIMIT);
        self.max.store(clamped, Ordering::SeqCst);
        self.notify.notify_one();
        clamped
    }

    /// Slots still available this instant.
    pub fn free_slots(&self) -> usize {
        self.max().saturating_sub(self.current())
    }

    /// Marks one slot as started.
    pub fn begin(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks one slot as finished, regardless of its outcome, and wakes
    /// the scheduler so freed capacity is used immediately.
    pub fn finish(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Wakes the scheduler outside its periodic tick.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Resolves when [`Self::wake`] or [`Self::finish`] is called.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Listens for the relayer-wide shutdown signal.
///
/// Every long-lived task holds one of these, backed by a receiver of the
/// context's broadcast channel: the queue scheduler stops ticking on it,
/// and each subscription connection closes on it, while in-flight RPC
/// calls finish on their own tasks. [`RelayerContext::shutdown`] sends
/// the single `()` value the channel ever carries.
#[derive(Debug)]
pub struct Shutdown {
    /// Set once the signal has been observed, so later calls return
    /// without touching the channel again.
    received: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Wraps a receiver handed out by [`RelayerContext::shutdown_signal`].
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            received: false,
            notify,
        }
    }

    /// Waits until the shutdown signal has been sent, returning
    /// immediately on every call after the first observation.
    pub async fn recv(&mut self) {
        if self.received {
            return;
        }
        // a lagged receiver reads the same as a delivered signal, since
        // only one value is ever sent
        let _ = self.notify.recv().await;
        self.received = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_state_counts_slots_and_clamps_the_cap() {
        let state = ProcessingState::new(3);
        assert_eq!(state.free_slots(), 3);
        state.begin();
        state.begin();
        assert_eq!(state.current(), 2);
        assert_eq!(state.free_slots(), 1);
        state.finish();
        assert_eq!(state.free_slots(), 2);

        assert_eq!(state.set_max(0), 1);
        assert_eq!(state.set_max(25), MAX_CONCURRENT_LIMIT);
        assert_eq!(state.set_max(7), 7);
    }

    #[tokio::test]
    async fn finishing_a_slot_wakes_the_scheduler() {
        let state = Arc::new(ProcessingState::new(1));
        state.begin();
        let waiter = state.clone();
        let handle = tokio::spawn(async move { waiter.notified().await });
        state.finish();
        handle.await.unwrap();
    }
}
