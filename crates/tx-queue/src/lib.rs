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

//! # Transfer Queue Module
//!
//! The relayer's core state machine: a scheduler that advances validated
//! transfers to terminal states under a bounded concurrency cap, with
//! exponential-backoff retries and idempotent re-execution after crashes.
//!
//! The scheduler ticks periodically and additionally wakes whenever the
//! ingress API accepts a transfer or an execution slot frees up. Each
//! round it first re-queues `failed` transfers whose backoff has elapsed,
//! then fills the free slots with `validated` transfers oldest-first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use aion_chain_gateway::{EscrowOracle, TransferSubmitter};
use aion_event_bus::BusEvent;
use aion_relayer_context::RelayerContext;
use aion_relayer_store::{
    TransferStatus, TransferStore, TransferUpdate,
};
use aion_relayer_utils::probe;
use aion_validator::TransferValidator;

pub mod classify;
mod executor;
#[cfg(test)]
mod tests;

pub use classify::{is_permanent_validation_error, is_retryable_error};

/// How many failed rows one scheduler round examines for re-queueing.
const RETRY_SCAN_LIMIT: usize = 50;

/// The TransferQueue advances validated transfers to terminal states.
///
/// Parallel execution slots are bounded by the context's
/// [`aion_relayer_context::ProcessingState`]; a per-id guard keeps a
/// transfer from ever owning two slots at once.
pub struct TransferQueue<S, C> {
    ctx: RelayerContext,
    store: S,
    chain: Arc<C>,
    validator: TransferValidator<S, C>,
    in_process: Arc<Mutex<HashSet<u64>>>,
}

impl<S, C> Clone for TransferQueue<S, C>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            store: self.store.clone(),
            chain: self.chain.clone(),
            validator: self.validator.clone(),
            in_process: self.in_process.clone(),
        }
    }
}

impl<S, C> TransferQueue<S, C>
where
    S: TransferStore + 'static,
    C: EscrowOracle + TransferSubmitter + 'static,
{
    /// Creates a new TransferQueue instance.
    ///
    /// # Arguments
    ///
    /// * `ctx` - RelayerContext reference that holds the configuration
    /// * `store` - The transfer store
    /// * `chain` - The escrow chain gateway used for oracle reads and submissions
    pub fn new(ctx: RelayerContext, store: S, chain: Arc<C>) -> Self {
        let validator =
            TransferValidator::new(store.clone(), chain.clone());
        Self {
            ctx,
            store,
            chain,
            validator,
            in_process: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Starts the queue scheduler.
    ///
    /// Returns a future that resolves `Ok(())` once a shutdown signal is
    /// received; store errors restart the loop with exponential backoff.
    pub async fn run(self) -> aion_relayer_utils::Result<()> {
        let tick =
            Duration::from_secs(self.ctx.config.queue.tick_interval_secs);
        let backoff = backoff::ExponentialBackoff {
            max_elapsed_time: None,
            ..Default::default()
        };
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::TxQueue,
            max_concurrent = self.ctx.processing().max(),
            starting = true,
        );
        let task = || async {
            let mut shutdown = self.ctx.shutdown_signal();
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.ctx.processing().notified() => {}
                    _ = shutdown.recv() => {
                        tracing::event!(
                            target: probe::TARGET,
                            tracing::Level::DEBUG,
                            kind = %probe::Kind::TxQueue,
                            shutdown = true,
                        );
                        return Ok::<(), backoff::Error<aion_relayer_utils::Error>>(());
                    }
                }
                self.requeue_retryable()
                    .map_err(backoff::Error::<aion_relayer_utils::Error>::transient)?;
                self.fill_free_slots()
                    .map_err(backoff::Error::<aion_relayer_utils::Error>::transient)?;
            }
        };
        backoff::future::retry::<(), _, _, _, _>(backoff, task).await?;
        Ok(())
    }

    /// Flips `failed` transfers whose exponential backoff has elapsed back
    /// to `validated` so the next round picks them up.
    ///
    /// The backoff threshold of `2^retry_count` seconds is measured from
    /// the transfer's most recent failure event, not from its creation.
    fn requeue_retryable(&self) -> aion_relayer_utils::Result<()> {
        let max_retries = self.ctx.config.queue.max_retries;
        let rows =
            self.store.list_retryable(max_retries, RETRY_SCAN_LIMIT)?;
        let now = aion_relayer_store::now_ms();
        for row in rows {
            let error = row.error_message.as_deref().unwrap_or_default();
            if !is_retryable_error(error) {
                continue;
            }
            let last_failure = self
                .store
                .list_events(row.id)?
                .iter()
                .rev()
                .find(|e| e.status == "failed" || e.status == "retry")
                .map(|e| e.timestamp)
                .unwrap_or(row.created_at);
            let backoff_ms = (1u64 << row.retry_count.min(32)) * 1000;
            if now.saturating_sub(last_failure) < backoff_ms {
                continue;
            }
            self.store.update_status(
                row.id,
                TransferStatus::Validated,
                TransferUpdate::default(),
            )?;
            self.store.append_event(
                row.id,
                "retry_queued",
                &format!("Retry {} of {}", row.retry_count, max_retries),
                None,
            )?;
            self.emit(
                row.id,
                "retry_queued",
                serde_json::json!({
                    "transferId": row.id,
                    "retryCount": row.retry_count,
                }),
            );
            self.ctx.metrics.transfers_retried.inc();
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::DEBUG,
                kind = %probe::Kind::Retry,
                transfer_id = row.id,
                retry_count = row.retry_count,
                requeued = true,
            );
        }
        Ok(())
    }

    /// Launches one execution slot per `validated` transfer, oldest first,
    /// up to the free capacity this instant.
    fn fill_free_slots(&self) -> aion_relayer_utils::Result<()> {
        let free = self.ctx.processing().free_slots();
        if free == 0 {
            return Ok(());
        }
        let batch = self.store.list_by_status(
            TransferStatus::Validated,
            free,
            true,
        )?;
        for row in batch {
            self.spawn_slot(row.id);
        }
        Ok(())
    }

    /// Spawns the execution slot for one transfer. The per-id guard makes
    /// this a no-op when another slot already owns the id; the slot count
    /// is released on completion regardless of the outcome.
    fn spawn_slot(&self, id: u64) {
        if !self.in_process.lock().insert(id) {
            return;
        }
        self.ctx.processing().begin();
        self.ctx.metrics.in_flight_executions.inc();
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.execute_transfer(id).await {
                // the executor records every outcome in the store; an
                // error here means the store itself failed mid-flight.
                tracing::error!(
                    transfer_id = id,
                    "Execution slot could not record its outcome: {e}"
                );
            }
            this.in_process.lock().remove(&id);
            this.ctx.metrics.in_flight_executions.dec();
            this.ctx.processing().finish();
        });
    }

    /// Emits a lifecycle event globally and on the transfer's topic.
    pub(crate) fn emit(
        &self,
        transfer_id: u64,
        event_type: &str,
        data: serde_json::Value,
    ) {
        let event = BusEvent::new(event_type, data);
        self.ctx
            .bus()
            .publish(&aion_event_bus::transfer_topic(transfer_id), event.clone());
        self.ctx.bus().broadcast(event);
    }
}
