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

//! One execution slot: re-validation, submission, receipt handling.
//!
//! Every outcome is recorded as a state transition plus an audit event;
//! the slot never propagates an error unless the store itself fails.

use ethers::types::U256;

use aion_chain_gateway::{EscrowOracle, EscrowTransfer, TransferSubmitter};
use aion_relayer_store::{
    SignedTransfer, TransferStatus, TransferStore, TransferUpdate,
};
use aion_relayer_utils::clickable_link::ClickableLink;
use aion_relayer_utils::probe;

use crate::classify::{is_permanent_validation_error, is_retryable_error};
use crate::TransferQueue;

impl<S, C> TransferQueue<S, C>
where
    S: TransferStore + 'static,
    C: EscrowOracle + TransferSubmitter + 'static,
{
    /// Executes one transfer end-to-end. Idempotent: safe to call again
    /// after crashes, races with other slots, or the chain having already
    /// executed the transfer.
    pub async fn execute_transfer(
        &self,
        id: u64,
    ) -> aion_relayer_utils::Result<()> {
        let Some(row) = self.store.find_by_id(id)? else {
            tracing::warn!(transfer_id = id, "Transfer vanished before execution");
            return Ok(());
        };
        // another worker may have advanced the row since it was listed
        if row.status != TransferStatus::Validated {
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::DEBUG,
                kind = %probe::Kind::TxQueue,
                transfer_id = id,
                status = %row.status,
                skipped = "not in validated state",
            );
            return Ok(());
        }

        // exclude this row's own nonce from the store-side uniqueness check
        let report =
            self.validator.validate(&row.payload(), Some(id)).await?;
        if !report.is_valid() {
            // The chain may have executed this transfer while we believed
            // it pending: the nonce reads as consumed, but we hold the tx
            // hash and block of our own submission.
            if report.failed_only_on_chain_nonce()
                && row.tx_hash.is_some()
                && row.block_number.is_some()
            {
                return self.recover_confirmed(&row);
            }
            let error = report.errors.join("; ");
            if is_permanent_validation_error(&report.errors) {
                return self.record_permanent_failure(&row, error);
            }
            return self.record_execution_error(&row, error);
        }

        let amount = match self
            .validator
            .amount_in_smallest_unit(&row.amount, row.token_address)
            .await
        {
            Ok(amount) => amount,
            Err(e) => {
                return self.record_execution_error(
                    &row,
                    format!("Failed to check token decimals: {e}"),
                )
            }
        };

        self.store.update_status(
            id,
            TransferStatus::Pending,
            TransferUpdate::default(),
        )?;
        self.store
            .append_event(id, "pending", "Executing transfer", None)?;
        self.emit(
            id,
            "payment_pending",
            serde_json::json!({ "transferId": id }),
        );

        let escrow_transfer = EscrowTransfer {
            token: row.token_address,
            from: row.from,
            to: row.to,
            amount,
            nonce: row.nonce,
            deadline: U256::from(row.deadline),
            signature: row.signature.clone(),
        };
        let tx_hash = match self.chain.submit_transfer(&escrow_transfer).await
        {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                return self.record_execution_error(&row, e.to_string())
            }
        };

        // the hash is durable before we wait on the chain, so a crash here
        // is recoverable through the nonce check above
        self.store.update_status(
            id,
            TransferStatus::Pending,
            TransferUpdate {
                tx_hash: Some(tx_hash),
                ..Default::default()
            },
        )?;
        self.store.append_event(
            id,
            "submitted",
            "Transaction submitted",
            Some(serde_json::json!({ "txHash": tx_hash })),
        )?;
        self.emit(
            id,
            "payment_submitted",
            serde_json::json!({ "transferId": id, "txHash": tx_hash }),
        );
        self.ctx.metrics.transfers_submitted.inc();
        let tx_hash_string = format!("{tx_hash:#x}");
        if let Some(mut url) = self.ctx.config.evm.explorer.clone() {
            url.set_path(&format!("tx/{tx_hash_string}"));
            let clickable_link =
                ClickableLink::new(&tx_hash_string, url.as_str());
            tracing::info!("Tx {} is submitted and pending!", clickable_link);
        } else {
            tracing::info!("Tx {} is submitted and pending!", tx_hash_string);
        }

        let receipt = match self.chain.wait_for_receipt(tx_hash).await {
            Ok(receipt) => receipt,
            Err(e) => {
                return self.record_execution_error(&row, e.to_string())
            }
        };

        if !receipt.success {
            // a revert is contract-side rejection that will repeat, so it
            // is recorded terminally rather than retried
            self.store.update_status(
                id,
                TransferStatus::Failed,
                TransferUpdate::with_error("Transaction reverted"),
            )?;
            self.store.append_event(
                id,
                "failed",
                "Transaction reverted",
                Some(serde_json::json!({ "txHash": tx_hash })),
            )?;
            self.emit(
                id,
                "payment_failed",
                serde_json::json!({
                    "transferId": id,
                    "error": "Transaction reverted",
                }),
            );
            self.ctx.metrics.transfers_failed.inc();
            return Ok(());
        }

        self.store.update_status(
            id,
            TransferStatus::Confirmed,
            TransferUpdate {
                block_number: Some(receipt.block_number),
                ..Default::default()
            },
        )?;
        self.store.append_event(
            id,
            "confirmed",
            "Transfer confirmed",
            Some(serde_json::json!({
                "txHash": receipt.transaction_hash,
                "blockNumber": receipt.block_number,
                "gasUsed": receipt.gas_used,
            })),
        )?;
        self.emit(
            id,
            "payment_confirmed",
            serde_json::json!({
                "transferId": id,
                "txHash": receipt.transaction_hash,
                "blockNumber": receipt.block_number,
            }),
        );
        self.ctx.metrics.transfers_confirmed.inc();
        self.ctx
            .metrics
            .gas_spent
            .inc_by(receipt.gas_used.as_u128() as f64);
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::TxQueue,
            transfer_id = id,
            tx_hash = %tx_hash,
            finalized = true,
        );
        Ok(())
    }

    /// The crash-race success branch: the chain consumed our nonce and we
    /// hold the submission's hash and block, so the transfer is confirmed
    /// without a second submission.
    fn recover_confirmed(
        &self,
        row: &SignedTransfer,
    ) -> aion_relayer_utils::Result<()> {
        self.store.update_status(
            row.id,
            TransferStatus::Confirmed,
            TransferUpdate::default(),
        )?;
        self.store.append_event(
            row.id,
            "confirmed",
            "Transfer already executed on-chain",
            Some(serde_json::json!({
                "txHash": row.tx_hash,
                "blockNumber": row.block_number,
            })),
        )?;
        self.emit(
            row.id,
            "payment_confirmed",
            serde_json::json!({
                "transferId": row.id,
                "txHash": row.tx_hash,
                "blockNumber": row.block_number,
            }),
        );
        self.ctx.metrics.transfers_confirmed.inc();
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::TxQueue,
            transfer_id = row.id,
            recovered = true,
        );
        Ok(())
    }

    /// Records a non-recoverable failure. No retry will follow.
    fn record_permanent_failure(
        &self,
        row: &SignedTransfer,
        error: String,
    ) -> aion_relayer_utils::Result<()> {
        self.store.update_status(
            row.id,
            TransferStatus::PermanentlyFailed,
            TransferUpdate::with_error(error.clone()),
        )?;
        self.store.append_event(
            row.id,
            "permanently_failed",
            &error,
            None,
        )?;
        self.emit(
            row.id,
            "payment_failed",
            serde_json::json!({
                "transferId": row.id,
                "error": error,
                "permanent": true,
            }),
        );
        self.ctx.metrics.transfers_failed.inc();
        Ok(())
    }

    /// Records an execution error, bumping the retry counter when the
    /// error is retryable and budget remains; the scheduler re-queues the
    /// transfer once `2^retry_count` seconds have elapsed.
    fn record_execution_error(
        &self,
        row: &SignedTransfer,
        error: String,
    ) -> aion_relayer_utils::Result<()> {
        let max_retries = self.ctx.config.queue.max_retries;
        if is_retryable_error(&error) && row.retry_count < max_retries {
            let retry_count = row.retry_count + 1;
            self.store.update_status(
                row.id,
                TransferStatus::Failed,
                TransferUpdate {
                    retry_count: Some(retry_count),
                    error_message: Some(error.clone()),
                    ..Default::default()
                },
            )?;
            self.store.append_event(
                row.id,
                "retry",
                &format!("Attempt {retry_count} failed: {error}"),
                Some(serde_json::json!({ "retryCount": retry_count })),
            )?;
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::DEBUG,
                kind = %probe::Kind::Retry,
                transfer_id = row.id,
                retry_count,
                error = %error,
            );
            return Ok(());
        }
        self.store.update_status(
            row.id,
            TransferStatus::Failed,
            TransferUpdate::with_error(error.clone()),
        )?;
        self.store.append_event(row.id, "failed", &error, None)?;
        self.emit(
            row.id,
            "payment_failed",
            serde_json::json!({ "transferId": row.id, "error": error }),
        );
        self.ctx.metrics.transfers_failed.inc();
        Ok(())
    }
}
