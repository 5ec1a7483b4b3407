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

//! # Relayer Store Module
//!
//! Durable persistence for signed transfers and their append-only event
//! log. The store is the source of truth for the transfer state machine;
//! nonce uniqueness is enforced here, at the storage layer, not in
//! application code.

use ethereum_types::{Address, H256};
use ethers::types::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use aion_relayer_utils::Result;

/// A module for managing in-memory storage of transfers.
pub mod mem;
/// A module for setting up and managing a [Sled](https://sled.rs)-based database.
pub mod sled;

/// A store that uses [`sled`](https://sled.rs) as the backend.
pub use self::sled::SledStore;
/// A store that uses in memory data structures as the backend.
pub use mem::InMemoryStore;

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

/// The lifecycle state of a transfer.
///
/// ```text
///                          permanently_failed (terminal)
///                         /
/// received -> validated -> pending -> confirmed (terminal)
///                 ^           |
///                 |           v
///                 +------- failed
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Accepted by the ingress API, not yet validated.
    Received,
    /// Passed validation and waiting for an execution slot.
    Validated,
    /// Broadcast to the chain, waiting for a receipt.
    Pending,
    /// The receipt was seen with a success status. Terminal.
    Confirmed,
    /// Execution failed; the retry scheduler may re-queue it.
    Failed,
    /// A non-recoverable failure such as an expired deadline. Terminal.
    PermanentlyFailed,
}

impl TransferStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::PermanentlyFailed)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        };
        write!(f, "{s}")
    }
}

/// A signed transfer authorization accepted by the relayer, together with
/// its execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransfer {
    /// Store-assigned identity.
    pub id: u64,
    /// The 32-byte opaque nonce chosen by the signer. Globally unique.
    pub nonce: H256,
    /// The fund owner that signed the authorization.
    pub from: Address,
    /// The recipient of the transfer.
    pub to: Address,
    /// Amount as a decimal string in whole units of the asset.
    pub amount: String,
    /// Unix seconds after which the authorization is void.
    pub deadline: u64,
    /// The EIP-712 signature over the transfer payload.
    pub signature: Bytes,
    /// The escrow contract this transfer settles against.
    pub contract_address: Address,
    /// The ERC-20 token being transferred; `None` means the native asset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_address: Option<Address>,
    /// Current lifecycle state.
    pub status: TransferStatus,
    /// Hash of the submitted transaction, once known.
    pub tx_hash: Option<H256>,
    /// Block that mined the transaction, once confirmed.
    pub block_number: Option<u64>,
    /// How many times execution has been retried. Monotonic.
    pub retry_count: u32,
    /// Human-readable reason of the most recent failure.
    pub error_message: Option<String>,
    /// Unix ms when the transfer was accepted.
    pub created_at: u64,
    /// Unix ms when validation passed.
    pub validated_at: Option<u64>,
    /// Unix ms when the transaction was broadcast.
    pub submitted_at: Option<u64>,
    /// Unix ms when the receipt was recorded.
    pub confirmed_at: Option<u64>,
}

/// The payload of a transfer submission, before the store assigns an id
/// and execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransfer {
    /// The 32-byte opaque nonce chosen by the signer.
    pub nonce: H256,
    /// The fund owner that signed the authorization.
    pub from: Address,
    /// The recipient of the transfer.
    pub to: Address,
    /// Amount as a decimal string in whole units of the asset.
    pub amount: String,
    /// Unix seconds after which the authorization is void.
    pub deadline: u64,
    /// The EIP-712 signature over the transfer payload.
    pub signature: Bytes,
    /// The escrow contract this transfer settles against.
    pub contract_address: Address,
    /// The ERC-20 token being transferred; `None` means the native asset.
    pub token_address: Option<Address>,
}

/// An entry of the append-only per-transfer audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    /// Store-assigned identity.
    pub id: u64,
    /// The transfer this event belongs to.
    pub transfer_id: u64,
    /// The transition target, or a sub-state like `retry`.
    pub status: String,
    /// Human-readable description of the transition.
    pub message: String,
    /// Optional structured details, e.g. `{txHash, blockNumber, gasUsed}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Unix ms when the event was recorded.
    pub timestamp: u64,
}

/// A partial update applied together with a status transition.
///
/// Only the provided fields change; `tx_hash` and `block_number` are never
/// cleared once set.
#[derive(Debug, Clone, Default)]
pub struct TransferUpdate {
    /// Hash of the submitted transaction.
    pub tx_hash: Option<H256>,
    /// Block that mined the transaction.
    pub block_number: Option<u64>,
    /// New retry counter. Ignored when lower than the stored one.
    pub retry_count: Option<u32>,
    /// Failure reason to record.
    pub error_message: Option<String>,
}

impl TransferUpdate {
    /// An update that only records a failure reason.
    pub fn with_error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Durable storage of transfers and their event log.
///
/// All relayer components mutate transfer state exclusively through these
/// operations.
pub trait TransferStore: Clone + Send + Sync {
    /// Persists a validated submission and returns its assigned id.
    ///
    /// The write is atomic: the row lands in [`TransferStatus::Validated`]
    /// (ingress only persists transfers that already passed validation)
    /// with its `received` and `validated` events appended in the same
    /// transaction. A duplicate nonce fails the whole write with
    /// [`aion_relayer_utils::Error::NonceAlreadyUsed`].
    fn insert_received(&self, transfer: &NewTransfer) -> Result<u64>;

    /// Applies a status transition plus a partial field update, stamping
    /// `validated_at`/`submitted_at`/`confirmed_at` on the matching
    /// transitions. Transitions out of a terminal state are ignored and
    /// return the stored row unchanged.
    fn update_status(
        &self,
        id: u64,
        status: TransferStatus,
        update: TransferUpdate,
    ) -> Result<SignedTransfer>;

    /// Looks a transfer up by id.
    fn find_by_id(&self, id: u64) -> Result<Option<SignedTransfer>>;

    /// Looks a transfer up by its nonce.
    fn find_by_nonce(&self, nonce: &H256) -> Result<Option<SignedTransfer>>;

    /// Lists transfers in the given status, ordered by `created_at`
    /// ascending so queueing stays fair.
    fn list_by_status(
        &self,
        status: TransferStatus,
        limit: usize,
        exclude_permanently_failed: bool,
    ) -> Result<Vec<SignedTransfer>>;

    /// Lists `failed` transfers that still have retry budget.
    fn list_retryable(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<SignedTransfer>>;

    /// Lists transfers where `address` is the sender or the recipient,
    /// newest first.
    fn list_for_address(
        &self,
        address: Address,
        limit: usize,
    ) -> Result<Vec<SignedTransfer>>;

    /// Appends an entry to the transfer's audit log. Entries are never
    /// mutated afterwards.
    fn append_event(
        &self,
        transfer_id: u64,
        status: &str,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<TransferEvent>;

    /// The transfer's audit log, oldest first.
    fn list_events(&self, transfer_id: u64) -> Result<Vec<TransferEvent>>;

    /// Number of transfers currently in the given status.
    fn count_by_status(&self, status: TransferStatus) -> Result<usize>;
}

impl SignedTransfer {
    /// The signed payload of this row, as re-validation consumes it.
    pub fn payload(&self) -> NewTransfer {
        NewTransfer {
            nonce: self.nonce,
            from: self.from,
            to: self.to,
            amount: self.amount.clone(),
            deadline: self.deadline,
            signature: self.signature.clone(),
            contract_address: self.contract_address,
            token_address: self.token_address,
        }
    }

    /// Builds the stored row for a freshly accepted submission.
    pub(crate) fn from_new(id: u64, new: &NewTransfer, now: u64) -> Self {
        Self {
            id,
            nonce: new.nonce,
            from: new.from,
            to: new.to,
            amount: new.amount.clone(),
            deadline: new.deadline,
            signature: new.signature.clone(),
            contract_address: new.contract_address,
            token_address: new.token_address,
            status: TransferStatus::Validated,
            tx_hash: None,
            block_number: None,
            retry_count: 0,
            error_message: None,
            created_at: now,
            validated_at: Some(now),
            submitted_at: None,
            confirmed_at: None,
        }
    }

    /// Applies a status transition and partial update in place, stamping
    /// the transition timestamps. Shared by the store backends so their
    /// transition semantics cannot drift apart.
    pub(crate) fn apply_update(
        &mut self,
        status: TransferStatus,
        update: &TransferUpdate,
        now: u64,
    ) {
        match status {
            TransferStatus::Validated => {
                self.validated_at = Some(now);
            }
            TransferStatus::Pending => {}
            TransferStatus::Confirmed => {
                self.confirmed_at = Some(now);
            }
            _ => {}
        }
        // submitted_at is stamped when the tx hash first becomes known,
        // which happens while the row is still moving into `pending`.
        if update.tx_hash.is_some() && self.submitted_at.is_none() {
            self.submitted_at = Some(now);
        }
        if let Some(tx_hash) = update.tx_hash {
            if self.tx_hash.is_none() {
                self.tx_hash = Some(tx_hash);
            }
        }
        if let Some(block_number) = update.block_number {
            if self.block_number.is_none() {
                self.block_number = Some(block_number);
            }
        }
        if let Some(retry_count) = update.retry_count {
            // retry_count is monotonic non-decreasing
            self.retry_count = self.retry_count.max(retry_count);
        }
        if let Some(ref error_message) = update.error_message {
            self.error_message = Some(error_message.clone());
        }
        self.status = status;
    }
}
