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

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ethereum_types::{Address, H256};
use parking_lot::RwLock;

use crate::{
    NewTransfer, SignedTransfer, TransferEvent, TransferStatus,
    TransferStore, TransferUpdate,
};
use aion_relayer_utils::Error;

#[derive(Default)]
struct Inner {
    transfers: BTreeMap<u64, SignedTransfer>,
    nonces: HashMap<H256, u64>,
    events: BTreeMap<u64, Vec<TransferEvent>>,
    last_transfer_idx: u64,
    last_event_idx: u64,
}

/// InMemoryStore keeps transfers in process memory, with the same
/// semantics as [`crate::SledStore`]. Useful for tests and components
/// that do not need durability.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl Inner {
    fn push_event(
        &mut self,
        transfer_id: u64,
        status: &str,
        message: &str,
        metadata: Option<serde_json::Value>,
        now: u64,
    ) -> TransferEvent {
        self.last_event_idx += 1;
        let event = TransferEvent {
            id: self.last_event_idx,
            transfer_id,
            status: status.to_string(),
            message: message.to_string(),
            metadata,
            timestamp: now,
        };
        self.events
            .entry(transfer_id)
            .or_default()
            .push(event.clone());
        event
    }
}

impl TransferStore for InMemoryStore {
    fn insert_received(&self, transfer: &NewTransfer) -> crate::Result<u64> {
        let mut inner = self.inner.write();
        if inner.nonces.contains_key(&transfer.nonce) {
            return Err(Error::NonceAlreadyUsed);
        }
        let now = crate::now_ms();
        inner.last_transfer_idx += 1;
        let id = inner.last_transfer_idx;
        let row = SignedTransfer::from_new(id, transfer, now);
        inner.transfers.insert(id, row);
        inner.nonces.insert(transfer.nonce, id);
        inner.push_event(id, "received", "Transfer received", None, now);
        inner.push_event(id, "validated", "Transfer validated", None, now);
        Ok(id)
    }

    fn update_status(
        &self,
        id: u64,
        status: TransferStatus,
        update: TransferUpdate,
    ) -> crate::Result<SignedTransfer> {
        let mut inner = self.inner.write();
        let now = crate::now_ms();
        let row = inner
            .transfers
            .get_mut(&id)
            .ok_or(Error::TransferNotFound { id })?;
        if row.status.is_terminal() {
            tracing::warn!(
                id,
                current = %row.status,
                requested = %status,
                "Refusing status update of a terminal transfer",
            );
            return Ok(row.clone());
        }
        row.apply_update(status, &update, now);
        Ok(row.clone())
    }

    fn find_by_id(&self, id: u64) -> crate::Result<Option<SignedTransfer>> {
        Ok(self.inner.read().transfers.get(&id).cloned())
    }

    fn find_by_nonce(
        &self,
        nonce: &H256,
    ) -> crate::Result<Option<SignedTransfer>> {
        let inner = self.inner.read();
        Ok(inner
            .nonces
            .get(nonce)
            .and_then(|id| inner.transfers.get(id))
            .cloned())
    }

    fn list_by_status(
        &self,
        status: TransferStatus,
        limit: usize,
        exclude_permanently_failed: bool,
    ) -> crate::Result<Vec<SignedTransfer>> {
        Ok(self
            .inner
            .read()
            .transfers
            .values()
            .filter(|row| row.status == status)
            .filter(|row| {
                !exclude_permanently_failed
                    || row.status != TransferStatus::PermanentlyFailed
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn list_retryable(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> crate::Result<Vec<SignedTransfer>> {
        Ok(self
            .inner
            .read()
            .transfers
            .values()
            .filter(|row| {
                row.status == TransferStatus::Failed
                    && row.retry_count < max_retries
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn list_for_address(
        &self,
        address: Address,
        limit: usize,
    ) -> crate::Result<Vec<SignedTransfer>> {
        Ok(self
            .inner
            .read()
            .transfers
            .values()
            .rev()
            .filter(|row| row.from == address || row.to == address)
            .take(limit)
            .cloned()
            .collect())
    }

    fn append_event(
        &self,
        transfer_id: u64,
        status: &str,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> crate::Result<TransferEvent> {
        let mut inner = self.inner.write();
        let now = crate::now_ms();
        Ok(inner.push_event(transfer_id, status, message, metadata, now))
    }

    fn list_events(
        &self,
        transfer_id: u64,
    ) -> crate::Result<Vec<TransferEvent>> {
        Ok(self
            .inner
            .read()
            .events
            .get(&transfer_id)
            .cloned()
            .unwrap_or_default())
    }

    fn count_by_status(
        &self,
        status: TransferStatus,
    ) -> crate::Result<usize> {
        Ok(self
            .inner
            .read()
            .transfers
            .values()
            .filter(|row| row.status == status)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Bytes;

    fn sample_transfer(nonce_byte: u8) -> NewTransfer {
        NewTransfer {
            nonce: H256::repeat_byte(nonce_byte),
            from: Address::repeat_byte(0xaa),
            to: Address::repeat_byte(0xbb),
            amount: "0.5".to_string(),
            deadline: 1_893_456_000,
            signature: Bytes::from(vec![0x1b; 65]),
            contract_address: Address::repeat_byte(0xcc),
            token_address: Some(Address::repeat_byte(0xdd)),
        }
    }

    #[test]
    fn mirrors_sled_insert_semantics() {
        let store = InMemoryStore::default();
        let id = store.insert_received(&sample_transfer(1)).unwrap();
        assert_eq!(id, 1);
        let row = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(row.status, TransferStatus::Validated);
        assert_eq!(row.token_address, Some(Address::repeat_byte(0xdd)));

        let err = store.insert_received(&sample_transfer(1)).unwrap_err();
        assert!(matches!(err, Error::NonceAlreadyUsed));
    }

    #[test]
    fn update_and_events_round_trip() {
        let store = InMemoryStore::default();
        let id = store.insert_received(&sample_transfer(1)).unwrap();
        store
            .update_status(
                id,
                TransferStatus::Pending,
                TransferUpdate::default(),
            )
            .unwrap();
        store
            .append_event(id, "pending", "Executing transfer", None)
            .unwrap();
        let events = store.list_events(id).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(store.count_by_status(TransferStatus::Pending).unwrap(), 1);
    }
}
