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

use std::io;
use std::path::Path;

use ethereum_types::{Address, H256};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use crate::{
    NewTransfer, SignedTransfer, TransferEvent, TransferStatus,
    TransferStore, TransferUpdate,
};
use aion_relayer_utils::Error;

const TRANSFERS_TREE: &str = "transfers";
const EVENTS_TREE: &str = "transfer_events";

const TRANSFER_PREFIX: &[u8] = b"transfer/";
const NONCE_PREFIX: &[u8] = b"nonce/";
const EVENT_PREFIX: &[u8] = b"event/";
const LAST_TRANSFER_IDX: &[u8] = b"last_transfer_idx";
const LAST_EVENT_IDX: &[u8] = b"last_event_idx";

/// SledStore is a store that persists transfers and their event log in a
/// [Sled](https://sled.rs)-based database.
///
/// Layout: a `transfers` tree holding the rows under `transfer/<id>`, the
/// nonce index under `nonce/<nonce>` (this index is the unique
/// constraint), and the id counter; a `transfer_events` tree holding the
/// append-only log under `event/<transfer-id>/<event-id>`. Ids are
/// big-endian so iteration order equals insertion order.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

fn transfer_key(id: u64) -> Vec<u8> {
    let mut key = TRANSFER_PREFIX.to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn nonce_key(nonce: &H256) -> Vec<u8> {
    let mut key = NONCE_PREFIX.to_vec();
    key.extend_from_slice(nonce.as_bytes());
    key
}

fn event_prefix(transfer_id: u64) -> Vec<u8> {
    let mut key = EVENT_PREFIX.to_vec();
    key.extend_from_slice(&transfer_id.to_be_bytes());
    key
}

fn event_key(transfer_id: u64, event_id: u64) -> Vec<u8> {
    let mut key = event_prefix(transfer_id);
    key.extend_from_slice(&event_id.to_be_bytes());
    key
}

fn read_counter(value: Option<sled::IVec>) -> u64 {
    match value {
        Some(v) => {
            let mut output = [0u8; 8];
            output.copy_from_slice(&v);
            u64::from_be_bytes(output)
        }
        None => 0u64,
    }
}

fn abort<T>(
    kind: io::ErrorKind,
    msg: impl Into<String>,
) -> Result<T, ConflictableTransactionError<io::Error>> {
    Err(ConflictableTransactionError::Abort(io::Error::new(
        kind,
        msg.into(),
    )))
}

fn encode<T: serde::Serialize>(
    value: &T,
) -> Result<Vec<u8>, ConflictableTransactionError<io::Error>> {
    serde_json::to_vec(value).map_err(|e| {
        ConflictableTransactionError::Abort(io::Error::new(
            io::ErrorKind::InvalidData,
            e,
        ))
    })
}

impl SledStore {
    /// Create a new SledStore.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .temporary(cfg!(test))
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Ok(Self { db })
    }

    /// Creates a temporary SledStore.
    pub fn temporary() -> crate::Result<Self> {
        let dir = tempfile::tempdir()?;
        Self::open(dir.path())
    }

    /// Gets the total amount of data stored on disk
    pub fn get_data_stored_size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or_default()
    }

    fn transfers(&self) -> crate::Result<sled::Tree> {
        Ok(self.db.open_tree(TRANSFERS_TREE)?)
    }

    fn events(&self) -> crate::Result<sled::Tree> {
        Ok(self.db.open_tree(EVENTS_TREE)?)
    }

    fn scan_transfers(
        &self,
    ) -> crate::Result<impl DoubleEndedIterator<Item = SignedTransfer>> {
        let tree = self.transfers()?;
        Ok(tree
            .scan_prefix(TRANSFER_PREFIX)
            .flatten()
            .filter_map(|(_, v)| serde_json::from_slice(&v).ok()))
    }
}

impl TransferStore for SledStore {
    #[tracing::instrument(skip(self, transfer), fields(nonce = %transfer.nonce))]
    fn insert_received(&self, transfer: &NewTransfer) -> crate::Result<u64> {
        let transfers = self.transfers()?;
        let events = self.events()?;
        let now = crate::now_ms();
        // the row, its nonce index entry, and its first two audit events
        // all land in one transaction, so a failing ingest never leaves a
        // partial row behind.
        let result = (&transfers, &events).transaction(|(t, e)| {
            if t.get(nonce_key(&transfer.nonce))?.is_some() {
                return abort(
                    io::ErrorKind::AlreadyExists,
                    "nonce already used",
                );
            }
            let id = read_counter(t.get(LAST_TRANSFER_IDX)?) + 1;
            t.insert(LAST_TRANSFER_IDX, &id.to_be_bytes())?;

            let row = SignedTransfer::from_new(id, transfer, now);
            t.insert(transfer_key(id), encode(&row)?)?;
            t.insert(nonce_key(&transfer.nonce), &id.to_be_bytes())?;

            let mut event_id = read_counter(e.get(LAST_EVENT_IDX)?);
            for (status, message) in [
                ("received", "Transfer received"),
                ("validated", "Transfer validated"),
            ] {
                event_id += 1;
                let event = TransferEvent {
                    id: event_id,
                    transfer_id: id,
                    status: status.to_string(),
                    message: message.to_string(),
                    metadata: None,
                    timestamp: now,
                };
                e.insert(event_key(id, event_id), encode(&event)?)?;
            }
            e.insert(LAST_EVENT_IDX, &event_id.to_be_bytes())?;
            Ok(id)
        });
        match result {
            Ok(id) => {
                // flush the db to make sure we don't lose anything.
                self.db.flush()?;
                Ok(id)
            }
            Err(TransactionError::Abort(e))
                if e.kind() == io::ErrorKind::AlreadyExists =>
            {
                Err(Error::NonceAlreadyUsed)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self, update), fields(id = id, status = %status))]
    fn update_status(
        &self,
        id: u64,
        status: TransferStatus,
        update: TransferUpdate,
    ) -> crate::Result<SignedTransfer> {
        let transfers = self.transfers()?;
        let now = crate::now_ms();
        let result = transfers.transaction(|t| {
            let key = transfer_key(id);
            let bytes = match t.get(&key)? {
                Some(bytes) => bytes,
                None => {
                    return abort(io::ErrorKind::NotFound, "missing transfer")
                }
            };
            let mut row: SignedTransfer =
                serde_json::from_slice(&bytes).map_err(|e| {
                    ConflictableTransactionError::Abort(io::Error::new(
                        io::ErrorKind::InvalidData,
                        e,
                    ))
                })?;
            if row.status.is_terminal() {
                // confirmed and permanently_failed rows never mutate
                return Ok(row);
            }
            row.apply_update(status, &update, now);
            t.insert(key.as_slice(), encode(&row)?)?;
            Ok(row)
        });
        match result {
            Ok(row) => {
                if row.status != status {
                    tracing::warn!(
                        id,
                        current = %row.status,
                        requested = %status,
                        "Refusing status update of a terminal transfer",
                    );
                }
                self.db.flush()?;
                Ok(row)
            }
            Err(TransactionError::Abort(e))
                if e.kind() == io::ErrorKind::NotFound =>
            {
                Err(Error::TransferNotFound { id })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_id(&self, id: u64) -> crate::Result<Option<SignedTransfer>> {
        let transfers = self.transfers()?;
        match transfers.get(transfer_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_by_nonce(
        &self,
        nonce: &H256,
    ) -> crate::Result<Option<SignedTransfer>> {
        let transfers = self.transfers()?;
        match transfers.get(nonce_key(nonce))? {
            Some(id_bytes) => self.find_by_id(read_counter(Some(id_bytes))),
            None => Ok(None),
        }
    }

    fn list_by_status(
        &self,
        status: TransferStatus,
        limit: usize,
        exclude_permanently_failed: bool,
    ) -> crate::Result<Vec<SignedTransfer>> {
        Ok(self
            .scan_transfers()?
            .filter(|row| row.status == status)
            .filter(|row| {
                !exclude_permanently_failed
                    || row.status != TransferStatus::PermanentlyFailed
            })
            .take(limit)
            .collect())
    }

    fn list_retryable(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> crate::Result<Vec<SignedTransfer>> {
        Ok(self
            .scan_transfers()?
            .filter(|row| {
                row.status == TransferStatus::Failed
                    && row.retry_count < max_retries
            })
            .take(limit)
            .collect())
    }

    fn list_for_address(
        &self,
        address: Address,
        limit: usize,
    ) -> crate::Result<Vec<SignedTransfer>> {
        Ok(self
            .scan_transfers()?
            .rev()
            .filter(|row| row.from == address || row.to == address)
            .take(limit)
            .collect())
    }

    #[tracing::instrument(skip(self, message, metadata), fields(transfer_id = transfer_id, status = status))]
    fn append_event(
        &self,
        transfer_id: u64,
        status: &str,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> crate::Result<TransferEvent> {
        let events = self.events()?;
        let now = crate::now_ms();
        let result = events.transaction(|e| {
            let event_id = read_counter(e.get(LAST_EVENT_IDX)?) + 1;
            e.insert(LAST_EVENT_IDX, &event_id.to_be_bytes())?;
            let event = TransferEvent {
                id: event_id,
                transfer_id,
                status: status.to_string(),
                message: message.to_string(),
                metadata: metadata.clone(),
                timestamp: now,
            };
            e.insert(event_key(transfer_id, event_id), encode(&event)?)?;
            Ok(event)
        });
        match result {
            Ok(event) => {
                self.db.flush()?;
                Ok(event)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_events(
        &self,
        transfer_id: u64,
    ) -> crate::Result<Vec<TransferEvent>> {
        let events = self.events()?;
        Ok(events
            .scan_prefix(event_prefix(transfer_id))
            .flatten()
            .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
            .collect())
    }

    fn count_by_status(
        &self,
        status: TransferStatus,
    ) -> crate::Result<usize> {
        Ok(self
            .scan_transfers()?
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
            amount: "1.0".to_string(),
            deadline: 1_893_456_000,
            signature: Bytes::from(vec![0x1b; 65]),
            contract_address: Address::repeat_byte(0xcc),
            token_address: None,
        }
    }

    #[test]
    fn insert_assigns_sequential_ids_and_stamps_validation() {
        let store = SledStore::temporary().unwrap();
        let id1 = store.insert_received(&sample_transfer(1)).unwrap();
        let id2 = store.insert_received(&sample_transfer(2)).unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);

        let row = store.find_by_id(id1).unwrap().unwrap();
        assert_eq!(row.status, TransferStatus::Validated);
        assert_eq!(row.validated_at, Some(row.created_at));
        assert_eq!(row.retry_count, 0);

        let events = store.list_events(id1).unwrap();
        let statuses: Vec<_> =
            events.iter().map(|e| e.status.as_str()).collect();
        assert_eq!(statuses, vec!["received", "validated"]);
    }

    #[test]
    fn duplicate_nonce_is_rejected_at_the_storage_layer() {
        let store = SledStore::temporary().unwrap();
        store.insert_received(&sample_transfer(7)).unwrap();
        let err = store.insert_received(&sample_transfer(7)).unwrap_err();
        assert!(matches!(err, Error::NonceAlreadyUsed));
        // the failed insert must not leave a row behind
        assert_eq!(
            store
                .list_by_status(TransferStatus::Validated, 10, true)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn find_by_nonce_resolves_through_the_index() {
        let store = SledStore::temporary().unwrap();
        let id = store.insert_received(&sample_transfer(9)).unwrap();
        let row = store
            .find_by_nonce(&H256::repeat_byte(9))
            .unwrap()
            .unwrap();
        assert_eq!(row.id, id);
        assert!(store
            .find_by_nonce(&H256::repeat_byte(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn update_status_stamps_transition_timestamps() {
        let store = SledStore::temporary().unwrap();
        let id = store.insert_received(&sample_transfer(1)).unwrap();

        let row = store
            .update_status(
                id,
                TransferStatus::Pending,
                TransferUpdate::default(),
            )
            .unwrap();
        assert_eq!(row.status, TransferStatus::Pending);
        assert!(row.submitted_at.is_none());

        let tx_hash = H256::repeat_byte(0x77);
        let row = store
            .update_status(
                id,
                TransferStatus::Pending,
                TransferUpdate {
                    tx_hash: Some(tx_hash),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(row.tx_hash, Some(tx_hash));
        assert!(row.submitted_at.is_some());

        let row = store
            .update_status(
                id,
                TransferStatus::Confirmed,
                TransferUpdate {
                    block_number: Some(42),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(row.status, TransferStatus::Confirmed);
        assert_eq!(row.block_number, Some(42));
        assert!(row.confirmed_at.is_some());
    }

    #[test]
    fn terminal_rows_never_mutate() {
        let store = SledStore::temporary().unwrap();
        let id = store.insert_received(&sample_transfer(1)).unwrap();
        let tx_hash = H256::repeat_byte(0x77);
        store
            .update_status(
                id,
                TransferStatus::Confirmed,
                TransferUpdate {
                    tx_hash: Some(tx_hash),
                    block_number: Some(42),
                    ..Default::default()
                },
            )
            .unwrap();

        let row = store
            .update_status(
                id,
                TransferStatus::Failed,
                TransferUpdate::with_error("should not apply"),
            )
            .unwrap();
        assert_eq!(row.status, TransferStatus::Confirmed);
        assert_eq!(row.tx_hash, Some(tx_hash));
        assert_eq!(row.block_number, Some(42));
        assert!(row.error_message.is_none());
    }

    #[test]
    fn retry_count_is_monotonic() {
        let store = SledStore::temporary().unwrap();
        let id = store.insert_received(&sample_transfer(1)).unwrap();
        let row = store
            .update_status(
                id,
                TransferStatus::Failed,
                TransferUpdate {
                    retry_count: Some(2),
                    error_message: Some("timeout".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(row.retry_count, 2);

        // a lower retry count cannot rewind the counter
        let row = store
            .update_status(
                id,
                TransferStatus::Validated,
                TransferUpdate {
                    retry_count: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(row.retry_count, 2);
    }

    #[test]
    fn list_by_status_is_ordered_and_limited() {
        let store = SledStore::temporary().unwrap();
        for i in 1..=5 {
            store.insert_received(&sample_transfer(i)).unwrap();
        }
        store
            .update_status(
                3,
                TransferStatus::Failed,
                TransferUpdate::with_error("boom"),
            )
            .unwrap();

        let rows = store
            .list_by_status(TransferStatus::Validated, 3, true)
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn list_retryable_respects_the_budget() {
        let store = SledStore::temporary().unwrap();
        for i in 1..=3 {
            store.insert_received(&sample_transfer(i)).unwrap();
        }
        store
            .update_status(
                1,
                TransferStatus::Failed,
                TransferUpdate {
                    retry_count: Some(1),
                    error_message: Some("timeout".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_status(
                2,
                TransferStatus::Failed,
                TransferUpdate {
                    retry_count: Some(3),
                    error_message: Some("timeout".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let rows = store.list_retryable(3, 10).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn list_for_address_returns_newest_first() {
        let store = SledStore::temporary().unwrap();
        for i in 1..=4 {
            store.insert_received(&sample_transfer(i)).unwrap();
        }
        let mut other = sample_transfer(5);
        other.from = Address::repeat_byte(0x11);
        other.to = Address::repeat_byte(0x22);
        store.insert_received(&other).unwrap();

        let rows = store
            .list_for_address(Address::repeat_byte(0xaa), 2)
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 3]);

        let rows = store
            .list_for_address(Address::repeat_byte(0x22), 10)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn events_are_append_only_and_ordered() {
        let store = SledStore::temporary().unwrap();
        let id = store.insert_received(&sample_transfer(1)).unwrap();
        store
            .append_event(id, "pending", "Executing transfer", None)
            .unwrap();
        store
            .append_event(
                id,
                "confirmed",
                "Transfer confirmed",
                Some(serde_json::json!({"txHash": "0x77", "blockNumber": 42})),
            )
            .unwrap();

        let events = store.list_events(id).unwrap();
        let statuses: Vec<_> =
            events.iter().map(|e| e.status.as_str()).collect();
        assert_eq!(
            statuses,
            vec!["received", "validated", "pending", "confirmed"]
        );
        let confirmed = events.last().unwrap();
        assert_eq!(
            confirmed.metadata.as_ref().unwrap()["blockNumber"],
            serde_json::json!(42)
        );
    }

    #[test]
    fn count_by_status_tracks_transitions() {
        let store = SledStore::temporary().unwrap();
        for i in 1..=3 {
            store.insert_received(&sample_transfer(i)).unwrap();
        }
        store
            .update_status(
                2,
                TransferStatus::Pending,
                TransferUpdate::default(),
            )
            .unwrap();
        assert_eq!(
            store.count_by_status(TransferStatus::Validated).unwrap(),
            2
        );
        assert_eq!(store.count_by_status(TransferStatus::Pending).unwrap(), 1);
    }
}
