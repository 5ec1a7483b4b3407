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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use parking_lot::Mutex;

use aion_chain_gateway::{
    EscrowOracle, EscrowTransfer, TransferReceipt, TransferSubmitter,
};
use aion_relayer_config::AionRelayerConfig;
use aion_relayer_context::RelayerContext;
use aion_relayer_store::{
    InMemoryStore, NewTransfer, TransferStatus, TransferStore,
    TransferUpdate,
};
use aion_relayer_utils::{Error, Result};
use aion_validator::eip712;

use crate::TransferQueue;

const CHAIN_ID: u64 = 31337;

fn contract_address() -> Address {
    Address::repeat_byte(0xcc)
}

struct MockChain {
    nonce_used: Mutex<bool>,
    native_locked: Mutex<U256>,
    submit_results: Mutex<VecDeque<Result<H256>>>,
    receipts: Mutex<VecDeque<Result<TransferReceipt>>>,
    submit_calls: AtomicUsize,
    receipt_delay: Duration,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            nonce_used: Mutex::new(false),
            native_locked: Mutex::new(U256::exp10(20)),
            submit_results: Mutex::new(VecDeque::new()),
            receipts: Mutex::new(VecDeque::new()),
            submit_calls: AtomicUsize::new(0),
            receipt_delay: Duration::ZERO,
        }
    }
}

#[async_trait::async_trait]
impl EscrowOracle for MockChain {
    async fn chain_id(&self) -> Result<u64> {
        Ok(CHAIN_ID)
    }
    async fn nonce_used(&self, _nonce: H256) -> Result<bool> {
        Ok(*self.nonce_used.lock())
    }
    async fn locked_funds_native(&self, _owner: Address) -> Result<U256> {
        Ok(*self.native_locked.lock())
    }
    async fn locked_funds_erc20(
        &self,
        _token: Address,
        _owner: Address,
    ) -> Result<U256> {
        Ok(*self.native_locked.lock())
    }
    async fn withdraw_timestamp(&self, _owner: Address) -> Result<U256> {
        Ok(U256::zero())
    }
    async fn token_decimals(&self, _token: Address) -> Result<u8> {
        Ok(18)
    }
}

#[async_trait::async_trait]
impl TransferSubmitter for MockChain {
    async fn submit_transfer(
        &self,
        _transfer: &EscrowTransfer,
    ) -> Result<H256> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.submit_results.lock().pop_front() {
            return result;
        }
        Ok(H256::repeat_byte(0x77))
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> Result<TransferReceipt> {
        tokio::time::sleep(self.receipt_delay).await;
        if let Some(result) = self.receipts.lock().pop_front() {
            return result;
        }
        Ok(TransferReceipt {
            transaction_hash: tx_hash,
            block_number: 42,
            gas_used: U256::from(21_000u64),
            success: true,
        })
    }

    async fn gas_price(&self) -> Result<U256> {
        Ok(U256::exp10(9))
    }
}

fn test_context(max_concurrent: usize) -> RelayerContext {
    let mut config = AionRelayerConfig::default();
    config.evm.chain_id = CHAIN_ID;
    config.evm.escrow_contract = Some(contract_address());
    config.queue.max_concurrent = max_concurrent;
    RelayerContext::new(config, None).unwrap()
}

fn queue_with(
    chain: MockChain,
    max_concurrent: usize,
) -> (TransferQueue<InMemoryStore, MockChain>, InMemoryStore, Arc<MockChain>)
{
    let store = InMemoryStore::default();
    let chain = Arc::new(chain);
    let queue = TransferQueue::new(
        test_context(max_concurrent),
        store.clone(),
        chain.clone(),
    );
    (queue, store, chain)
}

fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn signed_transfer(
    wallet: &LocalWallet,
    nonce_byte: u8,
    deadline: u64,
) -> NewTransfer {
    let nonce = H256::repeat_byte(nonce_byte);
    let amount = U256::exp10(18);
    let message = eip712::TransferMessage {
        token: None,
        from: wallet.address(),
        to: Address::repeat_byte(0xbb),
        amount,
        nonce,
        deadline: U256::from(deadline),
    };
    let digest =
        eip712::signing_hash(CHAIN_ID, contract_address(), &message);
    let signature = wallet.sign_hash(digest).unwrap();
    NewTransfer {
        nonce,
        from: wallet.address(),
        to: Address::repeat_byte(0xbb),
        amount: "1.0".to_string(),
        deadline,
        signature: Bytes::from(signature.to_vec()),
        contract_address: contract_address(),
        token_address: None,
    }
}

fn event_statuses(store: &InMemoryStore, id: u64) -> Vec<String> {
    store
        .list_events(id)
        .unwrap()
        .into_iter()
        .map(|e| e.status)
        .collect()
}

#[tokio::test]
async fn happy_native_transfer_reaches_confirmed() {
    let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
    let (queue, store, chain) = queue_with(MockChain::default(), 3);
    let id = store
        .insert_received(&signed_transfer(&wallet, 1, unix_now_secs() + 300))
        .unwrap();

    queue.execute_transfer(id).await.unwrap();

    let row = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::Confirmed);
    assert_eq!(row.tx_hash, Some(H256::repeat_byte(0x77)));
    assert_eq!(row.block_number, Some(42));
    assert!(row.submitted_at.is_some());
    assert!(row.confirmed_at.is_some());
    assert_eq!(chain.submit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        event_statuses(&store, id),
        vec!["received", "validated", "pending", "submitted", "confirmed"]
    );
}

#[tokio::test]
async fn reverted_transactions_fail_terminally() {
    let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
    let chain = MockChain::default();
    chain.receipts.lock().push_back(Ok(TransferReceipt {
        transaction_hash: H256::repeat_byte(0x77),
        block_number: 42,
        gas_used: U256::from(21_000u64),
        success: false,
    }));
    let (queue, store, _chain) = queue_with(chain, 3);
    let id = store
        .insert_received(&signed_transfer(&wallet, 1, unix_now_secs() + 300))
        .unwrap();

    queue.execute_transfer(id).await.unwrap();

    let row = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("Transaction reverted"));

    // a revert never re-enters the queue
    queue.requeue_retryable().unwrap();
    let row = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::Failed);
}

#[tokio::test]
async fn transient_submission_error_retries_after_backoff() {
    let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
    let chain = MockChain::default();
    chain
        .submit_results
        .lock()
        .push_back(Err(Error::Generic("timeout")));
    let (queue, store, chain) = queue_with(chain, 3);
    let id = store
        .insert_received(&signed_transfer(&wallet, 1, unix_now_secs() + 300))
        .unwrap();

    queue.execute_transfer(id).await.unwrap();
    let row = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::Failed);
    assert_eq!(row.retry_count, 1);
    assert!(event_statuses(&store, id).contains(&"retry".to_string()));

    // the 2^1 second backoff has not elapsed yet
    queue.requeue_retryable().unwrap();
    assert_eq!(
        store.find_by_id(id).unwrap().unwrap().status,
        TransferStatus::Failed
    );

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    queue.requeue_retryable().unwrap();
    let row = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::Validated);
    assert!(event_statuses(&store, id)
        .contains(&"retry_queued".to_string()));

    // the second attempt goes through
    queue.execute_transfer(id).await.unwrap();
    let row = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::Confirmed);
    assert_eq!(chain.submit_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn mined_transfer_is_recovered_without_resubmission() {
    let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
    let chain = MockChain::default();
    *chain.nonce_used.lock() = true;
    let (queue, store, chain) = queue_with(chain, 3);
    let id = store
        .insert_received(&signed_transfer(&wallet, 1, unix_now_secs() + 300))
        .unwrap();
    // the previous process submitted and crashed before recording the
    // receipt; on boot the row was re-queued for execution
    let tx_hash = H256::repeat_byte(0x99);
    store
        .update_status(
            id,
            TransferStatus::Pending,
            TransferUpdate {
                tx_hash: Some(tx_hash),
                block_number: Some(41),
                ..Default::default()
            },
        )
        .unwrap();
    store
        .update_status(id, TransferStatus::Validated, TransferUpdate::default())
        .unwrap();

    queue.execute_transfer(id).await.unwrap();

    let row = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::Confirmed);
    assert_eq!(row.tx_hash, Some(tx_hash));
    assert_eq!(chain.submit_calls.load(Ordering::SeqCst), 0);
    assert!(event_statuses(&store, id)
        .contains(&"confirmed".to_string()));
}

#[tokio::test]
async fn used_nonce_without_own_submission_is_permanent() {
    let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
    let chain = MockChain::default();
    *chain.nonce_used.lock() = true;
    let (queue, store, chain) = queue_with(chain, 3);
    let id = store
        .insert_received(&signed_transfer(&wallet, 1, unix_now_secs() + 300))
        .unwrap();

    queue.execute_transfer(id).await.unwrap();

    let row = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::PermanentlyFailed);
    assert_eq!(chain.submit_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_deadline_fails_permanently_and_stays_terminal() {
    let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
    let (queue, store, _chain) = queue_with(MockChain::default(), 3);
    let id = store
        .insert_received(&signed_transfer(&wallet, 1, unix_now_secs() - 10))
        .unwrap();

    queue.execute_transfer(id).await.unwrap();
    let row = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::PermanentlyFailed);
    assert!(row
        .error_message
        .unwrap()
        .contains("Deadline expired"));

    // a terminal transfer is skipped by later slots: no new events
    let events_before = store.list_events(id).unwrap().len();
    queue.execute_transfer(id).await.unwrap();
    queue.requeue_retryable().unwrap();
    assert_eq!(store.list_events(id).unwrap().len(), events_before);
}

#[tokio::test]
async fn the_concurrency_cap_bounds_in_flight_slots() {
    let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
    let chain = MockChain {
        receipt_delay: Duration::from_millis(300),
        ..Default::default()
    };
    let (queue, store, _chain) = queue_with(chain, 2);
    for i in 1..=5u8 {
        store
            .insert_received(&signed_transfer(
                &wallet,
                i,
                unix_now_secs() + 300,
            ))
            .unwrap();
    }

    queue.fill_free_slots().unwrap();
    // slots are claimed synchronously, so the cap is visible immediately
    assert_eq!(queue.ctx.processing().current(), 2);
    queue.fill_free_slots().unwrap();
    assert_eq!(queue.ctx.processing().current(), 2);

    // wait for the first wave to finish, then the next wave fits
    for _ in 0..50 {
        if queue.ctx.processing().current() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        store.count_by_status(TransferStatus::Confirmed).unwrap(),
        2
    );
    queue.fill_free_slots().unwrap();
    assert_eq!(queue.ctx.processing().current(), 2);
}
