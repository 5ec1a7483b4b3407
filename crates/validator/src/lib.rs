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

//! # Validator Module
//!
//! Signature and state validation of transfer authorizations: EIP-712
//! recovery plus oracle-backed checks of nonce uniqueness, locked balance
//! and the withdrawal lockout window. The verdict is a set of independent
//! flags with one stable error string per failing check, so the executor
//! can classify failures without re-running the checks.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ethers::types::{Address, U256};
use ethers::utils::{parse_units, ParseUnits};
use serde::Serialize;

use aion_chain_gateway::EscrowOracle;
use aion_relayer_store::{NewTransfer, TransferStore};
use aion_relayer_utils::{probe, Error, Result};

pub mod eip712;

/// Seconds after a withdrawal is initiated during which transfers still
/// execute.
pub const GRACE_PERIOD_SECS: u64 = 300;

/// Stable error string for a nonce already present in the store.
pub const ERR_NONCE_USED: &str = "Nonce already used";
/// Stable error string for a nonce already consumed by the contract.
pub const ERR_NONCE_USED_ON_CHAIN: &str = "Nonce already used on-chain";
/// Stable error string for an expired deadline.
pub const ERR_DEADLINE_EXPIRED: &str = "Deadline expired";
/// Stable error string for a failed signature recovery or signer mismatch.
pub const ERR_INVALID_SIGNATURE: &str = "Invalid signature";
/// Stable error string for an unparseable or non-positive amount.
pub const ERR_INVALID_AMOUNT: &str = "Invalid amount";
/// Stable error string for a locked balance below the transfer amount.
pub const ERR_INSUFFICIENT_FUNDS: &str = "Insufficient locked funds";
/// Stable error string for a sender past their withdrawal grace window.
pub const ERR_LOCKOUT_ACTIVE: &str =
    "Sender is in withdrawal lockout period";

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}

/// The verdict of one validation pass. Valid iff every flag holds; each
/// failing flag contributes one error string.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// The EIP-712 signature recovered to the `from` address.
    pub signature_valid: bool,
    /// The deadline has not passed.
    pub deadline_valid: bool,
    /// The nonce is unused in the store and on chain.
    pub nonce_unused: bool,
    /// The sender's locked balance covers the amount.
    pub sender_has_funds: bool,
    /// The sender is not in the withdrawal lockout window.
    pub grace_period_active: bool,
    /// The amount parses as a positive quantity.
    pub amount_valid: bool,
    /// One stable message per failing check.
    pub errors: Vec<String>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            signature_valid: true,
            deadline_valid: true,
            nonce_unused: true,
            sender_has_funds: true,
            grace_period_active: true,
            amount_valid: true,
            errors: vec![],
        }
    }
}

impl ValidationReport {
    /// The conjunction of all six checks.
    pub fn is_valid(&self) -> bool {
        self.signature_valid
            && self.deadline_valid
            && self.nonce_unused
            && self.sender_has_funds
            && self.grace_period_active
            && self.amount_valid
    }

    /// Whether the only failure is the on-chain nonce check. The executor
    /// uses this to detect transfers the chain already executed while the
    /// relayer believed them pending.
    pub fn failed_only_on_chain_nonce(&self) -> bool {
        !self.nonce_unused
            && self.signature_valid
            && self.deadline_valid
            && self.sender_has_funds
            && self.grace_period_active
            && self.amount_valid
            && self.errors.iter().all(|e| e == ERR_NONCE_USED_ON_CHAIN)
    }
}

/// Converts a whole-unit decimal amount string into the asset's smallest
/// unit. Zero, negative and unparseable amounts are rejected.
pub fn parse_amount(amount: &str, decimals: u8) -> Result<U256> {
    let parsed = parse_units(amount, u32::from(decimals))?;
    match parsed {
        ParseUnits::U256(value) if !value.is_zero() => Ok(value),
        _ => Err(Error::Generic("amount must be positive")),
    }
}

/// Validates transfer authorizations against the store and the escrow
/// oracle.
pub struct TransferValidator<S, O> {
    store: S,
    oracle: Arc<O>,
}

impl<S: Clone, O> Clone for TransferValidator<S, O> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            oracle: self.oracle.clone(),
        }
    }
}

impl<S, O> TransferValidator<S, O>
where
    S: TransferStore,
    O: EscrowOracle,
{
    /// Creates a validator over the given store and oracle handles.
    pub fn new(store: S, oracle: Arc<O>) -> Self {
        Self { store, oracle }
    }

    /// The amount of `transfer`-style decimal string in smallest units,
    /// reading the token's decimals from its contract. Native transfers
    /// use 18 decimals.
    pub async fn amount_in_smallest_unit(
        &self,
        amount: &str,
        token: Option<Address>,
    ) -> Result<U256> {
        let decimals = match token {
            Some(token) => self.oracle.token_decimals(token).await?,
            None => 18,
        };
        parse_amount(amount, decimals)
    }

    /// Runs all six checks against `transfer`.
    ///
    /// `exclude_transfer_id` skips that row in the store-side nonce check,
    /// so re-validating an already persisted transfer does not trip over
    /// its own nonce.
    pub async fn validate(
        &self,
        transfer: &NewTransfer,
        exclude_transfer_id: Option<u64>,
    ) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let now = unix_now_secs();

        // 1. amount parses positive in the asset's smallest unit
        let amount = match transfer.token_address {
            Some(token) => match self.oracle.token_decimals(token).await {
                Ok(decimals) => parse_amount(&transfer.amount, decimals).ok(),
                Err(e) => {
                    report.amount_valid = false;
                    report
                        .errors
                        .push(format!("Failed to check token decimals: {e}"));
                    None
                }
            },
            None => parse_amount(&transfer.amount, 18).ok(),
        };
        if amount.is_none() && report.amount_valid {
            report.amount_valid = false;
            report.errors.push(ERR_INVALID_AMOUNT.to_string());
        }

        // 2. deadline: expiry exactly at the current second still passes
        if now > transfer.deadline {
            report.deadline_valid = false;
            report.errors.push(ERR_DEADLINE_EXPIRED.to_string());
        }

        // 3. EIP-712 recovery against the `from` address. Without a
        // determinable amount there is no digest to verify; the amount
        // error already carries the failure class.
        if let Some(amount) = amount {
            let chain_id = self.oracle.chain_id().await?;
            let message = eip712::TransferMessage {
                token: transfer.token_address,
                from: transfer.from,
                to: transfer.to,
                amount,
                nonce: transfer.nonce,
                deadline: U256::from(transfer.deadline),
            };
            let recovered = eip712::recover_signer(
                chain_id,
                transfer.contract_address,
                &message,
                &transfer.signature,
            );
            match recovered {
                Ok(signer) if signer == transfer.from => {}
                Ok(signer) => {
                    tracing::event!(
                        target: probe::TARGET,
                        tracing::Level::DEBUG,
                        kind = %probe::Kind::Validation,
                        expected = %transfer.from,
                        recovered = %signer,
                        "signer mismatch",
                    );
                    report.signature_valid = false;
                    report.errors.push(ERR_INVALID_SIGNATURE.to_string());
                }
                Err(_) => {
                    report.signature_valid = false;
                    report.errors.push(ERR_INVALID_SIGNATURE.to_string());
                }
            }
        }

        // 4. nonce must be unused in the store and on chain
        if let Some(existing) = self.store.find_by_nonce(&transfer.nonce)? {
            if exclude_transfer_id != Some(existing.id) {
                report.nonce_unused = false;
                report.errors.push(ERR_NONCE_USED.to_string());
            }
        }
        match self.oracle.nonce_used(transfer.nonce).await {
            Ok(true) => {
                report.nonce_unused = false;
                report.errors.push(ERR_NONCE_USED_ON_CHAIN.to_string());
            }
            Ok(false) => {}
            Err(e) => {
                report.nonce_unused = false;
                report.errors.push(format!("Failed to check nonce: {e}"));
            }
        }

        // 5. locked balance covers the amount
        if let Some(amount) = amount {
            let locked = match transfer.token_address {
                Some(token) => {
                    self.oracle.locked_funds_erc20(token, transfer.from).await
                }
                None => self.oracle.locked_funds_native(transfer.from).await,
            };
            match locked {
                Ok(locked) if locked >= amount => {}
                Ok(_) => {
                    report.sender_has_funds = false;
                    report.errors.push(ERR_INSUFFICIENT_FUNDS.to_string());
                }
                Err(e) => {
                    report.sender_has_funds = false;
                    report
                        .errors
                        .push(format!("Failed to check balance: {e}"));
                }
            }
        }

        // 6. withdrawal lockout window
        match self.oracle.withdraw_timestamp(transfer.from).await {
            Ok(ts) if ts.is_zero() => {}
            Ok(ts) => {
                let initiated = ts.as_u64();
                if now > initiated + GRACE_PERIOD_SECS {
                    report.grace_period_active = false;
                    report.errors.push(ERR_LOCKOUT_ACTIVE.to_string());
                }
            }
            Err(e) => {
                report.grace_period_active = false;
                report
                    .errors
                    .push(format!("Failed to check withdrawal status: {e}"));
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aion_relayer_store::InMemoryStore;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::{Bytes, H256};
    use parking_lot::Mutex;

    const CHAIN_ID: u64 = 31337;

    struct MockOracle {
        nonce_used: Mutex<bool>,
        native_locked: Mutex<U256>,
        erc20_locked: Mutex<U256>,
        withdraw_ts: Mutex<U256>,
        decimals: u8,
        fail_nonce_check: Mutex<bool>,
    }

    impl Default for MockOracle {
        fn default() -> Self {
            Self {
                nonce_used: Mutex::new(false),
                native_locked: Mutex::new(U256::exp10(20)),
                erc20_locked: Mutex::new(U256::exp10(20)),
                withdraw_ts: Mutex::new(U256::zero()),
                decimals: 6,
                fail_nonce_check: Mutex::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl EscrowOracle for MockOracle {
        async fn chain_id(&self) -> Result<u64> {
            Ok(CHAIN_ID)
        }
        async fn nonce_used(&self, _nonce: H256) -> Result<bool> {
            if *self.fail_nonce_check.lock() {
                return Err(Error::Generic("network error"));
            }
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
            Ok(*self.erc20_locked.lock())
        }
        async fn withdraw_timestamp(&self, _owner: Address) -> Result<U256> {
            Ok(*self.withdraw_ts.lock())
        }
        async fn token_decimals(&self, _token: Address) -> Result<u8> {
            Ok(self.decimals)
        }
    }

    fn signed_transfer(
        wallet: &LocalWallet,
        token: Option<Address>,
        amount: &str,
        deadline: u64,
    ) -> NewTransfer {
        let contract = Address::repeat_byte(0xcc);
        let decimals = if token.is_some() { 6 } else { 18 };
        let amount_wei =
            parse_amount(amount, decimals).unwrap_or_else(|_| U256::one());
        let nonce = H256::repeat_byte(0x42);
        let message = eip712::TransferMessage {
            token,
            from: wallet.address(),
            to: Address::repeat_byte(0xbb),
            amount: amount_wei,
            nonce,
            deadline: U256::from(deadline),
        };
        let digest = eip712::signing_hash(CHAIN_ID, contract, &message);
        let signature = wallet.sign_hash(digest).unwrap();
        NewTransfer {
            nonce,
            from: wallet.address(),
            to: Address::repeat_byte(0xbb),
            amount: amount.to_string(),
            deadline,
            signature: Bytes::from(signature.to_vec()),
            contract_address: contract,
            token_address: token,
        }
    }

    fn validator(
        oracle: MockOracle,
    ) -> (TransferValidator<InMemoryStore, MockOracle>, InMemoryStore) {
        let store = InMemoryStore::default();
        (
            TransferValidator::new(store.clone(), Arc::new(oracle)),
            store,
        )
    }

    #[tokio::test]
    async fn accepts_a_well_signed_native_transfer() {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let (validator, _) = validator(MockOracle::default());
        let transfer = signed_transfer(
            &wallet,
            None,
            "1.0",
            unix_now_secs() + 300,
        );
        let report = validator.validate(&transfer, None).await.unwrap();
        assert!(report.is_valid(), "errors: {:?}", report.errors);
    }

    #[tokio::test]
    async fn accepts_a_token_transfer_with_contract_decimals() {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let (validator, _) = validator(MockOracle::default());
        let token = Some(Address::repeat_byte(0xdd));
        let transfer = signed_transfer(
            &wallet,
            token,
            "2.5",
            unix_now_secs() + 300,
        );
        let report = validator.validate(&transfer, None).await.unwrap();
        assert!(report.is_valid(), "errors: {:?}", report.errors);
    }

    #[tokio::test]
    async fn rejects_a_signature_from_another_wallet() {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let other = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let (validator, _) = validator(MockOracle::default());
        let mut transfer = signed_transfer(
            &wallet,
            None,
            "1.0",
            unix_now_secs() + 300,
        );
        // claim the transfer came from someone else's balance
        transfer.from = other.address();
        let report = validator.validate(&transfer, None).await.unwrap();
        assert!(!report.signature_valid);
        assert!(report
            .errors
            .contains(&ERR_INVALID_SIGNATURE.to_string()));
    }

    #[tokio::test]
    async fn rejects_zero_amount_at_the_amount_check() {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let (validator, _) = validator(MockOracle::default());
        let transfer =
            signed_transfer(&wallet, None, "0", unix_now_secs() + 300);
        let report = validator.validate(&transfer, None).await.unwrap();
        assert!(!report.amount_valid);
        assert!(report.errors.contains(&ERR_INVALID_AMOUNT.to_string()));
    }

    #[tokio::test]
    async fn deadline_boundary_is_inclusive() {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let (validator, _) = validator(MockOracle::default());

        let now = unix_now_secs();
        let at_now = signed_transfer(&wallet, None, "1.0", now + 1);
        let report = validator.validate(&at_now, None).await.unwrap();
        assert!(report.deadline_valid);

        let expired = signed_transfer(&wallet, None, "1.0", now - 10);
        let report = validator.validate(&expired, None).await.unwrap();
        assert!(!report.deadline_valid);
        assert!(report
            .errors
            .contains(&ERR_DEADLINE_EXPIRED.to_string()));
    }

    #[tokio::test]
    async fn store_nonce_hit_is_skipped_for_the_excluded_row() {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let (validator, store) = validator(MockOracle::default());
        let transfer = signed_transfer(
            &wallet,
            None,
            "1.0",
            unix_now_secs() + 300,
        );
        let id = store.insert_received(&transfer).unwrap();

        let report = validator.validate(&transfer, None).await.unwrap();
        assert!(!report.nonce_unused);
        assert!(report.errors.contains(&ERR_NONCE_USED.to_string()));

        // re-validating the same row must not trip over its own nonce
        let report =
            validator.validate(&transfer, Some(id)).await.unwrap();
        assert!(report.nonce_unused, "errors: {:?}", report.errors);
    }

    #[tokio::test]
    async fn on_chain_nonce_hit_is_the_sole_failure_for_race_recovery() {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let oracle = MockOracle::default();
        *oracle.nonce_used.lock() = true;
        let (validator, _) = validator(oracle);
        let transfer = signed_transfer(
            &wallet,
            None,
            "1.0",
            unix_now_secs() + 300,
        );
        let report = validator.validate(&transfer, None).await.unwrap();
        assert!(!report.is_valid());
        assert!(report.failed_only_on_chain_nonce());
    }

    #[tokio::test]
    async fn transient_oracle_failures_read_as_failed_checks() {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let oracle = MockOracle::default();
        *oracle.fail_nonce_check.lock() = true;
        let (validator, _) = validator(oracle);
        let transfer = signed_transfer(
            &wallet,
            None,
            "1.0",
            unix_now_secs() + 300,
        );
        let report = validator.validate(&transfer, None).await.unwrap();
        assert!(!report.nonce_unused);
        assert!(report
            .errors
            .iter()
            .any(|e| e.starts_with("Failed to check nonce")));
        assert!(!report.failed_only_on_chain_nonce());
    }

    #[tokio::test]
    async fn insufficient_locked_balance_is_rejected() {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let oracle = MockOracle::default();
        *oracle.native_locked.lock() = U256::exp10(17); // 0.1 of the asset
        let (validator, _) = validator(oracle);
        let transfer = signed_transfer(
            &wallet,
            None,
            "1.0",
            unix_now_secs() + 300,
        );
        let report = validator.validate(&transfer, None).await.unwrap();
        assert!(!report.sender_has_funds);
        assert!(report
            .errors
            .contains(&ERR_INSUFFICIENT_FUNDS.to_string()));
    }

    #[tokio::test]
    async fn grace_window_boundary_is_inclusive_at_300_seconds() {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let now = unix_now_secs();

        let oracle = MockOracle::default();
        *oracle.withdraw_ts.lock() = U256::from(now - GRACE_PERIOD_SECS);
        let (transfer_validator, _) = validator(oracle);
        let transfer = signed_transfer(&wallet, None, "1.0", now + 300);
        let report =
            transfer_validator.validate(&transfer, None).await.unwrap();
        assert!(report.grace_period_active);

        let oracle = MockOracle::default();
        *oracle.withdraw_ts.lock() =
            U256::from(now - GRACE_PERIOD_SECS - 1);
        let (transfer_validator, _) = validator(oracle);
        let report =
            transfer_validator.validate(&transfer, None).await.unwrap();
        assert!(!report.grace_period_active);
        assert!(report.errors.contains(&ERR_LOCKOUT_ACTIVE.to_string()));
    }

    #[test]
    fn parse_amount_applies_token_decimals() {
        assert_eq!(
            parse_amount("1.5", 6).unwrap(),
            U256::from(1_500_000u64)
        );
        assert_eq!(parse_amount("1", 18).unwrap(), U256::exp10(18));
        assert!(parse_amount("0", 18).is_err());
        assert!(parse_amount("-3", 18).is_err());
        assert!(parse_amount("not-a-number", 18).is_err());
    }
}
