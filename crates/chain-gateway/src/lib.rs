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

//! # Chain Gateway Module
//!
//! A thin abstraction over the escrow chain RPC. The gateway reads the
//! contract's view functions, submits `execute*Transfer` transactions with
//! the relayer's gas-payer key, and awaits their receipts.
//!
//! The surface is split into two trait seams so the validator and the
//! executor can be tested against scripted implementations:
//! [`EscrowOracle`] for the views and [`TransferSubmitter`] for the
//! submissions.

use std::sync::Arc;
use std::time::Duration;

use ethers::contract::abigen;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Middleware, PendingTransaction};
use ethers::types::{Address, Bytes, H256, U256};

use aion_relayer_context::RelayerContext;
use aion_relayer_utils::{Error, Result, SignerClient};

abigen!(
    AionEscrow,
    r#"[
        function usedNonces(bytes32 nonce) external view returns (bool)
        function lockedFundsETH(address owner) external view returns (uint256)
        function lockedFundsERC20(address token, address owner) external view returns (uint256)
        function withdrawTimestamps(address owner) external view returns (uint256)
        function executeETHTransfer(address from, address to, uint256 amount, bytes32 nonce, uint256 deadline, bytes signature) external
        function executeERC20Transfer(address token, address from, address to, uint256 amount, bytes32 nonce, uint256 deadline, bytes signature) external
    ]"#
);

abigen!(
    Erc20Token,
    r#"[
        function decimals() external view returns (uint8)
    ]"#
);

/// The parameters of one `execute*Transfer` submission. The amount is
/// already converted to the asset's smallest unit.
#[derive(Debug, Clone)]
pub struct EscrowTransfer {
    /// The ERC-20 token to move; `None` targets the native entry point.
    pub token: Option<Address>,
    /// The fund owner that signed the authorization.
    pub from: Address,
    /// The recipient.
    pub to: Address,
    /// Amount in the asset's smallest unit.
    pub amount: U256,
    /// The authorization nonce.
    pub nonce: H256,
    /// Unix seconds deadline, as signed.
    pub deadline: U256,
    /// The EIP-712 signature the contract verifies.
    pub signature: Bytes,
}

/// The confirmation record of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Hash of the mined transaction.
    pub transaction_hash: H256,
    /// Block that mined it.
    pub block_number: u64,
    /// Gas the execution consumed.
    pub gas_used: U256,
    /// Whether the receipt status indicates success.
    pub success: bool,
}

/// Read-only escrow contract state, as the validator consumes it.
#[async_trait::async_trait]
pub trait EscrowOracle: Send + Sync {
    /// The network id used in the EIP-712 signing domain. Implementations
    /// fall back to the configured id when the node cannot be reached, so
    /// a flaky oracle connection never fails an otherwise-sound signature.
    async fn chain_id(&self) -> Result<u64>;
    /// Whether the contract has already consumed this nonce.
    async fn nonce_used(&self, nonce: H256) -> Result<bool>;
    /// The owner's locked native-asset balance.
    async fn locked_funds_native(&self, owner: Address) -> Result<U256>;
    /// The owner's locked balance of the given token.
    async fn locked_funds_erc20(
        &self,
        token: Address,
        owner: Address,
    ) -> Result<U256>;
    /// When the owner initiated a withdrawal; zero if they have not.
    async fn withdraw_timestamp(&self, owner: Address) -> Result<U256>;
    /// The token's decimals, read from its contract.
    async fn token_decimals(&self, token: Address) -> Result<u8>;
}

/// Transaction submission against the escrow contract.
#[async_trait::async_trait]
pub trait TransferSubmitter: Send + Sync {
    /// Broadcasts the transfer and returns its transaction hash as soon as
    /// the submission is accepted by the node, before confirmation.
    async fn submit_transfer(&self, transfer: &EscrowTransfer)
        -> Result<H256>;
    /// Awaits the receipt of a previously submitted transaction.
    async fn wait_for_receipt(&self, tx_hash: H256)
        -> Result<TransferReceipt>;
    /// The node's current gas price.
    async fn gas_price(&self) -> Result<U256>;
}

/// The production gateway: an ethers `SignerMiddleware` around the
/// configured RPC endpoint, signing submissions with the gas-payer key.
#[derive(Clone)]
pub struct EscrowGateway {
    client: Arc<SignerClient>,
    contract: AionEscrow<SignerClient>,
    default_chain_id: u64,
}

impl std::fmt::Debug for EscrowGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowGateway")
            .field("contract", &self.contract.address())
            .finish()
    }
}

impl EscrowGateway {
    /// Builds the gateway from the relayer context. Fails when the RPC
    /// endpoint or the escrow contract address is not configured.
    pub fn new(ctx: &RelayerContext) -> Result<Self> {
        let provider = ctx.evm_provider()?;
        let wallet = ctx.evm_wallet();
        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let address = ctx.config.escrow_contract()?;
        let contract = AionEscrow::new(address, client.clone());
        Ok(Self {
            client,
            contract,
            default_chain_id: ctx.config.evm.chain_id,
        })
    }

    /// The escrow contract address this gateway submits against.
    pub fn contract_address(&self) -> Address {
        self.contract.address()
    }
}

#[async_trait::async_trait]
impl EscrowOracle for EscrowGateway {
    async fn chain_id(&self) -> Result<u64> {
        match self.client.provider().get_chainid().await {
            Ok(id) => Ok(id.as_u64()),
            Err(e) => {
                tracing::warn!(
                    "Failed to query chain id ({e}), falling back to configured id {}",
                    self.default_chain_id
                );
                Ok(self.default_chain_id)
            }
        }
    }

    async fn nonce_used(&self, nonce: H256) -> Result<bool> {
        let used = self
            .contract
            .used_nonces(nonce.to_fixed_bytes())
            .call()
            .await?;
        Ok(used)
    }

    async fn locked_funds_native(&self, owner: Address) -> Result<U256> {
        let locked = self.contract.locked_funds_eth(owner).call().await?;
        Ok(locked)
    }

    async fn locked_funds_erc20(
        &self,
        token: Address,
        owner: Address,
    ) -> Result<U256> {
        let locked =
            self.contract.locked_funds_erc20(token, owner).call().await?;
        Ok(locked)
    }

    async fn withdraw_timestamp(&self, owner: Address) -> Result<U256> {
        let ts = self.contract.withdraw_timestamps(owner).call().await?;
        Ok(ts)
    }

    async fn token_decimals(&self, token: Address) -> Result<u8> {
        let token_contract = Erc20Token::new(token, self.client.clone());
        let decimals = token_contract.decimals().call().await?;
        Ok(decimals)
    }
}

#[async_trait::async_trait]
impl TransferSubmitter for EscrowGateway {
    async fn submit_transfer(
        &self,
        transfer: &EscrowTransfer,
    ) -> Result<H256> {
        let call = match transfer.token {
            Some(token) => self.contract.execute_erc20_transfer(
                token,
                transfer.from,
                transfer.to,
                transfer.amount,
                transfer.nonce.to_fixed_bytes(),
                transfer.deadline,
                transfer.signature.clone(),
            ),
            None => self.contract.execute_eth_transfer(
                transfer.from,
                transfer.to,
                transfer.amount,
                transfer.nonce.to_fixed_bytes(),
                transfer.deadline,
                transfer.signature.clone(),
            ),
        };
        let pending = call.send().await?;
        Ok(*pending)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<TransferReceipt> {
        let pending =
            PendingTransaction::new(tx_hash, self.client.provider())
                .interval(Duration::from_millis(1000));
        let receipt = pending
            .await?
            .ok_or(Error::Generic("Transaction dropped from mempool"))?;
        Ok(TransferReceipt {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt
                .block_number
                .map(|b| b.as_u64())
                .unwrap_or_default(),
            gas_used: receipt.gas_used.unwrap_or_default(),
            success: receipt.status.map(|s| !s.is_zero()).unwrap_or(false),
        })
    }

    async fn gas_price(&self) -> Result<U256> {
        let price = self.client.provider().get_gas_price().await?;
        Ok(price)
    }
}
