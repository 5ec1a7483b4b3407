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

//! EIP-712 hashing for transfer authorizations.
//!
//! The domain is `(name="AION", version="1", chainId, verifyingContract)`
//! and the typed struct depends on whether the transfer moves the native
//! asset or an ERC-20 token. Only typed-data signatures are accepted;
//! there is no EIP-191 personal-sign fallback anywhere in this module.

use ethers::abi::{encode, Token};
use ethers::types::{Address, Signature, H256, U256};
use ethers::utils::keccak256;

/// The `name` field of the signing domain.
pub const DOMAIN_NAME: &str = "AION";
/// The `version` field of the signing domain.
pub const DOMAIN_VERSION: &str = "1";

const EIP712_DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const ETH_TRANSFER_TYPE: &str =
    "ETHTransfer(address from,address to,uint256 amount,bytes32 nonce,uint256 deadline)";
const ERC20_TRANSFER_TYPE: &str =
    "ERC20Transfer(address token,address from,address to,uint256 amount,bytes32 nonce,uint256 deadline)";

/// The signed fields of a transfer authorization, with the amount already
/// converted to the asset's smallest unit.
#[derive(Debug, Clone)]
pub struct TransferMessage {
    /// The token being moved; `None` selects the `ETHTransfer` struct.
    pub token: Option<Address>,
    /// The fund owner.
    pub from: Address,
    /// The recipient.
    pub to: Address,
    /// Amount in the asset's smallest unit.
    pub amount: U256,
    /// The authorization nonce.
    pub nonce: H256,
    /// Unix seconds deadline.
    pub deadline: U256,
}

/// The domain separator binding signatures to one contract on one chain.
pub fn domain_separator(
    chain_id: u64,
    verifying_contract: Address,
) -> [u8; 32] {
    keccak256(encode(&[
        Token::FixedBytes(keccak256(EIP712_DOMAIN_TYPE).to_vec()),
        Token::FixedBytes(keccak256(DOMAIN_NAME).to_vec()),
        Token::FixedBytes(keccak256(DOMAIN_VERSION).to_vec()),
        Token::Uint(U256::from(chain_id)),
        Token::Address(verifying_contract),
    ]))
}

fn struct_hash(message: &TransferMessage) -> [u8; 32] {
    let tokens = match message.token {
        Some(token) => vec![
            Token::FixedBytes(keccak256(ERC20_TRANSFER_TYPE).to_vec()),
            Token::Address(token),
            Token::Address(message.from),
            Token::Address(message.to),
            Token::Uint(message.amount),
            Token::FixedBytes(message.nonce.as_bytes().to_vec()),
            Token::Uint(message.deadline),
        ],
        None => vec![
            Token::FixedBytes(keccak256(ETH_TRANSFER_TYPE).to_vec()),
            Token::Address(message.from),
            Token::Address(message.to),
            Token::Uint(message.amount),
            Token::FixedBytes(message.nonce.as_bytes().to_vec()),
            Token::Uint(message.deadline),
        ],
    };
    keccak256(encode(&tokens))
}

/// The 32-byte digest a wallet signs for this transfer.
pub fn signing_hash(
    chain_id: u64,
    verifying_contract: Address,
    message: &TransferMessage,
) -> H256 {
    let mut bytes = Vec::with_capacity(66);
    bytes.extend_from_slice(&[0x19, 0x01]);
    bytes.extend_from_slice(&domain_separator(chain_id, verifying_contract));
    bytes.extend_from_slice(&struct_hash(message));
    H256::from(keccak256(bytes))
}

/// Recovers the signer of the transfer authorization.
pub fn recover_signer(
    chain_id: u64,
    verifying_contract: Address,
    message: &TransferMessage,
    signature: &[u8],
) -> aion_relayer_utils::Result<Address> {
    let signature = Signature::try_from(signature)?;
    let digest = signing_hash(chain_id, verifying_contract, message);
    Ok(signature.recover(digest)?)
}
