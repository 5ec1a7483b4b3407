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

//! # Relayer Configuration Module
//!
//! A module for configuring the relayer.
//!
//! ## Overview
//!
//! The relayer configuration module is responsible for configuring the
//! relayer. Configuration can be loaded from TOML/JSON files in a config
//! directory and overridden through `AION`-prefixed environment variables.
//! Possible configuration include:
//! * `port`: The port the relayer will listen on. Defaults to 9955
//! * `evm`: The escrow chain endpoint, chain id, contract address and
//!   gas-payer key.
//! * `queue`: Execution concurrency and retry policy.
//! * `store`: The path of the persistent transfer store.

/// CLI configuration
pub mod cli;
/// Utils for processing configuration
pub mod utils;

use std::path::PathBuf;

use ethereum_types::Address;
use serde::{Deserialize, Serialize};

use aion_relayer_types::{PrivateKey, RpcUrl};

/// The default port the relayer will listen on. Defaults to 9955.
const fn default_port() -> u16 {
    9955
}
/// Parallel execution slots default to `3`.
const fn default_max_concurrent() -> usize {
    3
}
/// Failed transfers are retried up to `3` times by default.
const fn default_max_retries() -> u32 {
    3
}
/// The queue scheduler ticks every `5` seconds by default.
const fn default_tick_interval_secs() -> u64 {
    5
}
/// Submissions are limited to `10` requests per window by default.
const fn default_rate_limit_requests() -> u32 {
    10
}
/// The rate limit window is `60` seconds by default.
const fn default_rate_limit_window_secs() -> u64 {
    60
}
fn default_admin_username() -> String {
    "admin".to_string()
}

/// The upper bound the admin endpoint may raise `max-concurrent` to.
pub const MAX_CONCURRENT_LIMIT: usize = 10;

/// AionRelayerConfig is the configuration for the AION relayer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct AionRelayerConfig {
    /// HTTP/WebSocket server port number
    ///
    /// default to 9955
    #[serde(default = "default_port", skip_serializing)]
    pub port: u16,
    /// The escrow chain and its configuration.
    #[serde(default)]
    pub evm: EvmChainConfig,
    /// Persistent store configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Execution queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Ingress rate limit configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Admin endpoint credentials.
    #[serde(default)]
    pub admin: AdminConfig,
}

impl AionRelayerConfig {
    /// Makes sure that the config is valid, by going
    /// through the whole config and doing some basic checks.
    ///
    /// The escrow contract address is the one thing every component must
    /// agree on, so a missing address fails startup loudly instead of
    /// letting the validator and executor drift apart.
    pub fn verify(&self) -> aion_relayer_utils::Result<()> {
        if self.evm.escrow_contract.is_none() {
            return Err(aion_relayer_utils::Error::MissingContractAddress);
        }
        Ok(())
    }

    /// The configured escrow contract address.
    ///
    /// Call [`Self::verify`] at startup first; after that this cannot fail.
    pub fn escrow_contract(&self) -> aion_relayer_utils::Result<Address> {
        self.evm
            .escrow_contract
            .ok_or(aion_relayer_utils::Error::MissingContractAddress)
    }
}

/// EvmChainConfig is the configuration for the escrow chain.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct EvmChainConfig {
    /// String that groups configuration for this chain on a human-readable name.
    #[serde(default)]
    pub name: String,
    /// Http(s) Endpoint for quick Req/Res
    #[serde(skip_serializing)]
    pub http_endpoint: Option<RpcUrl>,
    /// chain specific id (output of chainId opcode on EVM networks).
    ///
    /// Also the fallback for the EIP-712 signing domain when the node
    /// cannot be queried, so it must match the deployed network.
    #[serde(rename(serialize = "chainId"), default)]
    pub chain_id: u64,
    /// The gas-payer private key on this network.
    /// the format is more dynamic here:
    /// 1. if it starts with '0x' then this would be raw (64 bytes) hex encoded
    ///    private key.
    ///    Example: 0x8917174396171783496173419137618235192359106130478137647163400318
    ///
    /// 2. if it starts with '$' then it would be considered as an Enviroment variable
    ///    of a hex-encoded private key.
    ///    Example: $AION_PRIVATE_KEY
    ///
    /// 3. if it starts with 'file:' then the key is read from that path.
    #[serde(skip_serializing)]
    pub private_key: Option<PrivateKey>,
    /// The escrow contract address all components submit against.
    pub escrow_contract: Option<Address>,
    /// Block Explorer for this chain.
    ///
    /// Optional, and only used for printing a clickable links
    /// for transactions.
    #[serde(skip_serializing)]
    pub explorer: Option<url::Url>,
}

/// StoreConfig is the configuration of the persistent transfer store.
///
/// When the path is absent (or the database cannot be opened) the relayer
/// still starts, but the ingress API degrades to 503 on submission.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Filesystem path of the sled database.
    pub db_path: Option<PathBuf>,
}

/// QueueConfig is the configuration for the transfer execution queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueConfig {
    /// Maximum number of transfers executing in parallel. Clamped to
    /// `[1, MAX_CONCURRENT_LIMIT]`.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum number of retry attempts for a failed transfer.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between scheduler ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

/// RateLimitConfig is the sliding-window rate limit applied to submissions.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitConfig {
    /// Maximum requests per client address per window.
    #[serde(default = "default_rate_limit_requests")]
    pub max_requests: u32,
    /// Window length in seconds.
    #[serde(default = "default_rate_limit_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_rate_limit_requests(),
            window_secs: default_rate_limit_window_secs(),
        }
    }
}

/// AdminConfig guards the concurrency knob behind HTTP Basic auth.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AdminConfig {
    /// Admin username.
    #[serde(default = "default_admin_username")]
    pub username: String,
    /// Admin password. The admin endpoint refuses all requests when unset.
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: default_admin_username(),
            password: None,
        }
    }
}
