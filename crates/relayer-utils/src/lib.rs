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

//! # Relayer Utils Module
//!
//! Shared error types and observability helpers used across the AION
//! relayer workspace.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::LocalWallet;

pub mod clickable_link;
/// Metrics functionality
pub mod metric;
/// A module used for debugging relayer lifecycle, queue state, or other relayer state.
pub mod probe;

/// The signer-capable RPC client used for escrow contract calls.
pub type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// An enum of all possible errors that could be encountered during the
/// execution of the AION relayer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while iterating over a glob pattern.
    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),
    /// Error from Glob Iterator.
    #[error(transparent)]
    Glob(#[from] glob::GlobError),
    /// Error while parsing a URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Error in the underlying Http/Ws server.
    #[error(transparent)]
    Axum(#[from] axum::Error),
    /// HTTP Error
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// Sled transaction error.
    #[error(transparent)]
    SledTransaction(
        #[from] sled::transaction::TransactionError<std::io::Error>,
    ),
    /// Error in Http Provider (ethers client).
    #[error(transparent)]
    EthersProvider(#[from] ethers::providers::ProviderError),
    /// Smart contract error.
    #[error(transparent)]
    EthersContractCall(#[from] ethers::contract::ContractError<SignerClient>),
    /// Ether wallet errors.
    #[error(transparent)]
    EtherWalletError(#[from] ethers::signers::WalletError),
    /// Ethers currency conversion error
    #[error(transparent)]
    Conversion(#[from] ethers::utils::ConversionError),
    /// Signature parsing or recovery error.
    #[error(transparent)]
    Signature(#[from] ethers::types::SignatureError),
    #[error(transparent)]
    PrometheusError(#[from] prometheus::Error),
    /// Error while parsing the config files.
    #[error("Config parse error: {}", _0)]
    ParseConfig(#[from] serde_path_to_error::Error<config::ConfigError>),
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
    /// Failed to send the response to the client.
    #[error("Failed to send response to the client")]
    FailedToSendResponse,
    /// Another transfer already claimed this nonce in the store.
    #[error("Nonce already used")]
    NonceAlreadyUsed,
    /// Transfer not found in the store.
    #[error("Transfer not found: {}", id)]
    TransferNotFound {
        /// The id of the missing transfer.
        id: u64,
    },
    /// The persistent store was not available at startup.
    #[error("Transfer store is unavailable")]
    StoreUnavailable,
    /// The escrow contract address is missing from the configuration.
    #[error("Escrow contract address is not configured")]
    MissingContractAddress,
}

/// A type alias for the result for the AION relayer, that uses the `Error` enum.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for HandlerError {
    fn from(value: Error) -> Self {
        HandlerError(StatusCode::INTERNAL_SERVER_ERROR, value.to_string())
    }
}

/// Error type for HTTP handlers
pub struct HandlerError(
    /// HTTP status code for response
    pub StatusCode,
    /// Response message
    pub String,
);

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}
