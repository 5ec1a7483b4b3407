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

//! Configuration value types for the AION relayer.
//!
//! These are small wrappers with custom `serde` deserialization so that
//! secrets and endpoints can be supplied inline, from environment
//! variables, or from files.

/// The gas-payer private key type.
pub mod private_key;
/// The RPC endpoint URL type.
pub mod rpc_url;

pub use private_key::PrivateKey;
pub use rpc_url::RpcUrl;
