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

#![deny(unsafe_code)]
#![warn(missing_docs)]

//! # AION Relayer Crate
//!
//! The off-chain relayer core of the AION escrow payment system.
//!
//! ## Overview
//!
//! Users lock funds in the escrow contract and sign EIP-712 transfer
//! authorizations off-chain, gas-free. This service accepts those
//! authorizations over REST, validates them against local and on-chain
//! state, persists a durable transfer state machine, executes them on
//! chain under a bounded concurrency cap with exponential-backoff
//! retries, and streams every lifecycle transition to WebSocket
//! observers.
//!
//! The relayer never custodies user funds: it only submits signatures it
//! received, and pays the gas for doing so.

/// A module for wiring the HTTP server and the background queue.
pub mod service;

pub use aion_relayer_utils::{Error, Result};
