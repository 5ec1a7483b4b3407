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

use derive_more::Display;
/// Target for logger
pub const TARGET: &str = "aion_probe";

/// The Kind of the Probe.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// When the Lifecycle of the Relayer changes, like starting or shutting down.
    #[display(fmt = "lifecycle")]
    Lifecycle,
    /// Transfer submissions arriving over the REST API.
    #[display(fmt = "ingress")]
    Ingress,
    /// Transfer execution queue state.
    #[display(fmt = "tx_queue")]
    TxQueue,
    /// When the relayer will retry to execute a transfer.
    #[display(fmt = "retry")]
    Retry,
    /// Signature and state validation of a transfer.
    #[display(fmt = "validation")]
    Validation,
    /// Lifecycle event fan-out to subscribers.
    #[display(fmt = "event_bus")]
    EventBus,
}
