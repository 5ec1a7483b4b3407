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

use serde::Serialize;

/// Module for handling the admin concurrency API
pub mod admin;

/// Module for handling relayer health and stats APIs
pub mod info;

/// Module for handling relayer metric API
pub mod metric;

/// Module for handling transfer submission and status APIs
pub mod transfers;

/// Success response for a transfer submission.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitSuccessResponse {
    pub(crate) success: bool,
    pub(crate) transfer_id: u64,
    pub(crate) message: String,
}

/// Failure response for a transfer submission, with per-field errors.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitFailureResponse {
    pub(crate) success: bool,
    pub(crate) errors: Vec<String>,
}

/// Response for a rate-limited submission.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedResponse {
    pub(crate) error: String,
    pub(crate) retry_after: u64,
}

/// Generic error response that never leaks internals.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub(crate) error: String,
    pub(crate) message: String,
}
