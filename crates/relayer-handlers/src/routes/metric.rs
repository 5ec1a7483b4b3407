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

//! Prometheus metrics handler.

use axum::http::StatusCode;

use aion_relayer_utils::metric::Metrics;
use aion_relayer_utils::HandlerError;

/// Handles `GET /metrics` in the prometheus text format.
pub async fn handle_metrics() -> Result<String, HandlerError> {
    Metrics::gather().map_err(|e| {
        HandlerError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}
