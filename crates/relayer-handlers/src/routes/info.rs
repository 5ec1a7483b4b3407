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

//! Liveness and queue statistics handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use aion_relayer_store::{now_ms, TransferStatus, TransferStore};
use aion_relayer_utils::HandlerError;

use crate::AppState;

/// Liveness response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: String,
    uptime: u64,
}

/// Handles `GET /relayer/health`.
pub async fn handle_health(
    State(state): State<Arc<AppState>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime: state.ctx.uptime_secs(),
    })
}

/// Counts of transfers per queue-relevant status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Validated transfers waiting for an execution slot.
    pending: usize,
    /// Transfers broadcast and awaiting a receipt.
    processing: usize,
    /// Transfers in the failed state.
    failed: usize,
    /// Confirmed transfers.
    completed: usize,
}

/// In-flight execution slots against the configured cap.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    current: usize,
    max: usize,
}

/// Response of the stats endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    queue: QueueStats,
    processing: ProcessingStats,
    timestamp: u64,
}

/// Handles `GET /relayer/stats`.
pub async fn handle_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, HandlerError> {
    let store = state.ctx.require_store().map_err(|_| {
        HandlerError(
            StatusCode::SERVICE_UNAVAILABLE,
            "Transfer store is unavailable".to_string(),
        )
    })?;
    let queue = QueueStats {
        pending: store.count_by_status(TransferStatus::Validated)?,
        processing: store.count_by_status(TransferStatus::Pending)?,
        failed: store.count_by_status(TransferStatus::Failed)?,
        completed: store.count_by_status(TransferStatus::Confirmed)?,
    };
    let processing = ProcessingStats {
        current: state.ctx.processing().current(),
        max: state.ctx.processing().max(),
    };
    Ok(Json(StatsResponse {
        queue,
        processing,
        timestamp: now_ms(),
    }))
}
