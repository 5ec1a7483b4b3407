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

//! The concurrency knob, guarded by HTTP Basic auth.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, TypedHeader};
use headers::authorization::Basic;
use headers::Authorization;
use serde::{Deserialize, Serialize};

use aion_relayer_config::MAX_CONCURRENT_LIMIT;
use aion_relayer_utils::HandlerError;

use crate::AppState;

/// Request body of the concurrency adjustment.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyRequest {
    /// The new execution cap.
    pub max_concurrent: usize,
}

/// Response of the concurrency adjustment.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyResponse {
    success: bool,
    max_concurrent: usize,
}

fn authorize(
    state: &AppState,
    auth: Option<&Authorization<Basic>>,
) -> Result<(), HandlerError> {
    let Some(expected_password) = state.ctx.config.admin.password.as_deref()
    else {
        return Err(HandlerError(
            StatusCode::FORBIDDEN,
            "Admin endpoint is disabled".to_string(),
        ));
    };
    let Some(auth) = auth else {
        return Err(HandlerError(
            StatusCode::UNAUTHORIZED,
            "Missing credentials".to_string(),
        ));
    };
    let username_ok = auth.username() == state.ctx.config.admin.username;
    let password_ok = auth.password() == expected_password;
    if !(username_ok && password_ok) {
        return Err(HandlerError(
            StatusCode::UNAUTHORIZED,
            "Invalid credentials".to_string(),
        ));
    }
    Ok(())
}

/// Handles `PUT /relayer/admin/concurrency`. The cap must lie within
/// `[1, MAX_CONCURRENT_LIMIT]`.
pub async fn handle_set_concurrency(
    State(state): State<Arc<AppState>>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
    Json(payload): Json<ConcurrencyRequest>,
) -> Result<Json<ConcurrencyResponse>, HandlerError> {
    authorize(&state, auth.as_ref().map(|TypedHeader(auth)| auth))?;
    if payload.max_concurrent < 1
        || payload.max_concurrent > MAX_CONCURRENT_LIMIT
    {
        return Err(HandlerError(
            StatusCode::BAD_REQUEST,
            format!(
                "maxConcurrent must be between 1 and {MAX_CONCURRENT_LIMIT}"
            ),
        ));
    }
    let applied = state.ctx.processing().set_max(payload.max_concurrent);
    tracing::info!(max_concurrent = applied, "Execution cap adjusted");
    Ok(Json(ConcurrencyResponse {
        success: true,
        max_concurrent: applied,
    }))
}
