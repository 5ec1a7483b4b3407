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

//! Transfer submission, status query and address history handlers.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_client_ip::ClientIp;
use ethereum_types::{Address, H256};
use ethers::types::Bytes;
use serde::{Deserialize, Serialize};

use aion_event_bus::BusEvent;
use aion_relayer_store::{
    NewTransfer, SignedTransfer, TransferEvent, TransferStore,
};
use aion_relayer_utils::{probe, Error, HandlerError};
use aion_validator::{parse_amount, TransferValidator};

use crate::routes::{
    ErrorResponse, RateLimitedResponse, SubmitFailureResponse,
    SubmitSuccessResponse,
};
use crate::AppState;

/// How many rows the address history endpoint returns.
const ADDRESS_HISTORY_LIMIT: usize = 50;

/// The JSON body of a transfer submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTransferRequest {
    /// The fund owner that signed the authorization.
    pub from: String,
    /// The recipient.
    pub to: String,
    /// Amount as a decimal string in whole units.
    pub amount: String,
    /// The 32-byte nonce as 0x-prefixed hex.
    pub nonce: String,
    /// Unix seconds deadline.
    pub deadline: i64,
    /// The EIP-712 signature as 0x-prefixed hex.
    pub signature: String,
    /// The escrow contract address.
    pub contract_address: String,
    /// The ERC-20 token address; absent for native transfers.
    #[serde(default)]
    pub token_address: Option<String>,
}

fn parse_hex_address(value: &str, field: &str) -> Result<Address, String> {
    let stripped = value
        .strip_prefix("0x")
        .ok_or_else(|| format!("Invalid {field} address"))?;
    if stripped.len() != 40 {
        return Err(format!("Invalid {field} address"));
    }
    Address::from_str(value).map_err(|_| format!("Invalid {field} address"))
}

fn parse_hex_nonce(value: &str) -> Result<H256, String> {
    const ERR: &str = "Invalid nonce";
    let stripped = value.strip_prefix("0x").ok_or_else(|| ERR.to_string())?;
    if stripped.is_empty() || stripped.len() > 64 {
        return Err(ERR.to_string());
    }
    // shorter nonces are left-padded into the 32-byte representation
    let padded = format!("{stripped:0>64}");
    H256::from_str(&padded).map_err(|_| ERR.to_string())
}

fn parse_hex_signature(value: &str) -> Result<Bytes, String> {
    const ERR: &str = "Invalid signature format";
    let stripped = value.strip_prefix("0x").ok_or_else(|| ERR.to_string())?;
    if stripped.is_empty() {
        return Err(ERR.to_string());
    }
    let bytes = hex::decode(stripped).map_err(|_| ERR.to_string())?;
    Ok(Bytes::from(bytes))
}

/// Validates the shape of a submission and converts it into the stored
/// payload form. Returns every per-field error at once.
pub(crate) fn parse_submission(
    payload: &SubmitTransferRequest,
) -> Result<NewTransfer, Vec<String>> {
    let mut errors = vec![];
    let from = parse_hex_address(&payload.from, "from");
    let to = parse_hex_address(&payload.to, "to");
    let contract_address =
        parse_hex_address(&payload.contract_address, "contract");
    let token_address = match &payload.token_address {
        Some(token) => parse_hex_address(token, "token").map(Some),
        None => Ok(None),
    };
    let nonce = parse_hex_nonce(&payload.nonce);
    let signature = parse_hex_signature(&payload.signature);
    if parse_amount(&payload.amount, 18).is_err() {
        errors.push("Invalid amount".to_string());
    }
    if payload.deadline <= 0 {
        errors.push("Invalid deadline".to_string());
    }
    for err in [
        from.as_ref().err(),
        to.as_ref().err(),
        contract_address.as_ref().err(),
        token_address.as_ref().err(),
        nonce.as_ref().err(),
        signature.as_ref().err(),
    ]
    .into_iter()
    .flatten()
    {
        errors.push(err.clone());
    }
    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(NewTransfer {
        nonce: nonce.expect("checked above"),
        from: from.expect("checked above"),
        to: to.expect("checked above"),
        amount: payload.amount.clone(),
        deadline: payload.deadline as u64,
        signature: signature.expect("checked above"),
        contract_address: contract_address.expect("checked above"),
        token_address: token_address.expect("checked above"),
    })
}

fn store_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: "Service unavailable".to_string(),
            message: "Transfer store is unavailable".to_string(),
        }),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal server error".to_string(),
            message: "Failed to process the transfer".to_string(),
        }),
    )
        .into_response()
}

/// Handles `POST /relayer/submit` (and its `/relayer/transfers` synonym):
/// shape validation, the full validator pass, the atomic insert, and the
/// `payment_accepted` fan-out.
pub async fn handle_submit_transfer(
    State(state): State<Arc<AppState>>,
    ClientIp(client): ClientIp,
    Json(payload): Json<SubmitTransferRequest>,
) -> Response {
    if let Err(retry_after) = state.rate_limiter.check(client) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitedResponse {
                error: "Too many requests".to_string(),
                retry_after,
            }),
        )
            .into_response();
    }

    let transfer = match parse_submission(&payload) {
        Ok(transfer) => transfer,
        Err(errors) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(SubmitFailureResponse {
                    success: false,
                    errors,
                }),
            )
                .into_response();
        }
    };

    let store = match state.ctx.require_store() {
        Ok(store) => store.clone(),
        Err(_) => return store_unavailable(),
    };
    let validator =
        TransferValidator::new(store.clone(), state.gateway.clone());
    let report = match validator.validate(&transfer, None).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Validation pass failed: {e}");
            return internal_error();
        }
    };
    if !report.is_valid() {
        return (
            StatusCode::BAD_REQUEST,
            Json(SubmitFailureResponse {
                success: false,
                errors: report.errors,
            }),
        )
            .into_response();
    }

    let transfer_id = match store.insert_received(&transfer) {
        Ok(id) => id,
        Err(Error::NonceAlreadyUsed) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(SubmitFailureResponse {
                    success: false,
                    errors: vec!["Nonce already used".to_string()],
                }),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("Failed to persist transfer: {e}");
            return internal_error();
        }
    };

    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Ingress,
        transfer_id,
        from = %transfer.from,
        accepted = true,
    );
    state.ctx.metrics.transfers_accepted.inc();
    state.ctx.bus().broadcast(BusEvent::new(
        "payment_accepted",
        serde_json::json!({ "transferId": transfer_id }),
    ));
    // wake the scheduler so free capacity picks the transfer up now
    state.ctx.processing().wake();

    (
        StatusCode::CREATED,
        Json(SubmitSuccessResponse {
            success: true,
            transfer_id,
            message: "Transfer accepted for relaying".to_string(),
        }),
    )
        .into_response()
}

/// A transfer row together with its chronological event log.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatusResponse {
    /// The stored transfer row.
    #[serde(flatten)]
    pub transfer: SignedTransfer,
    /// The audit log, oldest first.
    pub events: Vec<TransferEvent>,
}

/// Handles `GET /relayer/transfers/:id`.
pub async fn handle_transfer_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<TransferStatusResponse>, HandlerError> {
    let store = state.ctx.require_store().map_err(|_| {
        HandlerError(
            StatusCode::SERVICE_UNAVAILABLE,
            "Transfer store is unavailable".to_string(),
        )
    })?;
    let transfer = store.find_by_id(id)?.ok_or_else(|| {
        HandlerError(
            StatusCode::NOT_FOUND,
            format!("Transfer {id} not found"),
        )
    })?;
    let events = store.list_events(id)?;
    Ok(Json(TransferStatusResponse { transfer, events }))
}

/// Handles `GET /transactions/:address`: the last 50 transfers where the
/// address is sender or recipient, newest first.
pub async fn handle_address_history(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<Vec<SignedTransfer>>, HandlerError> {
    let address = parse_hex_address(&address, "queried")
        .map_err(|e| HandlerError(StatusCode::BAD_REQUEST, e))?;
    let store = state.ctx.require_store().map_err(|_| {
        HandlerError(
            StatusCode::SERVICE_UNAVAILABLE,
            "Transfer store is unavailable".to_string(),
        )
    })?;
    let transfers =
        store.list_for_address(address, ADDRESS_HISTORY_LIMIT)?;
    Ok(Json(transfers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> SubmitTransferRequest {
        SubmitTransferRequest {
            from: format!("0x{}", "aa".repeat(20)),
            to: format!("0x{}", "bb".repeat(20)),
            amount: "1.0".to_string(),
            nonce: format!("0x{}", "01".repeat(32)),
            deadline: 1_893_456_000,
            signature: format!("0x{}", "1b".repeat(65)),
            contract_address: format!("0x{}", "cc".repeat(20)),
            token_address: None,
        }
    }

    #[test]
    fn a_well_formed_submission_parses() {
        let parsed = parse_submission(&sample_request()).unwrap();
        assert_eq!(parsed.from, Address::repeat_byte(0xaa));
        assert_eq!(parsed.nonce, H256::repeat_byte(0x01));
        assert_eq!(parsed.signature.len(), 65);
        assert!(parsed.token_address.is_none());
    }

    #[test]
    fn short_nonces_are_left_padded() {
        let mut request = sample_request();
        request.nonce = "0x2a".to_string();
        let parsed = parse_submission(&request).unwrap();
        assert_eq!(parsed.nonce, H256::from_low_u64_be(0x2a));
    }

    #[test]
    fn malformed_fields_are_each_reported() {
        let mut request = sample_request();
        request.from = "0x1234".to_string();
        request.amount = "0".to_string();
        request.nonce = "deadbeef".to_string();
        request.deadline = -1;
        let errors = parse_submission(&request).unwrap_err();
        assert!(errors.contains(&"Invalid from address".to_string()));
        assert!(errors.contains(&"Invalid amount".to_string()));
        assert!(errors.contains(&"Invalid nonce".to_string()));
        assert!(errors.contains(&"Invalid deadline".to_string()));
    }

    #[test]
    fn oversized_nonces_are_rejected() {
        let mut request = sample_request();
        request.nonce = format!("0x{}", "01".repeat(33));
        let errors = parse_submission(&request).unwrap_err();
        assert_eq!(errors, vec!["Invalid nonce".to_string()]);
    }

    #[test]
    fn token_transfers_carry_the_token_address() {
        let mut request = sample_request();
        request.token_address = Some(format!("0x{}", "dd".repeat(20)));
        let parsed = parse_submission(&request).unwrap();
        assert_eq!(parsed.token_address, Some(Address::repeat_byte(0xdd)));
    }

    #[test]
    fn odd_length_signatures_are_rejected() {
        let mut request = sample_request();
        request.signature = "0x1b2".to_string();
        let errors = parse_submission(&request).unwrap_err();
        assert_eq!(errors, vec!["Invalid signature format".to_string()]);
    }
}
