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

//! # Relayer Service Module
//!
//! A module for starting the long-running parts of the relayer: the HTTP
//! and WebSocket server, the crash-recovery pass, and the transfer
//! execution queue.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use aion_chain_gateway::EscrowGateway;
use aion_relayer_context::RelayerContext;
use aion_relayer_handlers::routes::admin::handle_set_concurrency;
use aion_relayer_handlers::routes::info::{handle_health, handle_stats};
use aion_relayer_handlers::routes::metric::handle_metrics;
use aion_relayer_handlers::routes::transfers::{
    handle_address_history, handle_submit_transfer, handle_transfer_status,
};
use aion_relayer_handlers::{websocket_handler, AppState};
use aion_relayer_store::{
    SledStore, TransferStatus, TransferStore, TransferUpdate,
};
use aion_tx_queue::TransferQueue;

/// Type alias for the [Sled](https://sled.rs)-based transfer store.
pub type Store = SledStore;

/// How many stuck rows one recovery pass examines.
const RECOVERY_SCAN_LIMIT: usize = 1000;

/// Sets up the HTTP/WebSocket server for the relayer, routing endpoint
/// queries and requests to handler code. Allows clients to interact with
/// the relayer.
///
/// # Arguments
///
/// * `state` - Handler state that holds the context and the gateway
pub async fn build_web_services(
    state: Arc<AppState>,
) -> crate::Result<()> {
    let socket_addr =
        SocketAddr::new([0, 0, 0, 0].into(), state.ctx.config.port);
    let app = Router::new()
        .route("/relayer/submit", post(handle_submit_transfer))
        .route("/relayer/transfers", post(handle_submit_transfer))
        .route("/relayer/transfers/:id", get(handle_transfer_status))
        .route("/relayer/stats", get(handle_stats))
        .route("/relayer/health", get(handle_health))
        .route("/relayer/admin/concurrency", put(handle_set_concurrency))
        .route("/transactions/:address", get(handle_address_history))
        .route("/metrics", get(handle_metrics))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .into_make_service_with_connect_info::<SocketAddr>();

    tracing::info!("Starting the server on {}", socket_addr);
    axum::Server::bind(&socket_addr).serve(app).await?;
    Ok(())
}

/// Starts the background execution queue, after re-queueing transfers a
/// previous process left mid-flight.
///
/// Returns immediately; the queue runs on its own task until shutdown.
///
/// # Arguments
///
/// * `ctx` - RelayerContext reference that holds the configuration
/// * `gateway` - The escrow chain gateway
pub async fn ignite(
    ctx: &RelayerContext,
    gateway: Arc<EscrowGateway>,
) -> crate::Result<()> {
    let Some(store) = ctx.store() else {
        tracing::warn!(
            "No transfer store available; the execution queue is disabled"
        );
        return Ok(());
    };
    recover_stuck_transfers(store)?;
    let queue = TransferQueue::new(ctx.clone(), store.clone(), gateway);
    tokio::spawn(async move {
        if let Err(e) = queue.run().await {
            tracing::error!("Transfer queue stopped: {e}");
        }
    });
    Ok(())
}

/// Rows still in `pending` were broadcast by a previous process that died
/// before recording the receipt. Flipping them back to `validated` sends
/// them through the standard execution path, which either observes the
/// on-chain confirmation or re-submits.
fn recover_stuck_transfers<S: TransferStore>(store: &S) -> crate::Result<()> {
    let stuck = store.list_by_status(
        TransferStatus::Pending,
        RECOVERY_SCAN_LIMIT,
        true,
    )?;
    for row in stuck {
        tracing::info!(
            transfer_id = row.id,
            tx_hash = ?row.tx_hash,
            "Re-queueing transfer left pending by a previous run"
        );
        store.update_status(
            row.id,
            TransferStatus::Validated,
            TransferUpdate::default(),
        )?;
        store.append_event(
            row.id,
            "validated",
            "Re-queued after restart",
            None,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aion_relayer_store::InMemoryStore;
    use ethereum_types::{Address, H256};

    #[test]
    fn pending_rows_are_requeued_on_boot() {
        let store = InMemoryStore::default();
        let id = store
            .insert_received(&aion_relayer_store::NewTransfer {
                nonce: H256::repeat_byte(1),
                from: Address::repeat_byte(0xaa),
                to: Address::repeat_byte(0xbb),
                amount: "1.0".into(),
                deadline: 1_893_456_000,
                signature: vec![0x1b; 65].into(),
                contract_address: Address::repeat_byte(0xcc),
                token_address: None,
            })
            .unwrap();
        store
            .update_status(
                id,
                TransferStatus::Pending,
                TransferUpdate {
                    tx_hash: Some(H256::repeat_byte(0x77)),
                    ..Default::default()
                },
            )
            .unwrap();

        recover_stuck_transfers(&store).unwrap();

        let row = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(row.status, TransferStatus::Validated);
        // the original submission hash survives for race recovery
        assert_eq!(row.tx_hash, Some(H256::repeat_byte(0x77)));
    }
}
