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

//! AION Relayer Binary.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use tokio::signal::unix;

use aion_chain_gateway::EscrowGateway;
use aion_relayer::service;
use aion_relayer_config::cli::{
    create_store, load_config, setup_logger, Opts,
};
use aion_relayer_context::RelayerContext;
use aion_relayer_handlers::AppState;

/// The main entry point for the relayer.
///
/// # Arguments
///
/// * `args` - The command line arguments.
#[paw::main]
#[tokio::main]
async fn main(args: Opts) -> anyhow::Result<()> {
    setup_logger(args.verbose, "aion_relayer")?;
    match dotenv::dotenv() {
        Ok(_) => {
            tracing::trace!("Loaded .env file");
        }
        Err(e) => {
            tracing::warn!("Failed to load .env file: {}", e);
        }
    }

    // The configuration is validated and configured from the given directory
    let config = load_config(args.config_dir.clone())?;
    // fail loudly at startup rather than sign against the wrong contract
    config.verify()?;

    // persistent storage for the relayer; a missing store degrades the
    // ingress API instead of aborting startup
    let store = create_store(&args, &config).await?;

    // The RelayerContext takes a configuration, and populates objects that
    // are needed throughout the lifetime of the relayer. Items such as the
    // gas-payer wallet and the event bus, as well as a convenient place to
    // access the configuration.
    let ctx = RelayerContext::new(config, store)?;

    let gateway = Arc::new(EscrowGateway::new(&ctx)?);
    let state = Arc::new(AppState::new(ctx.clone(), gateway.clone()));

    // the build_web_services call sets up routing (endpoint queries /
    // requests mapped to handler code) so clients can interact with the
    // relayer
    let server_handle =
        tokio::spawn(service::build_web_services(state.clone()));
    // start the background execution queue.
    // this does not block, will fire the queue on a background task.
    service::ignite(&ctx, gateway).await?;
    tracing::event!(
        target: aion_relayer_utils::probe::TARGET,
        tracing::Level::DEBUG,
        kind = %aion_relayer_utils::probe::Kind::Lifecycle,
        started = true
    );

    // watch for signals
    let mut ctrlc_signal = unix::signal(unix::SignalKind::interrupt())?;
    let mut termination_signal = unix::signal(unix::SignalKind::terminate())?;
    let mut quit_signal = unix::signal(unix::SignalKind::quit())?;
    let shutdown = || {
        tracing::event!(
            target: aion_relayer_utils::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %aion_relayer_utils::probe::Kind::Lifecycle,
            shutdown = true
        );
        tracing::warn!("Shutting down...");
        // send shutdown signal to all of the application: the scheduler
        // stops ticking and subscription connections close, while
        // in-flight RPC calls run to completion on their tasks.
        ctx.shutdown();
        // also abort the server task
        server_handle.abort();
        std::thread::sleep(std::time::Duration::from_millis(300));
        tracing::info!("Clean Exit ..");
    };
    tokio::select! {
        _ = ctrlc_signal.recv() => {
            tracing::warn!("Interrupted (Ctrl+C) ...");
            shutdown();
        },
        _ = termination_signal.recv() => {
            tracing::warn!("Got Terminate signal ...");
            shutdown();
        },
        _ = quit_signal.recv() => {
            tracing::warn!("Quitting ...");
            shutdown();
        },
    }
    Ok(())
}
