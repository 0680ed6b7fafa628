//! `axiom-supervisor` — an interactive task supervisor that launches
//! long-lived AI-assistant child processes behind a PTY, watches their
//! output for undesirable linguistic patterns, and injects corrective
//! stdin while the child is still running.
//!
//! `axiomd` is a long-running foreground process: it reads
//! newline-delimited JSON-RPC requests from its own stdin, dispatches
//! them against the in-process supervisor state, and writes responses to
//! its own stdout. All diagnostic output goes to stderr via `log`, so
//! stdout stays a clean RPC channel for the orchestrating client.

pub mod cli;
pub mod config;
pub mod core;
pub mod rpc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use crate::cli::Cli;
use crate::config::Config;
use crate::core::router::Router;
use crate::rpc::RpcServer;

/// Process entry point. Resolves configuration, wires the supervisor
/// context together, and runs the RPC loop until stdin reaches EOF or a
/// shutdown signal arrives. Returns the process exit code: 0 clean
/// shutdown, 1 unrecoverable stdio I/O error, 2 invalid configuration.
pub async fn run() -> i32 {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(default_config_path);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 2;
        }
    };

    if cli.validate_config {
        // Config::load already ran full validation; reaching here means
        // it passed, so there is nothing left for this mode to do.
        return 0;
    }

    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));
    log::info!(
        "axiomd starting: child.command={}, rules={}, ring_buffer_bytes={}",
        config.child.command,
        config.rules.len(),
        config.ring_buffer_bytes
    );

    let shutdown_grace = config.shutdown_grace;
    let config = Arc::new(config);
    let router = Arc::new(Router::new(config.clone()));

    tokio::spawn(crate::core::stall_ticker::run(
        router.registry().clone(),
        router.bus().clone(),
        router.controller().clone(),
        config.clone(),
    ));

    let shutdown_router = router.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let running = shutdown_router.running_task_count();
        log::info!("shutdown signal received, interrupting {running} running task(s)");
        shutdown_router.interrupt_all().await;
        tokio::time::sleep(shutdown_grace).await;
        log::info!("shutdown grace period elapsed, exiting");
        std::process::exit(0);
    });

    match RpcServer::new(router).run().await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("fatal error on supervisor stdio: {e}");
            1
        }
    }
}

/// `axiom.toml` in the current directory, if present.
fn default_config_path() -> Option<PathBuf> {
    let candidate = Path::new("axiom.toml");
    candidate.exists().then(|| candidate.to_path_buf())
}

fn init_logging(level: &str) {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(level);
    builder.target(env_logger::Target::Stderr);
    let _ = builder.try_init();
}
