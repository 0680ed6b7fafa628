//! CLI front-end (component I).
//!
//! `axiomd` is a single long-running server process, not a multi-command
//! CLI, so the surface is deliberately small: where to find configuration,
//! an optional log-level override, and a one-shot validate-and-exit mode
//! an orchestrator's deployment tooling can run as a pre-flight check.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "axiomd",
    about = "Interactive task supervisor: PTY-backed child processes, pattern-driven stdin intervention"
)]
pub struct Cli {
    /// Path to a TOML configuration file. Defaults to `axiom.toml` in the
    /// current directory if present, otherwise compiled-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overrides the resolved config's `log_level` (and `RUST_LOG`).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Resolve and validate configuration, then exit — 0 on success, 2
    /// on failure — without starting the RPC loop.
    #[arg(long)]
    pub validate_config: bool,
}
