pub mod audit;
pub mod config;
pub mod emit;
pub mod paths;
pub mod purge;
pub mod serve;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "landing-guard")]
#[command(
    author,
    version,
    about = "Request guard, contact intake and telemetry ingestion for a landing page"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "LANDING_GUARD_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API in the foreground
    Serve(serve::ServeArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,

    /// Remove expired guard state and old log files
    Purge(purge::PurgeArgs),

    /// Send one telemetry event to a running server
    Emit(emit::EmitArgs),

    /// Inspect the guard audit trail
    Audit(audit::AuditArgs),
}
