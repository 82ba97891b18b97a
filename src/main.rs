use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use landing_guard::cli::{self, Cli, Commands};
use landing_guard::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    init_logging(&cli);

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Serve(args) => cli::serve::run(args, config_path).await,
        Commands::Config(args) => cli::config::run(args, config_path).await,
        Commands::Paths => cli::paths::run(config_path),
        Commands::Purge(args) => cli::purge::run(args, config_path).await,
        Commands::Emit(args) => cli::emit::run(args, config_path).await,
        Commands::Audit(args) => cli::audit::run(args, config_path).await,
    }
}

/// `RUST_LOG` wins, then `--verbose`, then `logging.level` from config.
fn init_logging(cli: &Cli) {
    // Read without creating the template; a broken config is reported by
    // the command itself
    let logging = std::fs::read_to_string(
        cli.config
            .clone()
            .or_else(|| Config::config_path().ok())
            .unwrap_or_default(),
    )
    .ok()
    .and_then(|content| Config::from_toml(&content).ok())
    .map(|config| config.logging)
    .unwrap_or_default();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        logging.level
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
