use anyhow::Result;
use clap::Args;
use std::path::Path;

use crate::config::Config;
use crate::server::Server;

#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind (overrides config)
    #[arg(short, long)]
    pub bind: Option<String>,
}

pub async fn run(args: ServeArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = Config::load_from(config_path)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    println!("Starting landing-guard");
    println!("  Server: http://{}:{}", config.server.bind, config.server.port);
    println!("  Security logs: {}", config.security_log_dir().display());
    if !config.server.require_https {
        println!("  Warning: HTTPS enforcement disabled");
    }

    let server = Server::new(&config)?;
    server.run().await?;

    println!("\nShutting down...");
    Ok(())
}
