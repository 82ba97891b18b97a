use anyhow::Result;
use clap::Args;
use std::path::Path;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::ingest::LogWriter;
use crate::store::{FileStore, KeyValueStore};

#[derive(Args)]
pub struct PurgeArgs {
    /// Only sweep guard state, leave log files alone
    #[arg(long)]
    pub guard_only: bool,
}

pub async fn run(args: PurgeArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = FileStore::open(&config.paths.guard_dir(), clock.clone())?;
    let removed = store.purge_expired()?;
    println!(
        "Removed {} expired guard entries from {}",
        removed,
        store.dir().display()
    );

    if !args.guard_only {
        let writer = LogWriter::new(
            &config.security_log_dir(),
            config.ingest.max_log_bytes,
            config.ingest.retention_days,
        );
        let removed = writer.clean_old_logs(clock.now())?;
        println!(
            "Removed {} log files older than {} days from {}",
            removed,
            config.ingest.retention_days,
            writer.root().display()
        );
    }

    Ok(())
}
