use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::Path;

use crate::config::Config;
use crate::security::{read_audit_log, verify_audit_chain};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Print the most recent entries
    Show {
        /// Number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Check the hash chain for edits or removed lines
    Verify,
}

pub async fn run(args: AuditArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let path = config.paths.audit_log();

    match args.command {
        AuditCommands::Show { limit } => {
            let entries = read_audit_log(&path)?;
            let skip = entries.len().saturating_sub(limit);
            for entry in &entries[skip..] {
                println!("{}", serde_json::to_string(entry)?);
            }
            if entries.is_empty() {
                println!("No audit entries at {}", path.display());
            }
        }
        AuditCommands::Verify => {
            let broken = verify_audit_chain(&path)?;
            if broken.is_empty() {
                println!("Audit chain intact ({})", path.display());
            } else {
                anyhow::bail!(
                    "Audit chain broken at line(s) {:?} in {}",
                    broken.iter().map(|i| i + 1).collect::<Vec<_>>(),
                    path.display()
                );
            }
        }
    }

    Ok(())
}
