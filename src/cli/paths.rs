//! CLI subcommand: `landing-guard paths`
//!
//! Prints all resolved paths for debugging and scripting.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;

pub fn run(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let paths = &config.paths;

    println!("landing-guard Paths (XDG Base Directory)");
    println!("========================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  hash key:       {}", paths.hash_key().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  guard state:    {}", paths.guard_dir().display());
    println!("  security logs:  {}", config.security_log_dir().display());
    println!("  contact outbox: {}", paths.outbox_dir().display());
    println!("  audit log:      {}", paths.audit_log().display());

    Ok(())
}
