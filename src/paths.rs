//! XDG Base Directory Specification compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. landing-guard specific env var (LANDING_GUARD_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "landing-guard";

/// Resolved directory paths for the entire application.
///
/// Created once at startup, threaded through Config.
/// All paths are absolute.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// Data directory: client hashing key
    pub data_dir: PathBuf,

    /// State directory: guard records, security logs, outbox, audit log
    pub state_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "LANDING_GUARD_CONFIG_DIR", || {
            strategy.config_dir().join(APP_DIR)
        });

        let data_dir = env_or(&env_fn, "LANDING_GUARD_DATA_DIR", || {
            strategy.data_dir().join(APP_DIR)
        });

        let state_dir = env_or(&env_fn, "LANDING_GUARD_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join(APP_DIR)
        });

        Ok(Self {
            config_dir,
            data_dir,
            state_dir,
        })
    }

    /// Build paths rooted in a single directory (tests, ad-hoc runs).
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            state_dir: root.join("state"),
        }
    }

    // ── Convenience accessors for specific files ──

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Client hashing key: data_dir/landing-guard.hash.key
    pub fn hash_key(&self) -> PathBuf {
        self.data_dir.join("landing-guard.hash.key")
    }

    /// Guard records (csrf_*, rate_*): state_dir/guard
    pub fn guard_dir(&self) -> PathBuf {
        self.state_dir.join("guard")
    }

    /// Ingested client logs: state_dir/logs/security
    pub fn security_log_dir(&self) -> PathBuf {
        self.state_dir.join("logs").join("security")
    }

    /// Contact submissions awaiting delivery: state_dir/outbox
    pub fn outbox_dir(&self) -> PathBuf {
        self.state_dir.join("outbox")
    }

    /// Audit log: state_dir/landing-guard.audit.jsonl
    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join("landing-guard.audit.jsonl")
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            &self.config_dir,
            &self.data_dir,
            &self.state_dir,
            &self.guard_dir(),
        ];

        for dir in &dirs {
            create_dir_with_mode(dir)?;
        }

        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            // Home directory fallback when XDG resolution fails
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join(APP_DIR),
                data_dir: home.join(".local").join("share").join(APP_DIR),
                state_dir: home.join(".local").join("state").join(APP_DIR),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute()) // XDG: relative paths are ignored
        .unwrap_or_else(default)
}

/// Create a directory with mode 0700 (guard records are private).
pub fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_end_with_app_dir() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();

        assert!(paths.config_dir.ends_with(APP_DIR), "{:?}", paths.config_dir);
        assert!(paths.data_dir.ends_with(APP_DIR), "{:?}", paths.data_dir);
        assert!(paths.state_dir.ends_with(APP_DIR), "{:?}", paths.state_dir);
    }

    #[test]
    fn env_vars_override_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("LANDING_GUARD_CONFIG_DIR", "/custom/config");
        env.insert("LANDING_GUARD_DATA_DIR", "/custom/data");
        env.insert("LANDING_GUARD_STATE_DIR", "/custom/state");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
    }

    #[test]
    fn relative_and_empty_paths_are_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("LANDING_GUARD_CONFIG_DIR", "relative/path");
        env.insert("LANDING_GUARD_STATE_DIR", "");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.is_absolute());
    }

    #[test]
    fn convenience_accessors() {
        let paths = Paths::rooted_at(Path::new("/srv/lg"));

        assert!(paths.config_file().ends_with("config/config.toml"));
        assert!(paths.hash_key().ends_with("data/landing-guard.hash.key"));
        assert!(paths.guard_dir().ends_with("state/guard"));
        assert!(paths.security_log_dir().ends_with("logs/security"));
        assert!(paths.outbox_dir().ends_with("state/outbox"));
        assert!(paths.audit_log().ends_with("landing-guard.audit.jsonl"));
    }

    #[cfg(unix)]
    #[test]
    fn ensure_dirs_creates_private_guard_dir() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::rooted_at(tmp.path());
        paths.ensure_dirs().unwrap();

        let mode = std::fs::metadata(paths.guard_dir())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
