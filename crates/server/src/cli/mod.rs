//! Command-line interface for the `drawlatch` binary.

pub mod bootstrap;
pub mod keys;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use dl_domain::config::RemoteConfig;
use dl_domain::Result;

/// Overrides the configuration directory (default: current directory).
pub const CONFIG_DIR_ENV: &str = "MCP_SECURE_PROXY_CONFIG_DIR";

pub const CONFIG_FILE: &str = "remote.config.json";

// Process exit codes.
pub const EXIT_BAD_CONFIG: i32 = 1;
pub const EXIT_MISSING_KEYS: i32 = 2;
pub const EXIT_BIND_FAILED: i32 = 3;

/// drawlatch — a secure MCP proxy remote.
#[derive(Debug, Parser)]
#[command(name = "drawlatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the remote server (default when no subcommand is given).
    Serve,
    /// Create a config directory with defaults, server keys, and `.env`.
    Bootstrap {
        /// Target directory (default: the resolved config dir).
        #[arg(long)]
        config_dir: Option<PathBuf>,
        /// Also generate a client key bundle and register it as a caller.
        #[arg(long)]
        include_remote_keys: bool,
    },
    /// Generate a fresh identity key bundle into a directory.
    GenerateKeys {
        /// Destination directory for the four key files.
        dir: PathBuf,
    },
}

/// Resolve the config directory: explicit flag, then env var, then CWD.
pub fn config_dir(flag: Option<&Path>) -> PathBuf {
    if let Some(dir) = flag {
        return dir.to_path_buf();
    }
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("."),
    }
}

/// Load and validate `remote.config.json` from the config directory, after
/// sourcing its `.env` file into the process environment.
pub fn load_config(dir: &Path) -> Result<RemoteConfig> {
    source_env_file(&dir.join(".env"));
    RemoteConfig::load(&dir.join(CONFIG_FILE))
}

/// Export `KEY=VALUE` lines from `.env`, without clobbering variables the
/// operator already set.
fn source_env_file(path: &Path) {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return;
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((name, value)) = line.split_once('=') {
            if std::env::var(name.trim()).is_err() {
                std::env::set_var(name.trim(), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_beats_env_beats_cwd() {
        std::env::remove_var(CONFIG_DIR_ENV);
        assert_eq!(config_dir(None), PathBuf::from("."));
        std::env::set_var(CONFIG_DIR_ENV, "/tmp/dl-test-config");
        assert_eq!(config_dir(None), PathBuf::from("/tmp/dl-test-config"));
        assert_eq!(
            config_dir(Some(Path::new("/explicit"))),
            PathBuf::from("/explicit")
        );
        std::env::remove_var(CONFIG_DIR_ENV);
    }
}
