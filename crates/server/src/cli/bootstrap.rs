//! `drawlatch bootstrap` — scaffold a config directory.
//!
//! Lays out:
//!
//! ```text
//! <dir>/remote.config.json   server config with defaults
//! <dir>/.env                 secret bindings (mode 0600)
//! <dir>/keys/server/         server identity bundle
//! <dir>/keys/peers/<alias>/  caller public bundles
//! <dir>/keys/remote-client/  (--include-remote-keys) client bundle
//! ```

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use dl_crypto::KeyBundle;
use dl_domain::config::{CallerConfig, RemoteConfig};

use crate::cli::CONFIG_FILE;

const LOCAL_CALLER_ALIAS: &str = "local-agent";

pub fn run(dir: &Path, include_remote_keys: bool) -> anyhow::Result<()> {
    let config_path = dir.join(CONFIG_FILE);
    if config_path.exists() {
        anyhow::bail!(
            "{} already exists; refusing to overwrite",
            config_path.display()
        );
    }
    std::fs::create_dir_all(dir)?;

    // ── Server identity ──────────────────────────────────────────────
    let server_keys_dir = dir.join("keys/server");
    let server = KeyBundle::generate();
    server
        .save(&server_keys_dir)
        .map_err(|e| anyhow::anyhow!("saving server keys: {e}"))?;

    // ── Optional client identity, registered as a caller ─────────────
    let mut callers = HashMap::new();
    if include_remote_keys {
        let client_dir = dir.join("keys/remote-client");
        let client = KeyBundle::generate();
        client
            .save(&client_dir)
            .map_err(|e| anyhow::anyhow!("saving client keys: {e}"))?;

        let peer_dir_rel = format!("keys/peers/{LOCAL_CALLER_ALIAS}");
        let peer_file = dir
            .join(&peer_dir_rel)
            .join(format!("{LOCAL_CALLER_ALIAS}.pub"));
        client
            .public()
            .save(&peer_file)
            .map_err(|e| anyhow::anyhow!("saving client public bundle: {e}"))?;

        callers.insert(
            LOCAL_CALLER_ALIAS.to_string(),
            CallerConfig {
                name: Some("Local agent".into()),
                peer_key_dir: peer_dir_rel.into(),
                connections: Vec::new(),
                env: HashMap::new(),
                role: Default::default(),
                ingestor_overrides: HashMap::new(),
            },
        );
    } else {
        std::fs::create_dir_all(dir.join("keys/peers"))?;
    }

    // ── Config file ──────────────────────────────────────────────────
    let config = RemoteConfig {
        host: "127.0.0.1".into(),
        port: 3470,
        local_keys_dir: "keys/server".into(),
        callers,
        connectors: Vec::new(),
        rate_limit_per_minute: 60,
        request_timeout_ms: 30_000,
        session_idle_secs: 1800,
    };
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;

    write_env_template(&dir.join(".env"))?;

    // ── Summary ──────────────────────────────────────────────────────
    eprintln!();
    eprintln!("  drawlatch config initialized in {}", dir.display());
    eprintln!();
    eprintln!("  Server fingerprint: {}", server.fingerprint());
    eprintln!();
    eprintln!("  Created:");
    eprintln!("    {CONFIG_FILE}      - server configuration");
    eprintln!("    .env                    - secret bindings (add your tokens)");
    eprintln!("    keys/server/            - server identity");
    if include_remote_keys {
        eprintln!("    keys/remote-client/     - client identity for the stdio proxy");
        eprintln!("    keys/peers/{LOCAL_CALLER_ALIAS}/  - registered caller bundle");
    } else {
        eprintln!("    keys/peers/             - drop caller *.pub bundles here");
    }
    eprintln!();
    eprintln!("  Next: enable connections for your callers, then `drawlatch serve`.");
    Ok(())
}

fn write_env_template(path: &Path) -> anyhow::Result<()> {
    let template = "\
# Secrets referenced by ${VAR} placeholders in remote.config.json.
# DRAWLATCH_TUNNEL_URL is exported by the tunnel supervisor when one runs.
# GITHUB_TOKEN=
# STRIPE_API_KEY=
# STRIPE_WEBHOOK_SECRET=
# DISCORD_BOT_TOKEN=
";
    let mut open = std::fs::OpenOptions::new();
    open.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        open.mode(0o600);
    }
    let mut file = open.open(path)?;
    file.write_all(template.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn scaffolds_config_keys_and_env() {
        let dir = TempDir::new().unwrap();
        run(dir.path(), false).unwrap();

        let config = RemoteConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert!(config.callers.is_empty());
        assert!(dir.path().join("keys/server/signing.key").exists());
        assert!(dir.path().join(".env").exists());

        // Second run refuses to clobber.
        assert!(run(dir.path(), false).is_err());
    }

    #[test]
    fn include_remote_keys_registers_a_caller() {
        let dir = TempDir::new().unwrap();
        run(dir.path(), true).unwrap();

        let config = RemoteConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert!(config.callers.contains_key(LOCAL_CALLER_ALIAS));
        assert!(dir
            .path()
            .join("keys/peers/local-agent/local-agent.pub")
            .exists());
        assert!(dir.path().join("keys/remote-client/signing.key").exists());
    }

    #[cfg(unix)]
    #[test]
    fn env_file_is_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        run(dir.path(), false).unwrap();
        let mode = std::fs::metadata(dir.path().join(".env"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
