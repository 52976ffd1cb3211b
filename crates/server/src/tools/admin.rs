//! Admin tools: caller registry and secret management.
//!
//! Every handler requires `role == admin` on the invoking caller.  Config
//! and `.env` mutations are atomic (temp file + rename in the same
//! directory) and answer `restartRequired: true` — connection and ingestor
//! changes only take effect on reload.  Secret *values* never appear in
//! results or logs.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use dl_domain::config::{CallerConfig, CallerRole, RemoteConfig};
use dl_domain::resolve::RouteSummary;
use dl_domain::{ErrorKind, ProxyError};

use crate::state::AppState;

pub async fn run(
    state: &AppState,
    caller_alias: &str,
    tool: &str,
    input: Value,
) -> Result<Value, ProxyError> {
    let caller = state.config.caller(caller_alias)?;
    if caller.role != CallerRole::Admin {
        return Err(ProxyError::not_authorized());
    }
    // Admin calls share the caller's rate-limit window; no exemption.
    if !state.limiter.try_admit(caller_alias) {
        return Err(ProxyError::new(
            ErrorKind::RateLimited,
            format!(
                "rate limit of {}/min reached",
                state.config.rate_limit_per_minute
            ),
        ));
    }

    match tool {
        "admin_list_callers" => list_callers(state),
        "admin_list_connection_templates" => list_templates(state),
        "admin_register_caller" => register_caller(state, input),
        "admin_remove_caller" => remove_caller(state, input),
        "admin_update_caller_connections" => update_caller_connections(state, input),
        "admin_set_secrets" => set_secrets(state, input),
        "admin_get_secret_status" => secret_status(state, input),
        other => Err(ProxyError::new(
            ErrorKind::MalformedMessage,
            format!("unknown admin tool: {other}"),
        )),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Read-only listings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Alias, name, connections, role, fingerprint — and nothing else.
fn list_callers(state: &AppState) -> Result<Value, ProxyError> {
    let mut aliases: Vec<&String> = state.config.callers.keys().collect();
    aliases.sort();
    let callers: Vec<Value> = aliases
        .into_iter()
        .map(|alias| {
            let caller = &state.config.callers[alias];
            serde_json::json!({
                "alias": alias,
                "name": caller.name,
                "connections": caller.connections,
                "role": caller.role,
                "fingerprint": state.fingerprint_of(alias),
            })
        })
        .collect();
    Ok(serde_json::json!({ "callers": callers }))
}

fn list_templates(state: &AppState) -> Result<Value, ProxyError> {
    let templates: Vec<RouteSummary> = state
        .config
        .routes()
        .iter()
        .map(RouteSummary::of_route)
        .collect();
    Ok(serde_json::json!({ "templates": templates }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Caller mutations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterCallerInput {
    alias: String,
    peer_key_dir: String,
    #[serde(default)]
    connections: Vec<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    role: Option<CallerRole>,
}

fn register_caller(state: &AppState, input: Value) -> Result<Value, ProxyError> {
    let input: RegisterCallerInput = parse(input)?;
    let alias = input.alias.clone();
    mutate_config(state, |config| {
        if config.callers.contains_key(&input.alias) {
            return Err(ProxyError::bad_config(format!(
                "caller {} already exists",
                input.alias
            )));
        }
        config.callers.insert(
            input.alias.clone(),
            CallerConfig {
                name: input.name.clone(),
                peer_key_dir: input.peer_key_dir.clone().into(),
                connections: input.connections.clone(),
                env: HashMap::new(),
                role: input.role.unwrap_or_default(),
                ingestor_overrides: HashMap::new(),
            },
        );
        Ok(())
    })?;
    Ok(mutated(serde_json::json!({ "alias": alias })))
}

#[derive(Debug, Deserialize)]
struct AliasInput {
    alias: String,
}

fn remove_caller(state: &AppState, input: Value) -> Result<Value, ProxyError> {
    let input: AliasInput = parse(input)?;
    let alias = input.alias.clone();
    mutate_config(state, |config| {
        if config.callers.remove(&input.alias).is_none() {
            return Err(ProxyError::unknown_caller(&input.alias));
        }
        Ok(())
    })?;
    Ok(mutated(serde_json::json!({ "alias": alias })))
}

#[derive(Debug, Deserialize)]
struct UpdateConnectionsInput {
    alias: String,
    connections: Vec<String>,
}

fn update_caller_connections(state: &AppState, input: Value) -> Result<Value, ProxyError> {
    let input: UpdateConnectionsInput = parse(input)?;
    let alias = input.alias.clone();
    mutate_config(state, |config| {
        let caller = config
            .callers
            .get_mut(&input.alias)
            .ok_or_else(|| ProxyError::unknown_caller(&input.alias))?;
        caller.connections = input.connections.clone();
        Ok(())
    })?;
    Ok(mutated(serde_json::json!({ "alias": alias })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Secrets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct SetSecretsInput {
    env: HashMap<String, String>,
}

/// Overlay variables onto the `.env` file (0600, atomic rename) and export
/// them into the process so the request pipeline hot-reads the new values.
/// Running ingestors keep their resolved secrets until restart.
fn set_secrets(state: &AppState, input: Value) -> Result<Value, ProxyError> {
    let input: SetSecretsInput = parse(input)?;
    for name in input.env.keys() {
        if !is_valid_env_name(name) {
            return Err(ProxyError::bad_config(format!(
                "invalid environment variable name: {name}"
            )));
        }
    }

    let mut entries = read_env_file(&state.env_path);
    for (name, value) in &input.env {
        entries.insert(name.clone(), value.clone());
    }
    write_env_file(&state.env_path, &entries)?;

    for (name, value) in &input.env {
        std::env::set_var(name, value);
    }

    let mut updated: Vec<&String> = input.env.keys().collect();
    updated.sort();
    tracing::info!(count = updated.len(), "secrets updated");
    Ok(mutated(serde_json::json!({ "updated": updated })))
}

#[derive(Debug, Default, Deserialize)]
struct SecretStatusInput {
    #[serde(default)]
    names: Option<Vec<String>>,
}

/// Which secret references are satisfied — names and booleans only.
fn secret_status(state: &AppState, input: Value) -> Result<Value, ProxyError> {
    let input: SecretStatusInput = if input.is_null() {
        SecretStatusInput::default()
    } else {
        parse(input)?
    };
    let names = match input.names {
        Some(names) => names.into_iter().collect::<BTreeSet<String>>(),
        None => referenced_placeholders(&state.config),
    };
    let statuses: Vec<Value> = names
        .into_iter()
        .map(|name| {
            let set = std::env::var(&name).is_ok();
            serde_json::json!({ "name": name, "set": set })
        })
        .collect();
    Ok(serde_json::json!({ "secrets": statuses }))
}

/// Every `${VAR}` mentioned anywhere in the config.
fn referenced_placeholders(config: &RemoteConfig) -> BTreeSet<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"));
    let rendered = serde_json::to_string(&config.routes()).unwrap_or_default();
    let caller_env = serde_json::to_string(
        &config
            .callers
            .values()
            .map(|c| &c.env)
            .collect::<Vec<_>>(),
    )
    .unwrap_or_default();
    re.captures_iter(&rendered)
        .chain(re.captures_iter(&caller_env))
        .map(|caps| caps[1].to_string())
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, ProxyError> {
    serde_json::from_value(input)
        .map_err(|e| ProxyError::new(ErrorKind::MalformedMessage, format!("bad input: {e}")))
}

fn mutated(mut extra: Value) -> Value {
    extra["restartRequired"] = Value::Bool(true);
    extra
}

/// Load the on-disk config, apply the mutation, validate, and atomically
/// replace the file.  The in-memory config is left alone — the response's
/// `restartRequired` tells the operator to reload.
fn mutate_config<F>(state: &AppState, apply: F) -> Result<(), ProxyError>
where
    F: FnOnce(&mut RemoteConfig) -> Result<(), ProxyError>,
{
    let mut config = RemoteConfig::load(&state.config_path)?;
    apply(&mut config)?;
    config.validate()?;
    let rendered = serde_json::to_string_pretty(&config)
        .map_err(|e| ProxyError::bad_config(format!("serialize config: {e}")))?;
    write_atomic(&state.config_path, rendered.as_bytes(), false)
}

fn read_env_file(path: &Path) -> HashMap<String, String> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    raw.lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        })
        .collect()
}

fn write_env_file(path: &Path, entries: &HashMap<String, String>) -> Result<(), ProxyError> {
    let mut names: Vec<&String> = entries.keys().collect();
    names.sort();
    let mut rendered = String::new();
    for name in names {
        rendered.push_str(name);
        rendered.push('=');
        rendered.push_str(&entries[name]);
        rendered.push('\n');
    }
    write_atomic(path, rendered.as_bytes(), true)
}

fn is_valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Temp file in the target directory, then rename over the destination.
fn write_atomic(path: &Path, bytes: &[u8], secret: bool) -> Result<(), ProxyError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ProxyError::bad_config(format!("temp file: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| ProxyError::bad_config(format!("write: {e}")))?;
    if secret {
        restrict_file_mode(tmp.path())?;
    }
    tmp.persist(path)
        .map_err(|e| ProxyError::bad_config(format!("rename: {e}")))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_file_mode(path: &Path) -> Result<(), ProxyError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| ProxyError::bad_config(format!("chmod: {e}")))
}

#[cfg(not(unix))]
fn restrict_file_mode(_path: &Path) -> Result<(), ProxyError> {
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::fixture;

    #[tokio::test]
    async fn user_role_is_not_authorized() {
        let (state, _dir) = fixture(60);
        let err = run(&state, "agent", "admin_list_callers", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotAuthorized);
    }

    #[tokio::test]
    async fn admin_calls_share_the_rate_limit_window() {
        let (state, _dir) = fixture(1);
        run(&state, "operator", "admin_list_callers", Value::Null)
            .await
            .unwrap();
        let err = run(&state, "operator", "admin_list_callers", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn admin_lists_callers_with_expected_fields_only() {
        let (state, _dir) = fixture(60);
        let result = run(&state, "operator", "admin_list_callers", Value::Null)
            .await
            .unwrap();
        let callers = result["callers"].as_array().unwrap();
        assert_eq!(callers.len(), 2);
        let agent = callers.iter().find(|c| c["alias"] == "agent").unwrap();
        assert_eq!(agent["role"], "user");
        assert_eq!(agent["name"], "Test Agent");
        let mut keys: Vec<&String> = agent.as_object().unwrap().keys().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["alias", "connections", "fingerprint", "name", "role"]
        );
    }

    #[tokio::test]
    async fn register_caller_writes_the_config_atomically() {
        let (state, dir) = fixture(60);
        let result = run(
            &state,
            "operator",
            "admin_register_caller",
            serde_json::json!({
                "alias": "newbie",
                "peerKeyDir": "peers/newbie",
                "connections": ["api"],
            }),
        )
        .await
        .unwrap();
        assert_eq!(result["restartRequired"], true);

        let on_disk =
            RemoteConfig::load(&dir.path().join("remote.config.json")).unwrap();
        assert!(on_disk.callers.contains_key("newbie"));
        // The running config is untouched until restart.
        assert!(!state.config.callers.contains_key("newbie"));
    }

    #[tokio::test]
    async fn register_duplicate_caller_fails() {
        let (state, _dir) = fixture(60);
        let err = run(
            &state,
            "operator",
            "admin_register_caller",
            serde_json::json!({"alias": "agent", "peerKeyDir": "peers/agent"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadConfig);
    }

    #[tokio::test]
    async fn update_connections_validates_aliases() {
        let (state, _dir) = fixture(60);
        let err = run(
            &state,
            "operator",
            "admin_update_caller_connections",
            serde_json::json!({"alias": "agent", "connections": ["ghost-conn"]}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadConfig);
    }

    #[tokio::test]
    async fn remove_unknown_caller_fails() {
        let (state, _dir) = fixture(60);
        let err = run(
            &state,
            "operator",
            "admin_remove_caller",
            serde_json::json!({"alias": "ghost"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownCaller);
    }

    #[tokio::test]
    async fn set_secrets_writes_env_file_and_process_env() {
        let (state, dir) = fixture(60);
        let result = run(
            &state,
            "operator",
            "admin_set_secrets",
            serde_json::json!({"env": {"DL_TEST_ADMIN_SECRET": "v1"}}),
        )
        .await
        .unwrap();
        assert_eq!(result["restartRequired"], true);
        // Names come back; values never do.
        assert_eq!(result["updated"][0], "DL_TEST_ADMIN_SECRET");
        assert!(!result.to_string().contains("v1"));

        let env_raw = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(env_raw.contains("DL_TEST_ADMIN_SECRET=v1"));
        assert_eq!(std::env::var("DL_TEST_ADMIN_SECRET").unwrap(), "v1");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(".env"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn invalid_env_names_are_rejected() {
        let (state, _dir) = fixture(60);
        let err = run(
            &state,
            "operator",
            "admin_set_secrets",
            serde_json::json!({"env": {"BAD NAME": "x"}}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadConfig);
    }

    #[tokio::test]
    async fn secret_status_reports_set_flags_without_values() {
        let (state, _dir) = fixture(60);
        std::env::set_var("DL_TEST_STATUS_SET", "present");
        let result = run(
            &state,
            "operator",
            "admin_get_secret_status",
            serde_json::json!({"names": ["DL_TEST_STATUS_SET", "DL_TEST_STATUS_UNSET"]}),
        )
        .await
        .unwrap();
        let secrets = result["secrets"].as_array().unwrap();
        assert_eq!(secrets[0]["name"], "DL_TEST_STATUS_SET");
        assert_eq!(secrets[0]["set"], true);
        assert_eq!(secrets[1]["set"], false);
        assert!(!result.to_string().contains("present"));
    }

    #[tokio::test]
    async fn templates_listing_includes_builtins() {
        let (state, _dir) = fixture(60);
        let result = run(
            &state,
            "operator",
            "admin_list_connection_templates",
            Value::Null,
        )
        .await
        .unwrap();
        let aliases: Vec<&str> = result["templates"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["alias"].as_str().unwrap())
            .collect();
        for builtin in ["github", "stripe", "trello", "discord"] {
            assert!(aliases.contains(&builtin), "missing {builtin}");
        }
        assert!(aliases.contains(&"api"));
    }
}
