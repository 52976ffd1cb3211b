//! Route resolution: placeholder substitution, per-caller route lookup, and
//! the endpoint allowlist check.
//!
//! Raw [`Route`] templates may reference `${VAR}` placeholders anywhere in
//! their endpoints, headers, secrets, and ingestor config.  Resolution
//! substitutes them against the caller's scoped env overlaid on the process
//! environment, producing a [`ResolvedRoute`] with concrete values.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::config::{CallerConfig, IngestorConfig, RemoteConfig, Route};
use crate::error::{ProxyError, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Placeholder substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"))
}

/// Expand every `${VAR}` in `input`.  Lookup order: `scope` first, then the
/// process environment.  An unresolvable reference is a
/// [`MissingSecret`](crate::error::ErrorKind::MissingSecret) error naming
/// the variable (never a value).
pub fn substitute(input: &str, scope: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in placeholder_re().captures_iter(input) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        let value = match scope.get(name) {
            Some(v) => v.clone(),
            None => std::env::var(name).map_err(|_| ProxyError::missing_secret(name))?,
        };
        out.push_str(&input[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Expand a whole env map.  Values may reference the process environment
/// but not each other.
pub fn resolve_secrets(
    raw: &HashMap<String, String>,
    scope: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    raw.iter()
        .map(|(name, value)| Ok((name.clone(), substitute(value, scope)?)))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resolved routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A [`Route`] with every placeholder substituted.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub alias: String,
    pub allowed_endpoints: Vec<String>,
    pub base_url: Option<String>,
    pub headers: HashMap<String, String>,
    /// Lowercased names of template headers that were built from
    /// placeholders (e.g. `authorization`).  Callers cannot override these.
    pub protected_headers: HashSet<String>,
    pub secrets: HashMap<String, String>,
    pub ingestor: Option<IngestorConfig>,
}

/// The raw routes a caller has enabled, in the caller's configured order.
pub fn caller_routes(config: &RemoteConfig, caller_alias: &str) -> Result<Vec<Route>> {
    let caller = config.caller(caller_alias)?;
    let routes = config.routes();
    caller
        .connections
        .iter()
        .map(|alias| {
            routes
                .iter()
                .find(|r| &r.alias == alias)
                .cloned()
                .ok_or_else(|| {
                    ProxyError::bad_config(format!(
                        "caller {caller_alias} enables unknown connection: {alias}"
                    ))
                })
        })
        .collect()
}

/// Substitute all placeholders in the given routes against the caller's env.
pub fn resolve_routes(raw: &[Route], caller: &CallerConfig) -> Result<Vec<ResolvedRoute>> {
    raw.iter().map(|r| resolve_route(r, &caller.env)).collect()
}

fn resolve_route(route: &Route, caller_env: &HashMap<String, String>) -> Result<ResolvedRoute> {
    let secrets = resolve_secrets(&route.secrets, caller_env)?;

    // Headers and ingestor config may reference both secrets and env vars;
    // secrets win on name collisions.
    let mut scope = caller_env.clone();
    scope.extend(secrets.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut headers = HashMap::new();
    let mut protected_headers = HashSet::new();
    for (name, template) in &route.headers {
        if placeholder_re().is_match(template) {
            protected_headers.insert(name.to_ascii_lowercase());
        }
        headers.insert(name.clone(), substitute(template, &scope)?);
    }

    let allowed_endpoints = route
        .allowed_endpoints
        .iter()
        .map(|p| substitute(p, &scope))
        .collect::<Result<Vec<_>>>()?;

    let base_url = route
        .base_url
        .as_deref()
        .map(|b| substitute(b, &scope))
        .transpose()?;

    let ingestor = route
        .ingestor
        .as_ref()
        .map(|i| resolve_ingestor(i, &scope))
        .transpose()?;

    Ok(ResolvedRoute {
        alias: route.alias.clone(),
        allowed_endpoints,
        base_url,
        headers,
        protected_headers,
        secrets,
        ingestor,
    })
}

fn resolve_ingestor(
    config: &IngestorConfig,
    scope: &HashMap<String, String>,
) -> Result<IngestorConfig> {
    let mut resolved = config.clone();
    match &mut resolved {
        IngestorConfig::Websocket(ws) => {
            ws.gateway_url = substitute(&ws.gateway_url, scope)?;
        }
        IngestorConfig::Webhook(wh) => {
            wh.callback_url = wh
                .callback_url
                .as_deref()
                .map(|c| substitute(c, scope))
                .transpose()?;
        }
        IngestorConfig::Poll(p) => {
            p.url = substitute(&p.url, scope)?;
            p.headers = resolve_secrets(&p.headers, scope)?;
        }
    }
    Ok(resolved)
}

/// Find a resolved route by connection alias.
pub fn match_route<'a>(alias: &str, routes: &'a [ResolvedRoute]) -> Result<&'a ResolvedRoute> {
    routes
        .iter()
        .find(|r| r.alias == alias)
        .ok_or_else(|| ProxyError::unknown_connection(alias))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Endpoint allowlist
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// True iff `url` matches any allowlist pattern.
///
/// Patterns are globs (`**` crosses path segments, `*` stays within one).
/// Scheme and host are compared case-sensitively (the URL parser already
/// normalizes them to lowercase); the path is compared case-insensitively.
/// The query string participates only when the pattern contains `?`.
pub fn is_endpoint_allowed(url: &str, patterns: &[String]) -> bool {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return false,
    };
    if parsed.host_str().is_none() {
        return false;
    }

    patterns.iter().any(|pattern| {
        let mut subject = format!(
            "{}://{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or_default()
        );
        if let Some(port) = parsed.port() {
            subject.push_str(&format!(":{port}"));
        }
        subject.push_str(parsed.path());
        if pattern.contains('?') {
            if let Some(q) = parsed.query() {
                subject.push('?');
                subject.push_str(q);
            }
        }
        glob_matches(pattern, &subject)
    })
}

fn glob_matches(pattern: &str, subject: &str) -> bool {
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    match glob::Pattern::new(&lowercase_path_part(pattern)) {
        Ok(g) => g.matches_with(&lowercase_path_part(subject), options),
        Err(_) => false,
    }
}

/// Lowercase everything after the authority (the first `/` past `://`),
/// leaving scheme and host untouched.
fn lowercase_path_part(s: &str) -> String {
    let path_start = s
        .find("://")
        .and_then(|i| s[i + 3..].find('/').map(|j| i + 3 + j));
    match path_start {
        Some(idx) => format!("{}{}", &s[..idx], s[idx..].to_ascii_lowercase()),
        None => s.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Redacted summaries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What `list_routes` and the admin template listing expose: structure and
/// names, never secret or header values.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub alias: String,
    pub allowed_endpoints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Header names only.
    pub headers: Vec<String>,
    /// Secret names only.
    pub secrets: Vec<String>,
    /// `"<type>:<protocol>"`, e.g. `"webhook:stripe"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestor: Option<String>,
}

impl RouteSummary {
    pub fn of_resolved(route: &ResolvedRoute) -> Self {
        Self::build(
            &route.alias,
            &route.allowed_endpoints,
            route.base_url.as_deref(),
            &route.headers,
            &route.secrets,
            route.ingestor.as_ref(),
        )
    }

    pub fn of_route(route: &Route) -> Self {
        Self::build(
            &route.alias,
            &route.allowed_endpoints,
            route.base_url.as_deref(),
            &route.headers,
            &route.secrets,
            route.ingestor.as_ref(),
        )
    }

    fn build(
        alias: &str,
        endpoints: &[String],
        base_url: Option<&str>,
        headers: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
        ingestor: Option<&IngestorConfig>,
    ) -> Self {
        let mut header_names: Vec<String> = headers.keys().cloned().collect();
        header_names.sort();
        let mut secret_names: Vec<String> = secrets.keys().cloned().collect();
        secret_names.sort();
        Self {
            alias: alias.to_string(),
            allowed_endpoints: endpoints.to_vec(),
            base_url: base_url.map(String::from),
            headers: header_names,
            secrets: secret_names,
            ingestor: ingestor.map(|i| {
                if i.protocol().is_empty() {
                    i.kind().to_string()
                } else {
                    format!("{}:{}", i.kind(), i.protocol())
                }
            }),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
