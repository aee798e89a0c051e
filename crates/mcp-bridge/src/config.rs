//! Configuration for the bridge.
//!
//! Two file formats feed the server set: the simple named-server file
//! (`{"mcpServers": {"name": {"command": ...}}}`) and the full bridge config
//! carrying complete server descriptors plus bridge-level policy. String
//! values in either file may reference environment variables as `${NAME}`
//! (empty string when unset) or `${NAME:default}`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// Default per-request budget.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default initialize handshake budget.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default health check probe budget.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff between remote re-initialize retries.
pub const REMOTE_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// How a backend is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Spawn `command args` and speak line-delimited JSON over its stdio.
    #[default]
    Stdio,
    /// Remote SSE endpoint: GET event stream + POST messages.
    Sse,
    /// Remote streamable HTTP endpoint: framed POSTs on one URL.
    Http,
}

/// Health check knobs for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Seconds between probes.
    pub interval: f64,
    /// Seconds a probe may take.
    pub timeout: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { enabled: false, interval: 30.0, timeout: DEFAULT_HEALTH_TIMEOUT.as_secs_f64() }
    }
}

impl HealthCheckConfig {
    #[must_use]
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval.max(0.1))
    }

    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.1))
    }
}

/// Full descriptor for one backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Backend name; filled from the config map key when loaded from a file.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Per-request budget in seconds.
    pub timeout: f64,
    pub transport_type: TransportType,
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
    pub retry_attempts: u32,
    /// Base delay in seconds; doubled per attempt.
    pub retry_delay: f64,
    pub health_check: HealthCheckConfig,
    pub tool_namespace: Option<String>,
    pub resource_namespace: Option<String>,
    pub prompt_namespace: Option<String>,
    /// Lower wins conflicts under the `priority` policy.
    pub priority: i32,
    pub tags: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT.as_secs_f64(),
            transport_type: TransportType::Stdio,
            url: None,
            headers: HashMap::new(),
            retry_attempts: 3,
            retry_delay: 1.0,
            health_check: HealthCheckConfig::default(),
            tool_namespace: None,
            resource_namespace: None,
            prompt_namespace: None,
            priority: 100,
            tags: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Descriptor for a stdio server given as `command arg arg…` on the CLI.
    pub fn from_command_line(name: &str, command_line: &str) -> Result<Self, ConfigError> {
        let mut parts = command_line.split_whitespace();
        let command = parts
            .next()
            .ok_or_else(|| ConfigError::server(name, "empty command"))?
            .to_string();
        Ok(Self {
            name: name.to_string(),
            command,
            args: parts.map(str::to_string).collect(),
            ..Self::default()
        })
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.1))
    }

    #[must_use]
    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay.max(0.0))
    }

    /// Validate the fields the transport type requires.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.transport_type {
            TransportType::Stdio => {
                if self.command.trim().is_empty() {
                    return Err(ConfigError::server(&self.name, "stdio server without command"));
                }
            }
            TransportType::Sse | TransportType::Http => {
                if self.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return Err(ConfigError::server(&self.name, "remote server without url"));
                }
            }
        }
        Ok(())
    }

    /// Config echo for `/status` with secret-bearing values masked.
    #[must_use]
    pub fn sanitized(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(env) = value.get_mut("env").and_then(Value::as_object_mut) {
            for (key, val) in env.iter_mut() {
                if is_sensitive_key(key) {
                    *val = Value::String(MASKED.to_string());
                }
            }
        }
        if let Some(headers) = value.get_mut("headers").and_then(Value::as_object_mut) {
            for (key, val) in headers.iter_mut() {
                if is_sensitive_key(key) {
                    *val = Value::String(MASKED.to_string());
                }
            }
        }
        value
    }
}

/// Conflict resolution when two backends produce the same aggregated name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Force default namespaces on; residual collisions fall through to
    /// priority.
    #[default]
    Namespace,
    /// Lower `priority` value wins; ties break by backend name.
    Priority,
    /// First backend in config order wins.
    First,
    /// Refuse to include either name.
    Error,
}

/// Which capability kinds are aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregationConfig {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { tools: true, resources: true, prompts: true }
    }
}

/// Failover thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailoverConfig {
    pub enabled: bool,
    /// Consecutive failures before a backend is marked failed.
    pub max_failures: u32,
    /// Seconds before a failed backend is retried.
    pub recovery_interval: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self { enabled: true, max_failures: 3, recovery_interval: 30.0 }
    }
}

impl FailoverConfig {
    #[must_use]
    pub fn recovery_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_interval.max(0.1))
    }
}

/// Bridge-level aggregation policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    pub conflict_resolution: ConflictResolution,
    /// When true, backends without an explicit namespace use their name.
    pub default_namespace: bool,
    pub aggregation: AggregationConfig,
    pub failover: FailoverConfig,
}

/// Parsed bridge config file: full server descriptors plus bridge policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub mcp_servers: HashMap<String, ServerConfig>,
    pub bridge: BridgeSettings,
}

/// One entry of the simple named-server file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NamedServerEntry {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    enabled: bool,
}

impl Default for NamedServerEntry {
    fn default() -> Self {
        Self { command: String::new(), args: Vec::new(), env: HashMap::new(), enabled: true }
    }
}

/// Load the full bridge config file. A malformed top level is fatal.
pub fn load_bridge_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::io(path.display().to_string(), e))?;
    let mut value: Value = serde_json::from_str(&text)
        .map_err(|e| ConfigError::json(path.display().to_string(), e))?;
    expand_env(&mut value);
    let mut config: BridgeConfig = serde_json::from_value(value)
        .map_err(|e| ConfigError::json(path.display().to_string(), e))?;
    for (name, server) in &mut config.mcp_servers {
        server.name.clone_from(name);
        server.validate()?;
    }
    Ok(config)
}

/// Load the simple named-server file. Disabled or malformed single entries
/// are logged and skipped; a malformed top level is fatal.
pub fn load_named_servers(path: &Path) -> Result<Vec<ServerConfig>, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::io(path.display().to_string(), e))?;
    let mut value: Value = serde_json::from_str(&text)
        .map_err(|e| ConfigError::json(path.display().to_string(), e))?;
    expand_env(&mut value);

    let entries = value
        .get("mcpServers")
        .and_then(Value::as_object)
        .ok_or_else(|| ConfigError::Invalid(format!("{}: missing mcpServers", path.display())))?;

    let mut servers = Vec::new();
    for (name, entry) in entries {
        let entry: NamedServerEntry = match serde_json::from_value(entry.clone()) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "skipping malformed server entry");
                continue;
            }
        };
        if !entry.enabled {
            tracing::info!(server = %name, "server disabled, skipping");
            continue;
        }
        if entry.command.trim().is_empty() {
            tracing::warn!(server = %name, "skipping server entry without command");
            continue;
        }
        servers.push(ServerConfig {
            name: name.clone(),
            command: entry.command,
            args: entry.args,
            env: entry.env,
            ..ServerConfig::default()
        });
    }
    Ok(servers)
}

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").expect("env reference pattern")
});

/// Expand `${NAME}` / `${NAME:default}` in one string against the process
/// environment.
#[must_use]
pub fn expand_env_str(input: &str) -> String {
    expand_str_with(input, |name| std::env::var(name).ok())
}

/// Expansion against an arbitrary lookup; the process-env path and the tests
/// share this.
pub fn expand_str_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures<'_>| {
            lookup(&caps[1])
                .unwrap_or_else(|| caps.get(2).map_or(String::new(), |d| d.as_str().to_string()))
        })
        .into_owned()
}

/// Recursively expand env references through every string of a JSON value.
pub fn expand_env(value: &mut Value) {
    expand_with(value, &|name| std::env::var(name).ok());
}

/// Recursive expansion against an arbitrary lookup.
pub fn expand_with(value: &mut Value, lookup: &impl Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = expand_str_with(s, lookup);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| expand_with(v, lookup)),
        Value::Object(map) => map.values_mut().for_each(|v| expand_with(v, lookup)),
        _ => {}
    }
}

const MASKED: &str = "***";

/// True for header/env names whose values must never reach the logs.
#[must_use]
pub fn is_sensitive_key(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "authorization"
        || lower == "x-api-key"
        || lower.contains("token")
        || lower.contains("secret")
}

/// Value safe to log for the given header or env key.
#[must_use]
pub fn loggable_value<'v>(key: &str, value: &'v str) -> &'v str {
    if is_sensitive_key(key) { MASKED } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let server = ServerConfig::default();
        assert!(server.enabled);
        assert_eq!(server.transport_type, TransportType::Stdio);
        assert_eq!(server.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(server.retry_attempts, 3);
    }

    #[test]
    fn command_line_split() {
        let server = ServerConfig::from_command_line("fetch", "uvx mcp-server-fetch --strict")
            .unwrap();
        assert_eq!(server.command, "uvx");
        assert_eq!(server.args, vec!["mcp-server-fetch", "--strict"]);
        assert!(ServerConfig::from_command_line("bad", "   ").is_err());
    }

    #[test]
    fn validate_requires_url_for_remote() {
        let server = ServerConfig {
            name: "r".into(),
            transport_type: TransportType::Sse,
            command: String::new(),
            ..ServerConfig::default()
        };
        assert!(server.validate().is_err());
    }

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs.iter().find(|(k, _)| *k == name).map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn expand_with_default() {
        let env = lookup(&[]);
        assert_eq!(expand_str_with("${GH:default-abc}", &env), "default-abc");
        assert_eq!(expand_str_with("${GH}", &env), "");

        let env = lookup(&[("GH", "xyz")]);
        assert_eq!(expand_str_with("${GH:default-abc}", &env), "xyz");
    }

    #[test]
    fn expand_is_idempotent_without_refs() {
        let plain = "no refs here $HOME {not:one}";
        assert_eq!(expand_str_with(plain, lookup(&[("HOME", "/root")])), plain);
    }

    #[test]
    fn expand_recurses_through_values() {
        let env = lookup(&[("TOKEN", "tok")]);
        let mut value = serde_json::json!({
            "env": {"TOKEN": "${TOKEN}"},
            "args": ["--auth", "${TOKEN:fallback}"],
            "nested": {"deep": ["${MISSING:d}"]},
        });
        expand_with(&mut value, &env);
        assert_eq!(value["env"]["TOKEN"], "tok");
        assert_eq!(value["args"][1], "tok");
        assert_eq!(value["nested"]["deep"][0], "d");
    }

    #[test]
    fn sensitive_keys_are_masked() {
        assert!(is_sensitive_key("Authorization"));
        assert!(is_sensitive_key("X-Api-Key"));
        assert!(is_sensitive_key("GITHUB_TOKEN"));
        assert!(is_sensitive_key("client_secret"));
        assert!(!is_sensitive_key("Content-Type"));
        assert_eq!(loggable_value("Authorization", "Bearer abc"), "***");
        assert_eq!(loggable_value("Accept", "text/event-stream"), "text/event-stream");
    }

    #[test]
    fn sanitized_masks_env_and_headers() {
        let server = ServerConfig {
            name: "s".into(),
            command: "cmd".into(),
            env: HashMap::from([("API_TOKEN".to_string(), "secret-value".to_string())]),
            headers: HashMap::from([("Authorization".to_string(), "Bearer x".to_string())]),
            ..ServerConfig::default()
        };
        let value = server.sanitized();
        assert_eq!(value["env"]["API_TOKEN"], "***");
        assert_eq!(value["headers"]["Authorization"], "***");
        assert_eq!(value["command"], "cmd");
    }
}
