//! Capability aggregation across backends.
//!
//! The union view is published as an immutable snapshot: readers clone an
//! `Arc`, the single writer (the bridge event loop) rebuilds and swaps.
//! Tool and prompt names are namespaced as `<ns>.<name>`; resource URIs get
//! a `<ns>+` prefix so the original scheme survives the round trip.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Value, json};

use crate::backend::{Capabilities, ManagedBackend};
use crate::config::{AggregationConfig, BridgeSettings, ConflictResolution};
use crate::protocol::PROTOCOL_VERSION;

/// Separator between a namespace and a tool or prompt name.
pub const NAME_SEPARATOR: char = '.';

/// Separator between a namespace and a resource URI.
pub const URI_SEPARATOR: char = '+';

/// Who owns an aggregated name, and what it is called at home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerEntry {
    pub server: String,
    pub original: String,
}

/// Immutable union view over every connected backend.
#[derive(Debug, Default)]
pub struct AggregateSnapshot {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub resource_templates: Vec<Value>,
    pub prompts: Vec<Value>,
    /// Wire name → owner, per kind. This is the reverse index the router
    /// uses to un-prefix names.
    pub tool_owners: HashMap<String, OwnerEntry>,
    pub resource_owners: HashMap<String, OwnerEntry>,
    pub prompt_owners: HashMap<String, OwnerEntry>,
    /// Connected backends in routing order: priority, then name.
    pub priority_order: Vec<String>,
    /// Synthesized capability descriptor.
    pub capabilities: Value,
}

impl AggregateSnapshot {
    /// The synthetic `InitializeResult` the bridge advertises.
    #[must_use]
    pub fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": self.capabilities,
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    #[must_use]
    pub fn resolve_tool(&self, wire_name: &str) -> Option<&OwnerEntry> {
        self.tool_owners.get(wire_name)
    }

    #[must_use]
    pub fn resolve_prompt(&self, wire_name: &str) -> Option<&OwnerEntry> {
        self.prompt_owners.get(wire_name)
    }

    #[must_use]
    pub fn resolve_resource(&self, wire_uri: &str) -> Option<&OwnerEntry> {
        self.resource_owners.get(wire_uri)
    }

    /// Wire URI for a backend's original URI, for renaming
    /// `notifications/resources/updated` on the way out.
    #[must_use]
    pub fn wire_resource_uri(&self, server: &str, original: &str) -> Option<&str> {
        self.resource_owners
            .iter()
            .find(|(_, owner)| owner.server == server && owner.original == original)
            .map(|(wire, _)| wire.as_str())
    }
}

/// What one backend contributes to the union.
#[derive(Debug, Clone)]
pub struct BackendContribution {
    pub name: String,
    pub priority: i32,
    /// Config registration order, for the `first` policy.
    pub order: usize,
    pub tool_namespace: Option<String>,
    pub resource_namespace: Option<String>,
    pub prompt_namespace: Option<String>,
    pub capabilities: Arc<Capabilities>,
    /// Capabilities the backend advertised in its handshake.
    pub advertised: Option<Value>,
}

/// Aggregation layer: owns the policy and the published snapshot.
pub struct Aggregator {
    settings: BridgeSettings,
    snapshot: RwLock<Arc<AggregateSnapshot>>,
}

impl Aggregator {
    #[must_use]
    pub fn new(settings: BridgeSettings) -> Self {
        Self { settings, snapshot: RwLock::new(Arc::new(AggregateSnapshot::default())) }
    }

    #[must_use]
    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Current union; cheap clone of the published `Arc`.
    #[must_use]
    pub fn snapshot(&self) -> Arc<AggregateSnapshot> {
        self.snapshot
            .read()
            .map_or_else(|_| Arc::new(AggregateSnapshot::default()), |s| Arc::clone(&s))
    }

    /// Rebuild the union from the connected backends and publish it.
    pub fn rebuild(&self, backends: &[Arc<ManagedBackend>]) {
        let contributions: Vec<BackendContribution> = backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.status() == crate::backend::BackendStatus::Connected)
            .map(|(order, b)| {
                let config = b.config();
                BackendContribution {
                    name: config.name.clone(),
                    priority: config.priority,
                    order,
                    tool_namespace: config.tool_namespace.clone(),
                    resource_namespace: config.resource_namespace.clone(),
                    prompt_namespace: config.prompt_namespace.clone(),
                    capabilities: b.capabilities(),
                    advertised: b.current_session().and_then(|s| s.capabilities()),
                }
            })
            .collect();
        let snapshot = build_snapshot(&contributions, &self.settings);
        if let Ok(mut slot) = self.snapshot.write() {
            *slot = Arc::new(snapshot);
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator").field("settings", &self.settings).finish()
    }
}

/// Prefix a tool or prompt name.
#[must_use]
pub fn rename(name: &str, namespace: &str) -> String {
    format!("{namespace}{NAME_SEPARATOR}{name}")
}

/// Strip a namespace prefix applied by [`rename`].
#[must_use]
pub fn unrename<'n>(wire_name: &'n str, namespace: &str) -> &'n str {
    wire_name
        .strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix(NAME_SEPARATOR))
        .unwrap_or(wire_name)
}

/// Prefix a resource URI.
#[must_use]
pub fn rename_uri(uri: &str, namespace: &str) -> String {
    format!("{namespace}{URI_SEPARATOR}{uri}")
}

struct Candidate {
    wire_name: String,
    original: String,
    server: String,
    server_priority: i32,
    order: usize,
    value: Value,
    namespaced: bool,
}

enum Kind {
    Tool,
    Resource,
    Prompt,
}

impl Kind {
    fn key(&self) -> &'static str {
        match self {
            Self::Tool | Self::Prompt => "name",
            Self::Resource => "uri",
        }
    }

    fn namespace_of(&self, backend: &BackendContribution) -> Option<String> {
        match self {
            Self::Tool => backend.tool_namespace.clone(),
            Self::Resource => backend.resource_namespace.clone(),
            Self::Prompt => backend.prompt_namespace.clone(),
        }
    }

    fn apply(&self, name: &str, namespace: &str) -> String {
        match self {
            Self::Tool | Self::Prompt => rename(name, namespace),
            Self::Resource => rename_uri(name, namespace),
        }
    }

    fn list<'c>(&self, caps: &'c Capabilities) -> &'c [Value] {
        match self {
            Self::Tool => &caps.tools,
            Self::Resource => &caps.resources,
            Self::Prompt => &caps.prompts,
        }
    }
}

/// Build the published union from per-backend contributions.
#[must_use]
pub fn build_snapshot(
    backends: &[BackendContribution],
    settings: &BridgeSettings,
) -> AggregateSnapshot {
    let AggregationConfig { tools, resources, prompts } = settings.aggregation.clone();

    let (tool_list, tool_owners) = if tools {
        union_kind(backends, settings, &Kind::Tool)
    } else {
        (Vec::new(), HashMap::new())
    };
    let (resource_list, resource_owners) = if resources {
        union_kind(backends, settings, &Kind::Resource)
    } else {
        (Vec::new(), HashMap::new())
    };
    let (prompt_list, prompt_owners) = if prompts {
        union_kind(backends, settings, &Kind::Prompt)
    } else {
        (Vec::new(), HashMap::new())
    };

    // Templates ride along with resources, un-renamed: template URIs are
    // patterns, not addresses.
    let resource_templates = if resources {
        backends
            .iter()
            .flat_map(|b| b.capabilities.resource_templates.iter().cloned())
            .collect()
    } else {
        Vec::new()
    };

    let mut priority_order: Vec<(i32, String)> =
        backends.iter().map(|b| (b.priority, b.name.clone())).collect();
    priority_order.sort();

    let capabilities = synthesize_capabilities(backends);

    AggregateSnapshot {
        tools: tool_list,
        resources: resource_list,
        resource_templates,
        prompts: prompt_list,
        tool_owners,
        resource_owners,
        prompt_owners,
        priority_order: priority_order.into_iter().map(|(_, name)| name).collect(),
        capabilities,
    }
}

/// Advertise a capability iff at least one backend advertises it.
fn synthesize_capabilities(backends: &[BackendContribution]) -> Value {
    let mut caps = serde_json::Map::new();
    let advertises = |key: &str| {
        backends.iter().any(|b| {
            b.advertised
                .as_ref()
                .and_then(|a| a.get(key))
                .is_some_and(|v| !v.is_null())
        })
    };
    if advertises("tools") || backends.iter().any(|b| !b.capabilities.tools.is_empty()) {
        caps.insert("tools".into(), json!({ "listChanged": true }));
    }
    if advertises("resources") || backends.iter().any(|b| !b.capabilities.resources.is_empty()) {
        caps.insert("resources".into(), json!({ "listChanged": true, "subscribe": true }));
    }
    if advertises("prompts") || backends.iter().any(|b| !b.capabilities.prompts.is_empty()) {
        caps.insert("prompts".into(), json!({ "listChanged": true }));
    }
    if advertises("logging") {
        caps.insert("logging".into(), json!({}));
    }
    Value::Object(caps)
}

fn union_kind(
    backends: &[BackendContribution],
    settings: &BridgeSettings,
    kind: &Kind,
) -> (Vec<Value>, HashMap<String, OwnerEntry>) {
    let mut candidates: Vec<Candidate> = Vec::new();
    for backend in backends {
        let namespace = kind.namespace_of(backend).or_else(|| {
            settings.default_namespace.then(|| backend.name.clone())
        });
        for item in kind.list(&backend.capabilities) {
            let Some(original) = item.get(kind.key()).and_then(Value::as_str) else {
                continue;
            };
            let (wire_name, namespaced) = match &namespace {
                Some(ns) => (kind.apply(original, ns), true),
                None => (original.to_string(), false),
            };
            candidates.push(Candidate {
                wire_name,
                original: original.to_string(),
                server: backend.name.clone(),
                server_priority: backend.priority,
                order: backend.order,
                value: item.clone(),
                namespaced,
            });
        }
    }

    resolve_conflicts(&mut candidates, settings.conflict_resolution, kind);

    let mut list = Vec::with_capacity(candidates.len());
    let mut owners = HashMap::with_capacity(candidates.len());
    for candidate in candidates {
        let mut value = candidate.value;
        if candidate.namespaced {
            if let Some(obj) = value.as_object_mut() {
                obj.insert(kind.key().to_string(), Value::String(candidate.wire_name.clone()));
            }
        }
        owners.insert(
            candidate.wire_name,
            OwnerEntry { server: candidate.server, original: candidate.original },
        );
        list.push(value);
    }
    (list, owners)
}

/// Drop or re-namespace colliding candidates per the active policy.
fn resolve_conflicts(candidates: &mut Vec<Candidate>, policy: ConflictResolution, kind: &Kind) {
    loop {
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, candidate) in candidates.iter().enumerate() {
            groups.entry(candidate.wire_name.clone()).or_default().push(index);
        }
        let colliding: Vec<Vec<usize>> =
            groups.into_values().filter(|members| members.len() > 1).collect();
        if colliding.is_empty() {
            return;
        }

        match policy {
            ConflictResolution::Namespace => {
                // Force default namespaces onto the colliding entries; a
                // second pass settles anything that still collides.
                let mut renamed_any = false;
                for members in &colliding {
                    for &index in members {
                        let candidate = &mut candidates[index];
                        if !candidate.namespaced {
                            candidate.wire_name =
                                kind.apply(&candidate.original, &candidate.server.clone());
                            candidate.namespaced = true;
                            renamed_any = true;
                        }
                    }
                }
                if !renamed_any {
                    // Same namespace and name: settle by priority.
                    drop_losers(candidates, &colliding, |c| (c.server_priority, c.server.clone()));
                    return;
                }
            }
            ConflictResolution::Priority => {
                drop_losers(candidates, &colliding, |c| (c.server_priority, c.server.clone()));
                return;
            }
            ConflictResolution::First => {
                drop_losers(candidates, &colliding, |c| (i32::try_from(c.order).unwrap_or(i32::MAX), c.server.clone()));
                return;
            }
            ConflictResolution::Error => {
                let mut doomed: Vec<usize> = Vec::new();
                for members in &colliding {
                    let name = &candidates[members[0]].wire_name;
                    let servers: Vec<&str> =
                        members.iter().map(|&i| candidates[i].server.as_str()).collect();
                    tracing::error!(
                        name = %name,
                        servers = ?servers,
                        "name collision under 'error' policy, excluding all owners"
                    );
                    doomed.extend_from_slice(members);
                }
                remove_indices(candidates, doomed);
                return;
            }
        }
    }
}

/// Keep the best-ranked member of each group, drop the rest.
fn drop_losers<K: Ord>(
    candidates: &mut Vec<Candidate>,
    colliding: &[Vec<usize>],
    rank: impl Fn(&Candidate) -> K,
) {
    let mut doomed: Vec<usize> = Vec::new();
    for members in colliding {
        let winner = members
            .iter()
            .copied()
            .min_by_key(|&i| rank(&candidates[i]))
            .unwrap_or(members[0]);
        for &index in members {
            if index != winner {
                tracing::warn!(
                    name = %candidates[index].wire_name,
                    loser = %candidates[index].server,
                    winner = %candidates[winner].server,
                    "name collision resolved"
                );
                doomed.push(index);
            }
        }
    }
    remove_indices(candidates, doomed);
}

fn remove_indices(candidates: &mut Vec<Candidate>, mut doomed: Vec<usize>) {
    doomed.sort_unstable();
    doomed.dedup();
    for index in doomed.into_iter().rev() {
        candidates.remove(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(name: &str, priority: i32, order: usize, tools: Vec<Value>) -> BackendContribution {
        BackendContribution {
            name: name.into(),
            priority,
            order,
            tool_namespace: None,
            resource_namespace: None,
            prompt_namespace: None,
            capabilities: Arc::new(Capabilities { tools, ..Capabilities::default() }),
            advertised: Some(json!({"tools": {}})),
        }
    }

    fn tool(name: &str) -> Value {
        json!({"name": name, "description": "", "inputSchema": {"type": "object"}})
    }

    fn names(snapshot: &AggregateSnapshot) -> Vec<String> {
        snapshot
            .tools
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn rename_round_trip() {
        let wire = rename("search", "a");
        assert_eq!(wire, "a.search");
        assert_eq!(unrename(&wire, "a"), "search");
        // A dotted original name survives the trip.
        let wire = rename("ns.inner", "b");
        assert_eq!(unrename(&wire, "b"), "ns.inner");
    }

    #[test]
    fn single_backend_no_namespace() {
        let settings = BridgeSettings::default();
        let backends = vec![contribution("echo", 100, 0, vec![tool("echo")])];
        let snapshot = build_snapshot(&backends, &settings);
        assert_eq!(names(&snapshot), vec!["echo"]);
        let owner = snapshot.resolve_tool("echo").unwrap();
        assert_eq!(owner.server, "echo");
        assert_eq!(owner.original, "echo");
    }

    #[test]
    fn default_namespace_prefixes_everything() {
        let settings = BridgeSettings { default_namespace: true, ..BridgeSettings::default() };
        let backends = vec![
            contribution("a", 100, 0, vec![tool("search")]),
            contribution("b", 100, 1, vec![tool("search")]),
        ];
        let snapshot = build_snapshot(&backends, &settings);
        assert_eq!(names(&snapshot), vec!["a.search", "b.search"]);
        assert_eq!(snapshot.resolve_tool("a.search").unwrap().server, "a");
        assert_eq!(snapshot.resolve_tool("a.search").unwrap().original, "search");
        assert!(snapshot.resolve_tool("search").is_none());
    }

    #[test]
    fn namespace_policy_renames_on_collision() {
        let settings = BridgeSettings::default(); // namespace policy, no default ns
        let backends = vec![
            contribution("a", 100, 0, vec![tool("search"), tool("fetch")]),
            contribution("b", 100, 1, vec![tool("search")]),
        ];
        let snapshot = build_snapshot(&backends, &settings);
        let mut got = names(&snapshot);
        got.sort();
        // Only the colliding name gets namespaced.
        assert_eq!(got, vec!["a.search", "b.search", "fetch"]);
    }

    #[test]
    fn priority_policy_keeps_lower_value() {
        let settings = BridgeSettings {
            conflict_resolution: ConflictResolution::Priority,
            ..BridgeSettings::default()
        };
        let backends = vec![
            contribution("high", 10, 0, vec![tool("search")]),
            contribution("low", 50, 1, vec![tool("search")]),
        ];
        let snapshot = build_snapshot(&backends, &settings);
        assert_eq!(names(&snapshot), vec!["search"]);
        assert_eq!(snapshot.resolve_tool("search").unwrap().server, "high");
    }

    #[test]
    fn priority_ties_break_by_name() {
        let settings = BridgeSettings {
            conflict_resolution: ConflictResolution::Priority,
            ..BridgeSettings::default()
        };
        let backends = vec![
            contribution("zeta", 10, 0, vec![tool("search")]),
            contribution("alpha", 10, 1, vec![tool("search")]),
        ];
        let snapshot = build_snapshot(&backends, &settings);
        assert_eq!(snapshot.resolve_tool("search").unwrap().server, "alpha");
    }

    #[test]
    fn first_policy_keeps_config_order() {
        let settings = BridgeSettings {
            conflict_resolution: ConflictResolution::First,
            ..BridgeSettings::default()
        };
        let backends = vec![
            contribution("second-by-name", 100, 0, vec![tool("search")]),
            contribution("a-first-by-name", 100, 1, vec![tool("search")]),
        ];
        let snapshot = build_snapshot(&backends, &settings);
        assert_eq!(snapshot.resolve_tool("search").unwrap().server, "second-by-name");
    }

    #[test]
    fn error_policy_excludes_both() {
        let settings = BridgeSettings {
            conflict_resolution: ConflictResolution::Error,
            ..BridgeSettings::default()
        };
        let backends = vec![
            contribution("a", 100, 0, vec![tool("search"), tool("ok")]),
            contribution("b", 100, 1, vec![tool("search")]),
        ];
        let snapshot = build_snapshot(&backends, &settings);
        assert_eq!(names(&snapshot), vec!["ok"]);
        assert!(snapshot.resolve_tool("search").is_none());
    }

    #[test]
    fn union_is_permutation_of_renamed_inputs() {
        let settings = BridgeSettings { default_namespace: true, ..BridgeSettings::default() };
        let backends = vec![
            contribution("a", 100, 0, vec![tool("x"), tool("y")]),
            contribution("b", 100, 1, vec![tool("y"), tool("z")]),
        ];
        let snapshot = build_snapshot(&backends, &settings);
        let mut got = names(&snapshot);
        got.sort();
        assert_eq!(got, vec!["a.x", "a.y", "b.y", "b.z"]);
    }

    #[test]
    fn resource_uris_use_plus_prefix() {
        let settings = BridgeSettings { default_namespace: true, ..BridgeSettings::default() };
        let mut backend = contribution("fs", 100, 0, Vec::new());
        backend.capabilities = Arc::new(Capabilities {
            resources: vec![json!({"uri": "file:///tmp/a", "name": "a"})],
            ..Capabilities::default()
        });
        let snapshot = build_snapshot(&[backend], &settings);
        assert_eq!(snapshot.resources[0]["uri"], "fs+file:///tmp/a");
        let owner = snapshot.resolve_resource("fs+file:///tmp/a").unwrap();
        assert_eq!(owner.original, "file:///tmp/a");
        assert_eq!(snapshot.wire_resource_uri("fs", "file:///tmp/a").unwrap(), "fs+file:///tmp/a");
    }

    #[test]
    fn capability_synthesis_unions_kinds() {
        let settings = BridgeSettings::default();
        let mut with_prompts = contribution("p", 100, 1, Vec::new());
        with_prompts.capabilities = Arc::new(Capabilities {
            prompts: vec![json!({"name": "greet"})],
            ..Capabilities::default()
        });
        with_prompts.advertised = Some(json!({"prompts": {}, "logging": {}}));
        let backends = vec![contribution("t", 100, 0, vec![tool("x")]), with_prompts];
        let snapshot = build_snapshot(&backends, &settings);
        assert!(snapshot.capabilities.get("tools").is_some());
        assert!(snapshot.capabilities.get("prompts").is_some());
        assert!(snapshot.capabilities.get("logging").is_some());
        assert!(snapshot.capabilities.get("resources").is_none());
    }

    #[test]
    fn priority_order_sorts_by_priority_then_name() {
        let settings = BridgeSettings::default();
        let backends = vec![
            contribution("zeta", 1, 0, Vec::new()),
            contribution("alpha", 5, 1, Vec::new()),
            contribution("beta", 1, 2, Vec::new()),
        ];
        let snapshot = build_snapshot(&backends, &settings);
        assert_eq!(snapshot.priority_order, vec!["beta", "zeta", "alpha"]);
    }

    #[test]
    fn empty_snapshot_advertises_nothing() {
        let snapshot = build_snapshot(&[], &BridgeSettings::default());
        let init = snapshot.initialize_result();
        assert_eq!(init["protocolVersion"], PROTOCOL_VERSION);
        assert!(init["capabilities"].as_object().unwrap().is_empty());
    }
}
