use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use wildmatch::WildMatch;

/// Schema version accepted by the compiler.
pub const POLICY_VERSION: &str = "0.1";

/// A fully validated policy: one rule block per sandbox name.
///
/// The serialized form of this type is also the wire format consumed by the
/// ruleset-map loader (`{"sandboxes": {name: {fs, tcp, imports}}}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledPolicy {
    pub sandboxes: BTreeMap<String, SandboxRules>,
}

impl CompiledPolicy {
    /// Wrap a single rule block as the `default` sandbox.
    pub fn single(rules: SandboxRules) -> Self {
        let mut sandboxes = BTreeMap::new();
        sandboxes.insert("default".to_string(), rules);
        Self { sandboxes }
    }

    /// Rules applying to a sandbox named `name`: an exact entry wins,
    /// otherwise the `default` block, otherwise nothing.
    pub fn rules_for(&self, name: &str) -> Option<&SandboxRules> {
        self.sandboxes
            .get(name)
            .or_else(|| self.sandboxes.get("default"))
    }
}

/// Per-sandbox rule block.
///
/// `fs` and `net` distinguish *absent* from *explicitly empty*: an absent
/// section keeps the legacy default (block only the system-config prefix for
/// `fs`, allow every connect for `net`), while an empty list restricts to
/// nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<Vec<FsRule>>,
    /// Network rules compile to the `tcp` key (the map-loader wire name).
    #[serde(default, rename = "tcp", skip_serializing_if = "Option::is_none")]
    pub net: Option<Vec<NetRule>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
}

impl SandboxRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_fs(mut self, path: impl Into<String>) -> Self {
        self.fs.get_or_insert_with(Vec::new).push(FsRule {
            action: FsAction::Allow,
            path: path.into(),
        });
        self
    }

    pub fn deny_fs(mut self, path: impl Into<String>) -> Self {
        self.fs.get_or_insert_with(Vec::new).push(FsRule {
            action: FsAction::Deny,
            path: path.into(),
        });
        self
    }

    pub fn allow_net(mut self, addr: impl Into<String>) -> Self {
        self.net.get_or_insert_with(Vec::new).push(NetRule {
            action: NetAction::Connect,
            addr: addr.into(),
        });
        self
    }

    pub fn deny_net(mut self, addr: impl Into<String>) -> Self {
        self.net.get_or_insert_with(Vec::new).push(NetRule {
            action: NetAction::Deny,
            addr: addr.into(),
        });
        self
    }

    /// Restrict `net` to nothing (an explicit empty list).
    pub fn deny_all_net(mut self) -> Self {
        self.net.get_or_insert_with(Vec::new);
        self
    }

    pub fn allow_import(mut self, module: impl Into<String>) -> Self {
        self.imports.push(module.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsRule {
    pub action: FsAction,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetRule {
    pub action: NetAction,
    pub addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetAction {
    Connect,
    Deny,
}

/// First matching fs rule for `path` decides; `None` when no rule matches
/// (the caller applies its default, which is deny for explicit rule sets).
pub fn fs_rules_allow(rules: &[FsRule], path: &Path) -> Option<bool> {
    for rule in rules {
        if fs_pattern_matches(&rule.path, path) {
            return Some(rule.action == FsAction::Allow);
        }
    }
    None
}

/// First matching net rule for `addr` (a `host:port` string) decides.
pub fn net_rules_allow(rules: &[NetRule], addr: &str) -> Option<bool> {
    for rule in rules {
        if addr_pattern_matches(&rule.addr, addr) {
            return Some(rule.action == NetAction::Connect);
        }
    }
    None
}

/// Whether a rule pattern covers `path`.
///
/// Globs match the whole path string. Plain patterns are treated as path
/// prefixes compared component-wise, so `/foo` covers `/foo/x` but never
/// `/foobar`.
fn fs_pattern_matches(pattern: &str, path: &Path) -> bool {
    if pattern.contains('*') || pattern.contains('?') {
        let Some(text) = path.to_str() else {
            return false;
        };
        WildMatch::new(pattern).matches(text)
    } else {
        path.starts_with(pattern)
    }
}

fn addr_pattern_matches(pattern: &str, addr: &str) -> bool {
    if pattern.contains('*') || pattern.contains('?') {
        WildMatch::new(pattern).matches(addr)
    } else {
        pattern == addr
    }
}
