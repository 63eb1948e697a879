//! Compiler from the declarative policy document to a [`CompiledPolicy`].
//!
//! The accepted document shape is:
//!
//! ```yaml
//! version: "0.1"
//! sandboxes:
//!   worker:
//!     fs:
//!       - allow: /tmp
//!       - deny: /tmp/secret
//!     net:
//!       - connect: "127.0.0.1:8080"
//!     imports: [math, strings]
//! ```
//!
//! A shorthand document with `fs`/`net`/`imports` at the root is promoted to
//! a single `default` sandbox. Conflicting rules (identical path or address
//! with differing actions) fail compilation. Unknown per-sandbox keys are
//! rejected rather than ignored.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_json::Value;
use thiserror::Error;

use crate::ruleset::CompiledPolicy;
use crate::ruleset::FsAction;
use crate::ruleset::FsRule;
use crate::ruleset::NetAction;
use crate::ruleset::NetRule;
use crate::ruleset::POLICY_VERSION;
use crate::ruleset::SandboxRules;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PolicyCompilerError(pub String);

impl PolicyCompilerError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Compile a policy document from a file. JSON documents are detected by a
/// leading `{`; anything else is parsed as YAML.
pub fn compile_file(path: &Path) -> Result<CompiledPolicy, PolicyCompilerError> {
    let text = fs::read_to_string(path)
        .map_err(|e| PolicyCompilerError::new(format!("cannot read {}: {e}", path.display())))?;
    compile_str(&text)
}

pub fn compile_str(text: &str) -> Result<CompiledPolicy, PolicyCompilerError> {
    let doc: Value = if text.trim_start().starts_with('{') {
        serde_json::from_str(text)
            .map_err(|e| PolicyCompilerError::new(format!("invalid JSON: {e}")))?
    } else {
        serde_yaml::from_str(text)
            .map_err(|e| PolicyCompilerError::new(format!("invalid YAML: {e}")))?
    };
    compile_json(&doc)
}

/// Compile an already-parsed document.
pub fn compile_json(doc: &Value) -> Result<CompiledPolicy, PolicyCompilerError> {
    let root = doc
        .as_object()
        .ok_or_else(|| PolicyCompilerError::new("policy document must be a mapping"))?;

    let version = root
        .get("version")
        .ok_or_else(|| PolicyCompilerError::new("policy missing \"version\" key"))?;
    let version = match version {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(PolicyCompilerError::new(format!(
                "unsupported policy version: {other}"
            )));
        }
    };
    if version != POLICY_VERSION {
        return Err(PolicyCompilerError::new(format!(
            "unsupported policy version: {version}"
        )));
    }

    // A document without a `sandboxes` key is shorthand for a single
    // `default` sandbox built from the remaining root keys.
    let sandboxes = match root.get("sandboxes") {
        Some(value) => value
            .as_object()
            .ok_or_else(|| PolicyCompilerError::new("missing or invalid 'sandboxes' section"))?,
        None => {
            let synthesized = root
                .iter()
                .filter(|(k, _)| k.as_str() != "version")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<serde_json::Map<String, Value>>();
            let mut default = serde_json::Map::new();
            default.insert("default".to_string(), Value::Object(synthesized));
            return compile_sandboxes(&default);
        }
    };

    compile_sandboxes(sandboxes)
}

fn compile_sandboxes(
    sandboxes: &serde_json::Map<String, Value>,
) -> Result<CompiledPolicy, PolicyCompilerError> {
    let mut compiled = CompiledPolicy::default();
    for (name, cfg) in sandboxes {
        let cfg = cfg
            .as_object()
            .ok_or_else(|| PolicyCompilerError::new(format!("sandbox '{name}' must be a mapping")))?;

        for key in cfg.keys() {
            if !matches!(key.as_str(), "fs" | "net" | "tcp" | "imports") {
                return Err(PolicyCompilerError::new(format!(
                    "unknown key '{key}' in sandbox '{name}'"
                )));
            }
        }

        // Absent sections stay `None`; an explicit empty list compiles to an
        // empty rule set, which restricts rather than defaults.
        let fs = match cfg.get("fs") {
            Some(v) => Some(compile_fs(list_of(v, "fs", name)?, name)?),
            None => None,
        };
        // `net` is the authoring key; `tcp` is accepted for already-compiled
        // documents fed back through the compiler.
        let net_raw = match cfg.get("net") {
            Some(v) => Some(list_of(v, "net", name)?),
            None => match cfg.get("tcp") {
                Some(v) => Some(list_of(v, "tcp", name)?),
                None => None,
            },
        };
        let net = match net_raw {
            Some(raw) => Some(compile_net(raw, name)?),
            None => None,
        };
        let imports = compile_imports(rule_list(cfg, "imports", name)?, name)?;

        compiled
            .sandboxes
            .insert(name.clone(), SandboxRules { fs, net, imports });
    }
    Ok(compiled)
}

fn rule_list<'a>(
    cfg: &'a serde_json::Map<String, Value>,
    key: &str,
    name: &str,
) -> Result<&'a [Value], PolicyCompilerError> {
    match cfg.get(key) {
        Some(v) => list_of(v, key, name),
        None => Ok(&[]),
    }
}

fn list_of<'a>(value: &'a Value, key: &str, name: &str) -> Result<&'a [Value], PolicyCompilerError> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| PolicyCompilerError::new(format!("'{key}' in '{name}' must be a list")))
}

/// A rule entry is a single-key mapping `{action: target}`, or the
/// already-compiled `{action, path|addr}` form.
fn rule_entry(rule: &Value, section: &str, name: &str) -> Result<(String, String), PolicyCompilerError> {
    let obj = rule.as_object().ok_or_else(|| {
        PolicyCompilerError::new(format!("invalid {section} rule in '{name}': {rule}"))
    })?;
    if let (Some(action), Some(target)) = (obj.get("action"), obj.get("path").or_else(|| obj.get("addr"))) {
        if obj.len() == 2
            && let (Some(action), Some(target)) = (action.as_str(), target.as_str())
        {
            return Ok((action.to_string(), target.to_string()));
        }
    }
    if obj.len() != 1 {
        return Err(PolicyCompilerError::new(format!(
            "invalid {section} rule in '{name}': {rule}"
        )));
    }
    let (action, target) = obj
        .iter()
        .next()
        .ok_or_else(|| PolicyCompilerError::new(format!("invalid {section} rule in '{name}'")))?;
    let target = target.as_str().ok_or_else(|| {
        PolicyCompilerError::new(format!("invalid {section} rule in '{name}': {rule}"))
    })?;
    Ok((action.clone(), target.to_string()))
}

fn compile_fs(rules: &[Value], name: &str) -> Result<Vec<FsRule>, PolicyCompilerError> {
    let mut compiled = Vec::new();
    let mut seen: HashMap<String, FsAction> = HashMap::new();
    for rule in rules {
        let (action, path) = rule_entry(rule, "fs", name)?;
        let action = match action.as_str() {
            "allow" => FsAction::Allow,
            "deny" => FsAction::Deny,
            other => {
                return Err(PolicyCompilerError::new(format!(
                    "invalid fs action '{other}' in '{name}'"
                )));
            }
        };
        if let Some(prev) = seen.get(&path)
            && *prev != action
        {
            return Err(PolicyCompilerError::new(format!(
                "conflicting fs rules for '{path}' in '{name}'"
            )));
        }
        seen.insert(path.clone(), action);
        compiled.push(FsRule { action, path });
    }
    Ok(compiled)
}

fn compile_net(rules: &[Value], name: &str) -> Result<Vec<NetRule>, PolicyCompilerError> {
    let mut compiled = Vec::new();
    let mut seen: HashMap<String, NetAction> = HashMap::new();
    for rule in rules {
        let (action, addr) = rule_entry(rule, "net", name)?;
        let action = match action.as_str() {
            "connect" => NetAction::Connect,
            "deny" => NetAction::Deny,
            other => {
                return Err(PolicyCompilerError::new(format!(
                    "invalid net action '{other}' in '{name}'"
                )));
            }
        };
        if let Some(prev) = seen.get(&addr)
            && *prev != action
        {
            return Err(PolicyCompilerError::new(format!(
                "conflicting net rules for '{addr}' in '{name}'"
            )));
        }
        seen.insert(addr.clone(), action);
        compiled.push(NetRule { action, addr });
    }
    Ok(compiled)
}

fn compile_imports(rules: &[Value], name: &str) -> Result<Vec<String>, PolicyCompilerError> {
    let mut imports = Vec::new();
    for module in rules {
        let module = module.as_str().ok_or_else(|| {
            PolicyCompilerError::new(format!("import rules in '{name}' must be strings: {module}"))
        })?;
        imports.push(module.to_string());
    }
    Ok(imports)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn compiles_full_document() {
        let policy = compile_str(
            r#"
version: "0.1"
sandboxes:
  worker:
    fs:
      - allow: /tmp
      - deny: /tmp/secret
    net:
      - connect: "127.0.0.1:9000"
    imports:
      - math
"#,
        )
        .unwrap();
        let rules = &policy.sandboxes["worker"];
        assert_eq!(rules.fs.as_deref().unwrap().len(), 2);
        assert_eq!(rules.net.as_deref().unwrap().len(), 1);
        assert_eq!(rules.imports, vec!["math".to_string()]);
    }

    #[test]
    fn shorthand_promotes_to_default() {
        let policy = compile_str(
            r#"
version: "0.1"
fs:
  - allow: /tmp
"#,
        )
        .unwrap();
        assert!(policy.sandboxes.contains_key("default"));
        assert_eq!(policy.sandboxes["default"].fs.as_deref().unwrap().len(), 1);
    }

    #[test]
    fn accepts_json_documents() {
        let policy = compile_str(
            r#"{"version": "0.1", "sandboxes": {"sb": {"imports": ["net"]}}}"#,
        )
        .unwrap();
        assert_eq!(policy.sandboxes["sb"].imports, vec!["net".to_string()]);
    }

    #[test]
    fn missing_version_is_rejected() {
        let err = compile_str("sandboxes: {}\n").unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = compile_str("version: \"0.2\"\nsandboxes: {}\n").unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn unquoted_yaml_version_number_is_coerced() {
        // `version: 0.1` parses as a float; the compiler stringifies it.
        let policy = compile_str("version: 0.1\nsandboxes: {}\n").unwrap();
        assert!(policy.sandboxes.is_empty());
    }

    #[test]
    fn conflicting_fs_rules_fail() {
        let err = compile_str(
            r#"
version: "0.1"
sandboxes:
  sb:
    fs:
      - allow: /t/d
      - deny: /t/d
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("conflicting fs rules"));
    }

    #[test]
    fn repeated_rule_with_same_action_is_not_a_conflict() {
        let policy = compile_str(
            r#"
version: "0.1"
sandboxes:
  sb:
    fs:
      - allow: /t/d
      - allow: /t/d
"#,
        )
        .unwrap();
        assert_eq!(policy.sandboxes["sb"].fs.as_deref().unwrap().len(), 2);
    }

    #[test]
    fn unknown_sandbox_key_is_rejected() {
        let err = compile_str(
            r#"
version: "0.1"
sandboxes:
  sb:
    env:
      - HOME
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown key 'env'"));
    }

    #[test]
    fn invalid_action_is_rejected() {
        let err = compile_str(
            r#"
version: "0.1"
sandboxes:
  sb:
    net:
      - listen: "0.0.0.0:80"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid net action"));
    }

    #[test]
    fn non_mapping_root_is_rejected() {
        let err = compile_str("- a\n- b\n").unwrap_err();
        assert!(err.to_string().contains("must be a mapping"));
    }

    #[test]
    fn compiled_form_round_trips_through_the_compiler() {
        let policy = compile_str(
            r#"
version: "0.1"
sandboxes:
  sb:
    fs:
      - allow: /tmp
    net:
      - connect: "127.0.0.1:1"
"#,
        )
        .unwrap();
        let mut wire = serde_json::to_value(&policy).unwrap();
        wire.as_object_mut()
            .unwrap()
            .insert("version".to_string(), serde_json::json!("0.1"));
        let reparsed = compile_json(&wire).unwrap();
        assert_eq!(policy, reparsed);
    }
}
