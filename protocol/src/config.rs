use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use warden_policy::CompiledPolicy;

/// Serializable sandbox configuration: everything needed to spawn an
/// equivalent worker. This is the payload of `Op::Reset` and the plaintext
/// of a sealed checkpoint blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<CompiledPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_bytes: Option<u64>,
    /// Modules the guarded importer admits. Ordered for a canonical
    /// serialized form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_imports: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numa_node: Option<u32>,
}

impl SandboxConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn optional_fields_are_omitted() {
        let cfg = SandboxConfig::named("echo");
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json, serde_json::json!({"name": "echo"}));
    }

    #[test]
    fn config_round_trips() {
        let cfg = SandboxConfig {
            name: "sb".to_string(),
            cpu_ms: Some(10),
            mem_bytes: Some(1 << 20),
            allowed_imports: Some(["math".to_string()].into()),
            numa_node: Some(0),
            policy: None,
        };
        let text = serde_json::to_string(&cfg).unwrap();
        let back: SandboxConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }
}
