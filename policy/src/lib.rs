//! Declarative sandbox policy: compiler and compiled rule sets.
//!
//! Policies are authored as a small YAML (or JSON) document, compiled into a
//! validated [`CompiledPolicy`], and evaluated with first-match-wins
//! semantics by the sandbox runtime.

mod compiler;
mod ruleset;

pub use compiler::PolicyCompilerError;
pub use compiler::compile_file;
pub use compiler::compile_json;
pub use compiler::compile_str;
pub use ruleset::CompiledPolicy;
pub use ruleset::FsAction;
pub use ruleset::FsRule;
pub use ruleset::NetAction;
pub use ruleset::NetRule;
pub use ruleset::POLICY_VERSION;
pub use ruleset::SandboxRules;
pub use ruleset::fs_rules_allow;
pub use ruleset::net_rules_allow;
