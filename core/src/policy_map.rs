// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock;

use tracing::info;
use warden_policy::CompiledPolicy;
use warden_policy::PolicyCompilerError;

use crate::error::Result;
use crate::error::WardenErr;

/// The live ruleset map: the loader interface the supervisor delegates
/// policy swaps to. Workers without a policy of their own consult the
/// current snapshot at the start of each message, so a reload is an atomic
/// swap from the perspective of any subsequently-started message.
#[derive(Default)]
pub struct PolicyMap {
    current: RwLock<Option<Arc<CompiledPolicy>>>,
}

impl PolicyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a compiled-policy JSON document and swap it in. The document is
    /// fully parsed and validated before the swap, so an update that cannot
    /// be applied leaves the previous ruleset in place.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        let doc: serde_json::Value = serde_json::from_str(&text)?;
        if !doc.is_object() {
            return Err(WardenErr::Compile(PolicyCompilerError(
                "ruleset document must be an object".to_string(),
            )));
        }
        let parsed: CompiledPolicy = serde_json::from_value(doc)?;
        *self.current.write().unwrap() = Some(Arc::new(parsed));
        info!("ruleset map swapped from {}", path.display());
        Ok(())
    }

    pub fn snapshot(&self) -> Option<Arc<CompiledPolicy>> {
        self.current.read().unwrap().clone()
    }
}
