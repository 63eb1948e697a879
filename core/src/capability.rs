use std::sync::Arc;

/// Opaque token gating privileged supervisor operations.
///
/// Tokens compare by identity, not by name: cloning preserves identity,
/// while a freshly minted token with an identical name is a different
/// capability and will be rejected.
#[derive(Clone, Debug)]
pub struct Capability {
    inner: Arc<CapabilityInner>,
}

#[derive(Debug)]
struct CapabilityInner {
    name: String,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CapabilityInner { name: name.into() }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identity check: true only for clones of the same minted token.
    pub fn is(&self, other: &Capability) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
