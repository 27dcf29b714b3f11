//! Weak reference registry
//!
//! Weak references observe heap objects without keeping them alive. Each
//! registered reference keeps its identifier for the whole VM lifetime; when
//! the collector finalizes a target, every observer is nulled in place. The
//! registry itself is only dropped at VM teardown.

use crate::gc::Handle;

/// Stable identifier of a weak reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakId(u32);

impl WeakId {
    /// Encode the identifier as an integer value payload
    pub fn to_i64(self) -> i64 {
        self.0 as i64
    }

    /// Decode an integer value payload back into an identifier
    pub fn from_i64(raw: i64) -> Option<Self> {
        u32::try_from(raw).ok().map(WeakId)
    }
}

/// Registry of all weak references created by the engine
#[derive(Debug, Default)]
pub struct WeakRegistry {
    refs: Vec<Option<Handle>>,
}

impl WeakRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new weak reference, possibly already dead
    pub fn create(&mut self, target: Option<Handle>) -> WeakId {
        let id = WeakId(self.refs.len() as u32);
        self.refs.push(target);
        id
    }

    /// The current target, if the reference exists and is still set
    pub fn get(&self, id: WeakId) -> Option<Handle> {
        self.refs.get(id.0 as usize).copied().flatten()
    }

    /// Null the reference; called when its target is finalized
    pub fn invalidate(&mut self, id: WeakId) {
        if let Some(slot) = self.refs.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    /// Number of references ever created
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Check if no references were created
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
