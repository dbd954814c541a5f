use serde::{Deserialize, Serialize};

/// Identifier allocated by the loader to track one registered resource.
///
/// Handles are stable for the lifetime of the registry. Parent/child links
/// between resources store handles rather than direct references, so chunk
/// re-weighting never has to chase a moved or reset resource.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Serialize, Deserialize)]
pub struct ResourceHandle(pub u64);

impl ResourceHandle {
    pub fn new(index: u64) -> Self {
        Self(index)
    }
}
