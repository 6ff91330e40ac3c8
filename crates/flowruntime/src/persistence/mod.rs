//! `FlowStore` implementations.

mod file;
mod memory;

pub use file::FileFlowStore;
pub use memory::InMemoryFlowStore;

use flowcore::{FlowState, StoreError};

/// Shared compare-and-swap rule: a new flow must come in at version 0, a stored
/// one only at its stored version.
pub(crate) fn check_version(incoming: &FlowState, stored: Option<&FlowState>) -> Result<u64, StoreError> {
    let found = stored.map_or(0, |s| s.version);
    if incoming.version != found {
        return Err(StoreError::ConcurrencyConflict {
            flow_id: incoming.flow_id,
            expected: incoming.version,
            found,
        });
    }
    Ok(found + 1)
}
