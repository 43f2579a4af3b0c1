//! Persisted entities: machines, snapshots and host scripts.

pub mod script;
pub mod snapshot;
pub mod vm;

pub use script::{
    ExecutionRecord, ExecutionStatus, LastExecution, Script, ScriptKind, ScriptSpec, ScriptStats,
    ScriptUpdate, Trigger, TriggerSource, HISTORY_CAP,
};
pub use snapshot::{Snapshot, SnapshotState, SnapshotTree, SnapshotUpdate};
pub use vm::{
    NetworkAdapter, NetworkKind, OsType, SharedFolder, VirtualMachine, VmSpec, VmStatus, VmUpdate,
};

use crate::error::VmError;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;

pub(crate) fn validate_name(kind: &str, name: &str) -> Result<(), VmError> {
    if name.trim().is_empty() {
        return Err(VmError::validation(format!("{kind} name is required")));
    }
    if name.trim() != name {
        return Err(VmError::validation(format!(
            "{kind} name must not start or end with whitespace"
        )));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(VmError::validation(format!(
            "{kind} name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(VmError::validation(format!(
            "{kind} name must not contain control characters"
        )));
    }
    Ok(())
}

pub(crate) fn validate_description(description: &str) -> Result<(), VmError> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(VmError::validation(format!(
            "description cannot exceed {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert!(validate_name("VM", "web-01").is_ok());
        assert!(validate_name("VM", "Windows 10 Dev").is_ok());
        assert!(validate_name("VM", "").is_err());
        assert!(validate_name("VM", "   ").is_err());
        assert!(validate_name("VM", " padded").is_err());
        assert!(validate_name("VM", "line\nbreak").is_err());
        assert!(validate_name("VM", &"x".repeat(101)).is_err());
        assert!(validate_name("VM", &"x".repeat(100)).is_ok());
    }

    #[test]
    fn descriptions() {
        assert!(validate_description("").is_ok());
        assert!(validate_description(&"d".repeat(500)).is_ok());
        assert!(validate_description(&"d".repeat(501)).is_err());
    }
}
