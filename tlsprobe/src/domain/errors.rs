//! Structured error types for tlsprobe
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{BinaryId, HookHandle, ProbeKind};
use thiserror::Error;

/// Failure of the binary analyzer
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// The image can never be hooked (not Go, stripped, unsupported toolchain)
    #[error("binary is not instrumentable: {0}")]
    NotInstrumentable(String),

    /// The image claims to be ELF but could not be parsed
    #[error("malformed binary image: {0}")]
    MalformedImage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    /// True when the failure depends only on the binary's content, so the
    /// identity can be remembered in the negative cache.
    #[must_use]
    pub fn is_not_instrumentable(&self) -> bool {
        matches!(self, AnalysisError::NotInstrumentable(_))
    }
}

/// Failure of the hook attachment service
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("uprobe program {0} not found in eBPF object")]
    ProgramNotFound(String),

    #[error("failed to load uprobe program {program}: {error}")]
    Load { program: String, error: String },

    #[error("failed to attach {program} ({kind}) to {binary} at offset 0x{offset:x}: {error}")]
    Attach { program: String, kind: ProbeKind, binary: String, offset: u64, error: String },

    #[error("failed to detach {handle}: {error}")]
    Detach { handle: HookHandle, error: String },

    #[error("unknown hook handle {0}")]
    UnknownHandle(HookHandle),

    #[error("function {0} is configured to include return locations but has no return probe")]
    MissingReturnProbe(String),

    #[error("function {0} missing from analysis result")]
    MissingFunction(String),
}

/// Failure of the shared offsets store
#[derive(Error, Debug)]
pub enum OffsetsError {
    #[error("offsets map {0} not found in eBPF object")]
    MapNotFound(String),

    #[error("could not write offsets for {binary}: {error}")]
    Write { binary: BinaryId, error: String },

    #[error("could not remove offsets for {binary}: {error}")]
    Delete { binary: BinaryId, error: String },

    #[error("analysis result for {binary} is incomplete: {reason}")]
    Encode { binary: BinaryId, reason: String },
}

/// Errors surfaced to the caller of the manager's `start()`/`stop()`
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("failed to subscribe to process events: {0}")]
    Subscribe(String),

    #[error("shared offsets store unavailable: {0}")]
    OffsetsUnavailable(#[from] OffsetsError),

    #[error("instrumentation manager already started")]
    AlreadyStarted,

    #[error("instrumentation manager was stopped")]
    Stopped,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_instrumentable_classification() {
        assert!(AnalysisError::NotInstrumentable("not a Go binary".into()).is_not_instrumentable());
        assert!(!AnalysisError::MalformedImage("truncated".into()).is_not_instrumentable());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!AnalysisError::from(io).is_not_instrumentable());
    }

    #[test]
    fn test_attach_error_display() {
        let err = AttachError::Attach {
            program: "uprobe__crypto_tls_Conn_Read".to_string(),
            kind: ProbeKind::Return,
            binary: "/usr/bin/my-app".to_string(),
            offset: 0x4f20,
            error: "permission denied".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("uprobe__crypto_tls_Conn_Read"));
        assert!(msg.contains("/usr/bin/my-app"));
        assert!(msg.contains("0x4f20"));
        assert!(msg.contains("return"));
    }

    #[test]
    fn test_manager_error_display() {
        let err = ManagerError::from(OffsetsError::MapNotFound("OFFSETS_DATA".into()));
        assert_eq!(
            err.to_string(),
            "shared offsets store unavailable: offsets map OFFSETS_DATA not found in eBPF object"
        );
    }
}
