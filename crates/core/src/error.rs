//! Centralized error types for the Tether workspace.

use thiserror::Error;

/// Top-level error enum. Variants map to subsystems.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TetherError {
    // -- Ownership tree --
    #[error("Parent {0} has already been disposed (or disposal is in progress)")]
    ParentDisposed(String),

    #[error("Resource {0} has already been disposed")]
    AlreadyDisposed(String),

    #[error("Cannot register {0} as a child of itself")]
    SelfRegistration(String),

    #[error("Registering {child} under {parent} would create an ownership cycle")]
    OwnershipCycle { parent: String, child: String },

    #[error("Key {key:?} is already registered under {parent}")]
    DuplicateKey { parent: String, key: String },

    #[error("{} dispose callback(s) panicked: {}", .0.len(), .0.join("; "))]
    DisposeFailed(Vec<String>),

    #[error("{} resource(s) were not disposed:\n{}", .0.len(), .0.join("\n"))]
    LeakedRoots(Vec<String>),

    // -- Access rules --
    #[error("Write access is allowed from the write thread only (current: {0})")]
    NotWriteThread(String),

    #[error("Write action cannot be started while the write thread holds a read token")]
    ReadToWriteUpgrade,

    #[error("Read access is required (current thread: {0})")]
    ReadAccessRequired(String),

    #[error("Read action was cancelled {attempts} time(s) by pending write actions")]
    ReadCancelled { attempts: u32 },

    #[error("Write thread has stopped")]
    WriteThreadStopped,

    // -- Application context --
    #[error("No service registered for {0}")]
    ServiceNotRegistered(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type TetherResult<T> = Result<T, TetherError>;

impl TetherError {
    /// Unrecoverable errors: the process context is broken and should not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ServiceNotRegistered(_) | Self::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispose_failed_lists_every_message() {
        let err = TetherError::DisposeFailed(vec!["a: boom".into(), "b: bang".into()]);
        assert_eq!(
            err.to_string(),
            "2 dispose callback(s) panicked: a: boom; b: bang"
        );
    }

    #[test]
    fn service_lookup_is_fatal() {
        assert!(TetherError::ServiceNotRegistered("Foo").is_fatal());
        assert!(!TetherError::WriteThreadStopped.is_fatal());
    }
}
