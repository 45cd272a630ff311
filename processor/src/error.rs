use thiserror::Error;

/// Classification of reconcile failures.
///
/// Fatal errors are written once into the object's status (error field plus
/// Failure condition) and do not re-trigger action until the object is
/// replaced. Everything else is retried: immediately for write conflicts,
/// on the next wakeup or periodic resync otherwise.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Timeout(String),

    #[error("provisioner: {0}")]
    Provisioner(String),

    #[error("quiesce: {0}")]
    Quiesce(String),

    #[error("patch {path} failed: {message}")]
    Patch { path: String, message: String },
}

impl ReconcileError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReconcileError::Validation(_) | ReconcileError::Timeout(_) | ReconcileError::Patch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(ReconcileError::Validation("bad source".into()).is_fatal());
        assert!(ReconcileError::Timeout("deadline exceeded".into()).is_fatal());
        assert!(ReconcileError::Patch {
            path: "/spec/x".into(),
            message: "no such member".into()
        }
        .is_fatal());
        assert!(!ReconcileError::Provisioner("creation pending".into()).is_fatal());
        assert!(!ReconcileError::Quiesce("freeze refused".into()).is_fatal());
    }
}
