use serde::Serialize;
use thiserror::Error;

/// Result type alias for fabric operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error discriminant surfaced to the API layer alongside the
/// human-readable detail string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    BackendUnavailable,
    System,
}

/// Errors produced by the fabric controllers.
///
/// `Validation` and `Conflict` are always raised before any kernel state is
/// touched. `System` wraps the backend's diagnostic text after valid input,
/// and for multi-step operations carries the steps that completed before the
/// failure (the kernel cannot be rolled back).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("backend tool '{tool}' unavailable: {reason}")]
    BackendUnavailable { tool: String, reason: String },

    #[error("{op} failed: {detail}")]
    System {
        op: String,
        detail: String,
        completed_steps: Vec<String>,
    },
}

impl Error {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn backend_unavailable(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn system(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::System {
            op: op.into(),
            detail: detail.into(),
            completed_steps: Vec::new(),
        }
    }

    /// A system error from a multi-step operation where some steps already
    /// mutated the kernel and cannot be undone.
    pub fn partial(
        op: impl Into<String>,
        detail: impl Into<String>,
        completed_steps: Vec<String>,
    ) -> Self {
        let mut detail = detail.into();
        if !completed_steps.is_empty() {
            detail.push_str(&format!(" (completed steps: {})", completed_steps.join(", ")));
        }
        Self::System {
            op: op.into(),
            detail,
            completed_steps,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::System { .. } => ErrorKind::System,
        }
    }

    /// Steps of a multi-step operation that completed before the failure.
    /// Empty for every kind except partial `System` errors.
    pub fn completed_steps(&self) -> &[String] {
        match self {
            Self::System {
                completed_steps, ..
            } => completed_steps,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::validation("name", "too long").kind(),
            ErrorKind::Validation
        );
        assert_eq!(Error::conflict("duplicate").kind(), ErrorKind::Conflict);
        assert_eq!(Error::not_found("bridge br0").kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::backend_unavailable("ovs-vsctl", "no such file").kind(),
            ErrorKind::BackendUnavailable
        );
        assert_eq!(Error::system("create", "boom").kind(), ErrorKind::System);
    }

    #[test]
    fn test_partial_carries_completed_steps() {
        let err = Error::partial("add_port_forward", "FORWARD append failed", vec![
            "dnat".to_string(),
        ]);
        assert_eq!(err.completed_steps(), &["dnat".to_string()]);
        let msg = err.to_string();
        assert!(msg.contains("completed steps: dnat"), "{msg}");
    }

    #[test]
    fn test_display_includes_detail() {
        let err = Error::not_found("veth pair veth-a");
        assert_eq!(err.to_string(), "veth pair veth-a not found");
    }
}
