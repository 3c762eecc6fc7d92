//! Action results.

use serde::{Deserialize, Serialize};

/// Classification of a completed (or failed) action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The command ran and exited zero.
    Success,
    /// The command ran and exited non-zero. Not an error: a compile failure
    /// is a legitimate result.
    NonZeroExit,
    /// Filesystem, context creation, input processing or other host-side
    /// failure.
    LocalError,
    /// RPC or backend failure during remote execution or download.
    RemoteError,
    /// The action was interrupted by cancellation.
    Interrupted,
    /// The action exceeded its wall-clock bound.
    Timeout,
    /// A previously cached remote result was adopted.
    CacheHit,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NonZeroExit => write!(f, "non_zero_exit"),
            Self::LocalError => write!(f, "local_error"),
            Self::RemoteError => write!(f, "remote_error"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Timeout => write!(f, "timeout"),
            Self::CacheHit => write!(f, "cache_hit"),
        }
    }
}

/// The outcome of one action. Exactly one of these is assigned to an action
/// before it returns to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub status: ResultStatus,
    /// Error detail for the error statuses; `None` for valid results.
    pub message: Option<String>,
}

impl CommandResult {
    pub fn from_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            status: if exit_code == 0 {
                ResultStatus::Success
            } else {
                ResultStatus::NonZeroExit
            },
            message: None,
        }
    }

    pub fn local_error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            status: ResultStatus::LocalError,
            message: Some(message.into()),
        }
    }

    pub fn remote_error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            status: ResultStatus::RemoteError,
            message: Some(message.into()),
        }
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            status: ResultStatus::Interrupted,
            message: Some(message.into()),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            status: ResultStatus::Timeout,
            message: Some(message.into()),
        }
    }

    pub fn cache_hit(exit_code: i32) -> Self {
        Self {
            exit_code,
            status: ResultStatus::CacheHit,
            message: None,
        }
    }

    /// A result is ok when it carries no error. A non-zero exit is valid
    /// but not ok.
    pub fn is_ok(&self) -> bool {
        self.message.is_none()
            && matches!(self.status, ResultStatus::Success | ResultStatus::CacheHit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_exit_code_zero_is_success() {
        let res = CommandResult::from_exit_code(0);
        assert_eq!(res.status, ResultStatus::Success);
        assert!(res.is_ok());
    }

    #[test]
    fn test_from_exit_code_nonzero_is_valid_but_not_ok() {
        let res = CommandResult::from_exit_code(2);
        assert_eq!(res.status, ResultStatus::NonZeroExit);
        assert!(!res.is_ok());
        assert!(res.message.is_none());
    }

    #[test]
    fn test_local_error_carries_message() {
        let res = CommandResult::local_error("mkdir failed");
        assert_eq!(res.status, ResultStatus::LocalError);
        assert!(!res.is_ok());
        assert_eq!(res.message.as_deref(), Some("mkdir failed"));
    }

    #[test]
    fn test_cache_hit_is_ok() {
        assert!(CommandResult::cache_hit(0).is_ok());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ResultStatus::Success.to_string(), "success");
        assert_eq!(ResultStatus::NonZeroExit.to_string(), "non_zero_exit");
        assert_eq!(ResultStatus::LocalError.to_string(), "local_error");
        assert_eq!(ResultStatus::RemoteError.to_string(), "remote_error");
        assert_eq!(ResultStatus::Interrupted.to_string(), "interrupted");
        assert_eq!(ResultStatus::Timeout.to_string(), "timeout");
        assert_eq!(ResultStatus::CacheHit.to_string(), "cache_hit");
    }
}
