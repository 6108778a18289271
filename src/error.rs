use thiserror::Error;

use crate::generation::FailureKind;

/// Errors surfaced to the caller of [`crate::orchestrator::TryOnService::submit`].
///
/// The set is closed. Display strings are internal; callers render
/// [`TryOnError::user_message`] instead.
#[derive(Debug, Error)]
pub enum TryOnError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("limit exceeded: {used}/{limit} credits")]
    LimitExceeded { used: i64, limit: i64 },

    #[error("generation failed ({kind:?}) after {attempts} attempt(s)")]
    GenerationFailed {
        request_id: String,
        kind: FailureKind,
        attempts: u32,
    },

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl TryOnError {
    pub fn invalid(message: impl Into<String>) -> Self {
        TryOnError::InvalidInput(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            TryOnError::InvalidInput(_) => "INVALID_INPUT",
            TryOnError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            TryOnError::GenerationFailed { .. } => "GENERATION_FAILED",
            TryOnError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TryOnError::GenerationFailed { .. } | TryOnError::Internal(_)
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            TryOnError::InvalidInput(reason) => format!("The request was not valid: {reason}."),
            TryOnError::LimitExceeded { .. } => {
                "This store has reached its try-on limit. Upgrade the plan to continue.".to_string()
            }
            TryOnError::GenerationFailed { .. } => {
                "We couldn't create your try-on image this time. Please try again.".to_string()
            }
            TryOnError::Internal(_) => {
                "Something went wrong on our side. Please try again.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn retryable_only_for_generation_and_internal() {
        assert!(!TryOnError::invalid("bad").retryable());
        assert!(!TryOnError::LimitExceeded { used: 1, limit: 1 }.retryable());
        assert!(
            TryOnError::GenerationFailed {
                request_id: "r".into(),
                kind: FailureKind::TextOnly,
                attempts: 3,
            }
            .retryable()
        );
        assert!(TryOnError::Internal(anyhow!("boom")).retryable());
    }

    #[test]
    fn user_message_never_carries_internal_detail() {
        let err = TryOnError::Internal(anyhow!("sqlite disk I/O error at /var/lib/tryon.db"));
        assert!(!err.user_message().contains("sqlite"));
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}
