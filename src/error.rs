use thiserror::Error;

use crate::node::NodeId;

/// Errors surfaced by the coordination core.
///
/// Every variant carries a short machine-readable code (`code()`) and a
/// remediation hint (`remediation()`) so operators can act on failures
/// without reading source.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("not the leader; known leader: {hint:?}")]
    NotLeader { hint: Option<NodeId> },

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("operation not valid in current state: {0}")]
    WrongState(String),

    #[error("participant failure: {0}")]
    ParticipantFailed(String),

    #[error("compensation failed: {0}")]
    CompensationFailed(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::NotLeader { .. } => "not_leader",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::NotFound(_) => "not_found",
            ClusterError::Duplicate(_) => "duplicate",
            ClusterError::WrongState(_) => "wrong_state",
            ClusterError::ParticipantFailed(_) => "participant_failed",
            ClusterError::CompensationFailed(_) => "compensation_failed",
            ClusterError::Unavailable(_) => "unavailable",
            ClusterError::InvalidArgument(_) => "invalid_argument",
            ClusterError::Serialization(_) => "serialization",
            ClusterError::Internal(_) => "internal",
        }
    }

    /// Short remediation hint for operators.
    pub fn remediation(&self) -> &'static str {
        match self {
            ClusterError::NotLeader { .. } => "redirect the request to the hinted leader and retry",
            ClusterError::Timeout(_) => {
                "the operation may or may not have taken effect; retry idempotently or reconcile"
            }
            ClusterError::NotFound(_) => "verify the id; the target may have been removed",
            ClusterError::Duplicate(_) => "use a fresh id or deregister the existing one first",
            ClusterError::WrongState(_) => "check the current state before reissuing the operation",
            ClusterError::ParticipantFailed(_) => {
                "inspect the listed participants and reconcile partial effects manually"
            }
            ClusterError::CompensationFailed(_) => {
                "manual intervention required; the saga left committed steps uncompensated"
            }
            ClusterError::Unavailable(_) => "wait for quorum or add live nodes, then retry",
            ClusterError::InvalidArgument(_) => "fix the malformed input and resubmit",
            ClusterError::Serialization(_) => "the record is corrupt; restore from a consistent copy",
            ClusterError::Internal(_) => "inspect server logs; this is a bug or an environment fault",
        }
    }

    /// Errors a caller may safely retry after redirect/backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::NotLeader { .. } | ClusterError::Timeout(_) | ClusterError::Unavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ClusterError::Timeout("prepare".into()).code(), "timeout");
        assert_eq!(
            ClusterError::NotLeader { hint: None }.code(),
            "not_leader"
        );
        assert_eq!(
            ClusterError::CompensationFailed("s2".into()).code(),
            "compensation_failed"
        );
    }

    #[test]
    fn test_not_leader_display_includes_hint() {
        let err = ClusterError::NotLeader {
            hint: Some(NodeId::new("node2")),
        };
        assert!(err.to_string().contains("node2"));
    }

    #[test]
    fn test_every_error_has_remediation() {
        let samples = vec![
            ClusterError::NotLeader { hint: None },
            ClusterError::Timeout("t".into()),
            ClusterError::NotFound("n".into()),
            ClusterError::Duplicate("d".into()),
            ClusterError::WrongState("w".into()),
            ClusterError::ParticipantFailed("p".into()),
            ClusterError::CompensationFailed("c".into()),
            ClusterError::Unavailable("u".into()),
            ClusterError::InvalidArgument("i".into()),
            ClusterError::Serialization("s".into()),
            ClusterError::Internal("x".into()),
        ];
        for err in samples {
            assert!(!err.remediation().is_empty());
        }
    }
}
