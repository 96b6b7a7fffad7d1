//! Stack lifecycle errors.

use thiserror::Error;

use crate::db::StoreError;
use crate::gateway::GatewayError;

/// Coarse error category, used by the transport layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    PodSpecInvalid,
    Conflict,
    ResourceExhausted,
    Internal,
}

/// Errors returned by the lifecycle service.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack not found")]
    NotFound,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid pod spec: {0}")]
    PodSpecInvalid(String),

    #[error("stack already exists for user/problem")]
    UserProblemExists,

    #[error("user stack limit reached ({limit})")]
    UserStackLimitReached { limit: u32 },

    #[error("no available nodeport")]
    NoAvailableNodePort,

    #[error("cluster saturated: {0}")]
    ClusterSaturated(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("workload failed: {0}")]
    WorkloadFailed(String),
}

impl StackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::PodSpecInvalid(_) => ErrorKind::PodSpecInvalid,
            Self::UserProblemExists => ErrorKind::Conflict,
            Self::UserStackLimitReached { .. }
            | Self::NoAvailableNodePort
            | Self::ClusterSaturated(_) => ErrorKind::ResourceExhausted,
            Self::Store(_) | Self::Gateway(_) | Self::WorkloadFailed(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "stack_not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::PodSpecInvalid(_) => "invalid_pod_spec",
            Self::UserProblemExists => "user_problem_exists",
            Self::UserStackLimitReached { .. } => "user_stack_limit_reached",
            Self::NoAvailableNodePort => "no_available_node_port",
            Self::ClusterSaturated(_) => "cluster_saturated",
            Self::Store(_) | Self::Gateway(_) | Self::WorkloadFailed(_) => "internal_error",
        }
    }
}

impl From<StoreError> for StackError {
    fn from(err: StoreError) -> Self {
        match err {
            // The store's uniqueness constraint is the final word on duplicates.
            StoreError::DuplicateActiveStack => Self::UserProblemExists,
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_exhausted_causes_share_kind() {
        let errors = [
            StackError::UserStackLimitReached { limit: 3 },
            StackError::NoAvailableNodePort,
            StackError::ClusterSaturated("cpu".into()),
        ];
        for err in &errors {
            assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        }
        let codes: Vec<_> = errors.iter().map(StackError::code).collect();
        assert_eq!(
            codes,
            ["user_stack_limit_reached", "no_available_node_port", "cluster_saturated"]
        );
    }

    #[test]
    fn test_store_duplicate_maps_to_conflict() {
        let err = StackError::from(StoreError::DuplicateActiveStack);
        assert!(matches!(err, StackError::UserProblemExists));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
