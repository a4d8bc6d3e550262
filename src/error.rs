use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::extractor::ResultError;
use crate::stager::ValidationError;

/// Lifecycle stages of one sandboxed run, in strict order.
///
/// Every run walks this sequence forward; on failure the furthest stage
/// reached is recorded on the result so the caller can pinpoint the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    StageArtifacts,
    CreateEnvironment,
    InjectPayload,
    Start,
    Wait,
    CollectOutput,
    Done,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::StageArtifacts => "stage_artifacts",
            Stage::CreateEnvironment => "create_environment",
            Stage::InjectPayload => "inject_payload",
            Stage::Start => "start",
            Stage::Wait => "wait",
            Stage::CollectOutput => "collect_output",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can go wrong while evaluating one submission.
///
/// `Validation` and `Configuration` are rejected before any sandbox resource
/// exists. `Platform` and `Timeout` are transient from the caller's point of
/// view; retrying is the caller's decision, never ours. `Stage` and `Result`
/// are the submission's own fault and must not be retried.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("sandbox image not found: {0}")]
    ImageNotFound(String),

    #[error("sandbox backend error: {0}")]
    Platform(String),

    #[error("execution failed at stage '{stage}': {message}")]
    Stage { stage: Stage, message: String },

    #[error("evaluation timed out after {}s", limit.as_secs())]
    Timeout {
        limit: Duration,
        /// Whatever the run managed to print before it was killed.
        partial_output: String,
    },

    #[error("{0}")]
    Result(#[from] ResultError),
}

impl ExecError {
    /// Whether the caller may reasonably retry the whole evaluation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Platform(_) | ExecError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_linear() {
        assert!(Stage::Init < Stage::StageArtifacts);
        assert!(Stage::StageArtifacts < Stage::CreateEnvironment);
        assert!(Stage::CreateEnvironment < Stage::InjectPayload);
        assert!(Stage::InjectPayload < Stage::Start);
        assert!(Stage::Start < Stage::Wait);
        assert!(Stage::Wait < Stage::CollectOutput);
        assert!(Stage::CollectOutput < Stage::Done);
    }

    #[test]
    fn test_retry_policy() {
        assert!(ExecError::Platform("daemon unreachable".into()).is_retryable());
        assert!(
            ExecError::Timeout {
                limit: Duration::from_secs(300),
                partial_output: String::new(),
            }
            .is_retryable()
        );
        assert!(!ExecError::Configuration("empty environment_id".into()).is_retryable());
        assert!(
            !ExecError::Stage {
                stage: Stage::InjectPayload,
                message: "boom".into(),
            }
            .is_retryable()
        );
        assert!(!ExecError::ImageNotFound("rl-evaluator:latest".into()).is_retryable());
    }
}
