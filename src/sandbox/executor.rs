use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::artifact::{ArtifactError, ArtifactSource};
use crate::config::ResourceLimits;
use crate::error::{ExecError, Stage};
use crate::extractor::{self, RunOutcome};
use crate::stager::{self, CANONICAL_ENTRY, SubmissionPayload};
use crate::{sanitize_id, tail_str};

use super::backend::{BackendError, EnvironmentId, EnvironmentSpec, SandboxBackend};
use super::INJECT_PATH;

const ENV_NAME_PREFIX: &str = "eval-";
// Leaves room for the run suffix under the runtime's 63-char name bound.
const ENV_NAME_MAX: usize = 55;
// How much captured output travels with a stage failure.
const FAILURE_LOG_TAIL: usize = 1000;
const FAILURE_DIAG_TAIL: usize = 500;

// Distinguishes concurrent environments for the same submission; without it
// one run's teardown could kill the other's environment.
static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Parameters for one sandboxed run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub payload: SubmissionPayload,
    /// Which task parameterization the submission runs against; passed
    /// through as an environment variable, never interpreted here
    pub environment_id: String,
}

/// The outcome of one run. Produced exactly once per request; `execute`
/// never panics or returns an error in its place.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Exit code of the sandboxed process; -1 when it never produced one
    pub exit_code: i64,
    /// Furthest lifecycle stage completed before any failure
    pub stage_reached: Stage,
    /// Combined stdout+stderr, lossily decoded and tail-capped
    pub raw_output: String,
    pub outcome: RunOutcome,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub limits: ResourceLimits,
}

/// Runs one submission at a time to completion inside an isolated
/// environment, whatever the submission does.
///
/// The backend handle is an injected dependency whose lifecycle the caller
/// owns; `execute` calls are independent and may run concurrently against
/// one shared backend.
pub struct Executor {
    backend: Arc<dyn SandboxBackend>,
    limits: ResourceLimits,
}

impl Executor {
    pub fn new(backend: Arc<dyn SandboxBackend>, config: ExecutorConfig) -> Self {
        Self {
            backend,
            limits: config.limits,
        }
    }

    /// Fetches, stages and executes a stored submission.
    pub async fn evaluate(
        &self,
        source: &dyn ArtifactSource,
        submission_id: &str,
        environment_id: &str,
    ) -> ExecutionResult {
        let artifact = match source.fetch(submission_id).await {
            Ok(artifact) => artifact,
            Err(ArtifactError::NotFound) => {
                let err = ExecError::Stage {
                    stage: Stage::StageArtifacts,
                    message: format!("no stored artifact for submission {submission_id}"),
                };
                return Self::result_from_error(Stage::StageArtifacts, err, &[]);
            }
            Err(e) => {
                return Self::result_from_error(
                    Stage::StageArtifacts,
                    ExecError::Platform(e.to_string()),
                    &[],
                );
            }
        };

        let payload = match stager::from_artifact(submission_id, artifact) {
            Ok(payload) => payload,
            Err(e) => {
                return Self::result_from_error(Stage::StageArtifacts, ExecError::Validation(e), &[]);
            }
        };

        self.execute(ExecutionRequest {
            payload,
            environment_id: environment_id.to_string(),
        })
        .await
    }

    /// Runs one request to completion and returns its result.
    ///
    /// Whatever happens in between, the environment created for the run (if
    /// any) is stopped and removed before this returns; teardown failures
    /// are logged and swallowed so they can never mask the primary outcome.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let submission_id = &request.payload.submission_id;
        let mut stage = Stage::Init;
        let mut env: Option<EnvironmentId> = None;

        let run = self.drive(&request, &mut stage, &mut env).await;

        // Grab whatever the environment managed to say before it disappears.
        let salvaged = match (&run, env.as_deref()) {
            (Err(ExecError::Stage { .. }), Some(id)) => {
                self.backend.output(id).await.unwrap_or_default()
            }
            _ => Vec::new(),
        };

        if let Some(id) = env {
            match self.backend.remove(&id).await {
                Ok(()) => log::debug!("Environment {id} removed for submission {submission_id}"),
                Err(e) => {
                    log::warn!("Failed to remove environment {id} for submission {submission_id}: {e}");
                }
            }
        }

        match run {
            Ok((exit_code, raw_output)) => {
                let outcome = extractor::classify(exit_code, &raw_output);
                ExecutionResult {
                    exit_code,
                    stage_reached: Stage::Done,
                    raw_output,
                    outcome,
                }
            }
            Err(err) => Self::result_from_error(stage, err, &salvaged),
        }
    }

    /// Walks the lifecycle stages in order, recording progress in `stage`
    /// and the created environment in `env` so the caller can always tear
    /// down and attribute failures.
    async fn drive(
        &self,
        request: &ExecutionRequest,
        stage: &mut Stage,
        env: &mut Option<EnvironmentId>,
    ) -> Result<(i64, String), ExecError> {
        if request.environment_id.trim().is_empty() {
            return Err(ExecError::Configuration(
                "environment_id is required to run the evaluator".to_string(),
            ));
        }
        let submission_id = &request.payload.submission_id;

        *stage = Stage::CreateEnvironment;
        let spec = self.environment_spec(request);
        log::info!(
            "Starting evaluation for submission {submission_id} (environment {}, stage {stage})",
            spec.name
        );
        let id = self
            .backend
            .create(&spec)
            .await
            .map_err(|e| stage_error(*stage, e))?;
        *env = Some(id.clone());
        log::info!("Environment created: {id} (submission {submission_id}, stage {stage})");

        *stage = Stage::InjectPayload;
        self.backend
            .inject(&id, INJECT_PATH, &request.payload.archive)
            .await
            .map_err(|e| stage_error(*stage, e))?;

        *stage = Stage::Start;
        self.backend
            .start(&id)
            .await
            .map_err(|e| stage_error(*stage, e))?;

        *stage = Stage::Wait;
        let limit = Duration::from_secs(self.limits.wall_timeout_secs);
        let exit_code = match tokio::time::timeout(limit, self.backend.wait(&id)).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => return Err(stage_error(*stage, e)),
            Err(_) => {
                log::warn!("Submission {submission_id} hit the {}s wall clock", limit.as_secs());
                // Logs survive the kill but not the removal; collect now.
                let partial = self.backend.output(&id).await.unwrap_or_default();
                return Err(ExecError::Timeout {
                    limit,
                    partial_output: String::from_utf8_lossy(&partial).into_owned(),
                });
            }
        };

        *stage = Stage::CollectOutput;
        let bytes = self
            .backend
            .output(&id)
            .await
            .map_err(|e| stage_error(*stage, e))?;
        let raw_output = String::from_utf8_lossy(&bytes).into_owned();

        log::info!(
            "Evaluation completed for {submission_id} with exit code {exit_code}"
        );
        Ok((exit_code, raw_output))
    }

    fn environment_spec(&self, request: &ExecutionRequest) -> EnvironmentSpec {
        let submission_id = &request.payload.submission_id;
        EnvironmentSpec {
            name: environment_name(submission_id),
            env_vars: vec![
                ("ENV_ID".to_string(), request.environment_id.clone()),
                (
                    "SCRIPT_PATH".to_string(),
                    format!("{INJECT_PATH}/{CANONICAL_ENTRY}"),
                ),
                ("SUBMISSION_ID".to_string(), submission_id.clone()),
            ],
            labels: vec![
                (
                    "com.scorebox.submission_id".to_string(),
                    submission_id.clone(),
                ),
                (
                    "com.scorebox.env_id".to_string(),
                    request.environment_id.clone(),
                ),
            ],
            limits: self.limits,
        }
    }

    fn result_from_error(stage: Stage, err: ExecError, salvaged: &[u8]) -> ExecutionResult {
        let salvaged = String::from_utf8_lossy(salvaged);
        let (reason, raw_output) = match err {
            ExecError::Timeout {
                limit,
                partial_output,
            } => (
                format!("Evaluation timed out after {}s", limit.as_secs()),
                partial_output,
            ),
            ExecError::ImageNotFound(image) => (
                format!(
                    "Docker image not found: {image}. \
                     Build it with: docker build -f docker/Dockerfile.evaluator -t {image} ."
                ),
                String::new(),
            ),
            other => (
                other.to_string(),
                tail_str(&salvaged, FAILURE_LOG_TAIL).to_string(),
            ),
        };

        ExecutionResult {
            exit_code: -1,
            stage_reached: stage,
            outcome: RunOutcome::Failure {
                reason,
                raw_tail: tail_str(&raw_output, FAILURE_DIAG_TAIL).to_string(),
            },
            raw_output,
        }
    }
}

fn stage_error(stage: Stage, err: BackendError) -> ExecError {
    match err {
        BackendError::ImageNotFound(image) => ExecError::ImageNotFound(image),
        BackendError::Unavailable(message) => ExecError::Platform(message),
        BackendError::Failed(message) => ExecError::Stage { stage, message },
    }
}

/// Derives a safe, collision-free environment name from a submission id.
fn environment_name(submission_id: &str) -> String {
    let mut name = format!("{ENV_NAME_PREFIX}{}", sanitize_id(submission_id));
    name.truncate(ENV_NAME_MAX);
    format!("{name}-{}", RUN_SEQ.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_name_is_sanitized_and_bounded() {
        let name = environment_name("abc/../$(rm -rf)//123");
        let base = name.rsplit_once('-').unwrap().0;
        assert!(base.starts_with("eval-abc"));
        assert!(
            base.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        );

        let long = environment_name(&"x".repeat(200));
        assert!(long.len() <= 63);
    }

    #[test]
    fn test_environment_names_never_collide() {
        let a = environment_name("same-submission");
        let b = environment_name("same-submission");
        assert_ne!(a, b);
    }
}
