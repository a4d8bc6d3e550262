use async_trait::async_trait;

use crate::config::ResourceLimits;

/// Handle to a live isolated environment, as issued by its backend.
pub type EnvironmentId = String;

/// Everything a backend needs to create one isolated environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    /// Sanitized, collision-free name
    pub name: String,
    /// Variables exposed to the submission; never command-line arguments
    pub env_vars: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    pub limits: ResourceLimits,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The runtime image is missing; fatal until someone provisions it.
    #[error("runtime image '{0}' is not available")]
    ImageNotFound(String),

    /// The isolation backend itself is misbehaving; retryable by the caller.
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),

    /// The requested operation failed for this environment.
    #[error("{0}")]
    Failed(String),
}

/// Control-plane capability set every isolation backend must expose.
///
/// Any backend that can create a resource-bounded environment, put files in
/// it, run it to completion and tear it down satisfies the contract; the
/// executor drives this trait and never talks to a runtime directly.
/// Implementations must tolerate concurrent use from independent runs.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Creates the environment without starting it.
    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentId, BackendError>;

    /// Unpacks a tar archive at `dest` inside the environment.
    async fn inject(&self, env: &str, dest: &str, archive: &[u8]) -> Result<(), BackendError>;

    /// Begins execution of the fixed entrypoint.
    async fn start(&self, env: &str) -> Result<(), BackendError>;

    /// Blocks until the environment's process tree exits; returns its exit
    /// code. Cancelling this future must not leave the process running
    /// beyond a subsequent [`remove`](Self::remove).
    async fn wait(&self, env: &str) -> Result<i64, BackendError>;

    /// Returns the combined stdout+stderr captured so far, already capped
    /// to the configured output ceiling (tail kept).
    async fn output(&self, env: &str) -> Result<Vec<u8>, BackendError>;

    /// Forcibly stops and removes the environment. Idempotent: removing an
    /// already-gone environment is not an error.
    async fn remove(&self, env: &str) -> Result<(), BackendError>;
}

/// Accumulates a byte stream while only ever holding the trailing `cap`
/// bytes, so a submission that prints gigabytes cannot balloon memory. The
/// authoritative result is the *last* JSON line, hence tail over head.
pub struct TailBuffer {
    cap: usize,
    buf: Vec<u8>,
    truncated: bool,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Vec::new(),
            truncated: false,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.cap..]);
            self.truncated = self.truncated || chunk.len() > self.cap;
            return;
        }
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            self.buf.drain(..excess);
            self.truncated = true;
        }
    }

    /// Consumes the buffer; a marker line is prepended when bytes were dropped.
    pub fn into_bytes(self) -> Vec<u8> {
        if self.truncated {
            let mut out = b"[output truncated]\n".to_vec();
            out.extend_from_slice(&self.buf);
            out
        } else {
            self.buf
        }
    }
}
