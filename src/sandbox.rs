mod backend;
mod docker;
mod executor;
mod process;

pub use backend::{BackendError, EnvironmentId, EnvironmentSpec, SandboxBackend, TailBuffer};
pub use docker::DockerBackend;
pub use executor::{ExecutionRequest, ExecutionResult, Executor, ExecutorConfig};
pub use process::ProcessBackend;

use std::sync::Arc;

use anyhow::Result;

use crate::config::RuntimeConfig;

/// Directory inside the environment the payload archive is unpacked into.
pub const INJECT_PATH: &str = "/home/appuser";
/// Fixed script the environment runs; it finds the payload via env vars.
pub const ENTRYPOINT_PATH: &str = "/home/appuser/entrypoint.sh";

/// Creates a sandbox backend based on what the host offers
///
/// If a container runtime looks reachable (a `DOCKER_HOST` is set or the
/// default socket exists), creates a DockerBackend with full isolation.
/// Otherwise falls back to a ProcessBackend that only provides resource
/// limits and timeouts, for development hosts without a daemon.
pub fn create_backend(config: &RuntimeConfig) -> Result<Arc<dyn SandboxBackend>> {
    let daemon_reachable = std::env::var_os("DOCKER_HOST").is_some()
        || std::path::Path::new("/var/run/docker.sock").exists();

    if daemon_reachable {
        log::info!("Creating DockerBackend (image {})", config.image);
        let backend = DockerBackend::connect(config)?;
        Ok(Arc::new(backend))
    } else {
        log::info!("Creating ProcessBackend (no container runtime found)");
        let backend = ProcessBackend::new(config)?;
        Ok(Arc::new(backend))
    }
}
