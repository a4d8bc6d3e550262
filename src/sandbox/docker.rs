use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::HostConfig;
use bollard::{API_DEFAULT_VERSION, Docker};
use futures_util::stream::StreamExt;

use crate::config::{CLIENT_TIMEOUT_SECS, RuntimeConfig};

use super::backend::{BackendError, EnvironmentId, EnvironmentSpec, SandboxBackend, TailBuffer};
use super::ENTRYPOINT_PATH;

// Grace given to the entrypoint before the stop escalates to SIGKILL.
const STOP_GRACE_SECS: i64 = 10;

/// Sandbox backend driving a Docker daemon.
///
/// Each environment is a container created from the evaluator image with no
/// network, capped memory/CPU/pids, all capabilities dropped and privilege
/// escalation disabled. The client handle is cheap to clone and safe to
/// share across concurrent executions.
pub struct DockerBackend {
    docker: Docker,
    image: String,
    output_cap: usize,
}

impl DockerBackend {
    /// Connects to the daemon named by `DOCKER_HOST` or the configured host.
    pub fn connect(config: &RuntimeConfig) -> Result<Self> {
        let configured = std::env::var("DOCKER_HOST").unwrap_or_else(|_| config.docker_host.clone());
        let host = normalize_docker_host(&configured);
        log::debug!("Initializing Docker client with host {host}");

        let docker = if host.starts_with("unix://") {
            Docker::connect_with_unix(&host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(&host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        .with_context(|| format!("Failed to initialize Docker client for {host}"))?;

        Ok(Self {
            docker,
            image: config.image.clone(),
            output_cap: config.limits.output_cap_bytes,
        })
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentId, BackendError> {
        let env: Vec<String> = spec
            .env_vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let labels: HashMap<String, String> = spec.labels.iter().cloned().collect();

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes),
            cpu_quota: Some(spec.limits.cpu_quota),
            cpu_period: Some(spec.limits.cpu_period),
            pids_limit: Some(spec.limits.pids_limit),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };
        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![ENTRYPOINT_PATH.to_string()]),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => BackendError::ImageNotFound(self.image.clone()),
                other => backend_error(other),
            })?;

        Ok(created.id)
    }

    async fn inject(&self, env: &str, dest: &str, archive: &[u8]) -> Result<(), BackendError> {
        let options = bollard::container::UploadToContainerOptions {
            path: dest.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(env, Some(options), archive.to_vec().into())
            .await
            .map_err(backend_error)
    }

    async fn start(&self, env: &str) -> Result<(), BackendError> {
        self.docker
            .start_container(env, None::<StartContainerOptions<String>>)
            .await
            .map_err(backend_error)
    }

    async fn wait(&self, env: &str) -> Result<i64, BackendError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(env, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a nonzero exit as an error; it is still an exit
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(backend_error(e)),
            None => Err(BackendError::Failed(
                "wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn output(&self, env: &str) -> Result<Vec<u8>, BackendError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(env, Some(options));
        let mut tail = TailBuffer::new(self.output_cap);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => tail.extend(&log.into_bytes()),
                Err(e) => {
                    log::warn!("Log stream for {env} ended early: {e}");
                    break;
                }
            }
        }
        Ok(tail.into_bytes())
    }

    async fn remove(&self, env: &str) -> Result<(), BackendError> {
        if let Err(e) = self
            .docker
            .stop_container(env, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            log::debug!("Stop before removal failed for {env}: {e}");
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(env, Some(options)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(backend_error(e)),
        }
    }
}

fn backend_error(err: DockerError) -> BackendError {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } if status_code >= 500 => BackendError::Unavailable(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => BackendError::Failed(format!("Docker API error {status_code}: {message}")),
        other => BackendError::Unavailable(other.to_string()),
    }
}

/// Ensures the Docker host has a scheme the client understands.
///
/// Accepts the usual forms (`unix:///var/run/docker.sock`,
/// `tcp://docker:2375`) and corrects the common mistakes: a bare socket
/// path, and the single-slash `unix:/...` typo.
fn normalize_docker_host(value: &str) -> String {
    let host = value.trim();
    if host.is_empty() {
        return crate::config::DEFAULT_DOCKER_HOST.to_string();
    }
    if host.starts_with('/') {
        return format!("unix://{host}");
    }
    if let Some(rest) = host.strip_prefix("unix:/") {
        if !host.starts_with("unix://") {
            return format!("unix:///{}", rest.trim_start_matches('/'));
        }
    }
    host.to_string()
}
