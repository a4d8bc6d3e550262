use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};

use crate::config::{ResourceLimits, RuntimeConfig};
use crate::stager::CANONICAL_ENTRY;

use super::backend::{BackendError, EnvironmentId, EnvironmentSpec, SandboxBackend, TailBuffer};

const OUTPUT_FILE: &str = "output.log";

/// A sandbox backend that runs submissions as plain host processes
///
/// ProcessBackend unpacks the payload into a scratch directory and runs the
/// canonical entry under rlimits (address space, cpu seconds, process
/// count). It provides no filesystem, network or privilege isolation and is
/// intended for development/testing hosts without a container runtime.
pub struct ProcessBackend {
    work_root: PathBuf,
    output_cap: usize,
    procs: Mutex<HashMap<EnvironmentId, ProcEntry>>,
}

struct ProcEntry {
    dir: PathBuf,
    output_path: PathBuf,
    env_vars: Vec<(String, String)>,
    limits: ResourceLimits,
    child: Option<Child>,
}

impl ProcessBackend {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let work_root = std::env::temp_dir().join("scorebox-proc");
        fs::create_dir_all(&work_root)?;

        log::warn!(
            "ProcessBackend provides NO security isolation - use only in trusted environments"
        );

        Ok(Self {
            work_root,
            output_cap: config.limits.output_cap_bytes,
            procs: Mutex::new(HashMap::new()),
        })
    }

    fn entry_field<T>(
        &self,
        env: &str,
        f: impl FnOnce(&mut ProcEntry) -> T,
    ) -> Result<T, BackendError> {
        let mut procs = self.procs.lock();
        procs
            .get_mut(env)
            .map(f)
            .ok_or_else(|| BackendError::Failed(format!("unknown environment '{env}'")))
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentId, BackendError> {
        let dir = self.work_root.join(&spec.name);
        fs::create_dir_all(&dir)
            .map_err(|e| BackendError::Failed(format!("creating {}: {e}", dir.display())))?;

        let entry = ProcEntry {
            output_path: dir.join(OUTPUT_FILE),
            dir,
            env_vars: spec.env_vars.clone(),
            limits: spec.limits,
            child: None,
        };
        self.procs.lock().insert(spec.name.clone(), entry);
        Ok(spec.name.clone())
    }

    async fn inject(&self, env: &str, _dest: &str, archive: &[u8]) -> Result<(), BackendError> {
        let dir = self.entry_field(env, |e| e.dir.clone())?;
        // tar's unpack refuses entries that would escape the directory
        tar::Archive::new(archive)
            .unpack(&dir)
            .map_err(|e| BackendError::Failed(format!("unpacking payload: {e}")))
    }

    async fn start(&self, env: &str) -> Result<(), BackendError> {
        let (dir, output_path, env_vars, limits) = self.entry_field(env, |e| {
            (
                e.dir.clone(),
                e.output_path.clone(),
                e.env_vars.clone(),
                e.limits,
            )
        })?;

        let output_file = fs::File::create(&output_path)
            .map_err(|e| BackendError::Failed(format!("creating output file: {e}")))?;
        let stderr_file = output_file
            .try_clone()
            .map_err(|e| BackendError::Failed(format!("cloning output handle: {e}")))?;

        let mut cmd = Command::new("python3");
        cmd.arg(CANONICAL_ENTRY)
            .current_dir(&dir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .stdin(Stdio::null())
            .stdout(Stdio::from(output_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);
        for (k, v) in &env_vars {
            cmd.env(k, v);
        }

        unsafe {
            cmd.pre_exec(move || {
                apply_rlimit(libc::RLIMIT_AS, limits.memory_bytes.max(0) as u64)?;
                apply_rlimit(libc::RLIMIT_NPROC, limits.pids_limit.max(1) as u64)?;
                apply_rlimit(libc::RLIMIT_CPU, limits.wall_timeout_secs)?;
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| BackendError::Failed(format!("spawning python3: {e}")))?;
        self.entry_field(env, |e| e.child = Some(child))?;
        Ok(())
    }

    async fn wait(&self, env: &str) -> Result<i64, BackendError> {
        let mut child = self
            .entry_field(env, |e| e.child.take())?
            .ok_or_else(|| BackendError::Failed(format!("environment '{env}' never started")))?;

        let status = child
            .wait()
            .await
            .map_err(|e| BackendError::Failed(format!("waiting for child: {e}")))?;

        // A signal death has no exit code; report it as a generic failure code.
        Ok(status.code().map_or(-1, i64::from))
    }

    async fn output(&self, env: &str) -> Result<Vec<u8>, BackendError> {
        let output_path = self.entry_field(env, |e| e.output_path.clone())?;
        let bytes = fs::read(&output_path)
            .map_err(|e| BackendError::Failed(format!("reading captured output: {e}")))?;

        let mut tail = TailBuffer::new(self.output_cap);
        tail.extend(&bytes);
        Ok(tail.into_bytes())
    }

    async fn remove(&self, env: &str) -> Result<(), BackendError> {
        let entry = self.procs.lock().remove(env);
        if let Some(mut entry) = entry {
            if let Some(child) = entry.child.as_mut() {
                if let Err(e) = child.start_kill() {
                    log::debug!("Killing {env} failed (already dead?): {e}");
                }
            }
            if let Err(e) = fs::remove_dir_all(&entry.dir) {
                log::debug!("Removing work dir for {env} failed: {e}");
            }
        }
        Ok(())
    }
}

fn apply_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> std::io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::RuntimeConfig;
    use crate::stager;

    use super::*;

    fn test_spec(name: &str) -> EnvironmentSpec {
        EnvironmentSpec {
            name: name.to_string(),
            env_vars: vec![("ENV_ID".into(), "test-env".into())],
            labels: Vec::new(),
            limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn test_inject_unpacks_payload_and_remove_cleans_up() {
        let backend = ProcessBackend::new(&RuntimeConfig::default()).unwrap();
        let payload = stager::stage(
            "proc-test-1",
            vec![("agent.py".into(), b"print('hi')".to_vec())],
            None,
        )
        .unwrap();

        let id = backend.create(&test_spec("proc-test-env-1")).await.unwrap();
        backend.inject(&id, "/ignored", &payload.archive).await.unwrap();

        let dir = backend.work_root.join(&id);
        assert!(dir.join("agent.py").exists());
        assert!(dir.join(CANONICAL_ENTRY).exists());

        backend.remove(&id).await.unwrap();
        assert!(!dir.exists());
        // removing again is a no-op
        backend.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_environment_is_an_error() {
        let backend = ProcessBackend::new(&RuntimeConfig::default()).unwrap();
        assert!(backend.start("no-such-env").await.is_err());
        assert!(backend.output("no-such-env").await.is_err());
    }
}
