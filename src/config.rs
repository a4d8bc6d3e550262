use clap::Parser;
use serde::Deserialize;

// Fixed evaluation limits. These are deliberately constants rather than
// per-request knobs: a submission must never be able to ask for more.
pub const MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;
pub const CPU_QUOTA: i64 = 50_000; // 50% of one core
pub const CPU_PERIOD: i64 = 100_000;
pub const PIDS_LIMIT: i64 = 50;
pub const WALL_TIMEOUT_SECS: u64 = 300;
/// Transport timeout for the runtime client; headroom over the wall clock.
pub const CLIENT_TIMEOUT_SECS: u64 = 420;
/// Cap on captured combined output; the tail is kept, the head dropped.
pub const OUTPUT_CAP_BYTES: usize = 1024 * 1024;

pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_IMAGE: &str = "rl-evaluator:latest";

#[derive(Parser)]
#[command(name = "scorebox", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Identifier of the submission to evaluate
    #[arg(long = "submission-id", short = 's')]
    pub submission_id: String,

    /// Identifier of the environment the submission runs against
    #[arg(long = "environment-id", short = 'e')]
    pub environment_id: String,

    /// Name of the file to execute, for payloads whose entry is not canonical
    #[arg(long = "entry-point")]
    pub entry_point: Option<String>,

    /// Payload path (`.tar` bundle or single script), or `-` to read a
    /// bundle from stdin
    #[arg(long = "payload", short = 'p')]
    pub payload: Option<String>,

    /// Directory holding `<id>.tar` / `<id>.py` artifacts, used when no
    /// payload is passed inline
    #[arg(long = "artifact-dir")]
    pub artifact_dir: Option<String>,

    /// Path to an optional runtime configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,
}

impl CliArgs {
    /// Load the runtime configuration from the specified file, or defaults
    pub fn to_config(&self) -> std::io::Result<RuntimeConfig> {
        match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader).map_err(|e| e.into())
            }
            None => Ok(RuntimeConfig::default()),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Sandbox runtime endpoint; `DOCKER_HOST` takes precedence when set
    pub docker_host: String,
    /// Image the evaluator environments are created from
    pub image: String,
    pub limits: ResourceLimits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            limits: ResourceLimits::default(),
        }
    }
}

/// Resource ceilings applied to every sandboxed run.
///
/// Constructed from the fixed constants above; a configuration file may
/// shrink them for testing, but they are never derived from caller input.
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub pids_limit: i64,
    pub wall_timeout_secs: u64,
    pub output_cap_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: MEMORY_LIMIT_BYTES,
            cpu_quota: CPU_QUOTA,
            cpu_period: CPU_PERIOD,
            pids_limit: PIDS_LIMIT,
            wall_timeout_secs: WALL_TIMEOUT_SECS,
            output_cap_bytes: OUTPUT_CAP_BYTES,
        }
    }
}
