use std::io::Read;

use anyhow::Context;
use clap::Parser;

use scorebox::artifact::{Artifact, ArtifactKind, DirArtifactSource};
use scorebox::config::CliArgs;
use scorebox::sandbox::{ExecutionRequest, Executor, ExecutorConfig, create_backend};
use scorebox::stager::{self, SubmissionPayload};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;

    let backend = create_backend(&config)?;
    let executor = Executor::new(
        backend,
        ExecutorConfig {
            limits: config.limits,
        },
    );

    let result = match (&cli.payload, &cli.artifact_dir) {
        (Some(payload_arg), _) => {
            let payload = load_payload(&cli, payload_arg)?;
            executor
                .execute(ExecutionRequest {
                    payload,
                    environment_id: cli.environment_id.clone(),
                })
                .await
        }
        (None, Some(dir)) => {
            let source = DirArtifactSource::new(dir.as_str());
            executor
                .evaluate(&source, &cli.submission_id, &cli.environment_id)
                .await
        }
        (None, None) => anyhow::bail!("either --payload or --artifact-dir is required"),
    };

    // One JSON line on stdout; everything else goes through the logger.
    println!("{}", serde_json::to_string(&result)?);

    if result.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

/// Reads the inline payload and stages it when it is a bare script.
fn load_payload(cli: &CliArgs, payload_arg: &str) -> anyhow::Result<SubmissionPayload> {
    let bytes = if payload_arg == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read payload from stdin")?;
        buf
    } else {
        std::fs::read(payload_arg)
            .with_context(|| format!("Failed to read payload {payload_arg}"))?
    };

    if payload_arg.ends_with(".py") {
        let name = cli
            .entry_point
            .clone()
            .unwrap_or_else(|| stager::CANONICAL_ENTRY.to_string());
        let payload = stager::stage(&cli.submission_id, vec![(name, bytes)], None)?;
        Ok(payload)
    } else {
        let artifact = Artifact {
            bytes,
            kind: ArtifactKind::Bundle,
        };
        Ok(stager::from_artifact(&cli.submission_id, artifact)?)
    }
}
