use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::sanitize_id;

/// Discriminator for what a submission artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// A tar bundle expected to carry the canonical entry at its root
    Bundle,
    /// A single script to be staged under the canonical entry name
    Script,
}

/// Raw submission bytes as fetched from the artifact store.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub kind: ArtifactKind,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// Recoverable: the submission simply has no stored artifact.
    #[error("submission artifact not found")]
    NotFound,

    #[error("artifact source error: {0}")]
    Source(String),
}

/// Where submission artifacts come from.
///
/// Bundles are preferred over single scripts, and "not found" must stay
/// distinguishable from transport failures so callers can fall back.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(&self, submission_id: &str) -> Result<Artifact, ArtifactError>;
}

/// Artifact source backed by a local directory of `<id>.tar` / `<id>.py`
/// files, mirroring the bundle-first, script-fallback lookup of the store.
pub struct DirArtifactSource {
    root: PathBuf,
}

impl DirArtifactSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactSource for DirArtifactSource {
    async fn fetch(&self, submission_id: &str) -> Result<Artifact, ArtifactError> {
        let safe_id = sanitize_id(submission_id);
        if safe_id.is_empty() {
            return Err(ArtifactError::Source(format!(
                "submission id '{submission_id}' sanitizes to nothing"
            )));
        }

        let bundle_path = self.root.join(format!("{safe_id}.tar"));
        match tokio::fs::read(&bundle_path).await {
            Ok(bytes) => {
                return Ok(Artifact {
                    bytes,
                    kind: ArtifactKind::Bundle,
                });
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("No bundle for {safe_id}, falling back to single script");
            }
            Err(e) => {
                return Err(ArtifactError::Source(format!(
                    "reading {}: {e}",
                    bundle_path.display()
                )));
            }
        }

        let script_path = self.root.join(format!("{safe_id}.py"));
        match tokio::fs::read(&script_path).await {
            Ok(bytes) => Ok(Artifact {
                bytes,
                kind: ArtifactKind::Script,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ArtifactError::NotFound),
            Err(e) => Err(ArtifactError::Source(format!(
                "reading {}: {e}",
                script_path.display()
            ))),
        }
    }
}
