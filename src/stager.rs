use crate::artifact::{Artifact, ArtifactKind};

/// Fixed file name the sandbox entrypoint always invokes.
pub const CANONICAL_ENTRY: &str = "submission.py";

// Injected files are read-only for the submission user.
const ARCHIVE_FILE_MODE: u32 = 0o444;

/// A submission normalized into one injectable archive.
///
/// Immutable once built; the archive always contains the entry bytes under
/// [`CANONICAL_ENTRY`], whatever the submitted file was called.
#[derive(Debug, Clone)]
pub struct SubmissionPayload {
    pub submission_id: String,
    /// The submitter's own name for the entry file, kept for reference
    pub entry_point: String,
    /// Canonical tar stream, ready for injection
    pub archive: Vec<u8>,
}

/// Input-shape problems, all caught before any sandbox resource exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing_main: multi-file submissions must designate an entry point")]
    MissingMain,

    #[error("main_not_found: entry point '{0}' is not among the submitted files")]
    MainNotFound(String),

    #[error("no_entry_candidate: no executable script in the submitted files")]
    NoEntryCandidate,
}

impl ValidationError {
    pub const fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingMain => "missing_main",
            ValidationError::MainNotFound(_) => "main_not_found",
            ValidationError::NoEntryCandidate => "no_entry_candidate",
        }
    }
}

/// Normalizes submitted files into one canonical archive.
///
/// A single file with no explicit entry point becomes the entry point.
/// Multiple files require one, and it must both exist in the set and have a
/// script alongside it. Every original file lands in the archive unmodified;
/// when the entry's name differs from [`CANONICAL_ENTRY`], its bytes are
/// duplicated under the canonical name so user code can keep importing its
/// own module while the sandbox invokes one fixed path.
pub fn stage(
    submission_id: &str,
    files: Vec<(String, Vec<u8>)>,
    entry_point: Option<&str>,
) -> Result<SubmissionPayload, ValidationError> {
    // Reduce every name to its basename; traversal components must be gone
    // before anything reaches an archive that gets unpacked in the sandbox.
    let files: Vec<(String, Vec<u8>)> = files
        .into_iter()
        .filter_map(|(name, bytes)| basename(&name).map(|n| (n, bytes)))
        .collect();

    let entry = match (entry_point, files.len()) {
        (_, 0) => return Err(ValidationError::NoEntryCandidate),
        (None, 1) => files[0].0.clone(),
        (None, _) => return Err(ValidationError::MissingMain),
        (Some(name), _) => {
            let wanted =
                basename(name).ok_or_else(|| ValidationError::MainNotFound(name.to_string()))?;
            if !files.iter().any(|(n, _)| *n == wanted) {
                return Err(ValidationError::MainNotFound(wanted));
            }
            if !files.iter().any(|(n, _)| is_script(n)) {
                return Err(ValidationError::NoEntryCandidate);
            }
            wanted
        }
    };

    let archive = build_archive(&files, &entry);

    Ok(SubmissionPayload {
        submission_id: submission_id.to_string(),
        entry_point: entry,
        archive,
    })
}

/// Normalizes a fetched artifact into a payload.
///
/// Bundles pass through untouched (they are expected to already carry the
/// canonical entry at their root); single scripts are staged under the
/// canonical name.
pub fn from_artifact(
    submission_id: &str,
    artifact: Artifact,
) -> Result<SubmissionPayload, ValidationError> {
    match artifact.kind {
        ArtifactKind::Bundle => Ok(SubmissionPayload {
            submission_id: submission_id.to_string(),
            entry_point: CANONICAL_ENTRY.to_string(),
            archive: artifact.bytes,
        }),
        ArtifactKind::Script => stage(
            submission_id,
            vec![(CANONICAL_ENTRY.to_string(), artifact.bytes)],
            None,
        ),
    }
}

fn build_archive(files: &[(String, Vec<u8>)], entry: &str) -> Vec<u8> {
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;
    let mut builder = tar::Builder::new(Vec::new());

    for (name, bytes) in files {
        append_file(&mut builder, name, bytes, mtime);
    }
    if entry != CANONICAL_ENTRY {
        // Safe: `entry` was just validated to exist in `files`.
        if let Some((_, bytes)) = files.iter().find(|(n, _)| n == entry) {
            append_file(&mut builder, CANONICAL_ENTRY, bytes, mtime);
        }
    }

    builder
        .into_inner()
        .expect("writing a tar stream to memory cannot fail")
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, bytes: &[u8], mtime: u64) {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(ARCHIVE_FILE_MODE);
    header.set_mtime(mtime);
    header.set_cksum();
    builder
        .append_data(&mut header, name, bytes)
        .expect("writing a tar stream to memory cannot fail");
}

/// Strips directory components from a submitted file name.
fn basename(name: &str) -> Option<String> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    match base.as_str() {
        "" | "." | ".." => None,
        _ => Some(base),
    }
}

fn is_script(name: &str) -> bool {
    name.ends_with(".py")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basename_strips_traversal() {
        assert_eq!(basename("agent.py").as_deref(), Some("agent.py"));
        assert_eq!(basename("../../etc/agent.py").as_deref(), Some("agent.py"));
        assert_eq!(basename(r"dir\win\agent.py").as_deref(), Some("agent.py"));
        assert_eq!(basename("dir/"), None);
        assert_eq!(basename(".."), None);
    }

    #[test]
    fn test_single_file_becomes_entry() {
        let payload = stage("sub-1", vec![("agent.py".into(), b"print(1)".to_vec())], None)
            .unwrap();
        assert_eq!(payload.entry_point, "agent.py");
    }

    #[test]
    fn test_multi_file_requires_entry() {
        let files = vec![
            ("a.py".into(), b"A".to_vec()),
            ("b.py".into(), b"B".to_vec()),
        ];
        let err = stage("sub-1", files, None).unwrap_err();
        assert_eq!(err, ValidationError::MissingMain);
        assert_eq!(err.code(), "missing_main");
    }

    #[test]
    fn test_entry_must_exist() {
        let files = vec![
            ("a.py".into(), b"A".to_vec()),
            ("b.py".into(), b"B".to_vec()),
        ];
        let err = stage("sub-1", files, Some("main.py")).unwrap_err();
        assert_eq!(err, ValidationError::MainNotFound("main.py".into()));
    }

    #[test]
    fn test_scriptless_bundle_rejected() {
        let files = vec![
            ("weights.bin".into(), vec![0u8; 4]),
            ("README".into(), b"hi".to_vec()),
        ];
        let err = stage("sub-1", files, Some("weights.bin")).unwrap_err();
        assert_eq!(err, ValidationError::NoEntryCandidate);
    }

    #[test]
    fn test_empty_set_rejected() {
        let err = stage("sub-1", Vec::new(), None).unwrap_err();
        assert_eq!(err, ValidationError::NoEntryCandidate);
    }
}
