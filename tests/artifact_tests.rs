use std::fs;

use pretty_assertions::assert_eq;

use scorebox::artifact::{ArtifactError, ArtifactKind, ArtifactSource, DirArtifactSource};

#[tokio::test]
async fn test_bundle_preferred_over_script() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("sub-1.tar"), b"tar bytes").unwrap();
    fs::write(dir.path().join("sub-1.py"), b"py bytes").unwrap();

    let source = DirArtifactSource::new(dir.path());
    let artifact = source.fetch("sub-1").await.unwrap();
    assert_eq!(artifact.kind, ArtifactKind::Bundle);
    assert_eq!(artifact.bytes, b"tar bytes");
}

#[tokio::test]
async fn test_falls_back_to_single_script() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("sub-2.py"), b"print(1)").unwrap();

    let source = DirArtifactSource::new(dir.path());
    let artifact = source.fetch("sub-2").await.unwrap();
    assert_eq!(artifact.kind, ArtifactKind::Script);
    assert_eq!(artifact.bytes, b"print(1)");
}

#[tokio::test]
async fn test_missing_artifact_is_a_distinct_condition() {
    let dir = tempfile::tempdir().unwrap();
    let source = DirArtifactSource::new(dir.path());
    match source.fetch("nope").await {
        Err(ArtifactError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_hostile_id_cannot_escape_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    // A traversal-shaped id must resolve inside the root (and miss), never
    // read whatever `../../...` points at on the host.
    let source = DirArtifactSource::new(dir.path().join("store"));
    fs::create_dir_all(dir.path().join("store")).unwrap();
    fs::write(dir.path().join("escape.py"), b"outside").unwrap();

    match source.fetch("../escape").await {
        Err(ArtifactError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}
