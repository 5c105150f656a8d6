use std::fs::{self, File};
use std::io::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};

use plainly::artifact::{
    ArtifactError, ModelArtifactProvisioner, SourceFingerprint, ARTIFACT_FILE, GGUF_MAGIC,
    MIN_ARTIFACT_BYTES, SIDECAR_FILE,
};

/// Writes a file that passes artifact validation without occupying real disk
/// space: the GGUF magic up front, then a hole out to the minimum length.
fn sparse_gguf(path: &Path) {
    let mut file = File::create(path).unwrap();
    file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
    file.set_len(MIN_ARTIFACT_BYTES).unwrap();
}

/// Places a valid artifact and a sidecar recording `source` as its origin,
/// as if a previous run had provisioned it.
fn preprovision(provisioner: &ModelArtifactProvisioner, data_dir: &Path, source: &Path) {
    sparse_gguf(provisioner.artifact_path());
    let fingerprint = SourceFingerprint {
        source_path: source.to_string_lossy().to_string(),
        source_len: Some(MIN_ARTIFACT_BYTES),
    };
    fs::write(
        data_dir.join(SIDECAR_FILE),
        serde_json::to_string_pretty(&fingerprint).unwrap(),
    )
    .unwrap();
}

fn recording_progress() -> (Arc<Mutex<Vec<f32>>>, impl Fn(f32) + Send + Sync) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |fraction: f32| sink.lock().unwrap().push(fraction))
}

#[test]
fn extracts_validates_and_records_the_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("bundled.gguf");
    sparse_gguf(&source);

    let provisioner = ModelArtifactProvisioner::new(source, dir.path());
    assert!(!provisioner.is_provisioned());

    let (seen, progress) = recording_progress();
    let path = provisioner.ensure(&progress).unwrap();

    assert_eq!(path, provisioner.artifact_path());
    assert_eq!(fs::metadata(&path).unwrap().len(), MIN_ARTIFACT_BYTES);
    assert!(dir.path().join(SIDECAR_FILE).exists());
    assert!(provisioner.is_provisioned());
    assert_eq!(provisioner.artifact_size(), Some(MIN_ARTIFACT_BYTES));

    // a real copy reports intermediate fractions, ending at exactly 1.0
    let seen = seen.lock().unwrap();
    assert!(seen.len() > 1);
    assert_eq!(*seen.last().unwrap(), 1.0);
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn unchanged_source_reuses_the_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("bundled.gguf");
    sparse_gguf(&source);

    let provisioner = ModelArtifactProvisioner::new(source.clone(), dir.path());
    preprovision(&provisioner, dir.path(), &source);
    let modified_before = fs::metadata(provisioner.artifact_path())
        .unwrap()
        .modified()
        .unwrap();

    let (seen, progress) = recording_progress();
    provisioner.ensure(&progress).unwrap();

    // the reuse path rewrites nothing and reports completion once
    assert_eq!(*seen.lock().unwrap(), vec![1.0]);
    let modified_after = fs::metadata(provisioner.artifact_path())
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(modified_before, modified_after);
}

#[test]
fn changed_source_forces_a_fresh_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("bundled.gguf");
    sparse_gguf(&source);

    let provisioner = ModelArtifactProvisioner::new(source.clone(), dir.path());
    preprovision(&provisioner, dir.path(), &source);

    // rewrite the sidecar as if the artifact came from a longer source
    let stale = SourceFingerprint {
        source_path: source.to_string_lossy().to_string(),
        source_len: Some(MIN_ARTIFACT_BYTES + 4096),
    };
    fs::write(
        dir.path().join(SIDECAR_FILE),
        serde_json::to_string_pretty(&stale).unwrap(),
    )
    .unwrap();

    let (seen, progress) = recording_progress();
    provisioner.ensure(&progress).unwrap();

    // the stale artifact was replaced by a full copy
    assert!(seen.lock().unwrap().len() > 1);
    assert!(provisioner.is_provisioned());

    let recorded: SourceFingerprint =
        serde_json::from_str(&fs::read_to_string(dir.path().join(SIDECAR_FILE)).unwrap()).unwrap();
    assert_eq!(recorded.source_len, Some(MIN_ARTIFACT_BYTES));
}

#[test]
fn truncated_source_fails_and_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("bundled.gguf");
    let mut file = File::create(&source).unwrap();
    file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
    file.set_len(1000).unwrap();
    drop(file);

    let provisioner = ModelArtifactProvisioner::new(source, dir.path());
    let result = provisioner.ensure(&|_| {});

    assert!(matches!(result, Err(ArtifactError::Invalid(_))));
    assert!(!provisioner.artifact_path().exists());
    assert!(!dir.path().join(SIDECAR_FILE).exists());
    assert!(!dir.path().join(format!("{}.partial", ARTIFACT_FILE)).exists());
    assert!(!provisioner.is_provisioned());
}

#[test]
fn missing_source_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("nowhere.gguf");

    let provisioner = ModelArtifactProvisioner::new(source.clone(), dir.path());
    match provisioner.ensure(&|_| {}) {
        Err(ArtifactError::SourceMissing(path)) => assert_eq!(path, source),
        other => panic!("expected SourceMissing, got {:?}", other),
    }
}

#[test]
fn corrupt_artifacts_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("bundled.gguf");
    sparse_gguf(&source);

    let provisioner = ModelArtifactProvisioner::new(source.clone(), dir.path());
    preprovision(&provisioner, dir.path(), &source);
    assert!(provisioner.is_provisioned());

    // too short to be a complete copy
    let file = File::create(provisioner.artifact_path()).unwrap();
    file.set_len(1000).unwrap();
    drop(file);
    assert!(!provisioner.is_provisioned());

    // long enough but not a GGUF file
    let mut file = File::create(provisioner.artifact_path()).unwrap();
    file.write_all(b"FAKE").unwrap();
    file.set_len(MIN_ARTIFACT_BYTES).unwrap();
    drop(file);
    assert!(!provisioner.is_provisioned());
}

#[test]
fn remove_clears_artifact_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("bundled.gguf");
    sparse_gguf(&source);

    let provisioner = ModelArtifactProvisioner::new(source.clone(), dir.path());
    preprovision(&provisioner, dir.path(), &source);
    assert!(provisioner.is_provisioned());

    provisioner.remove().unwrap();
    assert!(!provisioner.artifact_path().exists());
    assert!(!dir.path().join(SIDECAR_FILE).exists());
    assert!(!provisioner.is_provisioned());

    // removing again is fine
    provisioner.remove().unwrap();
}
