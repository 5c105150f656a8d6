mod provisioner;
mod types;

// Re-export from provisioner
pub use provisioner::ModelArtifactProvisioner;
// Re-export from types
pub use types::{
    ArtifactError, SourceFingerprint, ARTIFACT_FILE, GGUF_MAGIC, MIN_ARTIFACT_BYTES, SIDECAR_FILE,
};
