use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};

/// The magic number that identifies GGUF files
pub const GGUF_MAGIC: u32 = 0x46554747; // "GGUF" in ASCII

/// Minimum byte length a complete model artifact can plausibly have.
/// Anything shorter is a truncated or corrupt copy.
pub const MIN_ARTIFACT_BYTES: u64 = 100_000_000;

/// File name of the extracted artifact inside the data directory
pub const ARTIFACT_FILE: &str = "plainly_model.gguf";

/// File name of the fingerprint sidecar next to the artifact
pub const SIDECAR_FILE: &str = "plainly_model.meta";

/// Identity of the bundled source an artifact was extracted from.
///
/// A changed path or byte length means the application now ships a different
/// model, so the extracted artifact is stale and must be replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    /// Logical path of the bundled source file
    pub source_path: String,
    /// Byte length of the source, when it could be determined
    pub source_len: Option<u64>,
}

/// Custom error types for artifact provisioning
#[derive(Debug)]
pub enum ArtifactError {
    /// Wraps std::io::Error for file operations
    Io(std::io::Error),
    /// The artifact failed validation, with a reason
    Invalid(String),
    /// The bundled source file does not exist
    SourceMissing(PathBuf),
}

/// Implements Display trait for ArtifactError for error reporting
impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArtifactError::Io(e) => write!(f, "I/O error: {}", e),
            ArtifactError::Invalid(msg) => write!(f, "Invalid model artifact: {}", msg),
            ArtifactError::SourceMissing(path) => {
                write!(f, "Bundled model not found at: {}", path.display())
            }
        }
    }
}

/// Implements Error trait to allow ArtifactError to be used as a standard error type
impl Error for ArtifactError {}

/// Allows automatic conversion from std::io::Error to ArtifactError
impl From<std::io::Error> for ArtifactError {
    fn from(err: std::io::Error) -> Self {
        ArtifactError::Io(err)
    }
}
