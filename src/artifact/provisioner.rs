use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, info, warn};

use super::types::{
    ArtifactError, SourceFingerprint, ARTIFACT_FILE, GGUF_MAGIC, MIN_ARTIFACT_BYTES, SIDECAR_FILE,
};
use crate::ProgressFn;

/// Chunk size for streaming the bundled source into place
const COPY_CHUNK_BYTES: usize = 8192;

/// Extracts the bundled model into the writable data directory and keeps it
/// verifiably intact.
///
/// Extraction streams through a `.partial` file that is renamed into place
/// only after validation, so no caller ever observes a half-written artifact
/// under the final name. A JSON sidecar records the fingerprint of the source
/// the artifact came from; when the bundled source changes, the stale artifact
/// is deleted and extracted again.
#[derive(Clone)]
pub struct ModelArtifactProvisioner {
    source_path: PathBuf,
    artifact_path: PathBuf,
    sidecar_path: PathBuf,
}

impl ModelArtifactProvisioner {
    /// Creates a provisioner for the given bundled source and data directory.
    pub fn new(source_path: PathBuf, data_dir: &Path) -> Self {
        Self {
            source_path,
            artifact_path: data_dir.join(ARTIFACT_FILE),
            sidecar_path: data_dir.join(SIDECAR_FILE),
        }
    }

    /// Path the extracted artifact lives at once provisioned.
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Ensures a validated artifact exists, extracting the bundled source
    /// when it is missing, stale or corrupt.
    ///
    /// Progress is reported as a fraction in 0.0..=1.0. When the existing
    /// artifact can be reused only the final 1.0 is reported and nothing is
    /// rewritten.
    ///
    /// # Arguments
    ///
    /// * `progress` - Callback invoked with the copied fraction
    ///
    /// # Returns
    ///
    /// The path of the validated artifact
    pub fn ensure(&self, progress: &ProgressFn) -> Result<PathBuf, ArtifactError> {
        let fingerprint = self.source_fingerprint()?;

        if self.reusable(&fingerprint) {
            debug!("Reusing provisioned artifact at {}", self.artifact_path.display());
            progress(1.0);
            return Ok(self.artifact_path.clone());
        }

        self.extract(&fingerprint, progress)?;
        Ok(self.artifact_path.clone())
    }

    /// True when a validated artifact and its fingerprint sidecar are in place.
    pub fn is_provisioned(&self) -> bool {
        self.read_sidecar().is_some() && self.validate_file(&self.artifact_path).is_ok()
    }

    /// Byte size of the extracted artifact, when present.
    pub fn artifact_size(&self) -> Option<u64> {
        fs::metadata(&self.artifact_path).ok().map(|meta| meta.len())
    }

    /// Removes the artifact, its sidecar and any leftover partial file.
    pub fn remove(&self) -> Result<(), ArtifactError> {
        for path in [&self.artifact_path, &self.sidecar_path, &self.partial_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ArtifactError::Io(e)),
            }
        }
        Ok(())
    }

    /// Fingerprints the bundled source by path and byte length.
    fn source_fingerprint(&self) -> Result<SourceFingerprint, ArtifactError> {
        if !self.source_path.exists() {
            return Err(ArtifactError::SourceMissing(self.source_path.clone()));
        }
        let source_len = fs::metadata(&self.source_path).ok().map(|meta| meta.len());
        Ok(SourceFingerprint {
            source_path: self.source_path.to_string_lossy().to_string(),
            source_len,
        })
    }

    /// Checks whether the existing artifact can serve for the given source.
    fn reusable(&self, fingerprint: &SourceFingerprint) -> bool {
        if !self.artifact_path.exists() {
            return false;
        }

        let recorded = match self.read_sidecar() {
            Some(recorded) => recorded,
            None => return false,
        };
        if recorded != *fingerprint {
            info!("Bundled model changed, the artifact will be extracted again");
            return false;
        }

        // The destination must still span the full source
        if let (Some(expected), Some(actual)) = (fingerprint.source_len, self.artifact_size()) {
            if expected != actual {
                warn!(expected, actual, "Artifact size no longer matches its source");
                return false;
            }
        }

        self.validate_file(&self.artifact_path).is_ok()
    }

    /// Streams the source into place, replacing whatever was there before.
    fn extract(&self, fingerprint: &SourceFingerprint, progress: &ProgressFn) -> Result<(), ArtifactError> {
        // Clear any stale artifact and sidecar before writing anew
        self.remove()?;

        let partial_path = self.partial_path();
        if let Err(e) = self.copy_and_commit(&partial_path, fingerprint, progress) {
            // Never leave a half-written file or a stale sidecar behind
            let _ = fs::remove_file(&partial_path);
            let _ = fs::remove_file(&self.sidecar_path);
            return Err(e);
        }
        Ok(())
    }

    fn copy_and_commit(
        &self,
        partial_path: &Path,
        fingerprint: &SourceFingerprint,
        progress: &ProgressFn,
    ) -> Result<(), ArtifactError> {
        let total = fingerprint.source_len.unwrap_or(0);
        info!(
            source = %self.source_path.display(),
            total_bytes = total,
            "Extracting model artifact"
        );

        let mut source = File::open(&self.source_path)?;
        let mut dest = File::create(partial_path)?;
        let mut buffer = [0u8; COPY_CHUNK_BYTES];
        let mut written: u64 = 0;

        loop {
            let read = source.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            dest.write_all(&buffer[..read])?;
            written += read as u64;
            if total > 0 {
                progress((written as f32 / total as f32).clamp(0.0, 1.0));
            }
        }
        dest.sync_all()?;
        drop(dest);

        self.validate_file(partial_path)?;
        fs::rename(partial_path, &self.artifact_path)?;

        // The sidecar is written only once the artifact is in place, so a
        // present sidecar always describes a complete artifact
        let content = serde_json::to_string_pretty(fingerprint)
            .map_err(|e| ArtifactError::Invalid(format!("Failed to serialize fingerprint: {}", e)))?;
        fs::write(&self.sidecar_path, content)?;

        progress(1.0);
        info!(
            artifact = %self.artifact_path.display(),
            bytes = written,
            "Model artifact provisioned"
        );
        Ok(())
    }

    /// Validates that a file is a plausible model artifact: long enough to be
    /// a complete copy and starting with the GGUF magic number.
    fn validate_file(&self, path: &Path) -> Result<(), ArtifactError> {
        let len = fs::metadata(path)?.len();
        if len < MIN_ARTIFACT_BYTES {
            return Err(ArtifactError::Invalid(format!(
                "Artifact is {} bytes, below the {} byte minimum",
                len, MIN_ARTIFACT_BYTES
            )));
        }

        let mut file = File::open(path)?;
        let magic = file.read_u32::<LittleEndian>()?;
        if magic != GGUF_MAGIC {
            return Err(ArtifactError::Invalid(format!(
                "Artifact does not start with the GGUF magic (found 0x{:08X})",
                magic
            )));
        }
        Ok(())
    }

    fn read_sidecar(&self) -> Option<SourceFingerprint> {
        let content = fs::read_to_string(&self.sidecar_path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = OsString::from(self.artifact_path.as_os_str());
        name.push(".partial");
        PathBuf::from(name)
    }
}
