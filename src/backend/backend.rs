use std::error::Error;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

#[cfg(feature = "llama")]
use super::llama::LlamaBackend;
use super::stub::StubBackend;
use crate::config::Settings;
use crate::ProgressFn;

/// One increment of generated output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPiece {
    /// Text fragment decoded for this step; may be empty on the final piece
    pub text: String,
    /// Set exactly once, on the piece that terminates the stream
    pub is_final: bool,
}

impl TokenPiece {
    /// A non-final piece carrying a fragment of output text.
    pub fn fragment(text: &str) -> Self {
        Self {
            text: text.to_string(),
            is_final: false,
        }
    }

    /// The terminating piece of a stream, possibly empty.
    pub fn terminal(text: &str) -> Self {
        Self {
            text: text.to_string(),
            is_final: true,
        }
    }
}

/// Stream of generated pieces: zero or more non-final pieces followed by
/// exactly one final piece. An error item also terminates the stream.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenPiece, BackendError>> + Send>>;

/// Custom error types for backend operations
#[derive(Debug)]
pub enum BackendError {
    /// A call arrived before load or after release
    NotLoaded,
    /// The backend ran out of memory while loading or generating
    OutOfMemory(String),
    /// Any other backend failure, with a reason
    Failed(String),
}

/// Implements Display trait for BackendError for error reporting
impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendError::NotLoaded => write!(f, "No model is loaded"),
            BackendError::OutOfMemory(msg) => write!(f, "Backend out of memory: {}", msg),
            BackendError::Failed(msg) => write!(f, "Backend failure: {}", msg),
        }
    }
}

/// Implements Error trait to allow BackendError to be used as a standard error type
impl Error for BackendError {}

/// The contract every inference backend fulfils.
///
/// The trait is object-safe so the engine can hold a `Box<dyn
/// InferenceBackend>` chosen at runtime. Implementations run blocking model
/// work off the async runtime and feed results back through the returned
/// stream.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Short backend name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Loads model weights from a validated artifact.
    ///
    /// Progress is reported as a fraction in 0.0..=1.0. Load either succeeds
    /// completely or fails with no weights retained; there is no partial
    /// success.
    async fn load(&self, artifact_path: &Path, progress: Arc<ProgressFn>) -> Result<(), BackendError>;

    /// Starts one generation over the prompt and returns its piece stream.
    ///
    /// The stream terminates with exactly one final piece (possibly empty),
    /// including after cancellation. An `Err` item likewise terminates it.
    async fn generate(&self, prompt: &str) -> Result<TokenStream, BackendError>;

    /// Requests cancellation of the generation in flight, if any.
    /// Best-effort and idempotent; safe to call at any time.
    fn cancel(&self);

    /// Releases loaded weights and scratch memory. Afterwards `is_loaded`
    /// reports false and `generate` fails until `load` is called again.
    fn release(&self);

    /// Whether weights are currently loaded.
    fn is_loaded(&self) -> bool;

    /// Resident memory attributable to the backend, in bytes. Zero when
    /// unknown.
    fn memory_usage_bytes(&self) -> u64;
}

// Factory function to create a backend based on the configured kind
pub fn create_backend(settings: &Settings) -> Result<Box<dyn InferenceBackend>, BackendError> {
    match settings.backend.kind.as_str() {
        "stub" => Ok(Box::new(StubBackend::new())),
        "llama" => llama_backend(settings),
        // "auto" and anything else validation let through
        _ => auto_backend(settings),
    }
}

#[cfg(feature = "llama")]
fn llama_backend(settings: &Settings) -> Result<Box<dyn InferenceBackend>, BackendError> {
    Ok(Box::new(LlamaBackend::new(settings)))
}

#[cfg(not(feature = "llama"))]
fn llama_backend(_settings: &Settings) -> Result<Box<dyn InferenceBackend>, BackendError> {
    Err(BackendError::Failed(
        "This build does not include the llama backend".to_string(),
    ))
}

#[cfg(feature = "llama")]
fn auto_backend(settings: &Settings) -> Result<Box<dyn InferenceBackend>, BackendError> {
    Ok(Box::new(LlamaBackend::new(settings)))
}

#[cfg(not(feature = "llama"))]
fn auto_backend(_settings: &Settings) -> Result<Box<dyn InferenceBackend>, BackendError> {
    Ok(Box::new(StubBackend::new()))
}
