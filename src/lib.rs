// Declare top-level modules
pub mod artifact;
pub mod backend;
pub mod budget;
pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod prefs;
pub mod prompt;
pub mod telemetry;

// Re-export the types most callers need
pub use artifact::{ArtifactError, ModelArtifactProvisioner};
pub use backend::{create_backend, BackendError, InferenceBackend, TokenPiece, TokenStream};
pub use budget::{TokenBudgetEstimator, MAX_INPUT_TOKENS};
pub use config::Settings;
pub use engine::{EngineError, EngineState, InferenceEngine};
pub use orchestrator::{GenerationOrchestrator, GenerationUpdate};
pub use prefs::{JsonPreferences, MemoryPreferences, PreferenceStore};
pub use prompt::PromptTemplate;
pub use telemetry::{ErrorCategory, MetricKind, TelemetryCollector};

/// Shared progress callback signature used by provisioning and model loading.
pub type ProgressFn = dyn Fn(f32) + Send + Sync;
