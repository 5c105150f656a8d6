pub mod orchestrator;
pub mod types;

// Re-export the orchestrator
pub use orchestrator::GenerationOrchestrator;
// Re-export the update surface
pub use types::{GenerationUpdate, UpdateStream, MSG_PROCESSING_FAILED, MSG_TOO_LONG};
