pub mod engine;
pub mod state;

// Re-export the engine and its error type
pub use engine::{EngineError, InferenceEngine};
// Re-export the lifecycle state machine
pub use state::EngineState;
