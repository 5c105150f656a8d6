pub mod backend;
#[cfg(feature = "llama")]
pub mod llama;
pub mod stub;

// Re-export the backend trait, stream types and factory function
pub use backend::{create_backend, BackendError, InferenceBackend, TokenPiece, TokenStream};
// Re-export the StubBackend for testing/debugging
pub use stub::StubBackend;

#[cfg(feature = "llama")]
pub use llama::LlamaBackend;
