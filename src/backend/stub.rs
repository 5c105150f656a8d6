use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use tracing::debug;

use super::backend::{BackendError, InferenceBackend, TokenPiece, TokenStream};
use crate::ProgressFn;

/// Pause between streamed pieces, mimicking real decode cadence
const STREAM_DELAY: Duration = Duration::from_millis(5);

/// Memory the stub claims while loaded
const STUB_MEMORY_BYTES: u64 = 48 * 1024 * 1024;

/// A deterministic backend for development and tests.
///
/// It loads instantly, echoes the prompt back word by word and finishes with
/// the usual end marker, so every streaming code path can run without model
/// weights. Cancellation between pieces terminates the stream with an empty
/// final piece.
pub struct StubBackend {
    loaded: AtomicBool,
    piece_delay: Duration,
    /// Cancellation flag of the generation in flight; replaced on each call
    cancel_flag: Mutex<Arc<AtomicBool>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::with_delay(STREAM_DELAY)
    }

    /// Creates a stub with a custom inter-piece delay; tests pass zero.
    pub fn with_delay(piece_delay: Duration) -> Self {
        Self {
            loaded: AtomicBool::new(false),
            piece_delay,
            cancel_flag: Mutex::new(Arc::new(AtomicBool::new(false))),
        }
    }

    /// Installs and returns a fresh cancellation flag for a new generation.
    fn arm_cancel_flag(&self) -> Arc<AtomicBool> {
        let fresh = Arc::new(AtomicBool::new(false));
        if let Ok(mut current) = self.cancel_flag.lock() {
            *current = Arc::clone(&fresh);
        }
        fresh
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    async fn load(&self, artifact_path: &Path, progress: Arc<ProgressFn>) -> Result<(), BackendError> {
        debug!("Stub backend loading {}", artifact_path.display());
        progress(0.0);
        progress(0.5);
        self.loaded.store(true, Ordering::SeqCst);
        progress(1.0);
        Ok(())
    }

    async fn generate(&self, prompt: &str) -> Result<TokenStream, BackendError> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(BackendError::NotLoaded);
        }

        let cancel = self.arm_cancel_flag();
        let words: Vec<String> = prompt.split_whitespace().map(str::to_string).collect();
        let delay = self.piece_delay;

        let stream = stream! {
            let mut cancelled = false;
            for (i, word) in words.iter().enumerate() {
                if cancel.load(Ordering::SeqCst) {
                    cancelled = true;
                    break;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if i == 0 {
                    yield Ok(TokenPiece::fragment(word));
                } else {
                    yield Ok(TokenPiece::fragment(&format!(" {}", word)));
                }
            }
            if cancelled {
                yield Ok(TokenPiece::terminal(""));
            } else {
                yield Ok(TokenPiece::terminal(" ### End"));
            }
        };

        Ok(Box::pin(stream))
    }

    fn cancel(&self) {
        if let Ok(current) = self.cancel_flag.lock() {
            current.store(true, Ordering::SeqCst);
        }
    }

    fn release(&self) {
        self.cancel();
        self.loaded.store(false, Ordering::SeqCst);
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn memory_usage_bytes(&self) -> u64 {
        if self.is_loaded() {
            STUB_MEMORY_BYTES
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn loaded_stub() -> StubBackend {
        let stub = StubBackend::with_delay(Duration::ZERO);
        let progress: Arc<ProgressFn> = Arc::new(|_| {});
        stub.load(Path::new("unused.gguf"), progress).await.unwrap();
        stub
    }

    #[tokio::test]
    async fn generate_before_load_fails() {
        let stub = StubBackend::with_delay(Duration::ZERO);
        assert!(matches!(
            stub.generate("anything").await,
            Err(BackendError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn stream_ends_with_exactly_one_final_piece() {
        let stub = loaded_stub().await;
        let mut stream = stub.generate("one two three").await.unwrap();

        let mut pieces = Vec::new();
        while let Some(item) = stream.next().await {
            pieces.push(item.unwrap());
        }

        let finals = pieces.iter().filter(|piece| piece.is_final).count();
        assert_eq!(finals, 1);
        assert!(pieces.last().unwrap().is_final);

        let text: String = pieces.iter().map(|piece| piece.text.as_str()).collect();
        assert_eq!(text, "one two three ### End");
    }

    #[tokio::test]
    async fn cancel_terminates_with_empty_final_piece() {
        let stub = loaded_stub().await;
        let mut stream = stub.generate("alpha beta gamma delta").await.unwrap();

        // consume one piece, then cancel mid-stream
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_final);
        stub.cancel();

        let mut last = first;
        while let Some(item) = stream.next().await {
            last = item.unwrap();
        }
        assert!(last.is_final);
        assert!(last.text.is_empty());
    }

    #[tokio::test]
    async fn release_unloads_the_backend() {
        let stub = loaded_stub().await;
        assert!(stub.is_loaded());
        assert!(stub.memory_usage_bytes() > 0);

        stub.release();
        assert!(!stub.is_loaded());
        assert_eq!(stub.memory_usage_bytes(), 0);
        assert!(matches!(
            stub.generate("anything").await,
            Err(BackendError::NotLoaded)
        ));
    }
}
