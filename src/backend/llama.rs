use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use llama_cpp::standard_sampler::StandardSampler;
use llama_cpp::{LlamaModel, LlamaParams, SessionParams};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::backend::{BackendError, InferenceBackend, TokenPiece, TokenStream};
use crate::config::Settings;
use crate::ProgressFn;

/// Channel capacity between the decode thread and the async stream
const PIECE_CHANNEL_CAPACITY: usize = 32;

/// Batch size passed to the llama session
const N_BATCH: u32 = 512;

/// Backend that runs the model through llama_cpp.
///
/// Loading and token decoding are blocking operations, so both run on the
/// blocking thread pool; generated pieces cross back into async land over a
/// bounded channel.
pub struct LlamaBackend {
    model: RwLock<Option<Arc<LlamaModel>>>,
    model_size_bytes: AtomicU64,
    /// Cancellation flag of the generation in flight; replaced on each call
    cancel_flag: Mutex<Arc<AtomicBool>>,
    n_gpu_layers: u32,
    use_mmap: bool,
    use_mlock: bool,
    max_tokens: usize,
    context_size: usize,
}

impl LlamaBackend {
    pub fn new(settings: &Settings) -> Self {
        Self {
            model: RwLock::new(None),
            model_size_bytes: AtomicU64::new(0),
            cancel_flag: Mutex::new(Arc::new(AtomicBool::new(false))),
            n_gpu_layers: settings.backend.n_gpu_layers,
            use_mmap: settings.backend.use_mmap,
            use_mlock: settings.backend.use_mlock,
            max_tokens: settings.generation.max_tokens,
            context_size: settings.generation.context_size,
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

#[async_trait]
impl InferenceBackend for LlamaBackend {
    fn name(&self) -> &str {
        "llama"
    }

    async fn load(&self, artifact_path: &Path, progress: Arc<ProgressFn>) -> Result<(), BackendError> {
        let llama_params = LlamaParams {
            n_gpu_layers: self.n_gpu_layers,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
            ..Default::default()
        };
        info!(
            n_gpu_layers = self.n_gpu_layers,
            use_mmap = self.use_mmap,
            use_mlock = self.use_mlock,
            "Loading model via llama_cpp: {}",
            artifact_path.display()
        );

        progress(0.0);
        let path = artifact_path.to_path_buf();
        let loaded = tokio::task::spawn_blocking(move || LlamaModel::load_from_file(&path, llama_params))
            .await
            .map_err(|e| BackendError::Failed(format!("Model load task failed: {}", e)))?
            .map_err(|e| map_llama_error("load model", &e.to_string()))?;

        let size = fs::metadata(artifact_path).map(|m| m.len()).unwrap_or(0);
        self.model_size_bytes.store(size, Ordering::SeqCst);
        {
            let mut guard = self
                .model
                .write()
                .map_err(|e| BackendError::Failed(format!("Failed to get write lock on model: {}", e)))?;
            *guard = Some(Arc::new(loaded));
        }
        progress(1.0);
        info!("Successfully loaded model via llama_cpp.");
        Ok(())
    }

    async fn generate(&self, prompt: &str) -> Result<TokenStream, BackendError> {
        let model = {
            let guard = self
                .model
                .read()
                .map_err(|e| BackendError::Failed(format!("Failed to get read lock on model: {}", e)))?;
            guard.as_ref().cloned().ok_or(BackendError::NotLoaded)?
        };

        let cancel = self.arm_cancel_flag();
        let prompt = prompt.to_string();
        let max_tokens = self.max_tokens;
        let context_size = self.context_size;

        let (tx, rx) = mpsc::channel(PIECE_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = run_generation(&model, &prompt, max_tokens, context_size, &cancel, &tx) {
                warn!("Generation failed: {}", err);
                let _ = tx.blocking_send(Err(err));
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn cancel(&self) {
        if let Ok(current) = self.cancel_flag.lock() {
            current.store(true, Ordering::SeqCst);
        }
    }

    fn release(&self) {
        self.cancel();
        if let Ok(mut guard) = self.model.write() {
            *guard = None;
        }
        self.model_size_bytes.store(0, Ordering::SeqCst);
        info!("Released llama model.");
    }

    fn is_loaded(&self) -> bool {
        self.model
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn memory_usage_bytes(&self) -> u64 {
        self.model_size_bytes.load(Ordering::SeqCst)
    }
}

/// Runs one completion on the blocking pool, pushing pieces into `tx`.
///
/// Stops early when the cancellation flag is set (terminating the stream with
/// an empty final piece) or when the receiver side has been dropped.
fn run_generation(
    model: &LlamaModel,
    prompt: &str,
    max_tokens: usize,
    context_size: usize,
    cancel: &AtomicBool,
    tx: &mpsc::Sender<Result<TokenPiece, BackendError>>,
) -> Result<(), BackendError> {
    let session_params = SessionParams {
        n_ctx: context_size as u32,
        n_batch: N_BATCH,
        ..Default::default()
    };
    let mut session = model
        .create_session(session_params)
        .map_err(|e| map_llama_error("create session", &e.to_string()))?;

    session
        .advance_context(prompt)
        .map_err(|e| map_llama_error("advance context", &e.to_string()))?;

    let completions = session
        .start_completing_with(StandardSampler::default(), max_tokens)
        .map_err(|e| map_llama_error("start completion", &e.to_string()))?;

    let mut generated = 0usize;
    for token in completions {
        if cancel.load(Ordering::SeqCst) {
            let _ = tx.blocking_send(Ok(TokenPiece::terminal("")));
            return Ok(());
        }
        let piece = model.token_to_piece(token);
        if tx.blocking_send(Ok(TokenPiece::fragment(&piece))).is_err() {
            // Receiver dropped; nothing left to deliver to.
            return Ok(());
        }
        generated += 1;
        if generated >= max_tokens {
            warn!("Reached max token limit ({}) during generation.", max_tokens);
            break;
        }
    }

    let _ = tx.blocking_send(Ok(TokenPiece::terminal("")));
    Ok(())
}

/// Maps a llama_cpp failure onto the backend error taxonomy.
fn map_llama_error(action: &str, reason: &str) -> BackendError {
    let lowered = reason.to_lowercase();
    if lowered.contains("out of memory") || lowered.contains("oom") {
        BackendError::OutOfMemory(format!("{}: {}", action, reason))
    } else {
        BackendError::Failed(format!("Failed to {}: {}", action, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_reasons_are_classified() {
        assert!(matches!(
            map_llama_error("load model", "CUDA error: Out of Memory"),
            BackendError::OutOfMemory(_)
        ));
        assert!(matches!(
            map_llama_error("load model", "ggml oom while reserving buffer"),
            BackendError::OutOfMemory(_)
        ));
        assert!(matches!(
            map_llama_error("load model", "file truncated"),
            BackendError::Failed(_)
        ));
    }
}
