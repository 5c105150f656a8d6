use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_stream::stream;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::state::EngineState;
use crate::artifact::{ArtifactError, ModelArtifactProvisioner};
use crate::backend::{create_backend, BackendError, InferenceBackend, TokenStream};
use crate::config::Settings;
use crate::ProgressFn;

/// Share of overall initialization progress attributed to provisioning;
/// the remainder covers weight loading.
const PROVISION_SHARE: f32 = 0.5;

/// Custom error types for engine operations
#[derive(Debug)]
pub enum EngineError {
    /// An operation arrived before a successful initialize
    NotInitialized,
    /// Provisioning the model artifact failed
    Artifact(ArtifactError),
    /// Initialization failed outside provisioning and the backend
    LoadFailed(String),
    /// The backend rejected or aborted an operation
    Backend(BackendError),
}

/// Implements Display trait for EngineError for error reporting
impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::NotInitialized => write!(f, "Engine is not initialized"),
            EngineError::Artifact(e) => write!(f, "Artifact provisioning failed: {}", e),
            EngineError::LoadFailed(msg) => write!(f, "Engine initialization failed: {}", msg),
            EngineError::Backend(e) => write!(f, "Backend error: {}", e),
        }
    }
}

/// Implements Error trait to allow EngineError to be used as a standard error type
impl Error for EngineError {}

impl From<ArtifactError> for EngineError {
    fn from(err: ArtifactError) -> Self {
        EngineError::Artifact(err)
    }
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        EngineError::Backend(err)
    }
}

/// The core inference engine that owns the model lifecycle.
///
/// The engine maintains thread-safe access to its lifecycle state using a
/// RwLock, allowing concurrent readers while operations move it along. The
/// mutating operations serialize on an async operation lock, so initialize,
/// generate and release never interleave.
pub struct InferenceEngine {
    backend: Box<dyn InferenceBackend>,
    provisioner: ModelArtifactProvisioner,
    state: Arc<RwLock<EngineState>>,
    /// Serializes lifecycle operations
    op_lock: Mutex<()>,
    /// Bumped when a generation starts and on release, so a superseded
    /// stream can no longer flip the state
    generation_epoch: Arc<AtomicU64>,
}

impl InferenceEngine {
    /// Creates an engine from settings, selecting the configured backend.
    pub fn new(settings: &Settings) -> Result<Self, EngineError> {
        let backend = create_backend(settings)?;
        let provisioner = ModelArtifactProvisioner::new(
            settings.model.bundled_path.clone(),
            &settings.model.data_dir,
        );
        Ok(Self::with_backend(backend, provisioner))
    }

    /// Creates an engine around an explicit backend and provisioner.
    pub fn with_backend(
        backend: Box<dyn InferenceBackend>,
        provisioner: ModelArtifactProvisioner,
    ) -> Self {
        Self {
            backend,
            provisioner,
            state: Arc::new(RwLock::new(EngineState::Uninitialized)),
            op_lock: Mutex::new(()),
            generation_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|e| EngineState::Failed(format!("State lock poisoned: {}", e)))
    }

    /// True when the engine can accept a generation request right away.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Short name of the backend in use, for logs and diagnostics.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Resident memory attributable to the loaded model, in bytes.
    pub fn memory_usage_bytes(&self) -> u64 {
        self.backend.memory_usage_bytes()
    }

    /// Provisions the model artifact and loads weights.
    ///
    /// Progress covers both phases as a single fraction: provisioning reports
    /// within 0.0..=0.5 and weight loading within 0.5..=1.0. Initializing an
    /// engine that already holds weights is a no-op that reports completion;
    /// a failed engine starts over from scratch.
    pub async fn initialize(&self, progress: Arc<ProgressFn>) -> Result<(), EngineError> {
        let _op = self.op_lock.lock().await;

        if self.state().is_loaded() {
            progress(1.0);
            return Ok(());
        }

        self.set_state(EngineState::Initializing(0.0));
        progress(0.0);

        match self.run_initialization(Arc::clone(&progress)).await {
            Ok(()) => {
                self.set_state(EngineState::Ready);
                info!(backend = self.backend.name(), "Engine initialized and ready");
                Ok(())
            }
            Err(err) => {
                warn!("Engine initialization failed: {}", err);
                // A failed load may leave partial weights behind
                self.backend.release();
                self.set_state(EngineState::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    async fn run_initialization(&self, progress: Arc<ProgressFn>) -> Result<(), EngineError> {
        // Phase one: put a validated artifact in place. The copy is blocking
        // IO, so it runs on the blocking thread pool.
        let provisioner = self.provisioner.clone();
        let state = Arc::clone(&self.state);
        let report = Arc::clone(&progress);
        let artifact_path = tokio::task::spawn_blocking(move || {
            let phase = move |fraction: f32| {
                let overall = fraction * PROVISION_SHARE;
                set_progress(&state, overall);
                report(overall);
            };
            provisioner.ensure(&phase)
        })
        .await
        .map_err(|e| EngineError::LoadFailed(format!("Provisioning task failed: {}", e)))??;

        // Phase two: hand the artifact to the backend.
        let state = Arc::clone(&self.state);
        let report = Arc::clone(&progress);
        let load_progress: Arc<ProgressFn> = Arc::new(move |fraction: f32| {
            let overall = PROVISION_SHARE + fraction * (1.0 - PROVISION_SHARE);
            set_progress(&state, overall);
            report(overall);
        });
        self.backend.load(&artifact_path, load_progress).await?;
        Ok(())
    }

    /// Starts one generation over the prompt and returns its piece stream.
    ///
    /// The stream restores the engine to `Ready` when it finishes or is
    /// dropped. Starting a new generation while one is in flight cancels the
    /// old one; the superseded stream can no longer affect engine state.
    pub async fn generate(&self, prompt: &str) -> Result<TokenStream, EngineError> {
        let _op = self.op_lock.lock().await;

        match self.state() {
            EngineState::Ready => {}
            EngineState::Generating => {
                // Latest request wins
                self.backend.cancel();
            }
            _ => return Err(EngineError::NotInitialized),
        }

        let epoch = self.generation_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(EngineState::Generating);

        let inner = match self.backend.generate(prompt).await {
            Ok(stream) => stream,
            Err(err) => {
                // The model is still loaded; only this request failed to start
                self.set_state(EngineState::Ready);
                return Err(EngineError::Backend(err));
            }
        };

        let guard = GenerationGuard {
            state: Arc::clone(&self.state),
            epoch_counter: Arc::clone(&self.generation_epoch),
            epoch,
        };

        let stream = stream! {
            let _guard = guard;
            let mut inner = inner;
            while let Some(item) = inner.next().await {
                let done = item.is_err() || matches!(&item, Ok(piece) if piece.is_final);
                yield item;
                if done {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Requests cancellation of the generation in flight, if any.
    /// Best-effort and idempotent; safe to call at any time.
    pub fn cancel(&self) {
        self.backend.cancel();
    }

    /// Cancels any generation in flight, releases model weights and returns
    /// the engine to `Uninitialized`. Safe to call in any state.
    pub async fn release(&self) {
        let _op = self.op_lock.lock().await;
        // Stale streams must not touch state once the weights are gone
        self.generation_epoch.fetch_add(1, Ordering::SeqCst);
        self.backend.cancel();
        self.backend.release();
        self.set_state(EngineState::Uninitialized);
        info!("Engine released");
    }

    fn set_state(&self, next: EngineState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = next;
        }
    }
}

/// Records initialization progress while the engine is still initializing.
fn set_progress(state: &RwLock<EngineState>, fraction: f32) {
    if let Ok(mut guard) = state.write() {
        if matches!(*guard, EngineState::Initializing(_)) {
            *guard = EngineState::Initializing(fraction);
        }
    }
}

/// Restores `Generating -> Ready` when the generation it belongs to ends,
/// unless a newer generation or a release has taken over in the meantime.
struct GenerationGuard {
    state: Arc<RwLock<EngineState>>,
    epoch_counter: Arc<AtomicU64>,
    epoch: u64,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        if self.epoch_counter.load(Ordering::SeqCst) != self.epoch {
            return;
        }
        if let Ok(mut guard) = self.state.write() {
            if *guard == EngineState::Generating {
                *guard = EngineState::Ready;
            }
        }
    }
}
