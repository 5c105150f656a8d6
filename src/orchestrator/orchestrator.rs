use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::types::{GenerationUpdate, UpdateStream, MSG_PROCESSING_FAILED, MSG_TOO_LONG};
use crate::backend::BackendError;
use crate::budget::{TokenBudgetEstimator, MAX_INPUT_TOKENS};
use crate::engine::{EngineError, InferenceEngine};
use crate::prefs::{PreferenceStore, FIRST_LAUNCH_COMPLETE};
use crate::prompt::{strip_end_marker, PromptTemplate};
use crate::telemetry::{ErrorCategory, TelemetryCollector};
use crate::ProgressFn;

/// Drives one generation call at a time from raw input to streamed updates.
///
/// Every `submit` gets the next sequence number and immediately supersedes the
/// call before it: the older call's remaining deliveries are discarded, never
/// interleaved into the newer call's output. The orchestrator gates input on
/// the token budget before touching the engine, renders the prompt template,
/// accumulates streamed pieces into user-facing updates and records numeric
/// session metrics on completion or failure.
pub struct GenerationOrchestrator {
    engine: Arc<InferenceEngine>,
    prefs: Arc<dyn PreferenceStore>,
    telemetry: Arc<TelemetryCollector>,
    estimator: TokenBudgetEstimator,
    template: PromptTemplate,
    next_seq: AtomicU64,
    active_seq: Arc<AtomicU64>,
    /// Serializes the stretch from validation to generation start, so an
    /// older call can never enter the engine after a newer one
    pipeline: Arc<Mutex<()>>,
}

impl GenerationOrchestrator {
    pub fn new(
        engine: Arc<InferenceEngine>,
        prefs: Arc<dyn PreferenceStore>,
        telemetry: Arc<TelemetryCollector>,
    ) -> Self {
        Self {
            engine,
            prefs,
            telemetry,
            estimator: TokenBudgetEstimator::new(),
            template: PromptTemplate::default_v1(),
            next_seq: AtomicU64::new(0),
            active_seq: Arc::new(AtomicU64::new(0)),
            pipeline: Arc::new(Mutex::new(())),
        }
    }

    /// Brings the engine up and marks the first launch complete once it
    /// succeeds. Initialization failures are recorded to telemetry.
    pub async fn initialize(&self, progress: Arc<ProgressFn>) -> Result<(), EngineError> {
        bring_up(&self.engine, self.prefs.as_ref(), &self.telemetry, progress).await
    }

    /// Submits raw input and returns the update stream for this call.
    ///
    /// Any call still in flight is superseded right away, before the new
    /// stream is even polled. The stream performs the budget check, lazy
    /// engine initialization and generation when consumed.
    pub fn submit(&self, raw_input: &str) -> UpdateStream {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.active_seq.fetch_max(seq, Ordering::SeqCst);
        // Stop whatever the previous call had in flight
        self.engine.cancel();

        let engine = Arc::clone(&self.engine);
        let prefs = Arc::clone(&self.prefs);
        let telemetry = Arc::clone(&self.telemetry);
        let active_seq = Arc::clone(&self.active_seq);
        let pipeline = Arc::clone(&self.pipeline);
        let estimator = self.estimator;
        let template = self.template.clone();
        let raw_input = raw_input.to_string();

        let updates = stream! {
            yield GenerationUpdate::streaming(String::new());

            let stage = pipeline.lock().await;

            if active_seq.load(Ordering::SeqCst) != seq {
                debug!(seq, "Call superseded before validation");
                yield GenerationUpdate::completed(String::new());
                return;
            }

            // The budget is defined on the raw input, before templating,
            // and rejection must not touch the engine at all
            let input_tokens = estimator.count(&raw_input);
            if input_tokens > MAX_INPUT_TOKENS {
                debug!(input_tokens, "Rejecting input over the token budget");
                drop(stage);
                telemetry.record_error(ErrorCategory::TextTooLong).await;
                yield GenerationUpdate::failed(MSG_TOO_LONG);
                return;
            }

            if !engine.is_ready() {
                let silent: Arc<ProgressFn> = Arc::new(|_| {});
                if let Err(err) = bring_up(&engine, prefs.as_ref(), &telemetry, silent).await {
                    warn!("Initialization failed for this call: {}", err);
                    drop(stage);
                    yield GenerationUpdate::failed(MSG_PROCESSING_FAILED);
                    return;
                }
            }

            if active_seq.load(Ordering::SeqCst) != seq {
                debug!(seq, "Call superseded during initialization");
                yield GenerationUpdate::completed(String::new());
                return;
            }

            let prompt = template.render(&raw_input);
            let submitted_at = Instant::now();
            let mut deliveries = match engine.generate(&prompt).await {
                Ok(inner) => inner,
                Err(err) => {
                    warn!("Generation failed to start: {}", err);
                    drop(stage);
                    telemetry.record_error(categorize(&err, false)).await;
                    yield GenerationUpdate::failed(MSG_PROCESSING_FAILED);
                    return;
                }
            };
            drop(stage);

            let mut accumulated = String::new();
            let mut pieces: u64 = 0;
            let mut first_piece_at: Option<Instant> = None;

            while let Some(item) = deliveries.next().await {
                if active_seq.load(Ordering::SeqCst) != seq {
                    debug!(seq, "Dropping deliveries for a superseded call");
                    yield GenerationUpdate::completed(strip_end_marker(&accumulated));
                    return;
                }
                match item {
                    Ok(piece) if piece.is_final => {
                        accumulated.push_str(&piece.text);
                        let final_text = strip_end_marker(&accumulated);
                        record_session(
                            &telemetry,
                            &engine,
                            &raw_input,
                            &final_text,
                            pieces,
                            submitted_at,
                            first_piece_at,
                        )
                        .await;
                        yield GenerationUpdate::completed(final_text);
                        return;
                    }
                    Ok(piece) => {
                        if first_piece_at.is_none() {
                            first_piece_at = Some(Instant::now());
                        }
                        pieces += 1;
                        accumulated.push_str(&piece.text);
                        yield GenerationUpdate::streaming(accumulated.clone());
                    }
                    Err(err) => {
                        warn!("Generation failed mid-stream: {}", err);
                        let category = match &err {
                            BackendError::OutOfMemory(_) => ErrorCategory::OutOfMemory,
                            _ => ErrorCategory::ProcessingFailed,
                        };
                        telemetry.record_error(category).await;
                        yield GenerationUpdate::failed(MSG_PROCESSING_FAILED);
                        return;
                    }
                }
            }

            // The backend closed the stream without a final delivery
            warn!("Generation ended without a final delivery");
            telemetry.record_error(ErrorCategory::ProcessingFailed).await;
            yield GenerationUpdate::failed(MSG_PROCESSING_FAILED);
        };

        Box::pin(updates)
    }

    /// Cancels the call in flight. The call is superseded, so its remaining
    /// deliveries are discarded, and its stream still reaches a terminal
    /// update carrying whatever text had accumulated.
    pub fn cancel(&self) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.active_seq.fetch_max(seq, Ordering::SeqCst);
        self.engine.cancel();
    }
}

async fn bring_up(
    engine: &InferenceEngine,
    prefs: &dyn PreferenceStore,
    telemetry: &TelemetryCollector,
    progress: Arc<ProgressFn>,
) -> Result<(), EngineError> {
    match engine.initialize(progress).await {
        Ok(()) => {
            if !prefs.get_bool(FIRST_LAUNCH_COMPLETE).await {
                prefs.set_bool(FIRST_LAUNCH_COMPLETE, true).await;
            }
            Ok(())
        }
        Err(err) => {
            telemetry.record_error(categorize(&err, true)).await;
            Err(err)
        }
    }
}

/// Maps an engine failure onto the telemetry error taxonomy. Out-of-memory
/// stays distinct wherever it happens; everything else is attributed to the
/// phase it occurred in.
fn categorize(err: &EngineError, during_init: bool) -> ErrorCategory {
    match err {
        EngineError::Backend(BackendError::OutOfMemory(_)) => ErrorCategory::OutOfMemory,
        _ if during_init => ErrorCategory::ModelInitializationFailed,
        _ => ErrorCategory::ProcessingFailed,
    }
}

/// Computes the numeric metrics of one completed generation and hands them
/// to the collector. Lengths are character counts of the raw input and the
/// final text; the strings themselves stay out of telemetry.
async fn record_session(
    telemetry: &TelemetryCollector,
    engine: &InferenceEngine,
    raw_input: &str,
    final_text: &str,
    pieces: u64,
    submitted_at: Instant,
    first_piece_at: Option<Instant>,
) {
    let ttft_ms =
        first_piece_at.map(|first| first.duration_since(submitted_at).as_millis() as f64);

    let elapsed_ms = submitted_at.elapsed().as_millis() as f64;
    let tokens_per_second = if pieces > 0 && elapsed_ms > 0.0 {
        Some(pieces as f64 / elapsed_ms * 1000.0)
    } else {
        None
    };

    let memory_mb = engine.memory_usage_bytes() as f64 / (1024.0 * 1024.0);
    telemetry
        .record_session(
            raw_input.chars().count(),
            final_text.chars().count(),
            ttft_ms,
            tokens_per_second,
            memory_mb,
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_is_distinct_in_both_phases() {
        let oom = EngineError::Backend(BackendError::OutOfMemory("kv cache".to_string()));
        assert_eq!(categorize(&oom, true), ErrorCategory::OutOfMemory);
        assert_eq!(categorize(&oom, false), ErrorCategory::OutOfMemory);
    }

    #[test]
    fn other_failures_follow_their_phase() {
        let failed = EngineError::Backend(BackendError::Failed("bad state".to_string()));
        assert_eq!(categorize(&failed, true), ErrorCategory::ModelInitializationFailed);
        assert_eq!(categorize(&failed, false), ErrorCategory::ProcessingFailed);

        let not_init = EngineError::NotInitialized;
        assert_eq!(categorize(&not_init, false), ErrorCategory::ProcessingFailed);
    }
}
