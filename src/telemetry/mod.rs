use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::prefs::{PreferenceStore, TELEMETRY_ENABLED};

/// Maximum number of metrics retained; the oldest entry is evicted first.
pub const METRIC_CAPACITY: usize = 100;

/// The kinds of numeric session metrics the collector accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Character count of the submitted input
    InputLength,
    /// Character count of the simplified result
    OutputLength,
    /// Milliseconds from submission to the first streamed piece
    TimeToFirstTokenMs,
    /// Generated pieces per second over the whole stream
    TokensPerSecond,
    /// Backend memory usage observed at completion, in megabytes
    MemoryPeakMb,
    /// Coded failure category (see ErrorCategory)
    ErrorCode,
}

impl MetricKind {
    /// All kinds, in report order.
    pub const ALL: [MetricKind; 6] = [
        MetricKind::InputLength,
        MetricKind::OutputLength,
        MetricKind::TimeToFirstTokenMs,
        MetricKind::TokensPerSecond,
        MetricKind::MemoryPeakMb,
        MetricKind::ErrorCode,
    ];

    fn unit(&self) -> &'static str {
        match self {
            MetricKind::InputLength | MetricKind::OutputLength => " chars",
            MetricKind::TimeToFirstTokenMs => " ms",
            MetricKind::TokensPerSecond => " tokens/s",
            MetricKind::MemoryPeakMb => " MB",
            MetricKind::ErrorCode => "",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MetricKind::InputLength => "Input length",
            MetricKind::OutputLength => "Output length",
            MetricKind::TimeToFirstTokenMs => "Time to first token",
            MetricKind::TokensPerSecond => "Tokens per second",
            MetricKind::MemoryPeakMb => "Peak memory",
            MetricKind::ErrorCode => "Errors",
        };
        write!(f, "{}", name)
    }
}

/// Coded failure categories recorded to telemetry. Codes are stable so
/// exported reports stay comparable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Unknown,
    ModelInitializationFailed,
    OutOfMemory,
    TextTooLong,
    ProcessingFailed,
}

impl ErrorCategory {
    pub fn code(&self) -> u32 {
        match self {
            ErrorCategory::Unknown => 0,
            ErrorCategory::ModelInitializationFailed => 1001,
            ErrorCategory::OutOfMemory => 1002,
            ErrorCategory::TextTooLong => 1003,
            ErrorCategory::ProcessingFailed => 1004,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1001 => ErrorCategory::ModelInitializationFailed,
            1002 => ErrorCategory::OutOfMemory,
            1003 => ErrorCategory::TextTooLong,
            1004 => ErrorCategory::ProcessingFailed,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::ModelInitializationFailed => "model initialization failed",
            ErrorCategory::OutOfMemory => "out of memory",
            ErrorCategory::TextTooLong => "text too long",
            ErrorCategory::ProcessingFailed => "processing failed",
        };
        write!(f, "{}", name)
    }
}

/// One recorded observation. Values are always numeric; no user text is
/// representable here.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Bounded, privacy-preserving store of numeric session metrics.
///
/// Every recording first checks the user's opt-in flag in the preference
/// store; while the flag is off, recording is a no-op. Disabling telemetry
/// purges everything already stored. The store keeps at most
/// `METRIC_CAPACITY` entries, evicting the oldest.
pub struct TelemetryCollector {
    prefs: Arc<dyn PreferenceStore>,
    metrics: Mutex<VecDeque<Metric>>,
}

impl TelemetryCollector {
    pub fn new(prefs: Arc<dyn PreferenceStore>) -> Self {
        Self {
            prefs,
            metrics: Mutex::new(VecDeque::with_capacity(METRIC_CAPACITY)),
        }
    }

    /// Whether the user has opted in to telemetry.
    pub async fn is_enabled(&self) -> bool {
        self.prefs.get_bool(TELEMETRY_ENABLED).await
    }

    /// Flips the opt-in flag. Disabling purges all stored metrics.
    pub async fn set_enabled(&self, enabled: bool) {
        self.prefs.set_bool(TELEMETRY_ENABLED, enabled).await;
        if !enabled {
            self.clear();
        }
    }

    /// Records one numeric observation, if telemetry is enabled.
    pub async fn record(&self, kind: MetricKind, value: f64) {
        if !self.is_enabled().await {
            return;
        }
        let metric = Metric {
            kind,
            value,
            timestamp: Utc::now(),
        };
        let mut store = self.lock_store();
        if store.len() == METRIC_CAPACITY {
            store.pop_front();
        }
        store.push_back(metric);
    }

    /// Records a failure as its stable numeric code.
    pub async fn record_error(&self, category: ErrorCategory) {
        self.record(MetricKind::ErrorCode, category.code() as f64).await;
    }

    /// Records the metrics of one completed generation session as individual
    /// numeric observations. Lengths are character counts; the text itself
    /// never reaches the store. Timings are skipped when no piece arrived.
    pub async fn record_session(
        &self,
        input_chars: usize,
        output_chars: usize,
        time_to_first_token_ms: Option<f64>,
        tokens_per_second: Option<f64>,
        memory_mb: f64,
    ) {
        self.record(MetricKind::InputLength, input_chars as f64).await;
        self.record(MetricKind::OutputLength, output_chars as f64).await;
        if let Some(ms) = time_to_first_token_ms {
            self.record(MetricKind::TimeToFirstTokenMs, ms).await;
        }
        if let Some(tps) = tokens_per_second {
            self.record(MetricKind::TokensPerSecond, tps).await;
        }
        self.record(MetricKind::MemoryPeakMb, memory_mb).await;
    }

    /// Snapshot of everything currently stored, oldest first.
    pub fn stored_metrics(&self) -> Vec<Metric> {
        self.lock_store().iter().cloned().collect()
    }

    /// Drops all stored metrics.
    pub fn clear(&self) {
        self.lock_store().clear();
    }

    /// Renders the stored metrics grouped by kind, each with a qualitative
    /// rating and a per-kind average/min/max summary. The report contains
    /// numbers, timestamps and fixed labels only, never user text.
    pub fn export_report(&self) -> String {
        let store = self.lock_store();
        let mut report = String::from("Telemetry report\n");

        if store.is_empty() {
            report.push_str("No metrics recorded.\n");
            return report;
        }

        let _ = writeln!(report, "Generated: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(report, "Stored metrics: {}", store.len());

        for kind in MetricKind::ALL {
            let entries: Vec<&Metric> = store.iter().filter(|metric| metric.kind == kind).collect();
            if entries.is_empty() {
                continue;
            }

            let _ = writeln!(report, "\n{} ({} samples)", kind, entries.len());
            for metric in &entries {
                let stamp = metric.timestamp.format("%Y-%m-%d %H:%M:%S");
                match kind {
                    MetricKind::ErrorCode => {
                        let category = ErrorCategory::from_code(metric.value as u32);
                        let _ = writeln!(
                            report,
                            "  - {} code {} ({})",
                            stamp, metric.value as u32, category
                        );
                    }
                    _ => match rate(kind, metric.value) {
                        Some(rating) => {
                            let _ = writeln!(
                                report,
                                "  - {} {}{} ({})",
                                stamp,
                                format_value(metric.value),
                                kind.unit(),
                                rating
                            );
                        }
                        None => {
                            let _ = writeln!(
                                report,
                                "  - {} {}{}",
                                stamp,
                                format_value(metric.value),
                                kind.unit()
                            );
                        }
                    },
                }
            }

            let values: Vec<f64> = entries.iter().map(|metric| metric.value).collect();
            let sum: f64 = values.iter().sum();
            let avg = sum / values.len() as f64;
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let _ = writeln!(
                report,
                "  avg {}{unit}, min {}{unit}, max {}{unit}",
                format_value(avg),
                format_value(min),
                format_value(max),
                unit = kind.unit()
            );
        }

        report
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, VecDeque<Metric>> {
        // A poisoned store only means a panic happened mid-record; the data
        // is still a valid deque, so keep serving it.
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Qualitative rating from fixed thresholds; None for kinds without one.
fn rate(kind: MetricKind, value: f64) -> Option<&'static str> {
    match kind {
        MetricKind::TimeToFirstTokenMs => Some(if value < 2000.0 {
            "Fast"
        } else if value < 4000.0 {
            "Okay"
        } else {
            "Slow"
        }),
        MetricKind::TokensPerSecond => Some(if value > 50.0 {
            "Good"
        } else if value > 20.0 {
            "Acceptable"
        } else {
            "Slow"
        }),
        MetricKind::MemoryPeakMb => Some(if value < 100.0 {
            "Low"
        } else if value < 200.0 {
            "Normal"
        } else {
            "High"
        }),
        _ => None,
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.1}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::MemoryPreferences;

    async fn enabled_collector() -> TelemetryCollector {
        let collector = TelemetryCollector::new(Arc::new(MemoryPreferences::new()));
        collector.set_enabled(true).await;
        collector
    }

    #[tokio::test]
    async fn disabled_by_default_records_nothing() {
        let collector = TelemetryCollector::new(Arc::new(MemoryPreferences::new()));
        collector.record(MetricKind::InputLength, 42.0).await;
        assert!(collector.stored_metrics().is_empty());
    }

    #[tokio::test]
    async fn records_when_enabled() {
        let collector = enabled_collector().await;
        collector.record(MetricKind::InputLength, 42.0).await;
        collector.record(MetricKind::TokensPerSecond, 31.5).await;

        let stored = collector.stored_metrics();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].kind, MetricKind::InputLength);
        assert_eq!(stored[1].value, 31.5);
    }

    #[tokio::test]
    async fn capacity_evicts_the_oldest_entry() {
        let collector = enabled_collector().await;
        for i in 0..METRIC_CAPACITY {
            collector.record(MetricKind::InputLength, i as f64).await;
        }
        collector.record(MetricKind::InputLength, 999.0).await;

        let stored = collector.stored_metrics();
        assert_eq!(stored.len(), METRIC_CAPACITY);
        assert_eq!(stored[0].value, 1.0);
        assert_eq!(stored.last().unwrap().value, 999.0);
    }

    #[tokio::test]
    async fn session_recording_skips_absent_timings() {
        let collector = enabled_collector().await;
        collector.record_session(120, 80, None, None, 48.0).await;

        let kinds: Vec<MetricKind> = collector
            .stored_metrics()
            .iter()
            .map(|metric| metric.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                MetricKind::InputLength,
                MetricKind::OutputLength,
                MetricKind::MemoryPeakMb,
            ]
        );

        collector.clear();
        collector
            .record_session(120, 80, Some(900.0), Some(35.0), 48.0)
            .await;
        assert_eq!(collector.stored_metrics().len(), 5);
    }

    #[tokio::test]
    async fn disabling_purges_stored_metrics() {
        let collector = enabled_collector().await;
        for _ in 0..5 {
            collector.record(MetricKind::OutputLength, 7.0).await;
        }
        assert_eq!(collector.stored_metrics().len(), 5);

        collector.set_enabled(false).await;
        assert!(collector.stored_metrics().is_empty());

        collector.record(MetricKind::OutputLength, 7.0).await;
        assert!(collector.stored_metrics().is_empty());
    }

    #[tokio::test]
    async fn report_summarizes_and_rates() {
        let collector = enabled_collector().await;
        collector.record(MetricKind::TimeToFirstTokenMs, 1500.0).await;
        collector.record(MetricKind::TimeToFirstTokenMs, 3500.0).await;
        collector.record(MetricKind::MemoryPeakMb, 250.0).await;
        collector
            .record_error(ErrorCategory::ProcessingFailed)
            .await;

        let report = collector.export_report();
        assert!(report.contains("Stored metrics: 4"));
        assert!(report.contains("Time to first token (2 samples)"));
        assert!(report.contains("1500 ms (Fast)"));
        assert!(report.contains("3500 ms (Okay)"));
        assert!(report.contains("avg 2500 ms, min 1500 ms, max 3500 ms"));
        assert!(report.contains("250 MB (High)"));
        assert!(report.contains("code 1004 (processing failed)"));
    }

    #[tokio::test]
    async fn empty_report_says_so() {
        let collector = enabled_collector().await;
        assert!(collector.export_report().contains("No metrics recorded."));
    }

    #[test]
    fn ratings_follow_the_thresholds() {
        assert_eq!(rate(MetricKind::TimeToFirstTokenMs, 1999.0), Some("Fast"));
        assert_eq!(rate(MetricKind::TimeToFirstTokenMs, 2000.0), Some("Okay"));
        assert_eq!(rate(MetricKind::TimeToFirstTokenMs, 4000.0), Some("Slow"));
        assert_eq!(rate(MetricKind::TokensPerSecond, 50.1), Some("Good"));
        assert_eq!(rate(MetricKind::TokensPerSecond, 50.0), Some("Acceptable"));
        assert_eq!(rate(MetricKind::TokensPerSecond, 20.0), Some("Slow"));
        assert_eq!(rate(MetricKind::MemoryPeakMb, 99.0), Some("Low"));
        assert_eq!(rate(MetricKind::MemoryPeakMb, 100.0), Some("Normal"));
        assert_eq!(rate(MetricKind::MemoryPeakMb, 200.0), Some("High"));
        assert_eq!(rate(MetricKind::InputLength, 10.0), None);
    }

    #[test]
    fn error_codes_are_stable() {
        for category in [
            ErrorCategory::Unknown,
            ErrorCategory::ModelInitializationFailed,
            ErrorCategory::OutOfMemory,
            ErrorCategory::TextTooLong,
            ErrorCategory::ProcessingFailed,
        ] {
            assert_eq!(ErrorCategory::from_code(category.code()), category);
        }
        assert_eq!(ErrorCategory::from_code(42), ErrorCategory::Unknown);
    }
}
