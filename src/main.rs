use std::error::Error;
use std::io::{Read, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use plainly::artifact::ModelArtifactProvisioner;
use plainly::config::Settings;
use plainly::engine::InferenceEngine;
use plainly::orchestrator::GenerationOrchestrator;
use plainly::prefs::{JsonPreferences, PreferenceStore};
use plainly::telemetry::TelemetryCollector;
use plainly::ProgressFn;

#[derive(Parser)]
#[command(name = "plainly", about = "On-device text simplification", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rewrite text in plain language, streaming the result to stdout
    Simplify {
        /// Text to simplify; read from stdin when omitted
        text: Option<String>,
        /// Print the telemetry report after the run
        #[arg(long)]
        report: bool,
    },
    /// Extract and validate the bundled model without generating
    Provision,
    /// Turn telemetry collection on or off
    Telemetry {
        /// Desired state
        state: Toggle,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

/// Main entry point for the plainly application
///
/// Parses command line arguments and handles three modes of operation:
/// - Simplify: provisions and loads the model, then streams a rewrite
/// - Provision: extracts and validates the bundled model artifact only
/// - Telemetry: flips the persisted telemetry opt-in flag
///
/// # Errors
/// Returns an error if configuration is invalid, provisioning fails or the
/// model cannot be loaded
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    // Load settings first
    let settings = Settings::new()?;
    let _guard = init_tracing(&settings);

    match cli.command {
        Command::Simplify { text, report } => simplify(&settings, text, report).await,
        Command::Provision => provision(&settings),
        Command::Telemetry { state } => toggle_telemetry(&settings, state).await,
    }
}

/// Sends logs to a daily rolling file when one is configured, otherwise to
/// stderr so stdout stays clean for generated text.
fn init_tracing(settings: &Settings) -> Option<WorkerGuard> {
    let filter = EnvFilter::new(&settings.logging.level);
    match settings.logging.file.as_deref() {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::RollingFileAppender::new(
                tracing_appender::rolling::Rotation::DAILY,
                log_dir,
                "plainly",
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                // Disable ANSI colors for cleaner log files
                .with_ansi(false)
                .with_line_number(true)
                .with_file(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_target(false)
                .with_env_filter(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_env_filter(filter)
                .init();
            None
        }
    }
}

async fn simplify(
    settings: &Settings,
    text: Option<String>,
    report: bool,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let input = match text {
        Some(text) => text,
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let input = input.trim().to_string();
    if input.is_empty() {
        return Err("No input text given".into());
    }

    let engine = Arc::new(InferenceEngine::new(settings)?);
    let prefs: Arc<dyn PreferenceStore> = Arc::new(JsonPreferences::open(&settings.model.data_dir));
    let telemetry = Arc::new(TelemetryCollector::new(Arc::clone(&prefs)));
    let orchestrator =
        GenerationOrchestrator::new(Arc::clone(&engine), prefs, Arc::clone(&telemetry));

    // Provisioning and loading share one visible progress bar
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40}] {percent}%")
            .unwrap(),
    );
    bar.set_prefix("Loading model");
    let bar_handle = bar.clone();
    let progress: Arc<ProgressFn> = Arc::new(move |fraction: f32| {
        bar_handle.set_position((fraction * 100.0) as u64);
    });
    orchestrator.initialize(progress).await?;
    bar.finish_and_clear();
    info!(backend = engine.backend_name(), "Model ready");

    let mut updates = orchestrator.submit(&input);
    let mut printed = 0usize;
    while let Some(update) = updates.next().await {
        if let Some(message) = update.error {
            return Err(message.into());
        }
        // Print only the newly appended tail of the accumulated text
        if update.text.len() > printed {
            print!("{}", &update.text[printed..]);
            std::io::stdout().flush()?;
            printed = update.text.len();
        }
        if update.is_terminal() {
            println!();
        }
    }

    if report {
        println!();
        print!("{}", telemetry.export_report());
    }
    Ok(())
}

fn provision(settings: &Settings) -> Result<(), Box<dyn Error + Send + Sync>> {
    let provisioner = ModelArtifactProvisioner::new(
        settings.model.bundled_path.clone(),
        &settings.model.data_dir,
    );

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40}] {percent}%")
            .unwrap(),
    );
    bar.set_prefix("Provisioning");
    let bar_handle = bar.clone();
    let progress = move |fraction: f32| {
        bar_handle.set_position((fraction * 100.0) as u64);
    };

    let path = provisioner.ensure(&progress)?;
    bar.finish_and_clear();

    let size = provisioner.artifact_size().unwrap_or(0);
    println!("Artifact ready at {} ({} bytes)", path.display(), size);
    Ok(())
}

async fn toggle_telemetry(
    settings: &Settings,
    state: Toggle,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let prefs: Arc<dyn PreferenceStore> = Arc::new(JsonPreferences::open(&settings.model.data_dir));
    let telemetry = TelemetryCollector::new(prefs);

    let enabled = matches!(state, Toggle::On);
    telemetry.set_enabled(enabled).await;
    println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}
