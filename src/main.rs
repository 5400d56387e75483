use std::path::Path;
use std::sync::Arc;

use linkflow::config::AppConfig;
use linkflow::pipeline::source::Source;
use linkflow::pipeline::stages::StageKind;
use linkflow::progress::TracingObserver;
use linkflow::sources::DataSource;
use linkflow::workflow::{RunReport, Workflow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_tracing(config.log_dir.as_deref());

    let source = DataSource::open(config.source.kind, &config.source.source)?;
    let workflow = Workflow::from_config(&config, Arc::new(TracingObserver::default()))?;

    eprintln!("🔗 Linkflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Source: {}", source.name());
    eprintln!("   Stages: {}", workflow.stage_names().join(" → "));
    if config.pipeline.stages.contains(&StageKind::Enrich) {
        eprintln!("   Model: {}", config.classifier.model);
    }
    let sinks = workflow.sink_names();
    if sinks.is_empty() {
        eprintln!("   Sinks: none");
    } else {
        eprintln!("   Sinks: {}", sinks.join(", "));
    }
    if let Some(dir) = &config.log_dir {
        eprintln!("   Logs: {}", dir.display());
    }
    eprintln!();

    let report = workflow.run(&source).await?;
    print_report(&report);
    Ok(())
}

/// Stderr logging, plus daily-rolling files under `log_dir` when set.
/// The returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "linkflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn print_report(report: &RunReport) {
    let stats = &report.stats;
    let retry = &report.retry;

    eprintln!("\n✅ Run {} complete", report.run_id);
    eprintln!(
        "   Items: {} produced, {} links kept, {} duplicates, {} filtered, {} errors",
        stats.items_produced, stats.items_consumed, stats.duplicates_filtered, stats.filtered, stats.errors
    );
    if retry.queued > 0 {
        eprintln!(
            "   Retry: {} queued, {} resolved, {} exhausted, {} failed, {} skipped ({} cycles)",
            retry.queued, retry.resolved, retry.exhausted, retry.failed, retry.skipped, retry.cycles
        );
    }
    if !report.failed_enrichments.is_empty() {
        eprintln!("   Enrichment failed for {} link(s)", report.failed_enrichments.len());
    }
    for outcome in &report.exports {
        match &outcome.error {
            None => eprintln!("   Export {} ({:?}): {} rows", outcome.sink, outcome.phase, outcome.rows),
            Some(e) => eprintln!("   Export {} ({:?}) failed: {}", outcome.sink, outcome.phase, e),
        }
    }
}
