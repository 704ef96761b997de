//! Librarian Scanner - background library scanning daemon
//!
//! Recovers scans interrupted by a previous run, schedules auto-scans and
//! runs queued scans until interrupted with Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use librarian_scanner::cli::CliOptions;
use librarian_scanner::config::{Config, LogFormat};
use librarian_scanner::db::Database;
use librarian_scanner::jobs;
use librarian_scanner::services::LocalFileSystem;
use librarian_scanner::ScanRuntime;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let options = CliOptions::from_args()?;

    init_tracing(&config);
    tracing::info!("Starting Librarian Scanner");

    let db = Database::connect_with_retry(
        &config.database_url,
        config.database_max_connections,
        Duration::from_secs(5),
    )
    .await;
    db.migrate().await?;
    tracing::info!(database = %config.database_url, "Database connected");

    let runtime = Arc::new(ScanRuntime::new(
        db.clone(),
        Arc::new(LocalFileSystem::new()),
        &config.scan,
    ));

    let report = runtime.recover_interrupted_scans().await?;
    tracing::info!(
        failed = report.failed,
        requeued = report.requeued,
        "Startup recovery complete"
    );

    for library_id in &options.scan_libraries {
        let library = db
            .libraries()
            .get_by_id(*library_id)
            .await?
            .with_context(|| format!("Library {} not found", library_id))?;
        let scan = runtime
            .enqueue_library_scan(library.id, library.user_id, false)
            .await?;
        tracing::info!(scan_id = %scan.id, library = %library.name, "Startup scan queued");
    }

    let mut scheduler = if options.no_scheduler {
        None
    } else {
        Some(jobs::start_scheduler(runtime.clone(), &config.scan.auto_scan_cron).await?)
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.shutdown().await?;
    }
    Ok(())
}
