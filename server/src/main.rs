//! Whisp Server – classifies uploaded sound clips over HTTP.
//!
//! This binary:
//! 1. Reads configuration from `whisp.conf`
//! 2. Loads the classifier once, before accepting any request
//! 3. Runs an axum HTTP server for classification and sample curation

mod curation;
mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::info;

use whisp_common::config::{self, Config};
use whisp_processing::model;
use whisp_processing::staging::StagingArea;
use whisp_processing::Pipeline;

use crate::curation::{Curator, FsObjectStore, SqliteCatalog};
use crate::server::{AppState, RouterOptions};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!("Whisp Server starting (listen={})", config.listen_addr);

    // ── load model ───────────────────────────────────────────────────
    // tract can panic on unsupported tensor types instead of erroring.
    let model_dir = config.model_dir.clone();
    let load_result = tokio::task::spawn_blocking(move || {
        std::panic::catch_unwind(|| model::load_classifier(&model_dir))
    })
    .await
    .context("Model loading task failed")?;
    let classifier = match load_result {
        Ok(Ok(c)) => c,
        Ok(Err(e)) => return Err(e.context("Cannot load classifier")),
        Err(_) => bail!(
            "Classifier in {} panicked during loading",
            config.model_dir.display()
        ),
    };

    let mut pipeline = Pipeline::new(Arc::new(classifier));
    if let Some(dir) = &config.staging_dir {
        pipeline = pipeline.with_staging(StagingArea::new(dir)?);
        info!("Staging uploads in {}", dir.display());
    }
    info!(
        "Model ready: {} ({} labels)",
        pipeline.classifier_name(),
        pipeline.labels().len()
    );

    // ── curation storage ─────────────────────────────────────────────
    let store = FsObjectStore::new(&config.samples_dir, config.samples_base_url.clone())?;
    let catalog = SqliteCatalog::open(&config.samples_db)?;
    info!(
        "Curated samples: {} (stored in {})",
        catalog.count()?,
        store.dir().display()
    );
    let curator = Curator::new(Arc::new(store), Arc::new(catalog));

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── start HTTP server ────────────────────────────────────────────
    let state = AppState {
        pipeline: Arc::new(pipeline),
        curator,
        start_time: Instant::now(),
        timeout: config.request_timeout(),
    };
    let options = RouterOptions {
        max_upload_bytes: config.max_upload_bytes,
        static_dir: config.static_dir.clone(),
    };
    server::run(state, options, &config.listen_addr, shutdown).await?;

    info!("Whisp Server stopped");
    Ok(())
}
