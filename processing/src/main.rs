//! whisp-classify – classify WAV files from the command line and print
//! the ranked predictions as JSON, one object per file.
//!
//! Usage: `whisp-classify <config> <file.wav>...`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use whisp_common::config::{self, Config};
use whisp_processing::model;
use whisp_processing::staging::StagingArea;
use whisp_processing::Pipeline;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── load config ──────────────────────────────────────────────────
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;
    let files: Vec<PathBuf> = args.map(PathBuf::from).collect();
    if files.is_empty() {
        bail!("Usage: whisp-classify <config> <file.wav>...");
    }

    // ── load model ───────────────────────────────────────────────────
    // tract can panic on unsupported tensor types instead of erroring.
    let load_result = std::panic::catch_unwind(|| model::load_classifier(&config.model_dir));
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
    }
    info!(
        "Classifying {} file(s) with {}",
        files.len(),
        pipeline.classifier_name()
    );

    // ── classify ─────────────────────────────────────────────────────
    let mut failures = 0usize;
    for path in &files {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!("Cannot read {}: {e}", path.display());
                failures += 1;
                continue;
            }
        };
        match pipeline.classify(&bytes) {
            Ok(result) => {
                let json = serde_json::to_string(&result.into_response())?;
                println!("{json}");
            }
            Err(e) => {
                warn!("{}: {e}", path.display());
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} file(s) failed", files.len());
    }
    Ok(())
}
