//! Configuration parsing – reads a `KEY=VALUE` file (`whisp.conf`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

/// Service configuration, shared by the HTTP server and the batch CLI.
///
/// Both binaries load the same file; each ignores fields it does not need.
#[derive(Debug, Clone)]
pub struct Config {
    // ── network ──────────────────────────────────────────────────────
    /// Address the HTTP server listens on.
    pub listen_addr: String,
    /// Optional directory served under `/static`.
    pub static_dir: Option<PathBuf>,

    // ── model ────────────────────────────────────────────────────────
    /// Directory containing the classifier's `manifest.toml`.
    pub model_dir: PathBuf,

    // ── pipeline ─────────────────────────────────────────────────────
    /// When set, uploads are staged through uniquely named files in this
    /// directory instead of being decoded in memory.
    pub staging_dir: Option<PathBuf>,
    /// Per-request pipeline timeout in seconds; 0 disables it.
    pub request_timeout_secs: u64,
    /// Maximum accepted request body size.
    pub max_upload_bytes: usize,

    // ── curation ─────────────────────────────────────────────────────
    pub samples_dir: PathBuf,
    pub samples_base_url: String,
    pub samples_db: PathBuf,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/whisp/whisp.conf"
    }

    /// The request timeout, or `None` when disabled.
    pub fn request_timeout(&self) -> Option<std::time::Duration> {
        (self.request_timeout_secs > 0)
            .then(|| std::time::Duration::from_secs(self.request_timeout_secs))
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());
    Ok(from_map(&map))
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|s| !s.is_empty()) };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };

    Config {
        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8008".into()),
        static_dir: get("STATIC_DIR").map(PathBuf::from),

        model_dir: PathBuf::from(get("MODEL_DIR").unwrap_or_else(|| "/models/esc50".into())),

        staging_dir: get("STAGING_DIR").map(PathBuf::from),
        request_timeout_secs: get_u64("REQUEST_TIMEOUT_SECS", 30),
        max_upload_bytes: get_u64("MAX_UPLOAD_BYTES", 10 * 1024 * 1024) as usize,

        samples_dir: PathBuf::from(get("SAMPLES_DIR").unwrap_or_else(|| "/data/samples".into())),
        samples_base_url: get("SAMPLES_BASE_URL")
            .unwrap_or_else(|| "file:///data/samples/".into()),
        samples_db: PathBuf::from(get("SAMPLES_DB").unwrap_or_else(|| "/data/samples.db".into())),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
