//! Optional on-disk staging of uploaded audio.
//!
//! Decoding normally happens in memory.  When a staging directory is
//! configured, each upload is written to a uniquely named file that is
//! removed when its [`StagedFile`] guard is dropped, on every exit path.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use whisp_common::{PipelineError, PipelineResult};

/// Directory holding request-scoped staging files.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create staging directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` to a fresh `sound_<millis>_<random>.wav` file.
    ///
    /// A write failure is reported as a decode failure since the upload
    /// never reached the decoder.
    pub fn stage(&self, bytes: &[u8]) -> PipelineResult<StagedFile> {
        let prefix = format!("sound_{}_", chrono::Utc::now().timestamp_millis());
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".wav")
            .tempfile_in(&self.dir)
            .map_err(|e| PipelineError::Decode(format!("cannot stage upload: {e}")))?;
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|e| PipelineError::Decode(format!("cannot stage upload: {e}")))?;
        debug!("Staged {} bytes at {}", bytes.len(), file.path().display());
        Ok(StagedFile { file })
    }
}

/// A staged upload.  The file is deleted when this guard drops.
#[derive(Debug)]
pub struct StagedFile {
    file: tempfile::NamedTempFile,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
