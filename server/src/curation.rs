//! Sample curation – user-corrected clips kept for retraining.
//!
//! A submission stores the raw clip in an [`ObjectStore`] and then records
//! the store URL together with the guessed and user-selected categories in
//! a [`SampleCatalog`].

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{info, warn};

/// Blob storage for submitted clips.
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under a fresh key and return its public URL.
    fn put(&self, bytes: &[u8]) -> Result<String>;

    /// Delete the object previously returned by [`ObjectStore::put`].
    fn remove(&self, url: &str) -> Result<()>;
}

/// Durable record of submitted samples.
pub trait SampleCatalog: Send + Sync {
    fn record(&self, sample: &SampleRecord) -> Result<()>;
}

/// One curated sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub url: String,
    pub guessed_category: String,
    pub select_category: String,
    pub select_category_fill_in: String,
    pub created_at: DateTime<Utc>,
}

/// Category fields of a submission form.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub guessed_category: String,
    pub select_category: String,
    pub select_category_fill_in: String,
}

// ── filesystem object store ──────────────────────────────────────────────

/// Writes clips as `sound_<unix secs>_<n>.wav` into a directory and
/// publishes them under `base_url`.
pub struct FsObjectStore {
    dir: PathBuf,
    base_url: String,
    counter: AtomicU64,
    /// Unix seconds used in new keys.
    clock: fn() -> i64,
}

impl FsObjectStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create samples directory {}", dir.display()))?;
        Ok(Self {
            dir,
            base_url: base_url.into(),
            counter: AtomicU64::new(0),
            clock: || Utc::now().timestamp(),
        })
    }

    /// Replace the key timestamp source.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, bytes: &[u8]) -> Result<String> {
        let secs = (self.clock)();
        // create_new skips keys left over from a previous run
        for _ in 0..64 {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let key = format!("sound_{secs}_{n}.wav");
            let path = self.dir.join(&key);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Cannot create {}", path.display()))
                }
            };
            file.write_all(bytes)
                .with_context(|| format!("Cannot write {}", path.display()))?;
            return Ok(format!("{}{key}", self.base_url));
        }
        bail!("No free sample key in {}", self.dir.display())
    }

    fn remove(&self, url: &str) -> Result<()> {
        let Some(key) = url.strip_prefix(self.base_url.as_str()) else {
            bail!("{url} is not under {}", self.base_url);
        };
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            bail!("Refusing to remove sample key {key:?}");
        }
        let path = self.dir.join(key);
        std::fs::remove_file(&path).with_context(|| format!("Cannot remove {}", path.display()))
    }
}

// ── SQLite catalog ───────────────────────────────────────────────────────

/// Catalog backed by a SQLite `samples` table.  A connection is opened per
/// insert so concurrent requests never share one.
pub struct SqliteCatalog {
    db_path: PathBuf,
}

impl SqliteCatalog {
    /// Open (creating if needed) the catalog database.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Cannot open database: {}", db_path.display()))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS samples (
                id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                url                     TEXT NOT NULL,
                guessed_category        TEXT NOT NULL,
                select_category         TEXT NOT NULL,
                select_category_fill_in TEXT NOT NULL,
                created_at              TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS samples_select_category ON samples (select_category);
        ",
        )
        .context("Failed to create samples table")?;
        info!("Sample catalog ready at {}", db_path.display());
        Ok(Self { db_path })
    }

    pub fn count(&self) -> Result<u64> {
        let conn = Connection::open(&self.db_path)?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Every recorded sample, oldest first.
    #[cfg(test)]
    pub fn all(&self) -> Result<Vec<SampleRecord>> {
        let conn = Connection::open(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT url, guessed_category, select_category, select_category_fill_in, created_at
             FROM samples ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut samples = Vec::new();
        for row in rows {
            let (url, guessed, selected, fill_in, created) = row?;
            let created_at = DateTime::parse_from_rfc3339(&created)
                .with_context(|| format!("Bad timestamp in catalog: {created}"))?
                .with_timezone(&Utc);
            samples.push(SampleRecord {
                url,
                guessed_category: guessed,
                select_category: selected,
                select_category_fill_in: fill_in,
                created_at,
            });
        }
        Ok(samples)
    }
}

impl SampleCatalog for SqliteCatalog {
    fn record(&self, sample: &SampleRecord) -> Result<()> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Cannot open database: {}", self.db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            "INSERT INTO samples (url, guessed_category, select_category, select_category_fill_in, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.url,
                sample.guessed_category,
                sample.select_category,
                sample.select_category_fill_in,
                sample.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert sample")?;
        Ok(())
    }
}

// ── curator ──────────────────────────────────────────────────────────────

/// Store-then-record workflow behind `POST /upload-category`.
#[derive(Clone)]
pub struct Curator {
    store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn SampleCatalog>,
}

impl Curator {
    pub fn new(store: Arc<dyn ObjectStore>, catalog: Arc<dyn SampleCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Store the clip, record it and return the stored record.
    pub fn submit(&self, bytes: &[u8], submission: Submission) -> Result<SampleRecord> {
        if bytes.is_empty() {
            bail!("Submitted sample is empty");
        }
        let url = self.store.put(bytes)?;
        let record = SampleRecord {
            url,
            guessed_category: submission.guessed_category,
            select_category: submission.select_category,
            select_category_fill_in: submission.select_category_fill_in,
            created_at: Utc::now(),
        };
        if let Err(e) = self.catalog.record(&record) {
            // roll back so the store only holds catalogued samples
            if let Err(rm) = self.store.remove(&record.url) {
                warn!("Orphaned sample {} left in store: {rm:#}", record.url);
            }
            return Err(e);
        }
        info!(
            "Curated sample {} (guessed={}, selected={})",
            record.url, record.guessed_category, record.select_category
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store_writes_unique_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path().join("samples"), "http://bucket/").unwrap();
        let a = store.put(b"one").unwrap();
        let b = store.put(b"two").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("http://bucket/sound_") && a.ends_with(".wav"), "got {a}");

        let key = a.trim_start_matches("http://bucket/");
        assert_eq!(std::fs::read(store.dir().join(key)).unwrap(), b"one");
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 2);
    }

    #[test]
    fn test_fs_store_skips_existing_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path(), "")
            .unwrap()
            .with_clock(|| 1_700_000_000);
        std::fs::write(tmp.path().join("sound_1700000000_0.wav"), b"old").unwrap();
        std::fs::write(tmp.path().join("sound_1700000000_1.wav"), b"old").unwrap();

        let url = store.put(b"new").unwrap();
        assert_eq!(url, "sound_1700000000_2.wav");
        assert_eq!(std::fs::read(tmp.path().join(&url)).unwrap(), b"new");
        assert_eq!(
            std::fs::read(tmp.path().join("sound_1700000000_0.wav")).unwrap(),
            b"old"
        );
    }

    #[test]
    fn test_fs_store_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path(), "http://bucket/").unwrap();
        let url = store.put(b"clip").unwrap();
        store.remove(&url).unwrap();
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        assert!(store.remove("http://elsewhere/sound_1_0.wav").is_err());
        assert!(store.remove("http://bucket/../samples.db").is_err());
    }

    struct RejectingCatalog;

    impl SampleCatalog for RejectingCatalog {
        fn record(&self, _: &SampleRecord) -> Result<()> {
            bail!("database is locked")
        }
    }

    #[test]
    fn test_failed_record_removes_stored_clip() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = tmp.path().join("blobs");
        let curator = Curator::new(
            Arc::new(FsObjectStore::new(&blobs, "s3://b/").unwrap()),
            Arc::new(RejectingCatalog),
        );
        let err = curator.submit(b"RIFF", Submission::default()).unwrap_err();
        assert!(format!("{err:#}").contains("locked"));
        assert_eq!(std::fs::read_dir(&blobs).unwrap().count(), 0);
    }

    #[test]
    fn test_sqlite_catalog_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = SqliteCatalog::open(tmp.path().join("db/samples.db")).unwrap();
        let record = SampleRecord {
            url: "file:///data/samples/sound_1_0.wav".into(),
            guessed_category: "dog".into(),
            select_category: "other".into(),
            select_category_fill_in: "fox".into(),
            created_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        catalog.record(&record).unwrap();
        assert_eq!(catalog.all().unwrap(), vec![record]);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("samples.db");
        let curator = Curator::new(
            Arc::new(FsObjectStore::new(tmp.path().join("blobs"), "s3://b/").unwrap()),
            Arc::new(SqliteCatalog::open(&path).unwrap()),
        );
        curator.submit(b"RIFF", Submission::default()).unwrap();
        curator.submit(b"RIFF", Submission::default()).unwrap();
        assert_eq!(SqliteCatalog::open(&path).unwrap().count().unwrap(), 2);
    }

    #[test]
    fn test_submit_rejects_empty_clip() {
        let tmp = tempfile::tempdir().unwrap();
        let curator = Curator::new(
            Arc::new(FsObjectStore::new(tmp.path().join("blobs"), "").unwrap()),
            Arc::new(SqliteCatalog::open(tmp.path().join("s.db")).unwrap()),
        );
        assert!(curator.submit(b"", Submission::default()).is_err());
        assert_eq!(std::fs::read_dir(tmp.path().join("blobs")).unwrap().count(), 0);
    }
}
