//! Persistence backends for the table image.
//!
//! Backends are opaque byte stores: they persist one encoded image of all
//! tables and hand it back on open. The store owns the format.

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const LOCK_FILE: &str = "LOCK";
const TABLES_FILE: &str = "store.cbor";
const TABLES_TEMP_FILE: &str = "store.cbor.tmp";

/// A persistence backend holding the encoded table image.
///
/// # Invariants
///
/// - `load` returns exactly the bytes of the last successful `save`
/// - a failed `save` leaves the previous image intact
pub trait StoreBackend: Send + Sync {
    /// Loads the last saved image, or `None` for a fresh store.
    fn load(&self) -> StoreResult<Option<Vec<u8>>>;

    /// Replaces the saved image.
    fn save(&self, image: &[u8]) -> StoreResult<()>;
}

/// In-memory backend for tests and ephemeral stores.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    image: RwLock<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with a pre-existing image.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_image(image: Vec<u8>) -> Self {
        Self {
            image: RwLock::new(Some(image)),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Returns a copy of the saved image.
    pub fn image(&self) -> Option<Vec<u8>> {
        self.image.read().clone()
    }

    /// Makes every subsequent save fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&self) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.image.read().clone())
    }

    fn save(&self, image: &[u8]) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected("injected write failure".into()));
        }
        *self.image.write() = Some(image.to_vec());
        Ok(())
    }
}

/// Single-directory file backend.
///
/// ```text
/// <dir>/
/// ├─ LOCK        # Advisory lock for single-writer
/// └─ store.cbor  # All tables
/// ```
///
/// The directory is held under an exclusive lock for the lifetime of the
/// backend. Saves write a temp file, fsync it, rename it over the table
/// file and fsync the directory, so a crash leaves either the old or the
/// new image.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    _lock_file: File,
}

impl FileBackend {
    /// Opens (creating if missing) a store directory.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Locked` if another process holds the directory.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        Ok(Self {
            path,
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the table file path.
    pub fn tables_path(&self) -> PathBuf {
        self.path.join(TABLES_FILE)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StoreResult<()> {
        let dir = File::open(&self.path)?;
        dir.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StoreResult<()> {
        // Directory fsync is not supported on this platform
        Ok(())
    }
}

impl StoreBackend for FileBackend {
    fn load(&self) -> StoreResult<Option<Vec<u8>>> {
        let tables_path = self.tables_path();
        if !tables_path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(tables_path)?))
    }

    fn save(&self, image: &[u8]) -> StoreResult<()> {
        let temp_path = self.path.join(TABLES_TEMP_FILE);

        let mut file = File::create(&temp_path)?;
        file.write_all(image)?;
        file.sync_all()?;

        fs::rename(&temp_path, self.tables_path())?;
        self.sync_directory()
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        let _ = self._lock_file.unlock();
    }
}
