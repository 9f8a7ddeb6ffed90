use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::storage_traits::StorageResult;

/// One JSON array of records on disk, rewritten whole on every mutation.
///
/// Writes go to a temp file in the same directory and are renamed over the
/// target, so readers never observe a partial document. The in-process mutex
/// serializes read-modify-write cycles within one process only; there is no
/// cross-process lock, so a document must have a single writer.
pub(crate) struct JsonDocument<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _records: PhantomData<fn() -> T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
            _records: PhantomData,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of all records. A missing file is an empty document.
    pub(crate) async fn read(&self) -> StorageResult<Vec<T>> {
        let _guard = self.lock.lock().await;
        self.load()
    }

    /// Load, mutate and atomically replace the document.
    ///
    /// If `mutate` returns an error nothing is written.
    pub(crate) async fn update<R, F>(&self, mutate: F) -> StorageResult<R>
    where
        F: FnOnce(&mut Vec<T>) -> StorageResult<R>,
    {
        let _guard = self.lock.lock().await;
        let mut records = self.load()?;
        let out = mutate(&mut records)?;
        self.store(&records)?;
        Ok(out)
    }

    fn load(&self) -> StorageResult<Vec<T>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn store(&self, records: &[T]) -> StorageResult<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        // Atomic write: write to temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, records)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
