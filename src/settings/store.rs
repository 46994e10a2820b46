//! Non-volatile key/blob stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::{SettingsError, SettingsResult};

/// Opaque key/blob store. Implementations must make `store` durable
/// before returning.
pub trait SettingsStore: Send + Sync {
    fn load(&self, key: &str) -> SettingsResult<Option<Vec<u8>>>;

    fn store(&self, key: &str, value: &[u8]) -> SettingsResult<()>;

    /// Returns whether a value was present.
    fn erase(&self, key: &str) -> SettingsResult<bool>;
}

/// In-memory store. Clones share contents, which lets a test "reboot" a
/// node by building a new instance on the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent stores fail, to exercise persistence error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self, key: &str) -> SettingsResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn store(&self, key: &str, value: &[u8]) -> SettingsResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SettingsError::Unavailable(format!("write of {key} refused")));
        }
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn erase(&self, key: &str) -> SettingsResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }
}

/// One file per key under a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> SettingsResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.bin"))
    }
}

impl SettingsStore for FileStore {
    fn load(&self, key: &str) -> SettingsResult<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &str, value: &[u8]) -> SettingsResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn erase(&self, key: &str) -> SettingsResult<bool> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
