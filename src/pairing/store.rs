//! Durable storage for the active pairing secret
//!
//! The file store keeps a single `pairing.json` holding the serialized
//! secret, written with owner-only permissions on unix.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{PairingSecret, StoreError};

pub trait PairingStore: Send + Sync {
    /// Load the persisted secret. `Ok(None)` when nothing has been saved.
    fn load(&self) -> Result<Option<PairingSecret>, StoreError>;

    fn save(&self, secret: &PairingSecret) -> Result<(), StoreError>;

    fn delete(&self) -> Result<(), StoreError>;
}

/// JSON file store.
pub struct FilePairingStore {
    path: PathBuf,
}

impl FilePairingStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Create a new file readable only by its owner from the first byte.
#[cfg(unix)]
fn owner_only_file(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn owner_only_file(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

impl PairingStore for FilePairingStore {
    fn load(&self) -> Result<Option<PairingSecret>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&self.path).map_err(|e| StoreError::IoError(e.to_string()))?;
        let secret = serde_json::from_slice(&data)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(secret))
    }

    fn save(&self, secret: &PairingSecret) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::IoError(e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(secret)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        // Temp file then rename: the real file is never partially written.
        let tmp_path = self.tmp_path();
        match std::fs::remove_file(&tmp_path) {
            Ok(()) => log::warn!("removed stale pairing temp file {:?}", tmp_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::IoError(e.to_string())),
        }

        let result = (|| -> std::io::Result<()> {
            use std::io::Write;
            let mut file = owner_only_file(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        })();

        match result {
            Ok(()) => std::fs::rename(&tmp_path, &self.path).map_err(|e| {
                let _ = std::fs::remove_file(&tmp_path);
                StoreError::IoError(e.to_string())
            }),
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(StoreError::IoError(e.to_string()))
            }
        }
    }

    fn delete(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::IoError(e.to_string())),
        }
    }
}

/// In-memory store, mainly for tests and the demo binary.
#[derive(Default)]
pub struct MemoryPairingStore {
    secret: Mutex<Option<PairingSecret>>,
    saves: AtomicUsize,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a previously saved secret.
    pub fn with_secret(secret: PairingSecret) -> Self {
        Self {
            secret: Mutex::new(Some(secret)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<PairingSecret> {
        self.secret.lock().ok().and_then(|s| s.clone())
    }
}

impl PairingStore for MemoryPairingStore {
    fn load(&self) -> Result<Option<PairingSecret>, StoreError> {
        let guard = self
            .secret
            .lock()
            .map_err(|e| StoreError::IoError(e.to_string()))?;
        Ok(guard.clone())
    }

    fn save(&self, secret: &PairingSecret) -> Result<(), StoreError> {
        let mut guard = self
            .secret
            .lock()
            .map_err(|e| StoreError::IoError(e.to_string()))?;
        *guard = Some(secret.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self) -> Result<(), StoreError> {
        let mut guard = self
            .secret
            .lock()
            .map_err(|e| StoreError::IoError(e.to_string()))?;
        *guard = None;
        Ok(())
    }
}
