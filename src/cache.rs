//! Single-slot persistence of the last confirmed hub address.
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Key under which the address is stored.
pub const DEFAULT_KEY: &str = "ip_scanner/saved_ip";

/// Persistence for the "last known good" hub address.
///
/// Implementations never surface errors: an unavailable store loads as `None`
/// and drops saves after logging them.
pub trait AddressCache: Send + Sync {
    fn load(&self) -> Option<String>;
    fn save(&self, address: &str);
}

/// Key/value JSON file holding the address under [`DEFAULT_KEY`].
///
/// Writes go to a sibling temp file and are renamed into place, so a crash
/// mid-write leaves the previous value intact.
#[derive(Debug)]
pub struct FileAddressCache {
    path: PathBuf,
    key: String,
    write_lock: Mutex<()>,
}

impl FileAddressCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_key(path, DEFAULT_KEY)
    }

    pub fn with_key(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_store(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read address cache: {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let store = serde_json::from_str(&content)
            .with_context(|| format!("malformed address cache: {}", self.path.display()))?;
        Ok(store)
    }

    fn write_store(&self, store: &BTreeMap<String, String>) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create cache dir: {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            serde_json::to_writer_pretty(&mut file, store)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn try_save(&self, address: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("address cache lock poisoned"))?;
        // Keep unrelated keys that other tools may have put in the same file.
        let mut store = self.read_store().unwrap_or_default();
        store.insert(self.key.clone(), address.to_string());
        self.write_store(&store)
    }
}

impl AddressCache for FileAddressCache {
    fn load(&self) -> Option<String> {
        match self.read_store() {
            Ok(store) => {
                let found = store.get(&self.key).filter(|v| !v.is_empty()).cloned();
                debug!(path = %self.path.display(), found = found.is_some(), "loaded address cache");
                found
            }
            Err(e) => {
                warn!("address cache unavailable, treating as empty: {e:#}");
                None
            }
        }
    }

    fn save(&self, address: &str) {
        match self.try_save(address) {
            Ok(()) => info!(address, path = %self.path.display(), "saved hub address"),
            Err(e) => warn!(address, "failed to persist hub address: {e:#}"),
        }
    }
}

/// Volatile cache, used when no cache file is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryAddressCache {
    slot: Mutex<Option<String>>,
}

impl MemoryAddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(address.into())),
        }
    }
}

impl AddressCache for MemoryAddressCache {
    fn load(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|s| s.clone())
    }

    fn save(&self, address: &str) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(address.to_string());
        }
    }
}
