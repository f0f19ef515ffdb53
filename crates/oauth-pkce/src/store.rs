//! Correlation key store
//!
//! A namespaced key-value store holding flow records and the session record.
//! Every operation is synchronous. Suffixes within a namespace are listed in
//! the order they were first created, not in key order.
//!
//! Two backends share one in-memory representation:
//! - `MemoryKeyStore` lives as long as the process
//! - `FileKeyStore` persists every mutation to a JSON file using an atomic
//!   temp-file + rename, so pending flows survive a restart between the
//!   redirect out and the callback in

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Narrow read/write/delete contract over namespaced keys.
///
/// Implementations must make `take` atomic with respect to other calls on the
/// same store: two concurrent `take`s of one key return the value at most once.
pub trait KeyStore: Send + Sync {
    /// Insert or replace a value. Replacing keeps the original creation order.
    fn put(&self, namespace: &str, suffix: &str, value: &str) -> Result<()>;

    /// Read a value.
    fn get(&self, namespace: &str, suffix: &str) -> Result<Option<String>>;

    /// Delete a value. Deleting a missing key is not an error.
    fn delete(&self, namespace: &str, suffix: &str) -> Result<()>;

    /// Read and delete a value in one step.
    fn take(&self, namespace: &str, suffix: &str) -> Result<Option<String>>;

    /// All suffixes in a namespace, ascending by creation order.
    fn list_suffixes(&self, namespace: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    seq: u64,
    value: String,
}

/// Backend-independent table: namespace -> suffix -> entry.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Entries {
    next_seq: u64,
    namespaces: BTreeMap<String, BTreeMap<String, Entry>>,
}

impl Entries {
    fn put(&mut self, namespace: &str, suffix: &str, value: &str) {
        let slots = self.namespaces.entry(namespace.to_string()).or_default();
        match slots.get_mut(suffix) {
            Some(entry) => entry.value = value.to_string(),
            None => {
                slots.insert(
                    suffix.to_string(),
                    Entry {
                        seq: self.next_seq,
                        value: value.to_string(),
                    },
                );
                self.next_seq += 1;
            }
        }
    }

    fn get(&self, namespace: &str, suffix: &str) -> Option<String> {
        self.namespaces
            .get(namespace)
            .and_then(|slots| slots.get(suffix))
            .map(|entry| entry.value.clone())
    }

    fn remove(&mut self, namespace: &str, suffix: &str) -> Option<String> {
        let slots = self.namespaces.get_mut(namespace)?;
        let removed = slots.remove(suffix).map(|entry| entry.value);
        if slots.is_empty() {
            self.namespaces.remove(namespace);
        }
        removed
    }

    fn list(&self, namespace: &str) -> Vec<String> {
        let Some(slots) = self.namespaces.get(namespace) else {
            return Vec::new();
        };
        let mut ordered: Vec<(&String, u64)> =
            slots.iter().map(|(suffix, entry)| (suffix, entry.seq)).collect();
        ordered.sort_by_key(|(_, seq)| *seq);
        ordered.into_iter().map(|(suffix, _)| suffix.clone()).collect()
    }
}

fn lock(entries: &Mutex<Entries>) -> Result<MutexGuard<'_, Entries>> {
    entries
        .lock()
        .map_err(|_| Error::Storage("key store lock poisoned".into()))
}

/// Process-lifetime key store.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<Entries>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn put(&self, namespace: &str, suffix: &str, value: &str) -> Result<()> {
        lock(&self.entries)?.put(namespace, suffix, value);
        Ok(())
    }

    fn get(&self, namespace: &str, suffix: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries)?.get(namespace, suffix))
    }

    fn delete(&self, namespace: &str, suffix: &str) -> Result<()> {
        lock(&self.entries)?.remove(namespace, suffix);
        Ok(())
    }

    fn take(&self, namespace: &str, suffix: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries)?.remove(namespace, suffix))
    }

    fn list_suffixes(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(lock(&self.entries)?.list(namespace))
    }
}

/// File-backed key store.
///
/// The Mutex serializes all mutations. Each mutation is applied to a copy of
/// the table, the copy is written, and only then does it replace the
/// in-memory table, so a failed write changes neither.
pub struct FileKeyStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FileKeyStore {
    /// Open the store at `path`, creating an empty file if none exists.
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| Error::Storage(format!("reading key store file: {e}")))?;
            let entries: Entries = serde_json::from_str(&contents)
                .map_err(|e| Error::Storage(format!("parsing key store file: {e}")))?;
            info!(
                path = %path.display(),
                namespaces = entries.namespaces.len(),
                "loaded key store"
            );
            entries
        } else {
            info!(path = %path.display(), "key store file not found, starting empty");
            let entries = Entries::default();
            write_atomic(&path, &entries)?;
            entries
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileKeyStore {
    /// Apply `change` to a copy of the table and commit it once written.
    fn commit<R>(&self, change: impl FnOnce(&mut Entries) -> R) -> Result<R> {
        let mut entries = lock(&self.entries)?;
        let mut next = entries.clone();
        let result = change(&mut next);
        write_atomic(&self.path, &next)?;
        *entries = next;
        Ok(result)
    }

    fn contains(&self, namespace: &str, suffix: &str) -> Result<bool> {
        Ok(lock(&self.entries)?.get(namespace, suffix).is_some())
    }
}

impl KeyStore for FileKeyStore {
    fn put(&self, namespace: &str, suffix: &str, value: &str) -> Result<()> {
        self.commit(|entries| entries.put(namespace, suffix, value))?;
        debug!(namespace, suffix, "stored key");
        Ok(())
    }

    fn get(&self, namespace: &str, suffix: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries)?.get(namespace, suffix))
    }

    fn delete(&self, namespace: &str, suffix: &str) -> Result<()> {
        if self.contains(namespace, suffix)? {
            self.commit(|entries| entries.remove(namespace, suffix))?;
            debug!(namespace, suffix, "deleted key");
        }
        Ok(())
    }

    fn take(&self, namespace: &str, suffix: &str) -> Result<Option<String>> {
        if !self.contains(namespace, suffix)? {
            return Ok(None);
        }
        self.commit(|entries| entries.remove(namespace, suffix))
    }

    fn list_suffixes(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(lock(&self.entries)?.list(namespace))
    }
}

/// Write the table to `path` atomically with 0600 permissions (unix only),
/// since it holds PKCE verifiers and tokens.
fn write_atomic(path: &Path, entries: &Entries) -> Result<()> {
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| Error::Storage(format!("serializing key store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("key store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".keystore.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes())
        .map_err(|e| Error::Storage(format!("writing temp key store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&tmp_path, perms)
            .map_err(|e| Error::Storage(format!("setting key store file permissions: {e}")))?;
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Storage(format!("renaming temp key store file: {e}")))?;

    Ok(())
}
