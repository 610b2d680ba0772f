// src/trust/store.rs

//! The durable, watched mapping from remote name to [`Remote`].

use super::remote::Remote;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A callback invoked after every reload triggered by the filesystem
/// watcher. Per `spec.md` §4.1, it must not itself take the store's lock --
/// it runs after the lock has already been released.
pub type UpdateHook = Arc<dyn Fn(&HashMap<String, Remote>, &HashMap<String, Remote>) + Send + Sync>;

/// Loads every `*.yaml` file in `dir` into a name-keyed map.
///
/// Matches `internal/trust/remotes.go`'s `Load`: non-yaml entries and
/// subdirectories are skipped silently, but a YAML parse failure is fatal.
pub fn load(dir: &Path) -> Result<HashMap<String, Remote>> {
    let mut remotes = HashMap::new();

    if !dir.exists() {
        return Ok(remotes);
    }

    for entry in std::fs::read_dir(dir)
        .map_err(|e| Error::OperationalFatal(format!("unable to read trust directory {dir:?}: {e}")))?
    {
        let entry = entry
            .map_err(|e| Error::OperationalFatal(format!("unable to read entry in {dir:?}: {e}")))?;
        let path = entry.path();

        if path.is_dir() || path.extension().is_none_or(|ext| ext != "yaml") {
            continue;
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::OperationalFatal(format!("unable to read {path:?}: {e}")))?;
        let remote: Remote = serde_yaml::from_str(&content)
            .map_err(|e| Error::Serialization(format!("unable to parse {path:?}: {e}")))?;
        remotes.insert(remote.name.clone(), remote);
    }

    Ok(remotes)
}

fn remote_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.yaml"))
}

fn write_remote(dir: &Path, remote: &Remote) -> Result<()> {
    let content = serde_yaml::to_string(remote)?;
    let final_path = remote_path(dir, &remote.name);
    let tmp_path = dir.join(format!(".{}.yaml.tmp", remote.name));
    std::fs::write(&tmp_path, content)
        .map_err(|e| Error::OperationalFatal(format!("unable to write {tmp_path:?}: {e}")))?;
    std::fs::rename(&tmp_path, &final_path)
        .map_err(|e| Error::OperationalFatal(format!("unable to replace {final_path:?}: {e}")))?;
    Ok(())
}

/// A per-node, directory-backed set of [`Remote`]s, serialised by a
/// reader-writer lock as required by `spec.md` §4.1.
pub struct TrustStore {
    dir: PathBuf,
    remotes: RwLock<HashMap<String, Remote>>,
    on_update: RwLock<Option<UpdateHook>>,
}

impl TrustStore {
    /// Loads the initial set from `dir`. Does not start watching -- call
    /// [`crate::trust::watcher::watch`] separately once the store is wrapped
    /// in an `Arc`, since the watcher needs to hold a reference back to it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::OperationalFatal(format!("unable to create {dir:?}: {e}")))?;
        let remotes = load(&dir)?;

        Ok(Arc::new(Self {
            dir,
            remotes: RwLock::new(remotes),
            on_update: RwLock::new(None),
        }))
    }

    pub fn set_update_hook(&self, hook: UpdateHook) {
        *self.on_update.write() = Some(hook);
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A read-only, point-in-time copy of the current remote set.
    pub fn remotes(&self) -> HashMap<String, Remote> {
        self.remotes.read().clone()
    }

    pub fn remote_by_name(&self, name: &str) -> Option<Remote> {
        self.remotes.read().get(name).cloned()
    }

    pub fn remote_by_address(&self, address: &str) -> Option<Remote> {
        self.remotes
            .read()
            .values()
            .find(|r| r.has_address(address))
            .cloned()
    }

    pub fn remote_by_fingerprint(&self, fingerprint: &str) -> Option<Remote> {
        self.remotes
            .read()
            .values()
            .find(|r| r.fingerprint() == fingerprint)
            .cloned()
    }

    pub fn select_random(&self) -> Option<Remote> {
        let remotes = self.remotes.read();
        let values: Vec<&Remote> = remotes.values().collect();
        values.choose(&mut rand::thread_rng()).map(|r| (*r).clone())
    }

    /// Adds new remotes. Fails with [`Error::Conflict`] if any proposed
    /// remote's name or on-disk file already exists.
    pub fn add(&self, new_remotes: &[Remote]) -> Result<()> {
        let mut remotes = self.remotes.write();

        for remote in new_remotes {
            if remotes.contains_key(&remote.name) || remote_path(&self.dir, &remote.name).exists() {
                return Err(Error::Conflict(format!(
                    "a remote named {:?} already exists",
                    remote.name
                )));
            }
        }

        for remote in new_remotes {
            write_remote(&self.dir, remote)?;
            remotes.insert(remote.name.clone(), remote.clone());
        }

        Ok(())
    }

    /// Atomically rewrites the entire trust store to exactly `new_remotes`.
    ///
    /// In-memory this is atomic (one write-lock critical section); on disk
    /// each file is replaced individually, so a crash mid-replace can leave
    /// a partial set that will simply be reloaded on next start (`spec.md`
    /// §5).
    pub fn replace(&self, new_remotes: Vec<Remote>) -> Result<()> {
        let mut remotes = self.remotes.write();

        let new_names: std::collections::HashSet<&str> =
            new_remotes.iter().map(|r| r.name.as_str()).collect();

        for old_name in remotes.keys() {
            if !new_names.contains(old_name.as_str()) {
                let path = remote_path(&self.dir, old_name);
                if path.exists() {
                    std::fs::remove_file(&path).map_err(|e| {
                        Error::OperationalFatal(format!("unable to remove {path:?}: {e}"))
                    })?;
                }
            }
        }

        for remote in &new_remotes {
            write_remote(&self.dir, remote)?;
        }

        let new_map: HashMap<String, Remote> = new_remotes
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();

        *remotes = new_map;
        Ok(())
    }

    /// Removes a single remote's on-disk file and in-memory entry.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut remotes = self.remotes.write();
        let path = remote_path(&self.dir, name);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| Error::OperationalFatal(format!("unable to remove {path:?}: {e}")))?;
        }
        remotes.remove(name);
        Ok(())
    }

    /// Reloads from disk and invokes the update hook outside the lock.
    pub fn refresh(&self) -> Result<()> {
        let new_remotes = load(&self.dir)?;

        let old_remotes = {
            let mut remotes = self.remotes.write();
            std::mem::replace(&mut *remotes, new_remotes.clone())
        };

        if let Some(hook) = self.on_update.read().clone() {
            hook(&old_remotes, &new_remotes);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let remote = Remote::new("node-a", "10.0.0.1:7443", "---cert---");
        store.add(std::slice::from_ref(&remote)).unwrap();

        assert_eq!(store.remote_by_name("node-a"), Some(remote.clone()));

        let reloaded = load(dir.path()).unwrap();
        assert_eq!(reloaded.get("node-a"), Some(&remote));
    }

    #[test]
    fn add_rejects_duplicate_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let remote = Remote::new("node-a", "10.0.0.1:7443", "---cert---");
        store.add(std::slice::from_ref(&remote)).unwrap();

        let dup = Remote::new("node-a", "10.0.0.2:7443", "---cert2---");
        assert!(store.add(std::slice::from_ref(&dup)).is_err());
    }

    #[test]
    fn replace_removes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let a = Remote::new("a", "10.0.0.1:7443", "cert-a");
        let b = Remote::new("b", "10.0.0.2:7443", "cert-b");
        store.add(&[a.clone(), b.clone()]).unwrap();

        store.replace(vec![a.clone()]).unwrap();

        assert_eq!(store.remote_by_name("a"), Some(a));
        assert_eq!(store.remote_by_name("b"), None);
        assert!(!remote_path(dir.path(), "b").exists());
    }

    #[test]
    fn on_disk_set_matches_in_memory_after_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let a = Remote::new("a", "10.0.0.1:7443", "cert-a");
        store.add(std::slice::from_ref(&a)).unwrap();
        store.remove("a").unwrap();

        assert_eq!(store.remotes().len(), 0);
        assert_eq!(load(dir.path()).unwrap().len(), 0);
    }
}
