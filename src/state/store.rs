use super::reconcile::{reconcile, FilesystemScan, ReconcileReport};
use super::types::{AppRecord, ProcessHandle, Registry};
use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Durable application registry backed by one JSON file.
///
/// Every write replaces the file atomically (temp file + rename). Writers in
/// this process are serialized by an async mutex held across the whole
/// read-modify-write; an advisory file lock warns about a second engine
/// process working on the same root.
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    writer: tokio::sync::Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry. A missing file is an empty registry; an
    /// unreadable one is moved aside and replaced by an empty registry.
    pub async fn load(&self) -> Result<Registry> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Registry::default()),
            Err(e) => {
                return Err(Error::Filesystem(format!(
                    "Failed to read registry '{}': {}",
                    self.path.display(),
                    e
                )))
            }
        };
        if content.trim().is_empty() {
            return Ok(Registry::default());
        }
        match serde_json::from_str::<Registry>(&content) {
            Ok(registry) => Ok(registry),
            Err(e) => {
                let aside = self.path.with_extension("json.corrupt");
                warn!(
                    "Registry '{}' is unreadable ({}); moving it to '{}' and starting empty",
                    self.path.display(),
                    e,
                    aside.display()
                );
                tokio::fs::rename(&self.path, &aside).await?;
                Ok(Registry::default())
            }
        }
    }

    /// Replace the persisted registry.
    pub async fn save(&self, registry: &Registry) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.write(registry).await
    }

    async fn write(&self, registry: &Registry) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(registry)?;
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &lock_path, &bytes))
            .await
            .map_err(|e| Error::Filesystem(format!("Registry writer task failed: {}", e)))?
    }

    /// Load, modify and save under the writer lock. Nothing is written if
    /// `f` fails.
    pub async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Registry) -> Result<T>,
    {
        let _writer = self.writer.lock().await;
        let mut registry = self.load().await?;
        let value = f(&mut registry)?;
        self.write(&registry).await?;
        Ok(value)
    }

    /// [`update`](Self::update) for one existing record.
    pub async fn update_app<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut AppRecord) -> Result<T>,
    {
        self.update(|registry| {
            let record = registry
                .get_mut(name)
                .ok_or_else(|| Error::AppNotFound(name.to_string()))?;
            f(record)
        })
        .await
    }

    pub async fn get(&self, name: &str) -> Result<Option<AppRecord>> {
        Ok(self.load().await?.apps.remove(name))
    }

    pub async fn list(&self) -> Result<Vec<AppRecord>> {
        Ok(self.load().await?.apps.into_values().collect())
    }

    /// Bring the registry in line with the filesystem and process table.
    pub async fn reconcile<F>(&self, scan: &FilesystemScan, is_alive: F) -> Result<ReconcileReport>
    where
        F: Fn(&ProcessHandle) -> bool,
    {
        self.update(|registry| Ok(reconcile(registry, scan, is_alive)))
            .await
    }
}

fn write_atomic(path: &Path, lock_path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let lock = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| Error::Filesystem(format!("Failed to open lock file: {}", e)))?;
    let locked = match FileExt::try_lock_exclusive(&lock) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "Registry lock '{}' is held by another process ({}); writing anyway",
                lock_path.display(),
                e
            );
            false
        }
    };

    let tmp = path.with_extension("json.tmp");
    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if locked {
        let _ = FileExt::unlock(&lock);
    }
    result.map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::Filesystem(format!("Failed to write registry '{}': {}", path.display(), e))
    })?;
    debug!(path = %path.display(), bytes = bytes.len(), "Registry saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::{InstallState, RunState};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("registry.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("registry.json"));
        let mut registry = Registry::default();
        registry.insert(AppRecord::new("comfyui", dir.path().join("apps/comfyui")));
        store.save(&registry).await.unwrap();

        assert_eq!(store.load().await.unwrap(), registry);
        assert!(!dir.path().join("registry.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = StateStore::new(&path);
        assert!(store.load().await.unwrap().is_empty());
        assert!(dir.path().join("registry.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_failed_update_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("registry.json"));
        let result: Result<()> = store
            .update(|registry| {
                registry.insert(AppRecord::new("a", dir.path().join("a")));
                Err(Error::Config("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("registry.json")));
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let root = dir.path().to_path_buf();
            tasks.push(tokio::spawn(async move {
                store
                    .update(|registry| {
                        let name = format!("app-{}", i);
                        let mut record = AppRecord::new(&name, root.join(&name));
                        record.install_state = InstallState::Installed;
                        registry.insert(record);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.load().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_update_app_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("registry.json"));
        let err = store
            .update_app("ghost", |record| {
                record.run_state = RunState::Running;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AppNotFound(_)));
    }
}
