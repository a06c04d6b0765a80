use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore, PutMode, PutOptions, PutPayload};

use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Object storage for normalized image bytes.
///
/// Locations are relative, `/`-separated keys such as
/// `anime/female/anime_girl_3.jpg`. The local backend roots them under
/// `AppConfig::data_dir`.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
}

impl StorageManager {
    /// Create a new StorageManager with the specified configuration, creating
    /// the local data directory when needed.
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        Ok(Self {
            store: create_storage_backend(cfg).await?,
        })
    }

    /// Purely in-memory storage, used by tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }

    /// Store bytes at a new location. An existing object is never replaced: the
    /// write fails with `object_store::Error::AlreadyExists`.
    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        let payload = PutPayload::from_bytes(data);
        let options = PutOptions {
            mode: PutMode::Create,
            ..PutOptions::default()
        };
        self.store.put_opts(&path, payload, options).await.map(|_| ())
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl StorageManager {
    /// Retrieve bytes from the specified location.
    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        result.bytes().await
    }

    /// Check if an object exists at the specified location.
    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        self.store
            .head(&path)
            .await
            .map(|_| true)
            .or_else(|e| match e {
                object_store::Error::NotFound { .. } => Ok(false),
                _ => Err(e),
            })
    }
}

async fn create_storage_backend(cfg: &AppConfig) -> object_store::Result<DynStore> {
    match cfg.storage {
        StorageKind::Local => {
            let base = PathBuf::from(&cfg.data_dir);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await.map_err(|e| {
                    object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: e.into(),
                    }
                })?;
            }
            let base = tokio::fs::canonicalize(&base).await.map_err(|e| {
                object_store::Error::Generic {
                    store: "LocalFileSystem",
                    source: e.into(),
                }
            })?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(base)?))
        }
        StorageKind::Memory => Ok(Arc::new(InMemory::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn memory_backend_round_trips_bytes() {
        let storage = StorageManager::in_memory();
        let location = "anime/female/anime_girl_1.jpg";

        assert!(!storage.exists(location).await.expect("exists"));
        storage
            .put(location, Bytes::from_static(b"jpeg-bytes"))
            .await
            .expect("put");

        assert!(storage.exists(location).await.expect("exists"));
        let fetched = storage.get(location).await.expect("get");
        assert_eq!(fetched.as_ref(), b"jpeg-bytes");
    }

    #[tokio::test]
    async fn existing_objects_are_never_replaced() {
        let storage = StorageManager::in_memory();
        let location = "anime/female/anime_girl_1.jpg";
        storage
            .put(location, Bytes::from_static(b"first"))
            .await
            .expect("put");

        let second = storage.put(location, Bytes::from_static(b"second")).await;

        assert!(matches!(
            second,
            Err(object_store::Error::AlreadyExists { .. })
        ));
        let kept = storage.get(location).await.expect("get");
        assert_eq!(kept.as_ref(), b"first");
    }

    #[tokio::test]
    async fn local_backend_creates_nested_directories() {
        let base = std::env::temp_dir().join(format!("collector_store_{}", Uuid::new_v4()));
        let cfg = AppConfig {
            data_dir: base.to_string_lossy().into_owned(),
            storage: StorageKind::Local,
            ..Default::default()
        };

        let storage = StorageManager::new(&cfg).await.expect("storage");
        storage
            .put("cartoon/hero/cartoon_hero_1.jpg", Bytes::from_static(b"abc"))
            .await
            .expect("put");

        assert!(base.join("cartoon/hero/cartoon_hero_1.jpg").exists());

        tokio::fs::remove_dir_all(&base).await.ok();
    }
}
