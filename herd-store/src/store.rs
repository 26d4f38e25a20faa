/// Durable record store organized into named collections.
///
/// Each collection is a set of JSON records keyed by a declared primary
/// field and persisted as a single snapshot file under the store
/// directory. Writes rewrite the snapshot atomically (temp file, fsync,
/// rename), so a crash mid-write leaves the previous snapshot intact.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::{Error, Result};

/// A stored record: a JSON object carrying the collection's key field.
pub type Record = serde_json::Map<String, Value>;

const SNAPSHOT_EXT: &str = "json";
const DEFAULT_KEY_FIELD: &str = "id";

/// Declares a collection and the record field that keys it.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub name: String,
    pub key_field: String,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: key_field.into(),
        }
    }

    /// A collection keyed by the conventional `id` field.
    pub fn keyed_by_id(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_KEY_FIELD)
    }
}

/// Handle to an open store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

struct StoreInner {
    dir: PathBuf,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

struct Collection {
    key_field: String,
    path: PathBuf,
    records: RwLock<BTreeMap<String, Record>>,
    /// Serializes snapshot rewrites so two writers to the same collection
    /// never interleave on disk.
    write_gate: Mutex<()>,
}

impl Store {
    /// Open (creating if necessary) a store rooted at `dir`.
    ///
    /// Collections not listed in a spec are created lazily on first use,
    /// keyed by `id`. Existing snapshot files are loaded eagerly; an
    /// unreadable directory surfaces `StorageUnavailable` and a snapshot
    /// that fails to parse surfaces `Corruption`. Callers should treat
    /// either as fatal to offline capability, not to the application.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(dir, &[]).await
    }

    /// Open a store with explicitly declared collections.
    pub async fn open_with(dir: impl AsRef<Path>, specs: &[CollectionSpec]) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::StorageUnavailable(format!(
                "cannot create store directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut to_load: Vec<CollectionSpec> = specs.to_vec();

        // Pick up snapshots persisted by earlier runs that were not
        // declared this time around.
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            Error::StorageUnavailable(format!("cannot read store directory: {}", e))
        })?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            Error::StorageUnavailable(format!("cannot read store directory: {}", e))
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !to_load.iter().any(|s| s.name == name) {
                to_load.push(CollectionSpec::keyed_by_id(name));
            }
        }

        let mut collections = HashMap::new();
        for spec in &to_load {
            validate_name(&spec.name)?;
            let collection = Collection::load(&dir, spec).await?;
            collections.insert(spec.name.clone(), Arc::new(collection));
        }

        tracing::debug!(
            dir = %dir.display(),
            collections = collections.len(),
            "store opened"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                dir,
                collections: RwLock::new(collections),
            }),
        })
    }

    /// Returns every record in a collection, in unspecified order.
    pub async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        let coll = self.inner.collection(collection)?;
        let records = coll.records.read();
        Ok(records.values().cloned().collect())
    }

    /// Point lookup; `None` (not an error) when absent.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let coll = self.inner.collection(collection)?;
        let records = coll.records.read();
        Ok(records.get(id).cloned())
    }

    /// Insert-or-replace by the collection's key field. Idempotent.
    /// Returns the record's key.
    pub async fn put(&self, collection: &str, record: Record) -> Result<String> {
        let coll = self.inner.collection(collection)?;
        let key = coll.key_of(&record)?;

        let _gate = coll.write_gate.lock().await;
        coll.records.write().insert(key.clone(), record);
        coll.persist().await?;
        Ok(key)
    }

    /// Removes a record if present; absent ids are a no-op.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let coll = self.inner.collection(collection)?;

        let _gate = coll.write_gate.lock().await;
        let removed = coll.records.write().remove(id).is_some();
        if removed {
            coll.persist().await?;
        }
        Ok(())
    }

    /// Removes all records in a collection.
    pub async fn clear(&self, collection: &str) -> Result<()> {
        let coll = self.inner.collection(collection)?;

        let _gate = coll.write_gate.lock().await;
        coll.records.write().clear();
        coll.persist().await?;
        Ok(())
    }

    /// Count of records currently in a collection.
    pub async fn len(&self, collection: &str) -> Result<usize> {
        let coll = self.inner.collection(collection)?;
        let records = coll.records.read();
        Ok(records.len())
    }

    /// The directory this store persists under.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }
}

impl StoreInner {
    /// Fetch a collection handle, creating the collection lazily with the
    /// default key field when it was never declared.
    fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        if let Some(coll) = self.collections.read().get(name) {
            return Ok(coll.clone());
        }

        validate_name(name)?;
        let mut collections = self.collections.write();
        // Another caller may have raced us here.
        if let Some(coll) = collections.get(name) {
            return Ok(coll.clone());
        }

        let coll = Arc::new(Collection::empty(
            &self.dir,
            &CollectionSpec::keyed_by_id(name),
        ));
        collections.insert(name.to_string(), coll.clone());
        Ok(coll)
    }
}

impl Collection {
    fn empty(dir: &Path, spec: &CollectionSpec) -> Self {
        Self {
            key_field: spec.key_field.clone(),
            path: dir.join(format!("{}.{}", spec.name, SNAPSHOT_EXT)),
            records: RwLock::new(BTreeMap::new()),
            write_gate: Mutex::new(()),
        }
    }

    async fn load(dir: &Path, spec: &CollectionSpec) -> Result<Self> {
        let coll = Self::empty(dir, spec);

        match tokio::fs::read(&coll.path).await {
            Ok(bytes) => {
                let loaded: BTreeMap<String, Record> =
                    serde_json::from_slice(&bytes).map_err(|e| {
                        Error::Corruption(format!(
                            "snapshot {} failed to parse: {}",
                            coll.path.display(),
                            e
                        ))
                    })?;
                *coll.records.write() = loaded;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::StorageUnavailable(format!(
                    "cannot read snapshot {}: {}",
                    coll.path.display(),
                    e
                )));
            }
        }

        Ok(coll)
    }

    /// Extract the key value from a record.
    fn key_of(&self, record: &Record) -> Result<String> {
        match record.get(&self.key_field) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(_) => Err(Error::InvalidArgument(format!(
                "key field `{}` must be a non-empty string",
                self.key_field
            ))),
            None => Err(Error::InvalidArgument(format!(
                "record is missing key field `{}`",
                self.key_field
            ))),
        }
    }

    /// Rewrite the snapshot atomically. Callers hold `write_gate`.
    async fn persist(&self) -> Result<()> {
        let snapshot = {
            let records = self.records.read();
            serde_json::to_vec_pretty(&*records)
                .map_err(|e| Error::Corruption(format!("snapshot serialization failed: {}", e)))?
        };

        let tmp = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&snapshot).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "invalid collection name: {:?}",
            name
        )))
    }
}
