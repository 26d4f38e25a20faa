/// Entity cache
///
/// Last-known-good copies of remote records (sessions, sales, buyers)
/// held in a store collection so the application can read while offline.
/// The sync engine never consults this; it is a client-facing
/// convenience refreshed from successful fetches.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;

use herd_store::{Record, Store};

use crate::error::Result;

pub struct EntityCache<T> {
    store: Store,
    collection: String,
    _entity: PhantomData<fn() -> T>,
}

impl<T> EntityCache<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Store, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            _entity: PhantomData,
        }
    }

    /// Replace the cached set wholesale, e.g. after a successful full
    /// fetch from the backend.
    pub async fn replace_all(&self, entities: &[T]) -> Result<()> {
        self.store.clear(&self.collection).await?;
        for entity in entities {
            self.store.put(&self.collection, to_record(entity)?).await?;
        }
        tracing::debug!(
            collection = %self.collection,
            count = entities.len(),
            "entity cache refreshed"
        );
        Ok(())
    }

    /// Insert or update a single cached entity.
    pub async fn upsert(&self, entity: &T) -> Result<String> {
        let key = self.store.put(&self.collection, to_record(entity)?).await?;
        Ok(key)
    }

    /// All cached entities, in unspecified order.
    pub async fn list(&self) -> Result<Vec<T>> {
        let records = self.store.get_all(&self.collection).await?;
        records.into_iter().map(from_record).collect()
    }

    pub async fn get(&self, id: &str) -> Result<Option<T>> {
        match self.store.get(&self.collection, id).await? {
            Some(record) => Ok(Some(from_record(record)?)),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store.delete(&self.collection, id).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear(&self.collection).await?;
        Ok(())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.len(&self.collection).await?)
    }
}

fn to_record<T: Serialize>(entity: &T) -> Result<Record> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) | Err(_) => Err(herd_store::Error::InvalidArgument(
            "cached entities must serialize to objects".to_string(),
        )
        .into()),
    }
}

fn from_record<T: DeserializeOwned>(record: Record) -> Result<T> {
    serde_json::from_value(Value::Object(record)).map_err(|e| {
        herd_store::Error::Corruption(format!("cached entity failed to parse: {}", e)).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Session {
        id: String,
        milk: f64,
    }

    fn session(id: &str, milk: f64) -> Session {
        Session {
            id: id.to_string(),
            milk,
        }
    }

    #[tokio::test]
    async fn test_replace_all_and_list() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let cache: EntityCache<Session> = EntityCache::new(store, "sessions");

        cache
            .replace_all(&[session("s1", 4.5), session("s2", 6.0)])
            .await
            .unwrap();
        assert_eq!(cache.len().await.unwrap(), 2);

        // A later refresh replaces, not merges.
        cache.replace_all(&[session("s3", 5.0)]).await.unwrap();
        let all = cache.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "s3");
    }

    #[tokio::test]
    async fn test_upsert_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let cache: EntityCache<Session> = EntityCache::new(store, "sessions");

        cache.upsert(&session("s1", 4.5)).await.unwrap();
        cache.upsert(&session("s1", 5.5)).await.unwrap();

        let got = cache.get("s1").await.unwrap().unwrap();
        assert_eq!(got.milk, 5.5);

        cache.remove("s1").await.unwrap();
        assert!(cache.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_survives_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let store = Store::open(dir.path()).await.unwrap();
            let cache: EntityCache<Session> = EntityCache::new(store, "sales");
            cache.upsert(&session("sale-1", 2.0)).await.unwrap();
        }

        let store = Store::open(dir.path()).await.unwrap();
        let cache: EntityCache<Session> = EntityCache::new(store, "sales");
        assert_eq!(cache.list().await.unwrap(), vec![session("sale-1", 2.0)]);
    }
}
