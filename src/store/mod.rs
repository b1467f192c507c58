//! Access to the cluster object store
//!
//! Every component talks to the API server through [`ObjectStore`], which
//! keeps the reconciliation logic independent of `kube::Api` and lets tests
//! run against an in-memory store.

mod kube_store;
#[cfg(test)]
pub mod memory;

pub use kube_store::KubeStore;

use crate::error::Result;
use async_trait::async_trait;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

/// Label selector in `key=value` form
pub type Labels = BTreeMap<String, String>;

/// Bound shared by every object kind handled through the store
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Object store with optimistic concurrency.
///
/// `namespace` is `None` for cluster-scoped kinds and, in `list`, for a
/// cross-namespace listing. Not-found on `get` is `Ok(None)`; conflicts surface
/// as API errors with code 409 (see [`crate::OperatorError::is_conflict`]).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    async fn list<K: StoreObject>(&self, namespace: Option<&str>, selector: &Labels)
        -> Result<Vec<K>>;

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Full update, rejected if the object's `resourceVersion` is stale.
    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// JSON merge patch of the main resource.
    async fn patch<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K>;

    /// JSON merge patch of the status subresource.
    async fn patch_status<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K>;

    /// Deletes the object; returns `false` if it was already absent.
    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<bool>;
}

/// What [`create_or_update`] did to the stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
        }
    }
}

/// Creates or updates the object identified by `seed`.
///
/// The current object (or `seed` when absent) is passed to `mutate` together
/// with `is_new`, which is true when the object has no creation timestamp yet.
/// Fields that must only be set at creation belong behind `is_new`; the rest
/// is re-applied every pass. The store is written only when something changed.
pub async fn create_or_update<S, K, F>(store: &S, seed: K, mutate: F) -> Result<(K, Outcome)>
where
    S: ObjectStore,
    K: StoreObject,
    F: FnOnce(&mut K, bool) -> Result<()> + Send,
{
    let name = seed.meta().name.clone().unwrap_or_default();
    let namespace = seed.meta().namespace.clone();

    let current = store.get::<K>(namespace.as_deref(), &name).await?;
    let mut obj = current.clone().unwrap_or(seed);
    let is_new = obj.meta().creation_timestamp.is_none();

    mutate(&mut obj, is_new)?;

    let outcome = match current {
        None => {
            obj = store.create(&obj).await?;
            Outcome::Created
        }
        Some(before) if serde_json::to_value(&before)? != serde_json::to_value(&obj)? => {
            obj = store.replace(&obj).await?;
            Outcome::Updated
        }
        Some(_) => Outcome::Unchanged,
    };

    debug!(
        kind = %K::kind(&()),
        name = %name,
        namespace = namespace.as_deref().unwrap_or(""),
        result = outcome.as_str(),
        "object enforced"
    );
    Ok((obj, outcome))
}

/// Builds the `k=v,k2=v2` form of a label selector.
pub fn selector_string(selector: &Labels) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn seed() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_selector_string() {
        let selector = Labels::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert_eq!(selector_string(&selector), "a=1,b=2");
    }

    #[tokio::test]
    async fn test_create_or_update_outcomes() {
        let store = MemoryStore::new();

        let (created, outcome) = create_or_update(&store, seed(), |cm: &mut ConfigMap, is_new| {
            assert!(is_new);
            cm.data = Some([("mode".to_string(), "a".to_string())].into());
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::Created);
        assert!(created.metadata.creation_timestamp.is_some());

        let (_, outcome) = create_or_update(&store, seed(), |cm: &mut ConfigMap, is_new| {
            assert!(!is_new);
            cm.data = Some([("mode".to_string(), "a".to_string())].into());
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::Unchanged);

        let (updated, outcome) = create_or_update(&store, seed(), |cm: &mut ConfigMap, _| {
            cm.data = Some([("mode".to_string(), "b".to_string())].into());
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(updated.data.unwrap()["mode"], "b");
        assert_eq!(store.creates::<ConfigMap>(), 1);
        assert_eq!(store.replaces::<ConfigMap>(), 1);
    }

    #[tokio::test]
    async fn test_mutate_error_skips_write() {
        let store = MemoryStore::new();
        let result = create_or_update(&store, seed(), |_: &mut ConfigMap, _| {
            Err(crate::OperatorError::InvalidState("nope".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(store.creates::<ConfigMap>(), 0);
    }
}
