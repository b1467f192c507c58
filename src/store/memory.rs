//! In-memory [`ObjectStore`] used by the unit tests.
//!
//! Objects are kept as JSON, keyed by kind, namespace and name. The store
//! assigns uids, resource versions and creation timestamps, enforces
//! optimistic concurrency on replace and counts writes per kind.

use super::{Labels, ObjectStore, StoreObject};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ErrorResponse;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

type Key = (String, String, String);

#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<Key, Value>>,
    creates: Mutex<HashMap<String, usize>>,
    replaces: Mutex<HashMap<String, usize>>,
    failing_kinds: Mutex<HashSet<String>>,
    version: AtomicU64,
}

fn kind_key<K: StoreObject>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn key<K: StoreObject>(namespace: Option<&str>, name: &str) -> Key {
    (
        kind_key::<K>(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> crate::OperatorError {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
    .into()
}

/// RFC 7386 JSON merge patch.
fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(map) = target {
                for (k, v) in entries {
                    if v.is_null() {
                        map.remove(k);
                    } else {
                        merge(map.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn labels_match(obj: &Value, selector: &Labels) -> bool {
    let labels = &obj["metadata"]["labels"];
    selector
        .iter()
        .all(|(k, v)| labels.get(k).and_then(Value::as_str) == Some(v.as_str()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn bump(map: &Mutex<HashMap<String, usize>>, kind: String) {
        *map.lock().unwrap().entry(kind).or_default() += 1;
    }

    fn check_failing<K: StoreObject>(&self) -> Result<()> {
        if self.failing_kinds.lock().unwrap().contains(&kind_key::<K>()) {
            return Err(api_error(500, "InternalError", "injected failure".to_string()));
        }
        Ok(())
    }

    /// Number of objects of kind `K` created through the store.
    pub fn creates<K: StoreObject>(&self) -> usize {
        self.creates.lock().unwrap().get(&kind_key::<K>()).copied().unwrap_or(0)
    }

    /// Number of full updates of kind `K` performed through the store.
    pub fn replaces<K: StoreObject>(&self) -> usize {
        self.replaces.lock().unwrap().get(&kind_key::<K>()).copied().unwrap_or(0)
    }

    /// Makes every write of kind `K` fail with an internal server error.
    pub fn fail_writes<K: StoreObject>(&self) {
        self.failing_kinds.lock().unwrap().insert(kind_key::<K>());
    }

    /// Stores `obj` without counting it as a create.
    pub async fn insert<K: StoreObject>(&self, mut obj: K) -> K {
        let version = self.next_version();
        let meta = obj.meta_mut();
        meta.uid.get_or_insert_with(|| format!("uid-{}", version));
        meta.resource_version = Some(version);
        meta.creation_timestamp
            .get_or_insert_with(|| Time(chrono::Utc::now()));
        let k = key::<K>(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default());
        let value = serde_json::to_value(&obj).unwrap();
        self.objects.write().await.insert(k, value);
        obj
    }

    /// Whether an object of kind `K` is stored under the given name.
    pub async fn contains<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> bool {
        self.objects.read().await.contains_key(&key::<K>(namespace, name))
    }

    async fn write_patch<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        let mut objects = self.objects.write().await;
        let current = objects
            .get_mut(&key::<K>(namespace, name))
            .ok_or_else(|| api_error(404, "NotFound", format!("{} not found", name)))?;
        merge(current, patch);
        current["metadata"]["resourceVersion"] = Value::String(self.next_version());
        Ok(serde_json::from_value(current.clone())?)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        match self.objects.read().await.get(&key::<K>(namespace, name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        selector: &Labels,
    ) -> Result<Vec<K>> {
        let kind = kind_key::<K>();
        let objects = self.objects.read().await;
        objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.map_or(true, |n| n == ns))
            .filter(|(_, v)| labels_match(v, selector))
            .map(|(_, v)| Ok(serde_json::from_value(v.clone())?))
            .collect()
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        self.check_failing::<K>()?;
        let mut obj = obj.clone();
        let meta = obj.meta();
        let k = key::<K>(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default());
        if self.objects.read().await.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists", format!("{} already exists", k.2)));
        }
        let version = self.next_version();
        let meta = obj.meta_mut();
        meta.uid = Some(format!("uid-{}", version));
        meta.resource_version = Some(version);
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        self.objects.write().await.insert(k, serde_json::to_value(&obj)?);
        Self::bump(&self.creates, kind_key::<K>());
        Ok(obj)
    }

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K> {
        self.check_failing::<K>()?;
        let meta = obj.meta();
        let k = key::<K>(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default());
        let mut objects = self.objects.write().await;
        let stored = objects
            .get(&k)
            .ok_or_else(|| api_error(404, "NotFound", format!("{} not found", k.2)))?;
        if stored["metadata"]["resourceVersion"].as_str() != meta.resource_version.as_deref() {
            return Err(api_error(409, "Conflict", format!("{} has been modified", k.2)));
        }

        let mut value = serde_json::to_value(obj)?;
        // the status subresource is not writable through a full update
        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Value::Object(map) = &mut value {
                    map.remove("status");
                }
            }
        }
        value["metadata"]["resourceVersion"] = Value::String(self.next_version());
        objects.insert(k, value.clone());
        Self::bump(&self.replaces, kind_key::<K>());
        Ok(serde_json::from_value(value)?)
    }

    async fn patch<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        self.check_failing::<K>()?;
        self.write_patch(namespace, name, patch).await
    }

    async fn patch_status<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        let status_only = serde_json::json!({ "status": patch.get("status").cloned().unwrap_or(Value::Null) });
        self.write_patch(namespace, name, &status_only).await
    }

    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        Ok(self
            .objects
            .write()
            .await
            .remove(&key::<K>(namespace, name))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service(ns: &str, name: &str, labels: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_patch() {
        let mut target = serde_json::json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge(&mut target, &serde_json::json!({"a": {"b": null, "e": 4}, "d": [1]}));
        assert_eq!(target, serde_json::json!({"a": {"c": 2, "e": 4}, "d": [1]}));
    }

    #[tokio::test]
    async fn test_create_conflicts_and_stale_replace() {
        let store = MemoryStore::new();
        let created = store.create(&service("a", "svc", &[])).await.unwrap();
        assert!(store.create(&service("a", "svc", &[])).await.unwrap_err().is_conflict());

        let mut first = created.clone();
        first.metadata.labels = Some([("x".to_string(), "1".to_string())].into());
        store.replace(&first).await.unwrap();

        // created still carries the old resource version
        assert!(store.replace(&created).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_list_across_namespaces_with_selector() {
        let store = MemoryStore::new();
        store.create(&service("a", "one", &[("role", "pe")])).await.unwrap();
        store.create(&service("b", "two", &[("role", "pe")])).await.unwrap();
        store.create(&service("b", "three", &[])).await.unwrap();

        let selector = Labels::from([("role".to_string(), "pe".to_string())]);
        let all: Vec<Service> = store.list(None, &selector).await.unwrap();
        assert_eq!(all.len(), 2);
        let in_b: Vec<Service> = store.list(Some("b"), &selector).await.unwrap();
        assert_eq!(in_b.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_absence() {
        let store = MemoryStore::new();
        store.create(&service("a", "svc", &[])).await.unwrap();
        assert!(store.delete::<Service>(Some("a"), "svc").await.unwrap());
        assert!(!store.delete::<Service>(Some("a"), "svc").await.unwrap());
    }
}
