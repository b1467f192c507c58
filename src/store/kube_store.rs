use super::{selector_string, Labels, ObjectStore, StoreObject};
use crate::error::Result;
use async_trait::async_trait;
use kube::api::{DeleteParams, GetParams, ListParams, ObjectList, Patch, PatchParams, PostParams};
use kube::core::Request;
use kube::Client;

/// [`ObjectStore`] backed by the Kubernetes API server.
///
/// Requests are built from the resource's URL path so that namespaced and
/// cluster-scoped kinds go through the same code.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn request<K: StoreObject>(namespace: Option<&str>) -> Request {
        Request::new(K::url_path(&(), namespace))
    }

    fn namespace_of<K: StoreObject>(obj: &K) -> Option<&str> {
        obj.meta().namespace.as_deref()
    }

    fn name_of<K: StoreObject>(obj: &K) -> &str {
        obj.meta().name.as_deref().unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let req = Self::request::<K>(namespace)
            .get(name, &GetParams::default())
            .map_err(kube::Error::BuildRequest)?;
        match self.client.request::<K>(req).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        selector: &Labels,
    ) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        let req = Self::request::<K>(namespace)
            .list(&params)
            .map_err(kube::Error::BuildRequest)?;
        let list = self.client.request::<ObjectList<K>>(req).await?;
        Ok(list.items)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let req = Self::request::<K>(Self::namespace_of(obj))
            .create(&PostParams::default(), serde_json::to_vec(obj)?)
            .map_err(kube::Error::BuildRequest)?;
        Ok(self.client.request::<K>(req).await?)
    }

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let req = Self::request::<K>(Self::namespace_of(obj))
            .replace(
                Self::name_of(obj),
                &PostParams::default(),
                serde_json::to_vec(obj)?,
            )
            .map_err(kube::Error::BuildRequest)?;
        Ok(self.client.request::<K>(req).await?)
    }

    async fn patch<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        let req = Self::request::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .map_err(kube::Error::BuildRequest)?;
        Ok(self.client.request::<K>(req).await?)
    }

    async fn patch_status<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        let req = Self::request::<K>(namespace)
            .patch_subresource("status", name, &PatchParams::default(), &Patch::Merge(patch))
            .map_err(kube::Error::BuildRequest)?;
        Ok(self.client.request::<K>(req).await?)
    }

    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        let req = Self::request::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .map_err(kube::Error::BuildRequest)?;
        match self.client.request::<serde_json::Value>(req).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
