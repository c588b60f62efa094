//! Client handed to test cases, bound to the frozen [Scheme] of the suite.
use crate::control_plane::FIELD_MANAGER;
use crate::scheme::Scheme;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::gvk::ParseGroupVersionError;
use kube::core::{DynamicObject, GroupVersion, GroupVersionKind, ObjectMeta};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("kind `{0}` is not registered in the scheme")]
    UnregisteredKind(String),

    #[error("kind `{0}` is namespaced but no namespace was provided")]
    MissingNamespace(String),

    #[error("the object has no type information")]
    MissingTypeMeta,

    #[error("the name of the object is missing")]
    MissingName,

    #[error("error parsing GroupVersion: `{0}`")]
    ParseGroupVersion(#[from] ParseGroupVersionError),

    #[error("the kube client returned an error: `{0}`")]
    Kube(#[from] kube::Error),
}

/// Stream of objects created or modified since the watch started.
pub type WatchStream = BoxStream<'static, Result<DynamicObject, watcher::Error>>;

/// [kube::Client] that only serves the kinds registered in the scheme, resolving them without discovery.
#[derive(Clone)]
pub struct SchemeClient {
    client: Client,
    scheme: Arc<Scheme>,
}

impl SchemeClient {
    pub fn new(client: Client, scheme: Arc<Scheme>) -> Self {
        Self { client, scheme }
    }

    /// The underlying client, for requests the scheme doesn't need to know about.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn namespaced_api<K>(&self, namespace: &str) -> Result<Api<K>, ClientError>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        self.ensure_registered::<K>()?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }

    pub fn cluster_api<K>(&self) -> Result<Api<K>, ClientError>
    where
        K: Resource<DynamicType = (), Scope = ClusterResourceScope>,
    {
        self.ensure_registered::<K>()?;
        Ok(Api::all(self.client.clone()))
    }

    fn ensure_registered<K>(&self) -> Result<(), ClientError>
    where
        K: Resource<DynamicType = ()>,
    {
        if !self.scheme.contains::<K>() {
            return Err(ClientError::UnregisteredKind(format!(
                "{}/{}",
                K::api_version(&()),
                K::kind(&())
            )));
        }
        Ok(())
    }

    /// Api for a registered kind. The namespace is required for namespaced kinds and ignored otherwise.
    pub fn dynamic_api(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, ClientError> {
        let definition = self
            .scheme
            .resolve(gvk)
            .ok_or_else(|| ClientError::UnregisteredKind(describe(gvk)))?;

        match (definition.namespaced, namespace) {
            (true, Some(ns)) => Ok(Api::namespaced_with(
                self.client.clone(),
                ns,
                &definition.resource,
            )),
            (true, None) => Err(ClientError::MissingNamespace(describe(gvk))),
            (false, _) => Ok(Api::all_with(self.client.clone(), &definition.resource)),
        }
    }

    fn api_for(&self, obj: &DynamicObject) -> Result<Api<DynamicObject>, ClientError> {
        let types = obj.types.as_ref().ok_or(ClientError::MissingTypeMeta)?;
        let gvk = GroupVersion::from_str(&types.api_version)?.with_kind(&types.kind);
        self.dynamic_api(&gvk, obj.metadata.namespace.as_deref())
    }

    pub async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        Ok(self
            .api_for(obj)?
            .create(&PostParams::default(), obj)
            .await?)
    }

    /// Returns `None` when the object doesn't exist.
    pub async fn get(
        &self,
        gvk: &GroupVersionKind,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<DynamicObject>, ClientError> {
        Ok(self.dynamic_api(gvk, namespace)?.get_opt(name).await?)
    }

    pub async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        Ok(self.dynamic_api(gvk, namespace)?.list(params).await?.items)
    }

    pub async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = obj.metadata.name.as_deref().ok_or(ClientError::MissingName)?;
        Ok(self
            .api_for(obj)?
            .replace(name, &PostParams::default(), obj)
            .await?)
    }

    /// Server-side apply, taking ownership of conflicting fields.
    pub async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = obj.metadata.name.as_deref().ok_or(ClientError::MissingName)?;
        Ok(self
            .api_for(obj)?
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(obj),
            )
            .await?)
    }

    pub async fn delete(
        &self,
        gvk: &GroupVersionKind,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(), ClientError> {
        self.dynamic_api(gvk, namespace)?
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    /// Watches the objects of a registered kind. Objects already present are yielded first.
    pub fn watch(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<WatchStream, ClientError> {
        let api = self.dynamic_api(gvk, namespace)?;
        Ok(watcher(api, watcher::Config::default())
            .applied_objects()
            .boxed())
    }

    /// Creates a namespace named after `prefix` with a random suffix and returns its name.
    pub async fn create_namespace(&self, prefix: &str) -> Result<String, ClientError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                generate_name: Some(format!("{prefix}-")),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = api.create(&PostParams::default(), &namespace).await?;
        let name = created.metadata.name.ok_or(ClientError::MissingName)?;
        debug!(namespace = %name, "namespace created");
        Ok(name)
    }

    pub async fn delete_namespace(&self, name: &str) -> Result<(), ClientError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::background()).await?;
        debug!(namespace = %name, "namespace deletion requested");
        Ok(())
    }
}

fn describe(gvk: &GroupVersionKind) -> String {
    format!("{}/{}", gvk.api_version(), gvk.kind)
}
