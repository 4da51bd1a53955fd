//! Kubernetes persistence seam for the reconciliation engine

use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use serde_json::json;
use tracing::info_span;

use super::finalizers::finalizers_patch;
use super::resource::ConfigEntryResource;
use crate::error::Result;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "consul-config-operator";

/// Read and write access to the resources one controller reconciles.
#[async_trait]
pub trait Controller<K: ConfigEntryResource>: Send + Sync {
    /// Fetch the latest version. A missing object is an error for which
    /// [`crate::Error::is_not_found`] holds.
    async fn get(&self, key: &ObjectRef<K>) -> Result<K>;

    /// Persist metadata (finalizers). `obj` is refreshed from the response.
    async fn update(&self, obj: &mut K) -> Result<()>;

    /// Persist the status subresource. `obj` is refreshed from the response.
    async fn update_status(&self, obj: &mut K) -> Result<()>;

    /// Span scoping the log lines of one reconcile.
    fn logger(&self, key: &ObjectRef<K>) -> tracing::Span;

    /// ClusterIP of the Kubernetes Service `namespace/name`, if any.
    async fn service_cluster_ip(&self, namespace: &str, name: &str) -> Result<Option<String>>;
}

/// [`Controller`] backed by the Kubernetes API.
pub struct KubeController<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeController<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> Clone for KubeController<K> {
    fn clone(&self) -> Self {
        Self::new(self.client.clone())
    }
}

impl<K: ConfigEntryResource> KubeController<K> {
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl<K: ConfigEntryResource> Controller<K> for KubeController<K> {
    async fn get(&self, key: &ObjectRef<K>) -> Result<K> {
        let api = self.api(key.namespace.as_deref());
        Ok(api.get(&key.name).await?)
    }

    async fn update(&self, obj: &mut K) -> Result<()> {
        let api = self.api(obj.namespace().as_deref());
        let patch = finalizers_patch(obj);
        let updated = api
            .patch(&obj.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        *obj = updated;
        Ok(())
    }

    async fn update_status(&self, obj: &mut K) -> Result<()> {
        let api = self.api(obj.namespace().as_deref());
        let patch = json!({ "status": obj.status() });
        let updated = api
            .patch_status(&obj.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        *obj = updated;
        Ok(())
    }

    fn logger(&self, key: &ObjectRef<K>) -> tracing::Span {
        info_span!(
            "reconcile",
            kind = %K::kind(&()),
            namespace = key.namespace.as_deref().unwrap_or_default(),
            name = %key.name,
        )
    }

    async fn service_cluster_ip(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = services.get_opt(name).await?;
        Ok(service
            .and_then(|s| s.spec)
            .and_then(|spec| spec.cluster_ip)
            .filter(|ip| !ip.is_empty() && ip != "None"))
    }
}
