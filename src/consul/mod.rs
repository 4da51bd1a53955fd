//! Consul agent API surface used by the reconciler
//!
//! The [`ConsulClient`] trait is the seam between the reconciliation engine
//! and Consul; [`ConsulHttpClient`] implements it against the HTTP API.

mod client;
pub mod entry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub use client::{ConsulClientConfig, ConsulHttpClient};
pub use entry::{ConfigEntry, DATACENTER_KEY, SOURCE_KEY, SOURCE_VALUE};

/// Consul namespace every agent has, which can never be created or deleted.
pub const DEFAULT_CONSUL_NAMESPACE: &str = "default";

/// Wildcard namespace accepted by namespace-aware Consul queries.
pub const WILDCARD_NAMESPACE: &str = "*";

/// Errors returned by the Consul HTTP API.
#[derive(Error, Debug)]
pub enum ConsulError {
    #[error("HTTP request to Consul failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response code: {status} ({body})")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Failed to decode Consul response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ConsulError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConsulError::UnexpectedStatus { status: 404, .. })
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            ConsulError::Http(_) => true,
            ConsulError::UnexpectedStatus { status, .. } => *status >= 500 || *status == 429,
            ConsulError::Decode(_) => false,
        }
    }
}

/// Tenancy scoping sent with every request as `ns` / `partition` query
/// parameters. Empty fields are omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub namespace: String,
    pub partition: String,
}

impl RequestOptions {
    pub fn new(namespace: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            partition: partition.into(),
        }
    }
}

/// A Consul Enterprise namespace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Namespace {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "ACLs", default, skip_serializing_if = "Option::is_none")]
    pub acls: Option<NamespaceAclConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NamespaceAclConfig {
    #[serde(default)]
    pub policy_defaults: Vec<AclLink>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AclLink {
    #[serde(rename = "ID", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// Operations the reconciler needs from a Consul agent.
#[async_trait]
pub trait ConsulClient: Send + Sync {
    /// Read a config entry. `Ok(None)` when Consul answers 404.
    async fn get_config_entry(
        &self,
        kind: &str,
        name: &str,
        opts: &RequestOptions,
    ) -> Result<Option<ConfigEntry>, ConsulError>;

    /// Create or overwrite a config entry. Returns Consul's success flag.
    async fn set_config_entry(
        &self,
        entry: &ConfigEntry,
        opts: &RequestOptions,
    ) -> Result<bool, ConsulError>;

    async fn delete_config_entry(
        &self,
        kind: &str,
        name: &str,
        opts: &RequestOptions,
    ) -> Result<(), ConsulError>;

    /// Read a namespace. `Ok(None)` when it does not exist.
    async fn read_namespace(
        &self,
        name: &str,
        opts: &RequestOptions,
    ) -> Result<Option<Namespace>, ConsulError>;

    async fn create_namespace(
        &self,
        namespace: &Namespace,
        opts: &RequestOptions,
    ) -> Result<Namespace, ConsulError>;

    /// Add manual virtual IPs for `service` to Consul's virtual IP table.
    async fn assign_service_virtual_ip(
        &self,
        service: &str,
        manual_ips: &[String],
        opts: &RequestOptions,
    ) -> Result<(), ConsulError>;

    /// Create `namespace` unless it already exists. The `default` and
    /// wildcard namespaces are never created. When `cross_namespace_acl_policy`
    /// is set the new namespace gets it as a default policy so services in
    /// other namespaces can discover it. Returns whether a namespace was
    /// created.
    async fn ensure_namespace_exists(
        &self,
        namespace: &str,
        partition: &str,
        cross_namespace_acl_policy: &str,
    ) -> Result<bool, ConsulError> {
        if namespace == DEFAULT_CONSUL_NAMESPACE || namespace == WILDCARD_NAMESPACE {
            return Ok(false);
        }

        let opts = RequestOptions::new("", partition);
        if self.read_namespace(namespace, &opts).await?.is_some() {
            return Ok(false);
        }

        let policy_defaults = if cross_namespace_acl_policy.is_empty() {
            Vec::new()
        } else {
            vec![AclLink {
                id: String::new(),
                name: cross_namespace_acl_policy.to_string(),
            }]
        };

        let ns = Namespace {
            name: namespace.to_string(),
            description: "Auto-generated by consul-config-operator".to_string(),
            acls: Some(NamespaceAclConfig { policy_defaults }),
            meta: BTreeMap::from([(SOURCE_KEY.to_string(), SOURCE_VALUE.to_string())]),
            partition: partition.to_string(),
        };
        self.create_namespace(&ns, &opts).await?;
        info!(namespace, "Created Consul namespace");
        Ok(true)
    }
}
