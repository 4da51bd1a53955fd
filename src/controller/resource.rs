//! Capability contract every config entry custom resource implements

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};

use super::conditions;
use super::finalizers;
use super::tenancy::TenancyConfig;
use crate::consul::ConfigEntry;
use crate::crd::{ConditionStatus, ConfigEntryStatus, SpecValidationError, CONDITION_SYNCED};

/// Annotation opting a resource into taking over an existing Consul entry.
pub const MIGRATE_ENTRY_KEY: &str = "consul.hashicorp.com/migrate-entry";
pub const MIGRATE_ENTRY_TRUE: &str = "true";

/// A Kubernetes resource mirrored into a Consul config entry.
///
/// Kinds supply their identity, the desired Consul entry and a structural
/// comparison; finalizer and status bookkeeping come with defaults.
pub trait ConfigEntryResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Lower-case Kubernetes kind, e.g. `servicedefaults`
    fn kube_kind(&self) -> &'static str;

    /// Consul config entry kind, e.g. `service-defaults`
    fn consul_kind(&self) -> &'static str;

    /// Name of the entry in Consul
    fn consul_name(&self) -> String {
        self.kubernetes_name()
    }

    fn kubernetes_name(&self) -> String {
        self.name_any()
    }

    /// Kubernetes namespace used when mirroring into Consul namespaces
    fn consul_mirroring_ns(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    /// Global resources ignore namespace mirroring
    fn consul_global_resource(&self) -> bool {
        false
    }

    /// Whether the ClusterIP of the like-named Service should be registered
    /// in Consul's virtual IP table after a successful write
    fn needs_virtual_ip(&self) -> bool {
        false
    }

    /// Desired entry stamped with ownership meta for `datacenter`
    fn to_consul(&self, datacenter: &str) -> ConfigEntry;

    /// Structural equality with an entry read from Consul
    fn matches_consul(&self, candidate: &ConfigEntry) -> bool;

    fn validate(&self, tenancy: &TenancyConfig) -> Result<(), Vec<SpecValidationError>>;

    fn status(&self) -> Option<&ConfigEntryStatus>;

    fn status_mut(&mut self) -> &mut ConfigEntryStatus;

    fn has_finalizer(&self, name: &str) -> bool {
        finalizers::has_finalizer(self, name)
    }

    fn add_finalizer(&mut self, name: &str) {
        finalizers::add_finalizer(self, name)
    }

    fn remove_finalizer(&mut self, name: &str) {
        finalizers::remove_finalizer(self, name)
    }

    fn is_being_deleted(&self) -> bool {
        finalizers::is_being_deleted(self)
    }

    fn migration_requested(&self) -> bool {
        self.annotations().get(MIGRATE_ENTRY_KEY).map(String::as_str) == Some(MIGRATE_ENTRY_TRUE)
    }

    fn set_synced_condition(&mut self, status: ConditionStatus, reason: &str, message: &str) {
        conditions::set_condition(
            &mut self.status_mut().conditions,
            CONDITION_SYNCED,
            status,
            reason,
            message,
        );
    }

    fn set_last_synced_time(&mut self, time: DateTime<Utc>) {
        self.status_mut().last_synced_time = Some(time.to_rfc3339());
    }

    /// Status, reason and message of the Synced condition
    fn synced_condition(&self) -> (ConditionStatus, String, String) {
        self.status()
            .and_then(|s| conditions::find_condition(&s.conditions, CONDITION_SYNCED))
            .map(|c| (c.status, c.reason.clone(), c.message.clone()))
            .unwrap_or((ConditionStatus::Unknown, String::new(), String::new()))
    }

    fn is_synced(&self) -> bool {
        self.status()
            .map(|s| conditions::is_condition_true(&s.conditions, CONDITION_SYNCED))
            .unwrap_or(false)
    }

    fn synced_condition_status(&self) -> ConditionStatus {
        self.status()
            .map(|s| conditions::condition_status(&s.conditions, CONDITION_SYNCED))
            .unwrap_or(ConditionStatus::Unknown)
    }
}
