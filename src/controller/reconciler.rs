//! Reconciliation engine shared by every config entry kind
//!
//! One pass of [`ConfigEntryController::reconcile_entry`] converges a single
//! resource: it guards the object with a finalizer, mirrors it into Consul
//! while respecting entries owned by other datacenters or tools, and records
//! the outcome in the `Synced` condition.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, error, info, warn, Instrument};

use super::conditions::{
    REASON_CONSUL_AGENT_ERROR, REASON_EXTERNALLY_MANAGED, REASON_MIGRATION_FAILED,
};
use super::finalizers::FINALIZER_NAME;
use super::kube_controller::Controller;
#[cfg(feature = "metrics")]
use super::metrics;
use super::resource::ConfigEntryResource;
use super::tenancy::{destination_tenancy, TenancyConfig};
use crate::consul::{ConfigEntry, ConsulClient, ConsulError, RequestOptions};
use crate::crd::ConditionStatus;
use crate::error::{Error, Result};

/// Default interval after which an in-sync resource is checked for drift.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60 * 60);

/// Kind-independent state of the reconciliation engine.
#[derive(Clone)]
pub struct ConfigEntryController {
    pub consul: Arc<dyn ConsulClient>,
    /// Datacenter stamped into the ownership meta of every entry written
    pub datacenter: String,
    pub tenancy: TenancyConfig,
    /// ACL policy attached to namespaces the operator creates
    pub cross_namespace_acl_policy: String,
    /// Register the ClusterIP of like-named Services as Consul virtual IPs
    pub assign_virtual_ips: bool,
    pub resync_period: Duration,
}

impl ConfigEntryController {
    pub fn new(consul: Arc<dyn ConsulClient>, datacenter: impl Into<String>, tenancy: TenancyConfig) -> Self {
        Self {
            consul,
            datacenter: datacenter.into(),
            tenancy,
            cross_namespace_acl_policy: String::new(),
            assign_virtual_ips: true,
            resync_period: DEFAULT_RESYNC_PERIOD,
        }
    }

    /// Converge the resource identified by `key` with Consul.
    ///
    /// Errors from Kubernetes reads and metadata writes are returned as-is.
    /// Consul failures are recorded on the status before being returned as
    /// [`Error::SyncFailed`].
    pub async fn reconcile_entry<K, C>(&self, ctrl: &C, key: &ObjectRef<K>) -> Result<Action>
    where
        K: ConfigEntryResource,
        C: Controller<K> + ?Sized,
    {
        let span = ctrl.logger(key);
        self.reconcile_in_span(ctrl, key).instrument(span).await
    }

    async fn reconcile_in_span<K, C>(&self, ctrl: &C, key: &ObjectRef<K>) -> Result<Action>
    where
        K: ConfigEntryResource,
        C: Controller<K> + ?Sized,
    {
        let mut obj = match ctrl.get(key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                debug!("resource no longer exists");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        };

        let mut desired = obj.to_consul(&self.datacenter);
        let tenancy = destination_tenancy(
            &self.tenancy,
            &desired.namespace,
            &obj.consul_mirroring_ns(),
            obj.consul_global_resource(),
        );
        desired.namespace = tenancy.namespace.clone();
        desired.partition = tenancy.partition.clone();
        let opts = RequestOptions::new(tenancy.namespace.clone(), tenancy.partition.clone());
        let kind = obj.consul_kind();
        let name = obj.consul_name();

        if !obj.is_being_deleted() && !obj.has_finalizer(FINALIZER_NAME) {
            obj.add_finalizer(FINALIZER_NAME);
            ctrl.update(&mut obj).await?;
            obj.set_synced_condition(ConditionStatus::Unknown, "", "");
            ctrl.update_status(&mut obj).await?;
            debug!("added finalizer");
        }

        if obj.is_being_deleted() {
            if !obj.has_finalizer(FINALIZER_NAME) {
                return Ok(Action::await_change());
            }
            info!("deletion event");

            match self.consul.get_config_entry(kind, &name, &opts).await {
                Ok(None) => info!("config entry already deleted from Consul"),
                Ok(Some(existing)) if existing.is_owned_by(&self.datacenter) => {
                    if let Err(e) = self.consul.delete_config_entry(kind, &name, &opts).await {
                        return self
                            .sync_failed(
                                ctrl,
                                &mut obj,
                                REASON_CONSUL_AGENT_ERROR,
                                format!("deleting config entry from consul: {}", e),
                            )
                            .await;
                    }
                    info!("deletion from Consul successful");
                }
                Ok(Some(existing)) => info!(
                    source_datacenter = existing.source_datacenter(),
                    "config entry in Consul was created in another datacenter, skipping deletion from Consul"
                ),
                Err(e) => {
                    error!(error = %e, "getting config entry from consul");
                    return Err(e.into());
                }
            }

            obj.remove_finalizer(FINALIZER_NAME);
            ctrl.update(&mut obj).await?;
            info!("finalizer removed");
            return Ok(Action::await_change());
        }

        let current = match self.consul.get_config_entry(kind, &name, &opts).await {
            Ok(current) => current,
            Err(e) => {
                return self
                    .sync_failed(
                        ctrl,
                        &mut obj,
                        REASON_CONSUL_AGENT_ERROR,
                        format!("failed to get config entry from consul: {}", e),
                    )
                    .await
            }
        };

        let Some(current) = current else {
            if self.tenancy.enable_consul_namespaces {
                match self
                    .consul
                    .ensure_namespace_exists(
                        &tenancy.namespace,
                        &tenancy.partition,
                        &self.cross_namespace_acl_policy,
                    )
                    .await
                {
                    Ok(created) => {
                        if created {
                            debug!(namespace = %tenancy.namespace, "created consul namespace");
                            #[cfg(feature = "metrics")]
                            metrics::inc_namespace_created();
                        }
                    }
                    Err(e) => {
                        return self
                            .sync_failed(
                                ctrl,
                                &mut obj,
                                REASON_CONSUL_AGENT_ERROR,
                                format!("creating consul namespace {:?}: {}", tenancy.namespace, e),
                            )
                            .await
                    }
                }
            }

            if let Err(e) = self.write(&desired, &opts).await {
                return self
                    .sync_failed(
                        ctrl,
                        &mut obj,
                        REASON_CONSUL_AGENT_ERROR,
                        format!("writing config entry to consul: {}", e),
                    )
                    .await;
            }
            info!("config entry created");
            self.assign_virtual_ip(ctrl, &obj, &opts).await;
            return self.sync_successful(ctrl, &mut obj).await;
        };

        let mut requires_migration = false;
        if !current.is_owned_by(&self.datacenter) {
            if !obj.migration_requested() {
                let source_datacenter = current.source_datacenter();
                let message = if source_datacenter.is_empty() {
                    "config entry already exists in Consul".to_string()
                } else {
                    format!("config entry managed in different datacenter: {:?}", source_datacenter)
                };
                return self
                    .sync_failed(ctrl, &mut obj, REASON_EXTERNALLY_MANAGED, message)
                    .await;
            }
            requires_migration = true;
        }

        if !obj.matches_consul(&current) {
            if requires_migration {
                let message = migration_mismatch_message(&current, &desired);
                return self
                    .sync_failed(ctrl, &mut obj, REASON_MIGRATION_FAILED, message)
                    .await;
            }

            info!("config entry does not match consul");
            if let Err(e) = self.write(&desired, &opts).await {
                return self
                    .sync_unknown_with_error(
                        ctrl,
                        &mut obj,
                        REASON_CONSUL_AGENT_ERROR,
                        format!("updating config entry in consul: {}", e),
                    )
                    .await;
            }
            info!("config entry updated");
            self.assign_virtual_ip(ctrl, &obj, &opts).await;
            return self.sync_successful(ctrl, &mut obj).await;
        }

        if requires_migration {
            info!("migrating config entry to be managed by Kubernetes");
            if let Err(e) = self.write(&desired, &opts).await {
                return self
                    .sync_failed(
                        ctrl,
                        &mut obj,
                        REASON_CONSUL_AGENT_ERROR,
                        format!("updating config entry in consul: {}", e),
                    )
                    .await;
            }
            info!("config entry migrated");
            self.assign_virtual_ip(ctrl, &obj, &opts).await;
            return self.sync_successful(ctrl, &mut obj).await;
        }

        if !obj.is_synced() {
            return self.sync_successful(ctrl, &mut obj).await;
        }

        self.assign_virtual_ip(ctrl, &obj, &opts).await;
        Ok(Action::requeue(self.resync_period))
    }

    async fn write(&self, entry: &ConfigEntry, opts: &RequestOptions) -> Result<(), ConsulError> {
        let written = self.consul.set_config_entry(entry, opts).await?;
        if !written {
            warn!("Consul did not apply the config entry write");
        }
        Ok(())
    }

    /// Record `False` with `reason` and return the failure.
    async fn sync_failed<K, C>(&self, ctrl: &C, obj: &mut K, reason: &str, message: String) -> Result<Action>
    where
        K: ConfigEntryResource,
        C: Controller<K> + ?Sized,
    {
        self.record_failure(ctrl, obj, ConditionStatus::False, reason, message)
            .await
    }

    /// Record `Unknown` with `reason`: the previous content may still be
    /// live in Consul.
    async fn sync_unknown_with_error<K, C>(
        &self,
        ctrl: &C,
        obj: &mut K,
        reason: &str,
        message: String,
    ) -> Result<Action>
    where
        K: ConfigEntryResource,
        C: Controller<K> + ?Sized,
    {
        self.record_failure(ctrl, obj, ConditionStatus::Unknown, reason, message)
            .await
    }

    async fn record_failure<K, C>(
        &self,
        ctrl: &C,
        obj: &mut K,
        status: ConditionStatus,
        reason: &str,
        message: String,
    ) -> Result<Action>
    where
        K: ConfigEntryResource,
        C: Controller<K> + ?Sized,
    {
        obj.set_synced_condition(status, reason, &message);
        #[cfg(feature = "metrics")]
        metrics::inc_sync_outcome(
            obj.kube_kind(),
            if status == ConditionStatus::False { "failed" } else { "unknown" },
        );

        let err = Error::SyncFailed {
            reason: reason.to_string(),
            message,
        };
        if let Err(status_err) = ctrl.update_status(obj).await {
            error!(error = %err, "sync failed and the failure could not be recorded on the status");
            return Err(status_err);
        }
        Err(err)
    }

    async fn sync_successful<K, C>(&self, ctrl: &C, obj: &mut K) -> Result<Action>
    where
        K: ConfigEntryResource,
        C: Controller<K> + ?Sized,
    {
        obj.set_synced_condition(ConditionStatus::True, "", "");
        obj.set_last_synced_time(Utc::now());
        ctrl.update_status(obj).await?;
        #[cfg(feature = "metrics")]
        metrics::inc_sync_outcome(obj.kube_kind(), "synced");
        Ok(Action::requeue(self.resync_period))
    }

    /// Register the ClusterIP of the Service named after the resource in
    /// Consul's virtual IP table. Never fails the reconcile.
    async fn assign_virtual_ip<K, C>(&self, ctrl: &C, obj: &K, opts: &RequestOptions)
    where
        K: ConfigEntryResource,
        C: Controller<K> + ?Sized,
    {
        if !self.assign_virtual_ips || !obj.needs_virtual_ip() {
            return;
        }

        let namespace = obj.namespace().unwrap_or_default();
        let service_name = obj.kubernetes_name();
        let cluster_ip = match ctrl.service_cluster_ip(&namespace, &service_name).await {
            Ok(Some(ip)) => ip,
            Ok(None) => {
                debug!(service = %service_name, "no matching service, skipping virtual ip assignment");
                return;
            }
            Err(e) => {
                warn!(service = %service_name, error = %e, "failed assigning service virtual ip");
                return;
            }
        };

        info!(name = %service_name, "adding manual ip to virtual ip table in Consul");
        match self
            .consul
            .assign_service_virtual_ip(&service_name, &[cluster_ip], opts)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => warn!(
                name = %service_name,
                "failed to add ip to virtual ip table. Please upgrade Consul to version 1.16 or higher"
            ),
            Err(e) => warn!(service = %service_name, error = %e, "failed assigning service virtual ip"),
        }
    }
}

fn migration_mismatch_message(consul: &ConfigEntry, kube: &ConfigEntry) -> String {
    let render = |entry: &ConfigEntry| {
        serde_json::to_string(entry).unwrap_or_else(|e| format!("<unable to marshal: {}>", e))
    };
    format!(
        "migration failed: Kubernetes resource does not match existing Consul config entry: consul={}, kube={}",
        render(consul),
        render(kube)
    )
}
