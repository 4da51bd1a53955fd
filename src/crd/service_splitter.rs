//! ServiceSplitter Custom Resource Definition
//!
//! Splits traffic for a service across subsets or other services by weight.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::types::{default_tenancy_to_empty, ConfigEntryStatus, SpecValidationError};
use crate::consul::ConfigEntry;
use crate::controller::{ConfigEntryResource, TenancyConfig};

pub const SERVICE_SPLITTER_KUBE_KIND: &str = "servicesplitter";
pub const SERVICE_SPLITTER_CONSUL_KIND: &str = "service-splitter";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "ServiceSplitter",
    namespaced,
    status = "ConfigEntryStatus",
    shortname = "service-splitter",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"Last Synced","type":"date","jsonPath":".status.lastSyncedTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSplitterSpec {
    /// Weighted targets; weights must add up to 100
    #[serde(default)]
    pub splits: Vec<ServiceSplit>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSplit {
    /// Percentage of traffic, 0.01 to 100 (or 0)
    #[serde(default)]
    pub weight: f32,
    /// Target service, defaults to the splitter's own service
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_subset: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HttpHeaderModifiers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HttpHeaderModifiers>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeaderModifiers {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

impl HttpHeaderModifiers {
    fn to_consul(&self) -> Value {
        json!({ "Add": self.add, "Set": self.set, "Remove": self.remove })
    }
}

impl ServiceSplit {
    fn to_consul(&self) -> Value {
        json!({
            "Weight": self.weight,
            "Service": self.service,
            "ServiceSubset": self.service_subset,
            "Namespace": self.namespace,
            "Partition": self.partition,
            "RequestHeaders": self.request_headers.as_ref().map(HttpHeaderModifiers::to_consul),
            "ResponseHeaders": self.response_headers.as_ref().map(HttpHeaderModifiers::to_consul),
        })
    }
}

impl ConfigEntryResource for ServiceSplitter {
    fn kube_kind(&self) -> &'static str {
        SERVICE_SPLITTER_KUBE_KIND
    }

    fn consul_kind(&self) -> &'static str {
        SERVICE_SPLITTER_CONSUL_KIND
    }

    fn needs_virtual_ip(&self) -> bool {
        true
    }

    fn to_consul(&self, datacenter: &str) -> ConfigEntry {
        let splits: Vec<Value> = self.spec.splits.iter().map(ServiceSplit::to_consul).collect();
        ConfigEntry::new(
            self.consul_kind(),
            &self.consul_name(),
            datacenter,
            json!({ "Splits": splits }),
        )
    }

    fn matches_consul(&self, candidate: &ConfigEntry) -> bool {
        let mut desired = self.to_consul("");
        let mut candidate = candidate.clone();
        default_tenancy_to_empty(&mut desired.body, "Splits", &["Namespace", "Partition"]);
        default_tenancy_to_empty(&mut candidate.body, "Splits", &["Namespace", "Partition"]);
        desired.equivalent(&candidate, &[])
    }

    fn validate(&self, tenancy: &TenancyConfig) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();
        let mut sum_of_weights = 0f32;

        for (i, split) in self.spec.splits.iter().enumerate() {
            if split.weight != 0.0 && (split.weight > 100.0 || split.weight < 0.01) {
                errors.push(SpecValidationError::invalid(
                    format!("spec.splits[{}].weight", i),
                    split.weight,
                    "weight must be a percentage between 0.01 and 100",
                ));
            }
            sum_of_weights += split.weight;
        }
        if sum_of_weights != 100.0 {
            let as_json = serde_json::to_string(&self.spec.splits).unwrap_or_default();
            errors.push(SpecValidationError::invalid(
                "spec.splits",
                as_json,
                format!(
                    "the sum of weights across all splits must add up to 100 percent, but adds up to {:.6}",
                    sum_of_weights
                ),
            ));
        }

        for (i, split) in self.spec.splits.iter().enumerate() {
            if !tenancy.enable_consul_namespaces && !split.namespace.is_empty() {
                errors.push(SpecValidationError::invalid(
                    format!("spec.splits[{}].namespace", i),
                    &split.namespace,
                    "Consul Enterprise namespaces must be enabled to set split.namespace",
                ));
            }
            if !tenancy.enable_partitions && !split.partition.is_empty() {
                errors.push(SpecValidationError::invalid(
                    format!("spec.splits[{}].partition", i),
                    &split.partition,
                    "Consul Enterprise partitions must be enabled to set split.partition",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn status(&self) -> Option<&ConfigEntryStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut ConfigEntryStatus {
        self.status.get_or_insert_with(ConfigEntryStatus::default)
    }
}
