//! ServiceIntentions Custom Resource Definition
//!
//! Allow/deny rules for traffic to one destination service. The Consul entry
//! is named after the destination, not the Kubernetes resource, and may pin
//! its own Consul namespace.

use std::collections::HashSet;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::types::{not_in_slice_message, ConfigEntryStatus, SpecValidationError};
use crate::consul::entry::normalized;
use crate::consul::ConfigEntry;
use crate::controller::{ConfigEntryResource, TenancyConfig};

pub const SERVICE_INTENTIONS_KUBE_KIND: &str = "serviceintentions";
pub const SERVICE_INTENTIONS_CONSUL_KIND: &str = "service-intentions";

/// Fields Consul computes on each source and returns on reads.
const COMPUTED_SOURCE_FIELDS: [&str; 6] = [
    "LegacyID",
    "LegacyMeta",
    "LegacyCreateTime",
    "LegacyUpdateTime",
    "Precedence",
    "Type",
];

const ACTIONS: [&str; 2] = ["allow", "deny"];

const HTTP_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "CONNECT", "OPTIONS", "TRACE",
];

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "ServiceIntentions",
    namespaced,
    status = "ConfigEntryStatus",
    shortname = "service-intentions",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"Last Synced","type":"date","jsonPath":".status.lastSyncedTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIntentionsSpec {
    #[serde(default)]
    pub destination: IntentionDestination,
    #[serde(default)]
    pub sources: Vec<SourceIntention>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntentionDestination {
    /// Destination service name; `*` matches every service
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceIntention {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// "allow" or "deny"; mutually exclusive with `permissions`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<IntentionPermission>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntentionPermission {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<IntentionHttpPermission>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntentionHttpPermission {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_exact: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_regex: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

fn validate_action(action: &str, path: &str) -> Option<SpecValidationError> {
    if ACTIONS.contains(&action) {
        return None;
    }
    Some(SpecValidationError::invalid(
        format!("{}.action", path),
        action,
        not_in_slice_message(&ACTIONS),
    ))
}

impl IntentionHttpPermission {
    fn validate(&self, path: &str) -> Vec<SpecValidationError> {
        let mut errors = Vec::new();
        let mut path_parts = 0;
        if !self.path_regex.is_empty() {
            path_parts += 1;
        }
        for (field, value) in [("pathPrefix", &self.path_prefix), ("pathExact", &self.path_exact)] {
            if value.is_empty() {
                continue;
            }
            path_parts += 1;
            if !value.starts_with('/') {
                errors.push(SpecValidationError::invalid(
                    format!("{}.{}", path, field),
                    value,
                    "must begin with a '/'",
                ));
            }
        }
        if path_parts > 1 {
            errors.push(SpecValidationError::invalid(
                path,
                serde_json::to_string(self).unwrap_or_default(),
                "at most only one of pathExact, pathPrefix, or pathRegex may be configured.",
            ));
        }

        let mut found = HashSet::new();
        for (i, method) in self.methods.iter().enumerate() {
            let field = format!("{}.methods[{}]", path, i);
            if !HTTP_METHODS.contains(&method.as_str()) {
                errors.push(SpecValidationError::invalid(
                    field.clone(),
                    method,
                    not_in_slice_message(&HTTP_METHODS),
                ));
            }
            if !found.insert(method.as_str()) {
                errors.push(SpecValidationError::invalid(
                    field,
                    method,
                    "method listed more than once.",
                ));
            }
        }
        errors
    }

    fn to_consul(&self) -> Value {
        json!({
            "PathExact": self.path_exact,
            "PathPrefix": self.path_prefix,
            "PathRegex": self.path_regex,
            "Methods": self.methods,
        })
    }
}

impl SourceIntention {
    fn to_consul(&self) -> Value {
        let permissions: Vec<Value> = self
            .permissions
            .iter()
            .map(|p| {
                json!({
                    "Action": p.action,
                    "HTTP": p.http.as_ref().map(IntentionHttpPermission::to_consul),
                })
            })
            .collect();
        json!({
            "Name": self.name,
            "Namespace": self.namespace,
            "Partition": self.partition,
            "Peer": self.peer,
            "Action": self.action,
            "Permissions": permissions,
            "Description": self.description,
        })
    }
}

/// Sort sources so that ordering differences do not count as drift.
fn sort_sources(entry: &mut ConfigEntry) {
    if let Some(Value::Array(sources)) = entry.body.get_mut("Sources") {
        for source in sources.iter_mut() {
            if let Value::Object(obj) = source {
                for field in COMPUTED_SOURCE_FIELDS {
                    obj.remove(field);
                }
            }
            *source = normalized(source);
        }
        sources.sort_by_cached_key(|s| s.to_string());
    }
}

impl ConfigEntryResource for ServiceIntentions {
    fn kube_kind(&self) -> &'static str {
        SERVICE_INTENTIONS_KUBE_KIND
    }

    fn consul_kind(&self) -> &'static str {
        SERVICE_INTENTIONS_CONSUL_KIND
    }

    fn consul_name(&self) -> String {
        self.spec.destination.name.clone()
    }

    /// The destination namespace, falling back to the resource's namespace.
    fn consul_mirroring_ns(&self) -> String {
        if self.spec.destination.namespace.is_empty() {
            self.namespace().unwrap_or_default()
        } else {
            self.spec.destination.namespace.clone()
        }
    }

    /// Wildcard destinations would target many services at once.
    fn needs_virtual_ip(&self) -> bool {
        !self.spec.destination.name.contains('*') && !self.spec.destination.namespace.contains('*')
    }

    fn to_consul(&self, datacenter: &str) -> ConfigEntry {
        let sources: Vec<Value> = self.spec.sources.iter().map(SourceIntention::to_consul).collect();
        let mut entry = ConfigEntry::new(
            self.consul_kind(),
            &self.consul_name(),
            datacenter,
            json!({ "Sources": sources }),
        );
        entry.namespace = self.spec.destination.namespace.clone();
        entry
    }

    fn matches_consul(&self, candidate: &ConfigEntry) -> bool {
        let mut desired = self.to_consul("");
        let mut candidate = candidate.clone();
        sort_sources(&mut desired);
        sort_sources(&mut candidate);
        desired.equivalent(&candidate, &[])
    }

    fn validate(&self, tenancy: &TenancyConfig) -> Result<(), Vec<SpecValidationError>> {
        let spec = &self.spec;
        let mut errors = Vec::new();

        if spec.sources.is_empty() {
            errors.push(SpecValidationError::required(
                "spec.sources",
                "at least one source must be specified",
            ));
        }
        for (i, source) in spec.sources.iter().enumerate() {
            let path = format!("spec.sources[{}]", i);
            if !source.permissions.is_empty() && !source.action.is_empty() {
                errors.push(SpecValidationError::invalid(
                    path.clone(),
                    serde_json::to_string(source).unwrap_or_default(),
                    "action and permissions are mutually exclusive and only one of them can be specified",
                ));
            } else if source.permissions.is_empty() {
                errors.extend(validate_action(&source.action, &path));
            } else {
                for (j, permission) in source.permissions.iter().enumerate() {
                    let perm_path = format!("{}.permissions[{}]", path, j);
                    errors.extend(validate_action(&permission.action, &perm_path));
                    if let Some(http) = &permission.http {
                        errors.extend(http.validate(&perm_path));
                    }
                }
            }

            if !tenancy.enable_consul_namespaces && !source.namespace.is_empty() {
                errors.push(SpecValidationError::invalid(
                    format!("{}.namespace", path),
                    &source.namespace,
                    "Consul Enterprise namespaces must be enabled to set source.namespace",
                ));
            }
            if !tenancy.enable_partitions && !source.partition.is_empty() {
                errors.push(SpecValidationError::invalid(
                    format!("{}.partition", path),
                    &source.partition,
                    "Consul Enterprise Admin Partitions must be enabled to set source.partition",
                ));
            }
            if !source.peer.is_empty() && !source.partition.is_empty() {
                errors.push(SpecValidationError::invalid(
                    path.clone(),
                    &source.name,
                    "Both source.peer and source.partition cannot be set.",
                ));
            }
        }
        if !tenancy.enable_consul_namespaces && !spec.destination.namespace.is_empty() {
            errors.push(SpecValidationError::invalid(
                "spec.destination.namespace",
                &spec.destination.namespace,
                "Consul Enterprise namespaces must be enabled to set destination.namespace",
            ));
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
