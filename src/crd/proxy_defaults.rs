//! ProxyDefaults Custom Resource Definition
//!
//! Global proxy configuration. Consul only accepts a single entry named
//! `global`, which always lives in the default namespace.

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::types::{
    validate_mutual_tls_mode, validate_proxy_mode, ConfigEntryStatus, Expose, MeshGateway,
    SpecValidationError, TransparentProxy,
};
use crate::consul::{ConfigEntry, DEFAULT_CONSUL_NAMESPACE};
use crate::controller::{ConfigEntryResource, TenancyConfig};

pub const PROXY_DEFAULTS_KUBE_KIND: &str = "proxydefaults";
pub const PROXY_DEFAULTS_CONSUL_KIND: &str = "proxy-defaults";

/// The only name Consul accepts for a proxy-defaults entry.
pub const PROXY_DEFAULTS_GLOBAL: &str = "global";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "ProxyDefaults",
    namespaced,
    status = "ConfigEntryStatus",
    shortname = "proxy-defaults",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"Last Synced","type":"date","jsonPath":".status.lastSyncedTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProxyDefaultsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparent_proxy: Option<TransparentProxy>,
    #[serde(default, rename = "mutualTLSMode", skip_serializing_if = "String::is_empty")]
    pub mutual_tls_mode: String,
    /// Arbitrary proxy configuration passed through to Envoy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_form_object")]
    pub config: Option<Value>,
    #[serde(default)]
    pub mesh_gateway: MeshGateway,
    #[serde(default)]
    pub expose: Expose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_logs: Option<AccessLogs>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogs {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub disable_listener_logs: bool,
    /// One of "", "stdout", "stderr" or "file"
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, rename = "jsonFormat", skip_serializing_if = "String::is_empty")]
    pub json_format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text_format: String,
}

fn free_form_object(_gen: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema
        .extensions
        .insert("x-kubernetes-preserve-unknown-fields".to_string(), json!(true));
    Schema::Object(schema)
}

impl AccessLogs {
    const TYPES: [&'static str; 4] = ["", "stdout", "stderr", "file"];

    fn validate(&self, path: &str) -> Vec<SpecValidationError> {
        let mut errors = Vec::new();
        if !Self::TYPES.contains(&self.type_.as_str()) {
            errors.push(SpecValidationError::invalid(
                format!("{}.type", path),
                &self.type_,
                "invalid access log type (must be one of \"stdout\", \"stderr\", \"file\")",
            ));
        }
        if self.type_ == "file" && self.path.is_empty() {
            errors.push(SpecValidationError::invalid(
                format!("{}.path", path),
                &self.path,
                "path must be specified when using file type access logs",
            ));
        }
        if self.type_ != "file" && !self.path.is_empty() {
            errors.push(SpecValidationError::invalid(
                format!("{}.path", path),
                &self.path,
                "path is only valid for file type access logs",
            ));
        }
        if !self.json_format.is_empty() && !self.text_format.is_empty() {
            errors.push(SpecValidationError::invalid(
                format!("{}.textFormat", path),
                &self.text_format,
                "cannot specify both access log jsonFormat and textFormat",
            ));
        }
        if !self.json_format.is_empty()
            && serde_json::from_str::<serde_json::Map<String, Value>>(&self.json_format).is_err()
        {
            errors.push(SpecValidationError::invalid(
                format!("{}.jsonFormat", path),
                &self.json_format,
                "invalid access log json",
            ));
        }
        errors
    }

    fn to_consul(&self) -> Value {
        json!({
            "Enabled": self.enabled,
            "DisableListenerLogs": self.disable_listener_logs,
            "Type": self.type_,
            "Path": self.path,
            "JSONFormat": self.json_format,
            "TextFormat": self.text_format,
        })
    }
}

impl ConfigEntryResource for ProxyDefaults {
    fn kube_kind(&self) -> &'static str {
        PROXY_DEFAULTS_KUBE_KIND
    }

    fn consul_kind(&self) -> &'static str {
        PROXY_DEFAULTS_CONSUL_KIND
    }

    fn consul_mirroring_ns(&self) -> String {
        DEFAULT_CONSUL_NAMESPACE.to_string()
    }

    fn consul_global_resource(&self) -> bool {
        true
    }

    fn to_consul(&self, datacenter: &str) -> ConfigEntry {
        let spec = &self.spec;
        ConfigEntry::new(
            self.consul_kind(),
            &self.consul_name(),
            datacenter,
            json!({
                "Mode": spec.mode,
                "TransparentProxy": spec.transparent_proxy.as_ref().map(TransparentProxy::to_consul),
                "MutualTLSMode": spec.mutual_tls_mode,
                "Config": spec.config,
                "MeshGateway": spec.mesh_gateway.to_consul(),
                "Expose": spec.expose.to_consul(),
                "AccessLogs": spec.access_logs.as_ref().map(AccessLogs::to_consul),
            }),
        )
    }

    fn matches_consul(&self, candidate: &ConfigEntry) -> bool {
        self.to_consul("").equivalent(candidate, &[])
    }

    fn validate(&self, _tenancy: &TenancyConfig) -> Result<(), Vec<SpecValidationError>> {
        let spec = &self.spec;
        let mut errors = Vec::new();

        if self.kubernetes_name() != PROXY_DEFAULTS_GLOBAL {
            errors.push(SpecValidationError::invalid(
                "metadata.name",
                self.kubernetes_name(),
                format!("proxydefaults resource name must be \"{}\"", PROXY_DEFAULTS_GLOBAL),
            ));
        }
        errors.extend(spec.mesh_gateway.validate("spec.meshGateway"));
        if let Some(tp) = &spec.transparent_proxy {
            errors.extend(tp.validate("spec.transparentProxy"));
        }
        errors.extend(validate_mutual_tls_mode(&spec.mutual_tls_mode, "spec.mutualTLSMode"));
        errors.extend(validate_proxy_mode(&spec.mode, "spec.mode"));
        if let Some(config) = &spec.config {
            if !config.is_object() {
                errors.push(SpecValidationError::invalid(
                    "spec.config",
                    config,
                    "must be valid map value",
                ));
            }
        }
        if let Some(access_logs) = &spec.access_logs {
            errors.extend(access_logs.validate("spec.accessLogs"));
        }
        errors.extend(spec.expose.validate("spec.expose"));

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
