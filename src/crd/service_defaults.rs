//! ServiceDefaults Custom Resource Definition
//!
//! Service-wide defaults (protocol, upstream limits, mesh gateway mode) for
//! the Consul service with the same name as the resource.

use std::net::IpAddr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::types::{
    default_tenancy_to_empty, is_zero, not_in_slice_message, validate_mutual_tls_mode,
    validate_proxy_mode, ConfigEntryStatus, Expose, MeshGateway, SpecValidationError,
    TransparentProxy,
};
use crate::consul::ConfigEntry;
use crate::controller::{ConfigEntryResource, TenancyConfig};

pub const SERVICE_DEFAULTS_KUBE_KIND: &str = "servicedefaults";
pub const SERVICE_DEFAULTS_CONSUL_KIND: &str = "service-defaults";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "ServiceDefaults",
    namespaced,
    status = "ConfigEntryStatus",
    shortname = "service-defaults",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"Last Synced","type":"date","jsonPath":".status.lastSyncedTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefaultsSpec {
    /// One of "tcp", "http", "http2" or "grpc"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    /// Rejected by validation; transparent proxy mode is set by annotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparent_proxy: Option<TransparentProxy>,
    #[serde(default, rename = "mutualTLSMode", skip_serializing_if = "String::is_empty")]
    pub mutual_tls_mode: String,
    #[serde(default)]
    pub mesh_gateway: MeshGateway,
    #[serde(default)]
    pub expose: Expose,
    #[serde(default, rename = "externalSNI", skip_serializing_if = "String::is_empty")]
    pub external_sni: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_config: Option<Upstreams>,
    /// Terminating gateway destination for a service outside the mesh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<ServiceDefaultsDestination>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_inbound_connections: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub local_connect_timeout_ms: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub local_request_timeout_ms: i32,
    /// Empty or "exact_balance"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub balance_inbound_connections: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimits>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Upstreams {
    /// Applies to every upstream not listed in `overrides`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Upstream>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<Upstream>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub connect_timeout_ms: i32,
    #[serde(default)]
    pub mesh_gateway: MeshGateway,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefaultsDestination {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub port: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimits {
    #[serde(default)]
    pub instance_level: InstanceLevelRateLimits,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLevelRateLimits {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub requests_per_second: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub requests_max_burst: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteRateLimits>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteRateLimits {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_exact: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_regex: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub requests_per_second: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub requests_max_burst: i32,
}

const VALID_PROTOCOLS: [&str; 4] = ["tcp", "http", "http2", "grpc"];

enum UpstreamRole {
    Default,
    Override,
}

impl Upstream {
    fn validate(&self, path: &str, role: UpstreamRole, partitions_enabled: bool) -> Vec<SpecValidationError> {
        let mut errors = Vec::new();
        match role {
            UpstreamRole::Default => {
                for (field, value) in [
                    ("name", &self.name),
                    ("namespace", &self.namespace),
                    ("partition", &self.partition),
                    ("peer", &self.peer),
                ] {
                    if !value.is_empty() {
                        errors.push(SpecValidationError::invalid(
                            format!("{}.{}", path, field),
                            value,
                            format!("upstream.{} for a default upstream must be \"\"", field),
                        ));
                    }
                }
            }
            UpstreamRole::Override => {
                if self.name.is_empty() {
                    errors.push(SpecValidationError::invalid(
                        format!("{}.name", path),
                        &self.name,
                        "upstream.name for an override upstream cannot be \"\"",
                    ));
                }
                if !self.namespace.is_empty() && !self.peer.is_empty() {
                    errors.push(SpecValidationError::invalid(
                        path,
                        &self.name,
                        "both namespace and peer cannot be specified.",
                    ));
                }
                if !self.partition.is_empty() && !self.peer.is_empty() {
                    errors.push(SpecValidationError::invalid(
                        path,
                        &self.name,
                        "both partition and peer cannot be specified.",
                    ));
                }
            }
        }
        if !partitions_enabled && !self.partition.is_empty() {
            errors.push(SpecValidationError::invalid(
                format!("{}.partition", path),
                &self.partition,
                "Consul Enterprise Admin Partitions must be enabled to set upstream.partition",
            ));
        }
        errors.extend(self.mesh_gateway.validate(&format!("{}.meshGateway", path)));
        errors
    }

    fn to_consul(&self) -> Value {
        json!({
            "Name": self.name,
            "Namespace": self.namespace,
            "Partition": self.partition,
            "Peer": self.peer,
            "Protocol": self.protocol,
            "ConnectTimeoutMs": self.connect_timeout_ms,
            "MeshGateway": self.mesh_gateway.to_consul(),
        })
    }
}

impl ServiceDefaultsDestination {
    fn validate(&self, path: &str) -> Vec<SpecValidationError> {
        let mut errors = Vec::new();
        if self.addresses.is_empty() {
            errors.push(SpecValidationError::required(
                format!("{}.addresses", path),
                "at least one address must be define per destination",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for (i, address) in self.addresses.iter().enumerate() {
            let field = format!("{}.addresses[{}]", path, i);
            if !seen.insert(address.as_str()) {
                errors.push(SpecValidationError::invalid(field, address, "Duplicate value"));
                continue;
            }
            if !valid_endpoint_address(address) {
                errors.push(SpecValidationError::invalid(
                    field,
                    address,
                    format!("address {} is not a valid IP or hostname", address),
                ));
            }
        }
        if self.port < 1 || self.port > 65535 {
            errors.push(SpecValidationError::invalid(
                format!("{}.port", path),
                self.port,
                "invalid port number",
            ));
        }
        errors
    }
}

/// IP address or DNS name made of letters, digits, hyphens and dots.
fn valid_endpoint_address(address: &str) -> bool {
    if address.parse::<IpAddr>().is_ok() {
        return true;
    }
    let name = address.trim_end_matches('.');
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl InstanceLevelRateLimits {
    fn validate(&self, path: &str) -> Vec<SpecValidationError> {
        let mut errors = Vec::new();
        let mut rate_limit_set = self.requests_per_second > 0;

        if self.requests_per_second < 0 {
            errors.push(SpecValidationError::invalid(
                format!("{}.requestsPerSecond", path),
                self.requests_per_second,
                "RequestsPerSecond must be positive",
            ));
        }
        if self.requests_per_second == 0 && self.requests_max_burst > 0 {
            errors.push(SpecValidationError::invalid(
                format!("{}.requestsPerSecond", path),
                self.requests_per_second,
                "RequestsPerSecond must be greater than 0 if RequestsMaxBurst is set",
            ));
        }
        if self.requests_max_burst < 0 {
            errors.push(SpecValidationError::invalid(
                format!("{}.requestsMaxBurst", path),
                self.requests_max_burst,
                "RequestsMaxBurst must be positive",
            ));
        }

        for (i, route) in self.routes.iter().enumerate() {
            let field = format!("{}.routes[{}]", path, i);
            let matchers = [&route.path_exact, &route.path_prefix, &route.path_regex]
                .iter()
                .filter(|m| !m.is_empty())
                .count();
            if matchers != 1 {
                errors.push(SpecValidationError::required(
                    field.clone(),
                    "Route must define exactly one of PathExact, PathPrefix, or PathRegex",
                ));
            }
            rate_limit_set = rate_limit_set || route.requests_per_second > 0;
            if route.requests_per_second <= 0 {
                errors.push(SpecValidationError::invalid(
                    format!("{}.requestsPerSecond", field),
                    route.requests_per_second,
                    "RequestsPerSecond must be greater than 0",
                ));
            }
            if route.requests_max_burst < 0 {
                errors.push(SpecValidationError::invalid(
                    format!("{}.requestsMaxBurst", field),
                    route.requests_max_burst,
                    "RequestsMaxBurst must be positive",
                ));
            }
        }

        if !rate_limit_set {
            errors.push(SpecValidationError::invalid(
                format!("{}.requestsPerSecond", path),
                self.requests_per_second,
                "At least one of top-level or route-level RequestsPerSecond must be set",
            ));
        }
        errors
    }
}

impl ServiceDefaults {
    fn consul_body(&self) -> Value {
        let spec = &self.spec;
        let upstream_config = spec.upstream_config.as_ref().map(|u| {
            json!({
                "Defaults": u.defaults.as_ref().map(Upstream::to_consul),
                "Overrides": u.overrides.iter().map(Upstream::to_consul).collect::<Vec<_>>(),
            })
        });
        let destination = spec.destination.as_ref().map(|d| {
            json!({ "Addresses": d.addresses, "Port": d.port })
        });
        let rate_limits = spec.rate_limits.as_ref().map(|r| {
            let routes: Vec<Value> = r
                .instance_level
                .routes
                .iter()
                .map(|route| {
                    json!({
                        "PathExact": route.path_exact,
                        "PathPrefix": route.path_prefix,
                        "PathRegex": route.path_regex,
                        "RequestsPerSecond": route.requests_per_second,
                        "RequestsMaxBurst": route.requests_max_burst,
                    })
                })
                .collect();
            json!({
                "InstanceLevel": {
                    "RequestsPerSecond": r.instance_level.requests_per_second,
                    "RequestsMaxBurst": r.instance_level.requests_max_burst,
                    "Routes": routes,
                }
            })
        });

        json!({
            "Protocol": spec.protocol,
            "Mode": spec.mode,
            "TransparentProxy": spec.transparent_proxy.as_ref().map(TransparentProxy::to_consul),
            "MutualTLSMode": spec.mutual_tls_mode,
            "MeshGateway": spec.mesh_gateway.to_consul(),
            "Expose": spec.expose.to_consul(),
            "ExternalSNI": spec.external_sni,
            "UpstreamConfig": upstream_config,
            "Destination": destination,
            "MaxInboundConnections": spec.max_inbound_connections,
            "LocalConnectTimeoutMs": spec.local_connect_timeout_ms,
            "LocalRequestTimeoutMs": spec.local_request_timeout_ms,
            "BalanceInboundConnections": spec.balance_inbound_connections,
            "RateLimits": rate_limits,
        })
    }
}

impl ConfigEntryResource for ServiceDefaults {
    fn kube_kind(&self) -> &'static str {
        SERVICE_DEFAULTS_KUBE_KIND
    }

    fn consul_kind(&self) -> &'static str {
        SERVICE_DEFAULTS_CONSUL_KIND
    }

    fn needs_virtual_ip(&self) -> bool {
        true
    }

    fn to_consul(&self, datacenter: &str) -> ConfigEntry {
        ConfigEntry::new(
            self.consul_kind(),
            &self.consul_name(),
            datacenter,
            self.consul_body(),
        )
    }

    fn matches_consul(&self, candidate: &ConfigEntry) -> bool {
        let mut desired = self.to_consul("");
        let mut candidate = candidate.clone();
        for entry in [&mut desired, &mut candidate] {
            if let Some(Value::Object(upstreams)) = entry.body.get_mut("UpstreamConfig") {
                default_tenancy_to_empty(upstreams, "Overrides", &["Namespace", "Partition"]);
            }
        }
        desired.equivalent(&candidate, &[])
    }

    fn validate(&self, tenancy: &TenancyConfig) -> Result<(), Vec<SpecValidationError>> {
        let spec = &self.spec;
        let mut errors = Vec::new();

        if !spec.protocol.is_empty() && !VALID_PROTOCOLS.contains(&spec.protocol.as_str()) {
            errors.push(SpecValidationError::invalid(
                "spec.protocol",
                &spec.protocol,
                not_in_slice_message(&VALID_PROTOCOLS),
            ));
        }
        errors.extend(spec.mesh_gateway.validate("spec.meshGateway"));
        if let Some(tp) = &spec.transparent_proxy {
            errors.extend(tp.validate("spec.transparentProxy"));
        }
        errors.extend(validate_mutual_tls_mode(&spec.mutual_tls_mode, "spec.mutualTLSMode"));
        errors.extend(validate_proxy_mode(&spec.mode, "spec.mode"));
        if let Some(destination) = &spec.destination {
            errors.extend(destination.validate("spec.destination"));
        }
        for (field, value) in [
            ("maxInboundConnections", spec.max_inbound_connections),
            ("localConnectTimeoutMs", spec.local_connect_timeout_ms),
            ("localRequestTimeoutMs", spec.local_request_timeout_ms),
        ] {
            if value < 0 {
                errors.push(SpecValidationError::invalid(
                    format!("spec.{}", field),
                    value,
                    format!("{} must be > 0", field),
                ));
            }
        }
        if !spec.balance_inbound_connections.is_empty()
            && spec.balance_inbound_connections != "exact_balance"
        {
            errors.push(SpecValidationError::invalid(
                "spec.balanceInboundConnections",
                &spec.balance_inbound_connections,
                "BalanceInboundConnections must be an empty string or exact_balance",
            ));
        }
        if let Some(upstreams) = &spec.upstream_config {
            if let Some(defaults) = &upstreams.defaults {
                errors.extend(defaults.validate(
                    "spec.upstreamConfig.defaults",
                    UpstreamRole::Default,
                    tenancy.enable_partitions,
                ));
            }
            for (i, upstream) in upstreams.overrides.iter().enumerate() {
                errors.extend(upstream.validate(
                    &format!("spec.upstreamConfig.overrides[{}]", i),
                    UpstreamRole::Override,
                    tenancy.enable_partitions,
                ));
            }
        }
        errors.extend(spec.expose.validate("spec.expose"));
        if let Some(rate_limits) = &spec.rate_limits {
            errors.extend(rate_limits.instance_level.validate("spec.rateLimits.instanceLevel"));
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
