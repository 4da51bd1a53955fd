//! Types shared by every config entry custom resource

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Condition type reporting whether the resource is in sync with Consul.
pub const CONDITION_SYNCED: &str = "Synced";

/// Status of a condition, following Kubernetes conventions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition, currently always "Synced"
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: ConditionStatus,
    /// Last time the condition transitioned (RFC 3339)
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Status shared by all config entry resources
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntryStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Last time the resource was confirmed in sync with Consul (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_time: Option<String>,
}

/// Structured validation error for a config entry spec
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    /// JSON path of the offending field, e.g. `spec.splits[0].weight`
    pub field: String,
    /// Rendered offending value; `None` for missing required fields
    pub value: Option<String>,
    pub message: String,
}

impl SpecValidationError {
    pub fn invalid(
        field: impl Into<String>,
        value: impl fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            value: Some(value.to_string()),
            message: message.into(),
        }
    }

    pub fn required(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(
                f,
                "{}: Invalid value: {:?}: {}",
                self.field, value, self.message
            ),
            None => write!(f, "{}: Required value: {}", self.field, self.message),
        }
    }
}

/// Join validation errors into a single Kubernetes-style message.
pub fn format_validation_errors(kind: &str, name: &str, errors: &[SpecValidationError]) -> String {
    let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("{} {:?} is invalid: [{}]", kind, name, details.join(", "))
}

pub(crate) fn not_in_slice_message(allowed: &[&str]) -> String {
    format!("must be one of \"{}\"", allowed.join("\", \""))
}

/// Mesh gateway mode for upstreams
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeshGateway {
    /// One of "", "none", "local" or "remote"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

impl MeshGateway {
    const MODES: [&'static str; 4] = ["", "none", "local", "remote"];

    pub(crate) fn validate(&self, path: &str) -> Option<SpecValidationError> {
        if Self::MODES.contains(&self.mode.as_str()) {
            return None;
        }
        Some(SpecValidationError::invalid(
            format!("{}.mode", path),
            &self.mode,
            not_in_slice_message(&Self::MODES),
        ))
    }

    pub(crate) fn to_consul(&self) -> Value {
        json!({ "Mode": self.mode })
    }
}

/// Transparent proxy settings
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransparentProxy {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub outbound_listener_port: i32,
    #[serde(default)]
    pub dialed_directly: bool,
}

impl TransparentProxy {
    pub(crate) fn validate(&self, path: &str) -> Option<SpecValidationError> {
        if self.outbound_listener_port == 0 {
            return None;
        }
        Some(SpecValidationError::invalid(
            format!("{}.outboundListenerPort", path),
            self.outbound_listener_port,
            "use the annotation `consul.hashicorp.com/transparent-proxy-outbound-listener-port` to configure the Outbound Listener Port",
        ))
    }

    pub(crate) fn to_consul(&self) -> Value {
        json!({
            "OutboundListenerPort": self.outbound_listener_port,
            "DialedDirectly": self.dialed_directly,
        })
    }
}

pub(crate) fn validate_proxy_mode(mode: &Option<String>, path: &str) -> Option<SpecValidationError> {
    mode.as_ref().map(|m| {
        SpecValidationError::invalid(
            path,
            m,
            "use the annotation `consul.hashicorp.com/transparent-proxy` to configure the Transparent Proxy Mode",
        )
    })
}

pub(crate) fn validate_mutual_tls_mode(mode: &str, path: &str) -> Option<SpecValidationError> {
    match mode {
        "" | "strict" | "permissive" => None,
        _ => Some(SpecValidationError::invalid(
            path,
            mode,
            "Must be one of \"\", \"strict\", or \"permissive\".",
        )),
    }
}

/// Paths exposed through the sidecar without mTLS
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Expose {
    #[serde(default)]
    pub checks: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<ExposePath>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExposePath {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub listener_port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub local_path_port: i32,
    /// "http" or "http2"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl Expose {
    const PROTOCOLS: [&'static str; 2] = ["http", "http2"];

    pub(crate) fn validate(&self, path: &str) -> Vec<SpecValidationError> {
        let mut errors = Vec::new();
        for (i, p) in self.paths.iter().enumerate() {
            let field = format!("{}.paths[{}]", path, i);
            if !p.path.is_empty() && !p.path.starts_with('/') {
                errors.push(SpecValidationError::invalid(
                    format!("{}.path", field),
                    &p.path,
                    "must begin with a '/'",
                ));
            }
            if !p.protocol.is_empty() && !Self::PROTOCOLS.contains(&p.protocol.as_str()) {
                errors.push(SpecValidationError::invalid(
                    format!("{}.protocol", field),
                    &p.protocol,
                    not_in_slice_message(&Self::PROTOCOLS),
                ));
            }
        }
        errors
    }

    pub(crate) fn to_consul(&self) -> Value {
        let paths: Vec<Value> = self
            .paths
            .iter()
            .map(|p| {
                json!({
                    "ListenerPort": p.listener_port,
                    "Path": p.path,
                    "LocalPathPort": p.local_path_port,
                    "Protocol": p.protocol,
                })
            })
            .collect();
        json!({ "Checks": self.checks, "Paths": paths })
    }
}

pub(crate) fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Replace `"default"` with `""` under `key` in every object of the array at
/// `array_key`. Consul reports the default namespace and partition
/// explicitly where the resource may have left them empty.
pub(crate) fn default_tenancy_to_empty(body: &mut serde_json::Map<String, Value>, array_key: &str, keys: &[&str]) {
    if let Some(Value::Array(items)) = body.get_mut(array_key) {
        for item in items.iter_mut() {
            if let Value::Object(obj) = item {
                for key in keys {
                    if obj.get(*key).and_then(Value::as_str) == Some("default") {
                        obj.insert((*key).to_string(), Value::String(String::new()));
                    }
                }
            }
        }
    }
}
