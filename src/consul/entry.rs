//! Consul config entries as exchanged with `/v1/config`
//!
//! Only the header fields the reconciler reasons about are typed; the
//! kind-specific body is carried as JSON in [`ConfigEntry::body`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Meta key marking an entry as written by a Kubernetes integration.
pub const SOURCE_KEY: &str = "external-source";

/// Value stored under [`SOURCE_KEY`].
pub const SOURCE_VALUE: &str = "kubernetes";

/// Meta key holding the datacenter of the operator instance that owns the entry.
pub const DATACENTER_KEY: &str = "consul.hashicorp.com/source-datacenter";

/// A config entry in Consul's wire format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigEntry {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub create_index: u64,
    #[serde(default, skip_serializing)]
    pub modify_index: u64,
    /// Kind-specific fields, e.g. `Protocol` or `Splits`.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// Ownership metadata stamped on every entry written for `datacenter`.
pub fn ownership_meta(datacenter: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SOURCE_KEY.to_string(), SOURCE_VALUE.to_string()),
        (DATACENTER_KEY.to_string(), datacenter.to_string()),
    ])
}

impl ConfigEntry {
    /// Build an entry stamped with ownership meta for `datacenter`. A body
    /// that is not a JSON object yields an empty body.
    pub fn new(kind: &str, name: &str, datacenter: &str, body: Value) -> Self {
        let body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            meta: ownership_meta(datacenter),
            body,
            ..Default::default()
        }
    }

    /// Datacenter recorded in the ownership meta, empty if absent.
    pub fn source_datacenter(&self) -> &str {
        self.meta.get(DATACENTER_KEY).map(String::as_str).unwrap_or("")
    }

    pub fn is_managed_by_kubernetes(&self) -> bool {
        self.meta.get(SOURCE_KEY).map(String::as_str) == Some(SOURCE_VALUE)
    }

    /// Owned iff both ownership keys match this operator instance.
    pub fn is_owned_by(&self, datacenter: &str) -> bool {
        self.is_managed_by_kubernetes() && self.source_datacenter() == datacenter
    }

    /// Structural comparison of kind, name and body. Namespace, partition,
    /// meta and raft indexes are ignored, as are the `ignored` body keys at
    /// any depth. Absent and zero values compare equal.
    pub fn equivalent(&self, other: &ConfigEntry, ignored: &[&str]) -> bool {
        self.kind.eq_ignore_ascii_case(&other.kind)
            && self.name == other.name
            && normalize_object(&self.body, ignored) == normalize_object(&other.body, ignored)
    }
}

/// Canonical form of a JSON value with zero values stripped, suitable for
/// order-insensitive comparisons of array elements.
pub fn normalized(value: &Value) -> Value {
    normalize(value, &[]).unwrap_or(Value::Null)
}

fn normalize_object(map: &Map<String, Value>, ignored: &[&str]) -> Map<String, Value> {
    map.iter()
        .filter(|(k, _)| !ignored.contains(&k.as_str()))
        .filter_map(|(k, v)| normalize(v, ignored).map(|v| (k.clone(), v)))
        .collect()
}

/// Strip zero values so that omitted fields and explicit defaults agree.
/// Numbers are reduced to integer or single precision form because Consul
/// stores weights and ratios as 32-bit floats.
fn normalize(value: &Value, ignored: &[&str]) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::Number(n) => {
            let f = n.as_f64()?;
            if f == 0.0 {
                None
            } else if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                Some(Value::from(f as i64))
            } else {
                Some(Value::from((f as f32) as f64))
            }
        }
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .map(|v| normalize(v, ignored).unwrap_or(Value::Null))
                .collect(),
        )),
        Value::Object(map) => {
            let map = normalize_object(map, ignored);
            if map.is_empty() {
                None
            } else {
                Some(Value::Object(map))
            }
        }
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(body: Value) -> ConfigEntry {
        ConfigEntry {
            kind: "service-defaults".to_string(),
            name: "web".to_string(),
            body: body.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ownership() {
        let mut e = entry(json!({}));
        assert!(!e.is_owned_by("dc1"));
        assert_eq!(e.source_datacenter(), "");

        e.meta = ownership_meta("dc1");
        assert!(e.is_owned_by("dc1"));
        assert!(!e.is_owned_by("dc2"));

        e.meta.remove(SOURCE_KEY);
        assert!(!e.is_owned_by("dc1"));
    }

    #[test]
    fn test_equivalent_ignores_zero_values_and_meta() {
        let desired = entry(json!({"Protocol": "http", "MaxInboundConnections": 0, "Expose": {}}));
        let mut remote = entry(json!({"Protocol": "http"}));
        remote.meta = ownership_meta("dc9");
        remote.namespace = "ns".to_string();
        remote.modify_index = 42;
        assert!(desired.equivalent(&remote, &[]));

        let changed = entry(json!({"Protocol": "grpc"}));
        assert!(!desired.equivalent(&changed, &[]));
    }

    #[test]
    fn test_equivalent_float_precision() {
        let desired = entry(json!({"Splits": [{"Weight": 33.33_f32 as f64}, {"Weight": 66.67_f32 as f64}]}));
        let remote = entry(json!({"Splits": [{"Weight": 33.33}, {"Weight": 66.67}]}));
        assert!(desired.equivalent(&remote, &[]));

        let whole = entry(json!({"Splits": [{"Weight": 100.0}]}));
        let remote_whole = entry(json!({"Splits": [{"Weight": 100}]}));
        assert!(whole.equivalent(&remote_whole, &[]));
    }

    #[test]
    fn test_equivalent_ignored_keys() {
        let desired = entry(json!({"Sources": [{"Name": "api", "Action": "allow"}]}));
        let remote = entry(
            json!({"Sources": [{"Name": "api", "Action": "allow", "Precedence": 9, "Type": "consul"}]}),
        );
        assert!(!desired.equivalent(&remote, &[]));
        assert!(desired.equivalent(&remote, &["Precedence", "Type"]));
    }

    #[test]
    fn test_deserialize_collects_body() {
        let raw = json!({
            "Kind": "service-defaults",
            "Name": "web",
            "Protocol": "http",
            "Meta": {"external-source": "kubernetes"},
            "CreateIndex": 5,
            "ModifyIndex": 7
        });
        let e: ConfigEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(e.modify_index, 7);
        assert_eq!(e.body.get("Protocol"), Some(&json!("http")));
        assert!(!e.body.contains_key("ModifyIndex"));

        let out = serde_json::to_value(&e).unwrap();
        assert!(out.get("ModifyIndex").is_none());
        assert_eq!(out["Protocol"], "http");
    }
}
