//! Finalizer handling for config entry resources
//!
//! The finalizer holds a resource in the API server until the matching
//! Consul config entry has been deleted (or deliberately left alone because
//! another datacenter owns it).

use kube::{Resource, ResourceExt};
use serde_json::{json, Value};

/// Finalizer name used to protect config entry resources
pub const FINALIZER_NAME: &str = "finalizers.consul.hashicorp.com";

/// Check if the object carries `name`
pub fn has_finalizer<K: Resource>(obj: &K, name: &str) -> bool {
    obj.finalizers().iter().any(|f| f == name)
}

/// Add `name` to the object's finalizers if not already present
pub fn add_finalizer<K: Resource>(obj: &mut K, name: &str) {
    if !has_finalizer(obj, name) {
        obj.finalizers_mut().push(name.to_string());
    }
}

/// Remove every copy of `name` from the object's finalizers
pub fn remove_finalizer<K: Resource>(obj: &mut K, name: &str) {
    obj.finalizers_mut().retain(|f| f != name);
}

/// A deletion timestamp means deletion was requested but finalizers are
/// still holding the object.
pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Merge patch persisting the object's current finalizers. The
/// resourceVersion turns the write into an optimistic-concurrency check.
pub fn finalizers_patch<K: Resource>(obj: &K) -> Value {
    json!({
        "metadata": {
            "finalizers": obj.finalizers(),
            "resourceVersion": obj.resource_version(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn object(finalizers: Vec<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                resource_version: Some("12".to_string()),
                finalizers: Some(finalizers.into_iter().map(String::from).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_finalizer_name() {
        assert_eq!(FINALIZER_NAME, "finalizers.consul.hashicorp.com");
    }

    #[test]
    fn test_add_finalizer_is_idempotent() {
        let mut obj = object(vec![]);
        add_finalizer(&mut obj, FINALIZER_NAME);
        add_finalizer(&mut obj, FINALIZER_NAME);
        assert_eq!(obj.finalizers(), &[FINALIZER_NAME.to_string()]);
    }

    #[test]
    fn test_remove_finalizer_keeps_others() {
        let mut obj = object(vec!["other", FINALIZER_NAME]);
        remove_finalizer(&mut obj, FINALIZER_NAME);
        assert_eq!(obj.finalizers(), &["other".to_string()]);
        assert!(!has_finalizer(&obj, FINALIZER_NAME));
    }

    #[test]
    fn test_is_being_deleted() {
        let mut obj = object(vec![]);
        assert!(!is_being_deleted(&obj));
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(is_being_deleted(&obj));
    }

    #[test]
    fn test_finalizers_patch_carries_resource_version() {
        let obj = object(vec![FINALIZER_NAME]);
        let patch = finalizers_patch(&obj);
        assert_eq!(patch["metadata"]["resourceVersion"], "12");
        assert_eq!(patch["metadata"]["finalizers"][0], FINALIZER_NAME);
    }
}
