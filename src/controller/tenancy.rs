//! Mapping of Kubernetes namespaces onto Consul namespaces and partitions

use crate::consul::WILDCARD_NAMESPACE;

/// Namespace and partition settings of this operator instance. Immutable
/// after startup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TenancyConfig {
    /// Consul Enterprise namespaces are in use
    pub enable_consul_namespaces: bool,
    /// Namespace every entry goes to when mirroring is off
    pub consul_destination_namespace: String,
    /// Mirror each Kubernetes namespace to a Consul namespace of the same name
    pub enable_ns_mirroring: bool,
    /// Prefix prepended to mirrored namespace names
    pub ns_mirroring_prefix: String,
    /// Consul Enterprise admin partitions are in use
    pub enable_partitions: bool,
    /// Partition every entry is written to when partitions are enabled
    pub consul_partition: String,
}

/// Destination of one config entry in Consul.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tenancy {
    pub namespace: String,
    pub partition: String,
}

/// Consul namespace for a Kubernetes namespace, ignoring the entry itself.
pub fn consul_namespace(config: &TenancyConfig, kube_namespace: &str) -> String {
    if !config.enable_consul_namespaces {
        return String::new();
    }
    if config.enable_ns_mirroring {
        format!("{}{}", config.ns_mirroring_prefix, kube_namespace)
    } else {
        config.consul_destination_namespace.clone()
    }
}

/// Namespace a config entry is read from and written to.
///
/// An entry that names its own namespace wins. Global resources and the
/// wildcard namespace are passed through unchanged.
pub fn resolve_namespace(
    config: &TenancyConfig,
    entry_namespace: &str,
    mirroring_ns: &str,
    is_global: bool,
) -> String {
    if !config.enable_consul_namespaces {
        return String::new();
    }
    if !entry_namespace.is_empty() {
        return entry_namespace.to_string();
    }
    if !is_global && mirroring_ns != WILDCARD_NAMESPACE {
        return consul_namespace(config, mirroring_ns);
    }
    mirroring_ns.to_string()
}

/// Full destination of an entry: resolved namespace plus the configured
/// partition (empty when partitions are disabled).
pub fn destination_tenancy(
    config: &TenancyConfig,
    entry_namespace: &str,
    mirroring_ns: &str,
    is_global: bool,
) -> Tenancy {
    let partition = if config.enable_partitions {
        config.consul_partition.clone()
    } else {
        String::new()
    };
    Tenancy {
        namespace: resolve_namespace(config, entry_namespace, mirroring_ns, is_global),
        partition,
    }
}
