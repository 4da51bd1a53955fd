//! Unit tests for config entry kinds
//!
//! Covers `validate()`, the Consul projection and the drift comparison of
//! each kind.

#[cfg(test)]
mod service_defaults {
    use serde_json::json;

    use crate::consul::{ConfigEntry, DATACENTER_KEY, SOURCE_KEY};
    use crate::controller::{ConfigEntryResource, TenancyConfig};
    use crate::crd::{
        MeshGateway, ServiceDefaults, ServiceDefaultsDestination, ServiceDefaultsSpec, Upstream,
        Upstreams,
    };

    fn service_defaults(spec: ServiceDefaultsSpec) -> ServiceDefaults {
        let mut sd = ServiceDefaults::new("web", spec);
        sd.metadata.namespace = Some("team-a".to_string());
        sd
    }

    #[test]
    fn test_to_consul_stamps_ownership() {
        let sd = service_defaults(ServiceDefaultsSpec {
            protocol: "http".to_string(),
            ..Default::default()
        });
        let entry = sd.to_consul("dc1");
        assert_eq!(entry.kind, "service-defaults");
        assert_eq!(entry.name, "web");
        assert_eq!(entry.meta.get(SOURCE_KEY).map(String::as_str), Some("kubernetes"));
        assert_eq!(entry.meta.get(DATACENTER_KEY).map(String::as_str), Some("dc1"));
        assert_eq!(entry.body["Protocol"], "http");
        assert!(entry.namespace.is_empty());
    }

    #[test]
    fn test_matches_consul_ignores_meta_and_indexes() {
        let sd = service_defaults(ServiceDefaultsSpec {
            protocol: "http".to_string(),
            ..Default::default()
        });
        let mut remote = sd.to_consul("other-dc");
        remote.namespace = "team-a".to_string();
        remote.create_index = 3;
        remote.modify_index = 9;
        assert!(sd.matches_consul(&remote));
    }

    #[test]
    fn test_matches_consul_detects_drift() {
        let sd = service_defaults(ServiceDefaultsSpec {
            protocol: "http".to_string(),
            ..Default::default()
        });
        let remote: ConfigEntry = serde_json::from_value(json!({
            "Kind": "service-defaults",
            "Name": "web",
            "Protocol": "tcp"
        }))
        .unwrap();
        assert!(!sd.matches_consul(&remote));
    }

    #[test]
    fn test_matches_consul_default_upstream_namespace() {
        let sd = service_defaults(ServiceDefaultsSpec {
            upstream_config: Some(Upstreams {
                defaults: None,
                overrides: vec![Upstream {
                    name: "db".to_string(),
                    connect_timeout_ms: 500,
                    ..Default::default()
                }],
            }),
            ..Default::default()
        });
        let remote: ConfigEntry = serde_json::from_value(json!({
            "Kind": "service-defaults",
            "Name": "web",
            "UpstreamConfig": {
                "Overrides": [{"Name": "db", "Namespace": "default", "Partition": "default", "ConnectTimeoutMs": 500}]
            }
        }))
        .unwrap();
        assert!(sd.matches_consul(&remote));
    }

    #[test]
    fn test_validate_accepts_minimal_spec() {
        let sd = service_defaults(ServiceDefaultsSpec {
            protocol: "grpc".to_string(),
            ..Default::default()
        });
        assert!(sd.validate(&TenancyConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_collects_multiple_errors() {
        let sd = service_defaults(ServiceDefaultsSpec {
            protocol: "udp".to_string(),
            mesh_gateway: MeshGateway {
                mode: "sideways".to_string(),
            },
            max_inbound_connections: -1,
            balance_inbound_connections: "round_robin".to_string(),
            ..Default::default()
        });
        let errors = sd.validate(&TenancyConfig::default()).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"spec.protocol"));
        assert!(fields.contains(&"spec.meshGateway.mode"));
        assert!(fields.contains(&"spec.maxInboundConnections"));
        assert!(fields.contains(&"spec.balanceInboundConnections"));
    }

    #[test]
    fn test_validate_upstream_partition_requires_partitions() {
        let sd = service_defaults(ServiceDefaultsSpec {
            upstream_config: Some(Upstreams {
                defaults: None,
                overrides: vec![Upstream {
                    name: "db".to_string(),
                    partition: "p1".to_string(),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        });
        assert!(sd.validate(&TenancyConfig::default()).is_err());

        let tenancy = TenancyConfig {
            enable_partitions: true,
            ..Default::default()
        };
        assert!(sd.validate(&tenancy).is_ok());
    }

    #[test]
    fn test_validate_destination() {
        let sd = service_defaults(ServiceDefaultsSpec {
            destination: Some(ServiceDefaultsDestination {
                addresses: vec![
                    "api.example.com".to_string(),
                    "10.0.0.1".to_string(),
                    "10.0.0.1".to_string(),
                    "bad_host!".to_string(),
                ],
                port: 0,
            }),
            ..Default::default()
        });
        let errors = sd.validate(&TenancyConfig::default()).unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}

#[cfg(test)]
mod service_splitter {
    use crate::controller::{ConfigEntryResource, TenancyConfig};
    use crate::crd::{ServiceSplit, ServiceSplitter, ServiceSplitterSpec};

    fn splitter(weights: &[f32]) -> ServiceSplitter {
        let splits = weights
            .iter()
            .enumerate()
            .map(|(i, w)| ServiceSplit {
                weight: *w,
                service_subset: format!("v{}", i + 1),
                ..Default::default()
            })
            .collect();
        let mut s = ServiceSplitter::new("web", ServiceSplitterSpec { splits });
        s.metadata.namespace = Some("default".to_string());
        s
    }

    #[test]
    fn test_validate_weights_must_sum_to_100() {
        assert!(splitter(&[50.0, 50.0]).validate(&TenancyConfig::default()).is_ok());

        let errors = splitter(&[50.0, 40.0])
            .validate(&TenancyConfig::default())
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "spec.splits");
        assert!(errors[0].message.contains("adds up to 90.000000"));
    }

    #[test]
    fn test_validate_weight_range() {
        let errors = splitter(&[0.001, 99.999])
            .validate(&TenancyConfig::default())
            .unwrap_err();
        assert!(errors.iter().any(|e| e.field == "spec.splits[0].weight"));
    }

    #[test]
    fn test_validate_namespace_requires_enterprise() {
        let mut s = splitter(&[100.0]);
        s.spec.splits[0].namespace = "other".to_string();
        assert!(s.validate(&TenancyConfig::default()).is_err());

        let tenancy = TenancyConfig {
            enable_consul_namespaces: true,
            ..Default::default()
        };
        assert!(s.validate(&tenancy).is_ok());
    }

    #[test]
    fn test_matches_consul_default_namespace() {
        let s = splitter(&[90.0, 10.0]);
        let mut remote = s.to_consul("dc1");
        if let Some(serde_json::Value::Array(splits)) = remote.body.get_mut("Splits") {
            for split in splits {
                split["Namespace"] = serde_json::json!("default");
            }
        }
        assert!(s.matches_consul(&remote));

        let other = splitter(&[80.0, 20.0]);
        assert!(!s.matches_consul(&other.to_consul("dc1")));
    }
}

#[cfg(test)]
mod proxy_defaults {
    use serde_json::json;

    use crate::controller::{ConfigEntryResource, TenancyConfig};
    use crate::crd::{AccessLogs, ProxyDefaults, ProxyDefaultsSpec};

    fn proxy_defaults(name: &str, spec: ProxyDefaultsSpec) -> ProxyDefaults {
        let mut pd = ProxyDefaults::new(name, spec);
        pd.metadata.namespace = Some("team-a".to_string());
        pd
    }

    #[test]
    fn test_is_global_resource() {
        let pd = proxy_defaults("global", ProxyDefaultsSpec::default());
        assert!(pd.consul_global_resource());
        assert_eq!(pd.consul_mirroring_ns(), "default");
        assert_eq!(pd.to_consul("dc1").name, "global");
    }

    #[test]
    fn test_validate_name_must_be_global() {
        let pd = proxy_defaults("proxy", ProxyDefaultsSpec::default());
        let errors = pd.validate(&TenancyConfig::default()).unwrap_err();
        assert_eq!(errors[0].field, "metadata.name");
    }

    #[test]
    fn test_validate_config_and_access_logs() {
        let pd = proxy_defaults(
            "global",
            ProxyDefaultsSpec {
                config: Some(json!(["not", "a", "map"])),
                access_logs: Some(AccessLogs {
                    enabled: true,
                    type_: "file".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let errors = pd.validate(&TenancyConfig::default()).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["spec.config", "spec.accessLogs.path"]);
    }

    #[test]
    fn test_config_passthrough_matches() {
        let pd = proxy_defaults(
            "global",
            ProxyDefaultsSpec {
                config: Some(json!({"envoy_prometheus_bind_addr": "0.0.0.0:9102"})),
                ..Default::default()
            },
        );
        let remote = pd.to_consul("dc1");
        assert_eq!(
            remote.body["Config"]["envoy_prometheus_bind_addr"],
            "0.0.0.0:9102"
        );
        assert!(pd.matches_consul(&remote));
    }
}

#[cfg(test)]
mod service_intentions {
    use serde_json::json;

    use crate::consul::ConfigEntry;
    use crate::controller::{ConfigEntryResource, TenancyConfig};
    use crate::crd::{
        IntentionDestination, IntentionHttpPermission, IntentionPermission, ServiceIntentions,
        ServiceIntentionsSpec, SourceIntention,
    };

    fn source(name: &str, action: &str) -> SourceIntention {
        SourceIntention {
            name: name.to_string(),
            action: action.to_string(),
            ..Default::default()
        }
    }

    fn intentions(dest_name: &str, dest_ns: &str, sources: Vec<SourceIntention>) -> ServiceIntentions {
        let mut ixn = ServiceIntentions::new(
            "web-intentions",
            ServiceIntentionsSpec {
                destination: IntentionDestination {
                    name: dest_name.to_string(),
                    namespace: dest_ns.to_string(),
                },
                sources,
            },
        );
        ixn.metadata.namespace = Some("team-a".to_string());
        ixn
    }

    #[test]
    fn test_consul_identity_follows_destination() {
        let ixn = intentions("web", "payments", vec![source("api", "allow")]);
        assert_eq!(ixn.consul_name(), "web");
        assert_eq!(ixn.kubernetes_name(), "web-intentions");
        assert_eq!(ixn.consul_mirroring_ns(), "payments");

        let entry = ixn.to_consul("dc1");
        assert_eq!(entry.name, "web");
        assert_eq!(entry.namespace, "payments");
    }

    #[test]
    fn test_mirroring_ns_falls_back_to_resource_namespace() {
        let ixn = intentions("web", "", vec![source("api", "allow")]);
        assert_eq!(ixn.consul_mirroring_ns(), "team-a");
    }

    #[test]
    fn test_needs_virtual_ip_skips_wildcards() {
        assert!(intentions("web", "", vec![]).needs_virtual_ip());
        assert!(!intentions("*", "", vec![]).needs_virtual_ip());
        assert!(!intentions("web", "*", vec![]).needs_virtual_ip());
    }

    #[test]
    fn test_matches_consul_ignores_order_and_computed_fields() {
        let ixn = intentions("web", "", vec![source("api", "allow"), source("batch", "deny")]);
        let remote: ConfigEntry = serde_json::from_value(json!({
            "Kind": "service-intentions",
            "Name": "web",
            "Sources": [
                {"Name": "batch", "Action": "deny", "Precedence": 9, "Type": "consul"},
                {"Name": "api", "Action": "allow", "Precedence": 9, "Type": "consul"}
            ]
        }))
        .unwrap();
        assert!(ixn.matches_consul(&remote));

        let changed = intentions("web", "", vec![source("api", "deny"), source("batch", "deny")]);
        assert!(!changed.matches_consul(&remote));
    }

    #[test]
    fn test_validate_requires_sources() {
        let errors = intentions("web", "", vec![])
            .validate(&TenancyConfig::default())
            .unwrap_err();
        assert_eq!(errors[0].field, "spec.sources");
        assert!(errors[0].value.is_none());
    }

    #[test]
    fn test_validate_action_and_permissions_exclusive() {
        let mut s = source("api", "allow");
        s.permissions = vec![IntentionPermission {
            action: "allow".to_string(),
            http: None,
        }];
        let errors = intentions("web", "", vec![s])
            .validate(&TenancyConfig::default())
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "spec.sources[0]");
    }

    #[test]
    fn test_validate_http_permissions() {
        let mut s = source("api", "");
        s.permissions = vec![IntentionPermission {
            action: "allow".to_string(),
            http: Some(IntentionHttpPermission {
                path_exact: "/health".to_string(),
                path_prefix: "api".to_string(),
                methods: vec!["GET".to_string(), "GET".to_string(), "FETCH".to_string()],
                ..Default::default()
            }),
        }];
        let errors = intentions("web", "", vec![s])
            .validate(&TenancyConfig::default())
            .unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"spec.sources[0].permissions[0].pathPrefix"));
        assert!(fields.contains(&"spec.sources[0].permissions[0]"));
        assert!(fields.contains(&"spec.sources[0].permissions[0].methods[1]"));
        assert!(fields.contains(&"spec.sources[0].permissions[0].methods[2]"));
    }

    #[test]
    fn test_validate_destination_namespace_requires_enterprise() {
        let ixn = intentions("web", "payments", vec![source("api", "allow")]);
        assert!(ixn.validate(&TenancyConfig::default()).is_err());

        let tenancy = TenancyConfig {
            enable_consul_namespaces: true,
            ..Default::default()
        };
        assert!(ixn.validate(&tenancy).is_ok());
    }
}
