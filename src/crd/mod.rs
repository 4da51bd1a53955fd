//! Custom Resource Definitions for Consul config entries
//!
//! Every kind lives in the `consul.hashicorp.com/v1alpha1` API group and
//! shares [`ConfigEntryStatus`].

pub mod manifest;
pub mod proxy_defaults;
pub mod service_defaults;
pub mod service_intentions;
pub mod service_splitter;
pub mod types;

#[cfg(test)]
mod tests;

pub use manifest::{validate_file, validate_manifest, ManifestReport};
pub use proxy_defaults::{AccessLogs, ProxyDefaults, ProxyDefaultsSpec, PROXY_DEFAULTS_GLOBAL};
pub use service_defaults::{
    RateLimits, ServiceDefaults, ServiceDefaultsDestination, ServiceDefaultsSpec, Upstream,
    Upstreams,
};
pub use service_intentions::{
    IntentionDestination, IntentionHttpPermission, IntentionPermission, ServiceIntentions,
    ServiceIntentionsSpec, SourceIntention,
};
pub use service_splitter::{HttpHeaderModifiers, ServiceSplit, ServiceSplitter, ServiceSplitterSpec};
pub use types::*;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

/// CRDs for every supported kind, in installation order.
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        ServiceDefaults::crd(),
        ServiceSplitter::crd(),
        ProxyDefaults::crd(),
        ServiceIntentions::crd(),
    ]
}
