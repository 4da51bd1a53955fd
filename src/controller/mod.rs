//! Controller module for Consul config entry reconciliation
//! This module contains the generic reconciliation engine, the seams it uses
//! to reach Kubernetes, and the kube-runtime loops that drive it.

mod backoff;
pub mod conditions;
mod finalizers;
mod kube_controller;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
pub mod resource;
mod runner;
pub mod tenancy;

pub use backoff::RetryRateLimiter;
pub use finalizers::FINALIZER_NAME;
pub use kube_controller::{Controller, KubeController, FIELD_MANAGER};
pub use reconciler::{ConfigEntryController, DEFAULT_RESYNC_PERIOD};
pub use resource::{ConfigEntryResource, MIGRATE_ENTRY_KEY};
pub use runner::{run_controllers, run_kind, OperatorState, MANAGED_KINDS};
pub use tenancy::{destination_tenancy, resolve_namespace, Tenancy, TenancyConfig};
