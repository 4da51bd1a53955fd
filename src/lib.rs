//! consul-config-operator: keeps Consul config entries in sync with Kubernetes
//!
//! Each supported custom resource (`ServiceDefaults`, `ServiceSplitter`,
//! `ProxyDefaults`, `ServiceIntentions`) is projected onto a Consul config
//! entry by a single generic reconciliation engine, see
//! [`controller::ConfigEntryController`].

pub mod consul;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
