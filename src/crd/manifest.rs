//! Offline validation of config entry manifests
//!
//! Backs the `validate` subcommand: every YAML document is decoded into its
//! typed resource and checked with the same rules the controller applies.

use std::path::Path;

use kube::ResourceExt;
use serde::Deserialize;

use super::types::{format_validation_errors, SpecValidationError};
use super::{ProxyDefaults, ServiceDefaults, ServiceIntentions, ServiceSplitter};
use crate::controller::{ConfigEntryResource, TenancyConfig};
use crate::error::{Error, Result};

/// Validation outcome for one document of a manifest
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestReport {
    pub kind: String,
    pub name: String,
    pub errors: Vec<SpecValidationError>,
}

impl ManifestReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Kubernetes-style summary of the errors, empty when valid.
    pub fn message(&self) -> String {
        if self.is_valid() {
            String::new()
        } else {
            format_validation_errors(&self.kind, &self.name, &self.errors)
        }
    }
}

/// Validate every document in the YAML file at `path`.
pub fn validate_file(path: &Path, tenancy: &TenancyConfig) -> Result<Vec<ManifestReport>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::ValidationError(format!("failed to read {}: {}", path.display(), e))
    })?;
    validate_manifest(&contents, tenancy)
}

/// Validate every document in a (possibly multi-document) YAML string.
/// Empty documents are skipped.
pub fn validate_manifest(contents: &str, tenancy: &TenancyConfig) -> Result<Vec<ManifestReport>> {
    let mut reports = Vec::new();
    for document in serde_yaml::Deserializer::from_str(contents) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::ValidationError(format!("failed to parse manifest: {}", e)))?;
        if value.is_null() {
            continue;
        }
        reports.push(validate_document(value, tenancy)?);
    }
    Ok(reports)
}

fn validate_document(value: serde_yaml::Value, tenancy: &TenancyConfig) -> Result<ManifestReport> {
    let kind = value
        .get("kind")
        .and_then(serde_yaml::Value::as_str)
        .ok_or_else(|| Error::ValidationError("manifest document has no kind".to_string()))?
        .to_string();

    match kind.as_str() {
        "ServiceDefaults" => report::<ServiceDefaults>(value, tenancy),
        "ServiceSplitter" => report::<ServiceSplitter>(value, tenancy),
        "ProxyDefaults" => report::<ProxyDefaults>(value, tenancy),
        "ServiceIntentions" => report::<ServiceIntentions>(value, tenancy),
        other => Err(Error::ValidationError(format!("unsupported kind {:?}", other))),
    }
}

fn report<K>(value: serde_yaml::Value, tenancy: &TenancyConfig) -> Result<ManifestReport>
where
    K: ConfigEntryResource,
{
    let resource: K = serde_yaml::from_value(value)
        .map_err(|e| Error::ValidationError(format!("failed to decode resource: {}", e)))?;
    let errors = resource.validate(tenancy).err().unwrap_or_default();
    Ok(ManifestReport {
        kind: K::kind(&()).to_string(),
        name: resource.name_any(),
        errors,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SPLITTER: &str = r#"
apiVersion: consul.hashicorp.com/v1alpha1
kind: ServiceSplitter
metadata:
  name: web
  namespace: default
spec:
  splits:
    - weight: 90
      serviceSubset: v1
    - weight: 5
      serviceSubset: v2
"#;

    const DEFAULTS: &str = r#"
apiVersion: consul.hashicorp.com/v1alpha1
kind: ServiceDefaults
metadata:
  name: web
spec:
  protocol: http
"#;

    #[test]
    fn test_validate_manifest_reports_each_document() {
        let manifest = format!("{}\n---\n{}", DEFAULTS, SPLITTER);
        let reports = validate_manifest(&manifest, &TenancyConfig::default()).unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].kind, "ServiceDefaults");
        assert!(reports[0].is_valid());
        assert!(reports[0].message().is_empty());

        assert_eq!(reports[1].kind, "ServiceSplitter");
        assert!(!reports[1].is_valid());
        assert!(reports[1]
            .message()
            .starts_with("ServiceSplitter \"web\" is invalid: [spec.splits: Invalid value:"));
    }

    #[test]
    fn test_validate_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DEFAULTS.as_bytes()).unwrap();

        let reports = validate_file(file.path(), &TenancyConfig::default()).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "web");
        assert!(reports[0].is_valid());
    }

    #[test]
    fn test_unsupported_kind_is_rejected() {
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n";
        let err = validate_manifest(manifest, &TenancyConfig::default()).unwrap_err();
        assert!(err.to_string().contains("unsupported kind \"ConfigMap\""));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(validate_file(&missing, &TenancyConfig::default()).is_err());
    }
}
