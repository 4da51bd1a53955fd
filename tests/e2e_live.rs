//! End-to-end sync of a ServiceDefaults resource against a live cluster and
//! Consul agent.
//!
//! Run with: cargo test --test e2e_live -- --ignored
//! The kubeconfig context must point at a disposable cluster and
//! `CONSUL_HTTP_ADDR` at a Consul agent reachable from the test.

use std::sync::Arc;
use std::time::{Duration, Instant};

use consul_config_operator::consul::{
    ConsulClient, ConsulClientConfig, ConsulHttpClient, RequestOptions,
};
use consul_config_operator::controller::{
    ConfigEntryController, ConfigEntryResource, KubeController, TenancyConfig,
};
use consul_config_operator::crd::{all_crds, ConditionStatus, ServiceDefaults};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use serde_json::json;

const TEST_NAMESPACE: &str = "consul-config-e2e";
const ENTRY_NAME: &str = "e2e-web";
const DATACENTER: &str = "dc1";
const FIELD_MANAGER: &str = "consul-config-operator-e2e";

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test]
#[ignore]
async fn e2e_service_defaults_sync_and_delete() -> TestResult {
    let client = Client::try_default().await?;
    let consul = Arc::new(ConsulHttpClient::new(ConsulClientConfig {
        address: std::env::var("CONSUL_HTTP_ADDR")
            .unwrap_or_else(|_| "http://127.0.0.1:8500".into()),
        token: std::env::var("CONSUL_HTTP_TOKEN").ok(),
        timeout: Duration::from_secs(10),
    })?);

    install_crds(&client).await?;
    ensure_namespace(&client).await?;

    let api: Api<ServiceDefaults> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let resource: ServiceDefaults = serde_json::from_value(json!({
        "apiVersion": "consul.hashicorp.com/v1alpha1",
        "kind": "ServiceDefaults",
        "metadata": { "name": ENTRY_NAME, "namespace": TEST_NAMESPACE },
        "spec": { "protocol": "http" }
    }))?;
    api.create(&PostParams::default(), &resource).await?;

    let engine = ConfigEntryController::new(consul.clone(), DATACENTER, TenancyConfig::default());
    let ctrl = KubeController::<ServiceDefaults>::new(client.clone());
    let key = ObjectRef::<ServiceDefaults>::new(ENTRY_NAME).within(TEST_NAMESPACE);

    // Create: entry lands in Consul and the resource reports Synced.
    engine.reconcile_entry(&ctrl, &key).await?;

    let synced = api.get(ENTRY_NAME).await?;
    assert_eq!(synced.synced_condition_status(), ConditionStatus::True);
    assert!(synced.finalizers().iter().any(|f| f == "finalizers.consul.hashicorp.com"));
    assert!(synced.status.as_ref().and_then(|s| s.last_synced_time.as_ref()).is_some());

    let opts = RequestOptions::default();
    let entry = consul
        .get_config_entry("service-defaults", ENTRY_NAME, &opts)
        .await?
        .ok_or("entry missing from Consul")?;
    assert!(entry.is_owned_by(DATACENTER));
    assert_eq!(entry.body.get("Protocol"), Some(&json!("http")));

    // Drift: a spec change is written through.
    api.patch(
        ENTRY_NAME,
        &PatchParams::default(),
        &Patch::Merge(&json!({ "spec": { "protocol": "grpc" } })),
    )
    .await?;
    engine.reconcile_entry(&ctrl, &key).await?;

    let entry = consul
        .get_config_entry("service-defaults", ENTRY_NAME, &opts)
        .await?
        .ok_or("entry missing from Consul")?;
    assert_eq!(entry.body.get("Protocol"), Some(&json!("grpc")));

    // Delete: the finalizer removes the entry and lets the resource go.
    api.delete(ENTRY_NAME, &DeleteParams::default()).await?;
    engine.reconcile_entry(&ctrl, &key).await?;

    let api = &api;
    wait_for("resource deletion", Duration::from_secs(30), move || async move {
        api.get_opt(ENTRY_NAME).await.map(|o| o.is_none()).unwrap_or(false)
    })
    .await?;
    assert!(consul
        .get_config_entry("service-defaults", ENTRY_NAME, &opts)
        .await?
        .is_none());

    Ok(())
}

async fn install_crds(client: &Client) -> TestResult {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    for crd in all_crds() {
        crds.patch(&crd.name_any(), &params, &Patch::Apply(&crd)).await?;
    }

    let all: Api<ServiceDefaults> = Api::all(client.clone());
    let all = &all;
    wait_for("CRD establishment", Duration::from_secs(60), move || async move {
        all.list(&ListParams::default().limit(1)).await.is_ok()
    })
    .await
}

async fn ensure_namespace(client: &Client) -> TestResult {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns: Namespace = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": TEST_NAMESPACE }
    }))?;
    namespaces
        .patch(TEST_NAMESPACE, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns))
        .await?;
    Ok(())
}

async fn wait_for<F, Fut>(label: &str, timeout: Duration, mut condition: F) -> TestResult
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    Err(format!("timed out waiting for {}", label).into())
}
