//! Controller loops wiring the engine to kube-runtime
//!
//! One kube-runtime controller runs per config entry kind. All of them share
//! the engine, the leadership flag and the readiness counters in
//! [`OperatorState`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller as RuntimeController};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::Resource;
use tracing::{debug, error, info, warn};

use super::backoff::RetryRateLimiter;
use super::kube_controller::KubeController;
#[cfg(feature = "metrics")]
use super::metrics;
use super::reconciler::ConfigEntryController;
use super::resource::ConfigEntryResource;
use crate::crd::{ProxyDefaults, ServiceDefaults, ServiceIntentions, ServiceSplitter};
use crate::error::{Error, Result};

/// Number of kinds started by [`run_controllers`].
pub const MANAGED_KINDS: usize = 4;

/// Requeue interval for reconciles skipped on a non-leader replica.
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(10);

/// Shared state for every controller loop
pub struct OperatorState {
    pub client: Client,
    pub engine: ConfigEntryController,
    pub is_leader: Arc<AtomicBool>,
    pub max_concurrent_reconciles: u16,
    controllers_started: AtomicUsize,
}

impl OperatorState {
    pub fn new(
        client: Client,
        engine: ConfigEntryController,
        is_leader: Arc<AtomicBool>,
        max_concurrent_reconciles: u16,
    ) -> Self {
        Self {
            client,
            engine,
            is_leader,
            max_concurrent_reconciles,
            controllers_started: AtomicUsize::new(0),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    pub fn controllers_started(&self) -> usize {
        self.controllers_started.load(Ordering::Relaxed)
    }

    /// Ready once every kind is watched and this replica leads.
    pub fn is_ready(&self) -> bool {
        self.is_leader() && self.controllers_started() >= MANAGED_KINDS
    }
}

/// Per-kind context handed to kube-runtime
struct KindContext<K> {
    operator: Arc<OperatorState>,
    ctrl: KubeController<K>,
    limiter: RetryRateLimiter,
}

/// Run the controller for one kind until a shutdown signal arrives.
pub async fn run_kind<K: ConfigEntryResource>(state: Arc<OperatorState>) -> Result<()> {
    let kind = K::kind(&()).to_string();
    let api: Api<K> = Api::all(state.client.clone());

    // Verify CRD exists
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("{} CRD is available", kind),
        Err(e) => {
            error!("{} CRD not found. Please install the CRD first: {:?}", kind, e);
            return Err(Error::ConfigError(format!("{} CRD not installed", kind)));
        }
    }

    let ctx = Arc::new(KindContext {
        operator: state.clone(),
        ctrl: KubeController::new(state.client.clone()),
        limiter: RetryRateLimiter::default(),
    });

    state.controllers_started.fetch_add(1, Ordering::Relaxed);
    info!("Starting {} controller", kind);

    RuntimeController::new(api, Config::default())
        .with_config(controller::Config::default().concurrency(state.max_concurrent_reconciles))
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled: {}", obj),
                Err(e) => debug!("Reconcile error: {}", e),
            }
        })
        .await;

    Ok(())
}

/// Run the controllers of every supported kind concurrently.
pub async fn run_controllers(state: Arc<OperatorState>) -> Result<()> {
    tokio::try_join!(
        run_kind::<ServiceDefaults>(state.clone()),
        run_kind::<ServiceSplitter>(state.clone()),
        run_kind::<ProxyDefaults>(state.clone()),
        run_kind::<ServiceIntentions>(state.clone()),
    )?;
    Ok(())
}

async fn reconcile<K: ConfigEntryResource>(obj: Arc<K>, ctx: Arc<KindContext<K>>) -> Result<Action> {
    if !ctx.operator.is_leader() {
        debug!("Not the leader, skipping reconcile");
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    let key = ObjectRef::from_obj(obj.as_ref());
    let start = Instant::now();
    let result = ctx.operator.engine.reconcile_entry(&ctx.ctrl, &key).await;

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(obj.kube_kind(), start.elapsed().as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    let _ = start;

    if result.is_ok() {
        ctx.limiter.forget(&key.to_string());
    }
    result
}

/// Requeue with the rate limiter's delay; log level follows retriability.
fn error_policy<K: ConfigEntryResource>(obj: Arc<K>, error: &Error, ctx: Arc<KindContext<K>>) -> Action {
    let key = ObjectRef::from_obj(obj.as_ref()).to_string();

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(obj.kube_kind(), error.metric_label());

    if error.is_conflict() {
        debug!("Conflict writing {}, retrying with a fresh copy: {}", key, error);
    } else if error.is_retriable() {
        warn!("Reconciliation error for {}: {}", key, error);
    } else {
        error!("Reconciliation error for {}: {}", key, error);
    }

    Action::requeue(ctx.limiter.when(&key))
}
