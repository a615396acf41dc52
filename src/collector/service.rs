//! The collection service: shared state, the collection round, and the
//! hot-reload reconciler.
//!
//! The instrument and client registries are the only shared mutable state.
//! One readers-writer lock guards them: a round takes shared access just
//! long enough to snapshot, the reconciler takes exclusive access for the
//! whole apply. Scrapes bypass the lock entirely and go through the
//! Prometheus registry's own synchronization.

use crate::backend::{BackendHandle, ClientRegistry, QueryError};
use crate::collector::instruments::{Instrument, InstrumentRegistry};
use crate::collector::selfmon::SelfMetrics;
use crate::config::{Config, MetricSpec};
use crate::util::{RequestId, ShutdownSignal};
use arc_swap::ArcSwap;
use prometheus::Registry;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

/// Errors that fail a configuration apply as a whole.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("instrument registration failed: {0}")]
    Registration(#[from] prometheus::Error),
}

/// Outcome of a successful apply.
#[derive(Debug, Clone)]
pub struct ReloadSummary {
    pub message: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Counters from one collection round.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// The collection service.
pub struct CollectorService {
    state: RwLock<ServiceState>,
    registry: Registry,
    selfmon: SelfMetrics,
    shutdown: ShutdownSignal,
    current: ArcSwap<Config>,
}

struct ServiceState {
    instruments: InstrumentRegistry,
    clients: ClientRegistry,
}

/// Everything one metric needs to collect once, detached from the lock.
struct CollectItem {
    spec: MetricSpec,
    instrument: Instrument,
    client: Option<BackendHandle>,
}

impl CollectorService {
    /// Construct the service with its private registry and self-monitoring
    /// instruments. No metrics are registered until the first `reload`.
    pub fn new(
        config: Config,
        shutdown: ShutdownSignal,
    ) -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();
        let selfmon = SelfMetrics::register(&registry, tokio::runtime::Handle::current())?;

        Ok(Arc::new(Self {
            state: RwLock::new(ServiceState {
                instruments: InstrumentRegistry::new(registry.clone()),
                clients: ClientRegistry::new(),
            }),
            registry,
            selfmon,
            shutdown,
            current: ArcSwap::from_pointee(config),
        }))
    }

    /// The process-local registry, for the scrape handler.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The currently published configuration.
    pub fn current_config(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn self_metrics(&self) -> &SelfMetrics {
        &self.selfmon
    }

    /// Apply a configuration.
    ///
    /// Holds exclusive access for the entire apply, including one
    /// synchronous collection round at the end, so the next scrape observes
    /// real values for newly added metrics instead of zeros. Releasing the
    /// lock before that round would let a scheduled round interleave with
    /// the apply and tear the exposition.
    pub async fn reload(&self, config: Config) -> Result<ReloadSummary, ReloadError> {
        let apply_id = RequestId::new();
        let old_config = self.current_config();
        let mut st = self.state.write().await;

        let old_names: BTreeSet<String> = st
            .instruments
            .handles()
            .iter()
            .map(|h| h.spec.name.clone())
            .collect();
        let new_names: BTreeSet<String> =
            config.metrics.iter().map(|m| m.name.clone()).collect();
        let added: Vec<String> = new_names.difference(&old_names).cloned().collect();
        let removed: Vec<String> = old_names.difference(&new_names).cloned().collect();

        info!(
            apply = %apply_id,
            metrics = config.metrics.len(),
            added = added.len(),
            removed = removed.len(),
            "applying configuration"
        );

        // Instruments whose names are gone leave the registry first so a
        // rename cannot collide with its own old registration.
        let dropped = st.instruments.retain_names(&new_names);

        // Reconcile clients; open failures are non-fatal and surface as
        // per-metric collection errors.
        st.clients.ensure(&config).await;

        if let Err(e) = st.instruments.rebuild(&config.metrics) {
            error!(apply = %apply_id, error = %e, "instrument registration failed, rolling back");
            st.instruments.restore(dropped);
            st.clients.ensure(&old_config).await;
            return Err(ReloadError::Registration(e));
        }

        // One synchronous round under the exclusive lock: scrapes arriving
        // after the apply returns see fresh values immediately.
        let items = snapshot(&st);
        let stats = run_round(items, &self.selfmon, &self.shutdown, None).await;

        self.current.store(Arc::new(config));

        info!(
            apply = %apply_id,
            collected = stats.succeeded,
            failed = stats.failed,
            "configuration applied"
        );

        Ok(ReloadSummary {
            message: format!(
                "configuration applied: {} metrics active, {} added, {} removed",
                stats.attempted,
                added.len(),
                removed.len()
            ),
            added,
            removed,
        })
    }

    /// Run one scheduled collection round.
    ///
    /// Shared access is held only while copying the handle list; all I/O
    /// and instrument writes happen unlocked. `cancel` is polled between
    /// per-metric calls so shutdown waits for the in-flight call only.
    pub async fn run_scheduled_round(&self, cancel: broadcast::Receiver<()>) -> RoundStats {
        let items = {
            let st = self.state.read().await;
            snapshot(&st)
        };
        run_round(items, &self.selfmon, &self.shutdown, Some(cancel)).await
    }

    /// Close every backend client. Used at shutdown.
    pub async fn close(&self) {
        let mut st = self.state.write().await;
        st.clients.close_all().await;
    }
}

fn snapshot(state: &ServiceState) -> Vec<CollectItem> {
    state
        .instruments
        .handles()
        .iter()
        .map(|h| CollectItem {
            spec: h.spec.clone(),
            instrument: h.instrument.clone(),
            client: state.clients.handle_for(&h.spec),
        })
        .collect()
}

/// Execute one sequential pass over the snapshot.
///
/// A failing metric writes NaN and counts one error, then the round moves
/// on; a single bad query never disables its siblings.
async fn run_round(
    items: Vec<CollectItem>,
    selfmon: &SelfMetrics,
    shutdown: &ShutdownSignal,
    mut cancel: Option<broadcast::Receiver<()>>,
) -> RoundStats {
    let mut stats = RoundStats::default();

    for item in &items {
        if let Some(rx) = cancel.as_mut() {
            if !matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
                info!(
                    collected = stats.attempted,
                    remaining = items.len() - stats.attempted,
                    "collection round interrupted by shutdown"
                );
                break;
            }
        }

        stats.attempted += 1;
        match collect_one(item, shutdown).await {
            Ok(value) => {
                item.instrument.write(value);
                stats.succeeded += 1;
                debug!(metric = %item.spec.name, value, "collected");
            }
            Err(e) => {
                item.instrument.write(f64::NAN);
                selfmon.record_error();
                stats.failed += 1;
                warn!(
                    metric = %item.spec.name,
                    source = %item.spec.source,
                    error = %e,
                    "metric collection failed"
                );
            }
        }
    }

    if stats.succeeded > 0 {
        selfmon.record_success_now();
    }
    stats
}

async fn collect_one(item: &CollectItem, shutdown: &ShutdownSignal) -> Result<f64, QueryError> {
    let client = item.client.as_ref().ok_or_else(|| QueryError::NotConnected {
        kind: item.spec.source,
        connection: item.spec.connection_name().to_string(),
    })?;
    client.query_scalar(&item.spec, shutdown).await
}
