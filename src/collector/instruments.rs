//! Instrument registry: the process-local Prometheus registry plus the
//! ordered list of live instrument handles.
//!
//! Uniqueness is enforced on the fingerprint (name plus sorted labels), and
//! help text is stabilized to the first help seen for a name, so two specs
//! sharing a name can never produce conflicting exposition.

use crate::config::{MetricKind, MetricSpec};
use prometheus::core::{Collector, Desc};
use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts, Registry, proto};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Uniqueness key for an instrument: `name{label=value,...}` with labels in
/// sorted order (the spec stores them in a BTreeMap).
pub fn fingerprint(spec: &MetricSpec) -> String {
    let mut out = spec.name.clone();
    out.push('{');
    for (i, (key, value)) in spec.labels.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out.push('}');
    out
}

/// A live measurement object.
///
/// Clones share the underlying value, so a collection round can write
/// without holding the registry lock.
#[derive(Clone)]
pub enum Instrument {
    Gauge(Gauge),
    Counter(Counter),
    Histogram(Histogram),
    Summary(InertSummary),
}

impl Instrument {
    /// Write one collected scalar.
    ///
    /// Gauges accept any float including NaN. Counters cannot represent NaN
    /// or move backwards, so replacement is expressed as reset-plus-inc and
    /// non-finite values are dropped. Histograms and summaries have no
    /// single-scalar write path: the collected value carries no distribution
    /// to observe, so nothing is recorded.
    pub fn write(&self, value: f64) {
        match self {
            Instrument::Gauge(g) => g.set(value),
            Instrument::Counter(c) => {
                if !value.is_finite() || value < 0.0 {
                    debug!(value, "dropping non-representable counter value");
                    return;
                }
                let current = c.get();
                if value >= current {
                    c.inc_by(value - current);
                } else {
                    c.reset();
                    c.inc_by(value);
                }
            }
            Instrument::Histogram(_) | Instrument::Summary(_) => {
                debug!("histogram/summary instruments receive no single-scalar samples");
            }
        }
    }

    /// A boxed collector clone, for registering and unregistering.
    pub fn collector(&self) -> Box<dyn Collector> {
        match self {
            Instrument::Gauge(g) => Box::new(g.clone()),
            Instrument::Counter(c) => Box::new(c.clone()),
            Instrument::Histogram(h) => Box::new(h.clone()),
            Instrument::Summary(s) => Box::new(s.clone()),
        }
    }
}

/// One registered metric: its resolved spec and the instrument it writes.
pub struct InstrumentHandle {
    pub spec: MetricSpec,
    pub instrument: Instrument,
}

impl InstrumentHandle {
    /// True when `resolved` describes the same registration: identical name,
    /// labels, help, kind, and kind parameters. Query, source, and
    /// connection changes do not require re-registration.
    fn registration_eq(&self, resolved: &MetricSpec) -> bool {
        let s = &self.spec;
        s.name == resolved.name
            && s.labels == resolved.labels
            && s.help == resolved.help
            && s.kind == resolved.kind
            && s.buckets == resolved.buckets
            && s.objectives == resolved.objectives
    }
}

/// The process-local registry plus the ordered handle list.
pub struct InstrumentRegistry {
    registry: Registry,
    handles: Vec<InstrumentHandle>,
}

impl InstrumentRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            handles: Vec::new(),
        }
    }

    /// The live handles, in collection order.
    pub fn handles(&self) -> &[InstrumentHandle] {
        &self.handles
    }

    /// Drop and unregister every handle whose name is not in `keep`.
    /// Returns the dropped handles so a failed apply can restore them.
    pub fn retain_names(&mut self, keep: &BTreeSet<String>) -> Vec<InstrumentHandle> {
        let mut dropped = Vec::new();
        let mut kept = Vec::new();
        for handle in self.handles.drain(..) {
            if keep.contains(&handle.spec.name) {
                kept.push(handle);
            } else {
                unregister(&self.registry, &handle);
                dropped.push(handle);
            }
        }
        self.handles = kept;
        dropped
    }

    /// Rebuild the handle list from a metric list.
    ///
    /// Handles whose registration-relevant fields are unchanged are reused
    /// without touching the registry; everything else is unregistered and
    /// freshly registered. Duplicate fingerprints are skipped with a
    /// warning, and help is stabilized to the first help seen per name.
    ///
    /// On a registration error every instrument registered by this call is
    /// unregistered again and the previous handles are restored, so the
    /// registry never ends up half-applied.
    pub fn rebuild(&mut self, metrics: &[MetricSpec]) -> Result<(), prometheus::Error> {
        let mut old = std::mem::take(&mut self.handles);
        let mut help_by_name: HashMap<String, String> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut next: Vec<InstrumentHandle> = Vec::with_capacity(metrics.len());
        let mut registered: Vec<usize> = Vec::new();
        let mut stale: Vec<InstrumentHandle> = Vec::new();

        for spec in metrics {
            let mut resolved = spec.clone();
            match help_by_name.get(&resolved.name) {
                Some(first) => {
                    if *first != resolved.help {
                        warn!(
                            metric = %resolved.name,
                            kept = %first,
                            ignored = %resolved.help,
                            "conflicting help strings for one metric name, first wins"
                        );
                        resolved.help = first.clone();
                    }
                }
                None => {
                    help_by_name.insert(resolved.name.clone(), resolved.help.clone());
                }
            }

            let fp = fingerprint(&resolved);
            if !seen.insert(fp.clone()) {
                warn!(
                    metric = %resolved.name,
                    fingerprint = %fp,
                    "duplicate metric fingerprint, skipping"
                );
                continue;
            }

            if let Some(pos) = old.iter().position(|h| h.registration_eq(&resolved)) {
                let mut handle = old.swap_remove(pos);
                handle.spec = resolved;
                next.push(handle);
                continue;
            }

            // Same fingerprint but different kind/help/parameters: the old
            // collector must leave the registry before the new one enters.
            if let Some(pos) = old.iter().position(|h| fingerprint(&h.spec) == fp) {
                let handle = old.swap_remove(pos);
                unregister(&self.registry, &handle);
                stale.push(handle);
            }

            let outcome = build_instrument(&resolved)
                .and_then(|i| self.registry.register(i.collector()).map(|_| i));
            match outcome {
                Ok(instrument) => {
                    registered.push(next.len());
                    next.push(InstrumentHandle {
                        spec: resolved,
                        instrument,
                    });
                }
                Err(e) => {
                    for idx in &registered {
                        unregister(&self.registry, &next[*idx]);
                    }
                    // Reused handles are still registered; put them and the
                    // displaced ones back so the previous state stays live.
                    let mut restored: Vec<InstrumentHandle> = next
                        .drain(..)
                        .enumerate()
                        .filter(|(i, _)| !registered.contains(i))
                        .map(|(_, h)| h)
                        .collect();
                    for handle in stale {
                        reregister(&self.registry, &handle);
                        restored.push(handle);
                    }
                    restored.extend(old);
                    self.handles = restored;
                    return Err(e);
                }
            }
        }

        // Old handles left over here share a surviving name but no longer
        // match any new fingerprint (labels changed).
        for handle in old {
            unregister(&self.registry, &handle);
        }

        self.handles = next;
        Ok(())
    }

    /// Re-register previously dropped handles best-effort and append them.
    /// Used when a failed apply must restore the pre-apply state.
    pub fn restore(&mut self, handles: Vec<InstrumentHandle>) {
        for handle in handles {
            reregister(&self.registry, &handle);
            self.handles.push(handle);
        }
    }
}

fn unregister(registry: &Registry, handle: &InstrumentHandle) {
    if let Err(e) = registry.unregister(handle.instrument.collector()) {
        warn!(metric = %handle.spec.name, error = %e, "failed to unregister instrument");
    }
}

fn reregister(registry: &Registry, handle: &InstrumentHandle) {
    if let Err(e) = registry.register(handle.instrument.collector()) {
        warn!(metric = %handle.spec.name, error = %e, "failed to restore instrument");
    }
}

/// Construct the typed instrument for a resolved spec.
fn build_instrument(spec: &MetricSpec) -> Result<Instrument, prometheus::Error> {
    let labels: HashMap<String, String> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let help = effective_help(spec);

    match spec.kind {
        MetricKind::Gauge => {
            let opts = Opts::new(&spec.name, help).const_labels(labels);
            Ok(Instrument::Gauge(Gauge::with_opts(opts)?))
        }
        MetricKind::Counter => {
            let opts = Opts::new(&spec.name, help).const_labels(labels);
            Ok(Instrument::Counter(Counter::with_opts(opts)?))
        }
        MetricKind::Histogram => {
            let opts = HistogramOpts::new(&spec.name, help)
                .const_labels(labels)
                .buckets(spec.buckets.clone().unwrap_or_default());
            Ok(Instrument::Histogram(Histogram::with_opts(opts)?))
        }
        MetricKind::Summary => Ok(Instrument::Summary(InertSummary::new(spec, help, labels)?)),
    }
}

/// The registry refuses empty help strings, so an unset help falls back to
/// the metric name.
fn effective_help(spec: &MetricSpec) -> String {
    if spec.help.trim().is_empty() {
        format!("Metric {}", spec.name)
    } else {
        spec.help.clone()
    }
}

/// A summary that registers and exposes its family but never observes.
///
/// The metrics library provides no summary instrument; since collected
/// scalars carry no distribution anyway, the quantiles are exposed as NaN
/// with zero count and sum.
#[derive(Clone, Debug)]
pub struct InertSummary {
    desc: Desc,
    quantiles: Vec<f64>,
}

impl InertSummary {
    fn new(
        spec: &MetricSpec,
        help: String,
        labels: HashMap<String, String>,
    ) -> Result<Self, prometheus::Error> {
        let desc = Desc::new(spec.name.clone(), help, vec![], labels)?;
        let mut quantiles: Vec<f64> = spec
            .objectives
            .iter()
            .flatten()
            .filter_map(|(q, _)| q.parse::<f64>().ok())
            .collect();
        quantiles.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Ok(Self { desc, quantiles })
    }
}

impl Collector for InertSummary {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let mut summary = proto::Summary::default();
        summary.set_sample_count(0);
        summary.set_sample_sum(0.0);
        let quantiles: Vec<proto::Quantile> = self
            .quantiles
            .iter()
            .map(|q| {
                let mut quantile = proto::Quantile::default();
                quantile.set_quantile(*q);
                quantile.set_value(f64::NAN);
                quantile
            })
            .collect();
        summary.set_quantile(quantiles.into());

        let mut metric = proto::Metric::default();
        metric.set_summary(summary);
        metric.set_label(self.desc.const_label_pairs.clone().into());

        let mut family = proto::MetricFamily::default();
        family.set_name(self.desc.fq_name.clone());
        family.set_help(self.desc.help.clone());
        family.set_field_type(proto::MetricType::SUMMARY);
        family.set_metric(vec![metric].into());
        vec![family]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> MetricSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn gauge_spec(name: &str, help: &str) -> MetricSpec {
        spec(&format!(
            r#"
name: {}
help: "{}"
source: mysql
query: SELECT 1
"#,
            name, help
        ))
    }

    fn registry() -> InstrumentRegistry {
        InstrumentRegistry::new(Registry::new())
    }

    fn names(reg: &InstrumentRegistry) -> Vec<&str> {
        reg.handles().iter().map(|h| h.spec.name.as_str()).collect()
    }

    #[test]
    fn test_fingerprint_sorts_labels() {
        let mut a = gauge_spec("x", "h");
        a.labels.insert("b".into(), "2".into());
        a.labels.insert("a".into(), "1".into());
        assert_eq!(fingerprint(&a), "x{a=1,b=2}");

        let plain = gauge_spec("x", "h");
        assert_eq!(fingerprint(&plain), "x{}");
    }

    #[test]
    fn test_rebuild_registers_and_exposes() {
        let mut reg = registry();
        reg.rebuild(&[gauge_spec("a", "ha"), gauge_spec("b", "hb")])
            .unwrap();
        assert_eq!(names(&reg), vec!["a", "b"]);

        reg.handles()[0].instrument.write(42.0);
        let families = reg.registry.gather();
        assert_eq!(families.len(), 2);
        let a = families.iter().find(|f| f.get_name() == "a").unwrap();
        assert_eq!(a.get_metric()[0].get_gauge().get_value(), 42.0);
    }

    #[test]
    fn test_duplicate_fingerprint_skipped() {
        let mut reg = registry();
        reg.rebuild(&[gauge_spec("x", "A"), gauge_spec("x", "B")]).unwrap();
        // One instrument survives, carrying the first help
        assert_eq!(reg.handles().len(), 1);
        assert_eq!(reg.handles()[0].spec.help, "A");
        assert_eq!(reg.registry.gather().len(), 1);
    }

    #[test]
    fn test_help_stabilized_across_label_sets() {
        let mut reg = registry();
        let first = gauge_spec("x", "A");
        let mut second = gauge_spec("x", "B");
        second.labels.insert("env".into(), "prod".into());

        reg.rebuild(&[first, second]).unwrap();
        assert_eq!(reg.handles().len(), 2);
        assert_eq!(reg.handles()[1].spec.help, "A");

        // A single family with both series and one help string
        let families = reg.registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_help(), "A");
        assert_eq!(families[0].get_metric().len(), 2);
    }

    #[test]
    fn test_rebuild_reuses_unchanged_handles() {
        let mut reg = registry();
        reg.rebuild(&[gauge_spec("a", "h")]).unwrap();
        reg.handles()[0].instrument.write(7.0);

        // Same registration, different query: instrument must survive
        let mut changed = gauge_spec("a", "h");
        changed.query = "SELECT 2".into();
        reg.rebuild(std::slice::from_ref(&changed)).unwrap();

        assert_eq!(reg.handles()[0].spec.query, "SELECT 2");
        let families = reg.registry.gather();
        assert_eq!(families[0].get_metric()[0].get_gauge().get_value(), 7.0);
    }

    #[test]
    fn test_rebuild_replaces_on_kind_change() {
        let mut reg = registry();
        reg.rebuild(&[gauge_spec("a", "h")]).unwrap();

        let mut histogram = gauge_spec("a", "h");
        histogram.kind = MetricKind::Histogram;
        histogram.buckets = Some(vec![0.1, 1.0, 10.0]);
        reg.rebuild(std::slice::from_ref(&histogram)).unwrap();

        assert!(matches!(
            reg.handles()[0].instrument,
            Instrument::Histogram(_)
        ));
        let families = reg.registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_field_type(), proto::MetricType::HISTOGRAM);
    }

    #[test]
    fn test_retain_names_unregisters() {
        let mut reg = registry();
        reg.rebuild(&[gauge_spec("a", "h"), gauge_spec("b", "h")])
            .unwrap();

        let keep: BTreeSet<String> = ["b".to_string()].into();
        let dropped = reg.retain_names(&keep);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].spec.name, "a");
        assert_eq!(names(&reg), vec!["b"]);
        assert_eq!(reg.registry.gather().len(), 1);
    }

    #[test]
    fn test_restore_after_drop() {
        let mut reg = registry();
        reg.rebuild(&[gauge_spec("a", "h"), gauge_spec("b", "h")])
            .unwrap();
        let keep: BTreeSet<String> = ["b".to_string()].into();
        let dropped = reg.retain_names(&keep);

        reg.restore(dropped);
        assert_eq!(reg.handles().len(), 2);
        assert_eq!(reg.registry.gather().len(), 2);
    }

    #[test]
    fn test_counter_write_replacement() {
        let counter = Counter::new("c", "h").unwrap();
        let instrument = Instrument::Counter(counter.clone());

        instrument.write(10.0);
        assert_eq!(counter.get(), 10.0);

        instrument.write(15.5);
        assert_eq!(counter.get(), 15.5);

        // A backend reset moves the value down; the counter follows
        instrument.write(3.0);
        assert_eq!(counter.get(), 3.0);

        // NaN has no counter representation and is dropped
        instrument.write(f64::NAN);
        assert_eq!(counter.get(), 3.0);
    }

    #[test]
    fn test_gauge_accepts_nan() {
        let gauge = Gauge::new("g", "h").unwrap();
        let instrument = Instrument::Gauge(gauge.clone());
        instrument.write(f64::NAN);
        assert!(gauge.get().is_nan());
    }

    #[test]
    fn test_inert_summary_exposition() {
        let mut summary_spec = gauge_spec("lat", "latency");
        summary_spec.kind = MetricKind::Summary;
        summary_spec.objectives = Some(
            [("0.5".to_string(), 0.05), ("0.99".to_string(), 0.001)]
                .into_iter()
                .collect(),
        );
        summary_spec.labels.insert("svc".into(), "api".into());

        let mut reg = registry();
        reg.rebuild(std::slice::from_ref(&summary_spec)).unwrap();

        let families = reg.registry.gather();
        assert_eq!(families.len(), 1);
        let family = &families[0];
        assert_eq!(family.get_field_type(), proto::MetricType::SUMMARY);
        let metric = &family.get_metric()[0];
        assert_eq!(metric.get_summary().get_sample_count(), 0);
        assert_eq!(metric.get_summary().get_quantile().len(), 2);
        assert_eq!(metric.get_label()[0].get_name(), "svc");
    }
}
