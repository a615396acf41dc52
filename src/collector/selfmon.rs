//! Self-monitoring instruments.
//!
//! Registered once at service construction. The registry is private (every
//! reload unregisters instruments, which the default registry cannot
//! tolerate), so the runtime and process collectors are registered
//! explicitly rather than relying on library defaults.

use prometheus::core::{Collector, Desc};
use prometheus::{Gauge, IntCounter, Registry, proto};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide collection counters.
#[derive(Clone)]
pub struct SelfMetrics {
    errors_total: IntCounter,
    last_success: Gauge,
}

impl SelfMetrics {
    /// Create and register the self-monitoring instruments.
    pub fn register(
        registry: &Registry,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, prometheus::Error> {
        let errors_total = IntCounter::new(
            "collector_errors_total",
            "Total number of failed metric queries",
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let last_success = Gauge::new(
            "collector_last_success_timestamp_seconds",
            "Unix time of the last collection round with at least one success",
        )?;
        registry.register(Box::new(last_success.clone()))?;

        registry.register(Box::new(RuntimeCollector::new(runtime)?))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            errors_total,
            last_success,
        })
    }

    /// One failed per-metric query.
    pub fn record_error(&self) {
        self.errors_total.inc();
    }

    /// A round finished with at least one success.
    ///
    /// The timestamp never moves backwards, even if the wall clock does.
    pub fn record_success_now(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        if now >= self.last_success.get() {
            self.last_success.set(now);
        }
    }

    pub fn error_count(&self) -> u64 {
        self.errors_total.get()
    }

    pub fn last_success_seconds(&self) -> f64 {
        self.last_success.get()
    }
}

/// Exposes tokio runtime gauges: worker threads and alive tasks.
#[derive(Debug)]
struct RuntimeCollector {
    handle: tokio::runtime::Handle,
    workers: Desc,
    alive_tasks: Desc,
}

impl RuntimeCollector {
    fn new(handle: tokio::runtime::Handle) -> Result<Self, prometheus::Error> {
        Ok(Self {
            workers: Desc::new(
                "tokio_runtime_workers".to_string(),
                "Number of worker threads in the runtime".to_string(),
                vec![],
                HashMap::new(),
            )?,
            alive_tasks: Desc::new(
                "tokio_runtime_alive_tasks".to_string(),
                "Number of tasks currently alive in the runtime".to_string(),
                vec![],
                HashMap::new(),
            )?,
            handle,
        })
    }
}

impl Collector for RuntimeCollector {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.workers, &self.alive_tasks]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let metrics = self.handle.metrics();
        vec![
            gauge_family(&self.workers, metrics.num_workers() as f64),
            gauge_family(&self.alive_tasks, metrics.num_alive_tasks() as f64),
        ]
    }
}

fn gauge_family(desc: &Desc, value: f64) -> proto::MetricFamily {
    let mut gauge = proto::Gauge::default();
    gauge.set_value(value);

    let mut metric = proto::Metric::default();
    metric.set_gauge(gauge);

    let mut family = proto::MetricFamily::default();
    family.set_name(desc.fq_name.clone());
    family.set_help(desc.help.clone());
    family.set_field_type(proto::MetricType::GAUGE);
    family.set_metric(vec![metric].into());
    family
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_count_errors() {
        let registry = Registry::new();
        let selfmon = SelfMetrics::register(&registry, tokio::runtime::Handle::current()).unwrap();

        assert_eq!(selfmon.error_count(), 0);
        selfmon.record_error();
        selfmon.record_error();
        assert_eq!(selfmon.error_count(), 2);
    }

    #[tokio::test]
    async fn test_last_success_is_monotonic() {
        let registry = Registry::new();
        let selfmon = SelfMetrics::register(&registry, tokio::runtime::Handle::current()).unwrap();

        assert_eq!(selfmon.last_success_seconds(), 0.0);
        selfmon.record_success_now();
        let first = selfmon.last_success_seconds();
        assert!(first > 0.0);

        selfmon.record_success_now();
        assert!(selfmon.last_success_seconds() >= first);
    }

    #[tokio::test]
    async fn test_runtime_collector_gathers() {
        let registry = Registry::new();
        let _selfmon = SelfMetrics::register(&registry, tokio::runtime::Handle::current()).unwrap();

        let families = registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"collector_errors_total"));
        assert!(names.contains(&"collector_last_success_timestamp_seconds"));
        assert!(names.contains(&"tokio_runtime_workers"));
    }

    #[tokio::test]
    async fn test_double_registration_fails() {
        let registry = Registry::new();
        let _first = SelfMetrics::register(&registry, tokio::runtime::Handle::current()).unwrap();
        let second = SelfMetrics::register(&registry, tokio::runtime::Handle::current());
        assert!(second.is_err());
    }
}
