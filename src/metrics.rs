use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the admission middleware
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Auth stage
    auth_requests: CounterVec,

    // Admission stage
    admitted_requests: Counter,
    rejected_requests: CounterVec,
    admission_duration: Histogram,

    // Caller table
    caller_limiters: Gauge,
    evicted_callers: Counter,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let auth_requests = CounterVec::new(
            Opts::new(
                "gatekeeper_auth_requests_total",
                "Authentication attempts by result",
            ),
            &["result"],
        )?;

        let admitted_requests = Counter::new(
            "gatekeeper_admitted_requests_total",
            "Calls admitted by every limiter tier",
        )?;

        let rejected_requests = CounterVec::new(
            Opts::new(
                "gatekeeper_rejected_requests_total",
                "Calls rejected by the admission stage, by tier",
            ),
            &["tier"],
        )?;

        let admission_duration = Histogram::with_opts(HistogramOpts::new(
            "gatekeeper_admission_duration_seconds",
            "Time spent evaluating limiter tiers",
        ))?;

        let caller_limiters = Gauge::new(
            "gatekeeper_caller_limiters",
            "Per-caller limiters currently held",
        )?;

        let evicted_callers = Counter::new(
            "gatekeeper_evicted_callers_total",
            "Per-caller limiters removed by the idle sweep",
        )?;

        registry.register(Box::new(auth_requests.clone()))?;
        registry.register(Box::new(admitted_requests.clone()))?;
        registry.register(Box::new(rejected_requests.clone()))?;
        registry.register(Box::new(admission_duration.clone()))?;
        registry.register(Box::new(caller_limiters.clone()))?;
        registry.register(Box::new(evicted_callers.clone()))?;

        Ok(Self {
            registry,
            auth_requests,
            admitted_requests,
            rejected_requests,
            admission_duration,
            caller_limiters,
            evicted_callers,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an authentication outcome (`ok` or a failure kind)
    pub fn record_auth_result(&self, result: &str) {
        self.auth_requests.with_label_values(&[result]).inc();
    }

    pub fn auth_results(&self, result: &str) -> f64 {
        self.auth_requests.with_label_values(&[result]).get()
    }

    pub fn record_admitted(&self) {
        self.admitted_requests.inc();
    }

    pub fn record_rejected(&self, tier: &str) {
        self.rejected_requests.with_label_values(&[tier]).inc();
    }

    /// Create a timer for measuring admission duration
    pub fn start_admission_timer(&self) -> prometheus::HistogramTimer {
        self.admission_duration.start_timer()
    }

    pub fn set_caller_limiters(&self, count: usize) {
        self.caller_limiters.set(count as f64);
    }

    /// One more live caller limiter; the sweeper resets the exact count each tick
    pub fn inc_caller_limiters(&self) {
        self.caller_limiters.inc();
    }

    pub fn caller_limiters(&self) -> f64 {
        self.caller_limiters.get()
    }

    pub fn record_evicted_callers(&self, count: usize) {
        self.evicted_callers.inc_by(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_auth_result("ok");
        metrics.record_auth_result("invalid_token");
        metrics.record_admitted();
        metrics.record_rejected("global");
        metrics.set_caller_limiters(3);
        metrics.record_evicted_callers(2);

        let _timer = metrics.start_admission_timer();
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejected("caller");
        metrics.record_evicted_callers(4);

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "gatekeeper_rejected_requests_total"));

        let evicted = families
            .iter()
            .find(|f| f.get_name() == "gatekeeper_evicted_callers_total")
            .unwrap();
        assert_eq!(evicted.get_metric()[0].get_counter().get_value(), 4.0);
    }
}
