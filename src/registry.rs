use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::debug;

use crate::{
    bucket::{BucketTemplate, TokenBucket},
    config::{LimitSpec, RegistryConfig},
    error::Result,
    metrics::Metrics,
};

/// Per-caller limiter together with the time the caller was last seen
pub struct CallerEntry {
    limiter: TokenBucket,
    created: Instant,
    // Nanoseconds after `created`; only ever moves forward
    last_seen: AtomicU64,
}

impl CallerEntry {
    fn new(limiter: TokenBucket, now: Instant) -> Self {
        Self {
            limiter,
            created: now,
            last_seen: AtomicU64::new(0),
        }
    }

    pub fn limiter(&self) -> &TokenBucket {
        &self.limiter
    }

    /// Mark the caller as active at `now`
    pub fn touch(&self, now: Instant) {
        let offset = now.saturating_duration_since(self.created).as_nanos();
        let offset = u64::try_from(offset).unwrap_or(u64::MAX);
        self.last_seen.fetch_max(offset, Ordering::AcqRel);
    }

    pub fn last_seen(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_seen.load(Ordering::Acquire))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen())
    }
}

/// Owns the global, per-method and per-caller limiters
pub struct LimiterRegistry {
    global: Arc<TokenBucket>,
    methods: RwLock<HashMap<String, Arc<TokenBucket>>>,
    callers: DashMap<String, Arc<CallerEntry>>,
    caller_template: RwLock<Option<BucketTemplate>>,
    sweep_interval: Duration,
    max_idle: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl LimiterRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        config.validate()?;

        let methods = config
            .methods
            .iter()
            .map(|(method, spec)| Ok((method.clone(), Arc::new(TokenBucket::new(*spec)?))))
            .collect::<Result<HashMap<_, _>>>()?;

        let caller_template = config.per_caller.map(BucketTemplate::new).transpose()?;

        Ok(Self {
            global: Arc::new(TokenBucket::new(config.global)?),
            methods: RwLock::new(methods),
            callers: DashMap::new(),
            caller_template: RwLock::new(caller_template),
            sweep_interval: config.sweep_interval,
            max_idle: config.max_idle,
            metrics: None,
        })
    }

    /// Report caller limiter creation to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Create or replace the limiter for `method`
    pub fn set_method_limit(&self, method: &str, rate: f64, burst: u32) -> Result<()> {
        let limiter = Arc::new(TokenBucket::new(LimitSpec::new(rate, burst))?);
        self.methods.write().insert(method.to_string(), limiter);
        debug!(method, rate, burst, "method limit set");
        Ok(())
    }

    /// Drop a method override so the method falls back to the global limiter
    pub fn remove_method_limit(&self, method: &str) -> bool {
        self.methods.write().remove(method).is_some()
    }

    /// Set the template for caller limiters created from now on.
    /// A non-positive rate turns per-caller limiting off.
    pub fn set_caller_limit(&self, rate: f64, burst: u32) -> Result<()> {
        let template = if rate <= 0.0 {
            None
        } else {
            Some(BucketTemplate::new(LimitSpec::new(rate, burst))?)
        };
        *self.caller_template.write() = template;
        debug!(rate, burst, "caller limit template set");
        Ok(())
    }

    pub fn caller_limiting_enabled(&self) -> bool {
        self.caller_template.read().is_some()
    }

    pub fn caller_limit(&self) -> Option<LimitSpec> {
        self.caller_template.read().as_ref().map(BucketTemplate::spec)
    }

    pub fn global_limiter(&self) -> &Arc<TokenBucket> {
        &self.global
    }

    /// Limiter for `method`, or the global limiter when none is configured
    pub fn resolve_method_limiter(&self, method: &str) -> Arc<TokenBucket> {
        self.methods
            .read()
            .get(method)
            .cloned()
            .unwrap_or_else(|| self.global.clone())
    }

    /// Limiter entry for `identity`, created on first use and marked as seen at `now`.
    ///
    /// Returns `None` when per-caller limiting is off. At most one entry ever
    /// exists per identity: creation happens inside the shard's entry lock.
    /// The refresh happens while the shard lock is held, so the returned entry
    /// is still in the table and the sweeper's re-check sees the new `last_seen`.
    pub fn resolve_caller_limiter(&self, identity: &str, now: Instant) -> Option<Arc<CallerEntry>> {
        let template = self.caller_template.read().clone()?;

        if let Some(existing) = self.callers.get(identity) {
            existing.touch(now);
            return Some(existing.value().clone());
        }

        let entry = match self.callers.entry(identity.to_string()) {
            Entry::Occupied(occupied) => {
                occupied.get().touch(now);
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(CallerEntry::new(template.build(), now));
                vacant.insert(entry.clone());
                if let Some(metrics) = &self.metrics {
                    metrics.inc_caller_limiters();
                }
                debug!(caller = identity, "caller limiter created");
                entry
            }
        };
        Some(entry)
    }

    /// Remove caller entries idle for longer than the configured max age.
    ///
    /// Candidates are collected under shard read locks and each one is
    /// re-checked when removed, so a caller seen after the scan is kept.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let stale = self.stale_callers(now);
        self.evict_stale(&stale, now)
    }

    pub(crate) fn stale_callers(&self, now: Instant) -> Vec<String> {
        self.callers
            .iter()
            .filter(|entry| entry.value().idle_for(now) > self.max_idle)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub(crate) fn evict_stale(&self, stale: &[String], now: Instant) -> usize {
        let mut evicted = 0;
        for identity in stale {
            let removed = self
                .callers
                .remove_if(identity.as_str(), |_, entry| entry.idle_for(now) > self.max_idle);
            if removed.is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    pub fn contains_caller(&self, identity: &str) -> bool {
        self.callers.contains_key(identity)
    }

    pub fn caller_count(&self) -> usize {
        self.callers.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.read().len()
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }
}
