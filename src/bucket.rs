use governor::{
    clock::DefaultClock, state::direct::NotKeyed, state::InMemoryState, Quota, RateLimiter,
};
use std::{num::NonZeroU32, time::Duration};

use crate::{
    config::LimitSpec,
    error::{GatekeeperError, Result},
};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Validated bucket parameters from which identical buckets are stamped out
#[derive(Debug, Clone, Copy)]
pub struct BucketTemplate {
    spec: LimitSpec,
    quota: Quota,
}

impl BucketTemplate {
    pub fn new(spec: LimitSpec) -> Result<Self> {
        spec.validate()?;

        let burst = NonZeroU32::new(spec.burst)
            .ok_or_else(|| GatekeeperError::Config("burst must be at least 1".to_string()))?;
        let quota = Duration::try_from_secs_f64(1.0 / spec.rate)
            .ok()
            .and_then(Quota::with_period)
            .ok_or_else(|| {
                GatekeeperError::Config(format!("rate {} cannot be represented", spec.rate))
            })?
            .allow_burst(burst);

        Ok(Self { spec, quota })
    }

    pub fn spec(&self) -> LimitSpec {
        self.spec
    }

    /// A fresh, full bucket
    pub fn build(&self) -> TokenBucket {
        TokenBucket {
            limiter: RateLimiter::direct(self.quota),
            spec: self.spec,
        }
    }
}

/// Token bucket admitting `burst` calls at once and refilling at `rate` per second.
///
/// `allow` is lock-free and may be called from any number of tasks at once.
pub struct TokenBucket {
    limiter: DirectLimiter,
    spec: LimitSpec,
}

impl TokenBucket {
    pub fn new(spec: LimitSpec) -> Result<Self> {
        Ok(BucketTemplate::new(spec)?.build())
    }

    /// Consume one token if available
    pub fn allow(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn spec(&self) -> LimitSpec {
        self.spec
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.spec.rate)
            .field("burst", &self.spec.burst)
            .finish()
    }
}
