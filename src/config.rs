//! Environment-tunable operator configuration (spec.md §6).
//!
//! Every tunable is an integer seconds/count with an enforced bound.
//! Out-of-range values are clamped with a `tracing::warn!`; non-integer
//! values fall back to the default.

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    pub num_workers: u32,
    pub cache_ttl_secs: u64,
    pub policy_cache_ttl_secs: u64,
    pub periodic_reconcile_interval_secs: u64,
    pub queue_max_retries: u32,
    pub queue_initial_retry_delay_secs: u64,
    pub queue_max_retry_delay_secs: u64,
    pub queue_max_retry_cycles: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            num_workers: 3,
            cache_ttl_secs: 300,
            policy_cache_ttl_secs: 60,
            periodic_reconcile_interval_secs: 60,
            queue_max_retries: 5,
            queue_initial_retry_delay_secs: 1,
            queue_max_retry_delay_secs: 300,
            queue_max_retry_cycles: 3,
        }
    }
}

struct Tunable {
    env_var: &'static str,
    min: u64,
    max: u64,
    default: u64,
}

const NUM_WORKERS: Tunable = Tunable { env_var: "NUM_WORKERS", min: 1, max: 20, default: 3 };
const CACHE_TTL: Tunable = Tunable { env_var: "CACHE_TTL", min: 60, max: u64::MAX, default: 300 };
const POLICY_CACHE_TTL: Tunable =
    Tunable { env_var: "POLICY_CACHE_TTL", min: 30, max: 600, default: 60 };
const PERIODIC_RECONCILE_INTERVAL: Tunable =
    Tunable { env_var: "PERIODIC_RECONCILE_INTERVAL", min: 30, max: u64::MAX, default: 60 };
const QUEUE_MAX_RETRIES: Tunable =
    Tunable { env_var: "QUEUE_MAX_RETRIES", min: 1, max: u64::MAX, default: 5 };
const QUEUE_INITIAL_RETRY_DELAY: Tunable =
    Tunable { env_var: "QUEUE_INITIAL_RETRY_DELAY", min: 1, max: u64::MAX, default: 1 };
const QUEUE_MAX_RETRY_DELAY: Tunable =
    Tunable { env_var: "QUEUE_MAX_RETRY_DELAY", min: 60, max: u64::MAX, default: 300 };
const QUEUE_MAX_RETRY_CYCLES: Tunable =
    Tunable { env_var: "QUEUE_MAX_RETRY_CYCLES", min: 0, max: u64::MAX, default: 3 };

fn read_tunable(t: &Tunable, getter: impl Fn(&str) -> Option<String>) -> u64 {
    let Some(raw) = getter(t.env_var) else {
        return t.default;
    };
    let Ok(value) = raw.trim().parse::<i64>() else {
        warn!(
            env_var = t.env_var,
            raw = raw.as_str(),
            "non_integer_tunable_falling_back_to_default"
        );
        return t.default;
    };
    if value < 0 {
        warn!(env_var = t.env_var, value, "negative_tunable_falling_back_to_default");
        return t.default;
    }
    let value = value as u64;
    if value < t.min {
        warn!(env_var = t.env_var, value, min = t.min, "tunable_clamped_to_minimum");
        t.min
    } else if value > t.max {
        warn!(env_var = t.env_var, value, max = t.max, "tunable_clamped_to_maximum");
        t.max
    } else {
        value
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment, applying the clamp
    /// and default-fallback rules of spec.md §6.
    pub fn from_env() -> Self {
        Self::from_getter(|key| std::env::var(key).ok())
    }

    /// Testable variant that takes an explicit lookup function instead of
    /// reading `std::env` directly.
    fn from_getter(getter: impl Fn(&str) -> Option<String>) -> Self {
        OperatorConfig {
            num_workers: read_tunable(&NUM_WORKERS, &getter) as u32,
            cache_ttl_secs: read_tunable(&CACHE_TTL, &getter),
            policy_cache_ttl_secs: read_tunable(&POLICY_CACHE_TTL, &getter),
            periodic_reconcile_interval_secs: read_tunable(&PERIODIC_RECONCILE_INTERVAL, &getter),
            queue_max_retries: read_tunable(&QUEUE_MAX_RETRIES, &getter) as u32,
            queue_initial_retry_delay_secs: read_tunable(&QUEUE_INITIAL_RETRY_DELAY, &getter),
            queue_max_retry_delay_secs: read_tunable(&QUEUE_MAX_RETRY_DELAY, &getter),
            queue_max_retry_cycles: read_tunable(&QUEUE_MAX_RETRY_CYCLES, &getter) as u32,
        }
    }
}
