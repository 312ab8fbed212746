use once_cell::sync::Lazy;

/// Base URL of the upstream runtime API. Defaults to a local instance.
pub static RUNTIME_BASE_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("RUNTIME_BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
});

/// Credential sent as the `X-API-Key` header on every upstream call.
pub static RUNTIME_API_KEY: Lazy<String> =
    Lazy::new(|| std::env::var("RUNTIME_API_KEY").unwrap_or_default());

/// Scheduler tick interval in seconds. Defaults to 60.
pub static SCHEDULER_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("SCHEDULER_INTERVAL")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(60)
});

/// If true, the scheduler loop auto-starts on process init.
pub static SCHEDULER_ENABLED: Lazy<bool> = Lazy::new(|| {
    std::env::var("SCHEDULER_ENABLED")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Seconds to wait before the first migration-status poll.
pub static REMEDIATION_INITIAL_DELAY: Lazy<f64> =
    Lazy::new(|| env_f64("REMEDIATION_INITIAL_DELAY", 10.0));

/// Starting interval between migration-status polls, in seconds.
pub static REMEDIATION_POLL_INTERVAL: Lazy<f64> =
    Lazy::new(|| env_f64("REMEDIATION_POLL_INTERVAL", 10.0));

/// Ceiling on the poll interval after backoff, in seconds.
pub static REMEDIATION_MAX_INTERVAL: Lazy<f64> =
    Lazy::new(|| env_f64("REMEDIATION_MAX_INTERVAL", 60.0));

/// Multiplier applied to the poll interval after every poll.
pub static REMEDIATION_BACKOFF_FACTOR: Lazy<f64> =
    Lazy::new(|| env_f64("REMEDIATION_BACKOFF_FACTOR", 2.0));

/// Hard cap on total polling time per item, in seconds.
pub static REMEDIATION_MAX_DURATION: Lazy<f64> =
    Lazy::new(|| env_f64("REMEDIATION_MAX_DURATION", 1800.0));

/// Address the HTTP facade binds to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP facade binds to. Defaults to `8082`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8082)
});
