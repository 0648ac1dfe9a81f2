// Integration tests for settings loading
//
// Only file-based sources are exercised here; environment overrides are
// process-global and would leak across parallel tests.

use lp_scan_engine::jobs::options::{BackoffPolicy, RateLimit};
use lp_scan_engine::settings::{Settings, StoreBackend};
use std::io::Write;
use tempfile::NamedTempFile;

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn load(file: &NamedTempFile) -> Result<Settings, config::ConfigError> {
    Settings::load(file.path().to_str().unwrap())
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let settings = Settings::load(path.to_str().unwrap()).unwrap();

    assert_eq!(settings.cache.fast_access_ttl_secs, 60);
    assert_eq!(settings.cache.read_heavy_ttl_secs, 600);
    assert_eq!(settings.queues.defaults.concurrency, 2);
    assert!(settings.queues.overrides.is_empty());
    assert_eq!(settings.schedules.cleanup_max_age_hours, 24);
    assert_eq!(settings.shutdown.grace_timeout_ms, 30_000);
}

#[test]
fn test_file_values_and_queue_overrides() {
    let file = toml_file(
        r#"
[cache]
read_heavy_ttl_secs = 120
persistent_ttl_secs = 86400

[store]
backend = "redis"

[queues.defaults]
concurrency = 3
job_timeout_ms = 45000

[queues.overrides.price-refresh]
rate_limit = { max = 30, duration_ms = 60000 }
attempts = 5
backoff = { type = "exponential", delay_ms = 250 }

[queues.overrides.wallet-scan]
concurrency = 8

[schedules]
warmup_every_secs = 1800

[shutdown]
grace_timeout_ms = 5000
"#,
    );
    let settings = load(&file).unwrap();

    assert_eq!(settings.cache.read_heavy_ttl_secs, 120);
    assert_eq!(settings.cache.fast_access_ttl_secs, 60);
    assert_eq!(settings.cache.persistent_ttl_secs, Some(86_400));
    assert_eq!(settings.store.backend, StoreBackend::Redis);
    assert_eq!(settings.queues.defaults.concurrency, 3);
    assert_eq!(settings.queues.defaults.job_timeout_ms, Some(45_000));
    // untouched keys in a partially specified table keep their defaults
    assert_eq!(settings.queues.defaults.poll_interval_ms, 250);

    let price = &settings.queues.overrides["price-refresh"];
    assert_eq!(
        price.rate_limit,
        Some(RateLimit {
            max: 30,
            duration_ms: 60_000
        })
    );
    assert_eq!(price.attempts, Some(5));
    assert_eq!(price.backoff, Some(BackoffPolicy::Exponential { delay_ms: 250 }));
    assert_eq!(settings.queues.overrides["wallet-scan"].concurrency, Some(8));

    assert_eq!(settings.schedules.warmup_every_secs, Some(1_800));
    assert_eq!(settings.schedules.price_refresh_every_secs, Some(60));
    assert_eq!(settings.shutdown.grace_timeout_ms, 5_000);
}

#[test]
fn test_invalid_values_are_rejected_at_load() {
    let bad_threshold = toml_file("[cache]\nread_heavy_refresh_threshold = 1.5\n");
    let err = load(&bad_threshold).unwrap_err();
    assert!(err.to_string().contains("read_heavy_refresh_threshold"));

    let zero_concurrency = toml_file("[queues.overrides.risk-analysis]\nconcurrency = 0\n");
    let err = load(&zero_concurrency).unwrap_err();
    assert!(err.to_string().contains("risk-analysis"));

    let empty_rate = toml_file("[queues.overrides.price-refresh]\nrate_limit = { max = 0, duration_ms = 1000 }\n");
    assert!(load(&empty_rate).is_err());

    let zero_schedule = toml_file("[schedules]\ncleanup_every_secs = 0\n");
    assert!(load(&zero_schedule).is_err());
}

#[test]
fn test_shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/Config.toml");
    let settings = Settings::load(path).unwrap();
    assert_eq!(settings.warmup.top_protocols, vec!["uniswap-v3", "curve"]);
    assert_eq!(settings.queues.overrides["wallet-scan"].concurrency, Some(4));
}
