use std::sync::Mutex;

use tempfile::tempdir;

use super::*;

// Environment variables are process-global, so tests that touch them serialize
// behind this lock to avoid racing each other.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "BUILD_CACHE_DIR",
        "BUILD_MAX_CACHE_BYTES",
        "BUILD_TELEMETRY",
        "BUILD_DETERMINISM_STRICT",
        "BUILD_MAX_RETRIES",
        "BUILD_SCHEDULER_SHARDS",
        "BUILD_ACTION_TIMEOUT_SECS",
        "BUILD_COORDINATOR_ADDRESS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_apply_with_no_env_no_config_no_flags() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let opts = resolve(dir.path(), &FlagOverrides::default()).unwrap();
    assert_eq!(opts.max_retries, 3);
    assert!(!opts.telemetry_enabled);
    assert!(!opts.determinism_strict);
    assert_eq!(opts.provenance("max_retries"), Some("default"));
}

#[test]
fn env_overrides_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("build.toml"), "max_retries = 9\n").unwrap();
    std::env::set_var("BUILD_MAX_RETRIES", "5");

    let opts = resolve(dir.path(), &FlagOverrides::default()).unwrap();
    assert_eq!(opts.max_retries, 5);
    assert_eq!(opts.provenance("max_retries"), Some("env"));

    std::env::remove_var("BUILD_MAX_RETRIES");
}

#[test]
fn config_file_overrides_default() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("build.toml"), "telemetry = true\n").unwrap();

    let opts = resolve(dir.path(), &FlagOverrides::default()).unwrap();
    assert!(opts.telemetry_enabled);
    assert_eq!(opts.provenance("telemetry_enabled"), Some("config"));
}

#[test]
fn flag_overrides_everything() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("build.toml"), "max_retries = 9\n").unwrap();
    std::env::set_var("BUILD_MAX_RETRIES", "5");

    let flags = FlagOverrides {
        max_retries: Some(1),
        ..Default::default()
    };
    let opts = resolve(dir.path(), &flags).unwrap();
    assert_eq!(opts.max_retries, 1);
    assert_eq!(opts.provenance("max_retries"), Some("flag"));

    std::env::remove_var("BUILD_MAX_RETRIES");
}

#[test]
fn invalid_env_value_is_a_config_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    std::env::set_var("BUILD_MAX_RETRIES", "not-a-number");

    let err = resolve(dir.path(), &FlagOverrides::default()).unwrap_err();
    assert_eq!(err.kind(), errors::ErrorKind::ConfigInvalid);

    std::env::remove_var("BUILD_MAX_RETRIES");
}

#[test]
fn scheduler_shard_default_is_a_power_of_two_at_least_sixteen() {
    let n = default_shard_count();
    assert!(n >= 16);
    assert_eq!(n & (n - 1), 0, "{n} is not a power of two");
}
