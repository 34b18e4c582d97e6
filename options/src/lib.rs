// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! Layered resolution of the engine-level settings named in §6 of the
//! core design: cache directory, max cache size, telemetry enable flag,
//! determinism strict-mode flag, retry cap override, scheduler shard
//! count, and default action timeout.
//!
//! Precedence, highest first: explicit override (what a CLI collaborator
//! parsed from flags) > environment variable (`BUILD_*`) > repo-root TOML
//! config file > built-in default. This mirrors the Flag > Env > Config >
//! Default precedence this workspace's option system already uses,
//! flattened from per-subsystem scopes down to the single set of knobs
//! the core reads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use errors::{BuildError, ErrorKind};
use serde::Deserialize;

const ENV_PREFIX: &str = "BUILD_";
const CONFIG_FILE_NAME: &str = "build.toml";

/// One layer of input, in descending precedence. `Source::Default` is
/// always present as the final fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    Flag,
    Env,
    Config,
    Default,
}

/// Raw values gathered from the environment and an optional config file,
/// before being interpreted into a typed [`EngineOptions`].
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cache_dir: Option<String>,
    #[serde(default)]
    max_cache_bytes: Option<u64>,
    #[serde(default)]
    telemetry: Option<bool>,
    #[serde(default)]
    determinism_strict: Option<bool>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    scheduler_shards: Option<usize>,
    #[serde(default)]
    action_timeout_secs: Option<u64>,
    #[serde(default)]
    coordinator_address: Option<String>,
}

/// Fully-resolved engine settings, plus which [`Source`] won each field
/// (exposed via [`EngineOptions::provenance`] for `--explain`-style
/// diagnostics).
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub cache_dir: PathBuf,
    pub max_cache_bytes: u64,
    pub telemetry_enabled: bool,
    pub determinism_strict: bool,
    pub max_retries: u32,
    pub scheduler_shards: usize,
    pub default_action_timeout: Duration,
    pub coordinator_address: String,
    provenance: BTreeMap<&'static str, Source>,
}

impl EngineOptions {
    pub fn provenance(&self, field: &str) -> Option<&'static str> {
        self.provenance.get(field).map(|s| match s {
            Source::Flag => "flag",
            Source::Env => "env",
            Source::Config => "config",
            Source::Default => "default",
        })
    }
}

/// Explicit overrides a CLI collaborator has already parsed from flags.
/// Any field left `None` falls through to env/config/default.
#[derive(Debug, Default, Clone)]
pub struct FlagOverrides {
    pub cache_dir: Option<PathBuf>,
    pub max_cache_bytes: Option<u64>,
    pub telemetry_enabled: Option<bool>,
    pub determinism_strict: Option<bool>,
    pub max_retries: Option<u32>,
    pub scheduler_shards: Option<usize>,
    pub default_action_timeout: Option<Duration>,
    pub coordinator_address: Option<String>,
}

/// Resolve [`EngineOptions`] by reading `repo_root/build.toml` (if
/// present), the process environment, and the given flag overrides, in
/// that ascending order of precedence.
pub fn resolve(repo_root: &Path, flags: &FlagOverrides) -> Result<EngineOptions, BuildError> {
    let config = read_config_file(repo_root)?;
    let mut provenance = BTreeMap::new();

    let cache_dir = resolve_path_field(
        flags.cache_dir.clone(),
        "CACHE_DIR",
        config.cache_dir.as_deref(),
        &mut provenance,
        "cache_dir",
        || default_cache_dir(repo_root),
    );

    let max_cache_bytes = resolve_parsed_field(
        flags.max_cache_bytes,
        "MAX_CACHE_BYTES",
        config.max_cache_bytes,
        &mut provenance,
        "max_cache_bytes",
        4 * 1024 * 1024 * 1024,
    )?;

    let telemetry_enabled = resolve_bool_field(
        flags.telemetry_enabled,
        "TELEMETRY",
        config.telemetry,
        &mut provenance,
        "telemetry_enabled",
        false,
    )?;

    let determinism_strict = resolve_bool_field(
        flags.determinism_strict,
        "DETERMINISM_STRICT",
        config.determinism_strict,
        &mut provenance,
        "determinism_strict",
        false,
    )?;

    let max_retries = resolve_parsed_field(
        flags.max_retries,
        "MAX_RETRIES",
        config.max_retries,
        &mut provenance,
        "max_retries",
        3,
    )?;

    let scheduler_shards = resolve_parsed_field(
        flags.scheduler_shards,
        "SCHEDULER_SHARDS",
        config.scheduler_shards,
        &mut provenance,
        "scheduler_shards",
        default_shard_count(),
    )?;

    let default_action_timeout = match flags.default_action_timeout {
        Some(v) => {
            provenance.insert("default_action_timeout", Source::Flag);
            v
        }
        None => {
            let secs = resolve_parsed_field(
                None,
                "ACTION_TIMEOUT_SECS",
                config.action_timeout_secs,
                &mut provenance,
                "default_action_timeout",
                15 * 60,
            )?;
            Duration::from_secs(secs)
        }
    };

    let coordinator_address = resolve_string_field(
        flags.coordinator_address.clone(),
        "COORDINATOR_ADDRESS",
        config.coordinator_address.as_deref(),
        &mut provenance,
        "coordinator_address",
        "0.0.0.0:9000",
    );

    Ok(EngineOptions {
        cache_dir,
        max_cache_bytes,
        telemetry_enabled,
        determinism_strict,
        max_retries,
        scheduler_shards,
        default_action_timeout,
        coordinator_address,
        provenance,
    })
}

fn env_key(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

fn read_config_file(repo_root: &Path) -> Result<ConfigFile, BuildError> {
    let path = repo_root.join(CONFIG_FILE_NAME);
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        BuildError::new(
            ErrorKind::ConfigInvalid,
            format!("failed to read {}: {e}", path.display()),
        )
    })?;
    toml::from_str(&raw).map_err(|e| {
        BuildError::new(
            ErrorKind::ConfigInvalid,
            format!("failed to parse {}: {e}", path.display()),
        )
    })
}

fn resolve_path_field(
    flag: Option<PathBuf>,
    env_name: &str,
    config: Option<&str>,
    provenance: &mut BTreeMap<&'static str, Source>,
    key: &'static str,
    default: impl FnOnce() -> PathBuf,
) -> PathBuf {
    if let Some(v) = flag {
        provenance.insert(key, Source::Flag);
        return v;
    }
    if let Ok(v) = std::env::var(env_key(env_name)) {
        provenance.insert(key, Source::Env);
        return PathBuf::from(v);
    }
    if let Some(v) = config {
        provenance.insert(key, Source::Config);
        return PathBuf::from(v);
    }
    provenance.insert(key, Source::Default);
    default()
}

fn resolve_string_field(
    flag: Option<String>,
    env_name: &str,
    config: Option<&str>,
    provenance: &mut BTreeMap<&'static str, Source>,
    key: &'static str,
    default: &str,
) -> String {
    if let Some(v) = flag {
        provenance.insert(key, Source::Flag);
        return v;
    }
    if let Ok(v) = std::env::var(env_key(env_name)) {
        provenance.insert(key, Source::Env);
        return v;
    }
    if let Some(v) = config {
        provenance.insert(key, Source::Config);
        return v.to_string();
    }
    provenance.insert(key, Source::Default);
    default.to_string()
}

fn resolve_bool_field(
    flag: Option<bool>,
    env_name: &str,
    config: Option<bool>,
    provenance: &mut BTreeMap<&'static str, Source>,
    key: &'static str,
    default: bool,
) -> Result<bool, BuildError> {
    if let Some(v) = flag {
        provenance.insert(key, Source::Flag);
        return Ok(v);
    }
    if let Ok(raw) = std::env::var(env_key(env_name)) {
        let v = parse_bool(&raw).ok_or_else(|| {
            BuildError::new(
                ErrorKind::ConfigInvalid,
                format!("{} must be a boolean, got {raw:?}", env_key(env_name)),
            )
        })?;
        provenance.insert(key, Source::Env);
        return Ok(v);
    }
    if let Some(v) = config {
        provenance.insert(key, Source::Config);
        return Ok(v);
    }
    provenance.insert(key, Source::Default);
    Ok(default)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_parsed_field<T>(
    flag: Option<T>,
    env_name: &str,
    config: Option<T>,
    provenance: &mut BTreeMap<&'static str, Source>,
    key: &'static str,
    default: T,
) -> Result<T, BuildError>
where
    T: std::str::FromStr,
{
    if let Some(v) = flag {
        provenance.insert(key, Source::Flag);
        return Ok(v);
    }
    if let Ok(raw) = std::env::var(env_key(env_name)) {
        let v = raw.parse::<T>().map_err(|_| {
            BuildError::new(
                ErrorKind::ConfigInvalid,
                format!("{} has an invalid value: {raw:?}", env_key(env_name)),
            )
        })?;
        provenance.insert(key, Source::Env);
        return Ok(v);
    }
    if let Some(v) = config {
        provenance.insert(key, Source::Config);
        return Ok(v);
    }
    provenance.insert(key, Source::Default);
    Ok(default)
}

fn default_cache_dir(repo_root: &Path) -> PathBuf {
    dirs_next::cache_dir()
        .map(|d| d.join("build-engine"))
        .unwrap_or_else(|| repo_root.join(".build-cache"))
}

/// Mirrors the Scheduler's own floor: at least 16 shards, rounded up to a
/// power of two so `hash(action_id) mod N` stays a cheap mask.
fn default_shard_count() -> usize {
    num_cpus_floor(16)
}

fn num_cpus_floor(min: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4);
    cpus.max(min).next_power_of_two()
}

#[cfg(test)]
mod tests;
