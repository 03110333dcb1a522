//! Run configuration.
//!
//! Everything tunable is resolved once at startup into [`SyncConfig`]
//! and passed down immutably; no stage reads the environment on its
//! own. Defaults depend on the deployment environment: a production
//! deployment gets a smaller reference-cache ceiling because it shares
//! memory with other workloads.

use crate::reference::ReferenceMode;
use std::env;
use std::str::FromStr;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse::<T>().ok())
}

/// How per-row work in a batch is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Parallel,
    Sequential,
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(ProcessingMode::Parallel),
            "sequential" => Ok(ProcessingMode::Sequential),
            other => Err(format!("unknown processing mode '{other}'")),
        }
    }
}

/// Deployment environment. Only affects defaults, never behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Local,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "dev" | "development" => Ok(Environment::Local),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// Default reference-cache ceiling per environment.
const CEILING_PRODUCTION_BYTES: usize = 64 * 1024 * 1024;
const CEILING_LOCAL_BYTES: usize = 256 * 1024 * 1024;

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_CHUNK_SIZE: u32 = 1000;

/// Configuration surface consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Parallel fan-out vs. one-row-at-a-time inside a batch.
    pub mode: ProcessingMode,
    /// Rows per dispatch batch.
    pub batch_size: usize,
    /// Page size for bulk cache preloads.
    pub chunk_size: u32,
    /// Skip the GET lookup before creation. Never applies to
    /// participants; see `EntityResolver`.
    pub skip_lookup: bool,
    /// Memory ceiling for the preloaded reference cache, in bytes.
    pub reference_memory_ceiling: usize,
    /// Force the reference cache strategy instead of letting the
    /// memory heuristic decide.
    pub reference_mode_override: Option<ReferenceMode>,
    pub environment: Environment,
}

impl SyncConfig {
    /// Resolve configuration from the environment.
    ///
    /// | variable                   | default                       |
    /// |----------------------------|-------------------------------|
    /// | `ROSTER_SYNC_MODE`         | `parallel`                    |
    /// | `ROSTER_SYNC_BATCH_SIZE`   | 50                            |
    /// | `ROSTER_SYNC_CHUNK_SIZE`   | 1000                          |
    /// | `ROSTER_SYNC_SKIP_LOOKUP`  | false                         |
    /// | `ROSTER_SYNC_REF_MAX_BYTES`| 64 MiB prod / 256 MiB local   |
    /// | `ROSTER_SYNC_REF_MODE`     | unset (heuristic decides)     |
    /// | `ROSTER_SYNC_ENV`          | `local`                       |
    pub fn from_env() -> Self {
        let environment = env_parse::<Environment>("ROSTER_SYNC_ENV").unwrap_or(Environment::Local);
        Self {
            mode: env_parse::<ProcessingMode>("ROSTER_SYNC_MODE")
                .unwrap_or(ProcessingMode::Parallel),
            batch_size: env_usize("ROSTER_SYNC_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            chunk_size: env_usize("ROSTER_SYNC_CHUNK_SIZE", DEFAULT_CHUNK_SIZE as usize).max(1)
                as u32,
            skip_lookup: env_bool("ROSTER_SYNC_SKIP_LOOKUP", false),
            reference_memory_ceiling: env_usize(
                "ROSTER_SYNC_REF_MAX_BYTES",
                Self::default_ceiling(environment),
            ),
            reference_mode_override: env_parse::<ReferenceMode>("ROSTER_SYNC_REF_MODE"),
            environment,
        }
    }

    pub fn default_ceiling(environment: Environment) -> usize {
        match environment {
            Environment::Production => CEILING_PRODUCTION_BYTES,
            Environment::Local => CEILING_LOCAL_BYTES,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::Parallel,
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip_lookup: false,
            reference_memory_ceiling: CEILING_LOCAL_BYTES,
            reference_mode_override: None,
            environment: Environment::Local,
        }
    }
}
