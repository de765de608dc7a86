//! Engine configuration.
//!
//! Configuration is layered, lowest precedence first:
//!
//! 1. built-in defaults,
//! 2. the `[engine]` table of a `weft.toml` in the working directory,
//! 3. `WEFT_*` environment variables (e.g. `WEFT_RESULT_CACHE=filesystem`).
//!
//! Loading is best-effort: a missing or malformed file and unparseable
//! environment values fall back to the layer below rather than failing the
//! process. The merged configuration is memoized process-wide;
//! [`EngineConfig::reload`] clears the memo (used by tests that mutate the
//! environment).

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "WEFT_";

/// Config file consulted in the working directory.
const CONFIG_FILE: &str = "weft.toml";

/// Where task bodies execute by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Await on the scheduler's cooperative runtime.
    #[default]
    Async,
    /// Offload to the shared blocking thread pool.
    Thread,
    /// Offload to a worker subprocess.
    Process,
}

impl FromStr for ExecutorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "async" => Ok(Self::Async),
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            _ => Err(()),
        }
    }
}

/// Result cache backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    /// Process-local map with an optional LRU bound.
    #[default]
    Memory,
    /// One file per key under `result_cache_path`.
    Filesystem,
}

impl FromStr for CacheBackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "memory" => Ok(Self::Memory),
            "filesystem" => Ok(Self::Filesystem),
            _ => Err(()),
        }
    }
}

/// Artifact store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactBackendKind {
    /// Handle → value map, lives and dies with the process.
    #[default]
    Memory,
    /// One blob file per handle under `artifact_store_path`.
    Filesystem,
}

impl FromStr for ArtifactBackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "memory" => Ok(Self::Memory),
            "filesystem" => Ok(Self::Filesystem),
            _ => Err(()),
        }
    }
}

/// On-disk codec for the filesystem artifact store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSerializerKind {
    /// Raw JSON bytes; human-readable, restricted to JSON values.
    #[default]
    Json,
    /// Binary envelope (bincode-framed JSON payload).
    Bincode,
}

impl FromStr for ArtifactSerializerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "json" => Ok(Self::Json),
            "bincode" => Ok(Self::Bincode),
            _ => Err(()),
        }
    }
}

/// The merged engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    /// Default execution mode for tasks that do not set one.
    pub default_executor: ExecutorKind,
    /// Log level handed to the logging collaborator.
    pub log_level: String,
    /// Guardrail on the total number of dynamically-expanded children per run.
    pub max_dynamic_tasks: usize,
    /// Artifact store backend.
    pub artifact_store: ArtifactBackendKind,
    /// Root directory for the filesystem artifact store.
    pub artifact_store_path: PathBuf,
    /// Codec used by the filesystem artifact store.
    pub artifact_serializer: ArtifactSerializerKind,
    /// Result cache backend.
    pub result_cache: CacheBackendKind,
    /// Root directory for the filesystem result cache.
    pub result_cache_path: PathBuf,
    /// Optional LRU bound for the memory result cache.
    pub result_cache_max_entries: Option<usize>,
    /// Bound on concurrently-running worker subprocesses.
    pub process_pool_max_workers: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_executor: ExecutorKind::Async,
            log_level: "info".to_string(),
            max_dynamic_tasks: 2048,
            artifact_store: ArtifactBackendKind::Memory,
            artifact_store_path: PathBuf::from(".weft/artifacts"),
            artifact_serializer: ArtifactSerializerKind::Json,
            result_cache: CacheBackendKind::Memory,
            result_cache_path: PathBuf::from(".weft/cache"),
            result_cache_max_entries: None,
            process_pool_max_workers: None,
        }
    }
}

/// Partial configuration as it appears in `weft.toml`.
#[derive(Debug, Default, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    engine: RawEngineConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEngineConfig {
    default_executor: Option<ExecutorKind>,
    log_level: Option<String>,
    max_dynamic_tasks: Option<usize>,
    artifact_store: Option<ArtifactBackendKind>,
    artifact_store_path: Option<PathBuf>,
    artifact_serializer: Option<ArtifactSerializerKind>,
    result_cache: Option<CacheBackendKind>,
    result_cache_path: Option<PathBuf>,
    result_cache_max_entries: Option<usize>,
    process_pool_max_workers: Option<usize>,
}

impl EngineConfig {
    /// Loads the layered configuration: defaults, then `weft.toml`, then
    /// `WEFT_*` environment variables.
    #[must_use]
    pub fn load() -> Self {
        let mut cfg = Self::default();
        if let Ok(text) = std::fs::read_to_string(CONFIG_FILE) {
            if let Ok(raw) = toml::from_str::<RawConfigFile>(&text) {
                cfg.apply_raw(raw.engine);
            }
        }
        cfg.apply_env();
        cfg
    }

    /// Returns the memoized process-wide configuration, loading it on first
    /// use.
    #[must_use]
    pub fn global() -> Arc<Self> {
        let guard = global_slot().read().expect("config lock poisoned");
        if let Some(cfg) = guard.as_ref() {
            return Arc::clone(cfg);
        }
        drop(guard);

        let mut guard = global_slot().write().expect("config lock poisoned");
        // Another thread may have raced us here.
        if let Some(cfg) = guard.as_ref() {
            return Arc::clone(cfg);
        }
        let cfg = Arc::new(Self::load());
        *guard = Some(Arc::clone(&cfg));
        cfg
    }

    /// Discards the memoized configuration and reloads from all sources.
    #[must_use]
    pub fn reload() -> Arc<Self> {
        let mut guard = global_slot().write().expect("config lock poisoned");
        let cfg = Arc::new(Self::load());
        *guard = Some(Arc::clone(&cfg));
        cfg
    }

    fn apply_raw(&mut self, raw: RawEngineConfig) {
        if let Some(v) = raw.default_executor {
            self.default_executor = v;
        }
        if let Some(v) = raw.log_level {
            self.log_level = v;
        }
        if let Some(v) = raw.max_dynamic_tasks {
            self.max_dynamic_tasks = v;
        }
        if let Some(v) = raw.artifact_store {
            self.artifact_store = v;
        }
        if let Some(v) = raw.artifact_store_path {
            self.artifact_store_path = v;
        }
        if let Some(v) = raw.artifact_serializer {
            self.artifact_serializer = v;
        }
        if let Some(v) = raw.result_cache {
            self.result_cache = v;
        }
        if let Some(v) = raw.result_cache_path {
            self.result_cache_path = v;
        }
        if let Some(v) = raw.result_cache_max_entries {
            self.result_cache_max_entries = Some(v);
        }
        if let Some(v) = raw.process_pool_max_workers {
            self.process_pool_max_workers = Some(v);
        }
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_parse::<ExecutorKind>("DEFAULT_EXECUTOR") {
            self.default_executor = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}LOG_LEVEL")) {
            self.log_level = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_DYNAMIC_TASKS") {
            self.max_dynamic_tasks = v;
        }
        if let Some(v) = env_parse::<ArtifactBackendKind>("ARTIFACT_STORE") {
            self.artifact_store = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}ARTIFACT_STORE_PATH")) {
            self.artifact_store_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<ArtifactSerializerKind>("ARTIFACT_SERIALIZER") {
            self.artifact_serializer = v;
        }
        if let Some(v) = env_parse::<CacheBackendKind>("RESULT_CACHE") {
            self.result_cache = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}RESULT_CACHE_PATH")) {
            self.result_cache_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<usize>("RESULT_CACHE_MAX_ENTRIES") {
            self.result_cache_max_entries = Some(v);
        }
        if let Some(v) = env_parse::<usize>("PROCESS_POOL_MAX_WORKERS") {
            self.process_pool_max_workers = Some(v);
        }
    }
}

/// Parses `WEFT_<key>`; unparseable values are ignored so a stray
/// environment variable cannot take the engine down.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .and_then(|v| v.parse().ok())
}

fn global_slot() -> &'static RwLock<Option<Arc<EngineConfig>>> {
    static SLOT: RwLock<Option<Arc<EngineConfig>>> = RwLock::new(None);
    &SLOT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_dynamic_tasks, 2048);
        assert_eq!(cfg.default_executor, ExecutorKind::Async);
        assert_eq!(cfg.result_cache, CacheBackendKind::Memory);
        assert_eq!(cfg.artifact_serializer, ArtifactSerializerKind::Json);
        assert!(cfg.process_pool_max_workers.is_none());
    }

    #[test]
    fn toml_layer_overrides_defaults() {
        let mut cfg = EngineConfig::default();
        let raw: RawConfigFile = toml::from_str(
            r#"
            [engine]
            result_cache = "filesystem"
            result_cache_path = "/tmp/weft-test-cache"
            max_dynamic_tasks = 16
            "#,
        )
        .unwrap();
        cfg.apply_raw(raw.engine);
        assert_eq!(cfg.result_cache, CacheBackendKind::Filesystem);
        assert_eq!(cfg.result_cache_path, PathBuf::from("/tmp/weft-test-cache"));
        assert_eq!(cfg.max_dynamic_tasks, 16);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.artifact_store, ArtifactBackendKind::Memory);
    }

    #[test]
    fn malformed_toml_table_is_rejected_as_a_unit() {
        let parsed = toml::from_str::<RawConfigFile>("[engine]\nresult_cache = 7\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn executor_kind_parses_known_names_only() {
        assert_eq!("process".parse::<ExecutorKind>(), Ok(ExecutorKind::Process));
        assert!("fiber".parse::<ExecutorKind>().is_err());
    }
}
