//! The engine runtime: one value owning every pluggable subsystem.
//!
//! Caches, artifact stores, middleware, tracer, metrics, secrets, the event
//! bus, and the process-task registry all hang off a [`Runtime`]. A
//! process-wide default instance (see [`runtime()`]) keeps the ergonomic
//! path ergonomic; tests and embedders construct explicit runtimes with
//! [`Runtime::with_config`] and pass them to `Flow::run_with`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tokio::sync::Semaphore;
use tracing::warn;

use weft_core::config::{ArtifactBackendKind, CacheBackendKind};
use weft_core::EngineConfig;

use crate::artifacts::{ArtifactStore, FileSystemArtifactStore, InMemoryArtifactStore};
use crate::cache::{FileSystemResultCache, InFlightMap, InMemoryResultCache, ResultCache};
use crate::context::RunContext;
use crate::error::Result;
use crate::events::EventBus;
use crate::metrics::{InMemoryMetrics, MetricsProvider};
use crate::middleware::Middleware;
use crate::secrets::{EnvSecrets, SecretsProvider};
use crate::task::TaskDefinition;
use crate::trace::{NoopTracer, Tracer};
use crate::value::TaskValue;

/// Owner of every pluggable engine subsystem.
pub struct Runtime {
    config: EngineConfig,
    cache: Box<dyn ResultCache>,
    inflight: InFlightMap,
    artifacts: Box<dyn ArtifactStore>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    tracer: RwLock<Arc<dyn Tracer>>,
    metrics: RwLock<Arc<dyn MetricsProvider>>,
    secrets: RwLock<Arc<dyn SecretsProvider>>,
    events: EventBus,
    tasks: RwLock<HashMap<String, TaskDefinition>>,
    process_slots: Arc<Semaphore>,
    current_run: RwLock<Option<Arc<RunContext>>>,
}

impl Runtime {
    /// Builds a runtime from an explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails when a filesystem backend root cannot be created.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let cache: Box<dyn ResultCache> = match config.result_cache {
            CacheBackendKind::Memory => {
                Box::new(InMemoryResultCache::new(config.result_cache_max_entries))
            }
            CacheBackendKind::Filesystem => {
                Box::new(FileSystemResultCache::new(&config.result_cache_path)?)
            }
        };
        let artifacts: Box<dyn ArtifactStore> = match config.artifact_store {
            ArtifactBackendKind::Memory => Box::new(InMemoryArtifactStore::new()),
            ArtifactBackendKind::Filesystem => Box::new(FileSystemArtifactStore::new(
                &config.artifact_store_path,
                config.artifact_serializer,
            )?),
        };
        let process_slots = match config.process_pool_max_workers {
            Some(n) if n > 0 => Arc::new(Semaphore::new(n)),
            _ => Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        };

        Ok(Self {
            config,
            cache,
            inflight: InFlightMap::new(),
            artifacts,
            middleware: RwLock::new(Vec::new()),
            tracer: RwLock::new(Arc::new(NoopTracer)),
            metrics: RwLock::new(Arc::new(InMemoryMetrics::new())),
            secrets: RwLock::new(Arc::new(EnvSecrets)),
            events: EventBus::new(),
            tasks: RwLock::new(HashMap::new()),
            process_slots,
            current_run: RwLock::new(None),
        })
    }

    /// The configuration this runtime was built from.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The result cache backend.
    #[must_use]
    pub fn cache(&self) -> &dyn ResultCache {
        self.cache.as_ref()
    }

    /// The single-flight table.
    #[must_use]
    pub fn inflight(&self) -> &InFlightMap {
        &self.inflight
    }

    /// The artifact store backend.
    #[must_use]
    pub fn artifacts(&self) -> &dyn ArtifactStore {
        self.artifacts.as_ref()
    }

    /// Appends a middleware layer. Dispatches started after registration see
    /// the new chain.
    pub fn register_middleware(&self, layer: Arc<dyn Middleware>) {
        self.middleware
            .write()
            .expect("middleware lock poisoned")
            .push(layer);
    }

    pub(crate) fn middleware_snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.middleware
            .read()
            .expect("middleware lock poisoned")
            .clone()
    }

    /// The active tracer.
    #[must_use]
    pub fn tracer(&self) -> Arc<dyn Tracer> {
        Arc::clone(&self.tracer.read().expect("tracer lock poisoned"))
    }

    /// Replaces the tracer.
    pub fn set_tracer(&self, tracer: Arc<dyn Tracer>) {
        *self.tracer.write().expect("tracer lock poisoned") = tracer;
    }

    /// The active metrics provider.
    #[must_use]
    pub fn metrics(&self) -> Arc<dyn MetricsProvider> {
        Arc::clone(&self.metrics.read().expect("metrics lock poisoned"))
    }

    /// Replaces the metrics provider.
    pub fn set_metrics_provider(&self, provider: Arc<dyn MetricsProvider>) {
        *self.metrics.write().expect("metrics lock poisoned") = provider;
    }

    /// The active secrets provider.
    #[must_use]
    pub fn secrets(&self) -> Arc<dyn SecretsProvider> {
        Arc::clone(&self.secrets.read().expect("secrets lock poisoned"))
    }

    /// Replaces the secrets provider.
    pub fn set_secrets_provider(&self, provider: Arc<dyn SecretsProvider>) {
        *self.secrets.write().expect("secrets lock poisoned") = provider;
    }

    /// Looks up a secret through the active provider.
    #[must_use]
    pub fn secret(&self, key: &str) -> Option<String> {
        self.secrets().get(key)
    }

    /// Registers a task by name so worker subprocesses can find it. Required
    /// for process-mode tasks; harmless otherwise.
    pub fn register_task(&self, task: &TaskDefinition) {
        self.tasks
            .write()
            .expect("task registry lock poisoned")
            .insert(task.name().to_string(), task.clone());
    }

    /// Looks up a registered task by name.
    #[must_use]
    pub fn task(&self, name: &str) -> Option<TaskDefinition> {
        self.tasks
            .read()
            .expect("task registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub(crate) fn process_slots(&self) -> Arc<Semaphore> {
        Arc::clone(&self.process_slots)
    }

    pub(crate) fn install_run_context(&self, ctx: Arc<RunContext>) {
        *self.current_run.write().expect("run context lock poisoned") = Some(ctx);
    }

    pub(crate) fn clear_run_context(&self) {
        *self.current_run.write().expect("run context lock poisoned") = None;
    }

    /// The active run context, or a neutral one outside a run.
    #[must_use]
    pub fn current_context(&self) -> Arc<RunContext> {
        self.current_run
            .read()
            .expect("run context lock poisoned")
            .clone()
            .unwrap_or_else(|| Arc::new(RunContext::neutral()))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The process-wide default runtime, built from the global configuration on
/// first use. Falls back to built-in defaults when a configured filesystem
/// backend cannot be initialized.
#[must_use]
pub fn runtime() -> Arc<Runtime> {
    static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();
    GLOBAL
        .get_or_init(|| {
            let config = EngineConfig::global().as_ref().clone();
            match Runtime::with_config(config) {
                Ok(rt) => Arc::new(rt),
                Err(e) => {
                    warn!(error = %e, "failed to initialize configured backends; using defaults");
                    let rt = Runtime::with_config(EngineConfig::default())
                        .unwrap_or_else(|_| unreachable!("memory backends cannot fail"));
                    Arc::new(rt)
                }
            }
        })
        .clone()
}

/// Subscribes a handler on the default runtime's event bus.
pub fn subscribe(event: impl Into<String>, handler: impl Fn(&TaskValue) + Send + Sync + 'static) {
    runtime().events().subscribe(event, handler);
}

/// Replaces the tracer on the default runtime.
pub fn set_tracer(tracer: Arc<dyn Tracer>) {
    runtime().set_tracer(tracer);
}

/// Replaces the metrics provider on the default runtime.
pub fn set_metrics_provider(provider: Arc<dyn MetricsProvider>) {
    runtime().set_metrics_provider(provider);
}

/// Replaces the secrets provider on the default runtime.
pub fn set_secrets_provider(provider: Arc<dyn SecretsProvider>) {
    runtime().set_secrets_provider(provider);
}

/// Appends a middleware layer on the default runtime.
pub fn register_middleware(layer: Arc<dyn Middleware>) {
    runtime().register_middleware(layer);
}

/// Looks up a secret through the default runtime's provider.
#[must_use]
pub fn secret(key: &str) -> Option<String> {
    runtime().secret(key)
}

/// The current run context, or a neutral context outside a run. Call from
/// inside task bodies to read parameters or observe cancellation.
#[must_use]
pub fn get_context() -> Arc<RunContext> {
    runtime().current_context()
}
