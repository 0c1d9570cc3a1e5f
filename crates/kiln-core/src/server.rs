//! Server façade: admission, readiness aggregation, in-flight tracking, and
//! graceful stop.
//!
//! The server owns the repository manager and the shared memory pools.
//! Liveness is true from a successful `new` until `stop` returns and never
//! depends on model state; readiness aggregates model states under the
//! configured strictness. Every admitted request holds an in-flight guard
//! until its completion fires, which is what `stop` waits on.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::BackendFactory;
use crate::error::Error;
use crate::manager::{ModelIndexEntry, RepositoryManager};
use crate::memory::PoolSet;
use crate::options::{ControlMode, ServerOptions};
use crate::repository::RepositoryStore;
use crate::request::InferenceRequest;
use crate::response::{InferenceResponse, ResponseAllocator};
use crate::scheduler::ResponseReceiver;

// ─── In-flight tracking ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GaugeInner {
    count: AtomicU64,
    zero: Notify,
}

/// Counts requests admitted but not yet completed.
#[derive(Debug, Clone, Default)]
pub(crate) struct InflightGauge {
    inner: Arc<GaugeInner>,
}

impl InflightGauge {
    fn acquire(&self) -> InflightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until the gauge reaches zero or `deadline` passes.
    async fn wait_zero(&self, deadline: tokio::time::Instant) -> bool {
        loop {
            if self.count() == 0 {
                return true;
            }
            let notified = self.inner.zero.notified();
            if self.count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

/// RAII in-flight token; dropped exactly when a request's completion fires.
#[derive(Debug)]
pub(crate) struct InflightGuard {
    inner: Arc<GaugeInner>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.zero.notify_waiters();
        }
    }
}

// ─── Response future ──────────────────────────────────────────────────────────

/// Completion of one admitted request.
#[derive(Debug)]
pub struct ResponseFuture {
    receiver: ResponseReceiver,
}

impl Future for ResponseFuture {
    type Output = Result<InferenceResponse, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| match result {
            Ok(status) => status,
            Err(_) => Err(Error::Internal(
                "request completion channel closed".into(),
            )),
        })
    }
}

/// Snapshot returned by [`Server::status`].
#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub live: bool,
    pub ready: bool,
    pub inflight: u64,
    pub models: Vec<ModelIndexEntry>,
}

// ─── Server ───────────────────────────────────────────────────────────────────

pub struct Server {
    options: ServerOptions,
    manager: Arc<RepositoryManager>,
    pools: Arc<PoolSet>,
    inflight: InflightGauge,
    live: AtomicBool,
    accepting: AtomicBool,
    startup_models: BTreeSet<String>,
    poll_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("live", &self.live)
            .field("accepting", &self.accepting)
            .field("startup_models", &self.startup_models)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Initialize the server: build pools, discover the repository, and load
    /// startup models per the control mode.
    ///
    /// An unreadable repository root is fatal under strict model config.
    /// Individual startup-model load failures are recorded against the model
    /// and reflected in readiness, not returned here.
    pub async fn new(
        options: ServerOptions,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self, Error> {
        options.validate()?;
        let store = RepositoryStore::new(
            options.model_repository_paths.clone(),
            options.strict_model_config,
        );
        let manager = Arc::new(RepositoryManager::new(store.clone(), factory));
        let pools = Arc::new(PoolSet::from_options(&options));

        let startup_models: BTreeSet<String> = match options.model_control_mode {
            ControlMode::Explicit => options.startup_models.clone(),
            ControlMode::None | ControlMode::Poll => {
                store.scan()?.keys().cloned().collect()
            }
        };
        for name in &startup_models {
            if let Err(e) = manager.load_model(name).await {
                warn!(model = %name, error = %e, "startup model failed to load");
            }
        }

        let poll_task = if options.model_control_mode == ControlMode::Poll {
            let manager = Arc::clone(&manager);
            let interval = options.repository_poll_interval;
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = manager.poll().await {
                        warn!(error = %e, "repository poll failed");
                    }
                }
            }))
        } else {
            None
        };

        info!(
            mode = %options.model_control_mode,
            startup_models = startup_models.len(),
            min_compute_capability = options.min_supported_compute_capability,
            "server initialized"
        );
        Ok(Self {
            options,
            manager,
            pools,
            inflight: InflightGauge::default(),
            live: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            startup_models,
            poll_task: std::sync::Mutex::new(poll_task),
        })
    }

    // ── health ───────────────────────────────────────────────────────────────

    /// True from successful init until `stop` returns; independent of model
    /// state.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Under strict readiness, every startup model must be ready; otherwise
    /// one ready model suffices.
    pub async fn is_ready(&self) -> bool {
        if !self.is_live() || !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        if self.options.strict_readiness {
            for name in &self.startup_models {
                if !self.manager.model_is_ready(name, -1).await {
                    return false;
                }
            }
            true
        } else {
            self.manager.any_ready().await
        }
    }

    pub async fn model_is_ready(&self, name: &str, version: i64) -> bool {
        self.manager.model_is_ready(name, version).await
    }

    pub async fn ready_versions(&self, name: &str) -> Vec<i64> {
        self.manager.ready_versions(name).await
    }

    pub async fn repository_index(&self) -> Vec<ModelIndexEntry> {
        self.manager.index().await
    }

    pub async fn status(&self) -> ServerStatus {
        ServerStatus {
            live: self.is_live(),
            ready: self.is_ready().await,
            inflight: self.inflight.count(),
            models: self.manager.index().await,
        }
    }

    // ── model control ────────────────────────────────────────────────────────

    /// Rescan the repository now. Only meaningful in poll mode.
    pub async fn poll_model_repository(&self) -> Result<(), Error> {
        if self.options.model_control_mode != ControlMode::Poll {
            return Err(Error::InvalidArg(
                "poll_model_repository requires poll control mode".into(),
            ));
        }
        self.manager.poll().await
    }

    /// Explicitly load (or reload) a model. Only allowed in explicit mode.
    pub async fn load_model(&self, name: &str) -> Result<(), Error> {
        if self.options.model_control_mode != ControlMode::Explicit {
            return Err(Error::InvalidArg(
                "load_model requires explicit control mode".into(),
            ));
        }
        self.manager.load_model(name).await
    }

    /// Explicitly unload a model. Only allowed in explicit mode; unloading
    /// an unknown model succeeds.
    pub async fn unload_model(&self, name: &str) -> Result<(), Error> {
        if self.options.model_control_mode != ControlMode::Explicit {
            return Err(Error::InvalidArg(
                "unload_model requires explicit control mode".into(),
            ));
        }
        self.manager.unload_model(name).await;
        Ok(())
    }

    // ── inference ────────────────────────────────────────────────────────────

    /// Admit a request using the server's pool-backed allocator.
    pub async fn infer_async(
        &self,
        request: InferenceRequest,
    ) -> Result<ResponseFuture, Error> {
        self.infer_async_with(request, self.pools.allocator()).await
    }

    /// Admit a request with a caller-supplied response allocator.
    ///
    /// Resolves the backend (policy version for `requested_version <= 0`),
    /// takes an in-flight token, and enqueues. Validation errors surface
    /// here; post-enqueue errors surface through the returned future.
    pub async fn infer_async_with(
        &self,
        request: InferenceRequest,
        allocator: Arc<dyn ResponseAllocator>,
    ) -> Result<ResponseFuture, Error> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::unavailable("server is shutting down"));
        }
        let handle = self
            .manager
            .get_backend(request.model_name(), request.requested_version())
            .await?;
        let guard = self.inflight.acquire();
        let receiver = handle.enqueue_tracked(request, allocator, Some(guard))?;
        Ok(ResponseFuture { receiver })
    }

    /// Admit a request and wait for its completion.
    pub async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, Error> {
        self.infer_async(request).await?.await
    }

    /// Requests admitted but not yet completed.
    pub fn inflight_count(&self) -> u64 {
        self.inflight.count()
    }

    /// The server's shared memory pools.
    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    /// Direct access to the repository manager.
    pub fn manager(&self) -> &Arc<RepositoryManager> {
        &self.manager
    }

    // ── shutdown ─────────────────────────────────────────────────────────────

    /// Graceful stop: refuse new requests, wait out in-flight work and model
    /// drains within `exit_timeout`, then force anything left to
    /// `UNAVAILABLE`.
    ///
    /// Returns [`Error::Timeout`] when the deadline passed with work still
    /// outstanding; the server is no longer live either way.
    pub async fn stop(&self) -> Result<(), Error> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            // A prior stop already ran (or is running).
            self.live.store(false, Ordering::SeqCst);
            return Ok(());
        }
        info!(inflight = self.inflight.count(), "server stopping");

        if let Some(task) = self.poll_task.lock().expect("poll task lock").take() {
            task.abort();
        }

        let deadline = tokio::time::Instant::now() + self.options.exit_timeout;
        let requests_drained = self.inflight.wait_zero(deadline).await;
        if !requests_drained {
            warn!(
                inflight = self.inflight.count(),
                "in-flight requests did not drain before the exit deadline"
            );
        }

        self.manager.unload_all().await;
        let models_drained = self.manager.wait_for_drains(deadline).await;

        let clean = requests_drained && models_drained;
        if !clean {
            self.manager.force_unavailable("server exited").await;
        }
        self.live.store(false, Ordering::SeqCst);
        info!(clean, "server stopped");
        if clean { Ok(()) } else { Err(Error::Timeout) }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
