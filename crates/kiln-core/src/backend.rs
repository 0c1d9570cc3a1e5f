//! The backend seam: batch execution and the factory extension point.
//!
//! Framework support enters the core exclusively through
//! [`BackendFactory`]; the manager never knows what runs behind
//! [`Backend::run`] beyond its per-request statuses.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::model::ModelConfig;
use crate::request::InferenceRequest;
use crate::response::{InferenceResponse, ResponseAllocator, ResponseBuilder};

/// One prepared, frozen request inside a batch, together with the allocator
/// its outputs must come from.
pub struct BatchItem {
    request: InferenceRequest,
    allocator: Arc<dyn ResponseAllocator>,
    model_version: i64,
    /// Ties queued work to the originating handle's liveness token so the
    /// manager can drain a retired handle only once its work finished.
    _live: Option<Arc<()>>,
}

impl std::fmt::Debug for BatchItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchItem")
            .field("request_id", &self.request.id())
            .field("batch_size", &self.request.batch_size())
            .finish()
    }
}

impl BatchItem {
    pub(crate) fn new(
        request: InferenceRequest,
        allocator: Arc<dyn ResponseAllocator>,
        model_version: i64,
    ) -> Self {
        Self {
            request,
            allocator,
            model_version,
            _live: None,
        }
    }

    pub(crate) fn with_live(mut self, live: Arc<()>) -> Self {
        self._live = Some(live);
        self
    }

    pub fn request(&self) -> &InferenceRequest {
        &self.request
    }

    /// Start a response for this request; outputs allocate through the
    /// request's allocator.
    pub fn response_builder(&self) -> ResponseBuilder {
        ResponseBuilder::new(
            self.request.id().to_owned(),
            self.request.model_name().to_owned(),
            self.model_version,
            Arc::clone(&self.allocator),
            self.request.requested_outputs().clone(),
        )
    }
}

/// A loaded framework session for one (model, version).
///
/// `run` receives a batch of requests sharing the model and returns one
/// status per request, aligned with the batch; a batch may complete
/// partially. Device allocation and kernel launches happen behind this call.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn run(&self, batch: &[BatchItem]) -> Vec<Result<InferenceResponse, Error>>;
}

/// Sole extension point for framework support.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Build a backend for one model version rooted at `repository_path`.
    async fn create(
        &self,
        name: &str,
        version: i64,
        config: &ModelConfig,
        repository_path: &Path,
    ) -> Result<Box<dyn Backend>, Error>;
}
