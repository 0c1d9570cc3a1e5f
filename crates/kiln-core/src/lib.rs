//! Core of a multi-framework inference serving runtime.
//!
//! kiln-core owns a repository of versioned models, loads and unloads their
//! backends on demand, validates requests against each model's declared
//! contract, batches requests that arrive close in time, and returns results
//! while tracking liveness, readiness, and resource usage. Wire protocols,
//! framework adapters, and metrics live outside this crate; frameworks plug
//! in through [`BackendFactory`].
//!
//! # Quick-start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kiln_core::{InferenceRequest, Server, ServerOptions};
//!
//! let options = ServerOptions::default().with_repository("/srv/models");
//! let server = Server::new(options, Arc::new(MyFactory)).await?;
//!
//! let mut request = InferenceRequest::new("resnet");
//! request.add_original_input("pixels", vec![1, 3, 224, 224], image_bytes)?;
//! let response = server.infer(request).await?;
//! for output in response.outputs() {
//!     println!("{}: {:?}", output.name(), output.shape());
//! }
//!
//! server.stop().await?;
//! ```

pub mod backend;
pub mod error;
pub mod manager;
pub mod memory;
pub mod model;
pub mod options;
pub mod repository;
pub mod request;
pub mod response;
mod scheduler;
pub mod server;
pub mod telemetry;

pub use backend::{Backend, BackendFactory, BatchItem};
pub use error::{Code, Error};
pub use manager::{ModelHandle, ModelIndexEntry, ModelState, RepositoryManager};
pub use memory::{MemoryPool, PoolSet};
pub use model::{
    BatchProfile, DynamicBatching, ModelConfig, Reshape, TensorConfig, VersionPolicy,
};
pub use options::{ControlMode, ServerOptions};
pub use repository::RepositoryStore;
pub use request::InferenceRequest;
pub use response::{
    Allocation, InferenceResponse, OutputTensor, PageableAllocator, ResponseAllocator,
    ResponseBuilder,
};
pub use scheduler::ResponseReceiver;
pub use server::{ResponseFuture, Server, ServerStatus};
