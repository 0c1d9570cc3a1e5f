//! Response construction: the allocator seam and the per-request builder.
//!
//! Backends never allocate output buffers directly; they go through the
//! caller-supplied [`ResponseAllocator`], which may downgrade the preferred
//! memory type (pinned to pageable, say). The actual type is recorded next to
//! every buffer. Releasing is `Drop`: an [`Allocation`] returns its pool
//! reservation when the response (or a failed builder) is dropped.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use kiln_types::{DataType, MemoryType};

use crate::error::Error;
use crate::memory::PoolReservation;

// ─── Allocation ───────────────────────────────────────────────────────────────

/// One output buffer plus where it actually lives.
pub struct Allocation {
    data: Vec<u8>,
    memory_type: MemoryType,
    /// Held for pool accounting; returned to the pool on drop.
    _reservation: Option<PoolReservation>,
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("len", &self.data.len())
            .field("memory_type", &self.memory_type)
            .finish()
    }
}

impl Allocation {
    /// A plain pageable host buffer with no pool accounting.
    pub fn pageable(data: Vec<u8>) -> Self {
        Self {
            data,
            memory_type: MemoryType::Pageable,
            _reservation: None,
        }
    }

    /// A pool-backed buffer; the reservation is released when this
    /// allocation drops.
    pub fn pooled(data: Vec<u8>, memory_type: MemoryType, reservation: PoolReservation) -> Self {
        Self {
            data,
            memory_type,
            _reservation: Some(reservation),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Where the buffer actually ended up.
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn device_id(&self) -> Option<u32> {
        self.memory_type.device_id()
    }
}

/// Allocation seam supplied per inference.
///
/// Implementations may return a buffer in a different memory type than
/// preferred; they must never return one smaller than `byte_size` (the core
/// treats that as a contract violation and fails the response).
pub trait ResponseAllocator: Send + Sync {
    fn allocate(
        &self,
        tensor_name: &str,
        byte_size: usize,
        preferred: MemoryType,
    ) -> Result<Allocation, Error>;
}

/// Allocator that always hands out plain pageable buffers.
#[derive(Debug, Default, Clone, Copy)]
pub struct PageableAllocator;

impl ResponseAllocator for PageableAllocator {
    fn allocate(
        &self,
        _tensor_name: &str,
        byte_size: usize,
        _preferred: MemoryType,
    ) -> Result<Allocation, Error> {
        Ok(Allocation::pageable(vec![0u8; byte_size]))
    }
}

// ─── Output tensors and responses ─────────────────────────────────────────────

/// One produced output tensor.
#[derive(Debug)]
pub struct OutputTensor {
    name: String,
    data_type: DataType,
    shape: Vec<i64>,
    allocation: Allocation,
    byte_size: usize,
}

impl OutputTensor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// The valid bytes of the output buffer.
    pub fn data(&self) -> &[u8] {
        &self.allocation.data()[..self.byte_size]
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn memory_type(&self) -> MemoryType {
        self.allocation.memory_type()
    }

    pub fn device_id(&self) -> Option<u32> {
        self.allocation.device_id()
    }
}

/// A completed inference result: the ordered outputs of one request.
///
/// The per-request status travels as the `Result` wrapping this type; a
/// request that failed after enqueue resolves to `Err` instead.
#[derive(Debug)]
pub struct InferenceResponse {
    request_id: String,
    model_name: String,
    model_version: i64,
    outputs: Vec<OutputTensor>,
}

impl InferenceResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_version(&self) -> i64 {
        self.model_version
    }

    /// Outputs in the order the backend produced them.
    pub fn outputs(&self) -> &[OutputTensor] {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Option<&OutputTensor> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

// ─── Builder ──────────────────────────────────────────────────────────────────

/// Accumulates the outputs of one request during a backend run.
pub struct ResponseBuilder {
    request_id: String,
    model_name: String,
    model_version: i64,
    allocator: Arc<dyn ResponseAllocator>,
    requested: BTreeSet<String>,
    preferred: MemoryType,
    outputs: Vec<OutputTensor>,
}

impl std::fmt::Debug for ResponseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBuilder")
            .field("request_id", &self.request_id)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl ResponseBuilder {
    pub(crate) fn new(
        request_id: String,
        model_name: String,
        model_version: i64,
        allocator: Arc<dyn ResponseAllocator>,
        requested: BTreeSet<String>,
    ) -> Self {
        Self {
            request_id,
            model_name,
            model_version,
            allocator,
            requested,
            preferred: MemoryType::Pinned,
            outputs: Vec::new(),
        }
    }

    /// Preferred memory type passed to the allocator (default pinned).
    pub fn prefer(&mut self, memory_type: MemoryType) -> &mut Self {
        self.preferred = memory_type;
        self
    }

    /// Add one output tensor, copying `data` into an allocator-provided
    /// buffer.
    ///
    /// Outputs the caller did not request are silently dropped. A second
    /// buffer for the same name is [`Error::AlreadyExists`]; an allocator
    /// returning a short buffer is [`Error::Internal`].
    pub fn output(
        &mut self,
        name: &str,
        data_type: DataType,
        shape: Vec<i64>,
        data: &[u8],
    ) -> Result<(), Error> {
        if !self.requested.contains(name) {
            debug!(output = name, "dropping unrequested output");
            return Ok(());
        }
        if self.outputs.iter().any(|o| o.name == name) {
            return Err(Error::AlreadyExists(format!(
                "output buffer for '{name}' already allocated"
            )));
        }

        let mut allocation = self.allocator.allocate(name, data.len(), self.preferred)?;
        if allocation.data().len() < data.len() {
            return Err(Error::Internal(format!(
                "allocator contract violation: requested {} byte(s) for '{name}', got {}",
                data.len(),
                allocation.data().len()
            )));
        }
        allocation.data_mut()[..data.len()].copy_from_slice(data);

        self.outputs.push(OutputTensor {
            name: name.to_owned(),
            data_type,
            shape,
            allocation,
            byte_size: data.len(),
        });
        Ok(())
    }

    /// Finalize into an [`InferenceResponse`].
    pub fn finish(self) -> InferenceResponse {
        InferenceResponse {
            request_id: self.request_id,
            model_name: self.model_name,
            model_version: self.model_version,
            outputs: self.outputs,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
