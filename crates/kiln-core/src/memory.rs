//! Byte-budgeted memory pools shared across backends.
//!
//! One pinned host pool plus one pool per device, each with a configured
//! byte budget. Reservations are RAII: dropping a [`PoolReservation`] (or
//! the [`Allocation`](crate::response::Allocation) holding it) returns the
//! bytes. Acquisition is `try`-only; on exhaustion callers fall back to
//! pageable memory rather than blocking.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use kiln_types::MemoryType;

use crate::error::Error;
use crate::options::ServerOptions;
use crate::response::{Allocation, ResponseAllocator};

// ─── Pool ─────────────────────────────────────────────────────────────────────

/// A single byte-budgeted pool.
#[derive(Debug, Clone)]
pub struct MemoryPool {
    name: String,
    capacity: u64,
    used: Arc<Mutex<u64>>,
}

/// RAII reservation; returns its bytes to the pool on drop.
#[derive(Debug)]
pub struct PoolReservation {
    bytes: u64,
    used: Arc<Mutex<u64>>,
}

impl Drop for PoolReservation {
    fn drop(&mut self) {
        if let Ok(mut used) = self.used.lock() {
            *used = used.saturating_sub(self.bytes);
        }
    }
}

impl MemoryPool {
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            used: Arc::new(Mutex::new(0)),
        }
    }

    /// Reserve `bytes` if the budget allows, without blocking.
    pub fn try_reserve(&self, bytes: u64) -> Option<PoolReservation> {
        let mut used = self.used.lock().ok()?;
        if used.checked_add(bytes)? > self.capacity {
            return None;
        }
        *used += bytes;
        Some(PoolReservation {
            bytes,
            used: Arc::clone(&self.used),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.lock().map(|u| *u).unwrap_or(0)
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }
}

// ─── Pool set ─────────────────────────────────────────────────────────────────

/// The server's shared pools: pinned host memory plus per-device budgets.
#[derive(Debug)]
pub struct PoolSet {
    pinned: MemoryPool,
    devices: BTreeMap<u32, MemoryPool>,
}

impl PoolSet {
    pub fn from_options(options: &ServerOptions) -> Self {
        let devices = options
            .cuda_memory_pool_sizes
            .iter()
            .map(|(&device, &bytes)| {
                (device, MemoryPool::new(format!("device-{device}"), bytes))
            })
            .collect();
        Self {
            pinned: MemoryPool::new("pinned", options.pinned_memory_pool_size),
            devices,
        }
    }

    pub fn pinned(&self) -> &MemoryPool {
        &self.pinned
    }

    pub fn device(&self, device: u32) -> Option<&MemoryPool> {
        self.devices.get(&device)
    }

    /// The default response allocator over these pools: preferred type when
    /// the budget allows, pageable fallback on exhaustion.
    pub fn allocator(self: &Arc<Self>) -> Arc<dyn ResponseAllocator> {
        Arc::new(PoolAllocator {
            pools: Arc::clone(self),
        })
    }
}

/// [`ResponseAllocator`] backed by a [`PoolSet`].
struct PoolAllocator {
    pools: Arc<PoolSet>,
}

impl ResponseAllocator for PoolAllocator {
    fn allocate(
        &self,
        tensor_name: &str,
        byte_size: usize,
        preferred: MemoryType,
    ) -> Result<Allocation, Error> {
        let pool = match preferred {
            MemoryType::Pinned => Some(&self.pools.pinned),
            MemoryType::Device(id) => self.pools.devices.get(&id),
            MemoryType::Pageable => None,
        };

        if let Some(pool) = pool {
            if let Some(reservation) = pool.try_reserve(byte_size as u64) {
                return Ok(Allocation::pooled(
                    vec![0u8; byte_size],
                    preferred,
                    reservation,
                ));
            }
            warn!(
                tensor = tensor_name,
                pool = pool.name(),
                bytes = byte_size,
                "pool exhausted; falling back to pageable memory"
            );
        }
        Ok(Allocation::pageable(vec![0u8; byte_size]))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
