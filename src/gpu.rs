//! GPU slot table and arbiter (spec §4.6, §4.4 phase 5). Two distinct
//! responsibilities share one process-wide table: static device
//! *assignment* at compile time (least-loaded balancing, counted in
//! compiled-steps-per-device) and dynamic slot *acquisition* at execution
//! time (a per-device counted semaphore, released when the step
//! finishes). Grounded on the teacher's `ResourcePool`
//! (`turbulance/orchestrator.rs`), which holds one `Arc<Semaphore>` per
//! resource class and hands out RAII permits.

use crate::resource_error;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Semaphore, OwnedSemaphorePermit};

pub struct GpuSlotTable {
    device_count: usize,
    /// Compile-time load counters, one per device, used only for the
    /// least-loaded assignment policy (spec §4.4 phase 5).
    compiled_steps_per_device: Mutex<Vec<usize>>,
    /// Runtime concurrency limiter, one semaphore per device (spec §4.6).
    semaphores: Vec<Arc<Semaphore>>,
}

impl GpuSlotTable {
    pub fn new(device_count: usize, max_concurrent_per_device: usize) -> Self {
        Self {
            device_count,
            compiled_steps_per_device: Mutex::new(vec![0; device_count]),
            semaphores: (0..device_count).map(|_| Arc::new(Semaphore::new(max_concurrent_per_device.max(1)))).collect(),
        }
    }

    /// Statically assigns a device to a (well, step), least-loaded first
    /// (spec §4.4 phase 5). Returns `None` if no GPU devices exist.
    pub fn assign_device(&self) -> Option<u32> {
        if self.device_count == 0 {
            return None;
        }
        let mut counts = self.compiled_steps_per_device.lock();
        let (idx, _) = counts.iter().enumerate().min_by_key(|(_, &c)| c).unwrap();
        counts[idx] += 1;
        Some(idx as u32)
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Blocks cooperatively until a slot on `device` frees, then returns a
    /// guard that releases it on drop (spec §4.6 "slots are acquired
    /// per-step, never held across steps").
    pub async fn acquire(&self, device: u32) -> Result<GpuSlotGuard> {
        let semaphore = self
            .semaphores
            .get(device as usize)
            .ok_or_else(|| resource_error!(format!("no such GPU device: {device}")))?
            .clone();
        let permit = semaphore.acquire_owned().await.map_err(|_| resource_error!("GPU slot semaphore closed"))?;
        Ok(GpuSlotGuard { _permit: permit })
    }
}

/// RAII GPU slot hold. The permit is returned to the semaphore on drop.
pub struct GpuSlotGuard {
    _permit: OwnedSemaphorePermit,
}
