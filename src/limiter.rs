//! Per device concurrency limiting of interview traffic.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Allows at most `permits` operations in flight per device identity (long address).
///
/// A device's semaphore lives only while some operation holds or waits for it.
pub struct DeviceLimiter {
    permits: usize,
    devices: Mutex<HashMap<u64, Arc<Semaphore>>>,
}

/// Permit for one operation on a device, released on drop.
pub struct DevicePermit<'a> {
    limiter: &'a DeviceLimiter,
    device: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for DevicePermit<'_> {
    fn drop(&mut self) {
        self.permit.take();
        self.limiter.prune(self.device);
    }
}

impl DeviceLimiter {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: permits.max(1),
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<u64, Arc<Semaphore>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn semaphore(&self, device: u64) -> Arc<Semaphore> {
        self.devices()
            .entry(device)
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits)))
            .clone()
    }

    /// Forget the semaphore of `device` when nobody holds or awaits it.
    fn prune(&self, device: u64) {
        let mut devices = self.devices();
        let idle = devices.get(&device).is_some_and(|sem| {
            Arc::strong_count(sem) == 1 && sem.available_permits() == self.permits
        });
        if idle {
            devices.remove(&device);
        }
    }

    pub async fn acquire(&self, device: u64) -> Result<DevicePermit<'_>> {
        let permit = self
            .semaphore(device)
            .acquire_owned()
            .await
            .context(format!("limiter for 0x{:016x} closed", device))?;
        Ok(DevicePermit {
            limiter: self,
            device,
            permit: Some(permit),
        })
    }

    /// Run `fut` once a permit for `device` is available.
    pub async fn run<T, F>(&self, device: u64, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.acquire(device).await?;
        fut.await
    }

    /// Devices with an operation in flight or waiting.
    pub fn tracked(&self) -> usize {
        self.devices().len()
    }
}
