use std::sync::{Mutex, MutexGuard};

use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::capture::device::{DeviceCatalog, DeviceDescriptor};
use crate::error::{CaptureError, Result};

/// Install the global tracing subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt = tracing_subscriber::fmt::layer()
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_thread_names(true);

    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

/// Auto-detect a capture device: the first one the backend reports
pub fn auto_detect_device(catalog: &DeviceCatalog) -> Result<DeviceDescriptor> {
    info!("Auto-detecting capture devices...");

    let devices = catalog.list_devices()?;
    for device in &devices {
        info!("Found device: {}", device);
    }

    devices
        .into_iter()
        .next()
        .ok_or_else(|| CaptureError::DeviceNotFound("no capture devices present".into()))
}

/// Lock, recovering the data if a panicking thread poisoned the mutex
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
