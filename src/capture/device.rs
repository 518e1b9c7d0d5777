//! Device discovery

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::backend::CaptureBackend;
use crate::error::{CaptureError, Result};

/// A capture device as seen during enumeration. `id` is the only stable key;
/// display names may repeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub display_name: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

impl PartialEq for DeviceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeviceDescriptor {}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Lists capture devices. Never caches: devices come and go.
#[derive(Clone)]
pub struct DeviceCatalog {
    backend: Arc<dyn CaptureBackend>,
}

impl DeviceCatalog {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn CaptureBackend> {
        &self.backend
    }

    /// Every video input device present now; empty when there are none.
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = self.backend.enumerate()?;
        debug!("{} backend reports {} devices", self.backend.name(), devices.len());
        Ok(devices)
    }

    pub fn resolve(&self, id: &str) -> Result<DeviceDescriptor> {
        self.list_devices()?
            .into_iter()
            .find(|device| device.id == id)
            .ok_or_else(|| CaptureError::DeviceNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::{SimulatedBackend, SimulatedDevice};

    #[test]
    fn empty_backend_lists_nothing() {
        let catalog = DeviceCatalog::new(Arc::new(SimulatedBackend::new()));
        assert!(catalog.list_devices().unwrap().is_empty());
    }

    #[test]
    fn resolve_follows_hot_plug() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.add_device(SimulatedDevice::new("cam-1", "USB Camera"));
        backend.add_device(SimulatedDevice::new("cam-2", "USB Camera"));
        let catalog = DeviceCatalog::new(backend.clone());

        let devices = catalog.list_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].display_name, devices[1].display_name);
        assert_ne!(devices[0], devices[1]);

        assert_eq!(catalog.resolve("cam-2").unwrap().id, "cam-2");
        backend.remove_device("cam-2");
        assert!(matches!(
            catalog.resolve("cam-2"),
            Err(CaptureError::DeviceNotFound(id)) if id == "cam-2"
        ));
    }

    #[test]
    fn listing_does_not_open_devices() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.add_device(SimulatedDevice::new("cam-1", "Camera"));
        let catalog = DeviceCatalog::new(backend.clone());

        catalog.list_devices().unwrap();
        catalog.resolve("cam-1").unwrap();
        assert_eq!(backend.open_graphs(), 0);
        assert_eq!(backend.opens(), 0);
    }
}
