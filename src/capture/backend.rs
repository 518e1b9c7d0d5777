//! Seam between the pipeline and a native capture stack

use std::sync::Arc;

use crate::capture::device::DeviceDescriptor;
use crate::capture::frame::StreamCapability;
use crate::error::Result;

/// Receives raw frame buffers on the backend's delivery thread.
///
/// Implementations must return in bounded time and must not panic back into
/// the backend.
pub trait BufferSink: Send + Sync {
    fn on_buffer(&self, data: &[u8]);
}

/// A native capture stack: enumerates devices and builds capture graphs.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Video input devices present right now. Must not open them.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Acquire the device and build a graph for it. Dropping the graph
    /// releases everything acquired here.
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureGraph>>;
}

/// Source to sink pipeline for one device
pub trait CaptureGraph: Send {
    fn capabilities(&mut self) -> Result<Vec<StreamCapability>>;

    /// Format the device would deliver without negotiation
    fn current_format(&mut self) -> Result<StreamCapability>;

    fn set_format(&mut self, capability: &StreamCapability) -> Result<()>;

    /// Start delivering buffers to `sink` from the backend's own thread
    fn run(&mut self, sink: Arc<dyn BufferSink>) -> Result<()>;

    /// Stop delivery. Returns once no `on_buffer` call is in flight.
    fn stop(&mut self) -> Result<()>;
}
