pub mod backend;
pub mod callback;
pub mod device;
pub mod frame;
pub mod negotiate;
pub mod simulated;
#[cfg(target_os = "linux")]
pub mod v4l2;

pub use backend::{BufferSink, CaptureBackend, CaptureGraph};
pub use callback::CaptureCallback;
pub use device::{DeviceCatalog, DeviceDescriptor};
pub use frame::{FrameFormat, FrameInfo, PixelFormat, StreamCapability};
pub use negotiate::{negotiate_resolution, Negotiation};
pub use simulated::{SimulatedBackend, SimulatedDevice};
#[cfg(target_os = "linux")]
pub use v4l2::V4l2Backend;
