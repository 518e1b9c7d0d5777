//! Resolution negotiation

use tracing::{debug, info, warn};

use crate::capture::backend::CaptureGraph;
use crate::capture::frame::FrameFormat;
use crate::error::{CaptureError, Result};

/// Outcome of negotiation. Callers must use `acquired`, not what they asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiation {
    pub requested: (u32, u32),
    pub acquired: FrameFormat,
    /// False when the device default was used instead
    pub exact: bool,
}

impl Negotiation {
    pub fn is_fallback(&self) -> bool {
        !self.exact
    }
}

/// Pick the first raw capability matching `width`x`height` exactly, otherwise
/// keep the device's current format. A fallback is a success.
pub fn negotiate_resolution(graph: &mut dyn CaptureGraph, width: u32, height: u32) -> Result<Negotiation> {
    let capabilities = graph.capabilities()?;
    debug!("Device offers {} stream capabilities", capabilities.len());

    let matching = capabilities
        .iter()
        .find(|cap| cap.width == width && cap.height == height && cap.bits_per_pixel != 0);

    if let Some(cap) = matching {
        graph.set_format(cap)?;
        let acquired = FrameFormat::from(*cap);
        info!("Negotiated {}", acquired);
        return Ok(Negotiation {
            requested: (width, height),
            acquired,
            exact: true,
        });
    }

    let current = graph.current_format()?;
    if current.bits_per_pixel == 0 {
        return Err(CaptureError::start_failed(format!(
            "no raw {}x{} format and device default {} is compressed",
            width, height, current.pixel_format
        )));
    }

    let acquired = FrameFormat::from(current);
    warn!(
        "{}x{} not supported by device, falling back to default {}",
        width, height, acquired
    );
    Ok(Negotiation {
        requested: (width, height),
        acquired,
        exact: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::backend::CaptureBackend;
    use crate::capture::frame::{PixelFormat, StreamCapability};
    use crate::capture::simulated::{SimulatedBackend, SimulatedDevice};

    fn graph(device: SimulatedDevice) -> Box<dyn CaptureGraph> {
        let backend = SimulatedBackend::new();
        let descriptor = device.descriptor();
        backend.add_device(device);
        backend.open(&descriptor).unwrap()
    }

    fn two_mode_device() -> SimulatedDevice {
        SimulatedDevice::new("cam", "Camera")
            .with_capabilities(vec![
                StreamCapability::new(PixelFormat::Bgr32, 320, 240),
                StreamCapability::new(PixelFormat::Bgr32, 640, 480),
            ])
            .with_default(StreamCapability::new(PixelFormat::Bgr32, 320, 240))
    }

    #[test]
    fn exact_match_is_selected() {
        let mut graph = graph(two_mode_device());
        let n = negotiate_resolution(graph.as_mut(), 640, 480).unwrap();
        assert!(n.exact);
        assert_eq!((n.acquired.width, n.acquired.height), (640, 480));
        assert_eq!(graph.current_format().unwrap().width, 640);
    }

    #[test]
    fn unsupported_size_falls_back_to_default() {
        let mut graph = graph(two_mode_device());
        let n = negotiate_resolution(graph.as_mut(), 800, 600).unwrap();
        assert!(n.is_fallback());
        assert_eq!(n.requested, (800, 600));
        assert_eq!((n.acquired.width, n.acquired.height), (320, 240));
    }

    #[test]
    fn compressed_match_is_skipped() {
        let device = SimulatedDevice::new("cam", "Camera")
            .with_capabilities(vec![
                StreamCapability::new(PixelFormat::Mjpeg, 1280, 720),
                StreamCapability::new(PixelFormat::Yuyv, 1280, 720),
            ])
            .with_default(StreamCapability::new(PixelFormat::Yuyv, 640, 480));
        let mut graph = graph(device);

        let n = negotiate_resolution(graph.as_mut(), 1280, 720).unwrap();
        assert!(n.exact);
        assert_eq!(n.acquired.pixel_format, PixelFormat::Yuyv);
        assert_eq!(n.acquired.stride, 2560);
    }

    #[test]
    fn compressed_default_cannot_be_used() {
        let device = SimulatedDevice::new("cam", "Camera")
            .with_capabilities(vec![StreamCapability::new(PixelFormat::Mjpeg, 1280, 720)])
            .with_default(StreamCapability::new(PixelFormat::Mjpeg, 1280, 720));
        let mut graph = graph(device);

        let err = negotiate_resolution(graph.as_mut(), 1280, 720).unwrap_err();
        assert!(matches!(err, CaptureError::CaptureStartFailed { .. }));
    }
}
