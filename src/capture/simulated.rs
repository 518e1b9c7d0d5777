//! In-process capture backend with scripted devices.
//!
//! Used by the test suite and by the CLI's `--simulate` mode. Devices can be
//! hot-plugged, can fail on open or run, can take a while to open, and either
//! produce frames at a fixed rate or only when [`SimulatedBackend::emit`] is
//! called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::capture::backend::{BufferSink, CaptureBackend, CaptureGraph};
use crate::capture::device::DeviceDescriptor;
use crate::capture::frame::{FrameFormat, PixelFormat, StreamCapability};
use crate::error::{CaptureError, Result};
use crate::utils::lock;

/// How a simulated device produces frames once running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Only on [`SimulatedBackend::emit`]
    Manual,
    /// Continuously from a producer thread
    FrameRate(u32),
}

#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    id: String,
    name: String,
    capabilities: Vec<StreamCapability>,
    default: StreamCapability,
    pacing: Pacing,
    open_delay: Duration,
    open_failure: Option<String>,
    run_failure: Option<String>,
}

impl SimulatedDevice {
    /// A device offering 320x240 and 640x480 BGR32, defaulting to 320x240
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let small = StreamCapability::new(PixelFormat::Bgr32, 320, 240);
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: vec![small, StreamCapability::new(PixelFormat::Bgr32, 640, 480)],
            default: small,
            pacing: Pacing::Manual,
            open_delay: Duration::ZERO,
            open_failure: None,
            run_failure: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<StreamCapability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_default(mut self, default: StreamCapability) -> Self {
        self.default = default;
        self
    }

    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.pacing = Pacing::FrameRate(fps.max(1));
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn failing_open(mut self, reason: impl Into<String>) -> Self {
        self.open_failure = Some(reason.into());
        self
    }

    pub fn failing_run(mut self, reason: impl Into<String>) -> Self {
        self.run_failure = Some(reason.into());
        self
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(self.id.clone(), self.name.clone())
    }
}

/// Deterministic test pattern: byte `i` of frame `seed` is `seed + i` (wrapping)
pub fn pattern_frame(len: usize, seed: u64) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    fill_pattern(&mut frame, seed);
    frame
}

fn fill_pattern(frame: &mut [u8], seed: u64) {
    for (i, byte) in frame.iter_mut().enumerate() {
        *byte = (seed as u8).wrapping_add(i as u8);
    }
}

#[derive(Default)]
struct SimShared {
    devices: Mutex<Vec<SimulatedDevice>>,
    /// Sinks of running graphs, keyed by device id
    running: Mutex<HashMap<String, (Arc<dyn BufferSink>, StreamCapability)>>,
    opens: AtomicUsize,
    open_graphs: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct SimulatedBackend {
    shared: Arc<SimShared>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend with one 30 fps camera, for demos
    pub fn demo() -> Self {
        let backend = Self::new();
        backend.add_device(SimulatedDevice::new("sim:0", "Simulated Camera").with_frame_rate(30));
        backend
    }

    pub fn add_device(&self, device: SimulatedDevice) {
        lock(&self.shared.devices).push(device);
    }

    /// Unplug. A graph already running for the device keeps running.
    pub fn remove_device(&self, id: &str) {
        lock(&self.shared.devices).retain(|device| device.id != id);
    }

    /// Graphs currently alive (opened and not yet dropped)
    pub fn open_graphs(&self) -> usize {
        self.shared.open_graphs.load(Ordering::SeqCst)
    }

    /// Total successful opens
    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, id: &str) -> bool {
        lock(&self.shared.running).contains_key(id)
    }

    /// Format of the running graph for `id`
    pub fn running_format(&self, id: &str) -> Option<FrameFormat> {
        lock(&self.shared.running).get(id).map(|(_, cap)| FrameFormat::from(*cap))
    }

    /// Deliver one buffer to the running graph for `id`, as the device's
    /// delivery thread would. Returns false when nothing is running.
    pub fn emit(&self, id: &str, data: &[u8]) -> bool {
        // Held across the callback so `stop` waits for it
        let running = lock(&self.shared.running);
        match running.get(id) {
            Some((sink, _)) => {
                sink.on_buffer(data);
                true
            }
            None => false,
        }
    }

    /// Emit a correctly sized pattern frame
    pub fn emit_pattern(&self, id: &str, seed: u64) -> bool {
        match self.running_format(id) {
            Some(format) => self.emit(id, &pattern_frame(format.frame_len(), seed)),
            None => false,
        }
    }
}

impl CaptureBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(lock(&self.shared.devices)
            .iter()
            .map(SimulatedDevice::descriptor)
            .collect())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureGraph>> {
        let found = lock(&self.shared.devices)
            .iter()
            .find(|candidate| candidate.id == device.id)
            .cloned()
            .ok_or_else(|| CaptureError::DeviceNotFound(device.id.clone()))?;

        if !found.open_delay.is_zero() {
            thread::sleep(found.open_delay);
        }
        if let Some(reason) = &found.open_failure {
            return Err(CaptureError::backend(reason));
        }

        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        self.shared.open_graphs.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated graph opened for {}", found.id);

        Ok(Box::new(SimulatedGraph {
            format: found.default,
            device: found,
            shared: Arc::clone(&self.shared),
            pump: None,
        }))
    }
}

struct Pump {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct SimulatedGraph {
    device: SimulatedDevice,
    shared: Arc<SimShared>,
    format: StreamCapability,
    pump: Option<Pump>,
}

impl CaptureGraph for SimulatedGraph {
    fn capabilities(&mut self) -> Result<Vec<StreamCapability>> {
        Ok(self.device.capabilities.clone())
    }

    fn current_format(&mut self) -> Result<StreamCapability> {
        Ok(self.format)
    }

    fn set_format(&mut self, capability: &StreamCapability) -> Result<()> {
        if !self.device.capabilities.contains(capability) {
            return Err(CaptureError::backend(format!(
                "{}x{} {} not offered by {}",
                capability.width, capability.height, capability.pixel_format, self.device.id
            )));
        }
        self.format = *capability;
        Ok(())
    }

    fn run(&mut self, sink: Arc<dyn BufferSink>) -> Result<()> {
        if let Some(reason) = &self.device.run_failure {
            return Err(CaptureError::backend(reason));
        }

        lock(&self.shared.running).insert(self.device.id.clone(), (Arc::clone(&sink), self.format));

        if let Pacing::FrameRate(fps) = self.device.pacing {
            let stop = Arc::new(AtomicBool::new(false));
            let frame_len = FrameFormat::from(self.format).frame_len();
            let interval = Duration::from_secs(1) / fps;
            let thread = thread::Builder::new()
                .name(format!("framecap-sim-{}", self.device.id))
                .spawn({
                    let stop = Arc::clone(&stop);
                    move || {
                        let mut frame = vec![0u8; frame_len];
                        let mut seed = 0u64;
                        while !stop.load(Ordering::Acquire) {
                            seed += 1;
                            fill_pattern(&mut frame, seed);
                            sink.on_buffer(&frame);
                            thread::sleep(interval);
                        }
                    }
                })?;
            self.pump = Some(Pump { stop, thread });
        }

        info!("Simulated device {} running at {:?}", self.device.id, self.format);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        lock(&self.shared.running).remove(&self.device.id);
        if let Some(pump) = self.pump.take() {
            pump.stop.store(true, Ordering::Release);
            if pump.thread.join().is_err() {
                return Err(CaptureError::backend("simulated producer thread panicked"));
            }
        }
        Ok(())
    }
}

impl Drop for SimulatedGraph {
    fn drop(&mut self) {
        let _ = self.stop();
        self.shared.open_graphs.fetch_sub(1, Ordering::SeqCst);
        debug!("Simulated graph for {} released", self.device.id);
    }
}
