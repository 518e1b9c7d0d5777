//! V4L2 capture backend with mmap streaming

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::capture::backend::{BufferSink, CaptureBackend, CaptureGraph};
use crate::capture::device::DeviceDescriptor;
use crate::capture::frame::{PixelFormat, StreamCapability};
use crate::error::{CaptureError, Result};

/// Poll interval of the streaming thread; bounds how long `stop` waits
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// Video4Linux2 devices under /dev
pub struct V4l2Backend {
    buffer_count: u32,
}

impl V4l2Backend {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(2),
        }
    }
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new(4)
    }
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut devices = Vec::new();

        for node in v4l::context::enum_devices() {
            let path = node.path().display().to_string();
            // Metadata and output nodes share the video* namespace
            let caps = match Device::with_path(node.path()).and_then(|dev| dev.query_caps()) {
                Ok(caps) => caps,
                Err(e) => {
                    debug!("Skipping {}: {}", path, e);
                    continue;
                }
            };
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                continue;
            }

            let name = node.name().unwrap_or_else(|| caps.card.clone());
            devices.push(DeviceDescriptor::new(path, name));
        }

        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    #[instrument(skip(self))]
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureGraph>> {
        let dev = Device::with_path(&device.id).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CaptureError::DeviceNotFound(device.id.clone()),
            _ => CaptureError::backend(format!("open {}: {}", device.id, e)),
        })?;

        let caps = dev.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::backend(format!(
                "{} doesn't support video capture",
                device.id
            )));
        }

        Ok(Box::new(V4l2Graph {
            path: device.id.clone(),
            device: Arc::new(dev),
            buffer_count: self.buffer_count,
            streamer: None,
        }))
    }
}

struct Streamer {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct V4l2Graph {
    path: String,
    device: Arc<Device>,
    buffer_count: u32,
    streamer: Option<Streamer>,
}

fn capability_from(format: &Format) -> StreamCapability {
    StreamCapability::new(
        PixelFormat::from_fourcc(format.fourcc.repr),
        format.width,
        format.height,
    )
}

impl CaptureGraph for V4l2Graph {
    fn capabilities(&mut self) -> Result<Vec<StreamCapability>> {
        let mut capabilities = Vec::new();

        for description in self.device.enum_formats()? {
            let pixel_format = PixelFormat::from_fourcc(description.fourcc.repr);
            for size in self.device.enum_framesizes(description.fourcc)? {
                match size.size {
                    FrameSizeEnum::Discrete(discrete) => capabilities.push(StreamCapability::new(
                        pixel_format,
                        discrete.width,
                        discrete.height,
                    )),
                    FrameSizeEnum::Stepwise(stepwise) => {
                        // Exact matches are only looked for at the extremes
                        capabilities.push(StreamCapability::new(
                            pixel_format,
                            stepwise.min_width,
                            stepwise.min_height,
                        ));
                        capabilities.push(StreamCapability::new(
                            pixel_format,
                            stepwise.max_width,
                            stepwise.max_height,
                        ));
                    }
                }
            }
        }

        Ok(capabilities)
    }

    fn current_format(&mut self) -> Result<StreamCapability> {
        Ok(capability_from(&self.device.format()?))
    }

    fn set_format(&mut self, capability: &StreamCapability) -> Result<()> {
        let requested = Format::new(
            capability.width,
            capability.height,
            FourCC::new(&capability.pixel_format.fourcc()),
        );
        let applied = self.device.set_format(&requested)?;

        if capability_from(&applied) != *capability {
            return Err(CaptureError::backend(format!(
                "driver applied {}x{} {} instead of {}x{} {}",
                applied.width,
                applied.height,
                applied.fourcc,
                capability.width,
                capability.height,
                capability.pixel_format
            )));
        }
        Ok(())
    }

    fn run(&mut self, sink: Arc<dyn BufferSink>) -> Result<()> {
        if self.streamer.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = flume::bounded::<std::result::Result<(), String>>(1);
        let device = Arc::clone(&self.device);
        let buffer_count = self.buffer_count;

        let thread = thread::Builder::new()
            .name("framecap-v4l2".into())
            .spawn({
                let stop = Arc::clone(&stop);
                move || {
                    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.to_string()));
                            return;
                        }
                    };
                    stream.set_timeout(DEQUEUE_TIMEOUT);
                    let _ = ready_tx.send(Ok(()));

                    while !stop.load(Ordering::Acquire) {
                        match stream.next() {
                            Ok((buf, meta)) => {
                                let used = (meta.bytesused as usize).min(buf.len());
                                sink.on_buffer(&buf[..used]);
                            }
                            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                            Err(e) => {
                                warn!("V4L2 dequeue failed, stopping stream: {}", e);
                                break;
                            }
                        }
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Capture stream started with {} buffers", buffer_count);
                self.streamer = Some(Streamer { stop, thread });
                Ok(())
            }
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(CaptureError::backend(reason))
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::backend("V4L2 stream thread exited during startup"))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(streamer) = self.streamer.take() {
            streamer.stop.store(true, Ordering::Release);
            if streamer.thread.join().is_err() {
                return Err(CaptureError::backend("V4L2 stream thread panicked"));
            }
            info!("Capture stream on {} stopped", self.path);
        }
        Ok(())
    }
}

impl Drop for V4l2Graph {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Releasing {}: {}", self.path, e);
        }
    }
}
