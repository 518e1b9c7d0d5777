//! Real-time entry point called by the backend for every raw buffer

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::capture::backend::BufferSink;
use crate::error::{CaptureError, Result};
use crate::pipeline::{FramePublisher, FrameRing, RingStats};

/// Copies each buffer into the frame ring and publishes the resulting handle.
///
/// Runs on the backend's delivery thread: no blocking locks, no allocation
/// beyond the ring, and nothing propagates back to the backend. A frame that
/// cannot be stored is counted and dropped.
pub struct CaptureCallback {
    ring: FrameRing,
    publisher: Arc<FramePublisher>,
    mismatch_reported: AtomicBool,
}

impl CaptureCallback {
    pub fn new(ring: FrameRing, publisher: Arc<FramePublisher>) -> Self {
        Self {
            ring,
            publisher,
            mismatch_reported: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }

    fn forward(&self, data: &[u8]) -> Result<()> {
        let frame = self.ring.write(data)?;
        self.publisher.publish(frame);
        Ok(())
    }

    fn dropped(&self, err: &CaptureError) {
        metrics::counter!("framecap_frames_dropped").increment(1);
        match err {
            CaptureError::FormatMismatch { expected, actual } => {
                metrics::counter!("framecap_format_mismatch").increment(1);
                if !self.mismatch_reported.swap(true, Ordering::Relaxed) {
                    warn!(
                        "Backend delivered {} bytes, negotiated format needs {}; dropping such frames",
                        actual, expected
                    );
                }
            }
            other if other.is_frame_drop() => debug!("Frame dropped: {}", other),
            other => warn!("Frame dropped on unexpected error: {}", other),
        }
    }
}

impl BufferSink for CaptureCallback {
    fn on_buffer(&self, data: &[u8]) {
        let started = Instant::now();

        match panic::catch_unwind(AssertUnwindSafe(|| self.forward(data))) {
            Ok(Ok(())) => {
                metrics::histogram!("framecap_copy_time_us")
                    .record(started.elapsed().as_micros() as f64);
            }
            Ok(Err(err)) => self.dropped(&err),
            Err(_) => {
                self.ring.record_drop();
                metrics::counter!("framecap_frames_dropped").increment(1);
                warn!("Frame delivery panicked, frame dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameFormat, PixelFormat};
    use crate::pipeline::{StreamEvent, SubscribeConfig, DEFAULT_QUEUE_DEPTH};
    use std::sync::mpsc;
    use std::time::Duration;

    fn callback() -> (CaptureCallback, Arc<FramePublisher>) {
        let publisher = Arc::new(FramePublisher::new(DEFAULT_QUEUE_DEPTH));
        let ring = FrameRing::new(FrameFormat::new(2, 2, PixelFormat::Rgb24), 3);
        (CaptureCallback::new(ring, Arc::clone(&publisher)), publisher)
    }

    #[test]
    fn buffers_are_published() {
        let (callback, publisher) = callback();
        let (tx, rx) = mpsc::channel();
        let _sub = publisher
            .subscribe(
                move |event| {
                    if let StreamEvent::Frame(frame) = event {
                        let _ = tx.send((frame.sequence(), frame.to_bytes().unwrap()));
                    }
                },
                SubscribeConfig::default(),
            )
            .unwrap();

        callback.on_buffer(&[9u8; 12]);
        let (sequence, bytes) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(sequence, 1);
        assert_eq!(&bytes[..], &[9u8; 12]);
    }

    #[test]
    fn mismatched_buffers_are_counted_not_fatal() {
        let (callback, _publisher) = callback();
        callback.on_buffer(&[0u8; 11]);
        callback.on_buffer(&[0u8; 13]);
        callback.on_buffer(&[0u8; 12]);

        let stats = callback.stats();
        assert_eq!(stats.format_mismatches, 2);
        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(stats.frames_written, 1);
    }
}
