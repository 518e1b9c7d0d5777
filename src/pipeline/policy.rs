//! Per-subscriber back-pressure: rate limiting and sliding statistics windows

use std::time::{Duration, Instant};

use ringbuf::traits::{Consumer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::frame::FrameInfo;

/// How a subscriber wants frames delivered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeConfig {
    /// At most one delivery per interval; frames in between are dropped
    pub max_rate: Option<Duration>,
    /// Deliver batches of the last `size` frames every `stride` frames
    pub window: Option<WindowConfig>,
    /// Mailbox depth, `None` for the publisher default. Throttled subscribers always use 1.
    pub queue_depth: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub size: usize,
    pub stride: usize,
}

impl SubscribeConfig {
    pub fn throttled(interval: Duration) -> Self {
        Self {
            max_rate: Some(interval),
            ..Self::default()
        }
    }

    pub fn windowed(size: usize, stride: usize) -> Self {
        Self {
            window: Some(WindowConfig { size, stride }),
            ..Self::default()
        }
    }

    pub fn with_max_rate(mut self, interval: Duration) -> Self {
        self.max_rate = Some(interval);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }
}

/// Drops frames that arrive less than `interval` after the last admitted one.
///
/// Time is taken from the frame's capture timestamp, so the admitted frame is
/// always the newest one available when the interval elapses.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn admit(&mut self, at: Instant) -> bool {
        match self.last {
            Some(last) if at.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(at);
                true
            }
        }
    }
}

/// Fixed-size window over the most recent frames, emitted every `stride` frames
/// once it is full. Lives on the subscriber's dispatcher thread.
pub struct SlidingWindow {
    size: usize,
    stride: usize,
    frames: HeapRb<FrameInfo>,
    seen: u64,
}

impl SlidingWindow {
    pub fn new(config: WindowConfig) -> Self {
        let size = config.size.max(1);
        Self {
            size,
            stride: config.stride.max(1),
            frames: HeapRb::new(size),
            seen: 0,
        }
    }

    pub fn push(&mut self, info: FrameInfo) -> Option<FrameWindow> {
        self.frames.push_overwrite(info);
        self.seen += 1;

        let size = self.size as u64;
        if self.seen < size || (self.seen - size) % self.stride as u64 != 0 {
            return None;
        }
        Some(FrameWindow {
            frames: self.frames.iter().copied().collect(),
        })
    }
}

/// A batch of consecutive frame timestamps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameWindow {
    pub frames: Vec<FrameInfo>,
}

impl FrameWindow {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Time from the first to the last frame in the window
    pub fn span(&self) -> Duration {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => last.captured_at.saturating_duration_since(first.captured_at),
            _ => Duration::ZERO,
        }
    }

    /// Measured frames per second over the window's intervals
    pub fn frame_rate(&self) -> Option<f64> {
        let intervals = self.frames.len().checked_sub(1)?;
        let span = self.span().as_secs_f64();
        if intervals == 0 || span <= 0.0 {
            return None;
        }
        Some(intervals as f64 / span)
    }
}

/// What the producer should do with one frame for one subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Skip,
    Frame,
    /// Forward only the metadata; the dispatcher assembles the window
    Windowed,
}

/// Producer side of a subscription. Throttles before windowing and never
/// allocates, so it is safe on the backend's delivery thread.
pub(crate) struct DeliveryPolicy {
    limiter: Option<RateLimiter>,
    windowed: bool,
}

impl DeliveryPolicy {
    pub(crate) fn new(config: &SubscribeConfig) -> Self {
        Self {
            limiter: config.max_rate.map(RateLimiter::new),
            windowed: config.window.is_some(),
        }
    }

    pub(crate) fn admit(&mut self, info: FrameInfo) -> Admission {
        if let Some(limiter) = self.limiter.as_mut() {
            if !limiter.admit(info.captured_at) {
                return Admission::Skip;
            }
        }
        if self.windowed {
            Admission::Windowed
        } else {
            Admission::Frame
        }
    }
}
