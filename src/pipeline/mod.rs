pub mod policy;
pub mod publisher;
pub mod ringbuf;

pub use policy::{FrameWindow, RateLimiter, SlidingWindow, SubscribeConfig, WindowConfig};
pub use publisher::{FramePublisher, StreamEvent, Subscription, DEFAULT_QUEUE_DEPTH};
pub use ringbuf::{FrameData, FrameHandle, FrameRing, RingStats};
