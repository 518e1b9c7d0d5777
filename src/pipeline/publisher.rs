//! Push-based fan-out of frame handles to independent subscribers

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};

use arc_swap::ArcSwap;
use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, trace};

use crate::capture::frame::FrameInfo;
use crate::error::{CaptureError, Result};
use crate::pipeline::policy::{
    Admission, DeliveryPolicy, FrameWindow, SlidingWindow, SubscribeConfig,
};
use crate::pipeline::ringbuf::FrameHandle;
use crate::utils::lock;

/// Mailbox depth for unthrottled subscribers unless configured otherwise
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// What a subscriber callback receives
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame(FrameHandle),
    Window(FrameWindow),
    /// The stream has ended; no further events follow
    Completed,
}

/// What travels through a subscriber's mailbox
enum Mail {
    Frame(FrameHandle),
    Tick(FrameInfo),
}

/// Fans frames out to subscribers without ever blocking the producer.
///
/// Each subscriber has its own bounded mailbox and dispatcher thread. When a
/// mailbox is full the oldest queued event is evicted, so a slow subscriber
/// only ever loses its own frames. Queued frames pin ring slots, so frame
/// mailboxes are kept shallower than the ring (see [`with_ring_slots`]).
///
/// [`with_ring_slots`]: FramePublisher::with_ring_slots
pub struct FramePublisher {
    subscribers: ArcSwap<Vec<Arc<Subscriber>>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    queue_depth: usize,
    frame_depth_limit: usize,
}

struct Subscriber {
    id: u64,
    policy: Mutex<DeliveryPolicy>,
    tx: Sender<Mail>,
    /// Second receiver end used only to evict the oldest event
    evict: Receiver<Mail>,
    capacity: usize,
    control: Arc<Control>,
}

/// Shared between a subscriber's dispatcher thread and its handle
struct Control {
    active: AtomicBool,
    /// Set by `close`; the dispatcher discards what is queued and completes
    /// once the last sender is gone
    closed: AtomicBool,
    /// Held for the duration of each callback
    gate: Mutex<()>,
    dispatcher: OnceLock<ThreadId>,
    evicted: AtomicU64,
}

impl FramePublisher {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: ArcSwap::from_pointee(Vec::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            frame_depth_limit: usize::MAX,
        }
    }

    /// Bound frame mailboxes by the ring they are fed from.
    ///
    /// A subscriber holds at most `slot_count - 2` queued frames plus the one
    /// in its callback, which leaves the producer a free slot and keeps that
    /// subscriber's frames from being recycled under it.
    pub fn with_ring_slots(mut self, slot_count: usize) -> Self {
        self.frame_depth_limit = slot_count.saturating_sub(2).max(1);
        self
    }

    fn mailbox_capacity(&self, config: &SubscribeConfig) -> usize {
        let requested = config.queue_depth.unwrap_or(self.queue_depth).max(1);
        match (config.window, config.max_rate) {
            // Metadata only, nothing pinned
            (Some(window), _) => requested.max(window.size),
            (None, Some(_)) => 1,
            (None, None) => requested.min(self.frame_depth_limit),
        }
    }

    /// Register a callback. It runs on a dedicated thread, never on the producer's.
    pub fn subscribe<F>(self: &Arc<Self>, on_event: F, config: SubscribeConfig) -> Result<Subscription>
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        if self.is_closed() {
            return Err(CaptureError::SessionStopped);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let capacity = self.mailbox_capacity(&config);
        let (tx, rx) = flume::bounded(capacity);
        let control = Arc::new(Control {
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            gate: Mutex::new(()),
            dispatcher: OnceLock::new(),
            evicted: AtomicU64::new(0),
        });

        let handle = thread::Builder::new()
            .name(format!("framecap-sub-{}", id))
            .spawn({
                let control = Arc::clone(&control);
                let rx = rx.clone();
                let window = config.window.map(SlidingWindow::new);
                move || dispatch(rx, control, window, on_event)
            })
            .map_err(CaptureError::backend)?;
        let _ = control.dispatcher.set(handle.thread().id());

        let subscriber = Arc::new(Subscriber {
            id,
            policy: Mutex::new(DeliveryPolicy::new(&config)),
            tx,
            evict: rx,
            capacity,
            control: Arc::clone(&control),
        });
        self.subscribers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&subscriber));
            next
        });

        // close() may have swapped the list out between the check above and the insert
        if self.is_closed() {
            self.remove(id);
            control.active.store(false, Ordering::Release);
            return Err(CaptureError::SessionStopped);
        }

        debug!("Subscriber {} registered ({:?}, mailbox {})", id, config, capacity);
        Ok(Subscription {
            id,
            publisher: Arc::downgrade(self),
            control,
        })
    }

    /// Producer: offer a frame to every subscriber. Never blocks.
    pub fn publish(&self, frame: FrameHandle) {
        if self.is_closed() {
            return;
        }

        let subscribers = self.subscribers.load();
        for subscriber in subscribers.iter() {
            subscriber.offer(&frame);
        }
        metrics::counter!("framecap_frames_published").increment(1);
    }

    /// End the stream: queued frames are discarded and every subscriber gets `Completed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let subscribers = self.subscribers.swap(Arc::new(Vec::new()));
        for subscriber in subscribers.iter() {
            subscriber.complete();
        }
        debug!("Publisher closed, {} subscribers completed", subscribers.len());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load().len()
    }

    fn remove(&self, id: u64) -> bool {
        let mut removed = false;
        self.subscribers.rcu(|current| {
            let next: Vec<_> = current.iter().filter(|s| s.id != id).cloned().collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }
}

impl Drop for FramePublisher {
    fn drop(&mut self) {
        self.close();
    }
}

impl Subscriber {
    fn offer(&self, frame: &FrameHandle) {
        let admission = lock(&self.policy).admit(frame.info());

        let mail = match admission {
            Admission::Skip => return,
            Admission::Frame => Mail::Frame(frame.clone()),
            Admission::Windowed => Mail::Tick(frame.info()),
        };
        self.enqueue(mail);
    }

    /// Last value wins: make room by dropping the oldest queued event.
    fn enqueue(&self, mut mail: Mail) {
        for _ in 0..=self.capacity {
            if self.control.closed.load(Ordering::Acquire) {
                return;
            }
            match self.tx.try_send(mail) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.evict.try_recv().is_ok() {
                        self.control.evicted.fetch_add(1, Ordering::Relaxed);
                        trace!("Subscriber {} lagging, evicted oldest event", self.id);
                    }
                    mail = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// `Completed` itself is delivered once the last sender is dropped.
    fn complete(&self) {
        self.control.closed.store(true, Ordering::Release);
        while self.evict.try_recv().is_ok() {}
    }
}

fn dispatch<F>(
    rx: Receiver<Mail>,
    control: Arc<Control>,
    mut window: Option<SlidingWindow>,
    mut on_event: F,
) where
    F: FnMut(StreamEvent),
{
    while let Ok(mail) = rx.recv() {
        if control.closed.load(Ordering::Acquire) {
            continue;
        }

        let event = match mail {
            Mail::Frame(frame) if !frame.is_valid() => {
                // Recycled while queued
                control.evicted.fetch_add(1, Ordering::Relaxed);
                trace!("Skipping stale frame {}", frame.sequence());
                continue;
            }
            Mail::Frame(frame) => StreamEvent::Frame(frame),
            Mail::Tick(info) => match window.as_mut().and_then(|w| w.push(info)) {
                Some(batch) => StreamEvent::Window(batch),
                None => continue,
            },
        };
        if !deliver(&control, &mut on_event, event) {
            return;
        }
    }

    // Every sender is gone: either closed or unsubscribed
    if control.closed.load(Ordering::Acquire) {
        deliver(&control, &mut on_event, StreamEvent::Completed);
    }
    control.active.store(false, Ordering::Release);
}

/// Run one callback under the gate. False once the subscriber is inactive.
fn deliver<F>(control: &Control, on_event: &mut F, event: StreamEvent) -> bool
where
    F: FnMut(StreamEvent),
{
    let _gate = lock(&control.gate);
    if !control.active.load(Ordering::Acquire) {
        return false;
    }
    on_event(event);
    true
}

/// Handle returned by `subscribe`
pub struct Subscription {
    id: u64,
    publisher: Weak<FramePublisher>,
    control: Arc<Control>,
}

impl Subscription {
    /// False once unsubscribed or after the stream completed
    pub fn is_active(&self) -> bool {
        self.control.active.load(Ordering::Acquire)
    }

    /// Events this subscriber lost: evicted from a full mailbox, or frames
    /// whose ring slot was recycled before they could be delivered
    pub fn evicted(&self) -> u64 {
        self.control.evicted.load(Ordering::Relaxed)
    }

    /// Idempotent. No callback runs after this returns, unless called from
    /// inside the callback itself, in which case that call is the last.
    pub fn unsubscribe(&self) {
        self.control.active.store(false, Ordering::Release);

        if self.control.dispatcher.get() != Some(&thread::current().id()) {
            // Wait out a callback that is already running
            drop(lock(&self.control.gate));
        }

        // Dropping the subscriber's sender lets the dispatcher thread exit
        if let Some(publisher) = self.publisher.upgrade() {
            if publisher.remove(self.id) {
                debug!("Subscriber {} removed", self.id);
            }
        }
    }
}
