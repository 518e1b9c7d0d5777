//! Capture session lifecycle: Idle → Starting → Running → Stopping → Idle

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::capture::backend::{BufferSink, CaptureBackend, CaptureGraph};
use crate::capture::callback::CaptureCallback;
use crate::capture::device::{DeviceCatalog, DeviceDescriptor};
use crate::capture::frame::FrameFormat;
use crate::capture::negotiate::{negotiate_resolution, Negotiation};
use crate::error::{CaptureError, Result};
use crate::pipeline::{
    FramePublisher, FrameRing, RingStats, StreamEvent, SubscribeConfig, Subscription,
    DEFAULT_QUEUE_DEPTH,
};
use crate::utils::lock;
use crate::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Per-session sizing of the frame ring and subscriber mailboxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub slot_count: usize,
    pub queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            slot_count: 3,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl From<&PipelineConfig> for SessionConfig {
    fn from(pipeline: &PipelineConfig) -> Self {
        Self {
            slot_count: pipeline.slot_count,
            queue_depth: pipeline.queue_depth,
        }
    }
}

/// Counters for the current (or most recent) capture run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub slots_recycled: u64,
    pub format_mismatches: u64,
    pub subscribers: usize,
}

/// Drives one capture device at a time.
///
/// `start` and `stop` run graph work on tokio's blocking pool, so they must be
/// called from within a tokio runtime. Frames are delivered on the backend's
/// thread and fanned out to subscribers on their own threads.
pub struct CaptureSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    catalog: DeviceCatalog,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    /// Present while a start is in flight
    cancel: Mutex<Option<Arc<AtomicBool>>>,
    active: Mutex<Option<ActiveCapture>>,
    /// Counters of the most recent run; the ring itself is released on stop
    last_run: Mutex<Option<RunSnapshot>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct RunSnapshot {
    ring: RingStats,
    subscribers: usize,
}

/// Everything a running capture owns. Dropping it releases the graph.
struct ActiveCapture {
    device: DeviceDescriptor,
    graph: GraphGuard,
    callback: Arc<CaptureCallback>,
    publisher: Arc<FramePublisher>,
    negotiation: Negotiation,
}

/// Scoped ownership of a backend graph: stopped and released on every exit path
struct GraphGuard {
    graph: Box<dyn CaptureGraph>,
    running: bool,
}

impl GraphGuard {
    fn new(graph: Box<dyn CaptureGraph>) -> Self {
        Self {
            graph,
            running: false,
        }
    }

    fn graph_mut(&mut self) -> &mut dyn CaptureGraph {
        self.graph.as_mut()
    }

    fn run(&mut self, sink: Arc<dyn BufferSink>) -> Result<()> {
        self.graph.run(sink)?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.running) {
            return Ok(());
        }
        self.graph.stop()
    }
}

impl Drop for GraphGuard {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Graph did not stop cleanly: {}", e);
        }
    }
}

impl ActiveCapture {
    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            ring: self.callback.stats(),
            subscribers: self.publisher.subscriber_count(),
        }
    }

    /// Stops the graph, completes subscribers and drops the ring.
    fn shutdown(mut self) -> RunSnapshot {
        if let Err(e) = self.graph.stop() {
            warn!("Stopping capture on {}: {}", self.device, e);
        }
        let snapshot = self.snapshot();
        self.publisher.close();

        info!(
            "Capture on {} stopped: {} frames written, {} dropped",
            self.device, snapshot.ring.frames_written, snapshot.ring.frames_dropped
        );
        snapshot
    }
}

fn check_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Acquire) {
        return Err(CaptureError::start_failed("cancelled by stop"));
    }
    Ok(())
}

fn start_failure(err: CaptureError) -> CaptureError {
    match err {
        CaptureError::CaptureStartFailed { .. } | CaptureError::DeviceNotFound(_) => err,
        other => CaptureError::start_failed(other.to_string()),
    }
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn CaptureBackend>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(SessionInner {
                catalog: DeviceCatalog::new(backend),
                config,
                state,
                cancel: Mutex::new(None),
                active: Mutex::new(None),
                last_run: Mutex::new(None),
            }),
        }
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.inner.catalog
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Resolves once the session reaches `target`
    pub async fn wait_for_state(&self, target: SessionState) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Open `device_id`, negotiate `width`x`height` and start capturing.
    ///
    /// Graph construction runs off the caller's task. The returned stream's
    /// format is what the device actually delivers, which may differ from the
    /// request. On failure the session is back to `Idle`.
    ///
    /// Dropping the returned future does not abandon the attempt: it finishes
    /// in the background and leaves the session `Running` (stop it as usual)
    /// or `Idle`.
    #[instrument(skip(self))]
    pub async fn start(&self, device_id: &str, width: u32, height: u32) -> Result<FrameStream> {
        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(CaptureError::AlreadyActive);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        *lock(&self.inner.cancel) = Some(Arc::clone(&cancel));
        info!("Starting capture on {}", device_id);

        // Detached so the state always leaves Starting
        let attempt = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let device_id = device_id.to_string();
            async move {
                let built = tokio::task::spawn_blocking({
                    let inner = Arc::clone(&inner);
                    move || inner.build(&device_id, width, height, &cancel)
                })
                .await
                .unwrap_or_else(|e| {
                    Err(CaptureError::start_failed(format!("start task failed: {}", e)))
                });
                inner.finish_start(built).await
            }
        });

        match attempt.await {
            Ok(result) => result,
            Err(e) => {
                lock(&self.inner.cancel).take();
                self.inner.state.send_replace(SessionState::Idle);
                Err(CaptureError::start_failed(format!("start task failed: {}", e)))
            }
        }
    }

    /// Stop capturing. Always safe, idempotent, and cancels a start in flight.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut rx = self.inner.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                SessionState::Idle => return,
                SessionState::Starting => {
                    if let Some(cancel) = lock(&self.inner.cancel).as_ref() {
                        cancel.store(true, Ordering::Release);
                        info!("Cancelling capture start");
                    }
                    if rx.wait_for(|state| *state != SessionState::Starting).await.is_err() {
                        return;
                    }
                }
                SessionState::Running => {
                    let claimed = self.inner.state.send_if_modified(|state| {
                        if *state == SessionState::Running {
                            *state = SessionState::Stopping;
                            true
                        } else {
                            false
                        }
                    });
                    if !claimed {
                        continue;
                    }

                    let active = lock(&self.inner.active).take();
                    if let Some(active) = active.as_ref() {
                        *lock(&self.inner.last_run) = Some(active.snapshot());
                    }
                    let inner = Arc::clone(&self.inner);
                    // Settles the state even if this future is dropped
                    let teardown = tokio::task::spawn_blocking(move || {
                        if let Some(active) = active {
                            *lock(&inner.last_run) = Some(active.shutdown());
                        }
                        inner.state.send_replace(SessionState::Idle);
                    });
                    if let Err(e) = teardown.await {
                        warn!("Capture teardown failed: {}", e);
                        self.inner.state.send_replace(SessionState::Idle);
                    }
                    info!("Capture session idle");
                    return;
                }
                SessionState::Stopping => {
                    let _ = rx.wait_for(|state| *state == SessionState::Idle).await;
                    return;
                }
            }
        }
    }

    /// Live counters while running, otherwise those of the last run
    pub fn stats(&self) -> SessionStats {
        let state = self.state();
        let live = lock(&self.inner.active).as_ref().map(ActiveCapture::snapshot);
        let RunSnapshot { ring, subscribers } =
            live.or(*lock(&self.inner.last_run)).unwrap_or_default();
        let RingStats {
            frames_written,
            frames_dropped,
            slots_recycled,
            format_mismatches,
        } = ring;
        SessionStats {
            state,
            frames_written,
            frames_dropped,
            slots_recycled,
            format_mismatches,
            subscribers,
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(cancel) = lock(&self.inner.cancel).as_ref() {
            cancel.store(true, Ordering::Release);
        }
        let active = lock(&self.inner.active).take();
        if let Some(active) = active {
            debug!("Session dropped while running, tearing down");
            active.shutdown();
            self.inner.state.send_replace(SessionState::Idle);
        }
    }
}

impl SessionInner {
    /// Runs on the blocking pool. Any error drops what was built so far.
    fn build(&self, device_id: &str, width: u32, height: u32, cancel: &AtomicBool) -> Result<ActiveCapture> {
        let device = self.catalog.resolve(device_id).map_err(start_failure)?;
        check_cancelled(cancel)?;

        let graph = self
            .catalog
            .backend()
            .open(&device)
            .map_err(start_failure)?;
        let mut graph = GraphGuard::new(graph);
        check_cancelled(cancel)?;

        let negotiation =
            negotiate_resolution(graph.graph_mut(), width, height).map_err(start_failure)?;
        if negotiation.acquired.frame_len() == 0 {
            return Err(CaptureError::start_failed(format!(
                "negotiated format {} holds no pixels",
                negotiation.acquired
            )));
        }
        check_cancelled(cancel)?;

        let ring = FrameRing::new(negotiation.acquired, self.config.slot_count);
        let publisher = Arc::new(
            FramePublisher::new(self.config.queue_depth).with_ring_slots(ring.slot_count()),
        );
        let callback = Arc::new(CaptureCallback::new(ring, Arc::clone(&publisher)));
        graph.run(callback.clone()).map_err(start_failure)?;

        Ok(ActiveCapture {
            device,
            graph,
            callback,
            publisher,
            negotiation,
        })
    }

    async fn finish_start(&self, built: Result<ActiveCapture>) -> Result<FrameStream> {
        let cancel = lock(&self.cancel).take();
        let cancelled = cancel.map_or(false, |flag| flag.load(Ordering::Acquire));

        let active = match built {
            Ok(active) if cancelled => {
                // stop() arrived after the last checkpoint
                let _ = tokio::task::spawn_blocking(move || active.shutdown()).await;
                self.state.send_replace(SessionState::Idle);
                return Err(CaptureError::start_failed("cancelled by stop"));
            }
            Ok(active) => active,
            Err(e) => {
                self.state.send_replace(SessionState::Idle);
                warn!("Capture start failed: {}", e);
                return Err(e);
            }
        };

        let stream = FrameStream {
            publisher: Arc::clone(&active.publisher),
            negotiation: active.negotiation,
            device: active.device.clone(),
        };
        *lock(&self.active) = Some(active);
        self.state.send_replace(SessionState::Running);

        info!(
            "Capturing from {} at {}{}",
            stream.device(),
            stream.format(),
            if stream.negotiation.exact { "" } else { " (device default)" }
        );
        Ok(stream)
    }
}

/// Subscribe-capable view of a running session's frames
#[derive(Clone)]
pub struct FrameStream {
    publisher: Arc<FramePublisher>,
    negotiation: Negotiation,
    device: DeviceDescriptor,
}

impl FrameStream {
    /// The negotiated format every frame will have
    pub fn format(&self) -> FrameFormat {
        self.negotiation.acquired
    }

    pub fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Fails with `SessionStopped` once the session has been stopped
    pub fn subscribe<F>(&self, on_event: F, config: SubscribeConfig) -> Result<Subscription>
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        self.publisher.subscribe(on_event, config)
    }

    pub fn is_closed(&self) -> bool {
        self.publisher.is_closed()
    }
}

impl fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameStream")
            .field("device", &self.device)
            .field("negotiation", &self.negotiation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::{SimulatedBackend, SimulatedDevice};

    #[tokio::test]
    async fn stop_releases_the_ring_but_keeps_counters() {
        let backend = SimulatedBackend::new();
        backend.add_device(SimulatedDevice::new("cam", "Camera"));
        let session = CaptureSession::new(Arc::new(backend.clone()), SessionConfig::default());

        let _stream = session.start("cam", 640, 480).await.unwrap();
        assert!(backend.emit_pattern("cam", 1));
        assert!(backend.emit_pattern("cam", 2));
        let callback = lock(&session.inner.active)
            .as_ref()
            .map(|active| Arc::downgrade(&active.callback))
            .unwrap();
        assert_eq!(session.stats().frames_written, 2);

        session.stop().await;

        assert_eq!(callback.strong_count(), 0);
        let stats = session.stats();
        assert_eq!(stats.state, SessionState::Idle);
        assert_eq!(stats.frames_written, 2);
        assert_eq!(stats.subscribers, 0);
    }
}
