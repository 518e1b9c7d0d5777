//! End-to-end capture session tests against the simulated backend

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use framecap::capture::simulated::pattern_frame;
use framecap::{
    CaptureError, CaptureSession, FrameHandle, PixelFormat, SessionConfig, SessionState,
    SimulatedBackend, SimulatedDevice, StreamCapability, StreamEvent, SubscribeConfig,
};

const CAM: &str = "cam-0";

fn two_mode_camera() -> SimulatedDevice {
    SimulatedDevice::new(CAM, "Test Camera")
        .with_capabilities(vec![
            StreamCapability::new(PixelFormat::Bgr32, 320, 240),
            StreamCapability::new(PixelFormat::Bgr32, 640, 480),
        ])
        .with_default(StreamCapability::new(PixelFormat::Bgr32, 320, 240))
}

fn session_with(device: SimulatedDevice) -> (CaptureSession, SimulatedBackend) {
    let backend = SimulatedBackend::new();
    backend.add_device(device);
    let session = CaptureSession::new(Arc::new(backend.clone()), SessionConfig::default());
    (session, backend)
}

fn frame_collector() -> (
    impl FnMut(StreamEvent) + Send + 'static,
    mpsc::Receiver<StreamEvent>,
) {
    let (tx, rx) = mpsc::channel();
    (
        move |event| {
            let _ = tx.send(event);
        },
        rx,
    )
}

fn next_frame(rx: &mpsc::Receiver<StreamEvent>) -> FrameHandle {
    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(StreamEvent::Frame(frame)) => frame,
        other => panic!("expected a frame, got {:?}", other),
    }
}

#[tokio::test]
async fn start_negotiates_exact_resolution() {
    let (session, backend) = session_with(two_mode_camera());

    let stream = session.start(CAM, 640, 480).await.unwrap();
    assert_eq!(session.state(), SessionState::Running);

    let format = stream.format();
    assert_eq!((format.width, format.height), (640, 480));
    assert_eq!(format.stride, 640 * 4);
    assert!(format.pixel_count() > 0);
    assert!(stream.negotiation().exact);
    assert!(backend.is_running(CAM));

    session.stop().await;
}

#[tokio::test]
async fn unsupported_resolution_falls_back_to_default() {
    let (session, _backend) = session_with(two_mode_camera());

    let stream = session.start(CAM, 800, 600).await.unwrap();
    let negotiation = stream.negotiation();
    assert!(!negotiation.exact);
    assert_eq!(negotiation.requested, (800, 600));
    assert_eq!((stream.format().width, stream.format().height), (320, 240));
    assert_eq!(session.state(), SessionState::Running);

    session.stop().await;
}

#[tokio::test]
async fn second_start_is_rejected_without_changing_state() {
    let (session, backend) = session_with(two_mode_camera());
    let stream = session.start(CAM, 640, 480).await.unwrap();

    let err = session.start(CAM, 320, 240).await.unwrap_err();
    assert!(matches!(err, CaptureError::AlreadyActive));
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(backend.opens(), 1);
    assert!(!stream.is_closed());

    session.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_releases_the_graph() {
    let (session, backend) = session_with(two_mode_camera());
    session.stop().await;
    assert_eq!(session.state(), SessionState::Idle);

    session.start(CAM, 640, 480).await.unwrap();
    assert_eq!(backend.open_graphs(), 1);

    session.stop().await;
    session.stop().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(backend.open_graphs(), 0);
    assert!(!backend.is_running(CAM));
}

#[tokio::test]
async fn session_can_restart_after_stop() {
    let (session, backend) = session_with(two_mode_camera());

    session.start(CAM, 640, 480).await.unwrap();
    session.stop().await;
    let stream = session.start(CAM, 320, 240).await.unwrap();

    assert_eq!(stream.format().width, 320);
    assert_eq!(backend.opens(), 2);
    assert_eq!(backend.open_graphs(), 1);
    session.stop().await;
}

#[tokio::test]
async fn unknown_device_is_reported() {
    let (session, _backend) = session_with(two_mode_camera());

    let err = session.start("missing", 640, 480).await.unwrap_err();
    assert!(matches!(err, CaptureError::DeviceNotFound(id) if id == "missing"));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn open_failure_returns_to_idle() {
    let (session, backend) = session_with(two_mode_camera().failing_open("device busy"));

    let err = session.start(CAM, 640, 480).await.unwrap_err();
    match err {
        CaptureError::CaptureStartFailed { reason } => assert!(reason.contains("device busy")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(backend.open_graphs(), 0);
}

#[tokio::test]
async fn run_failure_releases_the_partial_graph() {
    let (session, backend) = session_with(two_mode_camera().failing_run("stream refused"));

    let err = session.start(CAM, 640, 480).await.unwrap_err();
    assert!(matches!(err, CaptureError::CaptureStartFailed { .. }));
    assert_eq!(backend.opens(), 1);
    assert_eq!(backend.open_graphs(), 0);
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_cancels_a_start_in_flight() {
    let (session, backend) =
        session_with(two_mode_camera().with_open_delay(Duration::from_millis(300)));

    let (started, ()) = tokio::join!(session.start(CAM, 640, 480), async {
        session.wait_for_state(SessionState::Starting).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.stop().await;
    });

    match started {
        Err(CaptureError::CaptureStartFailed { reason }) => assert!(reason.contains("cancelled")),
        other => panic!("start should have been cancelled, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(backend.open_graphs(), 0);
    assert!(!backend.is_running(CAM));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_start_future_still_settles_the_session() {
    let (session, backend) =
        session_with(two_mode_camera().with_open_delay(Duration::from_millis(200)));

    let attempt = tokio::time::timeout(Duration::from_millis(20), session.start(CAM, 320, 240)).await;
    assert!(attempt.is_err());
    assert_eq!(session.state(), SessionState::Starting);

    tokio::time::timeout(Duration::from_secs(2), session.wait_for_state(SessionState::Running))
        .await
        .expect("abandoned start never finished");
    tokio::time::timeout(Duration::from_secs(2), session.stop())
        .await
        .expect("stop hung after an abandoned start");
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(backend.open_graphs(), 0);

    let stream = session.start(CAM, 640, 480).await.unwrap();
    assert_eq!(stream.format().width, 640);
    session.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lagging_subscriber_is_never_handed_a_recycled_frame() {
    let (session, backend) = session_with(two_mode_camera());
    let stream = session.start(CAM, 320, 240).await.unwrap();

    let (tx, rx) = mpsc::channel();
    let sub = stream
        .subscribe(
            move |event| {
                if let StreamEvent::Frame(frame) = event {
                    let live = frame.data().is_ok();
                    std::thread::sleep(Duration::from_millis(20));
                    let _ = tx.send((frame.sequence(), live));
                }
            },
            SubscribeConfig::default(),
        )
        .unwrap();

    for seed in 1..=8 {
        assert!(backend.emit_pattern(CAM, seed));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.stop().await;

    let delivered: Vec<(u64, bool)> = rx.iter().collect();
    assert!(!delivered.is_empty());
    assert!(delivered.iter().all(|(_, live)| *live), "delivered {:?}", delivered);
    assert_eq!(delivered.len() as u64 + sub.evicted(), 8);
}

#[tokio::test]
async fn every_frame_reaches_an_unthrottled_subscriber() {
    let (session, backend) = session_with(two_mode_camera());
    let stream = session.start(CAM, 320, 240).await.unwrap();

    let (collect, rx) = frame_collector();
    let _sub = stream
        .subscribe(collect, SubscribeConfig::default().with_queue_depth(64))
        .unwrap();

    // A subscriber that keeps up with the device
    let mut sequences = Vec::new();
    for seed in 1..=40 {
        assert!(backend.emit_pattern(CAM, seed));
        sequences.push(next_frame(&rx).sequence());
    }
    assert_eq!(sequences, (1..=40).collect::<Vec<_>>());
    session.stop().await;
}

#[tokio::test]
async fn held_frames_are_never_torn() {
    let (session, backend) = session_with(two_mode_camera());
    let stream = session.start(CAM, 320, 240).await.unwrap();
    let frame_len = stream.format().frame_len();

    let (collect, rx) = frame_collector();
    let _sub = stream
        .subscribe(collect, SubscribeConfig::default().with_queue_depth(64))
        .unwrap();

    // Holding every frame pins all slots, so later writes recycle the oldest
    let mut held: Vec<FrameHandle> = Vec::new();
    for seed in 1..=12 {
        assert!(backend.emit_pattern(CAM, seed));
        held.push(next_frame(&rx));
    }
    assert!(session.stats().slots_recycled > 0);

    // Every held handle shows exactly what was written, or reports that its
    // slot was reclaimed; never a mix of two frames
    for frame in &held {
        match frame.data() {
            Ok(pixels) => assert_eq!(&*pixels, &pattern_frame(frame_len, frame.sequence())[..]),
            Err(CaptureError::StaleFrame { sequence }) => assert_eq!(sequence, frame.sequence()),
            Err(other) => panic!("unexpected {:?}", other),
        }
    }

    // The newest frames always survive
    let newest = held.last().unwrap();
    assert_eq!(
        newest.to_bytes().unwrap(),
        pattern_frame(frame_len, 12)
    );
    session.stop().await;
}

#[tokio::test]
async fn malformed_buffers_are_dropped_and_counted() {
    let (session, backend) = session_with(two_mode_camera());
    let stream = session.start(CAM, 320, 240).await.unwrap();

    let (collect, rx) = frame_collector();
    let _sub = stream.subscribe(collect, SubscribeConfig::default()).unwrap();

    assert!(backend.emit(CAM, &[0u8; 17]));
    assert!(backend.emit_pattern(CAM, 1));

    assert_eq!(next_frame(&rx).sequence(), 1);
    let stats = session.stats();
    assert_eq!(stats.state, SessionState::Running);
    assert_eq!(stats.format_mismatches, 1);
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.frames_written, 1);
    session.stop().await;
}

#[tokio::test]
async fn stop_completes_subscribers_and_closes_the_stream() {
    let (session, backend) = session_with(two_mode_camera());
    let stream = session.start(CAM, 320, 240).await.unwrap();

    let (collect, rx) = frame_collector();
    let sub = stream.subscribe(collect, SubscribeConfig::default()).unwrap();
    assert!(backend.emit_pattern(CAM, 1));
    assert_eq!(next_frame(&rx).sequence(), 1);

    session.stop().await;

    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(StreamEvent::Completed) => {}
        other => panic!("expected completion, got {:?}", other),
    }
    assert!(!backend.emit_pattern(CAM, 2));
    assert!(stream.is_closed());
    assert!(matches!(
        stream.subscribe(|_| {}, SubscribeConfig::default()),
        Err(CaptureError::SessionStopped)
    ));

    std::thread::sleep(Duration::from_millis(20));
    assert!(!sub.is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn throttled_subscriber_on_a_live_device() {
    let (session, _backend) = session_with(two_mode_camera().with_frame_rate(100));
    let stream = session.start(CAM, 320, 240).await.unwrap();

    let (tx, rx) = mpsc::channel();
    let _sub = stream
        .subscribe(
            move |event| {
                if let StreamEvent::Frame(frame) = event {
                    let _ = tx.send((frame.sequence(), frame.captured_at()));
                }
            },
            SubscribeConfig::throttled(Duration::from_millis(100)),
        )
        .unwrap();

    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(500)).await;
    session.stop().await;
    let elapsed = started.elapsed();

    let delivered: Vec<(u64, Instant)> = rx.try_iter().collect();
    assert!(!delivered.is_empty());
    assert!(delivered.len() as u128 <= elapsed.as_millis() / 100 + 1);
    for pair in delivered.windows(2) {
        assert!(pair[0].0 < pair[1].0);
        assert!(pair[1].1.duration_since(pair[0].1) >= Duration::from_millis(100));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn windowed_subscriber_measures_frame_rate() {
    let (session, _backend) = session_with(two_mode_camera().with_frame_rate(100));
    let stream = session.start(CAM, 320, 240).await.unwrap();

    let (tx, rx) = mpsc::channel();
    let _sub = stream
        .subscribe(
            move |event| {
                if let StreamEvent::Window(window) = event {
                    let _ = tx.send(window);
                }
            },
            SubscribeConfig::windowed(10, 5),
        )
        .unwrap();

    let window = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    session.stop().await;

    assert_eq!(window.len(), 10);
    assert!(window.frames.windows(2).all(|w| w[0].sequence < w[1].sequence));
    let fps = window.frame_rate().unwrap();
    assert!(fps > 5.0 && fps < 1000.0, "fps {}", fps);
}
