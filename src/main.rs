//! framecap: live frames from a capture device, logged with measured frame rate

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info};

use framecap::{
    utils, CaptureBackend, CaptureSession, Config, SimulatedBackend, StreamEvent, SubscribeConfig,
};

#[derive(Parser, Debug)]
#[command(name = "framecap", version, about = "Capture live frames from a video device")]
struct Args {
    /// List capture devices and exit
    #[arg(long)]
    list: bool,

    /// Device id (see --list); defaults to the configured or first device
    #[arg(short, long)]
    device: Option<String>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use a simulated 30 fps camera instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    seconds: Option<u64>,
}

fn backend(simulate: bool) -> Result<Arc<dyn CaptureBackend>> {
    if simulate {
        return Ok(Arc::new(SimulatedBackend::demo()));
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(framecap::capture::V4l2Backend::default()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(eyre!("No native capture backend on this platform, use --simulate"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    utils::init_tracing("framecap=info");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(width) = args.width {
        config.capture.width = width;
    }
    if let Some(height) = args.height {
        config.capture.height = height;
    }

    let session = CaptureSession::new(backend(args.simulate)?, config.session());

    if args.list {
        for device in session.catalog().list_devices()? {
            println!("{}\t{}", device.id, device.display_name);
        }
        return Ok(());
    }

    let device = match args.device.or(config.capture.device.clone()) {
        Some(id) => session.catalog().resolve(&id)?,
        None => utils::auto_detect_device(session.catalog())?,
    };
    info!("Using capture device: {}", device);

    let stream = session
        .start(&device.id, config.capture.width, config.capture.height)
        .await?;
    let format = stream.format();
    if format.pixel_count() == 0 {
        return Err(eyre!("Device negotiated an empty format"));
    }
    info!("Streaming {} from {}", format, stream.device());

    let preview = stream.subscribe(
        |event| match event {
            StreamEvent::Frame(frame) => match frame.data() {
                Ok(pixels) => {
                    let checksum = pixels.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32));
                    debug!("Frame {} checksum {:08x}", frame.sequence(), checksum);
                }
                Err(e) => debug!("Frame {} skipped: {}", frame.sequence(), e),
            },
            StreamEvent::Completed => info!("Preview stream completed"),
            StreamEvent::Window(_) => {}
        },
        SubscribeConfig::throttled(Duration::from_millis(config.pipeline.preview_interval_ms)),
    )?;

    let statistics = stream.subscribe(
        |event| {
            if let StreamEvent::Window(window) = event {
                if let Some(fps) = window.frame_rate() {
                    info!("Measured {:.1} fps", fps);
                }
            }
        },
        SubscribeConfig::windowed(config.pipeline.stats_window, config.pipeline.stats_stride),
    )?;

    let limit = async {
        match args.seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = limit => {}
    }

    statistics.unsubscribe();
    let stats = session.stats();
    session.stop().await;
    preview.unsubscribe();

    info!(
        "framecap shutting down: {} frames captured, {} dropped, {} slots recycled",
        stats.frames_written, stats.frames_dropped, stats.slots_recycled
    );
    Ok(())
}
