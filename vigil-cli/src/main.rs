// Vigil command line interface
// Runs the detection pipeline against a live or recorded feed

mod logging;
mod status_server;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use vigil_eye::audit::{FanoutAuditSink, JsonLinesAuditSink, TracingAuditSink};
use vigil_eye::capture::{ImageSequenceSource, SyntheticSource};
use vigil_eye::detectors::PersonLocator;
use vigil_eye::{
    AuditSink, CaptureSource, ExitReason, Pipeline, PipelineConfig, PipelineHandle, RawFrame,
};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Vigil - real-time fire, crowd and fall detection", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace); RUST_LOG overrides
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a feed until it ends or Ctrl-C
    Run(RunArgs),

    /// Run the enabled detectors once on a still image
    Detect {
        /// Image file (png, jpg, bmp)
        image: PathBuf,

        #[command(flatten)]
        detectors: DetectorArgs,
    },

    /// Print the effective configuration
    Config {
        /// Configuration file path
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct DetectorArgs {
    /// Configuration file path
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Switch a detector off (fire, crowd, fall); repeatable
    #[arg(long = "disable", value_name = "DETECTOR")]
    disabled: Vec<String>,

    /// ONNX person model for the crowd and fall detectors
    #[arg(long)]
    model: Option<PathBuf>,

    /// Minimum score for a person box from the model
    #[arg(long, value_name = "SCORE", requires = "model")]
    person_confidence: Option<f32>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    detectors: DetectorArgs,

    /// Capture from a camera (index from the config unless given)
    #[arg(long, value_name = "INDEX", num_args = 0..=1, default_missing_value = "-1",
          conflicts_with_all = ["images", "synthetic"])]
    camera: Option<i64>,

    /// Requested camera frame width
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Requested camera frame height
    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Requested camera frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Replay the images in a directory, in file name order
    #[arg(long, value_name = "DIR", conflicts_with = "synthetic")]
    images: Option<PathBuf>,

    /// Replay the image directory forever
    #[arg(long = "loop", requires = "images")]
    loop_images: bool,

    /// Built-in demo feed with a flame every few seconds
    #[arg(long)]
    synthetic: bool,

    /// Serve the read-only status API on this address
    #[arg(long, value_name = "ADDR")]
    status_addr: Option<SocketAddr>,

    /// Append audit events to this JSON lines file
    #[arg(long, value_name = "FILE")]
    audit_log: Option<PathBuf>,

    /// Override sample_every_n_frames
    #[arg(long)]
    sample_every: Option<u32>,

    /// Override dispatch_timeout_ms
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Seconds between status log lines
    #[arg(long, default_value = "10")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.json)?;

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Detect { image, detectors } => detect(&image, &detectors),
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn detector_config(args: &DetectorArgs) -> Result<PipelineConfig> {
    let mut config = load_config(args.config.as_deref())?;
    for id in &args.disabled {
        if !config.detectors.disable(id) {
            bail!("unknown detector '{}' (expected fire, crowd or fall)", id);
        }
    }
    Ok(config)
}

#[cfg(feature = "yolo")]
fn person_locator(args: &DetectorArgs) -> Result<Option<Arc<dyn PersonLocator>>> {
    use vigil_eye::detectors::YoloPersonLocator;

    match &args.model {
        Some(path) => {
            let mut locator = YoloPersonLocator::new(path)
                .with_context(|| format!("failed to load person model {}", path.display()))?;
            if let Some(score) = args.person_confidence {
                if !(0.0..=1.0).contains(&score) {
                    bail!("--person-confidence must be between 0 and 1");
                }
                locator = locator.with_confidence_threshold(score);
            }
            Ok(Some(Arc::new(locator)))
        }
        None => {
            warn!("No --model given; crowd and fall detection are off");
            Ok(None)
        }
    }
}

#[cfg(not(feature = "yolo"))]
fn person_locator(args: &DetectorArgs) -> Result<Option<Arc<dyn PersonLocator>>> {
    if args.model.is_some() || args.person_confidence.is_some() {
        warn!("Built without the yolo feature; ignoring --model");
    }
    Ok(None)
}

fn detect(image_path: &Path, args: &DetectorArgs) -> Result<()> {
    let config = detector_config(args)?;
    let image = image::open(image_path)
        .with_context(|| format!("failed to read {}", image_path.display()))?
        .to_rgb8();
    let raw = RawFrame::from_rgb_image(image)?;

    let result = Pipeline::builder(config)
        .with_standard_detectors(person_locator(args)?)
        .detect_once(raw)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn audit_sink(path: Option<&Path>) -> Result<Arc<dyn AuditSink>> {
    let log_sink: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let mut fanout = FanoutAuditSink::new(vec![log_sink]);
    if let Some(path) = path {
        let file = JsonLinesAuditSink::create(path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        info!(path = %path.display(), "Writing audit events");
        fanout.push(Arc::new(file));
    }
    Ok(Arc::new(fanout))
}

/// Grey scene with a flame every fiftieth frame
fn demo_feed() -> Result<SyntheticSource> {
    let mut frames = Vec::with_capacity(50);
    for i in 0..50 {
        let rgb = if i == 49 { [255, 210, 0] } else { [70, 80, 90] };
        frames.push(RawFrame::solid(320, 240, rgb)?);
    }
    Ok(SyntheticSource::looping(frames).with_frame_rate(15))
}

fn capture_source(args: &RunArgs, config: &PipelineConfig) -> Result<Box<dyn CaptureSource>> {
    let camera_knobs = args.width.is_some() || args.height.is_some() || args.fps.is_some();
    if camera_knobs && (args.images.is_some() || args.synthetic) {
        warn!("--width, --height and --fps only apply to camera capture");
    }
    if let Some(dir) = &args.images {
        let mut source = ImageSequenceSource::new(dir);
        if args.loop_images {
            source = source.looping();
        }
        return Ok(Box::new(source));
    }
    if args.synthetic {
        return Ok(Box::new(demo_feed()?));
    }
    camera_source(args, config)
}

#[cfg(feature = "camera")]
fn camera_source(args: &RunArgs, config: &PipelineConfig) -> Result<Box<dyn CaptureSource>> {
    let camera_id = match args.camera {
        Some(i) if i >= 0 => u32::try_from(i).context("camera index out of range")?,
        _ => config.camera_id,
    };
    let mut camera = vigil_eye::capture::CameraSource::new(camera_id);
    if let (Some(width), Some(height)) = (args.width, args.height) {
        camera = camera.with_resolution(width, height);
    }
    if let Some(fps) = args.fps {
        camera = camera.with_frame_rate(fps);
    }
    Ok(Box::new(camera))
}

#[cfg(not(feature = "camera"))]
fn camera_source(_args: &RunArgs, _config: &PipelineConfig) -> Result<Box<dyn CaptureSource>> {
    bail!("built without the camera feature; use --images <DIR> or --synthetic")
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = detector_config(&args.detectors)?;
    if let Some(n) = args.sample_every {
        config.sample_every_n_frames = n;
    }
    if let Some(ms) = args.timeout_ms {
        config.dispatch_timeout_ms = ms;
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let source = capture_source(&args, &config)?;
    let builder = Pipeline::builder(config)
        .with_standard_detectors(person_locator(&args.detectors)?)
        .with_audit_sink(audit_sink(args.audit_log.as_deref())?);
    info!(detectors = ?builder.detector_ids(), source = %source.describe(), "Starting pipeline");

    // opening a camera can block for seconds
    let handle: Arc<PipelineHandle> = Arc::new(
        tokio::task::spawn_blocking(move || builder.start(source))
            .await?
            .context("failed to start pipeline")?,
    );

    let server = args.status_addr.map(|addr| {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = status_server::serve(addr, handle).await {
                error!("Status endpoint failed: {}", e);
            }
        })
    });

    let mut waiter = tokio::task::spawn_blocking({
        let handle = handle.clone();
        move || handle.wait()
    });
    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    ticker.tick().await;
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    let exit = loop {
        tokio::select! {
            exit = &mut waiter => break exit?,
            result = &mut ctrl_c, if !stopping => {
                if let Err(e) = result {
                    warn!("Ctrl-C handler unavailable: {}", e);
                }
                info!("Shutdown signal received");
                stopping = true;
                handle.stop();
            }
            _ = ticker.tick() => log_status(&handle),
        }
    };

    if let Some(server) = server {
        server.abort();
    }
    log_status(&handle);
    info!(%exit, "Pipeline exited");

    match exit {
        ExitReason::Stopped | ExitReason::EndOfStream => Ok(()),
        other => bail!("pipeline ended abnormally: {}", other),
    }
}

fn log_status(handle: &PipelineHandle) {
    let stats = handle.stats();
    let alerts = handle.snapshot();
    let degraded: Vec<_> = handle
        .health()
        .into_iter()
        .filter(|(_, h)| h.degraded)
        .map(|(id, _)| id.to_string())
        .collect();

    info!(
        frames_captured = stats.frames_captured,
        dispatches = stats.dispatches,
        capture_fps = stats.capture_fps,
        mean_dispatch_ms = stats.mean_dispatch_ms.unwrap_or_default(),
        active_alerts = ?alerts.active_alerts(),
        degraded = ?degraded,
        "Status"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["vigil", "run"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Run(args) => args,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_camera_knobs_parse() {
        let args = run_args(&["--camera", "2", "--width", "1280", "--height", "720", "--fps", "15"]);
        assert_eq!(args.camera, Some(2));
        assert_eq!((args.width, args.height, args.fps), (Some(1280), Some(720), Some(15)));

        let args = run_args(&["--camera"]);
        assert_eq!(args.camera, Some(-1));
    }

    #[test]
    fn test_width_needs_height() {
        assert!(Cli::try_parse_from(["vigil", "run", "--width", "640"]).is_err());
    }

    #[test]
    fn test_sources_are_exclusive() {
        assert!(Cli::try_parse_from(["vigil", "run", "--images", "frames", "--synthetic"]).is_err());
        assert!(Cli::try_parse_from(["vigil", "run", "--camera", "--synthetic"]).is_err());
    }

    #[test]
    fn test_person_confidence_needs_model() {
        assert!(Cli::try_parse_from(["vigil", "run", "--person-confidence", "0.4"]).is_err());

        let args = run_args(&["--model", "yolov8n.onnx", "--person-confidence", "0.4"]);
        assert_eq!(args.detectors.person_confidence, Some(0.4));
    }

    #[test]
    fn test_disable_flags_switch_detectors_off() {
        let args = run_args(&["--disable", "crowd", "--disable", "fall"]);
        let config = detector_config(&args.detectors).unwrap();
        assert_eq!(config.detectors.enabled_count(), 1);

        let args = run_args(&["--disable", "smoke"]);
        assert!(detector_config(&args.detectors).is_err());
    }

    #[test]
    fn test_synthetic_feed_is_selected() {
        let args = run_args(&["--synthetic"]);
        let source = capture_source(&args, &PipelineConfig::default()).unwrap();
        assert_eq!(source.describe(), "synthetic (50 frames)");
    }
}
