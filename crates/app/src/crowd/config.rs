//! Configuration parsing for the crowd pipeline.
//!
//! CLI arguments are translated once into validated settings structs which the
//! pipeline stages use without re-parsing flags.

use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use video_ingest::{CaptureBackend, SourceKind};

/// Intensity below which a heatmap cell is treated as empty, relative to the
/// maximum intensity.
const NEGLIGIBLE_FRACTION: f32 = 0.01;

/// Largest accepted heatmap kernel radius, in cells.
const MAX_HEATMAP_RADIUS: u32 = 64;
/// Accepted placeholder emission rates while idle.
const IDLE_FPS_RANGE: std::ops::RangeInclusive<f64> = 0.1..=60.0;
const DEFAULT_SIZE: (u32, u32) = (640, 480);

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage of a streaming session.
pub struct CrowdConfig {
    /// Camera URI, device index or file path.
    pub source_uri: String,
    /// Transport inferred from the URI.
    pub source_kind: SourceKind,
    /// Decoder used to open the source.
    pub backend: CaptureBackend,
    /// Bind address for the HTTP surface.
    pub bind: SocketAddr,
    /// Start processing immediately instead of waiting for `/start_stream`.
    pub start_running: bool,
    pub detector: DetectorOptions,
    pub pipeline: PipelineSettings,
    pub telemetry: TelemetryOptions,
}

/// Configuration of a one-shot file processing run.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub backend: CaptureBackend,
    /// Keep the input's own resolution; no `--width`/`--height` was given.
    pub native_size: bool,
    pub detector: DetectorOptions,
    pub pipeline: PipelineSettings,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
pub struct DetectorOptions {
    /// TorchScript weights loaded by the detector worker.
    pub model_path: PathBuf,
    /// Minimum confidence for a detection to be kept.
    pub confidence: f32,
    /// Force CPU inference.
    pub use_cpu: bool,
}

#[derive(Clone, Debug)]
/// Per-tick behaviour of the frame pipeline.
pub struct PipelineSettings {
    /// Fixed session resolution; frames are scaled to it on capture.
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate of the source.
    pub fps: f64,
    /// Delay between placeholder emissions while idle or reconnecting.
    pub idle_interval: Duration,
    /// Upper bound on a single detector call.
    pub detect_timeout: Duration,
    pub jpeg_quality: u8,
    pub heatmap: HeatmapSettings,
    pub alert: AlertSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15.0,
            idle_interval: Duration::from_millis(200),
            detect_timeout: Duration::from_secs(1),
            jpeg_quality: 85,
            heatmap: HeatmapSettings::default(),
            alert: AlertSettings::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeatmapSettings {
    /// Pixels per heatmap cell along each axis.
    pub cell_size: u32,
    /// Gaussian kernel radius in cells.
    pub kernel_radius: u32,
    /// Per-tick multiplicative decay.
    pub decay_factor: f32,
    /// Peak contribution of one person at the kernel centre.
    pub hit_intensity: f32,
    pub max_intensity: f32,
    /// Overlay opacity used when rendering.
    pub alpha: f32,
}

impl HeatmapSettings {
    /// Settings whose decay brings a saturated cell to a negligible level
    /// after `decay_secs` of inactivity at `fps`.
    pub fn with_decay_seconds(decay_secs: f64, fps: f64) -> Self {
        Self {
            decay_factor: decay_factor_for(decay_secs, fps),
            ..Self::default()
        }
    }

    /// Same decay time expressed for a source running at `to_fps` instead
    /// of `from_fps`.
    pub fn retimed(self, from_fps: f64, to_fps: f64) -> Self {
        if !(from_fps > 0.0 && to_fps > 0.0) {
            return self;
        }
        Self {
            decay_factor: self.decay_factor.powf((from_fps / to_fps) as f32),
            ..self
        }
    }

    /// Values under this floor are cleared to zero.
    pub fn negligible(&self) -> f32 {
        self.max_intensity * NEGLIGIBLE_FRACTION
    }
}

impl Default for HeatmapSettings {
    fn default() -> Self {
        Self {
            cell_size: 8,
            kernel_radius: 3,
            decay_factor: decay_factor_for(3.0, 15.0),
            hit_intensity: 0.35,
            max_intensity: 1.0,
            alpha: 0.4,
        }
    }
}

/// `factor^(secs * fps) == NEGLIGIBLE_FRACTION`
pub(crate) fn decay_factor_for(decay_secs: f64, fps: f64) -> f32 {
    let ticks = (decay_secs * fps).max(1.0);
    (NEGLIGIBLE_FRACTION as f64).powf(1.0 / ticks) as f32
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlertSettings {
    pub threshold: usize,
    pub hysteresis: usize,
    pub cooldown: Duration,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            threshold: 4,
            hysteresis: 1,
            cooldown: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing output.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// Frame decoder selectable on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// `ffmpeg` subprocess.
    Ffmpeg,
    /// Native OpenCV capture; needs the `opencv` feature.
    Opencv,
}

impl BackendArg {
    fn resolve(self) -> Result<CaptureBackend> {
        match self {
            BackendArg::Ffmpeg => Ok(CaptureBackend::Ffmpeg),
            #[cfg(feature = "opencv")]
            BackendArg::Opencv => Ok(CaptureBackend::OpenCv),
            #[cfg(not(feature = "opencv"))]
            BackendArg::Opencv => {
                bail!("--backend opencv needs crowdwatch built with the `opencv` feature")
            }
        }
    }
}

/// Options shared by the `serve` and `process` subcommands.
#[derive(Debug, Args)]
pub struct SharedArgs {
    /// TorchScript model path.
    #[arg(long = "model", value_name = "PATH", default_value = "models/yolov8n.torchscript")]
    pub model_path: PathBuf,
    /// Frame decoder.
    #[arg(long, value_enum, default_value_t = BackendArg::Ffmpeg)]
    pub backend: BackendArg,
    /// Session width in pixels [default: 640, or the input's width in `process`].
    #[arg(long, value_name = "PX", requires = "height")]
    pub width: Option<u32>,
    /// Session height in pixels [default: 480, or the input's height in `process`].
    #[arg(long, value_name = "PX", requires = "width")]
    pub height: Option<u32>,
    /// Crowd alert threshold (people in frame).
    #[arg(long, value_name = "N")]
    pub threshold: Option<usize>,
    /// Count margin below the threshold that clears an alert episode.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub hysteresis: usize,
    /// Minimum seconds between two alerts.
    #[arg(long = "cooldown-secs", value_name = "SECS", default_value_t = 10)]
    pub cooldown_secs: u64,
    /// Detector confidence floor (0-1).
    #[arg(long, value_name = "SCORE", default_value_t = 0.25)]
    pub confidence: f32,
    /// Detector timeout per frame.
    #[arg(long = "detect-timeout-ms", value_name = "MS", default_value_t = 1000)]
    pub detect_timeout_ms: u64,
    /// Seconds until an unvisited heatmap cell fades out.
    #[arg(long = "heatmap-decay-secs", value_name = "SECS", default_value_t = 3.0)]
    pub heatmap_decay_secs: f64,
    /// Heatmap cell size in pixels.
    #[arg(long = "heatmap-cell", value_name = "PX", default_value_t = 8)]
    pub heatmap_cell: u32,
    /// Heatmap kernel radius in cells.
    #[arg(long = "heatmap-radius", value_name = "CELLS", default_value_t = 3)]
    pub heatmap_radius: u32,
    /// Heatmap overlay opacity (0-1).
    #[arg(long = "heatmap-alpha", value_name = "ALPHA", default_value_t = 0.4)]
    pub heatmap_alpha: f32,
    /// Nominal source frame rate.
    #[arg(long, value_name = "FPS", default_value_t = 15.0)]
    pub fps: f64,
    /// Placeholder emission rate while idle.
    #[arg(long = "idle-fps", value_name = "FPS", default_value_t = 5.0)]
    pub idle_fps: f64,
    /// JPEG quality used by the encoder (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Camera URI, device index or video file.
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,
    /// Source flag (overrides positional).
    #[arg(long = "source", value_name = "URI")]
    pub source_flag: Option<String>,
    /// HTTP listen address.
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:5000")]
    pub bind: String,
    /// Begin processing without waiting for `/start_stream`.
    #[arg(long = "start-running", action = clap::ArgAction::SetTrue)]
    pub start_running: bool,
    #[command(flatten)]
    pub shared: SharedArgs,
}

/// CLI arguments accepted by the `process` subcommand.
#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Video file to analyse.
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,
    /// Annotated output video.
    #[arg(long, short, value_name = "PATH", default_value = "output_video.mp4")]
    pub output: PathBuf,
    #[command(flatten)]
    pub shared: SharedArgs,
}

const SERVE_DEFAULT_THRESHOLD: usize = 4;
const PROCESS_DEFAULT_THRESHOLD: usize = 2;

impl TryFrom<ServeArgs> for CrowdConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        let source_uri = args
            .source_flag
            .or(args.source)
            .unwrap_or_else(|| "0".to_string());
        let bind: SocketAddr = args
            .bind
            .parse()
            .with_context(|| format!("--bind must be a socket address, got {:?}", args.bind))?;
        let backend = args.shared.backend.resolve()?;
        let (detector, pipeline, telemetry) = args.shared.validate(SERVE_DEFAULT_THRESHOLD)?;
        let source_kind = SourceKind::from_uri(&source_uri);

        Ok(Self {
            source_uri,
            source_kind,
            backend,
            bind,
            start_running: args.start_running,
            detector,
            pipeline,
            telemetry,
        })
    }
}

impl TryFrom<ProcessArgs> for ProcessConfig {
    type Error = anyhow::Error;

    fn try_from(args: ProcessArgs) -> Result<Self> {
        if !args.input.is_file() {
            bail!("input video {} does not exist", args.input.display());
        }
        if args.input == args.output {
            bail!("--output must differ from the input file");
        }
        let backend = args.shared.backend.resolve()?;
        let native_size = args.shared.width.is_none();
        let (detector, pipeline, telemetry) = args.shared.validate(PROCESS_DEFAULT_THRESHOLD)?;
        Ok(Self {
            input: args.input,
            output: args.output,
            backend,
            native_size,
            detector,
            pipeline,
            telemetry,
        })
    }
}

impl SharedArgs {
    fn validate(
        self,
        default_threshold: usize,
    ) -> Result<(DetectorOptions, PipelineSettings, TelemetryOptions)> {
        let (width, height) = self.width.zip(self.height).unwrap_or(DEFAULT_SIZE);
        if width == 0 || height == 0 {
            bail!("--width and --height must be positive integers");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            bail!("--confidence must be between 0 and 1");
        }
        if !(self.fps > 0.0) {
            bail!("--fps must be positive");
        }
        if !IDLE_FPS_RANGE.contains(&self.idle_fps) {
            bail!(
                "--idle-fps must be between {} and {}",
                IDLE_FPS_RANGE.start(),
                IDLE_FPS_RANGE.end()
            );
        }
        if !(self.heatmap_decay_secs > 0.0) {
            bail!("--heatmap-decay-secs must be positive");
        }
        if self.heatmap_cell == 0 {
            bail!("--heatmap-cell must be at least 1");
        }
        if self.heatmap_radius > MAX_HEATMAP_RADIUS {
            bail!("--heatmap-radius must be at most {MAX_HEATMAP_RADIUS}");
        }
        if !(0.0..=1.0).contains(&self.heatmap_alpha) {
            bail!("--heatmap-alpha must be between 0 and 1");
        }
        if self.detect_timeout_ms == 0 {
            bail!("--detect-timeout-ms must be at least 1");
        }
        let threshold = self.threshold.unwrap_or(default_threshold);
        if threshold == 0 {
            bail!("--threshold must be at least 1");
        }
        if self.hysteresis >= threshold {
            bail!("--hysteresis ({}) must be below the alert threshold ({threshold})", self.hysteresis);
        }

        let heatmap = HeatmapSettings {
            cell_size: self.heatmap_cell,
            kernel_radius: self.heatmap_radius,
            alpha: self.heatmap_alpha,
            ..HeatmapSettings::with_decay_seconds(self.heatmap_decay_secs, self.fps)
        };
        let alert = AlertSettings {
            threshold,
            hysteresis: self.hysteresis,
            cooldown: Duration::from_secs(self.cooldown_secs),
        };
        let pipeline = PipelineSettings {
            width,
            height,
            fps: self.fps,
            idle_interval: Duration::from_secs_f64(1.0 / self.idle_fps),
            detect_timeout: Duration::from_millis(self.detect_timeout_ms),
            jpeg_quality: self.jpeg_quality,
            heatmap,
            alert,
        };
        let detector = DetectorOptions {
            model_path: self.model_path,
            confidence: self.confidence,
            use_cpu: self.use_cpu,
        };
        let telemetry = TelemetryOptions {
            chrome_trace_path: self.chrome_trace,
        };
        Ok((detector, pipeline, telemetry))
    }
}
