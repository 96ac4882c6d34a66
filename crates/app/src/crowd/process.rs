//! File-processing mode: read a finite source to the end and write an
//! annotated copy through the FFmpeg writer.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{info, warn};
use video_ingest::{
    CaptureError, Frame, FrameFormat, FrameSource, FfmpegWriter, SourceFactory, UriSourceFactory,
    probe_dimensions, probe_frame_rate,
};

use crate::crowd::{
    annotation,
    config::{PipelineSettings, ProcessConfig},
    control::PipelineCounters,
    data::ProcessSummary,
    notify::{AlertDispatcher, AlertNotice, LogAlertSink},
    processing::{self, DetectorWorker, FrameAnalyzer},
    telemetry,
};

/// Used when ffprobe cannot report the input's frame rate.
const FALLBACK_FPS: f64 = 20.0;

/// Destination of annotated frames.
pub(crate) trait VideoSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), CaptureError>;
}

impl VideoSink for FfmpegWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        FfmpegWriter::write_frame(self, frame)
    }
}

/// Annotate every frame of `config.input` into `config.output` and return the
/// run summary.
pub fn process(config: ProcessConfig) -> Result<ProcessSummary> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let process_span = tracing::info_span!(
        "crowd.process",
        input = %config.input.display(),
        output = %config.output.display()
    );
    let _process_guard = process_span.enter();

    let fps = match probe_frame_rate(&config.input) {
        Some(fps) if fps.is_finite() && fps > 0.0 => fps,
        _ => {
            warn!("could not probe frame rate; assuming {FALLBACK_FPS} fps");
            FALLBACK_FPS
        }
    };
    let mut settings = config.pipeline.clone();
    settings.heatmap = settings.heatmap.retimed(settings.fps, fps);
    settings.fps = fps;
    if config.native_size {
        adopt_native_size(&mut settings, probe_dimensions(&config.input));
    }
    let size = (settings.width, settings.height);

    let mut detector = DetectorWorker::spawn(processing::detector_loader(&config.detector)?)?;
    let alerts = AlertDispatcher::spawn(Box::new(LogAlertSink))
        .context("failed to spawn alert dispatcher")?;

    let mut factory = UriSourceFactory::new(config.input.to_string_lossy(), size)
        .with_backend(config.backend)
        .with_realtime_playback(false);
    let mut source = factory
        .open()
        .with_context(|| format!("failed to open {}", config.input.display()))?;
    let mut writer = FfmpegWriter::create(&config.output, size, fps)
        .with_context(|| format!("failed to create {}", config.output.display()))?;
    info!(fps, width = size.0, height = size.1, "processing video");

    let counters = PipelineCounters::default();
    annotate_stream(
        source.as_mut(),
        &mut detector,
        &alerts,
        &mut writer,
        &settings,
        &counters,
    )?;
    drop(source);

    let frames_written = writer.frames_written();
    let output = writer
        .finish()
        .with_context(|| format!("failed to finalise {}", config.output.display()))?;

    let snapshot = counters.snapshot();
    let summary = ProcessSummary {
        max_people: snapshot.max_count_observed,
        frames: snapshot.frames_processed,
        total_people: snapshot.total_people,
        output_file: output.display().to_string(),
    };
    info!(
        frames = summary.frames,
        frames_written,
        max_people = summary.max_people,
        detection_faults = snapshot.detection_faults,
        "processing complete"
    );
    Ok(summary)
}

/// Size the session to the input's own resolution so the output keeps its
/// aspect ratio.
fn adopt_native_size(settings: &mut PipelineSettings, probed: Option<(u32, u32)>) {
    match probed {
        Some((width, height)) => {
            settings.width = width;
            settings.height = height;
        }
        None => warn!(
            width = settings.width,
            height = settings.height,
            "could not probe input resolution; using the default size"
        ),
    }
}

/// Run every frame of `source` through detection and annotation and hand the
/// result to `sink`. Cooldowns and the FPS overlay follow video time, not
/// wall-clock time.
pub(crate) fn annotate_stream(
    source: &mut dyn FrameSource,
    detector: &mut DetectorWorker,
    alerts: &AlertDispatcher,
    sink: &mut dyn VideoSink,
    settings: &PipelineSettings,
    counters: &PipelineCounters,
) -> Result<()> {
    let mut analyzer = FrameAnalyzer::new(settings);
    let origin = Instant::now();
    let mut index: u64 = 0;

    loop {
        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(err) if err.is_end_of_stream() => break,
            Err(err) => {
                counters.record_acquisition_fault();
                warn!(error = %err, "read failed; stopping early");
                break;
            }
        };
        let video_time = origin + Duration::from_secs_f64(index as f64 / settings.fps);
        index += 1;

        let frame = Arc::new(frame);
        let detections = detector
            .detect(frame.clone(), settings.detect_timeout)
            .unwrap_or_else(|err| {
                counters.record_detection_fault();
                warn!(frame = index, error = %err, "detection failed; counting zero people");
                Vec::new()
            });

        let analysis = match analyzer.analyze(&frame, detections, counters, video_time) {
            Ok(analysis) => analysis,
            Err(fault) => {
                counters.record_acquisition_fault();
                warn!(frame = index, error = %fault, "skipping malformed frame");
                continue;
            }
        };

        if let Some(event) = analysis.alert {
            alerts.dispatch(AlertNotice::for_event(
                &event,
                settings.alert.threshold,
                analysis.snapshot.frames_processed,
            ));
        }

        let (width, height) = analysis.image.dimensions();
        let annotated = Frame {
            data: annotation::rgb_to_bgr(&analysis.image),
            width,
            height,
            timestamp_ms: frame.timestamp_ms,
            format: FrameFormat::Bgr8,
        };
        sink.write_frame(&annotated)
            .with_context(|| format!("failed to write frame {index}"))?;

        if index % 100 == 0 {
            info!(frame = index, people = analysis.people, "progress");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::crowd::{
        config::AlertSettings,
        notify::AlertSink,
        processing::tests::{ScriptedDetector, loader_for},
    };

    struct ClipSource {
        remaining: usize,
        size: (u32, u32),
    }

    impl ClipSource {
        fn new(remaining: usize) -> Self {
            Self {
                remaining,
                size: (64, 48),
            }
        }
    }

    impl FrameSource for ClipSource {
        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            if self.remaining == 0 {
                return Err(CaptureError::EndOfStream);
            }
            self.remaining -= 1;
            Ok(Frame::filled(self.size.0, self.size.1, 40, 0))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        frames: Vec<Frame>,
    }

    impl VideoSink for MemorySink {
        fn write_frame(&mut self, frame: &Frame) -> Result<(), CaptureError> {
            self.frames.push(frame.clone());
            Ok(())
        }
    }

    struct RecordingSink(Arc<Mutex<Vec<AlertNotice>>>);

    impl AlertSink for RecordingSink {
        fn notify(&mut self, notice: &AlertNotice) {
            self.0.lock().unwrap().push(notice.clone());
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            width: 64,
            height: 48,
            fps: 20.0,
            detect_timeout: Duration::from_secs(2),
            alert: AlertSettings {
                threshold: 2,
                hysteresis: 1,
                cooldown: Duration::from_secs(10),
            },
            ..PipelineSettings::default()
        }
    }

    #[test]
    fn clip_is_annotated_frame_by_frame() {
        let mut detector =
            DetectorWorker::spawn(loader_for(ScriptedDetector::new([0, 0, 0, 3, 3, 3, 3, 0, 0, 0])))
                .unwrap();
        let notices = Arc::new(Mutex::new(Vec::new()));
        let alerts = AlertDispatcher::spawn(Box::new(RecordingSink(notices.clone()))).unwrap();
        let counters = PipelineCounters::default();
        let mut sink = MemorySink::default();

        annotate_stream(
            &mut ClipSource::new(10),
            &mut detector,
            &alerts,
            &mut sink,
            &settings(),
            &counters,
        )
        .unwrap();
        drop(alerts);

        assert_eq!(sink.frames.len(), 10);
        assert!(sink.frames.iter().all(|f| f.dimensions() == (64, 48)));
        // Overlays are burned in.
        assert!(sink.frames[0].data.iter().any(|&b| b != 40));

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.max_count_observed, 3);
        assert_eq!(snapshot.frames_processed, 10);
        assert_eq!(snapshot.total_people, 12);

        let notices = notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].frame_number, 4);
    }

    struct BrokenSink;

    impl VideoSink for BrokenSink {
        fn write_frame(&mut self, _frame: &Frame) -> Result<(), CaptureError> {
            Err(CaptureError::Read(std::io::Error::other("broken pipe")))
        }
    }

    #[test]
    fn writer_failure_aborts_the_run() {
        let mut detector = DetectorWorker::spawn(loader_for(ScriptedDetector::new([1]))).unwrap();
        let alerts = AlertDispatcher::spawn(Box::new(LogAlertSink)).unwrap();
        let err = annotate_stream(
            &mut ClipSource::new(3),
            &mut detector,
            &alerts,
            &mut BrokenSink,
            &settings(),
            &PipelineCounters::default(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("failed to write frame 1"));
    }

    #[test]
    fn widescreen_input_keeps_its_resolution() {
        let mut settings = PipelineSettings {
            detect_timeout: Duration::from_secs(2),
            ..PipelineSettings::default()
        };
        adopt_native_size(&mut settings, Some((96, 54)));
        assert_eq!((settings.width, settings.height), (96, 54));

        let mut detector = DetectorWorker::spawn(loader_for(ScriptedDetector::new([1, 2]))).unwrap();
        let alerts = AlertDispatcher::spawn(Box::new(LogAlertSink)).unwrap();
        let mut sink = MemorySink::default();
        annotate_stream(
            &mut ClipSource {
                remaining: 2,
                size: (96, 54),
            },
            &mut detector,
            &alerts,
            &mut sink,
            &settings,
            &PipelineCounters::default(),
        )
        .unwrap();
        assert_eq!(sink.frames.len(), 2);
        assert!(sink.frames.iter().all(|f| f.dimensions() == (96, 54)));
    }

    #[test]
    fn unprobed_input_falls_back_to_configured_size() {
        let mut settings = PipelineSettings::default();
        adopt_native_size(&mut settings, None);
        assert_eq!((settings.width, settings.height), (640, 480));
    }

    #[test]
    fn retimed_decay_matches_direct_computation() {
        let heatmap = crate::crowd::config::HeatmapSettings::with_decay_seconds(3.0, 15.0);
        let retimed = heatmap.retimed(15.0, 30.0);
        let direct = crate::crowd::config::HeatmapSettings::with_decay_seconds(3.0, 30.0);
        assert!((retimed.decay_factor - direct.decay_factor).abs() < 1e-5);
    }
}
