//! Frame pipeline worker and the streaming-mode supervisor.
//!
//! One worker thread owns the acquisition resource and the detector handle
//! for the whole session. Every tick either emits the idle placeholder or
//! runs acquire → detect → annotate → heatmap → count → alert → encode and
//! publishes the result to the broadcast hub. Per-frame faults are counted
//! and contained inside the tick.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use actix_web::web::Bytes;
use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, trace, warn};
use video_ingest::{CaptureError, Frame, FrameSource, SourceFactory, UriSourceFactory};

use crate::crowd::{
    config::{CrowdConfig, PipelineSettings},
    control::{ControlPlane, CountersSnapshot, RunState},
    data::{Artifact, ArtifactKind, Fault},
    encoding,
    health::{HealthComponent, PipelineHealth},
    hub::BroadcastHub,
    notify::{AlertDispatcher, AlertNotice, LogAlertSink},
    processing::{self, DetectorWorker, FrameAnalyzer},
    server, telemetry,
};

const IDLE_CAPTION: &str = "STREAM IDLE";
const ENDED_CAPTION: &str = "STREAM ENDED";
const RECONNECT_INITIAL: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(5);

/// State shared between the pipeline worker and the HTTP handlers.
#[derive(Clone)]
pub(crate) struct SessionHandles {
    pub(crate) control: Arc<ControlPlane>,
    pub(crate) hub: Arc<BroadcastHub>,
    pub(crate) health: Arc<PipelineHealth>,
}

impl SessionHandles {
    pub(crate) fn new(initial: RunState) -> Self {
        Self {
            control: Arc::new(ControlPlane::new(initial)),
            hub: Arc::new(BroadcastHub::new()),
            health: Arc::new(PipelineHealth::new()),
        }
    }
}

#[derive(Debug)]
pub(crate) enum TickOutcome {
    /// Placeholder published; the source was not touched.
    Idle,
    /// Live artifact published.
    Processed { people: usize },
    /// Fault contained within the tick.
    Skipped(Fault),
    /// Live source unavailable; placeholder published while backing off.
    Waiting,
    /// Finite source exhausted; the hub is closed.
    Finished,
}

/// Exponential retry schedule for live sources.
struct Reconnect {
    delay: Duration,
    next_attempt: Option<Instant>,
}

impl Reconnect {
    fn new() -> Self {
        Self {
            delay: RECONNECT_INITIAL,
            next_attempt: None,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.next_attempt.is_none_or(|at| now >= at)
    }

    /// Schedule the next attempt and return the wait.
    fn failed(&mut self, now: Instant) -> Duration {
        let wait = self.delay;
        self.next_attempt = Some(now + wait);
        self.delay = (self.delay * 2).min(RECONNECT_MAX);
        wait
    }

    fn reset(&mut self) {
        self.delay = RECONNECT_INITIAL;
        self.next_attempt = None;
    }
}

pub(crate) struct FramePipeline {
    settings: PipelineSettings,
    shared: SessionHandles,
    detector: DetectorWorker,
    alerts: AlertDispatcher,
    factory: Box<dyn SourceFactory>,
    source: Option<Box<dyn FrameSource>>,
    analyzer: FrameAnalyzer,
    placeholder: Option<Bytes>,
    reconnect: Reconnect,
    was_running: bool,
    finished: bool,
}

impl FramePipeline {
    pub(crate) fn new(
        settings: PipelineSettings,
        shared: SessionHandles,
        detector: DetectorWorker,
        alerts: AlertDispatcher,
        factory: Box<dyn SourceFactory>,
    ) -> Self {
        Self {
            analyzer: FrameAnalyzer::new(&settings),
            settings,
            shared,
            detector,
            alerts,
            factory,
            source: None,
            placeholder: None,
            reconnect: Reconnect::new(),
            was_running: false,
            finished: false,
        }
    }

    /// Run one pipeline step.
    pub(crate) fn tick(&mut self) -> TickOutcome {
        self.shared.health.beat(HealthComponent::Pipeline);
        if self.finished {
            return TickOutcome::Finished;
        }

        if self.shared.control.run_state() == RunState::Idle {
            if self.was_running {
                info!("stream stopped; emitting placeholder");
                self.was_running = false;
            }
            self.publish_placeholder();
            return TickOutcome::Idle;
        }
        if !self.was_running {
            info!("stream started");
            self.was_running = true;
            self.shared.health.beat(HealthComponent::Capture);
        }

        if self.source.is_none() {
            let now = Instant::now();
            if !self.reconnect.ready(now) {
                self.publish_placeholder();
                return TickOutcome::Waiting;
            }
            match self.factory.open() {
                Ok(source) => {
                    info!(source = %self.factory.describe(), "acquisition resource opened");
                    self.source = Some(source);
                    self.reconnect.reset();
                }
                Err(err) => return self.acquisition_failed(err),
            }
        }

        let started = Instant::now();
        let read = match self.source.as_mut() {
            Some(source) => source.read_frame(),
            None => return TickOutcome::Waiting,
        };
        metrics::histogram!("crowd_stage_latency_seconds", "stage" => "capture")
            .record(started.elapsed().as_secs_f64());
        match read {
            Ok(frame) => {
                self.shared.health.beat(HealthComponent::Capture);
                self.process_frame(frame)
            }
            Err(err) => self.acquisition_failed(err),
        }
    }

    fn process_frame(&mut self, frame: Frame) -> TickOutcome {
        let counters = self.shared.control.counters();
        let frame_span = tracing::info_span!(
            "frame",
            frame = counters.snapshot().frames_processed + 1,
            width = frame.width,
            height = frame.height,
            timestamp = frame.timestamp_ms
        );
        let _frame_guard = frame_span.enter();

        let frame = Arc::new(frame);
        let detections = match self.detector.detect(frame.clone(), self.settings.detect_timeout) {
            Ok(detections) => detections,
            Err(err) => {
                counters.record_detection_fault();
                metrics::counter!("crowd_detection_faults_total").increment(1);
                warn!(error = %err, "detection failed; counting zero people for this frame");
                Vec::new()
            }
        };

        let analysis = match self
            .analyzer
            .analyze(&frame, detections, counters, Instant::now())
        {
            Ok(analysis) => analysis,
            Err(fault) => {
                counters.record_acquisition_fault();
                metrics::counter!("crowd_acquisition_faults_total").increment(1);
                warn!(error = %fault, "dropping malformed frame");
                return TickOutcome::Skipped(fault);
            }
        };

        if let Some(event) = analysis.alert {
            info!(
                count = event.count,
                consecutive = self.analyzer.consecutive_over(),
                "crowd threshold crossed"
            );
            self.alerts.dispatch(AlertNotice::for_event(
                &event,
                self.settings.alert.threshold,
                analysis.snapshot.frames_processed,
            ));
        }

        let jpeg = match encoding::encode_jpeg(&analysis.image, self.settings.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                counters.record_encoding_fault();
                metrics::counter!("crowd_encoding_faults_total").increment(1);
                warn!(error = %err, "JPEG encode failed; skipping publish");
                return TickOutcome::Skipped(Fault::Encoding(err));
            }
        };

        self.shared.hub.publish(Artifact::new(
            ArtifactKind::Live,
            jpeg,
            analysis.snapshot,
            frame.timestamp_ms,
        ));
        if analysis.snapshot.frames_processed % 30 == 0 {
            debug!(
                frame = analysis.snapshot.frames_processed,
                people = analysis.people,
                subscribers = self.shared.hub.subscriber_count(),
                "pipeline heartbeat"
            );
        }
        TickOutcome::Processed {
            people: analysis.people,
        }
    }

    fn acquisition_failed(&mut self, err: CaptureError) -> TickOutcome {
        self.source = None;
        let counters = self.shared.control.counters();

        if self.factory.kind().is_finite() {
            if err.is_end_of_stream() {
                info!("source exhausted; closing stream");
            } else {
                counters.record_acquisition_fault();
                metrics::counter!("crowd_acquisition_faults_total").increment(1);
                warn!(error = %err, "finite source failed; closing stream");
            }
            self.finish();
            return TickOutcome::Finished;
        }

        counters.record_acquisition_fault();
        metrics::counter!("crowd_acquisition_faults_total").increment(1);
        let retry_in_ms = self.reconnect.failed(Instant::now()).as_millis() as u64;
        warn!(
            error = %err,
            retry_in_ms,
            "live source unavailable; retrying"
        );
        self.publish_placeholder();
        TickOutcome::Skipped(Fault::Acquisition(err))
    }

    /// Publish the terminal frame and close the hub.
    fn finish(&mut self) {
        let image =
            encoding::caption_frame(self.settings.width, self.settings.height, ENDED_CAPTION);
        match encoding::encode_jpeg(&image, self.settings.jpeg_quality) {
            Ok(jpeg) => {
                self.shared.hub.publish(Artifact::new(
                    ArtifactKind::Terminal,
                    jpeg,
                    self.shared.control.snapshot(),
                    Utc::now().timestamp_millis(),
                ));
            }
            Err(err) => {
                self.shared.control.counters().record_encoding_fault();
                warn!(error = %err, "failed to encode terminal frame");
            }
        }
        self.shared.hub.close();
        self.finished = true;
    }

    fn publish_placeholder(&mut self) {
        let jpeg = match &self.placeholder {
            Some(jpeg) => jpeg.clone(),
            None => {
                let image = encoding::caption_frame(
                    self.settings.width,
                    self.settings.height,
                    IDLE_CAPTION,
                );
                match encoding::encode_jpeg(&image, self.settings.jpeg_quality) {
                    Ok(jpeg) => {
                        self.placeholder = Some(jpeg.clone());
                        jpeg
                    }
                    Err(err) => {
                        self.shared.control.counters().record_encoding_fault();
                        metrics::counter!("crowd_encoding_faults_total").increment(1);
                        warn!(error = %err, "failed to encode placeholder");
                        return;
                    }
                }
            }
        };
        let counters = CountersSnapshot {
            current_count: 0,
            ..self.shared.control.snapshot()
        };
        self.shared.hub.publish(Artifact::new(
            ArtifactKind::Placeholder,
            jpeg,
            counters,
            Utc::now().timestamp_millis(),
        ));
    }

    /// Drive ticks until `shutdown` is raised, then release the source and
    /// close the hub.
    pub(crate) fn run(mut self, shutdown: Arc<AtomicBool>) {
        let pipeline_span = tracing::info_span!(
            "crowd.pipeline",
            source = %self.factory.describe(),
            width = self.settings.width,
            height = self.settings.height,
            detector = %self.detector.description()
        );
        let _pipeline_guard = pipeline_span.enter();
        info!("pipeline worker started");

        let idle_interval = self.settings.idle_interval;
        while !shutdown.load(Ordering::Relaxed) {
            match self.tick() {
                TickOutcome::Processed { people } => trace!(people, "tick processed"),
                TickOutcome::Skipped(fault) => {
                    debug!(fault = fault.label(), "tick skipped");
                    if matches!(fault, Fault::Acquisition(_)) {
                        thread::sleep(idle_interval);
                    }
                }
                TickOutcome::Idle | TickOutcome::Waiting | TickOutcome::Finished => {
                    thread::sleep(idle_interval)
                }
            }
        }

        self.source.take();
        self.shared.hub.close();
        info!("pipeline worker stopped");
    }

    pub(crate) fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<thread::JoinHandle<()>> {
        telemetry::spawn_thread("crowd-pipeline", move || self.run(shutdown))
            .context("failed to spawn pipeline worker")
    }
}

/// Streaming mode: load the detector, start the pipeline worker and the HTTP
/// surface, then wait for Ctrl+C.
pub fn serve(config: CrowdConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let serve_span = tracing::info_span!(
        "crowd.serve",
        source = %config.source_uri,
        kind = config.source_kind.label(),
        bind = %config.bind
    );
    let _serve_guard = serve_span.enter();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    });

    let loader = processing::detector_loader(&config.detector)?;
    let detector = DetectorWorker::spawn(loader)?;
    let alerts = AlertDispatcher::spawn(Box::new(LogAlertSink))
        .context("failed to spawn alert dispatcher")?;

    let initial = if config.start_running {
        RunState::Running
    } else {
        RunState::Idle
    };
    let shared = SessionHandles::new(initial);
    let settings = config.pipeline.clone();
    let factory = UriSourceFactory::new(config.source_uri.clone(), (settings.width, settings.height))
        .with_backend(config.backend)
        .with_realtime_playback(true);
    let pipeline = FramePipeline::new(settings, shared.clone(), detector, alerts, Box::new(factory));

    let http = server::spawn_http_server(config.bind, shared.clone())
        .with_context(|| format!("failed to start HTTP server on {}", config.bind))?;
    let worker = pipeline.spawn(shutdown.clone())?;

    info!(
        "serving http://{}/video_feed (state: {:?}); press Ctrl+C to stop",
        http.local_addr(),
        shared.control.run_state()
    );
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    if worker.join().is_err() {
        warn!("pipeline worker panicked");
    }
    http.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use ml_core::{Detection, DetectionError, Detector};
    use video_ingest::SourceKind;

    use super::*;
    use crate::crowd::{
        config::AlertSettings,
        notify::AlertSink,
        processing::tests::{ScriptedDetector, loader_for},
    };

    #[derive(Default)]
    struct SourceProbe {
        opens: AtomicUsize,
        reads: AtomicUsize,
        drops: AtomicUsize,
    }

    /// Serves `frames` frames, then fails with `end`.
    struct ScriptedSource {
        remaining: usize,
        size: (u32, u32),
        end: fn() -> CaptureError,
        probe: Arc<SourceProbe>,
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            self.probe.reads.fetch_add(1, Ordering::SeqCst);
            if self.remaining == 0 {
                return Err((self.end)());
            }
            self.remaining -= 1;
            Ok(Frame::filled(self.size.0, self.size.1, 90, 0))
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.probe.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedFactory {
        kind: SourceKind,
        frames: usize,
        failing_opens: usize,
        size: (u32, u32),
        end: fn() -> CaptureError,
        probe: Arc<SourceProbe>,
    }

    impl ScriptedFactory {
        fn clip(frames: usize, size: (u32, u32), probe: Arc<SourceProbe>) -> Self {
            Self {
                kind: SourceKind::File,
                frames,
                failing_opens: 0,
                size,
                end: || CaptureError::EndOfStream,
                probe,
            }
        }

        fn camera(frames: usize, failing_opens: usize, size: (u32, u32), probe: Arc<SourceProbe>) -> Self {
            Self {
                kind: SourceKind::Rtsp,
                frames,
                failing_opens,
                size,
                end: || CaptureError::Read(std::io::Error::other("camera unplugged")),
                probe,
            }
        }
    }

    impl SourceFactory for ScriptedFactory {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn describe(&self) -> String {
            format!("scripted ({})", self.kind.label())
        }

        fn open(&mut self) -> Result<Box<dyn FrameSource>, CaptureError> {
            self.probe.opens.fetch_add(1, Ordering::SeqCst);
            if self.failing_opens > 0 {
                self.failing_opens -= 1;
                return Err(CaptureError::Open {
                    uri: "rtsp://scripted".to_string(),
                });
            }
            Ok(Box::new(ScriptedSource {
                remaining: self.frames,
                size: self.size,
                end: self.end,
                probe: self.probe.clone(),
            }))
        }
    }

    struct RecordingSink(Arc<Mutex<Vec<AlertNotice>>>);

    impl AlertSink for RecordingSink {
        fn notify(&mut self, notice: &AlertNotice) {
            self.0.lock().unwrap().push(notice.clone());
        }
    }

    struct BrokenDetector;

    impl Detector for BrokenDetector {
        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<Detection>, DetectionError> {
            Err(DetectionError::InvalidInput("bad tensor".into()))
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            width: 64,
            height: 48,
            idle_interval: Duration::from_millis(5),
            detect_timeout: Duration::from_secs(2),
            jpeg_quality: 70,
            alert: AlertSettings {
                threshold: 2,
                hysteresis: 1,
                cooldown: Duration::from_secs(10),
            },
            ..PipelineSettings::default()
        }
    }

    fn pipeline(
        shared: &SessionHandles,
        detector: impl Detector + 'static,
        factory: ScriptedFactory,
        notices: Arc<Mutex<Vec<AlertNotice>>>,
    ) -> FramePipeline {
        FramePipeline::new(
            settings(),
            shared.clone(),
            DetectorWorker::spawn(loader_for(detector)).unwrap(),
            AlertDispatcher::spawn(Box::new(RecordingSink(notices))).unwrap(),
            Box::new(factory),
        )
    }

    #[test]
    fn ten_frame_clip_counts_people_and_alerts_once() {
        let shared = SessionHandles::new(RunState::Running);
        let probe = Arc::new(SourceProbe::default());
        let notices = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = pipeline(
            &shared,
            ScriptedDetector::new([0, 0, 0, 3, 3, 3, 3, 0, 0, 0]),
            ScriptedFactory::clip(10, (64, 48), probe.clone()),
            notices.clone(),
        );

        let mut people = Vec::new();
        for _ in 0..10 {
            match pipeline.tick() {
                TickOutcome::Processed { people: n } => people.push(n),
                other => panic!("unexpected tick outcome {other:?}"),
            }
        }
        assert_eq!(people, vec![0, 0, 0, 3, 3, 3, 3, 0, 0, 0]);
        assert!(matches!(pipeline.tick(), TickOutcome::Finished));
        assert!(shared.hub.is_closed());

        shared.control.stop();
        assert_eq!(shared.control.run_state(), RunState::Idle);
        let snapshot = shared.control.snapshot();
        assert_eq!(snapshot.max_count_observed, 3);
        assert_eq!(snapshot.frames_processed, 10);
        assert_eq!(snapshot.total_people, 12);
        assert_eq!(snapshot.detection_faults, 0);

        drop(pipeline);
        let notices = notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert!((4..=7).contains(&notices[0].frame_number));
        assert_eq!(notices[0].count, 3);
        assert_eq!(probe.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_ticks_publish_placeholders_without_touching_source() {
        let shared = SessionHandles::new(RunState::Idle);
        let probe = Arc::new(SourceProbe::default());
        let mut pipeline = pipeline(
            &shared,
            ScriptedDetector::new([]),
            ScriptedFactory::clip(10, (64, 48), probe.clone()),
            Arc::new(Mutex::new(Vec::new())),
        );

        let mut last_sequence = 0;
        for _ in 0..5 {
            assert!(matches!(pipeline.tick(), TickOutcome::Idle));
            let artifact = shared.hub.latest().unwrap();
            assert_eq!(artifact.kind, ArtifactKind::Placeholder);
            assert!(artifact.sequence > last_sequence);
            last_sequence = artifact.sequence;
            assert_eq!(artifact.counters.current_count, 0);
            let decoded = image::load_from_memory(&artifact.jpeg).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (64, 48));
        }
        assert_eq!(probe.opens.load(Ordering::SeqCst), 0);
        assert_eq!(probe.reads.load(Ordering::SeqCst), 0);
        assert_eq!(shared.control.snapshot(), CountersSnapshot::default());
    }

    #[test]
    fn stop_keeps_source_open_and_start_resumes_it() {
        let shared = SessionHandles::new(RunState::Running);
        let probe = Arc::new(SourceProbe::default());
        let mut pipeline = pipeline(
            &shared,
            ScriptedDetector::new([1, 1, 1]),
            ScriptedFactory::camera(10, 0, (64, 48), probe.clone()),
            Arc::new(Mutex::new(Vec::new())),
        );

        assert!(matches!(pipeline.tick(), TickOutcome::Processed { people: 1 }));
        shared.control.stop();
        for _ in 0..3 {
            assert!(matches!(pipeline.tick(), TickOutcome::Idle));
        }
        assert_eq!(probe.reads.load(Ordering::SeqCst), 1);

        shared.control.start();
        assert!(matches!(pipeline.tick(), TickOutcome::Processed { .. }));
        assert_eq!(probe.opens.load(Ordering::SeqCst), 1);
        assert_eq!(shared.control.snapshot().frames_processed, 2);
    }

    #[test]
    fn live_source_failures_back_off_and_recover() {
        let shared = SessionHandles::new(RunState::Running);
        let probe = Arc::new(SourceProbe::default());
        let mut pipeline = pipeline(
            &shared,
            ScriptedDetector::new([]),
            ScriptedFactory::camera(2, 1, (64, 48), probe.clone()),
            Arc::new(Mutex::new(Vec::new())),
        );

        assert!(matches!(
            pipeline.tick(),
            TickOutcome::Skipped(Fault::Acquisition(CaptureError::Open { .. }))
        ));
        // Still inside the 250ms back-off window.
        assert!(matches!(pipeline.tick(), TickOutcome::Waiting));
        assert_eq!(probe.opens.load(Ordering::SeqCst), 1);
        assert_eq!(
            shared.hub.latest().unwrap().kind,
            ArtifactKind::Placeholder
        );

        thread::sleep(RECONNECT_INITIAL + Duration::from_millis(50));
        assert!(matches!(pipeline.tick(), TickOutcome::Processed { .. }));
        assert!(matches!(pipeline.tick(), TickOutcome::Processed { .. }));
        // Device drops out mid-stream; the session survives.
        assert!(matches!(
            pipeline.tick(),
            TickOutcome::Skipped(Fault::Acquisition(CaptureError::Read(_)))
        ));
        assert!(!shared.hub.is_closed());

        let snapshot = shared.control.snapshot();
        assert_eq!(snapshot.acquisition_faults, 2);
        assert_eq!(snapshot.frames_processed, 2);
    }

    #[test]
    fn detection_faults_degrade_to_zero_people() {
        let shared = SessionHandles::new(RunState::Running);
        let probe = Arc::new(SourceProbe::default());
        let mut pipeline = pipeline(
            &shared,
            BrokenDetector,
            ScriptedFactory::clip(3, (64, 48), probe),
            Arc::new(Mutex::new(Vec::new())),
        );

        for _ in 0..3 {
            assert!(matches!(pipeline.tick(), TickOutcome::Processed { people: 0 }));
            assert_eq!(shared.hub.latest().unwrap().kind, ArtifactKind::Live);
        }
        let snapshot = shared.control.snapshot();
        assert_eq!(snapshot.detection_faults, 3);
        assert_eq!(snapshot.frames_processed, 3);
    }

    #[tokio::test]
    async fn subscribers_observe_terminal_frame_then_close() {
        let shared = SessionHandles::new(RunState::Running);
        let probe = Arc::new(SourceProbe::default());
        let mut subscriber = shared.hub.subscribe();
        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let mut pipeline = pipeline(
                    &shared,
                    ScriptedDetector::new([1, 2]),
                    ScriptedFactory::clip(2, (64, 48), probe),
                    Arc::new(Mutex::new(Vec::new())),
                );
                while !matches!(pipeline.tick(), TickOutcome::Finished) {
                    std::thread::sleep(Duration::from_millis(30));
                }
            })
        };

        let mut kinds = VecDeque::new();
        let mut last = 0;
        while let Some(artifact) = subscriber.next().await {
            assert!(artifact.sequence > last);
            last = artifact.sequence;
            kinds.push_back(artifact.kind);
        }
        worker.join().unwrap();
        assert_eq!(kinds.back(), Some(&ArtifactKind::Terminal));
    }

    #[tokio::test]
    async fn shutdown_releases_source_and_closes_subscribers() {
        let shared = SessionHandles::new(RunState::Running);
        let probe = Arc::new(SourceProbe::default());
        let pipeline = pipeline(
            &shared,
            ScriptedDetector::new([1, 1]),
            ScriptedFactory::camera(usize::MAX, 0, (64, 48), probe.clone()),
            Arc::new(Mutex::new(Vec::new())),
        );
        let mut subscriber = shared.hub.subscribe();
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = pipeline.spawn(shutdown.clone()).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), subscriber.next())
            .await
            .unwrap();
        assert!(first.is_some());
        assert_eq!(probe.opens.load(Ordering::SeqCst), 1);
        assert_eq!(probe.drops.load(Ordering::SeqCst), 0);

        shutdown.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), async {
            while subscriber.next().await.is_some() {}
        })
        .await
        .unwrap();

        tokio::task::spawn_blocking(move || worker.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(probe.drops.load(Ordering::SeqCst), 1);
        assert_eq!(probe.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconnect_delay_doubles_up_to_cap() {
        let mut reconnect = Reconnect::new();
        let now = Instant::now();
        let waits: Vec<_> = (0..7).map(|_| reconnect.failed(now)).collect();
        assert_eq!(waits[0], Duration::from_millis(250));
        assert_eq!(waits[1], Duration::from_millis(500));
        assert_eq!(waits[5], RECONNECT_MAX);
        assert_eq!(waits[6], RECONNECT_MAX);
        assert!(!reconnect.ready(now));
        reconnect.reset();
        assert!(reconnect.ready(now));
    }
}
