//! Detector worker thread and the per-frame analysis stages.
//!
//! The detector lives on its own thread so a slow or hung inference call can
//! be abandoned by the pipeline after `detect_timeout`. At most one request is
//! in flight; late replies are matched by id and discarded.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use image::RgbImage;
use ml_core::{Detection, DetectionError, Detector};
use tracing::{debug, info, warn};
use video_ingest::{CaptureError, Frame};

use crate::crowd::{
    alert::{AlertEngine, AlertEvent},
    annotation,
    config::{DetectorOptions, PipelineSettings},
    control::{CountersSnapshot, PipelineCounters},
    data::{Fault, PersonPosition},
    heatmap::HeatmapAccumulator,
    telemetry,
};

/// Builds the detector on the worker thread.
pub(crate) type DetectorLoader =
    Box<dyn FnOnce() -> anyhow::Result<Box<dyn Detector>> + Send + 'static>;

struct DetectRequest {
    id: u64,
    frame: Arc<Frame>,
}

struct DetectReply {
    id: u64,
    result: Result<Vec<Detection>, DetectionError>,
}

pub(crate) struct DetectorWorker {
    request_tx: Option<Sender<DetectRequest>>,
    reply_rx: Receiver<DetectReply>,
    next_id: u64,
    pending: Option<u64>,
    description: String,
    worker: Option<thread::JoinHandle<()>>,
}

impl DetectorWorker {
    /// Start the worker and wait for the detector to load. A load failure is
    /// returned here, before any frame is processed.
    pub(crate) fn spawn(loader: DetectorLoader) -> Result<Self> {
        let (request_tx, request_rx) = bounded::<DetectRequest>(1);
        let (reply_tx, reply_rx) = bounded::<DetectReply>(1);
        let (init_tx, init_rx) = bounded::<std::result::Result<String, String>>(1);

        let worker = telemetry::spawn_thread("crowd-detector", move || {
            let mut detector = match loader() {
                Ok(detector) => {
                    if init_tx.send(Ok(detector.describe())).is_err() {
                        return;
                    }
                    detector
                }
                Err(err) => {
                    let _ = init_tx.send(Err(format!("{err:#}")));
                    return;
                }
            };
            drop(init_tx);

            for request in request_rx {
                let started = Instant::now();
                let frame = &request.frame;
                let result = detector.detect(&frame.data, frame.width, frame.height);
                metrics::histogram!("crowd_stage_latency_seconds", "stage" => "detection")
                    .record(started.elapsed().as_secs_f64());
                let reply = DetectReply {
                    id: request.id,
                    result,
                };
                if reply_tx.send(reply).is_err() {
                    break;
                }
            }
            debug!("detector worker stopped");
        })?;

        let description = match init_rx.recv() {
            Ok(Ok(description)) => description,
            Ok(Err(message)) => {
                let _ = worker.join();
                bail!("detector initialisation failed: {message}");
            }
            Err(_) => {
                let _ = worker.join();
                bail!("detector worker exited during initialisation");
            }
        };
        info!(detector = %description, "detector ready");

        Ok(Self {
            request_tx: Some(request_tx),
            reply_rx,
            next_id: 0,
            pending: None,
            description,
            worker: Some(worker),
        })
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    /// Run detection on `frame`, waiting at most `timeout`.
    pub(crate) fn detect(
        &mut self,
        frame: Arc<Frame>,
        timeout: Duration,
    ) -> Result<Vec<Detection>, DetectionError> {
        while let Ok(late) = self.reply_rx.try_recv() {
            if self.pending == Some(late.id) {
                debug!(request = late.id, "discarding late detector reply");
                self.pending = None;
            }
        }
        if self.pending.is_some() {
            return Err(DetectionError::Busy);
        }

        let tx = self.request_tx.as_ref().ok_or(DetectionError::Unavailable)?;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        match tx.try_send(DetectRequest { id, frame }) {
            Ok(()) => self.pending = Some(id),
            Err(TrySendError::Full(_)) => return Err(DetectionError::Busy),
            Err(TrySendError::Disconnected(_)) => return Err(DetectionError::Unavailable),
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.reply_rx.recv_timeout(remaining) {
                Ok(reply) if reply.id == id => {
                    self.pending = None;
                    return reply.result;
                }
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return Err(DetectionError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    self.pending = None;
                    return Err(DetectionError::Unavailable);
                }
            }
        }
    }
}

impl Drop for DetectorWorker {
    fn drop(&mut self) {
        self.request_tx.take();
        let Some(worker) = self.worker.take() else {
            return;
        };
        if let Some(request) = self.pending {
            // The detector may be hung; the thread exits once the call returns.
            warn!(request, "detector still busy; detaching worker thread");
            drop(worker);
        } else {
            let _ = worker.join();
        }
    }
}

/// Resolve the detector backend for `opts`. A missing model file fails here
/// so the process never starts serving without a detector.
pub(crate) fn detector_loader(opts: &DetectorOptions) -> Result<DetectorLoader> {
    if !opts.model_path.is_file() {
        bail!(
            "detector model {} not found; pass --model <path>",
            opts.model_path.display()
        );
    }
    debug!(
        model = %opts.model_path.display(),
        confidence = opts.confidence,
        cpu = opts.use_cpu,
        "resolving detector backend"
    );
    build_loader(opts)
}

#[cfg(feature = "with-tch")]
fn build_loader(opts: &DetectorOptions) -> Result<DetectorLoader> {
    use ml_core::{YoloDetector, tch::Device};

    const MODEL_INPUT: (i64, i64) = (640, 640);

    let path = opts.model_path.clone();
    let confidence = opts.confidence;
    let use_cpu = opts.use_cpu;
    Ok(Box::new(move || -> anyhow::Result<Box<dyn Detector>> {
        let device = if use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available()
        };
        let detector = YoloDetector::new(&path, device, MODEL_INPUT)?
            .with_confidence_threshold(confidence);
        Ok(Box::new(detector) as Box<dyn Detector>)
    }))
}

#[cfg(not(feature = "with-tch"))]
fn build_loader(opts: &DetectorOptions) -> Result<DetectorLoader> {
    bail!(
        "cannot load {}: crowdwatch was built without the `with-tch` feature",
        opts.model_path.display()
    )
}

/// Output of one analysed frame.
pub(crate) struct Analysis {
    pub(crate) image: RgbImage,
    pub(crate) people: usize,
    pub(crate) snapshot: CountersSnapshot,
    pub(crate) alert: Option<AlertEvent>,
}

/// Per-session stateful stages: person filter, annotation, heatmap and
/// alerting. Streaming and file processing each own one, so heatmap and
/// alert state never outlive their session.
pub(crate) struct FrameAnalyzer {
    heatmap: HeatmapAccumulator,
    alerts: AlertEngine,
    /// Smoothed rate of analysed frames, seeded with the nominal rate.
    fps: f32,
    last_frame: Option<Instant>,
}

impl FrameAnalyzer {
    pub(crate) fn new(settings: &PipelineSettings) -> Self {
        Self {
            heatmap: HeatmapAccumulator::new(settings.heatmap, (settings.width, settings.height)),
            alerts: AlertEngine::new(settings.alert),
            fps: settings.fps as f32,
            last_frame: None,
        }
    }

    /// Annotate `frame` with `detections`, update `counters` and evaluate the
    /// alert engine. Fails only when the frame buffer is malformed.
    pub(crate) fn analyze(
        &mut self,
        frame: &Frame,
        detections: Vec<Detection>,
        counters: &PipelineCounters,
        now: Instant,
    ) -> Result<Analysis, Fault> {
        let mut image = annotation::frame_to_rgb(frame).ok_or(CaptureError::FrameSize {
            expected: Frame::byte_len(frame.width, frame.height),
            actual: frame.data.len(),
        })?;

        let persons: Vec<Detection> = detections.into_iter().filter(Detection::is_person).collect();
        let positions: Vec<PersonPosition> = persons.iter().map(PersonPosition::from).collect();
        annotation::draw_detections(&mut image, &persons);

        let started = Instant::now();
        self.heatmap.accumulate(&positions, frame.dimensions());
        self.heatmap.render(&mut image);
        metrics::histogram!("crowd_stage_latency_seconds", "stage" => "heatmap")
            .record(started.elapsed().as_secs_f64());

        let people = persons.len();
        counters.record_frame(people as u64);
        let snapshot = counters.snapshot();
        metrics::gauge!("crowd_people_current").set(people as f64);
        metrics::counter!("crowd_frames_processed_total").increment(1);

        let alert = self.alerts.evaluate(people, now);
        self.update_fps(now);

        annotation::draw_counts(&mut image, snapshot.current_count, snapshot.max_count_observed);
        annotation::draw_footer(&mut image, snapshot.frames_processed, self.fps);

        Ok(Analysis {
            image,
            people,
            snapshot,
            alert,
        })
    }

    pub(crate) fn consecutive_over(&self) -> u32 {
        self.alerts.consecutive_over()
    }

    fn update_fps(&mut self, now: Instant) {
        if let Some(previous) = self.last_frame {
            let elapsed = now.saturating_duration_since(previous).as_secs_f32();
            if elapsed > 0.0 {
                self.fps = 0.9 * self.fps + 0.1 / elapsed;
            }
        }
        self.last_frame = Some(now);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Replays a fixed number of people per call, laid out on a grid.
    pub(crate) struct ScriptedDetector {
        pub(crate) script: VecDeque<usize>,
    }

    impl ScriptedDetector {
        pub(crate) fn new(script: impl IntoIterator<Item = usize>) -> Self {
            Self {
                script: script.into_iter().collect(),
            }
        }
    }

    impl Detector for ScriptedDetector {
        fn detect(
            &mut self,
            _bgr: &[u8],
            width: u32,
            height: u32,
        ) -> Result<Vec<Detection>, DetectionError> {
            let people = self.script.pop_front().unwrap_or(0);
            let mut detections: Vec<Detection> = (0..people)
                .map(|i| {
                    let x = (i as f32 * 12.0) % (width as f32 - 10.0);
                    let y = (height as f32 / 2.0).min(height as f32 - 10.0);
                    Detection::new(0, [x, y - 5.0, x + 8.0, y + 5.0], 0.8)
                })
                .collect();
            // Non-person detections must never be counted.
            detections.push(Detection::new(2, [0.0, 0.0, 4.0, 4.0], 0.9));
            Ok(detections)
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    struct SleepyDetector(Duration);

    impl Detector for SleepyDetector {
        fn detect(
            &mut self,
            _bgr: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<Detection>, DetectionError> {
            thread::sleep(self.0);
            Ok(vec![Detection::new(0, [1.0, 1.0, 5.0, 5.0], 0.9)])
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn detect(
            &mut self,
            _bgr: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<Detection>, DetectionError> {
            Err(DetectionError::Inference(anyhow::anyhow!("cuda exploded")))
        }
    }

    pub(crate) fn loader_for(detector: impl Detector + 'static) -> DetectorLoader {
        Box::new(move || Ok(Box::new(detector) as Box<dyn Detector>))
    }

    fn frame() -> Arc<Frame> {
        Arc::new(Frame::filled(64, 48, 0, 0))
    }

    #[test]
    fn worker_reports_detector_load_failure() {
        let result = DetectorWorker::spawn(Box::new(|| -> anyhow::Result<Box<dyn Detector>> {
            anyhow::bail!("weights corrupted")
        }));
        let err = result.err().unwrap();
        assert!(format!("{err:#}").contains("weights corrupted"));
    }

    #[test]
    fn worker_returns_detections() {
        let mut worker = DetectorWorker::spawn(loader_for(ScriptedDetector::new([2]))).unwrap();
        assert_eq!(worker.description(), "scripted");
        let detections = worker.detect(frame(), Duration::from_secs(2)).unwrap();
        assert_eq!(detections.iter().filter(|d| d.is_person()).count(), 2);
    }

    #[test]
    fn slow_detector_times_out_then_reports_busy_then_recovers() {
        let mut worker =
            DetectorWorker::spawn(loader_for(SleepyDetector(Duration::from_millis(300)))).unwrap();

        let err = worker.detect(frame(), Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DetectionError::Timeout(_)));

        let err = worker.detect(frame(), Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DetectionError::Busy));

        thread::sleep(Duration::from_millis(400));
        let detections = worker.detect(frame(), Duration::from_secs(2)).unwrap();
        assert_eq!(detections.len(), 1);
    }

    #[test]
    fn dropping_a_worker_with_a_hung_request_does_not_wait_for_it() {
        let mut worker =
            DetectorWorker::spawn(loader_for(SleepyDetector(Duration::from_secs(3)))).unwrap();
        let err = worker.detect(frame(), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, DetectionError::Timeout(_)));

        let started = Instant::now();
        drop(worker);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn inference_errors_are_passed_through() {
        let mut worker = DetectorWorker::spawn(loader_for(FailingDetector)).unwrap();
        let err = worker.detect(frame(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, DetectionError::Inference(_)));
        // The worker keeps serving after a failed frame.
        assert!(worker.detect(frame(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn missing_model_is_rejected_before_spawning() {
        let opts = DetectorOptions {
            model_path: "does/not/exist.torchscript".into(),
            confidence: 0.25,
            use_cpu: true,
        };
        let err = detector_loader(&opts).err().unwrap();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn analyzer_counts_only_people_and_updates_counters() {
        let settings = PipelineSettings {
            width: 64,
            height: 48,
            ..PipelineSettings::default()
        };
        let mut analyzer = FrameAnalyzer::new(&settings);
        let counters = PipelineCounters::default();
        let frame = Frame::filled(64, 48, 30, 0);
        let mut detector = ScriptedDetector::new([3, 1]);

        let now = Instant::now();
        let first = analyzer
            .analyze(&frame, detector.detect(&frame.data, 64, 48).unwrap(), &counters, now)
            .unwrap();
        assert_eq!(first.people, 3);
        assert_eq!(first.image.dimensions(), (64, 48));
        let second = analyzer
            .analyze(&frame, detector.detect(&frame.data, 64, 48).unwrap(), &counters, now)
            .unwrap();
        assert_eq!(second.people, 1);
        assert_eq!(second.snapshot.max_count_observed, 3);
        assert_eq!(second.snapshot.frames_processed, 2);
        assert_eq!(second.snapshot.total_people, 4);
    }

    #[test]
    fn analyzer_rejects_truncated_frames() {
        let mut analyzer = FrameAnalyzer::new(&PipelineSettings::default());
        let mut frame = Frame::filled(64, 48, 0, 0);
        frame.data.truncate(10);
        let counters = PipelineCounters::default();
        let err = analyzer
            .analyze(&frame, Vec::new(), &counters, Instant::now())
            .err()
            .unwrap();
        assert_eq!(err.label(), "acquisition");
        assert_eq!(counters.snapshot().frames_processed, 0);
    }
}
