//! Process-wide run toggle and published counters.
//!
//! The control plane is shared by the pipeline worker (writer) and the HTTP
//! handlers (readers, start/stop). Every field is an atomic so no lock is ever
//! held across detection, capture, or a network write.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
}

/// Counters written by the pipeline once per processed frame.
#[derive(Default)]
pub struct PipelineCounters {
    current_count: AtomicU64,
    max_count: AtomicU64,
    frames_processed: AtomicU64,
    total_people: AtomicU64,
    detection_faults: AtomicU64,
    encoding_faults: AtomicU64,
    acquisition_faults: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub current_count: u64,
    pub max_count_observed: u64,
    pub frames_processed: u64,
    pub total_people: u64,
    pub detection_faults: u64,
    pub encoding_faults: u64,
    pub acquisition_faults: u64,
}

impl PipelineCounters {
    /// Publish the person count of a processed frame.
    pub fn record_frame(&self, people: u64) {
        self.current_count.store(people, Ordering::Release);
        self.max_count.fetch_max(people, Ordering::AcqRel);
        self.total_people.fetch_add(people, Ordering::Relaxed);
        self.frames_processed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_detection_fault(&self) {
        self.detection_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encoding_fault(&self) {
        self.encoding_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquisition_fault(&self) {
        self.acquisition_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_count(&self) -> u64 {
        self.current_count.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            current_count: self.current_count.load(Ordering::Acquire),
            max_count_observed: self.max_count.load(Ordering::Acquire),
            frames_processed: self.frames_processed.load(Ordering::Acquire),
            total_people: self.total_people.load(Ordering::Relaxed),
            detection_faults: self.detection_faults.load(Ordering::Relaxed),
            encoding_faults: self.encoding_faults.load(Ordering::Relaxed),
            acquisition_faults: self.acquisition_faults.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct ControlPlane {
    running: AtomicBool,
    counters: PipelineCounters,
}

impl ControlPlane {
    pub fn new(initial: RunState) -> Self {
        Self {
            running: AtomicBool::new(initial == RunState::Running),
            counters: PipelineCounters::default(),
        }
    }

    /// Switch to `Running`. Returns `true` when the state actually changed.
    pub fn start(&self) -> bool {
        !self.running.swap(true, Ordering::AcqRel)
    }

    /// Switch to `Idle`. Returns `true` when the state actually changed.
    pub fn stop(&self) -> bool {
        self.running.swap(false, Ordering::AcqRel)
    }

    pub fn run_state(&self) -> RunState {
        if self.running.load(Ordering::Acquire) {
            RunState::Running
        } else {
            RunState::Idle
        }
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.counters
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }
}
