//! Heartbeats written by the pipeline worker and read by `/ready`.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

pub(crate) const STALE_THRESHOLD_MS: u64 = 5_000;
pub(crate) const STARTUP_GRACE_MS: u64 = 10_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HealthComponent {
    /// The worker loop itself; beats on every tick, idle or not.
    Pipeline,
    /// Successful frame reads; only expected while running.
    Capture,
}

impl HealthComponent {
    pub(crate) fn label(self) -> &'static str {
        match self {
            HealthComponent::Pipeline => "pipeline",
            HealthComponent::Capture => "capture",
        }
    }
}

pub struct PipelineHealth {
    pipeline: AtomicU64,
    capture: AtomicU64,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::starting_at(current_millis())
    }

    fn starting_at(now: u64) -> Self {
        let grace_deadline = now.saturating_add(STARTUP_GRACE_MS);
        Self {
            pipeline: AtomicU64::new(grace_deadline),
            capture: AtomicU64::new(grace_deadline),
        }
    }

    pub(crate) fn beat(&self, component: HealthComponent) {
        self.beat_at(component, current_millis());
    }

    fn beat_at(&self, component: HealthComponent, now: u64) {
        match component {
            HealthComponent::Pipeline => self.pipeline.store(now, Ordering::Relaxed),
            HealthComponent::Capture => self.capture.store(now, Ordering::Relaxed),
        }
    }

    /// First component whose heartbeat is older than the stale threshold.
    /// Capture is only checked while the pipeline is running.
    pub(crate) fn stale_component(&self, now: u64, running: bool) -> Option<HealthComponent> {
        if now.saturating_sub(self.pipeline.load(Ordering::Relaxed)) > STALE_THRESHOLD_MS {
            return Some(HealthComponent::Pipeline);
        }
        if running && now.saturating_sub(self.capture.load(Ordering::Relaxed)) > STALE_THRESHOLD_MS
        {
            return Some(HealthComponent::Capture);
        }
        None
    }
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_health_is_covered_by_startup_grace() {
        let health = PipelineHealth::starting_at(1_000);
        assert_eq!(health.stale_component(1_000 + STARTUP_GRACE_MS, true), None);
        assert_eq!(
            health.stale_component(1_000 + STARTUP_GRACE_MS + STALE_THRESHOLD_MS + 1, false),
            Some(HealthComponent::Pipeline)
        );
    }

    #[test]
    fn capture_only_matters_while_running() {
        let health = PipelineHealth::starting_at(0);
        let late = STARTUP_GRACE_MS + STALE_THRESHOLD_MS + 100;
        health.beat_at(HealthComponent::Pipeline, late);

        assert_eq!(health.stale_component(late, false), None);
        assert_eq!(
            health.stale_component(late, true),
            Some(HealthComponent::Capture)
        );
        health.beat_at(HealthComponent::Capture, late);
        assert_eq!(health.stale_component(late, true), None);
    }
}
