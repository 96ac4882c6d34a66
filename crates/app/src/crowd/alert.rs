//! Crowd alert state machine.
//!
//! `Normal` raises on the first frame at or above the threshold once the
//! cooldown since the last alert has elapsed. The episode only ends after the
//! count falls below `threshold - hysteresis` (`Cooling`), and a new episode
//! cannot start until the cooldown expires (`Cooling -> Normal`).

use std::time::{Duration, Instant};

use crate::crowd::config::AlertSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AlertPhase {
    Normal,
    Elevated,
    Cooling,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// A raised alert. Clearing an episode is silent.
pub(crate) struct AlertEvent {
    pub(crate) count: usize,
    pub(crate) at: Instant,
}

pub(crate) struct AlertEngine {
    threshold: usize,
    hysteresis_band: usize,
    cooldown: Duration,
    phase: AlertPhase,
    consecutive_over: u32,
    last_alert: Option<Instant>,
}

impl AlertEngine {
    pub(crate) fn new(settings: AlertSettings) -> Self {
        Self {
            threshold: settings.threshold.max(1),
            hysteresis_band: settings.hysteresis,
            cooldown: settings.cooldown,
            phase: AlertPhase::Normal,
            consecutive_over: 0,
            last_alert: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> AlertPhase {
        self.phase
    }

    /// Frames in a row at or above the threshold.
    pub(crate) fn consecutive_over(&self) -> u32 {
        self.consecutive_over
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_alert
            .is_none_or(|last| now.saturating_duration_since(last) >= self.cooldown)
    }

    fn clear_level(&self) -> usize {
        self.threshold.saturating_sub(self.hysteresis_band)
    }

    /// Feed the count of one frame. Returns an event only on a raise.
    pub(crate) fn evaluate(&mut self, count: usize, now: Instant) -> Option<AlertEvent> {
        let over = count >= self.threshold;
        self.consecutive_over = if over {
            self.consecutive_over.saturating_add(1)
        } else {
            0
        };

        if self.phase == AlertPhase::Cooling && self.cooldown_elapsed(now) {
            self.phase = AlertPhase::Normal;
        }

        match self.phase {
            AlertPhase::Normal => {
                if over && self.cooldown_elapsed(now) {
                    self.phase = AlertPhase::Elevated;
                    self.last_alert = Some(now);
                    return Some(AlertEvent {
                        count,
                        at: now,
                    });
                }
            }
            AlertPhase::Elevated => {
                if count < self.clear_level() {
                    self.phase = if self.cooldown_elapsed(now) {
                        AlertPhase::Normal
                    } else {
                        AlertPhase::Cooling
                    };
                }
            }
            AlertPhase::Cooling => {
                if over {
                    // Same episode resumed inside the cooldown window.
                    self.phase = AlertPhase::Elevated;
                }
            }
        }
        None
    }
}
