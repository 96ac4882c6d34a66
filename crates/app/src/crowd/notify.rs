//! Fire-and-forget delivery of crowd alerts.
//!
//! The pipeline hands notices to a bounded queue drained by a dedicated
//! thread; a full queue drops the notice instead of blocking the tick.

use std::{thread, time::Duration};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde::Serialize;
use tracing::{debug, warn};

use crate::crowd::{alert::AlertEvent, telemetry};

const ALERT_QUEUE_CAPACITY: usize = 16;
/// How long dropping the dispatcher waits for queued notices to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct AlertNotice {
    pub(crate) count: usize,
    pub(crate) threshold: usize,
    pub(crate) frame_number: u64,
    pub(crate) timestamp: DateTime<Utc>,
}

impl AlertNotice {
    /// Notice for `event`, stamped with the wall-clock time it was raised.
    pub(crate) fn for_event(event: &AlertEvent, threshold: usize, frame_number: u64) -> Self {
        let age = chrono::Duration::from_std(event.at.elapsed()).unwrap_or_default();
        Self {
            count: event.count,
            threshold,
            frame_number,
            timestamp: Utc::now() - age,
        }
    }
}

/// Receiver of raised alerts. Runs on the dispatcher thread, so a slow sink
/// only delays other notices.
pub(crate) trait AlertSink: Send {
    fn notify(&mut self, notice: &AlertNotice);
}

/// Default sink: a structured warning in the log.
pub(crate) struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&mut self, notice: &AlertNotice) {
        warn!(
            count = notice.count,
            threshold = notice.threshold,
            frame = notice.frame_number,
            at = %notice.timestamp.to_rfc3339(),
            "crowd alert: {} people in frame",
            notice.count
        );
    }
}

pub(crate) struct AlertDispatcher {
    tx: Option<Sender<AlertNotice>>,
    /// Disconnects when the dispatcher thread exits.
    done: Receiver<()>,
    worker: Option<thread::JoinHandle<()>>,
}

impl AlertDispatcher {
    pub(crate) fn spawn(mut sink: Box<dyn AlertSink>) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<AlertNotice>(ALERT_QUEUE_CAPACITY);
        let (done_tx, done) = bounded::<()>(0);
        let worker = telemetry::spawn_thread("crowd-alerts", move || {
            let _done = done_tx;
            for notice in rx {
                sink.notify(&notice);
            }
            debug!("alert dispatcher drained");
        })?;
        Ok(Self {
            tx: Some(tx),
            done,
            worker: Some(worker),
        })
    }

    /// Queue a notice without waiting. Returns `false` when it was dropped.
    pub(crate) fn dispatch(&self, notice: AlertNotice) -> bool {
        metrics::counter!("crowd_alerts_total").increment(1);
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        match tx.try_send(notice) {
            Ok(()) => true,
            Err(TrySendError::Full(notice)) => {
                metrics::counter!("crowd_alerts_dropped_total").increment(1);
                warn!(count = notice.count, "alert queue full; notice dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                metrics::counter!("crowd_alerts_dropped_total").increment(1);
                false
            }
        }
    }
}

impl Drop for AlertDispatcher {
    fn drop(&mut self) {
        self.tx.take();
        let Some(worker) = self.worker.take() else {
            return;
        };
        match self.done.recv_timeout(DRAIN_TIMEOUT) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("alert sink stalled; detaching dispatcher thread");
                drop(worker);
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
            }
        }
    }
}
