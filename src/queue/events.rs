use crate::jobs::JobKind;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Job lifecycle event broadcast by the queues.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Waiting {
        queue: String,
        job_id: String,
        kind: JobKind,
        /// Sanitized payload
        payload: serde_json::Value,
    },
    Active {
        queue: String,
        job_id: String,
        attempt: u32,
    },
    Progress {
        queue: String,
        job_id: String,
        progress: u8,
    },
    Completed {
        queue: String,
        job_id: String,
        duration_ms: u64,
    },
    Failed {
        queue: String,
        job_id: String,
        reason: String,
        attempts_made: u32,
        will_retry: bool,
    },
    Stalled {
        queue: String,
        job_id: String,
        stalled_count: u32,
    },
}

impl QueueEvent {
    pub fn queue(&self) -> &str {
        match self {
            QueueEvent::Waiting { queue, .. }
            | QueueEvent::Active { queue, .. }
            | QueueEvent::Progress { queue, .. }
            | QueueEvent::Completed { queue, .. }
            | QueueEvent::Failed { queue, .. }
            | QueueEvent::Stalled { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            QueueEvent::Waiting { job_id, .. }
            | QueueEvent::Active { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Stalled { job_id, .. } => job_id,
        }
    }
}

/// Logs every event and hands it to `on_event` until `cancel` fires or all senders are gone.
pub(crate) async fn run_listener<F>(mut rx: broadcast::Receiver<QueueEvent>, cancel: CancellationToken, on_event: F)
where
    F: Fn(&QueueEvent) + Send,
{
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => received,
        };
        match event {
            Ok(event) => {
                log_event(&event);
                on_event(&event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event listener lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("queue event listener stopped");
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::Waiting {
            queue,
            job_id,
            kind,
            payload,
        } => debug!(queue = %queue, job_id = %job_id, kind = %kind, payload = %payload, "job waiting"),
        QueueEvent::Active { queue, job_id, attempt } => {
            debug!(queue = %queue, job_id = %job_id, attempt, "job active")
        }
        QueueEvent::Progress { queue, job_id, progress } => {
            debug!(queue = %queue, job_id = %job_id, progress, "job progress")
        }
        QueueEvent::Completed {
            queue,
            job_id,
            duration_ms,
        } => info!(queue = %queue, job_id = %job_id, duration_ms, "job completed"),
        QueueEvent::Failed {
            queue,
            job_id,
            reason,
            attempts_made,
            will_retry,
        } => warn!(
            queue = %queue,
            job_id = %job_id,
            attempts_made,
            will_retry,
            reason = %reason,
            "job failed"
        ),
        QueueEvent::Stalled {
            queue,
            job_id,
            stalled_count,
        } => warn!(queue = %queue, job_id = %job_id, stalled_count, "job stalled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_shape() {
        let e = QueueEvent::Failed {
            queue: "price-refresh".into(),
            job_id: "1".into(),
            reason: "boom".into(),
            attempts_made: 2,
            will_retry: true,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["event"], "failed");
        assert_eq!(v["will_retry"], true);
        assert_eq!(e.queue(), "price-refresh");
        assert_eq!(e.job_id(), "1");
    }
}
