use super::{BackoffPolicy, JobKind, JobPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Job record as held by a queue and mirrored to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub queue: String,
    pub payload: JobPayload,
    pub priority: i32,
    /// Finished attempts; never exceeds `max_attempts`
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub timeout_ms: u64,
    pub state: JobState,
    #[serde(default)]
    pub parent_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// 0..=100
    pub progress: u8,
    #[serde(default)]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub return_value: Option<serde_json::Value>,
    #[serde(default)]
    pub stalled_count: u32,
    #[serde(default)]
    pub repeat_every_ms: Option<u64>,
    #[serde(default)]
    pub remove_on_complete: Option<usize>,
    #[serde(default)]
    pub remove_on_fail: Option<usize>,
}

impl Job {
    pub fn attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id.clone(),
            queue: self.queue.clone(),
            kind: self.kind,
            state: self.state,
        }
    }
}

/// What `add_job` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
    pub kind: JobKind,
    pub state: JobState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payloads::RiskAnalysisPayload;

    #[test]
    fn test_snapshot_serde_shape() {
        let job = Job {
            id: "1".into(),
            kind: JobKind::RiskAnalysis,
            queue: "risk-analysis".into(),
            payload: JobPayload::RiskAnalysis(RiskAnalysisPayload {
                wallet: "0xabc".into(),
                chain: "ethereum".into(),
            }),
            priority: 1,
            attempts_made: 0,
            max_attempts: 2,
            backoff: BackoffPolicy::Fixed { delay_ms: 5_000 },
            timeout_ms: 1_000,
            state: JobState::Waiting,
            parent_job_id: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            progress: 0,
            failed_reason: None,
            return_value: None,
            stalled_count: 0,
            repeat_every_ms: None,
            remove_on_complete: None,
            remove_on_fail: None,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["state"], "waiting");
        assert_eq!(value["kind"], "risk-analysis");
        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
        assert!(job.attempts_left());
        assert!(!JobState::Active.is_terminal());
    }
}
