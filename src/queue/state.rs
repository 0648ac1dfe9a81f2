//! In-memory state of one queue: job records, the priority-ordered waiting set, the
//! delayed set and retention lists. Pure and synchronous; the owning [`Queue`] holds it
//! behind a mutex that is never held across an await point.
//!
//! [`Queue`]: super::job_queue::Queue

use crate::jobs::{Job, JobState};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

struct Slot {
    job: Job,
    /// Enqueue order; FIFO tie-break among equal priorities
    seq: u64,
    /// Bumped on every hand-out so results of a stalled attempt can be discarded
    lease: u64,
    heartbeat: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

#[derive(Debug)]
pub(crate) struct Finished {
    pub job: Job,
    /// Retention evictions caused by this job finishing
    pub evicted: Vec<String>,
}

#[derive(Debug)]
pub(crate) enum FailOutcome {
    Retry { job: Job, delay: Duration },
    Failed(Finished),
}

#[derive(Debug)]
pub(crate) struct Stalled {
    pub job: Job,
    pub failed: bool,
    pub evicted: Vec<String>,
}

#[derive(Default)]
pub(crate) struct QueueState {
    slots: HashMap<String, Slot>,
    waiting: BinaryHeap<(i32, Reverse<u64>, String)>,
    delayed: BTreeSet<(Instant, u64, String)>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    next_seq: u64,
    pub paused: bool,
}

impl QueueState {
    /// Adds a job as waiting, or delayed when `delay` is set. A terminal record with the
    /// same id is replaced; a live one is rejected.
    pub fn insert(&mut self, mut job: Job, delay: Option<Duration>, now: Instant) -> Result<Job, Job> {
        if let Some(existing) = self.slots.get(&job.id) {
            if !existing.job.state.is_terminal() {
                return Err(existing.job.clone());
            }
            let id = job.id.clone();
            self.completed.retain(|x| *x != id);
            self.failed.retain(|x| *x != id);
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        match delay.filter(|d| !d.is_zero()) {
            Some(d) => {
                job.state = JobState::Delayed;
                self.delayed.insert((now + d, seq, job.id.clone()));
            }
            None => {
                job.state = JobState::Waiting;
                self.waiting.push((job.priority, Reverse(seq), job.id.clone()));
            }
        }
        self.slots.insert(
            job.id.clone(),
            Slot {
                job: job.clone(),
                seq,
                lease: 0,
                heartbeat: now,
            },
        );
        Ok(job)
    }

    /// Drops a record outright (enqueue rollback).
    pub fn remove(&mut self, id: &str) -> Option<Job> {
        self.slots.remove(id).map(|s| s.job)
    }

    /// Moves delayed jobs whose time has come to waiting.
    pub fn promote_due(&mut self, now: Instant) -> Vec<String> {
        let mut promoted = Vec::new();
        while let Some(first) = self.delayed.first().cloned() {
            if first.0 > now {
                break;
            }
            self.delayed.remove(&first);
            let (_, seq, id) = first;
            if let Some(slot) = self.slots.get_mut(&id) {
                if slot.seq == seq && slot.job.state == JobState::Delayed {
                    slot.job.state = JobState::Waiting;
                    self.waiting.push((slot.job.priority, Reverse(seq), id.clone()));
                    promoted.push(id);
                }
            }
        }
        promoted
    }

    pub fn has_ready(&mut self, now: Instant) -> bool {
        self.promote_due(now);
        self.waiting
            .iter()
            .any(|(_, Reverse(seq), id)| self.is_waiting(id, *seq))
    }

    fn is_waiting(&self, id: &str, seq: u64) -> bool {
        self.slots
            .get(id)
            .is_some_and(|s| s.seq == seq && s.job.state == JobState::Waiting)
    }

    /// Hands out the highest-priority waiting job, marking it active.
    pub fn take_next(&mut self, now: Instant) -> Option<(Job, u64)> {
        self.promote_due(now);
        while let Some((_, Reverse(seq), id)) = self.waiting.pop() {
            if !self.is_waiting(&id, seq) {
                continue;
            }
            let slot = self.slots.get_mut(&id)?;
            slot.lease += 1;
            slot.heartbeat = now;
            slot.job.state = JobState::Active;
            slot.job.processed_at = Some(Utc::now());
            return Some((slot.job.clone(), slot.lease));
        }
        None
    }

    fn active_slot(&mut self, id: &str, lease: u64) -> Option<&mut Slot> {
        self.slots
            .get_mut(id)
            .filter(|s| s.lease == lease && s.job.state == JobState::Active)
    }

    pub fn heartbeat(&mut self, id: &str, lease: u64, now: Instant) -> bool {
        match self.active_slot(id, lease) {
            Some(slot) => {
                slot.heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Progress from a superseded attempt is ignored.
    pub fn set_progress(&mut self, id: &str, lease: u64, progress: u8) -> bool {
        match self.active_slot(id, lease) {
            Some(slot) => {
                slot.job.progress = progress.min(100);
                true
            }
            None => false,
        }
    }

    /// Records a successful attempt. `None` when the lease is stale.
    pub fn complete(&mut self, id: &str, lease: u64, value: serde_json::Value) -> Option<Finished> {
        let slot = self.active_slot(id, lease)?;
        slot.job.attempts_made = (slot.job.attempts_made + 1).min(slot.job.max_attempts);
        slot.job.state = JobState::Completed;
        slot.job.progress = 100;
        slot.job.return_value = Some(value);
        slot.job.failed_reason = None;
        slot.job.finished_at = Some(Utc::now());
        let job = slot.job.clone();
        let keep = job.remove_on_complete;
        self.completed.push_back(id.to_string());
        let evicted = evict(&mut self.slots, &mut self.completed, keep);
        Some(Finished { job, evicted })
    }

    /// Records a failed attempt, scheduling a retry when allowed. `None` when the lease is stale.
    pub fn fail(&mut self, id: &str, lease: u64, reason: String, retryable: bool, now: Instant) -> Option<FailOutcome> {
        let slot = self.active_slot(id, lease)?;
        slot.job.attempts_made = (slot.job.attempts_made + 1).min(slot.job.max_attempts);
        slot.job.failed_reason = Some(reason);

        if retryable && slot.job.attempts_left() {
            let delay = slot.job.backoff.delay_for(slot.job.attempts_made);
            slot.job.state = JobState::Delayed;
            slot.job.progress = 0;
            let seq = slot.seq;
            let job = slot.job.clone();
            self.delayed.insert((now + delay, seq, id.to_string()));
            return Some(FailOutcome::Retry { job, delay });
        }

        slot.job.state = JobState::Failed;
        slot.job.finished_at = Some(Utc::now());
        let job = slot.job.clone();
        Some(FailOutcome::Failed(self.finish_failed(id, job)))
    }

    fn finish_failed(&mut self, id: &str, job: Job) -> Finished {
        let keep = job.remove_on_fail;
        self.failed.push_back(id.to_string());
        let evicted = evict(&mut self.slots, &mut self.failed, keep);
        Finished { job, evicted }
    }

    /// Active jobs whose heartbeat is older than `stalled_after`. Each goes back to
    /// waiting under a new lease, or fails once it stalled more than `max_stalled` times.
    pub fn check_stalled(&mut self, now: Instant, stalled_after: Duration, max_stalled: u32) -> Vec<Stalled> {
        let stale: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| s.job.state == JobState::Active && now.saturating_duration_since(s.heartbeat) >= stalled_after)
            .map(|(id, _)| id.clone())
            .collect();

        let mut out = Vec::new();
        for id in stale {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            slot.job.stalled_count += 1;
            slot.lease += 1;
            if slot.job.stalled_count > max_stalled {
                slot.job.state = JobState::Failed;
                slot.job.failed_reason = Some(format!("job stalled more than {} time(s)", max_stalled));
                slot.job.finished_at = Some(Utc::now());
                let job = slot.job.clone();
                let finished = self.finish_failed(&id, job);
                out.push(Stalled {
                    job: finished.job,
                    failed: true,
                    evicted: finished.evicted,
                });
            } else {
                slot.job.state = JobState::Waiting;
                slot.job.progress = 0;
                self.waiting.push((slot.job.priority, Reverse(slot.seq), id.clone()));
                out.push(Stalled {
                    job: slot.job.clone(),
                    failed: false,
                    evicted: Vec::new(),
                });
            }
        }
        out
    }

    /// Removes waiting jobs, and delayed ones when `include_delayed`.
    pub fn drain(&mut self, include_delayed: bool) -> Vec<String> {
        let removed: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| match s.job.state {
                JobState::Waiting => true,
                JobState::Delayed => include_delayed,
                _ => false,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            self.slots.remove(id);
        }
        self.waiting.clear();
        if include_delayed {
            self.delayed.clear();
        }
        removed
    }

    /// Removes jobs in `status` older than `grace` (finish time for terminal states,
    /// creation time otherwise). Active jobs are never cleaned.
    pub fn clean(&mut self, grace: Duration, status: JobState, now: DateTime<Utc>) -> Vec<String> {
        if status == JobState::Active {
            return Vec::new();
        }
        let cutoff = now - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let removed: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| s.job.state == status)
            .filter(|(_, s)| s.job.finished_at.unwrap_or(s.job.created_at) <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            self.slots.remove(id);
        }
        match status {
            JobState::Completed => self.completed.retain(|id| !removed.contains(id)),
            JobState::Failed => self.failed.retain(|id| !removed.contains(id)),
            _ => {}
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.slots.get(id).map(|s| s.job.clone())
    }

    pub fn children(&self, parent_id: &str) -> Vec<Job> {
        let mut out: Vec<(u64, Job)> = self
            .slots
            .values()
            .filter(|s| s.job.parent_job_id.as_deref() == Some(parent_id))
            .map(|s| (s.seq, s.job.clone()))
            .collect();
        out.sort_by_key(|(seq, _)| *seq);
        out.into_iter().map(|(_, j)| j).collect()
    }

    /// Active jobs as `(id, lease)`.
    pub fn active(&self) -> Vec<(String, u64)> {
        self.slots
            .iter()
            .filter(|(_, s)| s.job.state == JobState::Active)
            .map(|(id, s)| (id.clone(), s.lease))
            .collect()
    }

    pub fn counts(&self) -> QueueCounts {
        let mut c = QueueCounts::default();
        for s in self.slots.values() {
            match s.job.state {
                JobState::Waiting => c.waiting += 1,
                JobState::Active => c.active += 1,
                JobState::Completed => c.completed += 1,
                JobState::Failed => c.failed += 1,
                JobState::Delayed => c.delayed += 1,
            }
        }
        c
    }
}

/// Trims a retention list to its newest `keep` ids, dropping evicted records.
fn evict(slots: &mut HashMap<String, Slot>, list: &mut VecDeque<String>, keep: Option<usize>) -> Vec<String> {
    let Some(keep) = keep else {
        return Vec::new();
    };
    let mut evicted = Vec::new();
    while list.len() > keep {
        if let Some(id) = list.pop_front() {
            slots.remove(&id);
            evicted.push(id);
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payloads::RiskAnalysisPayload;
    use crate::jobs::{BackoffPolicy, JobKind, JobPayload};

    fn job(id: &str, priority: i32, max_attempts: u32) -> Job {
        Job {
            id: id.to_string(),
            kind: JobKind::RiskAnalysis,
            queue: "risk-analysis".into(),
            payload: JobPayload::RiskAnalysis(RiskAnalysisPayload {
                wallet: "0xabc".into(),
                chain: "ethereum".into(),
            }),
            priority,
            attempts_made: 0,
            max_attempts,
            backoff: BackoffPolicy::Exponential { delay_ms: 100 },
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
            remove_on_complete: Some(2),
            remove_on_fail: None,
        }
    }

    #[test]
    fn test_priority_then_fifo() {
        let now = Instant::now();
        let mut s = QueueState::default();
        s.insert(job("a", 0, 1), None, now).unwrap();
        s.insert(job("b", 5, 1), None, now).unwrap();
        s.insert(job("c", 5, 1), None, now).unwrap();
        let order: Vec<String> = std::iter::from_fn(|| s.take_next(now).map(|(j, _)| j.id)).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_duplicate_live_id_rejected_terminal_replaced() {
        let now = Instant::now();
        let mut s = QueueState::default();
        s.insert(job("x", 0, 1), None, now).unwrap();
        assert!(s.insert(job("x", 0, 1), None, now).is_err());

        let (_, lease) = s.take_next(now).unwrap();
        s.complete("x", lease, serde_json::Value::Null).unwrap();
        assert!(s.insert(job("x", 0, 1), None, now).is_ok());
        assert_eq!(s.counts().waiting, 1);
        assert_eq!(s.counts().completed, 0);
    }

    #[test]
    fn test_retry_until_attempts_exhausted() {
        let mut now = Instant::now();
        let mut s = QueueState::default();
        s.insert(job("r", 0, 3), None, now).unwrap();

        for attempt in 1..=3u32 {
            let (j, lease) = s.take_next(now).expect("job should be ready");
            assert_eq!(j.attempts_made, attempt - 1);
            match s.fail("r", lease, "boom".into(), true, now).unwrap() {
                FailOutcome::Retry { job, delay } => {
                    assert!(attempt < 3);
                    assert_eq!(job.state, JobState::Delayed);
                    assert_eq!(delay, Duration::from_millis(100 * (1 << (attempt - 1))));
                    assert!(s.take_next(now).is_none());
                    now += delay;
                }
                FailOutcome::Failed(f) => {
                    assert_eq!(attempt, 3);
                    assert_eq!(f.job.attempts_made, 3);
                    assert_eq!(f.job.failed_reason.as_deref(), Some("boom"));
                }
            }
        }
        assert_eq!(s.get("r").unwrap().state, JobState::Failed);
    }

    #[test]
    fn test_stale_lease_is_discarded() {
        let now = Instant::now();
        let mut s = QueueState::default();
        s.insert(job("s", 0, 2), None, now).unwrap();
        let (_, lease) = s.take_next(now).unwrap();

        let stalled = s.check_stalled(now + Duration::from_secs(5), Duration::from_secs(1), 1);
        assert_eq!(stalled.len(), 1);
        assert!(!stalled[0].failed);
        assert!(s.complete("s", lease, serde_json::Value::Null).is_none());

        let (_, lease2) = s.take_next(now).unwrap();
        assert_ne!(lease, lease2);
        let stalled = s.check_stalled(now + Duration::from_secs(5), Duration::from_secs(1), 1);
        assert!(stalled[0].failed);
        assert_eq!(s.counts().failed, 1);
    }

    #[test]
    fn test_progress_from_stale_lease_is_ignored() {
        let now = Instant::now();
        let mut s = QueueState::default();
        s.insert(job("p", 0, 3), None, now).unwrap();
        let (_, old) = s.take_next(now).unwrap();
        assert!(s.set_progress("p", old, 30));

        s.check_stalled(now + Duration::from_secs(5), Duration::from_secs(1), 3);
        let (_, current) = s.take_next(now).unwrap();
        assert!(s.set_progress("p", current, 10));
        assert!(!s.set_progress("p", old, 90));
        assert_eq!(s.get("p").unwrap().progress, 10);
    }

    #[test]
    fn test_retention_keeps_newest() {
        let now = Instant::now();
        let mut s = QueueState::default();
        for id in ["1", "2", "3"] {
            s.insert(job(id, 0, 1), None, now).unwrap();
            let (_, lease) = s.take_next(now).unwrap();
            let done = s.complete(id, lease, serde_json::Value::Null).unwrap();
            if id == "3" {
                assert_eq!(done.evicted, vec!["1".to_string()]);
            }
        }
        assert!(s.get("1").is_none());
        assert_eq!(s.counts().completed, 2);
    }

    #[test]
    fn test_drain_and_clean() {
        let now = Instant::now();
        let mut s = QueueState::default();
        s.insert(job("w", 0, 1), None, now).unwrap();
        s.insert(job("d", 0, 1), Some(Duration::from_secs(60)), now).unwrap();
        assert_eq!(s.drain(false), vec!["w".to_string()]);
        assert_eq!(s.counts().delayed, 1);
        assert_eq!(s.drain(true), vec!["d".to_string()]);

        s.insert(job("f", 0, 1), None, now).unwrap();
        let (_, lease) = s.take_next(now).unwrap();
        s.fail("f", lease, "x".into(), false, now).unwrap();
        assert!(s.clean(Duration::from_secs(3600), JobState::Failed, Utc::now()).is_empty());
        assert_eq!(
            s.clean(Duration::ZERO, JobState::Failed, Utc::now() + chrono::Duration::seconds(1)),
            vec!["f".to_string()]
        );
    }
}
