//! Queue store: job records plus ordered pending and done queues.
//!
//! Every job id lives in exactly one of the pending queue, the done queue or
//! the active slot (`current_job_id`). The operations here are synchronous and
//! in-memory; persistence and dispatch are driven by the daemon loop.

use crate::jobs::{status, Job};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised by queue mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Job not found")]
    NotFound,

    #[error("Job already in queue")]
    AlreadyQueued,
}

/// What `remove` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Job owns the encoder; the caller must signal the process.
    Active,
    /// Job was pending and went straight to the done queue.
    Canceled,
}

/// Full queue state, serialized as the persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueState {
    #[serde(default)]
    pub jobs: BTreeMap<String, Job>,
    /// Pending job ids in dispatch order.
    #[serde(default)]
    pub queue: Vec<String>,
    /// Terminal job ids in completion order.
    #[serde(default, rename = "doneQueue")]
    pub done_queue: Vec<String>,
    /// Job currently owning the encoder.
    #[serde(default, rename = "currentJobID")]
    pub current_job_id: Option<String>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn job_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// The job owning the encoder, if any.
    pub fn current_job_mut(&mut self) -> Option<&mut Job> {
        let id = self.current_job_id.as_deref()?;
        self.jobs.get_mut(id)
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.queue.iter().any(|q| q == id)
    }

    pub fn is_current(&self, id: &str) -> bool {
        self.current_job_id.as_deref() == Some(id)
    }

    /// Pending jobs in queue order.
    pub fn pending_jobs(&self) -> Vec<Job> {
        self.resolve(&self.queue)
    }

    /// Done jobs in completion order.
    pub fn done_jobs(&self) -> Vec<Job> {
        self.resolve(&self.done_queue)
    }

    fn resolve(&self, ids: &[String]) -> Vec<Job> {
        ids.iter().filter_map(|id| self.jobs.get(id)).cloned().collect()
    }

    /// Store a job and append it to the pending tail.
    pub fn enqueue(&mut self, mut job: Job) -> String {
        let id = job.id.clone();
        job.status = status::QUEUED.to_string();
        self.jobs.insert(id.clone(), job);
        self.queue.push(id.clone());
        id
    }

    /// Remove a pending or active job.
    ///
    /// A pending job is canceled and moved to the done queue immediately. The
    /// active job is only marked; it reaches the done queue when its process
    /// exits.
    pub fn remove(&mut self, id: &str) -> Result<Removal, QueueError> {
        if self.is_current(id) {
            if let Some(job) = self.jobs.get_mut(id) {
                job.status = status::TERMINATED.to_string();
            }
            return Ok(Removal::Active);
        }

        let index = self
            .queue
            .iter()
            .position(|q| q == id)
            .ok_or(QueueError::NotFound)?;
        let id = self.queue.remove(index);
        if let Some(job) = self.jobs.get_mut(&id) {
            job.status = status::CANCELED.to_string();
        }
        self.done_queue.push(id);
        Ok(Removal::Canceled)
    }

    /// Move a done job back to the pending tail.
    pub fn requeue(&mut self, id: &str) -> Result<(), QueueError> {
        if !self.jobs.contains_key(id) {
            return Err(QueueError::NotFound);
        }
        if self.is_pending(id) || self.is_current(id) {
            return Err(QueueError::AlreadyQueued);
        }
        let index = self
            .done_queue
            .iter()
            .position(|d| d == id)
            .ok_or(QueueError::NotFound)?;
        let id = self.done_queue.remove(index);
        if let Some(job) = self.jobs.get_mut(&id) {
            job.reset_for_requeue();
        }
        self.queue.push(id);
        Ok(())
    }

    /// Relocate a pending job, returning the index it landed at.
    ///
    /// The target is clamped to `[1, len - 1]`: position 0 is the next job to
    /// be dispatched and is never a move target.
    pub fn move_job(&mut self, id: &str, target: i64) -> Result<usize, QueueError> {
        let from = self
            .queue
            .iter()
            .position(|q| q == id)
            .ok_or(QueueError::NotFound)?;
        let index = clamp_move_target(target, self.queue.len());
        let id = self.queue.remove(from);
        self.queue.insert(index, id);
        Ok(index)
    }

    /// Delete every job that is neither pending nor active and empty the done
    /// queue. Returns the number of records deleted.
    pub fn clear_completed(&mut self) -> usize {
        let before = self.jobs.len();
        let queue = &self.queue;
        let current = self.current_job_id.as_deref();
        self.jobs
            .retain(|id, _| current == Some(id.as_str()) || queue.iter().any(|q| q == id));
        self.done_queue.clear();
        before - self.jobs.len()
    }

    /// Pop the pending head into the active slot.
    ///
    /// Returns `None` when a job is already active or nothing is pending.
    pub fn activate_next(&mut self) -> Option<String> {
        if self.current_job_id.is_some() || self.queue.is_empty() {
            return None;
        }
        let id = self.queue.remove(0);
        self.current_job_id = Some(id.clone());
        Some(id)
    }

    /// Move the active job to the done queue and clear the active slot.
    pub fn finish_current(&mut self) -> Option<String> {
        let id = self.current_job_id.take()?;
        self.done_queue.push(id.clone());
        Some(id)
    }

    /// Put a job left active by a previous run back at the pending head.
    pub fn recover_interrupted(&mut self) -> Option<String> {
        let id = self.current_job_id.take()?;
        self.queue.retain(|q| q != &id);
        self.done_queue.retain(|d| d != &id);
        if let Some(job) = self.jobs.get_mut(&id) {
            job.reset_for_requeue();
            self.queue.insert(0, id.clone());
            Some(id)
        } else {
            None
        }
    }
}

/// Clamp a requested queue position into `[1, len - 1]`.
///
/// Queues shorter than two entries collapse to index 0.
pub fn clamp_move_target(target: i64, len: usize) -> usize {
    let upper = len.saturating_sub(1);
    let lower = target.max(1);
    usize::try_from(lower).unwrap_or(usize::MAX).min(upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobFactory;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};

    fn factory() -> JobFactory {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "p".to_string(),
            "-i {inputFile} -o {outputFile}.mkv".to_string(),
        );
        JobFactory::new(PathBuf::from("/media"), PathBuf::from("/out"), profiles)
    }

    fn make_job(name: &str) -> Job {
        factory()
            .build(Path::new(&format!("/media/{}.mkv", name)), "p", false)
            .unwrap()
    }

    fn state_with(n: usize) -> (QueueState, Vec<String>) {
        let mut state = QueueState::new();
        let ids = (0..n)
            .map(|i| state.enqueue(make_job(&format!("job{}", i))))
            .collect();
        (state, ids)
    }

    /// Every job id is in exactly one of pending, done or active.
    fn assert_partitioned(state: &QueueState) {
        let mut seen = HashSet::new();
        for id in state
            .queue
            .iter()
            .chain(state.done_queue.iter())
            .chain(state.current_job_id.iter())
        {
            assert!(seen.insert(id.clone()), "id {} appears twice", id);
        }
        let all: HashSet<String> = state.jobs.keys().cloned().collect();
        assert_eq!(seen, all);
    }

    #[test]
    fn test_enqueue_sets_queued_status() {
        let (state, ids) = state_with(2);
        assert_eq!(state.queue, ids);
        assert_eq!(state.job(&ids[0]).unwrap().status, status::QUEUED);
        assert_partitioned(&state);
    }

    #[test]
    fn test_remove_pending_cancels() {
        let (mut state, ids) = state_with(3);
        assert_eq!(state.remove(&ids[1]), Ok(Removal::Canceled));
        assert_eq!(state.queue, vec![ids[0].clone(), ids[2].clone()]);
        assert_eq!(state.done_queue, vec![ids[1].clone()]);
        assert_eq!(state.job(&ids[1]).unwrap().status, status::CANCELED);
        assert_partitioned(&state);
    }

    #[test]
    fn test_remove_active_only_marks() {
        let (mut state, ids) = state_with(2);
        state.activate_next();
        assert_eq!(state.remove(&ids[0]), Ok(Removal::Active));
        assert_eq!(state.current_job_id.as_deref(), Some(ids[0].as_str()));
        assert!(state.done_queue.is_empty());
        assert_eq!(state.job(&ids[0]).unwrap().status, status::TERMINATED);
        assert_partitioned(&state);
    }

    #[test]
    fn test_remove_unknown_or_done() {
        let (mut state, ids) = state_with(1);
        assert_eq!(state.remove("missing"), Err(QueueError::NotFound));
        state.remove(&ids[0]).unwrap();
        assert_eq!(state.remove(&ids[0]), Err(QueueError::NotFound));
    }

    #[test]
    fn test_requeue() {
        let (mut state, ids) = state_with(2);
        assert_eq!(state.requeue(&ids[0]), Err(QueueError::AlreadyQueued));
        assert_eq!(state.requeue("missing"), Err(QueueError::NotFound));

        state.activate_next();
        assert_eq!(state.requeue(&ids[0]), Err(QueueError::AlreadyQueued));
        state.job_mut(&ids[0]).unwrap().complete = true;
        state.job_mut(&ids[0]).unwrap().progress = 100.0;
        state.finish_current();

        assert_eq!(state.requeue(&ids[0]), Ok(()));
        assert_eq!(state.queue, vec![ids[1].clone(), ids[0].clone()]);
        let job = state.job(&ids[0]).unwrap();
        assert_eq!(job.status, status::REQUEUED);
        assert!(!job.complete);
        assert_eq!(job.progress, 0.0);
        assert_partitioned(&state);
    }

    #[test]
    fn test_move_job_clamps() {
        let (mut state, ids) = state_with(4);
        assert_eq!(state.move_job(&ids[3], 0), Ok(1));
        assert_eq!(state.queue[1], ids[3]);
        assert_eq!(state.move_job(&ids[0], 99), Ok(3));
        assert_eq!(state.queue[3], ids[0]);
        assert_eq!(state.move_job(&ids[2], -5), Ok(1));
        assert_eq!(state.move_job("missing", 1), Err(QueueError::NotFound));
        assert_partitioned(&state);
    }

    #[test]
    fn test_clamp_move_target_short_queues() {
        assert_eq!(clamp_move_target(5, 1), 0);
        assert_eq!(clamp_move_target(0, 0), 0);
        assert_eq!(clamp_move_target(1, 2), 1);
        assert_eq!(clamp_move_target(i64::MAX, 3), 2);
    }

    #[test]
    fn test_clear_completed_is_idempotent_and_keeps_active() {
        let (mut state, ids) = state_with(4);
        state.activate_next();
        state.remove(&ids[1]).unwrap();
        state.remove(&ids[2]).unwrap();

        assert_eq!(state.clear_completed(), 2);
        assert!(state.done_queue.is_empty());
        assert!(state.job(&ids[0]).is_some());
        assert!(state.job(&ids[3]).is_some());
        assert_eq!(state.clear_completed(), 0);
        assert_partitioned(&state);
    }

    #[test]
    fn test_activate_and_finish() {
        let (mut state, ids) = state_with(2);
        assert_eq!(state.activate_next(), Some(ids[0].clone()));
        assert_eq!(state.activate_next(), None);
        assert!(!state.is_pending(&ids[0]));
        assert_eq!(state.finish_current(), Some(ids[0].clone()));
        assert_eq!(state.current_job_id, None);
        assert_eq!(state.done_queue, vec![ids[0].clone()]);
        assert_partitioned(&state);
    }

    #[test]
    fn test_recover_interrupted_puts_job_at_head() {
        let (mut state, ids) = state_with(3);
        state.activate_next();
        assert_eq!(state.recover_interrupted(), Some(ids[0].clone()));
        assert_eq!(state.queue, ids);
        assert_eq!(state.current_job_id, None);
        assert_eq!(state.job(&ids[0]).unwrap().status, status::REQUEUED);
        assert_partitioned(&state);
    }

    #[test]
    fn test_document_field_names() {
        let (mut state, _) = state_with(1);
        state.activate_next();
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"jobs\""));
        assert!(json.contains("\"queue\""));
        assert!(json.contains("\"doneQueue\""));
        assert!(json.contains("\"currentJobID\""));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue,
        Remove(usize),
        Requeue(usize),
        Move(usize, i64),
        Clear,
        Activate,
        Finish,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Enqueue),
            (0usize..16).prop_map(Op::Remove),
            (0usize..16).prop_map(Op::Requeue),
            ((0usize..16), (-3i64..20)).prop_map(|(i, t)| Op::Move(i, t)),
            Just(Op::Clear),
            Just(Op::Activate),
            Just(Op::Finish),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Pending, done and active stay a partition of the job map under any
        // sequence of mutations.
        #[test]
        fn prop_queue_invariants_hold(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let mut state = QueueState::new();
            let mut known: Vec<String> = Vec::new();
            let mut counter = 0;

            for op in ops {
                let pick = |i: usize, known: &Vec<String>| known.get(i % known.len().max(1)).cloned();
                match op {
                    Op::Enqueue => {
                        counter += 1;
                        known.push(state.enqueue(make_job(&format!("f{}", counter))));
                    }
                    Op::Remove(i) => {
                        if let Some(id) = pick(i, &known) {
                            let _ = state.remove(&id);
                        }
                    }
                    Op::Requeue(i) => {
                        if let Some(id) = pick(i, &known) {
                            let _ = state.requeue(&id);
                        }
                    }
                    Op::Move(i, t) => {
                        if let Some(id) = pick(i, &known) {
                            if let Ok(index) = state.move_job(&id, t) {
                                prop_assert!(state.queue.len() < 2 || index >= 1);
                                prop_assert!(index < state.queue.len());
                            }
                        }
                    }
                    Op::Clear => {
                        state.clear_completed();
                        prop_assert_eq!(state.clear_completed(), 0);
                    }
                    Op::Activate => {
                        state.activate_next();
                    }
                    Op::Finish => {
                        state.finish_current();
                    }
                }
                assert_partitioned(&state);
            }
        }
    }
}
