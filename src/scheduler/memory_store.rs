//! In-process queue store.
//!
//! Holds every collection behind a single mutex, so each `apply` and `claim`
//! is trivially atomic. Used by tests and by single-process deployments that
//! do not need Redis. Ordering mirrors Redis sorted sets: by score, then by
//! member for equal scores.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use tokio::sync::Mutex;

use super::job::{fields, JobStatus};
use super::store::{
    pick_candidate, Candidate, ClaimMode, ClaimRequest, Counter, CounterSnapshot, QueueStore,
    RecordGuard, StoreOp,
};
use crate::error::QueueError;

/// Sorted set with Redis ZSET ordering semantics.
#[derive(Debug, Default)]
struct ScoredSet {
    by_score: BTreeSet<(OrderedFloat<f64>, String)>,
    scores: HashMap<String, OrderedFloat<f64>>,
}

impl ScoredSet {
    fn insert(&mut self, member: &str, score: f64) {
        let score = OrderedFloat(score);
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.by_score.remove(&(old, member.to_string()));
        }
        self.by_score.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.by_score.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn first(&self, n: usize) -> Vec<String> {
        self.by_score
            .iter()
            .take(n)
            .map(|(_, member)| member.clone())
            .collect()
    }

    fn up_to(&self, max_score: f64) -> Vec<String> {
        self.by_score
            .iter()
            .take_while(|(score, _)| score.0 <= max_score)
            .map(|(_, member)| member.clone())
            .collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<String, HashMap<String, String>>,
    pending: ScoredSet,
    pending_by_model: HashMap<String, ScoredSet>,
    delayed: ScoredSet,
    active: HashSet<String>,
    active_by_model: HashMap<String, HashSet<String>>,
    dead_letters: VecDeque<String>,
    models: BTreeSet<String>,
    counters: BTreeMap<Counter, i64>,
}

impl MemoryState {
    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::PutRecord { job_id, fields } => {
                self.records.entry(job_id).or_default().extend(fields);
            }
            StoreOp::AddPending {
                job_id,
                model_id,
                score,
            } => self.add_pending(&job_id, &model_id, score),
            StoreOp::RemovePending { job_id, model_id } => self.remove_pending(&job_id, &model_id),
            StoreOp::AddDelayed { job_id, due_ms } => self.delayed.insert(&job_id, due_ms as f64),
            StoreOp::RemoveDelayed { job_id } => {
                self.delayed.remove(&job_id);
            }
            StoreOp::AddActive { job_id, model_id } => self.add_active(&job_id, &model_id),
            StoreOp::RemoveActive { job_id, model_id } => {
                self.active.remove(&job_id);
                if let Some(set) = self.active_by_model.get_mut(&model_id) {
                    set.remove(&job_id);
                }
            }
            StoreOp::DropActive { job_id, model_ids } => {
                self.active.remove(&job_id);
                for model_id in model_ids {
                    if let Some(set) = self.active_by_model.get_mut(&model_id) {
                        set.remove(&job_id);
                    }
                }
            }
            StoreOp::PushDeadLetter { job_id } => self.dead_letters.push_back(job_id),
            StoreOp::RemoveDeadLetter { job_id } => self.dead_letters.retain(|id| *id != job_id),
            StoreOp::RegisterModel { model_id } => {
                self.models.insert(model_id);
            }
            StoreOp::Increment { counter, by } => {
                *self.counters.entry(counter).or_insert(0) += by;
            }
        }
    }

    fn add_pending(&mut self, job_id: &str, model_id: &str, score: f64) {
        self.pending.insert(job_id, score);
        self.pending_by_model
            .entry(model_id.to_string())
            .or_default()
            .insert(job_id, score);
    }

    fn remove_pending(&mut self, job_id: &str, model_id: &str) {
        self.pending.remove(job_id);
        if let Some(set) = self.pending_by_model.get_mut(model_id) {
            set.remove(job_id);
        }
    }

    fn add_active(&mut self, job_id: &str, model_id: &str) {
        self.models.insert(model_id.to_string());
        self.active.insert(job_id.to_string());
        self.active_by_model
            .entry(model_id.to_string())
            .or_default()
            .insert(job_id.to_string());
    }

    fn active_for(&self, model_id: &str) -> u64 {
        self.active_by_model
            .get(model_id)
            .map_or(0, |set| set.len() as u64)
    }

    fn field(&self, job_id: &str, field: &str) -> Option<&str> {
        self.records
            .get(job_id)
            .and_then(|record| record.get(field))
            .map(String::as_str)
    }

    /// Moves delayed jobs whose retry time has passed back into the pending sets.
    fn promote_due(&mut self, now_ms: i64) {
        for job_id in self.delayed.up_to(now_ms as f64) {
            self.delayed.remove(&job_id);

            let Some(record) = self.records.get(&job_id) else {
                continue;
            };
            if record.get(fields::STATUS).map(String::as_str) != Some(JobStatus::Pending.as_str()) {
                continue;
            }
            let model_id = record.get(fields::MODEL_ID).cloned().unwrap_or_default();
            let score = record
                .get(fields::QUEUE_SCORE)
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(now_ms as f64);

            self.add_pending(&job_id, &model_id, score);
        }
    }

    fn claim(&mut self, request: &ClaimRequest) -> Option<String> {
        self.promote_due(request.now_ms());

        if self.active.len() as u64 >= u64::from(request.max_global) {
            return None;
        }

        let scan = request.scan_limit as usize;
        let scanned = match &request.model_id {
            Some(model_id) => self
                .pending_by_model
                .get(model_id)
                .map(|set| set.first(scan))
                .unwrap_or_default(),
            None => self.pending.first(scan),
        };

        let mut candidates = Vec::with_capacity(scanned.len());
        for job_id in scanned {
            let status = self.field(&job_id, fields::STATUS).map(str::to_string);
            let model_id = self.field(&job_id, fields::MODEL_ID).map(str::to_string);

            match (status, model_id) {
                (Some(status), Some(model_id)) if status == JobStatus::Pending.as_str() => {
                    candidates.push(Candidate { job_id, model_id });
                }
                (_, Some(model_id)) => self.remove_pending(&job_id, &model_id),
                (_, None) => {
                    // Orphaned index entry without a record.
                    let model_id = request.model_id.clone().unwrap_or_default();
                    self.remove_pending(&job_id, &model_id);
                }
            }
        }

        let index = pick_candidate(&candidates, request.max_per_model, |model_id| {
            self.active_for(model_id)
        })?;
        let Candidate { job_id, model_id } = candidates.swap_remove(index);

        self.remove_pending(&job_id, &model_id);
        self.add_active(&job_id, &model_id);

        let now = request.now_iso();
        if let Some(record) = self.records.get_mut(&job_id) {
            record.insert(
                fields::STATUS.to_string(),
                JobStatus::Active.as_str().to_string(),
            );
            record.insert(fields::STARTED_AT.to_string(), now.clone());
            record.insert(fields::UPDATED_AT.to_string(), now);
        }

        Some(job_id)
    }
}

/// Queue store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    fn claim_mode(&self) -> ClaimMode {
        ClaimMode::Atomic
    }

    async fn load_record(
        &self,
        job_id: &str,
    ) -> Result<Option<HashMap<String, String>>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.records.get(job_id).cloned())
    }

    async fn apply(
        &self,
        guards: &[RecordGuard],
        ops: Vec<StoreOp>,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;

        let satisfied = guards
            .iter()
            .all(|guard| guard.matches(state.records.get(guard.job_id())));
        if !satisfied {
            return Ok(false);
        }

        for op in ops {
            state.apply(op);
        }
        Ok(true)
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Option<String>, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.claim(request))
    }

    async fn pending_count(&self, model_id: Option<&str>) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        let count = match model_id {
            Some(model_id) => state.pending_by_model.get(model_id).map_or(0, ScoredSet::len),
            None => state.pending.len(),
        };
        Ok(count as u64)
    }

    async fn delayed_count(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok(state.delayed.len() as u64)
    }

    async fn active_count(&self, model_id: Option<&str>) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok(match model_id {
            Some(model_id) => state.active_for(model_id),
            None => state.active.len() as u64,
        })
    }

    async fn active_ids(&self) -> Result<Vec<String>, QueueError> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.active.iter().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.iter().take(limit).cloned().collect())
    }

    async fn dead_letter_len(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.len() as u64)
    }

    async fn models(&self) -> Result<Vec<String>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.models.iter().cloned().collect())
    }

    async fn counters(&self) -> Result<CounterSnapshot, QueueError> {
        let state = self.state.lock().await;
        Ok(CounterSnapshot(state.counters.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::EvaluationJob;
    use chrono::Utc;
    use serde_json::json;

    fn request(model_id: Option<&str>, max_per_model: u32, max_global: u32) -> ClaimRequest {
        ClaimRequest {
            model_id: model_id.map(str::to_string),
            now: Utc::now(),
            max_global,
            max_per_model,
            scan_limit: 100,
        }
    }

    async fn seed(store: &MemoryStore, job: &EvaluationJob, score: f64) {
        store
            .apply(
                &[],
                vec![
                    StoreOp::put(job),
                    StoreOp::AddPending {
                        job_id: job.id.clone(),
                        model_id: job.model_id.clone(),
                        score,
                    },
                ],
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_scored_set_orders_by_score_then_member() {
        let mut set = ScoredSet::default();
        set.insert("b", 1.0);
        set.insert("a", 1.0);
        set.insert("c", -5.0);
        assert_eq!(set.first(10), vec!["c", "a", "b"]);

        set.insert("c", 10.0);
        assert_eq!(set.first(10), vec!["a", "b", "c"]);
        assert_eq!(set.up_to(1.0), vec!["a", "b"]);

        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_respects_per_model_cap() {
        let store = MemoryStore::new();
        let a1 = EvaluationJob::new("a", json!({})).with_id("a1");
        let a2 = EvaluationJob::new("a", json!({})).with_id("a2");
        let b1 = EvaluationJob::new("b", json!({})).with_id("b1");
        seed(&store, &a1, 1.0).await;
        seed(&store, &a2, 2.0).await;
        seed(&store, &b1, 3.0).await;

        let first = store.claim(&request(None, 1, 10)).await.unwrap();
        let second = store.claim(&request(None, 1, 10)).await.unwrap();
        let third = store.claim(&request(None, 1, 10)).await.unwrap();

        assert_eq!(first.as_deref(), Some("a1"));
        assert_eq!(second.as_deref(), Some("b1"));
        assert_eq!(third, None);
        assert_eq!(store.active_count(Some("a")).await.unwrap(), 1);
        assert_eq!(store.pending_count(None).await.unwrap(), 1);

        let record = store.load_record("a1").await.unwrap().unwrap();
        assert_eq!(record[fields::STATUS], "active");
        assert!(!record[fields::STARTED_AT].is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_global_cap() {
        let store = MemoryStore::new();
        for (i, model) in ["a", "b", "c"].iter().enumerate() {
            let job = EvaluationJob::new(*model, json!({})).with_id(format!("j{i}"));
            seed(&store, &job, i as f64).await;
        }

        assert!(store.claim(&request(None, 5, 2)).await.unwrap().is_some());
        assert!(store.claim(&request(None, 5, 2)).await.unwrap().is_some());
        assert!(store.claim(&request(None, 5, 2)).await.unwrap().is_none());
        assert_eq!(store.active_count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_claim_promotes_due_delayed_jobs() {
        let store = MemoryStore::new();
        let job = EvaluationJob::new("a", json!({})).with_id("retry-me");
        store
            .apply(
                &[],
                vec![
                    StoreOp::put(&job),
                    StoreOp::AddDelayed {
                        job_id: job.id.clone(),
                        due_ms: Utc::now().timestamp_millis() - 1,
                    },
                ],
            )
            .await
            .unwrap();

        let claimed = store.claim(&request(Some("a"), 1, 1)).await.unwrap();
        assert_eq!(claimed.as_deref(), Some("retry-me"));
        assert_eq!(store.delayed_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_drops_orphaned_entries() {
        let store = MemoryStore::new();
        store
            .apply(
                &[],
                vec![StoreOp::AddPending {
                    job_id: "ghost".to_string(),
                    model_id: "a".to_string(),
                    score: 0.0,
                }],
            )
            .await
            .unwrap();

        assert_eq!(store.claim(&request(Some("a"), 1, 1)).await.unwrap(), None);
        assert_eq!(store.pending_count(None).await.unwrap(), 0);
        assert_eq!(store.pending_count(Some("a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_guarded_apply_rejects_stale_plan() {
        let store = MemoryStore::new();
        let job = EvaluationJob::new("a", json!({}));
        seed(&store, &job, 0.0).await;
        let guard = RecordGuard::unchanged(&job);

        store.claim(&request(None, 1, 1)).await.unwrap();

        let applied = store
            .apply(&[guard], vec![StoreOp::RemoveDelayed { job_id: job.id.clone() }])
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_absent_guard_blocks_overwrite() {
        let store = MemoryStore::new();
        let job = EvaluationJob::new("a", json!({})).with_id("dup");
        let first = store
            .apply(&[RecordGuard::absent("dup")], vec![StoreOp::put(&job)])
            .await
            .unwrap();
        assert!(first);

        let second = store
            .apply(
                &[RecordGuard::absent("dup")],
                vec![
                    StoreOp::put(&job),
                    StoreOp::AddPending {
                        job_id: "dup".to_string(),
                        model_id: "a".to_string(),
                        score: 0.0,
                    },
                ],
            )
            .await
            .unwrap();

        assert!(!second);
        assert_eq!(store.pending_count(None).await.unwrap(), 0);
        let record = store.load_record("dup").await.unwrap().unwrap();
        assert_eq!(record[fields::STATUS], "pending");
    }
}
