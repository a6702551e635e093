//! Redis-backed queue store.
//!
//! # Key layout
//!
//! All keys live under a deployment prefix (`evalq` by default):
//!
//! - `{prefix}:job:{id}`: hash holding the flat job record
//! - `{prefix}:pending` / `{prefix}:pending:{model}`: sorted sets of pending ids
//! - `{prefix}:delayed`: sorted set of ids in retry backoff, scored by due time (ms)
//! - `{prefix}:active` / `{prefix}:active:{model}`: sets of claimed ids
//! - `{prefix}:dead_letter`: list of dead-lettered ids, oldest first
//! - `{prefix}:models`: set of model names seen by `enqueue`
//! - `{prefix}:stats:{counter}`: integer counters
//!
//! # Atomicity
//!
//! When the server accepts Lua scripts, claims and guarded transitions run
//! as scripts and are fully atomic. Otherwise the store can fall back to
//! pipelined commands ([`ClaimMode::Relaxed`]): a job is still never handed
//! to two workers, but concurrent claims may briefly over-admit past the
//! concurrency caps, and a guarded transition can interleave with a claim.
//!
//! The scripts build key names from the prefix at run time, so they target
//! a single Redis instance and are not cluster-safe.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{info, warn};

use super::config::EvaluationQueueConfig;
use super::job::{fields, JobStatus};
use super::store::{
    pick_candidate, Candidate, ClaimMode, ClaimRequest, Counter, CounterSnapshot, QueueStore,
    RecordGuard, StoreOp,
};
use crate::error::QueueError;

/// Promotes due retries, checks the caps and claims one job.
///
/// ARGV: prefix, now_ms, now_iso, max_global, max_per_model, scan_limit, model ('' = any).
const CLAIM_SCRIPT: &str = r#"
local prefix = ARGV[1]
local now_ms = ARGV[2]
local now_iso = ARGV[3]
local max_global = tonumber(ARGV[4])
local max_per_model = tonumber(ARGV[5])
local scan_limit = tonumber(ARGV[6])
local model = ARGV[7]

local pending = prefix .. ':pending'
local delayed = prefix .. ':delayed'
local active = prefix .. ':active'

local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now_ms)
for _, id in ipairs(due) do
  redis.call('ZREM', delayed, id)
  local job = redis.call('HMGET', prefix .. ':job:' .. id, 'model_id', 'queue_score', 'status')
  if job[1] and job[2] and job[3] == 'pending' then
    redis.call('ZADD', pending, job[2], id)
    redis.call('ZADD', pending .. ':' .. job[1], job[2], id)
  end
end

if redis.call('SCARD', active) >= max_global then
  return false
end

local source = pending
if model ~= '' then
  source = pending .. ':' .. model
end

local candidates = redis.call('ZRANGE', source, 0, scan_limit - 1)
for _, id in ipairs(candidates) do
  local job_key = prefix .. ':job:' .. id
  local job = redis.call('HMGET', job_key, 'model_id', 'status')
  local job_model = job[1]
  if not job_model then
    redis.call('ZREM', pending, id)
    redis.call('ZREM', source, id)
  elseif job[2] ~= 'pending' then
    redis.call('ZREM', pending, id)
    redis.call('ZREM', pending .. ':' .. job_model, id)
  elseif redis.call('SCARD', active .. ':' .. job_model) < max_per_model then
    redis.call('ZREM', pending, id)
    redis.call('ZREM', pending .. ':' .. job_model, id)
    redis.call('SADD', active, id)
    redis.call('SADD', active .. ':' .. job_model, id)
    redis.call('SADD', prefix .. ':models', job_model)
    redis.call('HSET', job_key, 'status', 'active', 'started_at', now_iso, 'updated_at', now_iso)
    return id
  end
end

return false
"#;

/// Applies a list of commands only if every guard holds.
///
/// KEYS: one job record per guard. ARGV: guard count, then per guard its
/// kind ('absent' or 'unchanged'), expected status and expected updated_at,
/// then each command as its argument count followed by its arguments.
const GUARDED_APPLY_SCRIPT: &str = r#"
local guards = tonumber(ARGV[1])
for g = 1, guards do
  local base = 2 + (g - 1) * 3
  if ARGV[base] == 'absent' then
    if redis.call('EXISTS', KEYS[g]) == 1 then
      return 0
    end
  else
    local current = redis.call('HMGET', KEYS[g], 'status', 'updated_at')
    if current[1] ~= ARGV[base + 1] or current[2] ~= ARGV[base + 2] then
      return 0
    end
  end
end

local i = 2 + guards * 3
while i <= #ARGV do
  local n = tonumber(ARGV[i])
  redis.call(unpack(ARGV, i + 1, i + n))
  i = i + n + 1
end
return 1
"#;

/// Key names for one deployment.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    pub fn pending(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    pub fn pending_for(&self, model_id: &str) -> String {
        format!("{}:pending:{}", self.prefix, model_id)
    }

    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    pub fn active(&self) -> String {
        format!("{}:active", self.prefix)
    }

    pub fn active_for(&self, model_id: &str) -> String {
        format!("{}:active:{}", self.prefix, model_id)
    }

    pub fn dead_letter(&self) -> String {
        format!("{}:dead_letter", self.prefix)
    }

    pub fn models(&self) -> String {
        format!("{}:models", self.prefix)
    }

    pub fn counter(&self, counter: Counter) -> String {
        format!("{}:stats:{}", self.prefix, counter.as_str())
    }

    /// Translates one store op into the Redis commands that implement it.
    pub fn commands(&self, op: &StoreOp) -> Vec<Vec<String>> {
        match op {
            StoreOp::PutRecord { job_id, fields } => {
                let mut pairs: Vec<(&String, &String)> = fields.iter().collect();
                pairs.sort();
                let mut command = vec!["HSET".to_string(), self.job(job_id)];
                for (field, value) in pairs {
                    command.push(field.clone());
                    command.push(value.clone());
                }
                vec![command]
            }
            StoreOp::AddPending {
                job_id,
                model_id,
                score,
            } => vec![
                cmd(&["ZADD", &self.pending(), &score.to_string(), job_id]),
                cmd(&["ZADD", &self.pending_for(model_id), &score.to_string(), job_id]),
            ],
            StoreOp::RemovePending { job_id, model_id } => vec![
                cmd(&["ZREM", &self.pending(), job_id]),
                cmd(&["ZREM", &self.pending_for(model_id), job_id]),
            ],
            StoreOp::AddDelayed { job_id, due_ms } => {
                vec![cmd(&["ZADD", &self.delayed(), &due_ms.to_string(), job_id])]
            }
            StoreOp::RemoveDelayed { job_id } => vec![cmd(&["ZREM", &self.delayed(), job_id])],
            StoreOp::AddActive { job_id, model_id } => vec![
                cmd(&["SADD", &self.active(), job_id]),
                cmd(&["SADD", &self.active_for(model_id), job_id]),
                cmd(&["SADD", &self.models(), model_id]),
            ],
            StoreOp::RemoveActive { job_id, model_id } => vec![
                cmd(&["SREM", &self.active(), job_id]),
                cmd(&["SREM", &self.active_for(model_id), job_id]),
            ],
            StoreOp::DropActive { job_id, model_ids } => {
                let mut commands = vec![cmd(&["SREM", &self.active(), job_id])];
                commands.extend(
                    model_ids
                        .iter()
                        .map(|model_id| cmd(&["SREM", &self.active_for(model_id), job_id])),
                );
                commands
            }
            StoreOp::PushDeadLetter { job_id } => {
                vec![cmd(&["RPUSH", &self.dead_letter(), job_id])]
            }
            StoreOp::RemoveDeadLetter { job_id } => {
                vec![cmd(&["LREM", &self.dead_letter(), "0", job_id])]
            }
            StoreOp::RegisterModel { model_id } => vec![cmd(&["SADD", &self.models(), model_id])],
            StoreOp::Increment { counter, by } => {
                vec![cmd(&["INCRBY", &self.counter(*counter), &by.to_string()])]
            }
        }
    }
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Builds a MULTI/EXEC pipeline from translated commands.
fn transaction(commands: &[Vec<String>]) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for command in commands {
        if let Some((name, args)) = command.split_first() {
            pipe.cmd(name);
            for arg in args {
                pipe.arg(arg);
            }
            pipe.ignore();
        }
    }
    pipe
}

/// The capability of claiming one job under the concurrency caps.
#[async_trait]
pub trait ClaimStrategy: Send + Sync {
    fn mode(&self) -> ClaimMode;

    async fn claim(
        &self,
        conn: &mut ConnectionManager,
        keys: &KeySpace,
        request: &ClaimRequest,
    ) -> Result<Option<String>, QueueError>;
}

/// Claims with a single server-side Lua script.
pub struct ScriptedClaim {
    script: Script,
}

impl ScriptedClaim {
    pub fn new() -> Self {
        Self {
            script: Script::new(CLAIM_SCRIPT),
        }
    }
}

impl Default for ScriptedClaim {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClaimStrategy for ScriptedClaim {
    fn mode(&self) -> ClaimMode {
        ClaimMode::Atomic
    }

    async fn claim(
        &self,
        conn: &mut ConnectionManager,
        keys: &KeySpace,
        request: &ClaimRequest,
    ) -> Result<Option<String>, QueueError> {
        let mut invocation = self.script.prepare_invoke();
        invocation
            .arg(keys.prefix())
            .arg(request.now_ms())
            .arg(request.now_iso())
            .arg(request.max_global)
            .arg(request.max_per_model)
            .arg(request.scan_limit)
            .arg(request.model_id.as_deref().unwrap_or(""));

        let claimed: Option<String> = invocation.invoke_async(conn).await?;
        Ok(claimed)
    }
}

/// Claims with a sequence of plain commands.
///
/// Winning `ZREM` on the global pending set is what hands a job to exactly
/// one caller. The cap checks happen before that and can be stale, so
/// concurrent callers may over-admit.
#[derive(Debug, Default)]
pub struct PipelinedClaim;

impl PipelinedClaim {
    async fn promote_due(
        conn: &mut ConnectionManager,
        keys: &KeySpace,
        now_ms: i64,
    ) -> Result<(), QueueError> {
        let due: Vec<String> = conn.zrangebyscore(keys.delayed(), "-inf", now_ms).await?;

        for job_id in due {
            let removed: i64 = conn.zrem(keys.delayed(), &job_id).await?;
            if removed == 0 {
                continue;
            }

            let (model_id, score, status): (Option<String>, Option<String>, Option<String>) =
                redis::cmd("HMGET")
                    .arg(keys.job(&job_id))
                    .arg(fields::MODEL_ID)
                    .arg(fields::QUEUE_SCORE)
                    .arg(fields::STATUS)
                    .query_async(conn)
                    .await?;

            if let (Some(model_id), Some(score), Some(status)) = (model_id, score, status) {
                if status == JobStatus::Pending.as_str() {
                    redis::pipe()
                        .atomic()
                        .zadd(keys.pending(), &job_id, &score)
                        .ignore()
                        .zadd(keys.pending_for(&model_id), &job_id, &score)
                        .ignore()
                        .query_async::<_, ()>(conn)
                        .await?;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ClaimStrategy for PipelinedClaim {
    fn mode(&self) -> ClaimMode {
        ClaimMode::Relaxed
    }

    async fn claim(
        &self,
        conn: &mut ConnectionManager,
        keys: &KeySpace,
        request: &ClaimRequest,
    ) -> Result<Option<String>, QueueError> {
        Self::promote_due(conn, keys, request.now_ms()).await?;

        let active: u64 = conn.scard(keys.active()).await?;
        if active >= u64::from(request.max_global) {
            return Ok(None);
        }

        let source = match &request.model_id {
            Some(model_id) => keys.pending_for(model_id),
            None => keys.pending(),
        };
        let scanned: Vec<String> = conn
            .zrange(&source, 0, request.scan_limit as isize - 1)
            .await?;

        let mut candidates = Vec::with_capacity(scanned.len());
        for job_id in scanned {
            let (model_id, status): (Option<String>, Option<String>) = redis::cmd("HMGET")
                .arg(keys.job(&job_id))
                .arg(fields::MODEL_ID)
                .arg(fields::STATUS)
                .query_async(conn)
                .await?;

            match (model_id, status) {
                (Some(model_id), Some(status)) if status == JobStatus::Pending.as_str() => {
                    candidates.push(Candidate { job_id, model_id });
                }
                (model_id, _) => {
                    let model_pending = model_id
                        .map(|m| keys.pending_for(&m))
                        .unwrap_or_else(|| source.clone());
                    redis::pipe()
                        .zrem(keys.pending(), &job_id)
                        .ignore()
                        .zrem(model_pending, &job_id)
                        .ignore()
                        .query_async::<_, ()>(conn)
                        .await?;
                }
            }
        }

        let mut active_by_model: HashMap<String, u64> = HashMap::new();
        for candidate in &candidates {
            if !active_by_model.contains_key(&candidate.model_id) {
                let count: u64 = conn.scard(keys.active_for(&candidate.model_id)).await?;
                active_by_model.insert(candidate.model_id.clone(), count);
            }
        }

        let mut remaining = candidates.as_slice();
        while let Some(index) = pick_candidate(remaining, request.max_per_model, |model_id| {
            active_by_model.get(model_id).copied().unwrap_or(0)
        }) {
            let Candidate { job_id, model_id } = &remaining[index];

            let won: i64 = conn.zrem(keys.pending(), job_id).await?;
            if won == 1 {
                let now = request.now_iso();
                redis::pipe()
                    .atomic()
                    .zrem(keys.pending_for(model_id), job_id)
                    .ignore()
                    .sadd(keys.active(), job_id)
                    .ignore()
                    .sadd(keys.active_for(model_id), job_id)
                    .ignore()
                    .sadd(keys.models(), model_id)
                    .ignore()
                    .cmd("HSET")
                    .arg(keys.job(job_id))
                    .arg(fields::STATUS)
                    .arg(JobStatus::Active.as_str())
                    .arg(fields::STARTED_AT)
                    .arg(&now)
                    .arg(fields::UPDATED_AT)
                    .arg(&now)
                    .ignore()
                    .query_async::<_, ()>(conn)
                    .await?;
                return Ok(Some(job_id.clone()));
            }

            remaining = &remaining[index + 1..];
        }

        Ok(None)
    }
}

/// Queue store backed by Redis.
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    keys: KeySpace,
    claim: Box<dyn ClaimStrategy>,
    /// Present when the server runs Lua scripts.
    guarded_apply: Option<Script>,
}

impl RedisStore {
    /// Connects to Redis and selects the claim strategy.
    ///
    /// Scripting support is checked with `SCRIPT LOAD`. If the server refuses
    /// scripts, the relaxed pipelined strategy is used only when
    /// `allow_relaxed_claim` is set; otherwise connecting fails.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails and
    /// `QueueError::ScriptingUnavailable` if scripts are refused and the
    /// relaxed mode is not allowed.
    pub async fn connect(config: &EvaluationQueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Self::from_connection(redis, config).await
    }

    /// Creates a store from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection across multiple components.
    pub async fn from_connection(
        redis: ConnectionManager,
        config: &EvaluationQueueConfig,
    ) -> Result<Self, QueueError> {
        let mut conn = redis.clone();
        let loaded: redis::RedisResult<String> = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(CLAIM_SCRIPT)
            .query_async(&mut conn)
            .await;

        let (claim, guarded_apply): (Box<dyn ClaimStrategy>, Option<Script>) = match loaded {
            Ok(_) => (
                Box::new(ScriptedClaim::new()),
                Some(Script::new(GUARDED_APPLY_SCRIPT)),
            ),
            Err(e) if e.is_io_error() || e.is_connection_dropped() => {
                return Err(QueueError::ConnectionFailed(e.to_string()));
            }
            Err(e) if config.allow_relaxed_claim => {
                warn!(
                    error = %e,
                    "Redis refused scripting; relaxed claims may briefly exceed concurrency caps"
                );
                (Box::new(PipelinedClaim), None)
            }
            Err(e) => return Err(QueueError::ScriptingUnavailable(e.to_string())),
        };

        info!(
            prefix = %config.key_prefix,
            claim_mode = %claim.mode(),
            "Connected Redis queue store"
        );

        Ok(Self {
            redis,
            keys: KeySpace::new(config.key_prefix.clone()),
            claim,
            guarded_apply,
        })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    fn translate(&self, ops: &[StoreOp]) -> Vec<Vec<String>> {
        ops.iter().flat_map(|op| self.keys.commands(op)).collect()
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    fn claim_mode(&self) -> ClaimMode {
        self.claim.mode()
    }

    async fn load_record(
        &self,
        job_id: &str,
    ) -> Result<Option<HashMap<String, String>>, QueueError> {
        let mut conn = self.redis.clone();
        let record: HashMap<String, String> = conn.hgetall(self.keys.job(job_id)).await?;
        Ok(if record.is_empty() { None } else { Some(record) })
    }

    async fn apply(&self, guards: &[RecordGuard], ops: Vec<StoreOp>) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let commands = self.translate(&ops);

        if guards.is_empty() {
            if !commands.is_empty() {
                transaction(&commands)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
            return Ok(true);
        }

        if let Some(script) = &self.guarded_apply {
            let mut invocation = script.prepare_invoke();
            invocation.arg(guards.len());
            for guard in guards {
                invocation.key(self.keys.job(guard.job_id()));
                match guard {
                    RecordGuard::Absent { .. } => invocation.arg("absent").arg("").arg(""),
                    RecordGuard::Unchanged {
                        status, updated_at, ..
                    } => invocation.arg("unchanged").arg(status).arg(updated_at),
                };
            }
            for command in &commands {
                invocation.arg(command.len());
                for part in command {
                    invocation.arg(part);
                }
            }
            let applied: i64 = invocation.invoke_async(&mut conn).await?;
            return Ok(applied == 1);
        }

        for guard in guards {
            let record: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(self.keys.job(guard.job_id()))
                .query_async(&mut conn)
                .await?;
            let record = (!record.is_empty()).then_some(&record);
            if !guard.matches(record) {
                return Ok(false);
            }
        }
        if !commands.is_empty() {
            transaction(&commands)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(true)
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        self.claim.claim(&mut conn, &self.keys, request).await
    }

    async fn pending_count(&self, model_id: Option<&str>) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let key = match model_id {
            Some(model_id) => self.keys.pending_for(model_id),
            None => self.keys.pending(),
        };
        Ok(conn.zcard(key).await?)
    }

    async fn delayed_count(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.zcard(self.keys.delayed()).await?)
    }

    async fn active_count(&self, model_id: Option<&str>) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let key = match model_id {
            Some(model_id) => self.keys.active_for(model_id),
            None => self.keys.active(),
        };
        Ok(conn.scard(key).await?)
    }

    async fn active_ids(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let mut ids: Vec<String> = conn.smembers(self.keys.active()).await?;
        ids.sort();
        Ok(ids)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        Ok(conn
            .lrange(self.keys.dead_letter(), 0, limit as isize - 1)
            .await?)
    }

    async fn dead_letter_len(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(self.keys.dead_letter()).await?)
    }

    async fn models(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let mut models: Vec<String> = conn.smembers(self.keys.models()).await?;
        models.sort();
        Ok(models)
    }

    async fn counters(&self) -> Result<CounterSnapshot, QueueError> {
        let mut conn = self.redis.clone();
        let keys: Vec<String> = Counter::ALL.iter().map(|c| self.keys.counter(*c)).collect();
        let values: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        Ok(CounterSnapshot(
            Counter::ALL
                .iter()
                .zip(values)
                .map(|(counter, value)| (*counter, value.unwrap_or(0)))
                .collect(),
        ))
    }
}
