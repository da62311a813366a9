//! Redis-backed coordination store.
//!
//! Layout per batch (all keys share the `{batch_id}` hash tag so a batch lives
//! on one cluster slot):
//!
//! - `meta`      hash: `total_count`, `created_at_ms`, `state`
//! - `pending`   list of claimable combination ids
//! - `combos`    hash: id -> combination JSON
//! - `attempts`  hash: id -> attempt count
//! - `leases`    hash: id -> `worker_id|lease_id`
//! - `expiry`    zset: id scored by lease expiry (unix millis, Redis clock)
//! - `completed` set of acknowledged ids
//! - `dead`      hash: id -> dead-letter record JSON
//! - `counters`  hash: `completed`, `failed`, `dead_lettered`, `retried`
//!
//! Every mutation is one Lua script, so it is atomic with respect to all other
//! workers. Lease timestamps come from `TIME` inside the script, which keeps
//! lease arithmetic on a single clock regardless of worker clock skew.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use simian_models::{
    new_lease_id, owner_token, Batch, BatchId, BatchState, BatchStatus, ClaimedCombination,
    Combination, CombinationId, DeadLetter, Lease, WorkerId,
};

use crate::error::{QueueError, QueueResult};
use crate::store::{AckOutcome, CoordinationStore, ReleaseOutcome, SweepReport};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "simian";

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'total_count', ARGV[1], 'created_at_ms', ARGV[2], 'state', 'seeding')
return 1
"#;

const SEED_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'seeding' then
    return -1
end
local n = 0
for i = 1, #ARGV, 2 do
    redis.call('RPUSH', KEYS[2], ARGV[i])
    redis.call('HSET', KEYS[3], ARGV[i], ARGV[i + 1])
    redis.call('HSET', KEYS[4], ARGV[i], 0)
    n = n + 1
end
return n
"#;

const READY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'seeding' then
    return -1
end
if redis.call('LLEN', KEYS[2]) ~= tonumber(redis.call('HGET', KEYS[1], 'total_count')) then
    return 0
end
redis.call('HSET', KEYS[1], 'state', 'ready')
return 1
"#;

const INVALIDATE_SCRIPT: &str = r#"
for i = 2, #KEYS do
    redis.call('DEL', KEYS[i])
end
if redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('HSET', KEYS[1], 'state', 'invalid')
end
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'ready' then
    return false
end
local id = redis.call('LPOP', KEYS[2])
if not id then
    return false
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local exp = now + tonumber(ARGV[2])
redis.call('HSET', KEYS[3], id, ARGV[1])
redis.call('ZADD', KEYS[4], exp, id)
local payload = redis.call('HGET', KEYS[5], id)
local attempts = redis.call('HGET', KEYS[6], id) or '0'
return {id, payload, tostring(attempts), tostring(now), tostring(exp)}
"#;

const RENEW_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
    return false
end
local current = tonumber(redis.call('ZSCORE', KEYS[2], ARGV[1]))
if not current or current <= now then
    return false
end
local exp = now + tonumber(ARGV[3])
redis.call('ZADD', KEYS[2], exp, ARGV[1])
return tostring(exp)
"#;

const RELEASE_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local id = ARGV[1]
if redis.call('HGET', KEYS[1], id) ~= ARGV[2] then
    return {'lost', '0'}
end
local current = tonumber(redis.call('ZSCORE', KEYS[2], id))
if not current or current <= now then
    return {'lost', '0'}
end
redis.call('HDEL', KEYS[1], id)
redis.call('ZREM', KEYS[2], id)
local n = redis.call('HINCRBY', KEYS[4], id, 1)
if n > tonumber(ARGV[3]) then
    local payload = redis.call('HGET', KEYS[7], id)
    redis.call('HSET', KEYS[6], id, cjson.encode({reason = ARGV[4], at_ms = now, attempts = n, payload = payload}))
    redis.call('HINCRBY', KEYS[5], 'failed', 1)
    redis.call('HINCRBY', KEYS[5], 'dead_lettered', 1)
    return {'dead', tostring(n)}
end
redis.call('RPUSH', KEYS[3], id)
redis.call('HINCRBY', KEYS[5], 'retried', 1)
return {'requeued', tostring(n)}
"#;

const ACK_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local id = ARGV[1]
if redis.call('HGET', KEYS[1], id) ~= ARGV[2] then
    return 0
end
local current = tonumber(redis.call('ZSCORE', KEYS[2], id))
if not current or current <= now then
    return 0
end
redis.call('HDEL', KEYS[1], id)
redis.call('ZREM', KEYS[2], id)
redis.call('SADD', KEYS[3], id)
redis.call('HINCRBY', KEYS[4], 'completed', 1)
redis.call('HDEL', KEYS[5], id)
redis.call('HDEL', KEYS[6], id)
return 1
"#;

const SWEEP_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, tonumber(ARGV[2]))
local requeued = 0
local dead = 0
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('HDEL', KEYS[2], id)
    local n = redis.call('HINCRBY', KEYS[4], id, 1)
    if n > tonumber(ARGV[1]) then
        local payload = redis.call('HGET', KEYS[7], id)
        redis.call('HSET', KEYS[6], id, cjson.encode({reason = 'lease expired', at_ms = now, attempts = n, payload = payload}))
        redis.call('HINCRBY', KEYS[5], 'failed', 1)
        redis.call('HINCRBY', KEYS[5], 'dead_lettered', 1)
        dead = dead + 1
    else
        redis.call('RPUSH', KEYS[3], id)
        redis.call('HINCRBY', KEYS[5], 'retried', 1)
        requeued = requeued + 1
    end
end
return {requeued, dead}
"#;

/// Redis key names for one batch.
#[derive(Debug, Clone)]
pub struct BatchKeys {
    pub meta: String,
    pub pending: String,
    pub combos: String,
    pub attempts: String,
    pub leases: String,
    pub expiry: String,
    pub completed: String,
    pub dead: String,
    pub counters: String,
}

impl BatchKeys {
    pub fn new(prefix: &str, batch_id: &BatchId) -> Self {
        let key = |suffix: &str| format!("{}:{{{}}}:{}", prefix, batch_id, suffix);
        Self {
            meta: key("meta"),
            pending: key("pending"),
            combos: key("combos"),
            attempts: key("attempts"),
            leases: key("leases"),
            expiry: key("expiry"),
            completed: key("completed"),
            dead: key("dead"),
            counters: key("counters"),
        }
    }
}

struct Scripts {
    create: Script,
    seed: Script,
    ready: Script,
    invalidate: Script,
    claim: Script,
    renew: Script,
    release: Script,
    ack: Script,
    sweep: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            create: Script::new(CREATE_SCRIPT),
            seed: Script::new(SEED_SCRIPT),
            ready: Script::new(READY_SCRIPT),
            invalidate: Script::new(INVALIDATE_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            sweep: Script::new(SWEEP_SCRIPT),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeadRecord {
    reason: String,
    at_ms: i64,
    attempts: u32,
    #[serde(default)]
    payload: Option<String>,
}

/// Coordination store client backed by Redis.
pub struct RedisStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    prefix: String,
    scripts: Scripts,
}

impl RedisStore {
    /// Create a new store client. The connection is opened on first use.
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            prefix: prefix.into(),
            scripts: Scripts::load(),
        })
    }

    /// Key names for a batch.
    pub fn keys(&self, batch_id: &BatchId) -> BatchKeys {
        BatchKeys::new(&self.prefix, batch_id)
    }

    async fn conn(&self) -> QueueResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await.map_err(|e| {
                    QueueError::store_unavailable(format!("Redis connection failed: {}", e))
                })?;
                info!("Connected to coordination store");
                Ok::<_, QueueError>(manager)
            })
            .await?;
        Ok(conn.clone())
    }
}

fn millis_to_datetime(ms: i64) -> QueueResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::corrupt(format!("timestamp out of range: {}", ms)))
}

fn parse_u64(value: &str, what: &str) -> QueueResult<u64> {
    value
        .parse()
        .map_err(|_| QueueError::corrupt(format!("{} is not a number: {}", what, value)))
}

fn parse_batch(batch_id: &BatchId, meta: &HashMap<String, String>) -> QueueResult<Batch> {
    let total = meta
        .get("total_count")
        .ok_or_else(|| QueueError::corrupt(format!("batch {} has no total_count", batch_id)))?;
    let created = meta
        .get("created_at_ms")
        .ok_or_else(|| QueueError::corrupt(format!("batch {} has no created_at_ms", batch_id)))?;
    let created_ms = created
        .parse()
        .map_err(|_| QueueError::corrupt(format!("bad created_at_ms: {}", created)))?;

    Ok(Batch {
        batch_id: batch_id.clone(),
        total_count: parse_u64(total, "total_count")?,
        created_at: millis_to_datetime(created_ms)?,
    })
}

fn parse_state(meta: &HashMap<String, String>) -> QueueResult<BatchState> {
    let raw = meta.get("state").map(String::as_str).unwrap_or("seeding");
    BatchState::parse(raw).ok_or_else(|| QueueError::corrupt(format!("unknown batch state: {}", raw)))
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn create_batch(&self, batch: &Batch) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let keys = self.keys(&batch.batch_id);

        let created: i64 = self
            .scripts
            .create
            .key(&keys.meta)
            .arg(batch.total_count)
            .arg(batch.created_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(created == 1)
    }

    async fn seed(&self, batch_id: &BatchId, combinations: &[Combination]) -> QueueResult<()> {
        if combinations.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let keys = self.keys(batch_id);

        let mut invocation = self.scripts.seed.prepare_invoke();
        invocation
            .key(&keys.meta)
            .key(&keys.pending)
            .key(&keys.combos)
            .key(&keys.attempts);
        for combination in combinations {
            invocation
                .arg(combination.id.as_str())
                .arg(serde_json::to_string(combination)?);
        }

        let pushed: i64 = invocation.invoke_async(&mut conn).await?;
        if pushed < 0 {
            return Err(QueueError::batch_init(format!(
                "batch {} is no longer seeding",
                batch_id
            )));
        }

        debug!(batch_id = %batch_id, pushed, "Seeded combination chunk");
        Ok(())
    }

    async fn mark_ready(&self, batch_id: &BatchId) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let keys = self.keys(batch_id);

        let result: i64 = self
            .scripts
            .ready
            .key(&keys.meta)
            .key(&keys.pending)
            .invoke_async(&mut conn)
            .await?;

        match result {
            1 => Ok(()),
            0 => Err(QueueError::batch_init(format!(
                "batch {} pending count does not match total_count",
                batch_id
            ))),
            _ => Err(QueueError::batch_init(format!("batch {} is not seeding", batch_id))),
        }
    }

    async fn invalidate(&self, batch_id: &BatchId) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let keys = self.keys(batch_id);

        let _: i64 = self
            .scripts
            .invalidate
            .key(&keys.meta)
            .key(&keys.pending)
            .key(&keys.combos)
            .key(&keys.attempts)
            .key(&keys.leases)
            .key(&keys.expiry)
            .key(&keys.completed)
            .key(&keys.dead)
            .key(&keys.counters)
            .invoke_async(&mut conn)
            .await?;

        warn!(batch_id = %batch_id, "Batch invalidated");
        Ok(())
    }

    async fn batch(&self, batch_id: &BatchId) -> QueueResult<Option<Batch>> {
        let mut conn = self.conn().await?;
        let keys = self.keys(batch_id);

        let meta: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&keys.meta)
            .query_async(&mut conn)
            .await?;

        if meta.is_empty() {
            return Ok(None);
        }
        parse_batch(batch_id, &meta).map(Some)
    }

    async fn claim(
        &self,
        batch_id: &BatchId,
        worker_id: &WorkerId,
        lease_duration: Duration,
    ) -> QueueResult<Option<ClaimedCombination>> {
        let mut conn = self.conn().await?;
        let keys = self.keys(batch_id);
        let lease_id = new_lease_id();

        let reply: Option<Vec<String>> = self
            .scripts
            .claim
            .key(&keys.meta)
            .key(&keys.pending)
            .key(&keys.leases)
            .key(&keys.expiry)
            .key(&keys.combos)
            .key(&keys.attempts)
            .arg(owner_token(worker_id, &lease_id))
            .arg(lease_duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        let Some(fields) = reply else {
            return Ok(None);
        };
        let [id, payload, attempts, acquired_ms, expires_ms] = <[String; 5]>::try_from(fields)
            .map_err(|f| QueueError::corrupt(format!("unexpected claim reply: {:?}", f)))?;

        let mut combination: Combination = serde_json::from_str(&payload)?;
        combination.attempt_count = parse_u64(&attempts, "attempt count")? as u32;

        let lease = Lease {
            batch_id: batch_id.clone(),
            combination_id: CombinationId::from(id),
            worker_id: worker_id.clone(),
            lease_id,
            acquired_at: millis_to_datetime(parse_u64(&acquired_ms, "acquired_at")? as i64)?,
            expires_at: millis_to_datetime(parse_u64(&expires_ms, "expires_at")? as i64)?,
        };

        debug!(
            batch_id = %batch_id,
            combination_id = %lease.combination_id,
            worker_id = %worker_id,
            "Claimed combination"
        );
        Ok(Some(ClaimedCombination { combination, lease }))
    }

    async fn renew(&self, lease: &Lease, lease_duration: Duration) -> QueueResult<Option<Lease>> {
        let mut conn = self.conn().await?;
        let keys = self.keys(&lease.batch_id);

        let reply: Option<String> = self
            .scripts
            .renew
            .key(&keys.leases)
            .key(&keys.expiry)
            .arg(lease.combination_id.as_str())
            .arg(lease.owner_token())
            .arg(lease_duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        match reply {
            Some(expires_ms) => {
                let mut renewed = lease.clone();
                renewed.expires_at = millis_to_datetime(parse_u64(&expires_ms, "expires_at")? as i64)?;
                Ok(Some(renewed))
            }
            None => Ok(None),
        }
    }

    async fn release(&self, lease: &Lease, reason: &str, max_attempts: u32) -> QueueResult<ReleaseOutcome> {
        let mut conn = self.conn().await?;
        let keys = self.keys(&lease.batch_id);

        let reply: Vec<String> = self
            .scripts
            .release
            .key(&keys.leases)
            .key(&keys.expiry)
            .key(&keys.pending)
            .key(&keys.attempts)
            .key(&keys.counters)
            .key(&keys.dead)
            .key(&keys.combos)
            .arg(lease.combination_id.as_str())
            .arg(lease.owner_token())
            .arg(max_attempts)
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;

        let (kind, count) = match reply.as_slice() {
            [kind, count] => (kind.as_str(), parse_u64(count, "attempt count")? as u32),
            other => return Err(QueueError::corrupt(format!("unexpected release reply: {:?}", other))),
        };

        match kind {
            "requeued" => Ok(ReleaseOutcome::Requeued { attempt_count: count }),
            "dead" => Ok(ReleaseOutcome::DeadLettered { attempt_count: count }),
            "lost" => Ok(ReleaseOutcome::LeaseLost),
            other => Err(QueueError::corrupt(format!("unexpected release outcome: {}", other))),
        }
    }

    async fn acknowledge(&self, lease: &Lease) -> QueueResult<AckOutcome> {
        let mut conn = self.conn().await?;
        let keys = self.keys(&lease.batch_id);

        let acked: i64 = self
            .scripts
            .ack
            .key(&keys.leases)
            .key(&keys.expiry)
            .key(&keys.completed)
            .key(&keys.counters)
            .key(&keys.combos)
            .key(&keys.attempts)
            .arg(lease.combination_id.as_str())
            .arg(lease.owner_token())
            .invoke_async(&mut conn)
            .await?;

        Ok(if acked == 1 {
            AckOutcome::Acknowledged
        } else {
            AckOutcome::LeaseLost
        })
    }

    async fn requeue_expired(
        &self,
        batch_id: &BatchId,
        max_attempts: u32,
        limit: usize,
    ) -> QueueResult<SweepReport> {
        let mut conn = self.conn().await?;
        let keys = self.keys(batch_id);

        let reply: Vec<u64> = self
            .scripts
            .sweep
            .key(&keys.expiry)
            .key(&keys.leases)
            .key(&keys.pending)
            .key(&keys.attempts)
            .key(&keys.counters)
            .key(&keys.dead)
            .key(&keys.combos)
            .arg(max_attempts)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [requeued, dead_lettered] => Ok(SweepReport {
                requeued: *requeued,
                dead_lettered: *dead_lettered,
            }),
            other => Err(QueueError::corrupt(format!("unexpected sweep reply: {:?}", other))),
        }
    }

    async fn status(&self, batch_id: &BatchId) -> QueueResult<BatchStatus> {
        let mut conn = self.conn().await?;
        let keys = self.keys(batch_id);

        let (meta, pending, in_progress, counters): (
            HashMap<String, String>,
            u64,
            u64,
            HashMap<String, u64>,
        ) = redis::pipe()
            .atomic()
            .hgetall(&keys.meta)
            .llen(&keys.pending)
            .hlen(&keys.leases)
            .hgetall(&keys.counters)
            .query_async(&mut conn)
            .await?;

        if meta.is_empty() {
            return Err(QueueError::BatchNotFound(batch_id.clone()));
        }

        let batch = parse_batch(batch_id, &meta)?;
        let counter = |name: &str| counters.get(name).copied().unwrap_or(0);

        Ok(BatchStatus {
            total: batch.total_count,
            pending,
            in_progress,
            completed: counter("completed"),
            failed: counter("failed"),
            dead_lettered: counter("dead_lettered"),
            retried: counter("retried"),
            state: parse_state(&meta)?,
        })
    }

    async fn dead_letters(&self, batch_id: &BatchId) -> QueueResult<Vec<DeadLetter>> {
        let mut conn = self.conn().await?;
        let keys = self.keys(batch_id);

        let records: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&keys.dead)
            .query_async(&mut conn)
            .await?;

        let mut letters = Vec::with_capacity(records.len());
        for (id, raw) in records {
            let record: DeadRecord = serde_json::from_str(&raw)?;
            let mut combination = match record.payload.as_deref() {
                Some(payload) => serde_json::from_str(payload)?,
                None => Combination::new(id.as_str(), Default::default()),
            };
            combination.attempt_count = record.attempts;

            letters.push(DeadLetter {
                combination,
                reason: record.reason,
                dead_lettered_at: millis_to_datetime(record.at_ms)?,
            });
        }

        letters.sort_by(|a, b| a.combination.id.cmp(&b.combination.id));
        Ok(letters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_keys_share_hash_tag() {
        let keys = BatchKeys::new("simian", &BatchId::from("b1"));
        assert_eq!(keys.meta, "simian:{b1}:meta");
        assert_eq!(keys.pending, "simian:{b1}:pending");
        assert_eq!(keys.expiry, "simian:{b1}:expiry");
        assert_eq!(keys.counters, "simian:{b1}:counters");
    }

    #[test]
    fn test_parse_batch_meta() {
        let mut meta = HashMap::new();
        meta.insert("total_count".to_string(), "5".to_string());
        meta.insert("created_at_ms".to_string(), "1700000000000".to_string());
        meta.insert("state".to_string(), "ready".to_string());

        let batch = parse_batch(&BatchId::from("b1"), &meta).unwrap();
        assert_eq!(batch.total_count, 5);
        assert_eq!(batch.created_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(parse_state(&meta).unwrap(), BatchState::Ready);
    }

    #[test]
    fn test_parse_batch_meta_rejects_missing_fields() {
        let meta = HashMap::new();
        assert!(matches!(
            parse_batch(&BatchId::from("b1"), &meta),
            Err(QueueError::Corrupt(_))
        ));
    }

    #[test]
    fn test_dead_record_parses_lua_json() {
        let raw = r#"{"reason":"render failed","at_ms":1700000000000,"attempts":3,"payload":"{\"id\":\"4\",\"parameters\":{}}"}"#;
        let record: DeadRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.reason, "render failed");
        let combination: Combination = serde_json::from_str(record.payload.as_deref().unwrap()).unwrap();
        assert_eq!(combination.id.as_str(), "4");
    }
}
