//! Redis store backend.
//!
//! Single commands map one-to-one onto Redis commands. Unguarded batches run
//! as a `MULTI`/`EXEC` transaction. Guarded batches run as one Lua script so
//! the removal check and the writes that depend on it happen atomically.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{Batch, Guard, Op, Store, StoreError};

/// Executes a guarded batch.
///
/// `KEYS[1]` is the guard key, followed by one key per op. `ARGV` starts with
/// the guard kind and guard member, followed by the encoded ops.
const GUARDED_BATCH_SCRIPT: &str = r#"
local i = 3
local k = 2
local removed
if ARGV[1] == 'zrem' then
  removed = redis.call('ZREM', KEYS[1], ARGV[2])
else
  removed = redis.call('LREM', KEYS[1], 1, ARGV[2])
end
if removed == 0 then
  return 0
end
while i <= #ARGV do
  local op = ARGV[i]
  if op == 'rpush' then
    redis.call('RPUSH', KEYS[k], ARGV[i + 1])
    i = i + 2
  elseif op == 'zadd' then
    redis.call('ZADD', KEYS[k], ARGV[i + 1], ARGV[i + 2])
    i = i + 3
  elseif op == 'setex' then
    redis.call('SET', KEYS[k], ARGV[i + 2], 'EX', ARGV[i + 1])
    i = i + 3
  elseif op == 'del' then
    redis.call('DEL', KEYS[k])
    i = i + 1
  else
    return redis.error_reply('unknown batch op: ' .. op)
  end
  k = k + 1
end
return 1
"#;

/// Store backend over a shared Redis connection.
///
/// The connection manager reconnects automatically and is cheap to clone,
/// so one `RedisStore` can be shared by every worker in the process.
pub struct RedisStore {
    redis: ConnectionManager,
    guarded_batch: Script,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Connection` if the URL is invalid or the server
    /// is unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self::from_connection(redis))
    }

    /// Wraps an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            guarded_batch: Script::new(GUARDED_BATCH_SCRIPT),
        }
    }

    async fn exec_transaction(&self, ops: &[Op]) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                Op::PushBack { key, value } => {
                    pipe.rpush(key, value).ignore();
                }
                Op::ZAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                Op::SetEx {
                    key,
                    value,
                    ttl_secs,
                } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("EX")
                        .arg(*ttl_secs)
                        .ignore();
                }
                Op::Del { key } => {
                    pipe.del(key).ignore();
                }
            }
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn exec_guarded(&self, guard: &Guard, ops: &[Op]) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let mut invocation = self.guarded_batch.prepare_invoke();

        match guard {
            Guard::ZRem { key, member } => invocation.key(key).arg("zrem").arg(member),
            Guard::LRem { key, value } => invocation.key(key).arg("lrem").arg(value),
        };

        for op in ops {
            invocation.key(op.key());
            match op {
                Op::PushBack { value, .. } => invocation.arg("rpush").arg(value),
                Op::ZAdd { member, score, .. } => {
                    invocation.arg("zadd").arg(*score).arg(member)
                }
                Op::SetEx {
                    value, ttl_secs, ..
                } => invocation.arg("setex").arg(*ttl_secs).arg(value),
                Op::Del { .. } => invocation.arg("del"),
            };
        }

        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Script(e.to_string()))?;
        Ok(applied == 1)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.rpush(key, value).await?;
        Ok(len)
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = redis::cmd("LPOP").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(values)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zpop_max(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let mut conn = self.redis.clone();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMAX")
            .arg(key)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(popped.into_iter().next())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(score_bound(min)).arg(score_bound(max));
        if let Some(count) = limit {
            cmd.arg("LIMIT").arg(0).arg(count);
        }
        let members: Vec<String> = cmd.query_async(&mut conn).await?;
        Ok(members)
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(key).await?;
        Ok(len)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn del(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(keys.to_vec()).await?;
        Ok(())
    }

    async fn exec(&self, batch: Batch) -> Result<bool, StoreError> {
        match &batch.guard {
            Some(guard) => self.exec_guarded(guard, &batch.ops).await,
            None if batch.ops.is_empty() => Ok(true),
            None => {
                self.exec_transaction(&batch.ops).await?;
                Ok(true)
            }
        }
    }
}

/// Formats a score bound the way `ZRANGEBYSCORE` expects infinities.
fn score_bound(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_bound() {
        assert_eq!(score_bound(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_bound(f64::INFINITY), "+inf");
        assert_eq!(score_bound(1_700_000_000_000.0), "1700000000000");
    }

    #[test]
    fn test_script_handles_every_op() {
        for op in ["rpush", "zadd", "setex", "del"] {
            assert!(GUARDED_BATCH_SCRIPT.contains(&format!("'{}'", op)));
        }
    }
}
