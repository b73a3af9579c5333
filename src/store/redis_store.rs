use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use crate::error::StoreError;
use crate::store::{CoordinationStore, CounterValue};

// KEYS[1] = lock key, ARGV[1] = expected owner
const DELETE_IF_EQUALS: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

// KEYS[1] = lock key, ARGV[1] = expected owner, ARGV[2] = ttl in ms
const EXPIRE_IF_EQUALS: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("PEXPIRE", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

// Returns the remaining count, -1 when the key is missing and -2 when the
// stored value was not a plain integer (the key is deleted in that case).
const DECREMENT_COUNTER: &str = r#"
    local current = redis.call("GET", KEYS[1])
    if current == false then
        return -1
    end
    if not string.match(current, "^%-?%d+$") then
        redis.call("DEL", KEYS[1])
        return -2
    end
    local val = redis.call("DECR", KEYS[1])
    if val <= 0 then
        redis.call("DEL", KEYS[1])
        return 0
    end
    return val
"#;

// Redis reads negative ranks from the end, so huge offsets must not wrap.
fn rank(position: usize) -> isize {
    isize::try_from(position).unwrap_or(isize::MAX)
}

/// Coordination store backed by a Redis server shared by every node.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::new(client))
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        // Explicit MGET: a single-key call must still come back as an array.
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn.pset_ex(key, value, millis(ttl)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = redis::Script::new(DELETE_IF_EQUALS)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let renewed: i64 = redis::Script::new(EXPIRE_IF_EQUALS)
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: usize = conn.del(keys).await?;
        Ok(removed)
    }

    async fn push_head(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.lpush(list, value).await?;
        Ok(())
    }

    async fn pop_tail(&self, list: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.rpop(list, None).await?;
        Ok(value)
    }

    async fn pop_tail_push_head(&self, source: &str, destination: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.rpoplpush(source, destination).await?;
        Ok(value)
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        let removed: usize = conn.lrem(list, 1, value).await?;
        Ok(removed)
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.sadd(set, member).await?;
        Ok(())
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.srem(set, member).await?;
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let mut members: Vec<String> = conn.smembers(set).await?;
        members.sort();
        Ok(members)
    }

    async fn index_put(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(index, member, score).await?;
        Ok(())
    }

    async fn index_range_desc(&self, index: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.zrevrange(index, rank(start), rank(stop)).await?;
        Ok(members)
    }

    async fn index_range_asc(&self, index: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.zrange(index, rank(start), rank(stop)).await?;
        Ok(members)
    }

    async fn index_remove(&self, index: &str, members: &[String]) -> Result<usize, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: usize = conn.zrem(index, members).await?;
        Ok(removed)
    }

    async fn index_len(&self, index: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        let len: usize = conn.zcard(index).await?;
        Ok(len)
    }

    async fn decrement_counter(&self, key: &str) -> Result<CounterValue, StoreError> {
        let mut conn = self.conn().await?;
        let val: i64 = redis::Script::new(DECREMENT_COUNTER)
            .key(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(match val {
            -1 => CounterValue::Absent,
            v if v < 0 => CounterValue::Corrupt,
            v => CounterValue::Remaining(v as u64),
        })
    }
}
