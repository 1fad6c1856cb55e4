//! Typed key-value store over Redis.
//!
//! [`KvStore`] is the single seam between the control plane and Redis. The
//! production implementation is [`RedisKvStore`] over a
//! `redis::aio::ConnectionManager` (which reconnects on disconnect); tests use
//! `MemoryKvStore` from `kernel::test_dependencies`.
//!
//! Every key is namespaced with the process-wide `key_prefix` inside the
//! implementation; callers pass domain-level keys (`jobs:queue`,
//! `cache:instances:<id>`, ...) and never see the prefix. `scan` strips the
//! prefix from returned keys for the same reason.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::FromRedisValue;

/// A single command in a pipelined batch.
#[derive(Debug, Clone)]
pub enum PipelineCommand {
    Get { key: String },
    Set { key: String, value: Vec<u8>, ttl: Option<Duration> },
    Del { key: String },
    Exists { key: String },
}

/// Reply for one pipelined command.
#[derive(Debug, Clone)]
pub enum PipelineReply {
    Value(Option<Vec<u8>>),
    Bool(bool),
    Unit,
}

/// Per-op outcome of a pipelined batch; errors are collected, not raised.
pub type PipelineResult = std::result::Result<PipelineReply, String>;

/// Key-value store contract (Redis-flavored, transport opaque).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;
    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Set the key only if absent. Returns whether the write won.
    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    /// Remaining time to live. `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    // Hash operations
    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()>;
    /// Set a hash field only if absent. Returns whether the write won.
    async fn hset_nx(&self, key: &str, field: &str, value: Vec<u8>) -> Result<bool>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
    async fn hlen(&self, key: &str) -> Result<u64>;

    // Sorted-set operations
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    /// Members ordered by descending score, inclusive index range.
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    /// Members with `min <= score <= max`, ascending.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// Cursor-based namespace iteration (used in place of KEYS).
    async fn scan(&self, cursor: u64, pattern: &str, count: usize)
        -> Result<(u64, Vec<String>)>;

    /// Submit a batch of commands in one round trip. Per-op errors are
    /// returned in the result vector rather than failing the batch.
    async fn pipeline(&self, commands: Vec<PipelineCommand>) -> Result<Vec<PipelineResult>>;
}

/// Redis-backed [`KvStore`] over a reconnecting connection manager.
pub struct RedisKvStore {
    conn: ConnectionManager,
    key_prefix: String,
    command_timeout: Duration,
}

impl RedisKvStore {
    /// Connect to Redis and build the store. The initial connection is
    /// retried `retry_attempts` times; once connected, the connection
    /// manager reconnects by itself on later disconnects.
    pub async fn connect(
        url: &str,
        key_prefix: String,
        connection_timeout: Duration,
        command_timeout: Duration,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;

        let mut last_error = None;
        for attempt in 0..=retry_attempts {
            if attempt > 0 {
                tracing::warn!(attempt, "retrying Redis connection");
                tokio::time::sleep(retry_delay).await;
            }
            match tokio::time::timeout(connection_timeout, client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    return Ok(Self {
                        conn,
                        key_prefix,
                        command_timeout,
                    })
                }
                Ok(Err(e)) => last_error = Some(anyhow::Error::new(e)),
                Err(_) => last_error = Some(anyhow::anyhow!("Redis connection timed out")),
            }
        }
        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Redis connection failed"))
            .context("failed to connect to Redis"))
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.key_prefix).unwrap_or(key)
    }

    /// Run a Redis command with the configured command timeout.
    async fn run<T: FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        let result = tokio::time::timeout(self.command_timeout, cmd.query_async::<T>(&mut conn))
            .await
            .context("Redis command timed out")?
            .context("Redis command failed")?;
        Ok(result)
    }
}

/// Format a score bound for ZRANGEBYSCORE, handling infinities.
fn score_bound(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.prefixed(key));
        self.run(cmd).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: redis::Value = self.run(cmd).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.prefixed(key));
        let removed: u64 = self.run(cmd).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(self.prefixed(key));
        self.run(cmd).await
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64);
        let reply: Option<String> = self.run(cmd).await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(self.prefixed(key)).arg(ttl.as_millis() as u64);
        self.run(cmd).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(self.prefixed(key));
        let millis: i64 = self.run(cmd).await?;
        // -2 = missing key, -1 = no expiry
        if millis < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(millis as u64)))
        }
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.prefixed(key)).arg(field).arg(value);
        let _: redis::Value = self.run(cmd).await?;
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: Vec<u8>) -> Result<bool> {
        let mut cmd = redis::cmd("HSETNX");
        cmd.arg(self.prefixed(key)).arg(field).arg(value);
        self.run(cmd).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(self.prefixed(key)).arg(field);
        self.run(cmd).await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(self.prefixed(key));
        self.run(cmd).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(self.prefixed(key)).arg(field);
        let removed: u64 = self.run(cmd).await?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let mut cmd = redis::cmd("HLEN");
        cmd.arg(self.prefixed(key));
        self.run(cmd).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(self.prefixed(key)).arg(score).arg(member);
        let _: redis::Value = self.run(cmd).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(self.prefixed(key)).arg(member);
        let removed: u64 = self.run(cmd).await?;
        Ok(removed > 0)
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("ZREVRANGE");
        cmd.arg(self.prefixed(key)).arg(start).arg(stop);
        self.run(cmd).await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(self.prefixed(key))
            .arg(score_bound(min))
            .arg(score_bound(max));
        self.run(cmd).await
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(self.prefixed(key));
        self.run(cmd).await
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
        cmd.arg(self.prefixed(key))
            .arg(score_bound(min))
            .arg(score_bound(max));
        self.run(cmd).await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut cmd = redis::cmd("ZSCORE");
        cmd.arg(self.prefixed(key)).arg(member);
        self.run(cmd).await
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(self.prefixed(pattern))
            .arg("COUNT")
            .arg(count);
        let (next, keys): (u64, Vec<String>) = self.run(cmd).await?;
        let keys = keys
            .iter()
            .map(|k| self.strip_prefix(k).to_string())
            .collect();
        Ok((next, keys))
    }

    async fn pipeline(&self, commands: Vec<PipelineCommand>) -> Result<Vec<PipelineResult>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for command in &commands {
            match command {
                PipelineCommand::Get { key } => {
                    pipe.cmd("GET").arg(self.prefixed(key));
                }
                PipelineCommand::Set { key, value, ttl } => {
                    pipe.cmd("SET").arg(self.prefixed(key)).arg(value.as_slice());
                    if let Some(ttl) = ttl {
                        pipe.arg("PX").arg(ttl.as_millis() as u64);
                    }
                }
                PipelineCommand::Del { key } => {
                    pipe.cmd("DEL").arg(self.prefixed(key));
                }
                PipelineCommand::Exists { key } => {
                    pipe.cmd("EXISTS").arg(self.prefixed(key));
                }
            }
        }

        let mut conn = self.conn.clone();
        let values: Vec<redis::Value> =
            tokio::time::timeout(self.command_timeout, pipe.query_async(&mut conn))
                .await
                .context("Redis pipeline timed out")?
                .context("Redis pipeline failed")?;

        let results = commands
            .iter()
            .zip(values.iter())
            .map(|(command, value)| match command {
                PipelineCommand::Get { .. } => Option::<Vec<u8>>::from_redis_value(value)
                    .map(PipelineReply::Value)
                    .map_err(|e| e.to_string()),
                PipelineCommand::Set { .. } => String::from_redis_value(value)
                    .map(|_| PipelineReply::Unit)
                    .map_err(|e| e.to_string()),
                PipelineCommand::Del { .. } | PipelineCommand::Exists { .. } => {
                    u64::from_redis_value(value)
                        .map(|n| PipelineReply::Bool(n > 0))
                        .map_err(|e| e.to_string())
                }
            })
            .collect();

        Ok(results)
    }
}
