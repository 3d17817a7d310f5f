use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::store::{JobStore, StoreOp, StoreResult};

/// [`JobStore`] on a shared Redis instance.
///
/// Batches run inside `MULTI`/`EXEC`, so several managers can share one
/// Redis safely; `BLPOP` hands each pending id to exactly one caller.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        tracing::info!(url, "Connected to Redis job store");
        Ok(Self { client, conn })
    }

    fn add_op(pipe: &mut redis::Pipeline, op: StoreOp) {
        match op {
            StoreOp::Set { key, value, ttl } => {
                let cmd = pipe.cmd("SET").arg(key).arg(value);
                if let Some(ttl) = ttl {
                    // Redis rejects EX 0
                    cmd.arg("EX").arg(ttl.as_secs().max(1));
                }
            }
            StoreOp::Delete { key } => {
                pipe.cmd("DEL").arg(key);
            }
            StoreOp::PushBack { list, value } => {
                pipe.cmd("RPUSH").arg(list).arg(value);
            }
            StoreOp::PushFront { list, value } => {
                pipe.cmd("LPUSH").arg(list).arg(value);
            }
            StoreOp::Trim { list, start, stop } => {
                pipe.cmd("LTRIM").arg(list).arg(start).arg(stop);
            }
            StoreOp::SetAdd { set, member } => {
                pipe.cmd("SADD").arg(set).arg(member);
            }
            StoreOp::SetRemove { set, member } => {
                pipe.cmd("SREM").arg(set).arg(member);
            }
        }
        pipe.ignore();
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn pop_front(&self, list: &str, timeout: Duration) -> StoreResult<Option<String>> {
        if timeout.is_zero() {
            let mut conn = self.conn.clone();
            let value: Option<String> = redis::cmd("LPOP").arg(list).query_async(&mut conn).await?;
            return Ok(value);
        }
        // BLPOP parks the connection it runs on; keep it off the shared one.
        let mut blocking = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(list)
            .arg(timeout.as_secs_f64())
            .query_async(&mut blocking)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn list_len(&self, list: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn list_range(&self, list: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(list)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn set_card(&self, set: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let count: usize = redis::cmd("SCARD").arg(set).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn set_members(&self, set: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(set).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn execute(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            Self::add_op(&mut pipe, op);
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
