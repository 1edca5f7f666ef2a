//! Redis engine.
//!
//! Layout per queue, under `{prefix}:{queue}`:
//!
//! | key          | type   | content                                  |
//! |--------------|--------|------------------------------------------|
//! | `id`, `seq`  | string | id and enqueue counters                  |
//! | `job:<id>`   | string | job record as JSON                       |
//! | `wait`       | zset   | ids scored by priority rank, then seq    |
//! | `delayed`    | zset   | ids scored by ready time (ms)            |
//! | `active`     | set    | `<id>#<seq>` of jobs being processed     |
//! | `completed`  | list   | finished ids, newest first               |
//! | `failed`     | list   | permanently failed ids, newest first     |
//! | `logs:<id>`  | list   | job log lines                            |

use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use chrono::Utc;
use conveyor_redis::{RedisConfig, SharedConnection};
use std::sync::Arc;
use tracing::debug;

use super::{JobCounts, QueueBackend, active_member};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobData, JobOptions, JobState, KeepJobs};

struct Keys {
    base: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{}:{}", prefix, queue),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.base, suffix)
    }

    fn job(&self, id: &str) -> String {
        self.key(&format!("job:{}", id))
    }

    fn logs(&self, id: &str) -> String {
        self.key(&format!("logs:{}", id))
    }
}

/// Score of a waiting job: priority rank first, enqueue order second.
fn wait_score(job: &Job) -> u64 {
    (job.options.priority_rank() << 32) | (job.seq & u64::from(u32::MAX))
}

/// Engine backed by a [`SharedConnection`].
#[derive(Debug)]
pub struct RedisBackend {
    conn: Arc<SharedConnection>,
}

impl RedisBackend {
    /// Configure a connection. Nothing is dialed until the first command.
    pub fn new(config: &RedisConfig) -> QueueResult<Self> {
        Ok(Self::from_connection(SharedConnection::new(config)?))
    }

    /// Use an existing connection.
    pub fn from_connection(conn: SharedConnection) -> Self {
        Self {
            conn: Arc::new(conn),
        }
    }

    /// Use an existing client.
    pub fn from_client(client: ::redis::Client) -> Self {
        Self::from_connection(SharedConnection::from_client(client))
    }

    /// The underlying connection.
    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    async fn conn(&self) -> QueueResult<ConnectionManager> {
        Ok(self.conn.get().await?)
    }

    async fn load(
        &self,
        conn: &mut ConnectionManager,
        keys: &Keys,
        id: &str,
    ) -> QueueResult<Option<Job>> {
        let json: Option<String> = conn.get(keys.job(id)).await?;
        json.map(|json| {
            serde_json::from_str(&json).map_err(|e| QueueError::Deserialization(e.to_string()))
        })
        .transpose()
    }

    async fn save(&self, conn: &mut ConnectionManager, keys: &Keys, job: &Job) -> QueueResult<()> {
        let json =
            serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let _: () = conn.set(keys.job(&job.id), json).await?;
        Ok(())
    }

    async fn schedule(
        &self,
        conn: &mut ConnectionManager,
        keys: &Keys,
        job: &Job,
        delay_ms: u64,
    ) -> QueueResult<()> {
        if delay_ms > 0 {
            let ready_at = Utc::now()
                .timestamp_millis()
                .saturating_add(delay_ms.min(i64::MAX as u64) as i64);
            let _: () = conn.zadd(keys.key("delayed"), &job.id, ready_at).await?;
        } else {
            let _: () = conn.zadd(keys.key("wait"), &job.id, wait_score(job)).await?;
        }
        Ok(())
    }

    async fn promote_delayed(&self, conn: &mut ConnectionManager, keys: &Keys) -> QueueResult<()> {
        let delayed_key = keys.key("delayed");
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn.zrangebyscore(&delayed_key, "-inf", now).await?;

        for id in due {
            // Another process may have promoted it first.
            let removed: usize = conn.zrem(&delayed_key, &id).await?;
            if removed == 0 {
                continue;
            }
            if let Some(mut job) = self.load(conn, keys, &id).await? {
                job.state = JobState::Waiting;
                self.save(conn, keys, &job).await?;
                let _: () = conn.zadd(keys.key("wait"), &id, wait_score(&job)).await?;
            }
        }
        Ok(())
    }

    /// Clear the active marker and load the record, unless a later record
    /// reused the id.
    async fn finish_active(
        &self,
        conn: &mut ConnectionManager,
        keys: &Keys,
        job: &Job,
    ) -> QueueResult<Option<Job>> {
        let _: () = conn
            .srem(keys.key("active"), active_member(&job.id, job.seq))
            .await?;

        match self.load(conn, keys, &job.id).await? {
            Some(stored) if stored.seq == job.seq => Ok(Some(stored)),
            _ => {
                debug!(job_id = %job.id, queue = %job.queue, "Job record superseded, skipping report");
                Ok(None)
            }
        }
    }

    async fn retain_finished(
        &self,
        conn: &mut ConnectionManager,
        keys: &Keys,
        id: &str,
        keep: Option<KeepJobs>,
        list: &str,
    ) -> QueueResult<()> {
        let list_key = keys.key(list);
        let evicted: Vec<String> = match keep {
            Some(KeepJobs::Remove(true)) => vec![id.to_string()],
            Some(KeepJobs::KeepLast(n)) => {
                let _: () = conn.lpush(&list_key, id).await?;
                let n = isize::try_from(n).unwrap_or(isize::MAX);
                let evicted: Vec<String> = conn.lrange(&list_key, n, -1).await?;
                if !evicted.is_empty() {
                    let _: () = conn.ltrim(&list_key, 0, n - 1).await?;
                }
                evicted
            }
            _ => {
                let _: () = conn.lpush(&list_key, id).await?;
                Vec::new()
            }
        };

        for id in evicted {
            let _: () = conn.del(vec![keys.job(&id), keys.logs(&id)]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn kind(&self) -> &'static str {
        "redis"
    }

    fn duplicate(&self) -> Arc<dyn QueueBackend> {
        Arc::new(Self::from_connection(self.conn.duplicate()))
    }

    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    async fn close(&self) -> QueueResult<()> {
        self.conn.close().await;
        Ok(())
    }

    async fn enqueue(
        &self,
        prefix: &str,
        queue: &str,
        name: &str,
        data: JobData,
        options: JobOptions,
    ) -> QueueResult<Job> {
        let mut conn = self.conn().await?;
        let keys = Keys::new(prefix, queue);

        let id = match &options.job_id {
            Some(id) => {
                // Supersede any earlier record with the same id.
                let _: () = ::redis::pipe()
                    .zrem(keys.key("wait"), id)
                    .ignore()
                    .zrem(keys.key("delayed"), id)
                    .ignore()
                    .lrem(keys.key("completed"), 0, id)
                    .ignore()
                    .lrem(keys.key("failed"), 0, id)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                id.clone()
            }
            None => {
                let next: u64 = conn.incr(keys.key("id"), 1).await?;
                next.to_string()
            }
        };
        let seq: u64 = conn.incr(keys.key("seq"), 1).await?;

        let delay = options.delay.unwrap_or(0);
        let job = Job::new(id, queue, name, data, options).with_seq(seq);
        self.save(&mut conn, &keys, &job).await?;
        self.schedule(&mut conn, &keys, &job, delay).await?;

        debug!(job_id = %job.id, queue = %queue, delay_ms = delay, "Job stored");
        Ok(job)
    }

    async fn fetch_next(&self, prefix: &str, queue: &str) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let keys = Keys::new(prefix, queue);

        self.promote_delayed(&mut conn, &keys).await?;

        loop {
            // ZPOPMIN replies with a flat [member, score] list.
            let popped: Vec<String> = conn.zpopmin(keys.key("wait"), 1).await?;
            let Some(id) = popped.into_iter().next() else {
                return Ok(None);
            };

            if let Some(mut job) = self.load(&mut conn, &keys, &id).await? {
                job.start_processing();
                self.save(&mut conn, &keys, &job).await?;
                let _: () = conn
                    .sadd(keys.key("active"), active_member(&job.id, job.seq))
                    .await?;
                return Ok(Some(job));
            }
        }
    }

    async fn complete(&self, prefix: &str, job: &Job, return_value: JobData) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let keys = Keys::new(prefix, &job.queue);

        let Some(mut stored) = self.finish_active(&mut conn, &keys, job).await? else {
            return Ok(());
        };
        stored.complete(return_value);
        self.save(&mut conn, &keys, &stored).await?;
        self.retain_finished(
            &mut conn,
            &keys,
            &stored.id,
            stored.options.remove_on_complete,
            "completed",
        )
        .await
    }

    async fn fail(&self, prefix: &str, job: &Job, reason: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let keys = Keys::new(prefix, &job.queue);

        let Some(mut stored) = self.finish_active(&mut conn, &keys, job).await? else {
            return Ok(());
        };
        let retry = stored.fail(reason);
        self.save(&mut conn, &keys, &stored).await?;

        match retry {
            Some(delay) => self.schedule(&mut conn, &keys, &stored, delay).await,
            None => {
                self.retain_finished(
                    &mut conn,
                    &keys,
                    &stored.id,
                    stored.options.remove_on_fail,
                    "failed",
                )
                .await
            }
        }
    }

    async fn get_job(&self, prefix: &str, queue: &str, id: &str) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, &Keys::new(prefix, queue), id).await
    }

    async fn append_log(
        &self,
        prefix: &str,
        queue: &str,
        id: &str,
        line: &str,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.rpush(Keys::new(prefix, queue).logs(id), line).await?;
        Ok(())
    }

    async fn job_logs(&self, prefix: &str, queue: &str, id: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let lines: Vec<String> = conn.lrange(Keys::new(prefix, queue).logs(id), 0, -1).await?;
        Ok(lines)
    }

    async fn counts(&self, prefix: &str, queue: &str) -> QueueResult<JobCounts> {
        let mut conn = self.conn().await?;
        let keys = Keys::new(prefix, queue);

        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) =
            ::redis::pipe()
                .zcard(keys.key("wait"))
                .zcard(keys.key("delayed"))
                .scard(keys.key("active"))
                .llen(keys.key("completed"))
                .llen(keys.key("failed"))
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }
}
