//! A Redis backed [`Store`] for fabrq.
//!
//! Keys are prefixed with the configured namespace:
//!
//! - `<namespace>:job:<id>` the JSON encoded job record, with a PX expiry when it has one;
//! - `<namespace>:queue:<name>` the pending list, popped from the left;
//! - `<namespace>:registry:<kind>:<name>` a sorted set scored by expiry in unix milliseconds,
//!   `+inf` for members that never expire;
//! - `<namespace>:queues` the set of queue names.
//!
//! Claims run as a Lua script and transitions as a `MULTI`/`EXEC` pipeline, so neither ever
//! exposes an intermediate state to other clients.
use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fabrq::{
    job::{Job, JobId},
    registry::RegistryKind,
    store::{Placement, Slot, Store, StoreError, Transition},
    FabrqError,
};
use redis::{aio::ConnectionManager, Client, Pipeline, RedisError, Script, ToRedisArgs};

mod config;

pub use config::{StoreConfig, DEFAULT_NAMESPACE};

const CLAIM_PENDING_LUA: &str = r#"
local id = redis.call('LPOP', KEYS[1])
if id then
    redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return id
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: NameSpace,
    claim_pending_script: Script,
}

fn map_err(error: RedisError) -> StoreError {
    tracing::error!(?error, "Redis command failed: {error}");
    StoreError::Unavailable(error.to_string())
}

fn parse_id(id: &str) -> Result<JobId, StoreError> {
    id.parse().map_err(|_| {
        tracing::error!(id, "Found a malformed job id");
        StoreError::BadState
    })
}

fn parse_ids(ids: Vec<String>) -> Result<Vec<JobId>, StoreError> {
    ids.iter().map(|id| parse_id(id)).collect()
}

/// A sorted set score for an expiry.
fn score(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at.map_or_else(
        || "+inf".to_owned(),
        |expires_at| expires_at.timestamp_millis().to_string(),
    )
}

impl RedisStore {
    /// Connect to the server described by `config`.
    ///
    /// The configuration is validated before any connection is attempted.
    pub async fn connect(config: &StoreConfig) -> Result<Self, FabrqError> {
        config.validate()?;
        let client = Client::open(config.connection_info()?).map_err(map_err)?;
        let conn = ConnectionManager::new(client).await.map_err(map_err)?;

        tracing::debug!(namespace = %config.namespace, "Connected to redis");
        Ok(Self::from_connection(conn, &config.namespace))
    }

    /// Use an existing connection.
    pub fn from_connection(conn: ConnectionManager, namespace: impl ToString) -> Self {
        Self {
            conn,
            namespace: NameSpace(namespace.to_string()),
            claim_pending_script: Script::new(CLAIM_PENDING_LUA),
        }
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        cmd.query_async(&mut self.conn.clone()).await.map_err(map_err)
    }

    fn add_save(
        &self,
        pipe: &mut Pipeline,
        job: &Job,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let key = self.namespace.job(&job.id);
        match expires_at {
            None => {
                pipe.cmd("SET").arg(key).arg(serde_json::to_string(job)?);
            }
            Some(expires_at) => {
                let ttl = (expires_at - Utc::now()).num_milliseconds();
                if ttl > 0 {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(serde_json::to_string(job)?)
                        .arg("PX")
                        .arg(ttl);
                } else {
                    pipe.cmd("DEL").arg(key);
                }
            }
        }
        Ok(())
    }

    fn add_enter(&self, pipe: &mut Pipeline, queue: &str, id: &JobId, placement: Placement) {
        match placement {
            Placement::Pending { at_front } => {
                let push = if at_front { "LPUSH" } else { "RPUSH" };
                pipe.cmd(push).arg(self.namespace.queue(queue)).arg(id.to_string());
            }
            Placement::Registry { kind, expires_at } => {
                pipe.cmd("ZADD")
                    .arg(self.namespace.registry(queue, kind))
                    .arg(score(expires_at))
                    .arg(id.to_string());
            }
        }
    }

    fn add_leave(&self, pipe: &mut Pipeline, queue: &str, id: &JobId, slot: Slot) {
        match slot {
            Slot::Pending => {
                pipe.cmd("LREM")
                    .arg(self.namespace.queue(queue))
                    .arg(0)
                    .arg(id.to_string());
            }
            Slot::Registry(kind) => {
                pipe.cmd("ZREM")
                    .arg(self.namespace.registry(queue, kind))
                    .arg(id.to_string());
            }
        }
    }

    async fn execute(&self, pipe: &Pipeline) -> Result<(), StoreError> {
        let _: () = pipe
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

#[derive(Clone)]
struct NameSpace(String);

impl NameSpace {
    fn job<'a>(&'a self, id: &'a JobId) -> NameSpacedKey<'a> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::Job(id),
        }
    }

    fn queue<'a>(&'a self, queue: &'a str) -> NameSpacedKey<'a> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::Queue(queue),
        }
    }

    fn registry<'a>(&'a self, queue: &'a str, kind: RegistryKind) -> NameSpacedKey<'a> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::Registry(kind, queue),
        }
    }

    fn queues(&self) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::Queues,
        }
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType<'a>,
}

impl Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match self.kind {
            KeyType::Job(id) => write!(f, ":job:{id}"),
            KeyType::Queue(queue) => write!(f, ":queue:{queue}"),
            KeyType::Registry(kind, queue) => write!(f, ":registry:{kind}:{queue}"),
            KeyType::Queues => write!(f, ":queues"),
        }
    }
}

impl<'a> ToRedisArgs for NameSpacedKey<'a> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

enum KeyType<'a> {
    Job(&'a JobId),
    Queue(&'a str),
    Registry(RegistryKind, &'a str),
    Queues,
}

#[async_trait]
impl Store for RedisStore {
    async fn save_job(
        &self,
        job: &Job,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        self.add_save(&mut pipe, job, expires_at)?;
        self.execute(&pipe).await
    }
    async fn fetch_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let job: Option<String> = self
            .query(redis::cmd("GET").arg(self.namespace.job(id)))
            .await?;
        Ok(job.map(|job| serde_json::from_str(&job)).transpose()?)
    }
    async fn delete_job(&self, id: &JobId) -> Result<(), StoreError> {
        self.query(redis::cmd("DEL").arg(self.namespace.job(id)))
            .await
    }
    async fn push_pending(
        &self,
        queue: &str,
        id: &JobId,
        at_front: bool,
    ) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        self.add_enter(&mut pipe, queue, id, Placement::Pending { at_front });
        self.execute(&pipe).await
    }
    async fn pop_pending(&self, queue: &str) -> Result<Option<JobId>, StoreError> {
        let id: Option<String> = self
            .query(redis::cmd("LPOP").arg(self.namespace.queue(queue)))
            .await?;
        id.as_deref().map(parse_id).transpose()
    }
    async fn remove_pending(&self, queue: &str, id: &JobId) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        self.add_leave(&mut pipe, queue, id, Slot::Pending);
        self.execute(&pipe).await
    }
    async fn pending_ids(&self, queue: &str) -> Result<Vec<JobId>, StoreError> {
        let ids: Vec<String> = self
            .query(
                redis::cmd("LRANGE")
                    .arg(self.namespace.queue(queue))
                    .arg(0)
                    .arg(-1),
            )
            .await?;
        parse_ids(ids)
    }
    async fn delete_pending(&self, queue: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("DEL").arg(self.namespace.queue(queue)))
            .await
    }
    async fn registry_add(
        &self,
        queue: &str,
        kind: RegistryKind,
        id: &JobId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        self.add_enter(&mut pipe, queue, id, Placement::Registry { kind, expires_at });
        self.execute(&pipe).await
    }
    async fn registry_remove(
        &self,
        queue: &str,
        kind: RegistryKind,
        id: &JobId,
    ) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        self.add_leave(&mut pipe, queue, id, Slot::Registry(kind));
        self.execute(&pipe).await
    }
    async fn registry_ids(
        &self,
        queue: &str,
        kind: RegistryKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let ids: Vec<String> = self
            .query(
                redis::cmd("ZRANGEBYSCORE")
                    .arg(self.namespace.registry(queue, kind))
                    .arg(format!("({}", now.timestamp_millis()))
                    .arg("+inf"),
            )
            .await?;
        parse_ids(ids)
    }
    async fn registry_expired_ids(
        &self,
        queue: &str,
        kind: RegistryKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let ids: Vec<String> = self
            .query(
                redis::cmd("ZRANGEBYSCORE")
                    .arg(self.namespace.registry(queue, kind))
                    .arg("-inf")
                    .arg(now.timestamp_millis()),
            )
            .await?;
        parse_ids(ids)
    }
    async fn register_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("SADD").arg(self.namespace.queues()).arg(queue))
            .await
    }
    async fn unregister_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("SREM").arg(self.namespace.queues()).arg(queue))
            .await
    }
    async fn queues(&self) -> Result<Vec<String>, StoreError> {
        let mut queues: Vec<String> = self
            .query(redis::cmd("SMEMBERS").arg(self.namespace.queues()))
            .await?;
        queues.sort();
        Ok(queues)
    }
    async fn claim_pending(
        &self,
        queue: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<JobId>, StoreError> {
        let id: Option<String> = self
            .claim_pending_script
            .key(self.namespace.queue(queue))
            .key(self.namespace.registry(queue, RegistryKind::Started))
            .arg(score(expires_at))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        id.as_deref().map(parse_id).transpose()
    }
    async fn commit(&self, transition: Transition<'_>) -> Result<(), StoreError> {
        let Transition {
            job,
            expires_at,
            leave,
            enter,
        } = transition;
        let queue = job.origin.as_str();

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(slot) = leave {
            self.add_leave(&mut pipe, queue, &job.id, slot);
        }
        self.add_save(&mut pipe, job, expires_at)?;
        if let Some(placement) = enter {
            self.add_enter(&mut pipe, queue, &job.id, placement);
        }
        self.execute(&pipe).await
    }
}
