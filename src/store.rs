//! Job record storage: Redis when configured, otherwise in memory.

use anyhow::{Context, Result};
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::job::CompositeJob;

/// Key prefix for job records.
const JOB_KEY_PREFIX: &str = "printpilot:composite:job";

/// Records kept by the in-memory store before the oldest are evicted.
pub const DEFAULT_MEMORY_CAPACITY: usize = 1000;

/// Where job records live.
#[derive(Clone)]
pub enum JobStore {
    Memory(MemoryJobStore),
    Redis(RedisJobStore),
}

impl JobStore {
    /// Connects to Redis when a URL is given, otherwise keeps records in memory.
    pub async fn from_config(redis_url: Option<&str>, ttl_secs: u64) -> Result<Self> {
        match redis_url {
            Some(url) => Ok(JobStore::Redis(RedisJobStore::connect(url, ttl_secs).await?)),
            None => {
                info!("REDIS_URL not set, keeping job records in memory");
                Ok(JobStore::Memory(MemoryJobStore::new(DEFAULT_MEMORY_CAPACITY)))
            }
        }
    }

    pub fn memory() -> Self {
        JobStore::Memory(MemoryJobStore::new(DEFAULT_MEMORY_CAPACITY))
    }

    pub async fn save(&self, job: &CompositeJob) -> Result<()> {
        match self {
            JobStore::Memory(store) => {
                store.save(job).await;
                Ok(())
            }
            JobStore::Redis(store) => store.save(job).await,
        }
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<CompositeJob>> {
        match self {
            JobStore::Memory(store) => Ok(store.get(job_id).await),
            JobStore::Redis(store) => store.get(job_id).await,
        }
    }
}

/// Bounded in-process store.
#[derive(Clone)]
pub struct MemoryJobStore {
    inner: Arc<RwLock<MemoryInner>>,
    capacity: usize,
}

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<String, CompositeJob>,
    order: VecDeque<String>,
}

impl MemoryJobStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryInner::default())),
            capacity: capacity.max(1),
        }
    }

    pub async fn save(&self, job: &CompositeJob) {
        let mut inner = self.inner.write().await;
        if inner.jobs.insert(job.job_id.clone(), job.clone()).is_none() {
            inner.order.push_back(job.job_id.clone());
        }
        while inner.jobs.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.jobs.remove(&oldest);
                    debug!(job_id = %oldest, "Evicted job record");
                }
                None => break,
            }
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<CompositeJob> {
        self.inner.read().await.jobs.get(job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }
}

/// Redis-backed store; each record is a JSON string with a TTL.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisJobStore {
    pub async fn connect(url: &str, ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis job store");
        Ok(Self { conn, ttl_secs })
    }

    pub async fn save(&self, job: &CompositeJob) -> Result<()> {
        let job_json = serde_json::to_string(job).context("Failed to serialize job")?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(job_key(&job.job_id), &job_json, self.ttl_secs)
            .await
            .context("Failed to store job record")?;

        debug!(job_id = %job.job_id, status = %job.status, "Stored job record");
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<CompositeJob>> {
        let mut conn = self.conn.clone();
        let job_json: Option<String> = conn
            .get(job_key(job_id))
            .await
            .context("Failed to read job record")?;

        job_json
            .map(|json| serde_json::from_str(&json).context("Failed to deserialize job record"))
            .transpose()
    }
}

fn job_key(job_id: &str) -> String {
    format!("{}:{}", JOB_KEY_PREFIX, job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, UploadInfo};

    fn job() -> CompositeJob {
        let upload = |name: &str| UploadInfo {
            file_name: name.to_string(),
            content_type: "application/octet-stream".to_string(),
            size_bytes: 1,
        };
        CompositeJob::new("ARTWORK HERE".to_string(), 300, None, upload("t.pdf"), upload("a.png"))
    }

    #[tokio::test]
    async fn test_memory_save_and_update() {
        let store = JobStore::memory();
        let mut job = job();

        store.save(&job).await.unwrap();
        job.start_processing();
        store.save(&job).await.unwrap();

        let found = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Processing);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_evicts_oldest() {
        let store = MemoryJobStore::new(2);
        let first = job();
        let second = job();
        let third = job();

        store.save(&first).await;
        store.save(&second).await;
        store.save(&first).await;
        store.save(&third).await;

        assert_eq!(store.len().await, 2);
        assert!(store.get(&first.job_id).await.is_none());
        assert!(store.get(&second.job_id).await.is_some());
        assert!(store.get(&third.job_id).await.is_some());
    }

    #[test]
    fn test_job_key() {
        assert_eq!(job_key("abc"), "printpilot:composite:job:abc");
    }

    // Requires Redis: docker run -d -p 6379:6379 redis:7-alpine
    #[tokio::test]
    #[ignore]
    async fn test_redis_roundtrip() {
        let store = JobStore::from_config(Some("redis://127.0.0.1/"), 60).await.unwrap();
        let job = job();

        store.save(&job).await.unwrap();
        let found = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(found.job_id, job.job_id);
        assert_eq!(found.status, JobStatus::Queued);
    }
}
