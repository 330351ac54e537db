use std::time::Duration;

use fabrq::prelude::*;
use fabrq_redis::{RedisStore, StoreConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const QUEUE: &str = "demo";

#[tokio::main]
pub async fn main() -> Result<(), FabrqError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fabrq=debug,info")),
        )
        .init();

    let store = RedisStore::connect(&StoreConfig::from_env()?).await?;
    let queue = Queue::new(store.clone(), QUEUE)?;
    let admin = Admin::new(store.clone());

    let job_id = Job::builder("echo hello from fabrq")
        .enqueue(&queue)
        .await?;
    println!("Inserted job {job_id}");

    let job_id = Job::builder("sleep 5")
        .with_timeout(Duration::from_secs(1))
        .enqueue(&queue)
        .await?;
    println!("Inserted job {job_id}, it will time out");

    let job_id = admin.enqueue(QUEUE, "exit 3").await?;
    println!("Inserted job {job_id}, it will fail");

    let summary = Worker::new("demo_worker", store.clone(), ShellExecutor)
        .listen_on(QUEUE)
        .with_config(WorkerConfig::default().burst())
        .run(CancellationToken::new())
        .await?;
    println!("Worker done: {summary:?}");
    println!("Counts: {:?}", admin.counts(QUEUE).await?);

    let report = admin.requeue_failed(QUEUE).await?;
    println!("Requeued {} failed jobs", report.acted_on.len());

    let report = admin.delete_queue(QUEUE).await?;
    println!("Deleted {} jobs", report.acted_on.len());
    Ok(())
}
