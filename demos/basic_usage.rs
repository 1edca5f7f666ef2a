//! Basic queue manager example.
//!
//! Creates an `emails` queue with a worker, submits a job, and redirects
//! newsletter jobs to a `newsletters` queue with a delay.
//!
//! Requires Redis on `REDIS_URL` (default `redis://localhost:6379`):
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use async_trait::async_trait;
use conveyor::prelude::*;
use tokio::time::Duration;

/// Sends emails; defers newsletters to their own queue.
struct EmailJobProcessor;

#[async_trait]
impl JobProcessor for EmailJobProcessor {
    async fn process(&self, job: &Job, _token: Option<&str>) -> QueueResult<JobResult> {
        println!("📧 Processing email job: {}", job.id);
        println!("   Job data: {}", job.data);

        if job.data["kind"] == "newsletter" {
            println!("   ⏳ Newsletter, moving to the newsletters queue");
            return Ok(JobResult::done().move_to_queue("newsletters", 5_000));
        }

        // Simulate some work
        tokio::time::sleep(Duration::from_secs(1)).await;

        Ok(JobResult::ok(json!({ "messageId": format!("email_{}", job.id) })))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    conveyor::logging::init();

    println!("📦 Conveyor Basic Usage Example\n");

    let config = ManagerConfig::builder()
        .redis(RedisConfig::from_env().build())
        .prefix("myapp")
        .default_job_options(
            JobOptions::new()
                .with_attempts(3)
                .with_backoff(Backoff::exponential(2000)),
        )
        .build();
    let manager = QueueManager::new(config)?;

    manager.subscribe(
        EventKind::QueueCreated,
        listener(|event| println!("🔔 {:?}", event)),
    );

    // Create the queues and the worker
    manager.create_queue("emails", None)?;
    manager.create_queue("newsletters", None)?;
    manager.create_worker("emails", EmailJobProcessor, None)?;

    // Add jobs
    let job = manager
        .add_job(
            "emails",
            json!({
                "to": "user@example.com",
                "subject": "Welcome!",
                "body": "Welcome to our platform!"
            }),
            None,
        )
        .await?;
    println!("✅ Job added with ID: {}", job.id);

    let newsletter = manager
        .add_job(
            "emails",
            json!({ "to": "user@example.com", "kind": "newsletter" }),
            Some(JobOptions::new().with_priority(10)),
        )
        .await?;
    println!("✅ Newsletter added with ID: {}", newsletter.id);

    // Wait a bit for the jobs to be processed
    tokio::time::sleep(Duration::from_secs(3)).await;

    if let Some(newsletters) = manager.get_queue("newsletters") {
        println!("📊 newsletters: {:?}", newsletters.counts().await?);
    }

    // Clean up
    manager.close_all().await?;
    println!("\n✅ Application shutdown complete");

    Ok(())
}
