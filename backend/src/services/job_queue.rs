//! Background work queue with bounded concurrency
//!
//! Jobs are accepted into a bounded channel and each runs on its own task once
//! a permit is free, so at most `max_concurrent` payloads are processed at once.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration for a work queue
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Maximum concurrent jobs
    pub max_concurrent: usize,
    /// Queue capacity (pending jobs)
    pub queue_capacity: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            queue_capacity: 100,
        }
    }
}

/// A queued payload
pub struct Job<T> {
    pub id: Uuid,
    pub payload: T,
}

/// Returned when the queue's dispatcher has stopped
#[derive(Debug, thiserror::Error)]
#[error("work queue '{0}' is closed")]
pub struct QueueClosed(pub String);

/// A bounded work queue that processes jobs with limited concurrency
pub struct WorkQueue<T> {
    sender: mpsc::Sender<Job<T>>,
    name: String,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Create a new work queue with a processor function
    pub fn new<F, Fut>(name: &str, config: JobQueueConfig, processor: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<Job<T>>(config.queue_capacity.max(1));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let queue_name = name.to_string();
        let processor = Arc::new(processor);

        tokio::spawn(async move {
            info!(queue = %queue_name, "Work queue started");

            while let Some(job) = receiver.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let proc = processor.clone();
                let name = queue_name.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    debug!(queue = %name, job_id = %job.id, "Processing job");
                    proc(job.payload).await;
                    debug!(queue = %name, job_id = %job.id, "Job completed");
                });
            }

            info!(queue = %queue_name, "Work queue stopped");
        });

        Self {
            sender,
            name: name.to_string(),
        }
    }

    /// Submit a job, waiting for room if the queue is full
    pub async fn submit(&self, payload: T) -> Result<Uuid, QueueClosed> {
        let job = Job {
            id: Uuid::new_v4(),
            payload,
        };
        let id = job.id;
        self.sender
            .send(job)
            .await
            .map_err(|_| QueueClosed(self.name.clone()))?;
        debug!(queue = %self.name, job_id = %id, "Job submitted");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_every_job_with_bounded_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let queue = {
            let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
            WorkQueue::new(
                "test",
                JobQueueConfig {
                    max_concurrent: 2,
                    queue_capacity: 16,
                },
                move |_: u32| {
                    let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                    }
                },
            )
        };

        for i in 0..6 {
            queue.submit(i).await.unwrap();
        }
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
