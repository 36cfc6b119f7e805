//! Delayed-reanalysis poll loop: wakes on a fixed interval and releases any `scheduled` task
//! whose `due_at` has passed back into `pending`.
//!
//! Grounded on `signals/enrichment.rs`'s `spawn_workers` loop-with-channel pattern, adapted
//! from an mpsc-driven worker loop to a `tokio::time::interval` poll against the `scheduled`
//! table (there is nothing to receive from here; the "work" is purely time passing).

use crate::queue::Queue;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Scheduler {
    queue: Queue,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(queue: Queue, poll_interval: Duration) -> Self {
        Self {
            queue,
            poll_interval,
        }
    }

    /// Runs until `shutdown` carries `true`. Each tick releases every scheduled task whose
    /// `due_at` has passed; a release failure is logged and retried on the next tick rather
    /// than aborting the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now().timestamp();
                    match self.queue.release_due(now) {
                        Ok(released) if !released.is_empty() => {
                            info!(count = released.len(), "released scheduled tasks for reanalysis");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "scheduler poll failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::models::{ScheduledContext, Task};

    #[tokio::test]
    async fn releases_due_tasks_and_stops_on_shutdown() {
        let queue = Queue::new(Db::open_in_memory().unwrap());
        queue
            .schedule(
                &Task {
                    thread_id: "t1".to_string(),
                    thread_name: None,
                    scheduled_context: None,
                },
                Utc::now().timestamp() - 1,
                &ScheduledContext::default(),
            )
            .unwrap();

        let scheduler = Scheduler::new(queue.clone(), Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        run.await.unwrap();

        assert_eq!(queue.pending_depth().unwrap(), 1);
    }
}
