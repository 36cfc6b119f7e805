//! Main consume loop: reclaim abandoned `processing` rows once at startup, then pop tasks and
//! run them through a bounded worker pool, each worker owning its own `SignalProcessor` (and
//! therefore its own broker client - brokerage SDKs are rarely `Send + Sync`-safe to share).
//!
//! Grounded on `signals/enrichment.rs`'s `spawn_workers` (`Arc<Mutex<Receiver>>` fan-out over N
//! tokio tasks) generalized from an mpsc channel of WS events to a SQLite-backed `Queue::pop`
//! poll loop, since this crate's queue is a durable store rather than an in-process channel.

use crate::processor::{ProcessOutcome, SignalProcessor};
use crate::queue::{PopOutcome, Queue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Polling cadence when the queue is empty. Short enough to feel responsive, long enough not
/// to hammer SQLite with empty `SELECT`s.
const EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct Consumer {
    queue: Queue,
    worker_count: usize,
    task_deadline: Duration,
    processor_factory: Arc<dyn Fn() -> SignalProcessor + Send + Sync>,
}

impl Consumer {
    pub fn new(
        queue: Queue,
        worker_count: usize,
        task_deadline: Duration,
        processor_factory: Arc<dyn Fn() -> SignalProcessor + Send + Sync>,
    ) -> Self {
        Self {
            queue,
            worker_count: worker_count.max(1),
            task_deadline,
            processor_factory,
        }
    }

    /// Reclaims any tasks left mid-flight by a prior crash, then spawns `worker_count` worker
    /// loops and waits for every one to exit (which only happens on shutdown).
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        match self.queue.reclaim() {
            Ok(0) => {}
            Ok(n) => warn!(reclaimed = n, "reclaimed tasks left in processing by a prior run"),
            Err(err) => error!(error = %err, "failed to reclaim processing tasks at startup"),
        }

        let mut handles = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            let queue = self.queue.clone();
            let processor = (self.processor_factory)();
            let deadline = self.task_deadline;
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, processor, deadline, &mut shutdown).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Queue,
    processor: SignalProcessor,
    deadline: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            info!(worker_id, "worker shutting down");
            return;
        }

        let popped = match queue.pop() {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(worker_id, error = %err, "queue pop failed");
                tokio::time::sleep(EMPTY_POLL_INTERVAL).await;
                continue;
            }
        };

        let task = match popped {
            PopOutcome::Empty => {
                tokio::select! {
                    _ = tokio::time::sleep(EMPTY_POLL_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
            PopOutcome::DeadLettered { thread_id, reason } => {
                warn!(worker_id, thread_id, reason, "task payload dead-lettered at pop time");
                continue;
            }
            PopOutcome::Task(task) => task,
        };

        let thread_id = task.thread_id.clone();
        let outcome = match tokio::time::timeout(deadline, processor.process(&task)).await {
            Ok(outcome) => outcome,
            Err(_) => ProcessOutcome::Fail(crate::error::AppError::DeadlineExceeded),
        };

        match outcome {
            ProcessOutcome::Complete => {
                if let Err(err) = queue.complete(&thread_id) {
                    error!(worker_id, thread_id, error = %err, "failed to mark task complete");
                }
            }
            ProcessOutcome::Fail(err) => {
                warn!(worker_id, thread_id, error = %err, kind = err.kind(), "task failed");
                if let Err(queue_err) = queue.fail(&thread_id, &err) {
                    error!(worker_id, thread_id, error = %queue_err, "failed to record task failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimulatedBrokerGateway;
    use crate::config::RuntimeConfigStore;
    use crate::db::Db;
    use crate::llm::{LlmCallOutput, LlmClient, ToolCall};
    use crate::models::{ParsedFields, Signal, SignalMessage, Task};
    use crate::persistence::{SignalStore, TradeStore};
    use crate::prefetch::market_data::MarketDataSource;
    use crate::prompts::PromptStore;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FakeMarketData;

    #[async_trait]
    impl MarketDataSource for FakeMarketData {
        async fn fetch_time(&self) -> anyhow::Result<crate::models::TimeSnapshot> {
            Ok(crate::models::TimeSnapshot {
                now_eastern: Utc::now(),
                market_open: true,
                status_reason: crate::models::MarketStatusReason::MarketOpen,
                opens_at: None,
                closes_at: None,
            })
        }
        async fn fetch_option_chain(
            &self,
            _ticker: &str,
            expiry: chrono::NaiveDate,
        ) -> anyhow::Result<crate::models::OptionChainSnapshot> {
            Ok(crate::models::OptionChainSnapshot {
                underlying_price: rust_decimal::Decimal::new(60000, 2),
                expiry,
                quotes: vec![],
                available_expiries: vec![expiry],
            })
        }
        async fn fetch_vix(&self) -> anyhow::Result<crate::models::VixSnapshot> {
            Ok(crate::models::VixSnapshot {
                level: 14.0,
                band: crate::models::VixBand::Low,
            })
        }
    }

    struct FakeLlmClient;

    #[async_trait]
    impl LlmClient for FakeLlmClient {
        async fn call(
            &self,
            model: &str,
            _system: &str,
            _user: &str,
            _tools: &serde_json::Value,
        ) -> Result<LlmCallOutput, AppError> {
            Ok(LlmCallOutput {
                model: model.to_string(),
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    function_name: crate::decision::SKIP_SIGNAL.to_string(),
                    arguments_json: r#"{"reason":"no edge","category":"low_confidence"}"#.to_string(),
                }],
                prompt_tokens: Some(1),
                completion_tokens: Some(1),
                latency_ms: 1,
                trace_id: None,
            })
        }
    }

    use crate::error::AppError;

    #[tokio::test]
    async fn drains_a_pending_task_and_marks_it_complete() {
        let db = Db::open_in_memory().unwrap();
        let queue = Queue::new(db.clone());
        let signals = SignalStore::new(db.clone());
        signals
            .upsert_signal(&Signal {
                thread_id: "t1".to_string(),
                messages: vec![SignalMessage {
                    content: "SPY 600c".to_string(),
                    timestamp: Utc::now(),
                    upstream_ai_meta: None,
                }],
                parsed: ParsedFields {
                    ticker: Some("SPY".to_string()),
                    confidence: Some(0.9),
                    ..Default::default()
                },
            })
            .unwrap();
        queue
            .enqueue(&Task {
                thread_id: "t1".to_string(),
                thread_name: None,
                scheduled_context: None,
            })
            .unwrap();

        let db_for_factory = db.clone();
        let factory: Arc<dyn Fn() -> SignalProcessor + Send + Sync> = Arc::new(move || {
            let db = db_for_factory.clone();
            SignalProcessor::new(
                SignalStore::new(db.clone()),
                TradeStore::new(db.clone()),
                RuntimeConfigStore::new(db.clone()),
                PromptStore::new(db.clone()),
                Arc::new(FakeMarketData),
                Arc::new(SimulatedBrokerGateway),
                Arc::new(FakeLlmClient),
                Queue::new(db),
                Duration::from_secs(5),
            )
        });

        let consumer = Consumer::new(queue.clone(), 1, Duration::from_secs(5), factory);
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { consumer.run(rx).await });

        for _ in 0..40 {
            if queue.pending_depth().unwrap() == 0 && signals.get_decision("t1").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let _ = tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), run).await;

        let envelope = signals.get_decision("t1").unwrap().unwrap();
        assert_eq!(envelope.act, "skip");
    }
}
