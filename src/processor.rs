//! `SignalProcessor`: the one place a task's full lifecycle - preconditions, prefetch, prompt
//! render, LLM call, decision dispatch, broker execution, persistence - is wired together.
//!
//! Grounded on `signals/enrichment.rs`'s `process_job` (the teacher's own single-function
//! per-item pipeline: fetch context, call a model, persist, all inside one `tracing::instrument`
//! span) generalized from WS-event enrichment to signal-to-decision processing.

use crate::broker::{BrokerAdapter, BrokerGateway};
use crate::config::RuntimeConfigStore;
use crate::decision::{self, SKIP_SIGNAL};
use crate::error::AppError;
use crate::llm::LlmClient;
use crate::models::{Decision, SkipCategory, Task};
use crate::persistence::{DecisionEnvelope, ScheduledReanalysisMarker, SignalStore, TradeResultSummary, TradeStore};
use crate::preconditions::{self, LiveFacts, PreconditionContext};
use crate::prefetch::market_data::MarketDataSource;
use crate::prefetch::PrefetchEngine;
use crate::prompts::{self, PromptStore};
use crate::queue::Queue;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What the consumer should do with the popped task once `process` returns. A `Fail` carries
/// the `AppError` so the consumer can route retriable vs. terminal failures identically to how
/// `Queue::fail` already records them.
pub enum ProcessOutcome {
    Complete,
    Fail(AppError),
}

pub struct SignalProcessor {
    signals: SignalStore,
    trades: TradeStore,
    runtime_config: RuntimeConfigStore,
    prompts: PromptStore,
    market_data: Arc<dyn MarketDataSource>,
    prefetch: PrefetchEngine,
    llm: Arc<dyn LlmClient>,
    broker: BrokerAdapter,
    queue: Queue,
}

impl SignalProcessor {
    pub fn new(
        signals: SignalStore,
        trades: TradeStore,
        runtime_config: RuntimeConfigStore,
        prompts: PromptStore,
        market_data: Arc<dyn MarketDataSource>,
        broker_gateway: Arc<dyn BrokerGateway>,
        llm: Arc<dyn LlmClient>,
        queue: Queue,
        prefetch_deadline: std::time::Duration,
    ) -> Self {
        let prefetch = PrefetchEngine::new(market_data.clone(), broker_gateway.clone(), prefetch_deadline);
        Self {
            signals,
            trades,
            runtime_config,
            prompts,
            market_data,
            prefetch,
            llm,
            broker: BrokerAdapter::new(broker_gateway),
            queue,
        }
    }

    #[instrument(skip(self, task), fields(thread_id = %task.thread_id))]
    pub async fn process(&self, task: &Task) -> ProcessOutcome {
        match self.process_inner(task).await {
            Ok(()) => ProcessOutcome::Complete,
            Err(err) if err.is_retriable_task_failure() => ProcessOutcome::Fail(err),
            Err(err) => {
                // A non-retriable error still has to resolve to *some* terminal state; record it
                // as a skip so the signal row isn't left decision-less, then complete the task
                // rather than looping it through `failed` forever.
                warn!(thread_id = %task.thread_id, error = %err, "non-retriable processing error, recording as skip");
                if let Err(persist_err) = self.persist_skip(
                    &task.thread_id,
                    SkipCategory::Other,
                    format!("processing error: {err}"),
                    "n/a",
                    None,
                ) {
                    return ProcessOutcome::Fail(persist_err);
                }
                ProcessOutcome::Complete
            }
        }
    }

    async fn process_inner(&self, task: &Task) -> Result<(), AppError> {
        let signal = self
            .signals
            .get_signal(&task.thread_id)?
            .ok_or_else(|| AppError::ParseError(anyhow::anyhow!("no signal row for thread_id {}", task.thread_id)))?;

        let runtime = self.runtime_config.get().map_err(AppError::QueueUnreachable)?;
        let live_mode = runtime.execute_orders;

        let live_facts = self.gather_live_facts(&signal.parsed, live_mode).await;

        let chain = preconditions::default_chain();
        let ctx = PreconditionContext {
            parsed: &signal.parsed,
            runtime: &runtime,
            live_mode,
            live_facts,
        };

        if let Some((name, category, reason)) = preconditions::run_chain(&chain, &ctx) {
            info!(thread_id = %task.thread_id, check = name, "precondition short-circuit");
            self.persist_skip(&task.thread_id, category, reason, "precondition", None)?;
            return Ok(());
        }

        let bundle = self.run_prefetch(&signal).await;

        let system_prompt = self.prompts.get_system_prompt()?;
        let user_template = self.prompts.get_user_template()?;
        let user_prompt = match prompts::render_user_prompt(&user_template, &bundle) {
            Ok(text) => text,
            Err(err) => {
                warn!(thread_id = %task.thread_id, error = %err, "prompt template render failed");
                self.persist_skip(&task.thread_id, SkipCategory::Other, format!("template_error: {err}"), "n/a", None)?;
                return Ok(());
            }
        };

        let call = self
            .llm
            .call(&runtime.current_llm_model, &system_prompt, &user_prompt, &decision::tool_schemas())
            .await;

        let output = match call {
            Ok(output) => output,
            Err(err @ (AppError::LlmTimeout | AppError::LlmTransport(_))) => return Err(err),
            Err(err) => {
                warn!(thread_id = %task.thread_id, error = %err, "llm call returned a format error");
                self.persist_skip(
                    &task.thread_id,
                    SkipCategory::Other,
                    format!("ai_format_error: {err}"),
                    &runtime.current_llm_model,
                    None,
                )?;
                return Ok(());
            }
        };

        // Exactly one tool call is honored; any extras the model returned anyway are ignored.
        let tool_call = output.tool_calls.first().cloned().unwrap_or_else(|| crate::llm::ToolCall {
            id: String::new(),
            function_name: SKIP_SIGNAL.to_string(),
            arguments_json: r#"{"reason":"no tool call returned","category":"other"}"#.to_string(),
        });

        let decision = match decision::into_decision(&tool_call.function_name, &tool_call.arguments_json) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(thread_id = %task.thread_id, error = %err, "tool call arguments failed validation");
                self.persist_skip(
                    &task.thread_id,
                    SkipCategory::Other,
                    format!("ai_format_error: {err}"),
                    &output.model,
                    output.trace_id.clone(),
                )?;
                return Ok(());
            }
        };

        self.dispatch_decision(
            task,
            decision,
            &output.model,
            signal.parsed.confidence,
            output.trace_id,
            runtime.execute_orders,
        )
        .await
    }

    #[instrument(skip(self, parsed))]
    async fn gather_live_facts(&self, parsed: &crate::models::ParsedFields, live_mode: bool) -> LiveFacts {
        if !live_mode {
            return LiveFacts::default();
        }
        let vix_level = match self.market_data.fetch_vix().await {
            Ok(snapshot) => Some(snapshot.level),
            Err(err) => {
                warn!(error = %err, "live-facts vix read failed; vix_ceiling will pass open");
                None
            }
        };
        let open_position_count = self.trades.open_position_count().ok();
        let has_open_position_for_ticker = parsed
            .ticker
            .as_deref()
            .and_then(|t| self.trades.has_open_position_for_ticker(t).ok());
        LiveFacts {
            vix_level,
            open_position_count,
            has_open_position_for_ticker,
        }
    }

    #[instrument(skip(self, signal))]
    async fn run_prefetch(&self, signal: &crate::models::Signal) -> crate::models::PrefetchBundle {
        self.prefetch.gather(signal.clone()).await
    }

    #[instrument(skip(self, decision, trace_id))]
    async fn dispatch_decision(
        &self,
        task: &Task,
        decision: Decision,
        model_used: &str,
        confidence: Option<f64>,
        trace_id: Option<String>,
        execute_orders: bool,
    ) -> Result<(), AppError> {
        match &decision {
            Decision::Skip { reason, category } => {
                self.persist_skip(&task.thread_id, *category, reason.clone(), model_used, trace_id)?;
                Ok(())
            }
            Decision::Execute { .. } => {
                let result = self
                    .broker
                    .execute(&task.thread_id, &decision, execute_orders, model_used, confidence)
                    .await
                    .map_err(|err| match err {
                        crate::broker::BrokerError::Unreachable(e) => AppError::BrokerUnreachable(e),
                        other => AppError::BrokerRejected(other.to_string()),
                    })?;

                // A Trade is only materialized once the broker has actually confirmed a
                // placement; a failed resolve/reject never touched a live position and must
                // not show up in `has_open_position_for_ticker`/`open_position_count`.
                if result.success {
                    self.trades.insert(&result.trade)?;
                }

                let envelope = DecisionEnvelope {
                    act: "execute".to_string(),
                    reasoning: result.error.clone().unwrap_or_else(|| "order placed".to_string()),
                    decision: decision.clone(),
                    trade_result: Some(TradeResultSummary {
                        success: result.success,
                        error: result.error,
                        trade_id: result.trade.id,
                    }),
                    model_used: model_used.to_string(),
                    timestamp: Utc::now(),
                    trace_id,
                    scheduled_reanalysis: None,
                };
                self.signals.save_result(&task.thread_id, &envelope)?;
                Ok(())
            }
            Decision::Delay {
                delay_minutes,
                reason,
                question,
                key_levels,
            } => {
                let delay_minutes = *delay_minutes;
                let due_at = Utc::now().timestamp() + i64::from(delay_minutes) * 60;
                let previous_retry = task.scheduled_context.as_ref().map(|c| c.retry_count).unwrap_or(0);
                let scheduled_context = crate::models::ScheduledContext {
                    retry_count: previous_retry + 1,
                    previous_tool_call_summary: Some(format!("schedule_reanalysis: {reason}")),
                    delay_reason: Some(reason.clone()),
                    delay_question: Some(question.clone()),
                    key_levels: key_levels.clone(),
                };
                self.queue.schedule(task, due_at, &scheduled_context)?;

                let envelope = DecisionEnvelope {
                    act: "schedule".to_string(),
                    reasoning: reason.clone(),
                    decision: decision.clone(),
                    trade_result: None,
                    model_used: model_used.to_string(),
                    timestamp: Utc::now(),
                    trace_id,
                    scheduled_reanalysis: Some(ScheduledReanalysisMarker {
                        due_at: chrono::DateTime::from_timestamp(due_at, 0).unwrap_or_else(Utc::now),
                        delay_minutes,
                        question: question.clone(),
                    }),
                };
                self.signals.save_result(&task.thread_id, &envelope)?;
                Ok(())
            }
        }
    }

    fn persist_skip(
        &self,
        thread_id: &str,
        category: SkipCategory,
        reason: String,
        model_used: &str,
        trace_id: Option<String>,
    ) -> Result<(), AppError> {
        let envelope = DecisionEnvelope {
            act: "skip".to_string(),
            reasoning: reason.clone(),
            decision: Decision::Skip { reason, category },
            trade_result: None,
            model_used: model_used.to_string(),
            timestamp: Utc::now(),
            trace_id,
            scheduled_reanalysis: None,
        };
        self.signals.save_result(thread_id, &envelope)
    }
}
