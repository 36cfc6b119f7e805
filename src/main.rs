//! zdte-agent: consumes queued 0DTE options signals, runs the precondition/prefetch/LLM
//! pipeline, executes bracket orders (or their dry-run equivalent), and reconciles fills.
//!
//! Grounded on the teacher's `main.rs` `load_env` / `init_tracing` / `AppState`-construction
//! sequence, generalized from one monolithic state struct to separately-owned stores handed to
//! the consumer, scheduler and fill monitor, which each run as their own supervised task.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use zdte_agent::broker::{BrokerGateway, LiveBrokerGateway, SimulatedBrokerGateway};
use zdte_agent::config::{RuntimeConfigStore, StaticConfig};
use zdte_agent::consumer::Consumer;
use zdte_agent::db::Db;
use zdte_agent::fill_monitor::{FillFeed, FillMonitor, HttpFillFeed, NullFillFeed};
use zdte_agent::llm::{HttpLlmClient, LlmClient};
use zdte_agent::metrics_http;
use zdte_agent::persistence::{SignalStore, TradeStore};
use zdte_agent::prefetch::market_data::{MarketDataClient, MarketDataSource};
use zdte_agent::processor::SignalProcessor;
use zdte_agent::prompts::PromptStore;
use zdte_agent::queue::Queue;
use zdte_agent::scheduler::Scheduler;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = StaticConfig::load().context("failed to load configuration")?;
    info!(
        database_path = %cfg.database_path,
        live_trading_enabled = cfg.live_trading_enabled,
        consumer_concurrency = cfg.consumer_concurrency,
        "starting zdte-agent"
    );

    let prometheus = metrics_http::install_recorder().context("failed to install metrics recorder")?;

    let db = Db::open(&cfg.database_path).context("failed to open database")?;
    let queue = Queue::new(db.clone());
    let signals = SignalStore::new(db.clone());
    let trades = TradeStore::new(db.clone());
    let runtime_config = RuntimeConfigStore::new(db.clone());
    let prompts = PromptStore::new(db.clone());

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build http client")?;

    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(
        http.clone(),
        cfg.llm_api_base.clone(),
        cfg.llm_api_key.clone(),
        Duration::from_secs(cfg.llm_timeout_secs),
    ));

    let broker_gateway: Arc<dyn BrokerGateway> = if cfg.live_trading_enabled {
        Arc::new(LiveBrokerGateway::new(
            http.clone(),
            cfg.broker_api_base.clone(),
            cfg.broker_api_key.clone(),
            Duration::from_secs(cfg.task_deadline_secs),
        ))
    } else {
        Arc::new(SimulatedBrokerGateway)
    };

    let market_data: Arc<dyn MarketDataSource> = if cfg.use_fallback_market_data {
        Arc::new(MarketDataClient::new(
            http.clone(),
            cfg.market_data_fallback_api_base.clone(),
            cfg.market_data_fallback_api_key.clone(),
            Duration::from_secs(cfg.prefetch_deadline_secs),
        ))
    } else {
        Arc::new(MarketDataClient::new(
            http.clone(),
            cfg.market_data_api_base.clone(),
            cfg.market_data_api_key.clone(),
            Duration::from_secs(cfg.prefetch_deadline_secs),
        ))
    };

    let prefetch_deadline = Duration::from_secs(cfg.prefetch_deadline_secs);
    let task_deadline = Duration::from_secs(cfg.task_deadline_secs);

    let processor_factory: Arc<dyn Fn() -> SignalProcessor + Send + Sync> = {
        let signals = signals.clone();
        let trades = trades.clone();
        let runtime_config = runtime_config.clone();
        let prompts = prompts.clone();
        let market_data = market_data.clone();
        let broker_gateway = broker_gateway.clone();
        let llm = llm.clone();
        let queue = queue.clone();
        Arc::new(move || {
            SignalProcessor::new(
                signals.clone(),
                trades.clone(),
                runtime_config.clone(),
                prompts.clone(),
                market_data.clone(),
                broker_gateway.clone(),
                llm.clone(),
                queue.clone(),
                prefetch_deadline,
            )
        })
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = Consumer::new(
        queue.clone(),
        cfg.consumer_concurrency,
        task_deadline,
        processor_factory,
    );
    let consumer_handle = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { consumer.run(rx).await })
    };

    let scheduler = Scheduler::new(
        queue.clone(),
        Duration::from_secs(cfg.scheduler_poll_interval_secs),
    );
    let scheduler_handle = {
        let rx = shutdown_rx.clone();
        tokio::spawn(scheduler.run(rx))
    };

    let fill_feed: Arc<dyn FillFeed> = if cfg.live_trading_enabled {
        Arc::new(HttpFillFeed::new(
            http.clone(),
            cfg.broker_api_base.clone(),
            cfg.broker_api_key.clone(),
            Duration::from_secs(cfg.task_deadline_secs),
        ))
    } else {
        Arc::new(NullFillFeed)
    };
    let fill_monitor = FillMonitor::new(trades.clone(), fill_feed, Duration::from_secs(30));
    let fill_monitor_handle = {
        let rx = shutdown_rx.clone();
        tokio::spawn(fill_monitor.run(rx))
    };

    let metrics_router = metrics_http::router(queue.clone(), prometheus);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    info!(addr = %cfg.bind_addr, "metrics/health server listening");
    let http_handle = {
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(err) = axum::serve(listener, metrics_router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %err, "metrics/health server exited with an error");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight work");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(
        consumer_handle,
        scheduler_handle,
        fill_monitor_handle,
        http_handle
    );
    info!("zdte-agent stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
