//! Two-layer configuration: `StaticConfig` (env + CLI, loaded once at startup) and
//! `RuntimeConfigStore` (SQLite-backed, dashboard-editable, re-read fresh on every task).
//!
//! Grounded on `models::Config::from_env()`'s env-var-with-default idiom, generalized to
//! `clap`'s derive+env support (the teacher parses env vars by hand; this crate additionally
//! exposes the same fields as CLI flags the way `vault/ab_test.rs`'s enabled-from-env flags
//! suggest an override surface should exist), and on `signals/db_storage.rs`'s key/value
//! `metadata` table pattern for the runtime half.

use crate::db::Db;
use crate::error::AppError;
use crate::models::RuntimeConfig;
use anyhow::Context;
use chrono::Utc;
use clap::Parser;

/// Process-lifetime configuration. Read once in `main` and handed down as an `Arc` (or plain
/// clone, since every field is cheap); never re-read mid-run.
#[derive(Debug, Clone, Parser)]
#[command(name = "zdte-agent", about = "0DTE options signal execution agent")]
pub struct StaticConfig {
    #[arg(long, env = "DATABASE_PATH", default_value = "./zdte_agent.db")]
    pub database_path: String,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    #[arg(long, env = "OPENROUTER_API_KEY", default_value = "")]
    pub llm_api_key: String,

    #[arg(
        long,
        env = "OPENROUTER_API_BASE",
        default_value = "https://openrouter.ai/api/v1"
    )]
    pub llm_api_base: String,

    #[arg(long, env = "LLM_CALL_TIMEOUT_SECS", default_value_t = 60)]
    pub llm_timeout_secs: u64,

    #[arg(long, env = "BROKER_API_KEY", default_value = "")]
    pub broker_api_key: String,

    #[arg(long, env = "BROKER_API_BASE", default_value = "")]
    pub broker_api_base: String,

    /// Governs whether `BrokerGateway::live()` or `BrokerGateway::dry_run()` is wired up.
    /// Distinct from `RuntimeConfig::execute_orders`, which can additionally suppress live
    /// orders without a restart; this flag decides which adapter *exists* at all.
    #[arg(long, env = "LIVE_TRADING_ENABLED", default_value_t = false)]
    pub live_trading_enabled: bool,

    #[arg(long, env = "USE_FALLBACK_MARKET_DATA", default_value_t = false)]
    pub use_fallback_market_data: bool,

    #[arg(long, env = "MARKET_DATA_API_BASE", default_value = "")]
    pub market_data_api_base: String,

    #[arg(long, env = "MARKET_DATA_API_KEY", default_value = "")]
    pub market_data_api_key: String,

    #[arg(long, env = "MARKET_DATA_FALLBACK_API_BASE", default_value = "")]
    pub market_data_fallback_api_base: String,

    #[arg(long, env = "MARKET_DATA_FALLBACK_API_KEY", default_value = "")]
    pub market_data_fallback_api_key: String,

    #[arg(long, env = "CONSUMER_CONCURRENCY", default_value_t = 1)]
    pub consumer_concurrency: usize,

    #[arg(long, env = "PREFETCH_DEADLINE_SECS", default_value_t = 6)]
    pub prefetch_deadline_secs: u64,

    #[arg(long, env = "TASK_DEADLINE_SECS", default_value_t = 90)]
    pub task_deadline_secs: u64,

    #[arg(long, env = "SCHEDULER_POLL_INTERVAL_SECS", default_value_t = 30)]
    pub scheduler_poll_interval_secs: u64,
}

impl StaticConfig {
    /// Loads `.env` (if present) then parses env + CLI via `clap`, the way `load_env()` in the
    /// teacher's `main.rs` searches for a manifest-relative `.env` before anything else runs.
    pub fn load() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let cfg = Self::parse();
        if cfg.live_trading_enabled && cfg.broker_api_key.is_empty() {
            return Err(AppError::ConfigInvalid(
                "LIVE_TRADING_ENABLED is set but BROKER_API_KEY is empty".to_string(),
            )
            .into());
        }
        Ok(cfg)
    }
}

const RUNTIME_CONFIG_KEY: &str = "singleton";

/// The dashboard-editable half. Every `get()` call re-reads SQLite; nothing is cached in the
/// process, so an operator's edit takes effect on the very next task.
#[derive(Clone)]
pub struct RuntimeConfigStore {
    db: Db,
}

impl RuntimeConfigStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn get(&self) -> anyhow::Result<RuntimeConfig> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value_json FROM runtime_config WHERE key = ?1",
                    [RUNTIME_CONFIG_KEY],
                    |row| row.get(0),
                )
                .ok())
        })?;

        match raw {
            Some(json) => {
                serde_json::from_str(&json).context("failed to deserialize runtime_config row")
            }
            None => {
                let default = RuntimeConfig::default();
                self.put(&default)?;
                Ok(default)
            }
        }
    }

    pub fn put(&self, cfg: &RuntimeConfig) -> anyhow::Result<()> {
        let json = serde_json::to_string(cfg).context("failed to serialize RuntimeConfig")?;
        let now = Utc::now().timestamp();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runtime_config (key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
                rusqlite::params![RUNTIME_CONFIG_KEY, json, now],
            )?;
            Ok(())
        })
    }
}
