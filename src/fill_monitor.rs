//! Fill monitor: polls broker order state and closes local `Trade` rows once a bracket's
//! parent order has filled. Deliberately thin - resolving which child leg filled (take-profit
//! vs. stop-loss) requires a per-brokerage order-state vocabulary this crate does not have a
//! production brokerage integration to validate against, so anything this core cannot classify
//! closes as `closed_manual` rather than guessing.
//!
//! Grounded on `scheduler.rs`'s `tokio::time::interval` + shutdown-watch poll loop, generalized
//! from releasing scheduled tasks to reconciling trade state against a feed.

use crate::models::TradeStatus;
use crate::persistence::TradeStore;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// The broker-reported state of one order, keyed by the parent order id this core assigned at
/// placement time. Anything this feed cannot express maps to `Unrecognized`.
#[derive(Debug, Clone)]
pub enum OrderState {
    Open,
    FilledTakeProfit { fill_price: Decimal },
    FilledStopLoss { fill_price: Decimal },
    Cancelled,
    Unrecognized(String),
}

#[derive(Debug, Clone)]
pub struct BrokerOrderState {
    pub parent_order_id: String,
    pub state: OrderState,
}

/// A narrow polling contract distinct from `BrokerGateway`: fill monitoring only ever needs a
/// snapshot of live order state, never contract resolution or placement.
#[async_trait]
pub trait FillFeed: Send + Sync {
    async fn live_orders(&self) -> anyhow::Result<Vec<BrokerOrderState>>;
}

/// Wire shape for one order as reported by the brokerage order-status endpoint.
#[derive(Debug, serde::Deserialize)]
struct OrderStatusRow {
    parent_order_id: String,
    state: String,
    #[serde(default)]
    fill_price: Option<Decimal>,
}

/// Polls a brokerage's order-status endpoint over HTTP.
///
/// Grounded on `broker::LiveBrokerGateway`'s `reqwest` call shape (bearer auth, per-call
/// timeout, `error_for_status` then typed JSON decode), reused here against an `/orders`
/// endpoint instead of `/accounts`/`/positions`.
pub struct HttpFillFeed {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpFillFeed {
    pub fn new(http: reqwest::Client, base_url: String, api_key: String, timeout: Duration) -> Self {
        Self {
            http,
            base_url,
            api_key,
            timeout,
        }
    }
}

#[async_trait]
impl FillFeed for HttpFillFeed {
    async fn live_orders(&self) -> anyhow::Result<Vec<BrokerOrderState>> {
        let url = format!("{}/orders", self.base_url);
        let rows: Vec<OrderStatusRow> = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let state = match (row.state.as_str(), row.fill_price) {
                    ("open", _) => OrderState::Open,
                    ("cancelled", _) | ("rejected", _) => OrderState::Cancelled,
                    ("filled_take_profit", Some(fill_price)) => OrderState::FilledTakeProfit { fill_price },
                    ("filled_stop_loss", Some(fill_price)) => OrderState::FilledStopLoss { fill_price },
                    (other, _) => OrderState::Unrecognized(other.to_string()),
                };
                BrokerOrderState {
                    parent_order_id: row.parent_order_id,
                    state,
                }
            })
            .collect())
    }
}

/// Used when no live brokerage is wired up. Dry-run trades never fill, so there is nothing to
/// reconcile; this keeps the fill monitor loop running without touching the network.
#[derive(Debug, Clone, Default)]
pub struct NullFillFeed;

#[async_trait]
impl FillFeed for NullFillFeed {
    async fn live_orders(&self) -> anyhow::Result<Vec<BrokerOrderState>> {
        Ok(Vec::new())
    }
}

pub struct FillMonitor {
    trades: TradeStore,
    feed: Arc<dyn FillFeed>,
    poll_interval: Duration,
}

impl FillMonitor {
    pub fn new(trades: TradeStore, feed: Arc<dyn FillFeed>, poll_interval: Duration) -> Self {
        Self {
            trades,
            feed,
            poll_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile_once().await {
                        warn!(error = %err, "fill monitor reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("fill monitor shutting down");
                    break;
                }
            }
        }
    }

    async fn reconcile_once(&self) -> anyhow::Result<()> {
        let orders = self.feed.live_orders().await?;
        for order in orders {
            let Some(trade) = self.trades.find_open_by_parent_order_id(&order.parent_order_id)? else {
                continue;
            };

            let (status, exit_price) = match order.state {
                OrderState::Open => continue,
                OrderState::Cancelled => (TradeStatus::ClosedManual, trade.entry_price),
                OrderState::FilledTakeProfit { fill_price } => (TradeStatus::ClosedTp, fill_price),
                OrderState::FilledStopLoss { fill_price } => (TradeStatus::ClosedSl, fill_price),
                OrderState::Unrecognized(ref raw) => {
                    warn!(parent_order_id = %order.parent_order_id, state = raw, "unrecognized broker order state, closing manually");
                    (TradeStatus::ClosedManual, trade.entry_price)
                }
            };

            let pnl = match trade.side {
                crate::models::OrderSide::Buy => (exit_price - trade.entry_price) * Decimal::from(trade.quantity),
                crate::models::OrderSide::Sell => (trade.entry_price - exit_price) * Decimal::from(trade.quantity),
            };

            self.trades.close(trade.id, status, exit_price, pnl, Utc::now())?;
            info!(thread_id = %trade.thread_id, trade_id = %trade.id, status = status.as_str(), "trade closed by fill monitor");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::models::{OrderSide, Trade, TradeStatus};
    use rust_decimal_macros::dec;

    struct FakeFeed(Vec<BrokerOrderState>);

    #[async_trait]
    impl FillFeed for FakeFeed {
        async fn live_orders(&self) -> anyhow::Result<Vec<BrokerOrderState>> {
            Ok(self.0.clone())
        }
    }

    fn sample_trade(parent_order_id: &str) -> Trade {
        Trade {
            id: uuid::Uuid::new_v4(),
            thread_id: "t1".to_string(),
            parent_order_id: parent_order_id.to_string(),
            occ_symbol: "SPY   260731C00605000".to_string(),
            contract_id: Some("c1".to_string()),
            side: OrderSide::Buy,
            quantity: 1,
            entry_price: dec!(1.77),
            take_profit: dec!(2.50),
            stop_loss: dec!(1.20),
            model_id: "test-model".to_string(),
            confidence: Some(0.8),
            status: TradeStatus::Open,
            simulated: false,
            entry_time: Utc::now(),
            exit_time: None,
            exit_price: None,
            pnl: None,
        }
    }

    #[tokio::test]
    async fn closes_trade_on_take_profit_fill() {
        let db = Db::open_in_memory().unwrap();
        let trades = TradeStore::new(db);
        let trade = sample_trade("order-1");
        trades.insert(&trade).unwrap();

        let feed = Arc::new(FakeFeed(vec![BrokerOrderState {
            parent_order_id: "order-1".to_string(),
            state: OrderState::FilledTakeProfit { fill_price: dec!(2.50) },
        }]));
        let monitor = FillMonitor::new(trades.clone(), feed, Duration::from_secs(1));
        monitor.reconcile_once().await.unwrap();

        assert!(!trades.has_open_position_for_ticker("SPY").unwrap());
        let closed = trades.find_open_by_parent_order_id("order-1").unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn unrecognized_state_closes_manually() {
        let db = Db::open_in_memory().unwrap();
        let trades = TradeStore::new(db);
        trades.insert(&sample_trade("order-2")).unwrap();

        let feed = Arc::new(FakeFeed(vec![BrokerOrderState {
            parent_order_id: "order-2".to_string(),
            state: OrderState::Unrecognized("partial_reject".to_string()),
        }]));
        let monitor = FillMonitor::new(trades.clone(), feed, Duration::from_secs(1));
        monitor.reconcile_once().await.unwrap();

        assert!(!trades.has_open_position_for_ticker("SPY").unwrap());
    }

    #[tokio::test]
    async fn open_order_leaves_trade_untouched() {
        let db = Db::open_in_memory().unwrap();
        let trades = TradeStore::new(db);
        trades.insert(&sample_trade("order-3")).unwrap();

        let feed = Arc::new(FakeFeed(vec![BrokerOrderState {
            parent_order_id: "order-3".to_string(),
            state: OrderState::Open,
        }]));
        let monitor = FillMonitor::new(trades.clone(), feed, Duration::from_secs(1));
        monitor.reconcile_once().await.unwrap();

        assert!(trades.has_open_position_for_ticker("SPY").unwrap());
    }

    #[tokio::test]
    async fn order_with_no_matching_open_trade_is_ignored() {
        let db = Db::open_in_memory().unwrap();
        let trades = TradeStore::new(db);
        let feed = Arc::new(FakeFeed(vec![BrokerOrderState {
            parent_order_id: "unknown-order".to_string(),
            state: OrderState::FilledTakeProfit { fill_price: dec!(2.50) },
        }]));
        let monitor = FillMonitor::new(trades.clone(), feed, Duration::from_secs(1));
        monitor.reconcile_once().await.unwrap();
    }
}
