//! Broker adapter: OCC symbol construction (`occ.rs`), contract resolution, bracket-order
//! construction and placement, with dry-run parity.
//!
//! Grounded on `vault/execution.rs`'s `ExecutionAdapter` trait + `PaperExecutionAdapter`/
//! `PolymarketClobAdapter` pair (trait-for-live-vs-paper split, `sim-<uuid>`-prefixed synthetic
//! ids) generalized from a single-leg CLOB order to a three-order bracket (parent + two
//! children) against a generic brokerage REST surface, and on `vault/user_accounts.rs`'s
//! balance/position fetch shape for `fetch_account`/`fetch_positions`.

pub mod occ;

use crate::models::{AccountSnapshot, Decision, OptionRight, OrderSide, PositionSnapshot, Trade, TradeStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{info, warn};

/// A resolved brokerage contract id, distinct from the OCC symbol (which is a display/lookup
/// key, not necessarily what the brokerage's order endpoint wants).
pub type ContractId = String;

#[derive(Debug, Clone)]
pub struct BracketOrder {
    pub client_order_id: String,
    pub occ_symbol: String,
    pub contract_id: Option<ContractId>,
    pub side: OrderSide,
    pub quantity: u32,
    pub entry_price: Decimal,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
}

#[derive(Debug, Clone)]
pub struct BracketPlacement {
    pub success: bool,
    pub parent_order_id: String,
    pub simulated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("contract not found for the given (ticker, expiry, right, strike)")]
    ContractNotFound,
    #[error("broker rejected the order: {0}")]
    Rejected(String),
    #[error("broker unreachable: {0}")]
    Unreachable(#[source] anyhow::Error),
}

/// REST operations a brokerage gateway exposes to the core. One impl talks to a real
/// brokerage over HTTP; another synthesizes every response for dry-run/offline use.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn health_check(&self) -> Result<bool, BrokerError>;
    async fn fetch_account(&self) -> Result<AccountSnapshot, BrokerError>;
    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError>;
    async fn resolve_contract(
        &self,
        ticker: &str,
        expiry: NaiveDate,
        right: OptionRight,
        strike: Decimal,
    ) -> Result<ContractId, BrokerError>;
    async fn place_bracket(&self, order: &BracketOrder) -> Result<BracketPlacement, BrokerError>;
}

/// Pre-built answers to the brokerage's expected confirmation prompts, all acknowledged
/// affirmatively per the spec's placement contract.
#[derive(Debug, Clone, Copy, serde::Serialize)]
struct ConfirmationAnswers {
    price_percentage_constraint: bool,
    order_value_limit: bool,
    missing_market_data: bool,
    stop_order_risks: bool,
}

impl Default for ConfirmationAnswers {
    fn default() -> Self {
        Self {
            price_percentage_constraint: true,
            order_value_limit: true,
            missing_market_data: true,
            stop_order_risks: true,
        }
    }
}

#[derive(serde::Serialize)]
struct SearchResponseRow {
    #[allow(dead_code)]
    symbol: String,
    contract_id: String,
    month: String,
    strike: Decimal,
    right: String,
}

#[derive(serde::Deserialize)]
struct SecdefCandidate {
    contract_id: String,
    month: String,
    strike: Decimal,
    right: String,
}

/// Talks to a real brokerage gateway over HTTP. Contract resolution is underlying lookup
/// first, then option secdef info filtered to the exact `(month, strike, right)`.
pub struct LiveBrokerGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl LiveBrokerGateway {
    pub fn new(http: reqwest::Client, base_url: String, api_key: String, timeout: Duration) -> Self {
        Self {
            http,
            base_url,
            api_key,
            timeout,
        }
    }

    fn to_unreachable(err: anyhow::Error) -> BrokerError {
        BrokerError::Unreachable(err)
    }
}

#[async_trait]
impl BrokerGateway for LiveBrokerGateway {
    async fn health_check(&self) -> Result<bool, BrokerError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .context("broker health check failed")
            .map_err(Self::to_unreachable)?;
        Ok(resp.status().is_success())
    }

    async fn fetch_account(&self) -> Result<AccountSnapshot, BrokerError> {
        #[derive(serde::Deserialize)]
        struct AccountResponse {
            cash_available: Decimal,
            buying_power: Decimal,
            net_liquidation: Decimal,
        }
        let url = format!("{}/accounts", self.base_url);
        let resp: AccountResponse = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .context("accounts request failed")
            .map_err(Self::to_unreachable)?
            .error_for_status()
            .context("accounts request returned an error status")
            .map_err(Self::to_unreachable)?
            .json()
            .await
            .context("accounts response was not valid JSON")
            .map_err(Self::to_unreachable)?;

        Ok(AccountSnapshot {
            cash_available: resp.cash_available,
            buying_power: resp.buying_power,
            net_liquidation: resp.net_liquidation,
            simulated: false,
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
        let url = format!("{}/positions", self.base_url);
        let resp: Vec<PositionSnapshot> = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .context("positions request failed")
            .map_err(Self::to_unreachable)?
            .error_for_status()
            .context("positions request returned an error status")
            .map_err(Self::to_unreachable)?
            .json()
            .await
            .context("positions response was not valid JSON")
            .map_err(Self::to_unreachable)?;
        Ok(resp)
    }

    async fn resolve_contract(
        &self,
        ticker: &str,
        expiry: NaiveDate,
        right: OptionRight,
        strike: Decimal,
    ) -> Result<ContractId, BrokerError> {
        let search_url = format!("{}/contracts/search", self.base_url);
        let candidates: Vec<SecdefCandidate> = self
            .http
            .get(&search_url)
            .bearer_auth(&self.api_key)
            .query(&[("underlying", ticker)])
            .timeout(self.timeout)
            .send()
            .await
            .context("contract search failed")
            .map_err(Self::to_unreachable)?
            .error_for_status()
            .context("contract search returned an error status")
            .map_err(Self::to_unreachable)?
            .json()
            .await
            .context("contract search response was not valid JSON")
            .map_err(Self::to_unreachable)?;

        let month = expiry.format("%Y%m").to_string();
        let right_code = right.code().to_string();
        let matches: Vec<_> = candidates
            .into_iter()
            .filter(|c| c.month == month && c.strike == strike && c.right == right_code)
            .collect();

        match matches.len() {
            1 => Ok(matches.into_iter().next().unwrap().contract_id),
            _ => Err(BrokerError::ContractNotFound),
        }
    }

    async fn place_bracket(&self, order: &BracketOrder) -> Result<BracketPlacement, BrokerError> {
        #[derive(serde::Serialize)]
        struct Leg<'a> {
            client_order_id: &'a str,
            parent_client_order_id: Option<&'a str>,
            contract_id: &'a str,
            side: &'a str,
            order_type: &'a str,
            price: Decimal,
            quantity: u32,
        }
        #[derive(serde::Serialize)]
        struct BracketRequest<'a> {
            legs: Vec<Leg<'a>>,
            confirmations: ConfirmationAnswers,
        }
        #[derive(serde::Deserialize)]
        struct BracketResponse {
            #[serde(default)]
            success: bool,
            #[serde(default)]
            parent_order_id: Option<String>,
            #[serde(default)]
            error: Option<String>,
        }

        let contract_id = order
            .contract_id
            .as_deref()
            .ok_or(BrokerError::ContractNotFound)?;
        let side_str = match order.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let exit_side = match order.side {
            OrderSide::Buy => "SELL",
            OrderSide::Sell => "BUY",
        };

        let parent_id = order.client_order_id.clone();
        let tp_id = format!("{parent_id}-tp");
        let sl_id = format!("{parent_id}-sl");

        let req = BracketRequest {
            legs: vec![
                Leg {
                    client_order_id: &parent_id,
                    parent_client_order_id: None,
                    contract_id,
                    side: side_str,
                    order_type: "LIMIT",
                    price: order.entry_price,
                    quantity: order.quantity,
                },
                Leg {
                    client_order_id: &tp_id,
                    parent_client_order_id: Some(&parent_id),
                    contract_id,
                    side: exit_side,
                    order_type: "LIMIT",
                    price: order.take_profit,
                    quantity: order.quantity,
                },
                Leg {
                    client_order_id: &sl_id,
                    parent_client_order_id: Some(&parent_id),
                    contract_id,
                    side: exit_side,
                    order_type: "STOP",
                    price: order.stop_loss,
                    quantity: order.quantity,
                },
            ],
            confirmations: ConfirmationAnswers::default(),
        };

        let url = format!("{}/orders/bracket", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&req)
            .send()
            .await
            .context("bracket order submission failed")
            .map_err(Self::to_unreachable)?;

        let status = resp.status();
        let body: BracketResponse = resp
            .json()
            .await
            .context("bracket order response was not valid JSON")
            .map_err(Self::to_unreachable)?;

        if !status.is_success() || !body.success {
            return Err(BrokerError::Rejected(
                body.error.unwrap_or_else(|| format!("status {status}")),
            ));
        }

        let parent_order_id = body
            .parent_order_id
            .ok_or_else(|| BrokerError::Rejected("missing parent_order_id".to_string()))?;

        info!(occ_symbol = %order.occ_symbol, parent_order_id = %parent_order_id, "bracket order placed");

        Ok(BracketPlacement {
            success: true,
            parent_order_id,
            simulated: false,
        })
    }
}

/// Used when `StaticConfig::live_trading_enabled` is false, or as the backbone of per-task
/// dry-run synthesis regardless of which gateway is wired at startup. Never touches the
/// network; every response is synthesized.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBrokerGateway;

#[async_trait]
impl BrokerGateway for SimulatedBrokerGateway {
    async fn health_check(&self) -> Result<bool, BrokerError> {
        Ok(true)
    }

    async fn fetch_account(&self) -> Result<AccountSnapshot, BrokerError> {
        Ok(AccountSnapshot {
            cash_available: Decimal::new(10_000_00, 2),
            buying_power: Decimal::new(20_000_00, 2),
            net_liquidation: Decimal::new(10_000_00, 2),
            simulated: true,
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
        Ok(Vec::new())
    }

    async fn resolve_contract(
        &self,
        _ticker: &str,
        _expiry: NaiveDate,
        _right: OptionRight,
        _strike: Decimal,
    ) -> Result<ContractId, BrokerError> {
        Ok("sim-contract".to_string())
    }

    async fn place_bracket(&self, order: &BracketOrder) -> Result<BracketPlacement, BrokerError> {
        Ok(BracketPlacement {
            success: true,
            parent_order_id: format!("sim-{}", uuid::Uuid::new_v4()),
            simulated: true,
        })
        .map(|placement| {
            info!(occ_symbol = %order.occ_symbol, order_id = %placement.parent_order_id, "simulated bracket order");
            placement
        })
    }
}

/// The outcome of `BrokerAdapter::execute`, carried alongside the `Trade` it produced (or the
/// reason none was materialized).
#[derive(Debug, Clone)]
pub struct TradeExecutionResult {
    pub trade: Trade,
    pub success: bool,
    pub error: Option<String>,
}

/// Translates an `Execute` decision into a brokerage-native bracket order, honoring dry-run
/// parity: when `execute_orders` is false the network is never touched, even if a live
/// gateway is wired up, matching the spec's "fully exercised without broker connectivity".
pub struct BrokerAdapter {
    gateway: std::sync::Arc<dyn BrokerGateway>,
}

impl BrokerAdapter {
    pub fn new(gateway: std::sync::Arc<dyn BrokerGateway>) -> Self {
        Self { gateway }
    }

    pub async fn execute(
        &self,
        thread_id: &str,
        decision: &Decision,
        execute_orders: bool,
        model_id: &str,
        confidence: Option<f64>,
    ) -> Result<TradeExecutionResult, BrokerError> {
        let Decision::Execute {
            ticker,
            expiry,
            strike,
            direction,
            side,
            quantity,
            entry_price,
            take_profit,
            stop_loss,
        } = decision
        else {
            return Err(BrokerError::Rejected(
                "execute() called with a non-Execute decision".to_string(),
            ));
        };

        let occ_symbol = occ::build_occ_symbol(ticker, *expiry, *direction, *strike);
        let client_order_id = format!("zdte-{}", uuid::Uuid::new_v4());

        if !execute_orders {
            let order_id = format!("sim-{}", uuid::Uuid::new_v4());
            let trade = Trade {
                id: uuid::Uuid::new_v4(),
                thread_id: thread_id.to_string(),
                parent_order_id: order_id,
                occ_symbol,
                contract_id: None,
                side: *side,
                quantity: *quantity,
                entry_price: *entry_price,
                take_profit: *take_profit,
                stop_loss: *stop_loss,
                model_id: model_id.to_string(),
                confidence,
                status: TradeStatus::Open,
                simulated: true,
                entry_time: Utc::now(),
                exit_time: None,
                exit_price: None,
                pnl: None,
            };
            info!(thread_id, occ_symbol = %trade.occ_symbol, "dry-run bracket order synthesized");
            return Ok(TradeExecutionResult {
                trade,
                success: true,
                error: None,
            });
        }

        let contract_id = match self
            .gateway
            .resolve_contract(ticker, *expiry, *direction, *strike)
            .await
        {
            Ok(id) => id,
            Err(BrokerError::ContractNotFound) => {
                warn!(thread_id, %occ_symbol, "contract resolution found zero/many candidates");
                let trade = Trade {
                    id: uuid::Uuid::new_v4(),
                    thread_id: thread_id.to_string(),
                    parent_order_id: String::new(),
                    occ_symbol,
                    contract_id: None,
                    side: *side,
                    quantity: *quantity,
                    entry_price: *entry_price,
                    take_profit: *take_profit,
                    stop_loss: *stop_loss,
                    model_id: model_id.to_string(),
                    confidence,
                    // Never placed against the broker, so it must never read as an open
                    // position (`TradeStore::has_open_position_for_ticker`/`open_position_count`
                    // filter on `status = 'open'`).
                    status: TradeStatus::ClosedManual,
                    simulated: false,
                    entry_time: Utc::now(),
                    exit_time: None,
                    exit_price: None,
                    pnl: None,
                };
                return Ok(TradeExecutionResult {
                    trade,
                    success: false,
                    error: Some("contract_not_found".to_string()),
                });
            }
            Err(err @ BrokerError::Unreachable(_)) => return Err(err),
            Err(err) => return Err(err),
        };

        let order = BracketOrder {
            client_order_id,
            occ_symbol: occ_symbol.clone(),
            contract_id: Some(contract_id.clone()),
            side: *side,
            quantity: *quantity,
            entry_price: *entry_price,
            take_profit: *take_profit,
            stop_loss: *stop_loss,
        };

        match self.gateway.place_bracket(&order).await {
            Ok(placement) => {
                let trade = Trade {
                    id: uuid::Uuid::new_v4(),
                    thread_id: thread_id.to_string(),
                    parent_order_id: placement.parent_order_id,
                    occ_symbol,
                    contract_id: Some(contract_id),
                    side: *side,
                    quantity: *quantity,
                    entry_price: *entry_price,
                    take_profit: *take_profit,
                    stop_loss: *stop_loss,
                    model_id: model_id.to_string(),
                    confidence,
                    status: TradeStatus::Open,
                    simulated: placement.simulated,
                    entry_time: Utc::now(),
                    exit_time: None,
                    exit_price: None,
                    pnl: None,
                };
                Ok(TradeExecutionResult {
                    trade,
                    success: true,
                    error: None,
                })
            }
            Err(BrokerError::Rejected(reason)) => {
                let trade = Trade {
                    id: uuid::Uuid::new_v4(),
                    thread_id: thread_id.to_string(),
                    parent_order_id: String::new(),
                    occ_symbol,
                    contract_id: Some(contract_id),
                    side: *side,
                    quantity: *quantity,
                    entry_price: *entry_price,
                    take_profit: *take_profit,
                    stop_loss: *stop_loss,
                    model_id: model_id.to_string(),
                    confidence,
                    // Rejected by the broker before any fill; same reasoning as the
                    // contract-not-found branch above.
                    status: TradeStatus::ClosedManual,
                    simulated: false,
                    entry_time: Utc::now(),
                    exit_time: None,
                    exit_price: None,
                    pnl: None,
                };
                Ok(TradeExecutionResult {
                    trade,
                    success: false,
                    error: Some(reason),
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OptionRight;
    use rust_decimal_macros::dec;

    fn sample_execute() -> Decision {
        Decision::Execute {
            ticker: "SPY".to_string(),
            expiry: NaiveDate::from_ymd_opt(2024, 12, 9).unwrap(),
            strike: dec!(605),
            direction: OptionRight::Call,
            side: OrderSide::Buy,
            quantity: 1,
            entry_price: dec!(1.77),
            take_profit: dec!(2.50),
            stop_loss: dec!(1.20),
        }
    }

    #[tokio::test]
    async fn dry_run_never_touches_the_gateway() {
        let adapter = BrokerAdapter::new(std::sync::Arc::new(SimulatedBrokerGateway));
        let result = adapter
            .execute("t1", &sample_execute(), false, "test-model", Some(0.7))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.trade.simulated);
        assert!(result.trade.parent_order_id.starts_with("sim-"));
        assert_eq!(result.trade.occ_symbol, "SPY   241209C00605000");
    }

    #[tokio::test]
    async fn live_execute_against_simulated_gateway_still_marks_not_simulated() {
        // SimulatedBrokerGateway's place_bracket tags `simulated: true` itself; this test
        // exercises the `execute_orders=true` code path rather than SimulatedBrokerGateway's
        // own behavior, which is why the trade still comes back simulated here.
        let adapter = BrokerAdapter::new(std::sync::Arc::new(SimulatedBrokerGateway));
        let result = adapter
            .execute("t1", &sample_execute(), true, "test-model", Some(0.7))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.trade.simulated);
        assert!(result.trade.contract_id.is_some());
    }

    struct ContractNotFoundGateway;
    #[async_trait]
    impl BrokerGateway for ContractNotFoundGateway {
        async fn health_check(&self) -> Result<bool, BrokerError> {
            Ok(true)
        }
        async fn fetch_account(&self) -> Result<AccountSnapshot, BrokerError> {
            unreachable!("not exercised by this test")
        }
        async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
            unreachable!("not exercised by this test")
        }
        async fn resolve_contract(
            &self,
            _ticker: &str,
            _expiry: NaiveDate,
            _right: OptionRight,
            _strike: Decimal,
        ) -> Result<ContractId, BrokerError> {
            Err(BrokerError::ContractNotFound)
        }
        async fn place_bracket(&self, _order: &BracketOrder) -> Result<BracketPlacement, BrokerError> {
            unreachable!("resolve_contract fails first")
        }
    }

    struct RejectingGateway;
    #[async_trait]
    impl BrokerGateway for RejectingGateway {
        async fn health_check(&self) -> Result<bool, BrokerError> {
            Ok(true)
        }
        async fn fetch_account(&self) -> Result<AccountSnapshot, BrokerError> {
            unreachable!("not exercised by this test")
        }
        async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
            unreachable!("not exercised by this test")
        }
        async fn resolve_contract(
            &self,
            _ticker: &str,
            _expiry: NaiveDate,
            _right: OptionRight,
            _strike: Decimal,
        ) -> Result<ContractId, BrokerError> {
            Ok("contract-1".to_string())
        }
        async fn place_bracket(&self, _order: &BracketOrder) -> Result<BracketPlacement, BrokerError> {
            Err(BrokerError::Rejected("insufficient buying power".to_string()))
        }
    }

    #[tokio::test]
    async fn contract_not_found_does_not_fabricate_an_open_position() {
        let adapter = BrokerAdapter::new(std::sync::Arc::new(ContractNotFoundGateway));
        let result = adapter
            .execute("t1", &sample_execute(), true, "test-model", Some(0.7))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("contract_not_found"));
        assert_ne!(result.trade.status, TradeStatus::Open);
        assert!(result.trade.parent_order_id.is_empty());
    }

    #[tokio::test]
    async fn rejected_order_does_not_fabricate_an_open_position() {
        let adapter = BrokerAdapter::new(std::sync::Arc::new(RejectingGateway));
        let result = adapter
            .execute("t1", &sample_execute(), true, "test-model", Some(0.7))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("insufficient buying power"));
        assert_ne!(result.trade.status, TradeStatus::Open);
        assert!(result.trade.parent_order_id.is_empty());
    }
}
