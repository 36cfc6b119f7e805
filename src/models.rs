//! Core data model: Signal, Task, PrefetchBundle, Decision, Trade, RuntimeConfig.
//!
//! Grounded on `models.rs`'s `Signal`/`SignalType` (plain struct + `as_str()` idiom) and
//! `signals/db_storage.rs`'s `VaultLlmDecisionRow` for the decision-envelope shape.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One message in a signal's upstream thread. Best-effort metadata from an upstream AI
/// pass (if the forum software attaches one) is carried verbatim and never interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_ai_meta: Option<serde_json::Value>,
}

/// Direction as it can appear in a raw signal. Distinct from `OptionRight`/`OrderSide` since
/// an upstream collector may only ever say "CALL" or "BUY" without the other axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalDirection {
    Call,
    Put,
    Buy,
    Sell,
}

impl SignalDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CALL" => Some(Self::Call),
            "PUT" => Some(Self::Put),
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// Best-effort fields parsed out of a signal's messages by the upstream collector. Absence
/// is valid and is surfaced to the LLM as "NOT SPECIFIED" rather than omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<SignalDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strike: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    /// Confidence in [0, 1]. Values outside range are treated as absent by the precondition
    /// chain rather than clamped, so a bad parse doesn't silently pass `MinConfidence`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ParsedFields {
    pub fn confidence_in_range(&self) -> Option<f64> {
        self.confidence.filter(|c| (0.0..=1.0).contains(c))
    }
}

/// One queued work unit's referent: the signal itself. Read-only to the core except for the
/// decision envelope appended after processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub thread_id: String,
    pub messages: Vec<SignalMessage>,
    #[serde(default)]
    pub parsed: ParsedFields,
}

impl Signal {
    /// Raw text content the LLM falls back on when a field wasn't parsed.
    pub fn raw_content(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Carried retry/delay state when a task re-enters the pipeline after a `Delay` decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledContext {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_tool_call_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_levels: Option<serde_json::Value>,
}

/// A queue entry pointing to a Signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub thread_id: String,
    pub thread_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_context: Option<ScheduledContext>,
}

/// Outcome category for a `Skip` decision, used for dashboards and for the `position_exists`
/// precondition short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCategory {
    NoSignal,
    MarketClosed,
    BadRr,
    LowConfidence,
    Timing,
    PositionExists,
    Other,
}

/// Which side of the option chain an `Execute` decision resolves to. Distinct from
/// `SignalDirection` because the LLM must resolve "BUY"/"SELL" into one of these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    pub fn code(self) -> char {
        match self {
            OptionRight::Call => 'C',
            OptionRight::Put => 'P',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// The LLM's terminal choice for a task. Constructed in exactly one place
/// (`decision::ToolDispatch::into_decision`); everything downstream pattern-matches this enum
/// rather than threading an untyped argument map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "act", rename_all = "snake_case")]
pub enum Decision {
    Skip {
        reason: String,
        category: SkipCategory,
    },
    Execute {
        ticker: String,
        expiry: NaiveDate,
        strike: Decimal,
        direction: OptionRight,
        side: OrderSide,
        quantity: u32,
        entry_price: Decimal,
        take_profit: Decimal,
        stop_loss: Decimal,
    },
    Delay {
        delay_minutes: u32,
        reason: String,
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_levels: Option<serde_json::Value>,
    },
}

impl Decision {
    /// `stop_loss < entry_price < take_profit` for CALL/BUY, mirrored for PUT/SELL.
    /// Reward/risk sizing is the LLM's responsibility; this only checks ordering.
    pub fn bracket_is_valid(
        direction: OptionRight,
        side: OrderSide,
        entry_price: Decimal,
        take_profit: Decimal,
        stop_loss: Decimal,
    ) -> bool {
        let bullish = matches!((direction, side), (OptionRight::Call, OrderSide::Buy));
        if bullish {
            stop_loss < entry_price && entry_price < take_profit
        } else {
            take_profit < entry_price && entry_price < stop_loss
        }
    }

    pub fn delay_minutes_in_range(delay_minutes: u32) -> bool {
        (5..=240).contains(&delay_minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    ClosedTp,
    ClosedSl,
    ClosedManual,
    ClosedExpired,
}

impl TradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::ClosedTp => "closed_tp",
            TradeStatus::ClosedSl => "closed_sl",
            TradeStatus::ClosedManual => "closed_manual",
            TradeStatus::ClosedExpired => "closed_expired",
        }
    }
}

/// Materialized only when an `Execute` decision succeeds. At most one `open` trade per
/// `thread_id`; `simulated` is sticky from creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: uuid::Uuid,
    pub thread_id: String,
    pub parent_order_id: String,
    pub occ_symbol: String,
    pub contract_id: Option<String>,
    pub side: OrderSide,
    pub quantity: u32,
    pub entry_price: Decimal,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
    pub model_id: String,
    pub confidence: Option<f64>,
    pub status: TradeStatus,
    pub simulated: bool,
    pub entry_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<Decimal>,
}

/// One sub-fetch result in the prefetch bundle. Missing/errored sub-fetches degrade to
/// `Unavailable` rather than aborting the pipeline or being omitted from the rendered prompt.
///
/// Adjacently tagged (`content = "data"`) rather than internally tagged: `positions` wraps a
/// `Vec`, and internal tagging only supports map-shaped variant content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum PrefetchField<T> {
    Available(T),
    Unavailable { kind: String, reason: String },
}

impl<T> PrefetchField<T> {
    pub fn ok(&self) -> Option<&T> {
        match self {
            PrefetchField::Available(v) => Some(v),
            PrefetchField::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatusReason {
    MarketOpen,
    PreMarket,
    AfterHours,
    Weekend,
    Holiday,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSnapshot {
    pub now_eastern: DateTime<Utc>,
    pub market_open: bool,
    pub status_reason: MarketStatusReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opens_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closes_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionQuote {
    pub strike: Decimal,
    pub right: OptionRight,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub mid: Decimal,
    pub volume: u64,
    pub open_interest: u64,
    pub iv: Option<f64>,
    pub itm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionChainSnapshot {
    pub underlying_price: Decimal,
    pub expiry: NaiveDate,
    pub quotes: Vec<OptionQuote>,
    pub available_expiries: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub cash_available: Decimal,
    pub buying_power: Decimal,
    pub net_liquidation: Decimal,
    pub simulated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub ticker: String,
    pub quantity: i64,
    pub avg_cost: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VixBand {
    Low,
    Normal,
    Elevated,
    High,
    Extreme,
}

impl VixBand {
    pub fn from_level(level: f64) -> Self {
        if level < 15.0 {
            VixBand::Low
        } else if level < 20.0 {
            VixBand::Normal
        } else if level < 25.0 {
            VixBand::Elevated
        } else if level < 30.0 {
            VixBand::High
        } else {
            VixBand::Extreme
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VixSnapshot {
    pub level: f64,
    pub band: VixBand,
}

/// The opaque, read-only snapshot passed into prompt assembly. Every field is a primitive
/// record, never a callable reference, so it serializes cleanly into the template context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchBundle {
    pub signal: Signal,
    pub time: PrefetchField<TimeSnapshot>,
    pub option_chain: PrefetchField<OptionChainSnapshot>,
    pub account: PrefetchField<AccountSnapshot>,
    pub positions: PrefetchField<Vec<PositionSnapshot>>,
    pub vix: PrefetchField<VixSnapshot>,
}

impl PrefetchBundle {
    pub fn market_is_open(&self) -> bool {
        self.time.ok().map(|t| t.market_open).unwrap_or(false)
    }
}

/// Process-wide, dashboard-editable state bag. Re-read from the backing store on every task;
/// never cached beyond the scope of a single task's processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub emergency_stop: bool,
    pub execute_orders: bool,
    pub max_concurrent_positions: u32,
    pub max_vix_level: f64,
    pub min_ai_confidence_score: f64,
    pub whitelist_tickers: Vec<String>,
    pub blacklist_tickers: Vec<String>,
    pub max_loss_per_trade_percent: f64,
    pub max_daily_trades: u32,
    pub max_loss_per_day_percent: f64,
    pub default_stop_loss_percent: f64,
    pub default_take_profit_percent: f64,
    pub trailing_stop_enabled: bool,
    pub trailing_stop_activation_percent: f64,
    pub trailing_stop_distance_percent: f64,
    pub max_position_size_percent: f64,
    pub current_llm_model: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            emergency_stop: false,
            execute_orders: false,
            max_concurrent_positions: 5,
            max_vix_level: 25.0,
            min_ai_confidence_score: 0.5,
            whitelist_tickers: vec!["SPY".to_string(), "QQQ".to_string()],
            blacklist_tickers: Vec::new(),
            max_loss_per_trade_percent: 0.1,
            max_daily_trades: 10,
            max_loss_per_day_percent: 0.1,
            default_stop_loss_percent: 0.3,
            default_take_profit_percent: 0.5,
            trailing_stop_enabled: false,
            trailing_stop_activation_percent: 0.2,
            trailing_stop_distance_percent: 0.1,
            max_position_size_percent: 0.2,
            current_llm_model: "deepseek/deepseek-reasoner".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn bracket_validity_call_buy() {
        assert!(Decision::bracket_is_valid(
            OptionRight::Call,
            OrderSide::Buy,
            dec!(1.77),
            dec!(2.50),
            dec!(1.20)
        ));
        assert!(!Decision::bracket_is_valid(
            OptionRight::Call,
            OrderSide::Buy,
            dec!(1.77),
            dec!(1.50),
            dec!(1.20)
        ));
    }

    #[test]
    fn bracket_validity_put_sell_mirrors() {
        assert!(Decision::bracket_is_valid(
            OptionRight::Put,
            OrderSide::Sell,
            dec!(2.00),
            dec!(1.20),
            dec!(2.80)
        ));
    }

    #[test]
    fn delay_minutes_bounds() {
        assert!(Decision::delay_minutes_in_range(5));
        assert!(Decision::delay_minutes_in_range(240));
        assert!(!Decision::delay_minutes_in_range(4));
        assert!(!Decision::delay_minutes_in_range(241));
    }

    #[test]
    fn vix_bands_match_spec_boundaries() {
        assert_eq!(VixBand::from_level(14.9), VixBand::Low);
        assert_eq!(VixBand::from_level(15.0), VixBand::Normal);
        assert_eq!(VixBand::from_level(19.99), VixBand::Normal);
        assert_eq!(VixBand::from_level(20.0), VixBand::Elevated);
        assert_eq!(VixBand::from_level(25.0), VixBand::High);
        assert_eq!(VixBand::from_level(30.0), VixBand::Extreme);
    }

    #[test]
    fn confidence_out_of_range_is_treated_as_absent() {
        let mut f = ParsedFields::default();
        f.confidence = Some(1.4);
        assert_eq!(f.confidence_in_range(), None);
        f.confidence = Some(0.8);
        assert_eq!(f.confidence_in_range(), Some(0.8));
    }
}
