//! Idempotent signal and trade persistence against the shared SQLite database.
//!
//! Grounded on `signals/db_storage.rs`'s upsert-by-key idiom (`INSERT ... ON CONFLICT DO
//! UPDATE`, JSON-blob columns for heterogeneous nested data) and `vault/user_accounts.rs`'s
//! insert-then-update-by-id pattern for trade rows, both generalized from their respective
//! domain rows to the `signals`/`trades` tables this crate owns.

use crate::db::Db;
use crate::error::AppError;
use crate::models::{Decision, Signal, Trade, TradeStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The envelope written to a signal's `decision_json` column. Shape is fixed by the external
/// contract dashboards read: `{act, reasoning, decision, trade_result?, model_used, timestamp,
/// trace_id?}`, plus an optional `scheduled_reanalysis` marker for `Delay` outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEnvelope {
    pub act: String,
    pub reasoning: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_result: Option<TradeResultSummary>,
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_reanalysis: Option<ScheduledReanalysisMarker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResultSummary {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub trade_id: uuid::Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledReanalysisMarker {
    pub due_at: DateTime<Utc>,
    pub delay_minutes: u32,
    pub question: String,
}

impl DecisionEnvelope {
    pub fn act_label(decision: &Decision) -> &'static str {
        match decision {
            Decision::Skip { .. } => "skip",
            Decision::Execute { .. } => "execute",
            Decision::Delay { .. } => "schedule",
        }
    }
}

#[derive(Clone)]
pub struct SignalStore {
    db: Db,
}

impl SignalStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Writes the raw signal at enqueue time so the row exists before a decision is reached.
    pub fn upsert_signal(&self, signal: &Signal) -> Result<(), AppError> {
        let signal_json = serde_json::to_string(signal)
            .map_err(|e| AppError::StoreWriteError(e.into()))?;
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO signals (thread_id, signal_json) VALUES (?1, ?2)
                     ON CONFLICT(thread_id) DO UPDATE SET signal_json = excluded.signal_json",
                    rusqlite::params![signal.thread_id, signal_json],
                )?;
                Ok(())
            })
            .map_err(|e| AppError::StoreWriteError(e.into()))
    }

    /// Idempotent by `thread_id`: replaying the same envelope leaves the row unchanged in
    /// substance (only `last_decided_at` reflects the most recent write).
    pub fn save_result(&self, thread_id: &str, envelope: &DecisionEnvelope) -> Result<(), AppError> {
        let decision_json =
            serde_json::to_string(envelope).map_err(|e| AppError::StoreWriteError(e.into()))?;
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE signals SET decision_json = ?1, last_decided_at = ?2 WHERE thread_id = ?3",
                    rusqlite::params![decision_json, envelope.timestamp.timestamp(), thread_id],
                )?;
                Ok(())
            })
            .map_err(|e| AppError::StoreWriteError(e.into()))
    }

    /// Reads back the raw signal an upstream collector wrote at enqueue time. `None` means the
    /// thread_id was never seen by `upsert_signal` - a task popped off the queue with no
    /// matching row is a data-integrity problem upstream, not something this core can repair.
    pub fn get_signal(&self, thread_id: &str) -> Result<Option<Signal>, AppError> {
        let raw = self
            .db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT signal_json FROM signals WHERE thread_id = ?1",
                        [thread_id],
                        |row| row.get::<_, String>(0),
                    )
                    .ok())
            })
            .map_err(|e| AppError::StoreWriteError(e.into()))?;

        match raw {
            Some(json) => {
                let signal = serde_json::from_str(&json).map_err(|e| AppError::StoreWriteError(e.into()))?;
                Ok(Some(signal))
            }
            None => Ok(None),
        }
    }

    pub fn get_decision(&self, thread_id: &str) -> Result<Option<DecisionEnvelope>, AppError> {
        let raw = self
            .db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT decision_json FROM signals WHERE thread_id = ?1",
                        [thread_id],
                        |row| row.get::<_, Option<String>>(0),
                    )
                    .ok()
                    .flatten())
            })
            .map_err(|e| AppError::StoreWriteError(e.into()))?;

        match raw {
            Some(json) => {
                let envelope = serde_json::from_str(&json).map_err(|e| AppError::StoreWriteError(e.into()))?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }
}

#[derive(Clone)]
pub struct TradeStore {
    db: Db,
}

impl TradeStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn insert(&self, trade: &Trade) -> Result<(), AppError> {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO trades (
                        id, thread_id, parent_order_id, occ_symbol, contract_id, side, quantity,
                        entry_price, take_profit, stop_loss, model_id, confidence, status,
                        simulated, entry_time, exit_time, exit_price, pnl
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                    rusqlite::params![
                        trade.id.to_string(),
                        trade.thread_id,
                        trade.parent_order_id,
                        trade.occ_symbol,
                        trade.contract_id,
                        side_str(trade.side),
                        trade.quantity,
                        trade.entry_price.to_string(),
                        trade.take_profit.to_string(),
                        trade.stop_loss.to_string(),
                        trade.model_id,
                        trade.confidence,
                        trade.status.as_str(),
                        trade.simulated as i64,
                        trade.entry_time.timestamp(),
                        trade.exit_time.map(|t| t.timestamp()),
                        trade.exit_price.map(|p| p.to_string()),
                        trade.pnl.map(|p| p.to_string()),
                    ],
                )?;
                Ok(())
            })
            .map_err(|e| AppError::StoreWriteError(e.into()))
    }

    /// Closes a trade by its core-assigned id, the shape the fill monitor uses once it has
    /// matched a broker fill back to the parent order id stored at placement time.
    pub fn close(
        &self,
        trade_id: uuid::Uuid,
        status: TradeStatus,
        exit_price: Decimal,
        pnl: Decimal,
        exit_time: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE trades SET status = ?1, exit_price = ?2, pnl = ?3, exit_time = ?4 WHERE id = ?5",
                    rusqlite::params![
                        status.as_str(),
                        exit_price.to_string(),
                        pnl.to_string(),
                        exit_time.timestamp(),
                        trade_id.to_string(),
                    ],
                )?;
                Ok(())
            })
            .map_err(|e| AppError::StoreWriteError(e.into()))
    }

    pub fn has_open_position_for_ticker(&self, ticker: &str) -> Result<bool, AppError> {
        let occ_prefix = format!("{:<6}", ticker.to_uppercase());
        self.db
            .with_conn(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM trades WHERE status = 'open' AND occ_symbol LIKE ?1",
                    [format!("{occ_prefix}%")],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .map_err(|e| AppError::StoreWriteError(e.into()))
    }

    pub fn open_position_count(&self) -> Result<u32, AppError> {
        self.db
            .with_conn(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM trades WHERE status = 'open'", [], |row| row.get(0))?;
                Ok(count as u32)
            })
            .map_err(|e| AppError::StoreWriteError(e.into()))
    }

    /// Used by the fill monitor to find a trade by the broker-issued parent order id.
    pub fn find_open_by_parent_order_id(&self, parent_order_id: &str) -> Result<Option<Trade>, AppError> {
        self.db
            .with_conn(|conn| {
                let result = conn.query_row(
                    "SELECT id, thread_id, parent_order_id, occ_symbol, contract_id, side, quantity,
                            entry_price, take_profit, stop_loss, model_id, confidence, status,
                            simulated, entry_time, exit_time, exit_price, pnl
                     FROM trades WHERE parent_order_id = ?1 AND status = 'open'",
                    [parent_order_id],
                    row_to_trade,
                );
                Ok(result.ok())
            })
            .map_err(|e| AppError::StoreWriteError(e.into()))
    }
}

fn side_str(side: crate::models::OrderSide) -> &'static str {
    match side {
        crate::models::OrderSide::Buy => "BUY",
        crate::models::OrderSide::Sell => "SELL",
    }
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    let id: String = row.get(0)?;
    let side: String = row.get(5)?;
    let status: String = row.get(12)?;
    let entry_price: String = row.get(7)?;
    let take_profit: String = row.get(8)?;
    let stop_loss: String = row.get(9)?;
    let exit_price: Option<String> = row.get(16)?;
    let pnl: Option<String> = row.get(17)?;
    let entry_time: i64 = row.get(14)?;
    let exit_time: Option<i64> = row.get(15)?;

    Ok(Trade {
        id: uuid::Uuid::parse_str(&id).unwrap_or_default(),
        thread_id: row.get(1)?,
        parent_order_id: row.get(2)?,
        occ_symbol: row.get(3)?,
        contract_id: row.get(4)?,
        side: if side == "BUY" {
            crate::models::OrderSide::Buy
        } else {
            crate::models::OrderSide::Sell
        },
        quantity: row.get(6)?,
        entry_price: Decimal::from_str(&entry_price).unwrap_or_default(),
        take_profit: Decimal::from_str(&take_profit).unwrap_or_default(),
        stop_loss: Decimal::from_str(&stop_loss).unwrap_or_default(),
        model_id: row.get(10)?,
        confidence: row.get(11)?,
        status: match status.as_str() {
            "open" => TradeStatus::Open,
            "closed_tp" => TradeStatus::ClosedTp,
            "closed_sl" => TradeStatus::ClosedSl,
            "closed_expired" => TradeStatus::ClosedExpired,
            _ => TradeStatus::ClosedManual,
        },
        simulated: row.get::<_, i64>(13)? != 0,
        entry_time: DateTime::from_timestamp(entry_time, 0).unwrap_or_else(Utc::now),
        exit_time: exit_time.and_then(|t| DateTime::from_timestamp(t, 0)),
        exit_price: exit_price.and_then(|p| Decimal::from_str(&p).ok()),
        pnl: pnl.and_then(|p| Decimal::from_str(&p).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OptionRight, OrderSide, SkipCategory};
    use rust_decimal_macros::dec;

    fn sample_signal() -> Signal {
        Signal {
            thread_id: "t1".to_string(),
            messages: vec![],
            parsed: Default::default(),
        }
    }

    fn sample_trade() -> Trade {
        Trade {
            id: uuid::Uuid::new_v4(),
            thread_id: "t1".to_string(),
            parent_order_id: "sim-abc".to_string(),
            occ_symbol: "SPY   260731C00605000".to_string(),
            contract_id: None,
            side: OrderSide::Buy,
            quantity: 1,
            entry_price: dec!(1.77),
            take_profit: dec!(2.50),
            stop_loss: dec!(1.20),
            model_id: "test-model".to_string(),
            confidence: Some(0.8),
            status: TradeStatus::Open,
            simulated: true,
            entry_time: Utc::now(),
            exit_time: None,
            exit_price: None,
            pnl: None,
        }
    }

    #[test]
    fn signal_save_result_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let store = SignalStore::new(db);
        store.upsert_signal(&sample_signal()).unwrap();

        let envelope = DecisionEnvelope {
            act: "skip".to_string(),
            reasoning: "no edge".to_string(),
            decision: Decision::Skip {
                reason: "no edge".to_string(),
                category: SkipCategory::LowConfidence,
            },
            trade_result: None,
            model_used: "test-model".to_string(),
            timestamp: Utc::now(),
            trace_id: None,
            scheduled_reanalysis: None,
        };

        store.save_result("t1", &envelope).unwrap();
        store.save_result("t1", &envelope).unwrap();

        let stored = store.get_decision("t1").unwrap().unwrap();
        assert_eq!(stored.act, "skip");
    }

    #[test]
    fn get_signal_round_trips_and_is_none_when_absent() {
        let db = Db::open_in_memory().unwrap();
        let store = SignalStore::new(db);
        assert!(store.get_signal("t1").unwrap().is_none());
        store.upsert_signal(&sample_signal()).unwrap();
        let found = store.get_signal("t1").unwrap().unwrap();
        assert_eq!(found.thread_id, "t1");
    }

    #[test]
    fn trade_insert_then_close_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let store = TradeStore::new(db);
        let trade = sample_trade();
        store.insert(&trade).unwrap();

        assert!(store.has_open_position_for_ticker("SPY").unwrap());
        assert_eq!(store.open_position_count().unwrap(), 1);

        let found = store.find_open_by_parent_order_id("sim-abc").unwrap().unwrap();
        assert_eq!(found.id, trade.id);

        store
            .close(trade.id, TradeStatus::ClosedTp, dec!(2.50), dec!(0.73), Utc::now())
            .unwrap();
        assert!(!store.has_open_position_for_ticker("SPY").unwrap());
        assert_eq!(store.open_position_count().unwrap(), 0);
    }

    #[test]
    fn occ_symbol_ticker_prefix_does_not_false_match_similar_tickers() {
        let db = Db::open_in_memory().unwrap();
        let store = TradeStore::new(db);
        let mut trade = sample_trade();
        trade.occ_symbol = "SPX   260731C04200000".to_string();
        store.insert(&trade).unwrap();
        assert!(!store.has_open_position_for_ticker("SPY").unwrap());
        assert!(store.has_open_position_for_ticker("SPX").unwrap());
    }
}
