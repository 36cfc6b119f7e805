//! The three tool schemas offered to the LLM and the one place a tool call is turned into a
//! typed `Decision`.
//!
//! Grounded on `vault/llm.rs`'s `parse_decision_dsl` (single validating parse function, one
//! error path for anything malformed) generalized from a free-text DSL to JSON tool-call
//! arguments, since the spec's contract is an OpenAI-style `tool_choice: "required"` call
//! rather than a DSL embedded in message content.

use crate::error::AppError;
use crate::models::{Decision, OptionRight, OrderSide, SkipCategory};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

pub const SKIP_SIGNAL: &str = "skip_signal";
pub const PLACE_BRACKET_ORDER: &str = "place_bracket_order";
pub const SCHEDULE_REANALYSIS: &str = "schedule_reanalysis";

/// The `tools` array sent on every chat-completion request. Order doesn't matter to the API
/// but is kept stable here for readable diffs.
pub fn tool_schemas() -> serde_json::Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": SKIP_SIGNAL,
                "description": "Decline to trade this signal.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "reason": { "type": "string" },
                        "category": {
                            "type": "string",
                            "enum": ["no_signal", "market_closed", "bad_rr", "low_confidence", "timing", "position_exists", "other"]
                        }
                    },
                    "required": ["reason", "category"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": PLACE_BRACKET_ORDER,
                "description": "Place a bracket order: one entry order plus a take-profit and stop-loss child order.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "ticker": { "type": "string" },
                        "expiry": { "type": "string", "description": "YYYY-MM-DD" },
                        "strike": { "type": "number" },
                        "direction": { "type": "string", "enum": ["CALL", "PUT"] },
                        "side": { "type": "string", "enum": ["BUY", "SELL"] },
                        "quantity": { "type": "integer", "minimum": 1 },
                        "entry_price": { "type": "number" },
                        "take_profit": { "type": "number" },
                        "stop_loss": { "type": "number" }
                    },
                    "required": ["ticker", "expiry", "strike", "direction", "side", "quantity", "entry_price", "take_profit", "stop_loss"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": SCHEDULE_REANALYSIS,
                "description": "Defer the decision and re-run this signal through the pipeline after a short delay.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "delay_minutes": { "type": "integer", "minimum": 5, "maximum": 240 },
                        "reason": { "type": "string" },
                        "question": { "type": "string", "description": "The specific thing being waited on." },
                        "key_levels": { "type": "object" }
                    },
                    "required": ["delay_minutes", "reason", "question"]
                }
            }
        }
    ])
}

#[derive(Debug, Deserialize)]
struct SkipArgs {
    reason: String,
    category: String,
}

#[derive(Debug, Deserialize)]
struct PlaceBracketArgs {
    ticker: String,
    expiry: NaiveDate,
    strike: Decimal,
    direction: String,
    side: String,
    quantity: u32,
    entry_price: Decimal,
    take_profit: Decimal,
    stop_loss: Decimal,
}

#[derive(Debug, Deserialize)]
struct ScheduleReanalysisArgs {
    delay_minutes: u32,
    reason: String,
    question: String,
    #[serde(default)]
    key_levels: Option<serde_json::Value>,
}

fn parse_category(s: &str) -> SkipCategory {
    match s {
        "no_signal" => SkipCategory::NoSignal,
        "market_closed" => SkipCategory::MarketClosed,
        "bad_rr" => SkipCategory::BadRr,
        "low_confidence" => SkipCategory::LowConfidence,
        "timing" => SkipCategory::Timing,
        "position_exists" => SkipCategory::PositionExists,
        _ => SkipCategory::Other,
    }
}

fn parse_direction(s: &str) -> Result<OptionRight, AppError> {
    match s {
        "CALL" => Ok(OptionRight::Call),
        "PUT" => Ok(OptionRight::Put),
        other => Err(AppError::LlmFormat(format!("unrecognized direction {other:?}"))),
    }
}

fn parse_side(s: &str) -> Result<OrderSide, AppError> {
    match s {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(AppError::LlmFormat(format!("unrecognized side {other:?}"))),
    }
}

/// Turns a single tool call's `(function_name, arguments_json)` into a `Decision`. The only
/// place a `Decision` value is constructed outside of tests.
pub fn into_decision(function_name: &str, arguments_json: &str) -> Result<Decision, AppError> {
    match function_name {
        SKIP_SIGNAL => {
            let args: SkipArgs = serde_json::from_str(arguments_json)
                .map_err(|e| AppError::LlmFormat(format!("skip_signal arguments: {e}")))?;
            Ok(Decision::Skip {
                reason: args.reason,
                category: parse_category(&args.category),
            })
        }
        PLACE_BRACKET_ORDER => {
            let args: PlaceBracketArgs = serde_json::from_str(arguments_json)
                .map_err(|e| AppError::LlmFormat(format!("place_bracket_order arguments: {e}")))?;
            let direction = parse_direction(&args.direction)?;
            let side = parse_side(&args.side)?;
            if args.quantity == 0 {
                return Err(AppError::LlmFormat("quantity must be at least 1".to_string()));
            }
            if !Decision::bracket_is_valid(direction, side, args.entry_price, args.take_profit, args.stop_loss) {
                return Err(AppError::LlmFormat(
                    "take_profit/entry_price/stop_loss are not correctly ordered for this direction+side".to_string(),
                ));
            }
            Ok(Decision::Execute {
                ticker: args.ticker,
                expiry: args.expiry,
                strike: args.strike,
                direction,
                side,
                quantity: args.quantity,
                entry_price: args.entry_price,
                take_profit: args.take_profit,
                stop_loss: args.stop_loss,
            })
        }
        SCHEDULE_REANALYSIS => {
            let args: ScheduleReanalysisArgs = serde_json::from_str(arguments_json)
                .map_err(|e| AppError::LlmFormat(format!("schedule_reanalysis arguments: {e}")))?;
            if !Decision::delay_minutes_in_range(args.delay_minutes) {
                return Err(AppError::LlmFormat(format!(
                    "delay_minutes {} out of the 5..=240 range",
                    args.delay_minutes
                )));
            }
            Ok(Decision::Delay {
                delay_minutes: args.delay_minutes,
                reason: args.reason,
                question: args.question,
                key_levels: args.key_levels,
            })
        }
        other => Err(AppError::LlmFormat(format!("unrecognized tool name {other:?}"))),
    }
}
