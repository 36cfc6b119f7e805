//! Prompt template storage and rendering. Templates are stored in SQLite so an operator can
//! edit them live from the dashboard; the embedded constants here are only the seed/fallback
//! text used the first time a row is read.
//!
//! Grounded on `config.rs`'s `RuntimeConfigStore` (get-or-seed-default-then-persist idiom)
//! generalized from scalar config values to template text, and on `vault/llm.rs`'s use of a
//! fixed system-prompt string as the grounding for what belongs in `DEFAULT_SYSTEM_PROMPT`.

use crate::db::Db;
use crate::error::AppError;
use crate::models::PrefetchBundle;
use tera::{Context, Tera};

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a 0DTE options execution agent. You are given a trade signal and a
snapshot of current market, account, and position data. You must choose exactly one of the
provided tools: skip_signal, place_bracket_order, or schedule_reanalysis.

Only place an order when the signal, option chain, and account data together support a
reasonably sized bracket trade. Prefer skip_signal over a marginal trade. Use
schedule_reanalysis when a short, bounded wait (5 to 240 minutes) would materially improve
the decision - for example waiting for the market to open, or for a quote to refresh - and
name the specific thing you are waiting on in `question`."#;

pub const DEFAULT_USER_TEMPLATE: &str = r#"## Signal
Thread: {{ signal.thread_id }}
{% for message in signal.messages %}
- [{{ message.timestamp }}] {{ message.content }}
{% endfor %}

Parsed fields:
- ticker: {{ signal.parsed.ticker | default(value="NOT SPECIFIED") }}
- direction: {{ signal.parsed.direction | default(value="NOT SPECIFIED") }}
- strike: {{ signal.parsed.strike | default(value="NOT SPECIFIED") }}
- expiry: {{ signal.parsed.expiry | default(value="NOT SPECIFIED") }}
- entry_price: {{ signal.parsed.entry_price | default(value="NOT SPECIFIED") }}
- target_price: {{ signal.parsed.target_price | default(value="NOT SPECIFIED") }}
- stop_loss: {{ signal.parsed.stop_loss | default(value="NOT SPECIFIED") }}
- confidence: {{ signal.parsed.confidence | default(value="NOT SPECIFIED") }}

## Market time
{% if time.status == "available" %}
market_open={{ time.data.market_open }} reason={{ time.data.status_reason }}
{% else %}
unavailable: {{ time.data.reason }}
{% endif %}

## Option chain
{% if option_chain.status == "available" %}
underlying_price={{ option_chain.data.underlying_price }} expiry={{ option_chain.data.expiry }}
{% for q in option_chain.data.quotes %}
- {{ q.right }} {{ q.strike }}: bid={{ q.bid }} ask={{ q.ask }} mid={{ q.mid }} itm={{ q.itm }}
{% endfor %}
{% else %}
unavailable: {{ option_chain.data.reason }}
{% endif %}

## Account
{% if account.status == "available" %}
cash_available={{ account.data.cash_available }} buying_power={{ account.data.buying_power }}
{% else %}
unavailable: {{ account.data.reason }}
{% endif %}

## Positions
{% if positions.status == "available" %}
{% for p in positions.data %}
- {{ p.ticker }}: qty={{ p.quantity }} avg_cost={{ p.avg_cost }} unrealized_pnl={{ p.unrealized_pnl }}
{% endfor %}
{% else %}
unavailable: {{ positions.data.reason }}
{% endif %}

## VIX
{% if vix.status == "available" %}
level={{ vix.data.level }} band={{ vix.data.band }}
{% else %}
unavailable: {{ vix.data.reason }}
{% endif %}
"#;

/// Persists and re-reads operator-editable prompt text. Mirrors `RuntimeConfigStore`'s
/// get-or-seed shape: the first read seeds the embedded default into `prompt_templates`, every
/// subsequent read comes straight from the row.
#[derive(Clone)]
pub struct PromptStore {
    db: Db,
}

impl PromptStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn get_system_prompt(&self) -> Result<String, AppError> {
        self.get_or_seed("system_prompt", DEFAULT_SYSTEM_PROMPT)
    }

    pub fn get_user_template(&self) -> Result<String, AppError> {
        self.get_or_seed("user_template", DEFAULT_USER_TEMPLATE)
    }

    pub fn put(&self, kind: &str, text: &str) -> Result<(), AppError> {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO prompt_templates (kind, body, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(kind) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                    rusqlite::params![kind, text, chrono::Utc::now().timestamp()],
                )?;
                Ok(())
            })
            .map_err(|e| AppError::StoreWriteError(e.into()))
    }

    fn get_or_seed(&self, kind: &str, default: &str) -> Result<String, AppError> {
        let existing = self
            .db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM prompt_templates WHERE kind = ?1",
                        [kind],
                        |row| row.get::<_, String>(0),
                    )
                    .ok())
            })
            .map_err(|e| AppError::QueueUnreachable(e.into()))?;

        match existing {
            Some(text) => Ok(text),
            None => {
                self.put(kind, default)?;
                Ok(default.to_string())
            }
        }
    }
}

/// Renders the user template against a `PrefetchBundle`. A fresh `Tera` instance is built per
/// render since the template text can change between tasks (an operator may edit it mid-run).
pub fn render_user_prompt(template_text: &str, bundle: &PrefetchBundle) -> Result<String, AppError> {
    let mut tera = Tera::default();
    tera.add_raw_template("user_prompt", template_text)
        .map_err(|e| AppError::TemplateError(e.into()))?;
    let ctx = Context::from_serialize(bundle).map_err(|e| AppError::TemplateError(e.into()))?;
    tera.render("user_prompt", &ctx)
        .map_err(|e| AppError::TemplateError(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketStatusReason, ParsedFields, Signal, SignalMessage, TimeSnapshot};

    fn sample_bundle() -> PrefetchBundle {
        PrefetchBundle {
            signal: Signal {
                thread_id: "t1".to_string(),
                messages: vec![SignalMessage {
                    content: "SPY 600c".to_string(),
                    timestamp: chrono::Utc::now(),
                    upstream_ai_meta: None,
                }],
                parsed: ParsedFields {
                    ticker: Some("SPY".to_string()),
                    ..Default::default()
                },
            },
            time: crate::models::PrefetchField::Available(TimeSnapshot {
                now_eastern: chrono::Utc::now(),
                market_open: true,
                status_reason: MarketStatusReason::MarketOpen,
                opens_at: None,
                closes_at: None,
            }),
            option_chain: crate::models::PrefetchField::Unavailable {
                kind: "option_chain".to_string(),
                reason: "timed out".to_string(),
            },
            account: crate::models::PrefetchField::Unavailable {
                kind: "account".to_string(),
                reason: "timed out".to_string(),
            },
            positions: crate::models::PrefetchField::Unavailable {
                kind: "positions".to_string(),
                reason: "timed out".to_string(),
            },
            vix: crate::models::PrefetchField::Unavailable {
                kind: "vix".to_string(),
                reason: "timed out".to_string(),
            },
        }
    }

    #[test]
    fn default_template_renders_without_error() {
        let rendered = render_user_prompt(DEFAULT_USER_TEMPLATE, &sample_bundle()).unwrap();
        assert!(rendered.contains("SPY 600c"));
        assert!(rendered.contains("unavailable: timed out"));
    }

    #[test]
    fn store_seeds_default_on_first_read_then_persists() {
        let db = Db::open_in_memory().unwrap();
        let store = PromptStore::new(db);
        let first = store.get_system_prompt().unwrap();
        assert_eq!(first, DEFAULT_SYSTEM_PROMPT);

        store.put("system_prompt", "custom prompt").unwrap();
        let second = store.get_system_prompt().unwrap();
        assert_eq!(second, "custom prompt");
    }
}
