//! Concurrent prefetch: time, option chain, account, positions, and VIX gathered together
//! before the LLM is ever called, so the single LLM call never blocks on a slow sub-read.
//!
//! Grounded on `signals/enrichment.rs`'s `DomeEnrichmentService::process_job` (`tokio::join!`
//! over independent sub-fetches with graceful per-field fallback) generalized from a
//! Gamma-then-Dome fallback chain into five independent reads, each individually bounded by its
//! own `tokio::time::timeout` rather than one timeout for the whole join.

pub mod market_data;

use crate::broker::BrokerGateway;
use crate::models::{
    AccountSnapshot, MarketStatusReason, OptionChainSnapshot, PositionSnapshot, PrefetchBundle, PrefetchField, Signal,
    TimeSnapshot, VixSnapshot,
};
use chrono::{NaiveDate, Utc};
use market_data::MarketDataSource;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct PrefetchEngine {
    market_data: Arc<dyn MarketDataSource>,
    broker: Arc<dyn BrokerGateway>,
    deadline: Duration,
}

impl PrefetchEngine {
    pub fn new(market_data: Arc<dyn MarketDataSource>, broker: Arc<dyn BrokerGateway>, deadline: Duration) -> Self {
        Self {
            market_data,
            broker,
            deadline,
        }
    }

    /// 0DTE: absent an explicit parsed expiry, the chain is read for the current Eastern
    /// calendar date.
    fn resolve_expiry(signal: &Signal) -> NaiveDate {
        signal.parsed.expiry.unwrap_or_else(|| {
            Utc::now()
                .with_timezone(&chrono_tz::America::New_York)
                .date_naive()
        })
    }

    pub async fn gather(&self, signal: Signal) -> PrefetchBundle {
        let ticker = signal.parsed.ticker.clone().unwrap_or_default();
        let expiry = Self::resolve_expiry(&signal);

        let time_fut = timeout_field(self.deadline, "time", self.market_data.fetch_time());
        let chain_fut = timeout_field(
            self.deadline,
            "option_chain",
            self.market_data.fetch_option_chain(&ticker, expiry),
        );
        let account_fut = timeout_field(self.deadline, "account", fetch_account(self.broker.clone()));
        let positions_fut = timeout_field(self.deadline, "positions", fetch_positions(self.broker.clone()));
        let vix_fut = timeout_field(self.deadline, "vix", self.market_data.fetch_vix());

        let (time, option_chain, account, positions, vix) =
            tokio::join!(time_fut, chain_fut, account_fut, positions_fut, vix_fut);

        PrefetchBundle {
            signal,
            time: time.unwrap_or_else(fallback_time),
            option_chain,
            account,
            positions,
            vix,
        }
    }
}

async fn fetch_account(broker: Arc<dyn BrokerGateway>) -> anyhow::Result<AccountSnapshot> {
    broker.fetch_account().await.map_err(|e| anyhow::anyhow!(e))
}

async fn fetch_positions(broker: Arc<dyn BrokerGateway>) -> anyhow::Result<Vec<PositionSnapshot>> {
    broker.fetch_positions().await.map_err(|e| anyhow::anyhow!(e))
}

fn fallback_time() -> PrefetchField<TimeSnapshot> {
    PrefetchField::Unavailable {
        kind: "time".to_string(),
        reason: "time sub-fetch timed out or failed; treating market as closed".to_string(),
    }
}

/// Wraps a sub-fetch future in a deadline and converts any timeout/error into
/// `PrefetchField::Unavailable` rather than letting one slow provider sink the whole task.
async fn timeout_field<T, F>(deadline: Duration, kind: &str, fut: F) -> PrefetchField<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => PrefetchField::Available(value),
        Ok(Err(err)) => {
            warn!(kind, error = %err, "prefetch sub-fetch failed");
            PrefetchField::Unavailable {
                kind: kind.to_string(),
                reason: err.to_string(),
            }
        }
        Err(_) => {
            warn!(kind, "prefetch sub-fetch timed out");
            PrefetchField::Unavailable {
                kind: kind.to_string(),
                reason: "timed out".to_string(),
            }
        }
    }
}

/// Exposed for callers that need the market-closed default's reason without constructing a
/// full bundle (the consumer's skip-fast path on a closed market, §4.4).
pub fn market_closed_reason(bundle: &PrefetchBundle) -> Option<MarketStatusReason> {
    bundle.time.ok().map(|t| t.status_reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimulatedBrokerGateway;
    use crate::models::{OptionChainSnapshot, OptionRight, ParsedFields, SignalMessage, VixBand};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct FakeMarketData {
        fail_chain: bool,
    }

    #[async_trait]
    impl MarketDataSource for FakeMarketData {
        async fn fetch_time(&self) -> anyhow::Result<TimeSnapshot> {
            Ok(TimeSnapshot {
                now_eastern: Utc::now(),
                market_open: true,
                status_reason: MarketStatusReason::MarketOpen,
                opens_at: None,
                closes_at: None,
            })
        }

        async fn fetch_option_chain(&self, _ticker: &str, expiry: NaiveDate) -> anyhow::Result<OptionChainSnapshot> {
            if self.fail_chain {
                anyhow::bail!("chain provider unavailable");
            }
            Ok(OptionChainSnapshot {
                underlying_price: dec!(600),
                expiry,
                quotes: vec![],
                available_expiries: vec![expiry],
            })
        }

        async fn fetch_vix(&self) -> anyhow::Result<VixSnapshot> {
            Ok(VixSnapshot {
                level: 14.0,
                band: VixBand::from_level(14.0),
            })
        }
    }

    fn sample_signal() -> Signal {
        Signal {
            thread_id: "t1".to_string(),
            messages: vec![SignalMessage {
                content: "SPY calls".to_string(),
                timestamp: Utc::now(),
                upstream_ai_meta: None,
            }],
            parsed: ParsedFields {
                ticker: Some("SPY".to_string()),
                direction: Some(crate::models::SignalDirection::Call),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn gathers_all_fields_when_everything_succeeds() {
        let engine = PrefetchEngine::new(
            Arc::new(FakeMarketData { fail_chain: false }),
            Arc::new(SimulatedBrokerGateway),
            Duration::from_secs(5),
        );
        let bundle = engine.gather(sample_signal()).await;
        assert!(bundle.market_is_open());
        assert!(bundle.option_chain.ok().is_some());
        assert!(bundle.account.ok().is_some());
        assert!(bundle.vix.ok().is_some());
    }

    #[tokio::test]
    async fn degrades_single_field_without_aborting_the_bundle() {
        let engine = PrefetchEngine::new(
            Arc::new(FakeMarketData { fail_chain: true }),
            Arc::new(SimulatedBrokerGateway),
            Duration::from_secs(5),
        );
        let bundle = engine.gather(sample_signal()).await;
        assert!(bundle.option_chain.ok().is_none());
        assert!(bundle.market_is_open());
        assert!(bundle.account.ok().is_some());
    }

    #[test]
    fn resolves_expiry_from_parsed_field_when_present() {
        let mut signal = sample_signal();
        let explicit = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        signal.parsed.expiry = Some(explicit);
        assert_eq!(PrefetchEngine::resolve_expiry(&signal), explicit);
    }
}
