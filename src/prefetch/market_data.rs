//! Time/market-hours and option-chain/VIX reads against a primary quote provider, with an
//! optional fallback provider selected at startup (`USE_FALLBACK_MARKET_DATA`).
//!
//! Grounded on `vault/execution.rs`'s `PolymarketClobAdapter` REST-call shape (bearer-style
//! auth header, `reqwest::Client::get`/`post`, JSON response structs) generalized from a CLOB
//! read to a brokerage/market-data read, plus `chapaty`'s `chrono-tz` usage for session-hours
//! math this teacher has no equivalent of.

use crate::models::{MarketStatusReason, OptionChainSnapshot, OptionQuote, OptionRight, TimeSnapshot, VixBand, VixSnapshot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::America::New_York;
use rust_decimal::Decimal;
use std::time::Duration;

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_time(&self) -> Result<TimeSnapshot>;
    async fn fetch_option_chain(&self, ticker: &str, expiry: NaiveDate) -> Result<OptionChainSnapshot>;
    async fn fetch_vix(&self) -> Result<VixSnapshot>;
}

/// US/Eastern regular session: 09:30-16:00, Mon-Fri, no holiday calendar (the spec's
/// Non-goals exclude a full market-holiday calendar; weekends are still detected exactly).
pub fn classify_session(now_utc: DateTime<Utc>) -> TimeSnapshot {
    let eastern = now_utc.with_timezone(&New_York);
    let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
    let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
    let time_of_day = eastern.time();
    let is_weekend = matches!(eastern.weekday(), Weekday::Sat | Weekday::Sun);

    let (market_open, status_reason) = if is_weekend {
        (false, MarketStatusReason::Weekend)
    } else if time_of_day < open {
        (false, MarketStatusReason::PreMarket)
    } else if time_of_day >= close {
        (false, MarketStatusReason::AfterHours)
    } else {
        (true, MarketStatusReason::MarketOpen)
    };

    let opens_at = New_York
        .from_local_datetime(&eastern.date_naive().and_time(open))
        .single()
        .map(|dt| dt.with_timezone(&Utc));
    let closes_at = New_York
        .from_local_datetime(&eastern.date_naive().and_time(close))
        .single()
        .map(|dt| dt.with_timezone(&Utc));

    TimeSnapshot {
        now_eastern: now_utc,
        market_open,
        status_reason,
        opens_at,
        closes_at,
    }
}

#[derive(Debug, serde::Deserialize)]
struct QuoteRow {
    strike: Decimal,
    right: String,
    bid: Decimal,
    ask: Decimal,
    last: Decimal,
    volume: u64,
    open_interest: u64,
    #[serde(default)]
    iv: Option<f64>,
}

#[derive(Debug, serde::Deserialize)]
struct ChainResponse {
    underlying_price: Decimal,
    expiry: NaiveDate,
    quotes: Vec<QuoteRow>,
    available_expiries: Vec<NaiveDate>,
}

#[derive(Debug, serde::Deserialize)]
struct VixResponse {
    level: f64,
}

/// HTTP-backed provider. `base_url` points at either the primary brokerage quote API or a
/// fallback market-data vendor; the two are interchangeable from this client's point of view
/// since it only depends on the shape of `ChainResponse`/`VixResponse`.
pub struct MarketDataClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl MarketDataClient {
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
impl MarketDataSource for MarketDataClient {
    async fn fetch_time(&self) -> Result<TimeSnapshot> {
        Ok(classify_session(Utc::now()))
    }

    async fn fetch_option_chain(&self, ticker: &str, expiry: NaiveDate) -> Result<OptionChainSnapshot> {
        let url = format!("{}/chains/{ticker}", self.base_url);
        let resp: ChainResponse = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("expiry", expiry.to_string())])
            .timeout(self.timeout)
            .send()
            .await
            .context("option chain request failed")?
            .error_for_status()
            .context("option chain request returned an error status")?
            .json()
            .await
            .context("option chain response was not valid JSON")?;

        let quotes = resp
            .quotes
            .into_iter()
            .map(|row| {
                let right = match row.right.as_str() {
                    "C" | "CALL" => OptionRight::Call,
                    _ => OptionRight::Put,
                };
                let mid = (row.bid + row.ask) / Decimal::from(2);
                let itm = match right {
                    OptionRight::Call => resp.underlying_price > row.strike,
                    OptionRight::Put => resp.underlying_price < row.strike,
                };
                OptionQuote {
                    strike: row.strike,
                    right,
                    bid: row.bid,
                    ask: row.ask,
                    last: row.last,
                    mid,
                    volume: row.volume,
                    open_interest: row.open_interest,
                    iv: row.iv,
                    itm,
                }
            })
            .collect();

        Ok(OptionChainSnapshot {
            underlying_price: resp.underlying_price,
            expiry: resp.expiry,
            quotes,
            available_expiries: resp.available_expiries,
        })
    }

    async fn fetch_vix(&self) -> Result<VixSnapshot> {
        let url = format!("{}/quotes/VIX", self.base_url);
        let resp: VixResponse = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .context("VIX request failed")?
            .error_for_status()
            .context("VIX request returned an error status")?
            .json()
            .await
            .context("VIX response was not valid JSON")?;

        Ok(VixSnapshot {
            level: resp.level,
            band: VixBand::from_level(resp.level),
        })
    }
}
