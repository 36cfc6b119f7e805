//! Ordered, deterministic precondition chain. Runs before any LLM call; the first non-`Pass`
//! result short-circuits the task straight to a persisted `Skip` decision.
//!
//! Grounded on `risk.rs`'s guardrail style (named constants, `clamp`-bounded thresholds,
//! sequential checks) generalized from a single Kelly-sizing gate into an explicit ordered
//! `Vec<Box<dyn Precondition>>`.

use crate::models::{ParsedFields, RuntimeConfig, SkipCategory};

#[derive(Debug, Clone, PartialEq)]
pub enum PreconditionOutcome {
    Pass,
    Fail(SkipCategory, String),
}

/// Live-capital-only facts. Populated with a lightweight broker touch before the chain runs,
/// only when `live_mode` is true - a dry run never needs a real VIX read or position count.
#[derive(Debug, Clone, Default)]
pub struct LiveFacts {
    pub vix_level: Option<f64>,
    pub open_position_count: Option<u32>,
    pub has_open_position_for_ticker: Option<bool>,
}

pub struct PreconditionContext<'a> {
    pub parsed: &'a ParsedFields,
    pub runtime: &'a RuntimeConfig,
    pub live_mode: bool,
    pub live_facts: LiveFacts,
}

pub trait Precondition: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &PreconditionContext) -> PreconditionOutcome;
}

pub struct EmergencyStop;
impl Precondition for EmergencyStop {
    fn name(&self) -> &'static str {
        "emergency_stop"
    }
    fn check(&self, ctx: &PreconditionContext) -> PreconditionOutcome {
        if ctx.runtime.emergency_stop {
            PreconditionOutcome::Fail(
                SkipCategory::Other,
                "emergency stop is active".to_string(),
            )
        } else {
            PreconditionOutcome::Pass
        }
    }
}

pub struct TickerPresent;
impl Precondition for TickerPresent {
    fn name(&self) -> &'static str {
        "ticker_present"
    }
    fn check(&self, ctx: &PreconditionContext) -> PreconditionOutcome {
        match &ctx.parsed.ticker {
            Some(t) if !t.trim().is_empty() => PreconditionOutcome::Pass,
            _ => PreconditionOutcome::Fail(
                SkipCategory::NoSignal,
                "no ticker could be parsed from the signal".to_string(),
            ),
        }
    }
}

pub struct Whitelist;
impl Precondition for Whitelist {
    fn name(&self) -> &'static str {
        "whitelist"
    }
    fn check(&self, ctx: &PreconditionContext) -> PreconditionOutcome {
        if ctx.runtime.whitelist_tickers.is_empty() {
            return PreconditionOutcome::Pass;
        }
        let Some(ticker) = &ctx.parsed.ticker else {
            return PreconditionOutcome::Pass; // TickerPresent already handles the missing case
        };
        if ctx
            .runtime
            .whitelist_tickers
            .iter()
            .any(|t| t.eq_ignore_ascii_case(ticker))
        {
            PreconditionOutcome::Pass
        } else {
            PreconditionOutcome::Fail(
                SkipCategory::Other,
                format!("{ticker} is not on the whitelist"),
            )
        }
    }
}

pub struct Blacklist;
impl Precondition for Blacklist {
    fn name(&self) -> &'static str {
        "blacklist"
    }
    fn check(&self, ctx: &PreconditionContext) -> PreconditionOutcome {
        let Some(ticker) = &ctx.parsed.ticker else {
            return PreconditionOutcome::Pass;
        };
        if ctx
            .runtime
            .blacklist_tickers
            .iter()
            .any(|t| t.eq_ignore_ascii_case(ticker))
        {
            PreconditionOutcome::Fail(
                SkipCategory::Other,
                format!("{ticker} is on the blacklist"),
            )
        } else {
            PreconditionOutcome::Pass
        }
    }
}

pub struct MinConfidence;
impl Precondition for MinConfidence {
    fn name(&self) -> &'static str {
        "min_confidence"
    }
    fn check(&self, ctx: &PreconditionContext) -> PreconditionOutcome {
        match ctx.parsed.confidence_in_range() {
            Some(c) if c >= ctx.runtime.min_ai_confidence_score => PreconditionOutcome::Pass,
            Some(c) => PreconditionOutcome::Fail(
                SkipCategory::LowConfidence,
                format!(
                    "parsed confidence {c:.2} below minimum {:.2}",
                    ctx.runtime.min_ai_confidence_score
                ),
            ),
            // Absent confidence is not itself disqualifying; the LLM is asked to judge it.
            None => PreconditionOutcome::Pass,
        }
    }
}

pub struct VixCeiling;
impl Precondition for VixCeiling {
    fn name(&self) -> &'static str {
        "vix_ceiling"
    }
    fn check(&self, ctx: &PreconditionContext) -> PreconditionOutcome {
        if !ctx.live_mode {
            return PreconditionOutcome::Pass;
        }
        match ctx.live_facts.vix_level {
            Some(vix) if vix >= ctx.runtime.max_vix_level => PreconditionOutcome::Fail(
                SkipCategory::Timing,
                format!(
                    "VIX {vix:.1} exceeds ceiling {:.1}",
                    ctx.runtime.max_vix_level
                ),
            ),
            _ => PreconditionOutcome::Pass,
        }
    }
}

pub struct MaxPositions;
impl Precondition for MaxPositions {
    fn name(&self) -> &'static str {
        "max_positions"
    }
    fn check(&self, ctx: &PreconditionContext) -> PreconditionOutcome {
        if !ctx.live_mode {
            return PreconditionOutcome::Pass;
        }
        match ctx.live_facts.open_position_count {
            Some(count) if count >= ctx.runtime.max_concurrent_positions => {
                PreconditionOutcome::Fail(
                    SkipCategory::Other,
                    format!(
                        "{count} open positions already at or above the {} limit",
                        ctx.runtime.max_concurrent_positions
                    ),
                )
            }
            _ => PreconditionOutcome::Pass,
        }
    }
}

pub struct DuplicatePosition;
impl Precondition for DuplicatePosition {
    fn name(&self) -> &'static str {
        "duplicate_position"
    }
    fn check(&self, ctx: &PreconditionContext) -> PreconditionOutcome {
        if !ctx.live_mode {
            return PreconditionOutcome::Pass;
        }
        if ctx.live_facts.has_open_position_for_ticker.unwrap_or(false) {
            PreconditionOutcome::Fail(
                SkipCategory::PositionExists,
                "an open position already exists for this ticker".to_string(),
            )
        } else {
            PreconditionOutcome::Pass
        }
    }
}

/// The fixed, spec-mandated order. `EmergencyStop` first since it must veto everything else
/// unconditionally; the three `live_mode`-gated checks last since they're the most expensive
/// to have needed data for.
pub fn default_chain() -> Vec<Box<dyn Precondition>> {
    vec![
        Box::new(EmergencyStop),
        Box::new(TickerPresent),
        Box::new(Whitelist),
        Box::new(Blacklist),
        Box::new(MinConfidence),
        Box::new(VixCeiling),
        Box::new(MaxPositions),
        Box::new(DuplicatePosition),
    ]
}

/// Runs the chain and returns the first failing check's name + outcome, or `None` if every
/// check passed.
pub fn run_chain(
    chain: &[Box<dyn Precondition>],
    ctx: &PreconditionContext,
) -> Option<(&'static str, SkipCategory, String)> {
    for check in chain {
        if let PreconditionOutcome::Fail(category, reason) = check.check(ctx) {
            return Some((check.name(), category, reason));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(parsed: ParsedFields, runtime: RuntimeConfig, live_mode: bool) -> PreconditionContext<'static> {
        // Leaked for test convenience only: tests are short-lived processes, the leak is fine.
        let parsed: &'static ParsedFields = Box::leak(Box::new(parsed));
        let runtime: &'static RuntimeConfig = Box::leak(Box::new(runtime));
        PreconditionContext {
            parsed,
            runtime,
            live_mode,
            live_facts: LiveFacts::default(),
        }
    }

    #[test]
    fn emergency_stop_short_circuits_everything() {
        let mut runtime = RuntimeConfig::default();
        runtime.emergency_stop = true;
        let ctx = ctx_with(ParsedFields::default(), runtime, false);
        let chain = default_chain();
        let result = run_chain(&chain, &ctx);
        assert_eq!(result.unwrap().0, "emergency_stop");
    }

    #[test]
    fn missing_ticker_fails_before_whitelist() {
        let ctx = ctx_with(ParsedFields::default(), RuntimeConfig::default(), false);
        let chain = default_chain();
        let result = run_chain(&chain, &ctx);
        assert_eq!(result.unwrap().0, "ticker_present");
    }

    #[test]
    fn whitelist_rejects_unlisted_ticker() {
        let mut parsed = ParsedFields::default();
        parsed.ticker = Some("TSLA".to_string());
        let ctx = ctx_with(parsed, RuntimeConfig::default(), false);
        let chain = default_chain();
        let result = run_chain(&chain, &ctx);
        assert_eq!(result.unwrap().0, "whitelist");
    }

    #[test]
    fn live_only_checks_pass_automatically_in_dry_run() {
        let mut parsed = ParsedFields::default();
        parsed.ticker = Some("SPY".to_string());
        parsed.confidence = Some(0.9);
        let mut ctx = ctx_with(parsed, RuntimeConfig::default(), false);
        ctx.live_facts = LiveFacts {
            vix_level: Some(999.0),
            open_position_count: Some(999),
            has_open_position_for_ticker: Some(true),
        };
        let chain = default_chain();
        assert!(run_chain(&chain, &ctx).is_none());
    }

    #[test]
    fn duplicate_position_fails_when_live() {
        let mut parsed = ParsedFields::default();
        parsed.ticker = Some("SPY".to_string());
        parsed.confidence = Some(0.9);
        let mut ctx = ctx_with(parsed, RuntimeConfig::default(), true);
        ctx.live_facts.has_open_position_for_ticker = Some(true);
        let chain = default_chain();
        let result = run_chain(&chain, &ctx);
        assert_eq!(result.unwrap().0, "duplicate_position");
    }

    #[test]
    fn fully_passing_signal_returns_none() {
        let mut parsed = ParsedFields::default();
        parsed.ticker = Some("SPY".to_string());
        parsed.confidence = Some(0.9);
        let ctx = ctx_with(parsed, RuntimeConfig::default(), true);
        let chain = default_chain();
        assert!(run_chain(&chain, &ctx).is_none());
    }
}
