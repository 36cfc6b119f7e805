//! OCC option symbol construction: `TICKER` padded to 6 chars, `YYMMDD` expiry,
//! `C`/`P` right, then strike * 1000 zero-padded to 8 digits.

use crate::models::OptionRight;
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

pub fn build_occ_symbol(ticker: &str, expiry: NaiveDate, right: OptionRight, strike: Decimal) -> String {
    let root = format!("{:<6}", ticker.to_uppercase());
    let date = expiry.format("%y%m%d").to_string();
    let strike_thousandths = (strike * Decimal::from(1000))
        .round()
        .to_i64()
        .unwrap_or(0);
    format!("{root}{date}{}{strike_thousandths:08}", right.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[test]
    fn builds_standard_symbol() {
        let expiry = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        let sym = build_occ_symbol("SPY", expiry, OptionRight::Call, dec!(450.00));
        assert_eq!(sym, "SPY   260731C00450000");
    }

    #[test]
    fn pads_short_tickers_and_fractional_strikes() {
        let expiry = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let sym = build_occ_symbol("qqq", expiry, OptionRight::Put, dec!(372.50));
        assert_eq!(sym, "QQQ   260102P00372500");
    }
}
