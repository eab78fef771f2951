//! ISO 4217 minor-unit handling for processor amounts.

use rust_decimal::Decimal;

const ZERO_DECIMAL: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];
const THREE_DECIMAL: &[&str] = &["bhd", "jod", "kwd", "omr", "tnd"];

/// Digits after the decimal point in the currency's minor unit. Unknown codes get 2.
pub fn minor_unit_exponent(currency: &str) -> u32 {
    let code = currency.trim().to_ascii_lowercase();
    if ZERO_DECIMAL.contains(&code.as_str()) {
        0
    } else if THREE_DECIMAL.contains(&code.as_str()) {
        3
    } else {
        2
    }
}

/// Major-unit amount from an integer count of minor units.
pub fn from_minor_units(minor: i64, currency: &str) -> Decimal {
    Decimal::new(minor, minor_unit_exponent(currency))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::{from_minor_units, minor_unit_exponent};

    #[test]
    fn exponents_follow_the_currency() {
        assert_eq!(from_minor_units(12550, "usd"), dec!(125.50));
        assert_eq!(from_minor_units(5000, "JPY"), dec!(5000));
        assert_eq!(from_minor_units(1500, "kwd"), dec!(1.500));
        assert_eq!(minor_unit_exponent(" KRW "), 0);
        assert_eq!(minor_unit_exponent("xyz"), 2);
    }
}
