//! Multi-currency money model (C2).
//!
//! A [`Money`] value is always stored in minor units (cents, or whatever the
//! currency's exponent calls for). `major_str`/`display` render it back out;
//! nothing here ever does floating-point arithmetic on the minor amount.

pub mod fx;

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ISO4217-ish currency metadata. Matches `money.ISO_CODES_TO_EXP` /
/// `CURRENCY_SYMBOLS` in the original Python source.
#[derive(Debug, Clone, Copy)]
pub struct Currency {
    pub code: &'static str,
    pub exponent: u32,
}

pub const SUPPORTED_CURRENCIES: &[Currency] = &[
    Currency { code: "AUD", exponent: 2 },
    Currency { code: "GBP", exponent: 2 },
    Currency { code: "EUR", exponent: 2 },
    Currency { code: "CAD", exponent: 2 },
    Currency { code: "JPY", exponent: 0 },
    Currency { code: "MXN", exponent: 2 },
    Currency { code: "USD", exponent: 2 },
];

/// Symbol -> ISO code. Ambiguous among our audience but good enough to be
/// useful; matches `money.CURRENCY_SYMBOLS`.
pub static CURRENCY_SYMBOLS: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([("$", "USD"), ("\u{20ac}", "EUR"), ("\u{a3}", "GBP")])
});

#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("unknown currency code `{0}`")]
    UnknownCurrency(String),
}

pub fn exponent_for(code: &str) -> Result<u32, MoneyError> {
    SUPPORTED_CURRENCIES
        .iter()
        .find(|c| c.code == code)
        .map(|c| c.exponent)
        .ok_or_else(|| MoneyError::UnknownCurrency(code.to_string()))
}

pub fn is_supported(code: &str) -> bool {
    SUPPORTED_CURRENCIES.iter().any(|c| c.code == code)
}

/// A monetary amount in minor units of `currency`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub minor: i64,
    pub currency: String,
    pub exp: u32,
    pub symbol: Option<String>,
    pub symbol_on_left: bool,
}

impl Money {
    /// Construct with the currency's canonical exponent.
    pub fn new(minor: i64, currency: impl Into<String>) -> Result<Self, MoneyError> {
        let currency = currency.into();
        let exp = exponent_for(&currency)?;
        Ok(Self {
            minor,
            currency,
            exp,
            symbol: None,
            symbol_on_left: false,
        })
    }

    pub fn with_display(mut self, symbol: Option<String>, symbol_on_left: bool) -> Self {
        self.symbol = symbol;
        self.symbol_on_left = symbol_on_left;
        self
    }

    /// Render `minor / 10^exp` with exactly `exp` fractional digits (or the
    /// bare integer when `exp == 0`).
    pub fn major_str(&self) -> String {
        if self.exp == 0 {
            return self.minor.to_string();
        }
        let scale = 10i64.pow(self.exp);
        let whole = self.minor / scale;
        let frac = (self.minor % scale).unsigned_abs();
        format!("{whole}.{frac:0width$}", width = self.exp as usize)
    }

    /// Prepend/append the display symbol, if any; otherwise `"<major> <ISO>"`.
    pub fn display(&self) -> String {
        match &self.symbol {
            None => format!("{} {}", self.major_str(), self.currency),
            Some(sym) => {
                if self.symbol_on_left {
                    format!("{sym}{}", self.major_str())
                } else {
                    format!("{}{sym}", self.major_str())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_str_pads_fractional_digits() {
        let m = Money::new(105, "USD").unwrap();
        assert_eq!(m.major_str(), "1.05");
    }

    #[test]
    fn major_str_no_decimal_for_jpy() {
        let m = Money::new(500, "JPY").unwrap();
        assert_eq!(m.major_str(), "500");
    }

    #[test]
    fn display_prepends_symbol_on_left() {
        let m = Money::new(10050, "USD")
            .unwrap()
            .with_display(Some("$".to_string()), true);
        assert_eq!(m.display(), "$100.50");
    }

    #[test]
    fn display_appends_symbol_on_right() {
        let m = Money::new(1500, "GBP")
            .unwrap()
            .with_display(Some("\u{a3}".to_string()), false);
        assert_eq!(m.display(), "15.00\u{a3}");
    }

    #[test]
    fn unknown_currency_rejected() {
        assert!(Money::new(100, "XYZ").is_err());
    }
}
