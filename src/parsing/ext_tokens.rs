//! Concrete tokens used by the command set (§4.1, §6).
//!
//! Grounded on `original_source/src/parsing/ext_tokens.py`. The money
//! numeral grammar is relaxed to accept comma-grouped integers
//! (`$1,000`) — an explicit decision recorded in DESIGN.md, not a silent
//! fix of the source's rejection of commas (§9 Open Questions).

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;

use super::tokens::{Capture, FallbackToken, RegexToken, Token, TokenValue, TransformedToken};
use crate::money::{CURRENCY_SYMBOLS, Money, SUPPORTED_CURRENCIES, exponent_for};

/// `/u/NAME`, `u/NAME`, or a markdown link `[text](href)` whose text is such
/// a reference and whose href targets `/u/NAME` or `/user/NAME` with the
/// same NAME (query string/fragment ignored).
pub fn user_token() -> Arc<dyn Token> {
    let plain = RegexToken::new(Regex::new(r"^\s*/?u/(\w+)\s*").unwrap(), Capture::Group(1));
    Arc::new(FallbackToken::new(vec![Arc::new(plain), Arc::new(RegexLinkToken)]))
}

/// A markdown-link user reference whose href username must equal the link
/// text's username — `Regex`'s `(?P=name)` backreferences aren't supported
/// by the `regex` crate, so this token checks the two captures manually.
struct RegexLinkToken;

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[(?:/?u/)?(?P<text>\w+)\]\(https?://reddit\.com/u(?:ser)?/(?P<href>\w+)(?:\?[^)]*)?(?:#[^)]*)?\)\s*").unwrap()
});

impl Token for RegexLinkToken {
    fn consume(&self, text: &str, offset: usize) -> super::tokens::ConsumeResult {
        let haystack = &text[offset..];
        let m = LINK_RE.find(haystack)?;
        if m.start() != 0 {
            return None;
        }
        let caps = LINK_RE.captures(haystack)?;
        let username = caps.name("text")?.as_str();
        let href = caps.name("href")?.as_str();
        if username != href {
            return None;
        }
        Some((m.end(), TokenValue::Str(username.to_string())))
    }
}

fn iso_codes_pattern() -> String {
    SUPPORTED_CURRENCIES.iter().map(|c| c.code).collect::<Vec<_>>().join("|")
}

fn symbols_pattern() -> String {
    CURRENCY_SYMBOLS.keys().map(|s| regex::escape(s)).collect::<Vec<_>>().join("|")
}

/// `[0-9]{1,3}(,[0-9]{3})*(\.[0-9]{0,4})?` — comma-grouped integer part,
/// optional up-to-4-digit fraction. See module docs re: the comma decision.
const AMOUNT_PATTERN: &str = r"[0-9]{1,3}(?:,[0-9]{3})*(?:\.[0-9]{0,4})?";

/// Money: optional ISO/symbol on either side of the numeral, or bare
/// (assumed USD). Value: `Money(minor, currency)`.
///
/// `RegexToken` only carries a single named/numbered capture; money needs
/// several at once (amount plus iso-or-symbol), so this builds its own
/// capture-aware token rather than composing `RegexToken`s.
pub fn money_token() -> Arc<dyn Token> {
    Arc::new(MoneyToken { iso: iso_codes_pattern(), sym: symbols_pattern() })
}

struct MoneyToken {
    iso: String,
    sym: String,
}

impl MoneyToken {
    fn variants(&self) -> Vec<Regex> {
        let amt = AMOUNT_PATTERN;
        let (iso, sym) = (&self.iso, &self.sym);
        vec![
            Regex::new(&format!(r"^\s*(?P<iso>{iso})\s+(?:{sym})?(?P<amt>{amt})(?:{sym})?\s*")).unwrap(),
            Regex::new(&format!(r"^\s*(?:{sym})?(?P<amt>{amt})(?:{sym})?\s+(?P<iso>{iso})\s*")).unwrap(),
            Regex::new(&format!(r"^\s*(?P<sym>{sym})(?P<amt>{amt})\s*")).unwrap(),
            Regex::new(&format!(r"^\s*(?P<amt>{amt})(?P<sym>{sym})\s*")).unwrap(),
            Regex::new(&format!(r"^\s*(?P<amt>{amt})\s*")).unwrap(),
        ]
    }
}

impl Token for MoneyToken {
    fn consume(&self, text: &str, offset: usize) -> super::tokens::ConsumeResult {
        let haystack = &text[offset..];
        for re in self.variants() {
            let Some(m) = re.find(haystack) else { continue };
            if m.start() != 0 {
                continue;
            }
            let caps = re.captures(haystack).unwrap();
            let iso = if let Some(iso_m) = caps.name("iso") {
                iso_m.as_str().to_string()
            } else if let Some(sym_m) = caps.name("sym") {
                match CURRENCY_SYMBOLS.get(sym_m.as_str()) {
                    Some(code) => code.to_string(),
                    None => continue,
                }
            } else {
                "USD".to_string()
            };

            let Ok(exp) = exponent_for(&iso) else { continue };
            let raw_amt = caps.name("amt").unwrap().as_str();
            let stripped = raw_amt.replace(',', "");

            let frac_len = stripped.split('.').nth(1).map(|f| f.len());
            let valid = match frac_len {
                None => true,
                Some(len) => len <= exp as usize && exp > 0,
            };
            if !valid {
                continue;
            }
            // exact fractional-digit-length check per §4.1: a fractional
            // component whose length differs from the currency's exponent
            // rejects the token (not "at most").
            if let Some(len) = frac_len {
                if len != exp as usize {
                    continue;
                }
            }

            let minor = if stripped.contains('.') {
                stripped.replace('.', "").parse::<i64>().ok()
            } else {
                format!("{stripped}{}", "0".repeat(exp as usize)).parse::<i64>().ok()
            };
            let Some(minor) = minor else { continue };

            return Some((m.end(), TokenValue::Money(Money::new(minor, iso).ok()?)));
        }
        None
    }
}

/// Literal `as CUR` (case-insensitive anchor, ISO code captured and
/// normalized to uppercase).
pub fn as_currency_token() -> Arc<dyn Token> {
    let iso = iso_codes_pattern();
    let inner: Arc<dyn Token> =
        Arc::new(RegexToken::new(Regex::new(&format!(r"(?i)^\s*as\s+({iso})\s*")).unwrap(), Capture::Group(1)));
    Arc::new(TransformedToken::new(inner, |v| {
        v.as_str().map(|s| TokenValue::Str(s.to_uppercase()))
    }))
}

/// Unsigned integer, e.g. a loan id.
pub fn uint_token() -> Arc<dyn Token> {
    let inner: Arc<dyn Token> = Arc::new(RegexToken::new(Regex::new(r"^\s*([0-9]+)\s*").unwrap(), Capture::Group(1)));
    Arc::new(TransformedToken::new(inner, |v| {
        v.as_str().and_then(|s| s.parse::<i64>().ok()).map(TokenValue::Int)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consume_money(text: &str) -> Option<(usize, Money)> {
        let t = money_token();
        t.consume(text, 0).map(|(n, v)| (n, v.as_money().unwrap().clone()))
    }

    #[test]
    fn bare_dollar_sign_prefix() {
        let (_, m) = consume_money("$100").unwrap();
        assert_eq!(m.minor, 10_000);
        assert_eq!(m.currency, "USD");
    }

    #[test]
    fn suffix_dollar_sign() {
        let (_, m) = consume_money("10$").unwrap();
        assert_eq!(m.minor, 1_000);
        assert_eq!(m.currency, "USD");
    }

    #[test]
    fn iso_prefixed() {
        let (_, m) = consume_money("USD 10").unwrap();
        assert_eq!(m.minor, 1_000);
    }

    #[test]
    fn iso_suffixed() {
        let (_, m) = consume_money("10 USD").unwrap();
        assert_eq!(m.minor, 1_000);
    }

    #[test]
    fn decimal_with_exact_fraction_digits() {
        let (_, m) = consume_money("10.00").unwrap();
        assert_eq!(m.minor, 1_000);
    }

    #[test]
    fn decimal_with_wrong_fraction_digit_count_rejected() {
        // USD has exp=2; one fractional digit should reject per §4.1.
        assert!(consume_money("10.0").is_none());
    }

    #[test]
    fn pound_symbol_maps_to_gbp() {
        let (_, m) = consume_money("\u{a3}15").unwrap();
        assert_eq!(m.currency, "GBP");
        assert_eq!(m.minor, 1_500);
    }

    #[test]
    fn jpy_has_no_decimal_exponent() {
        let (_, m) = consume_money("JPY 32").unwrap();
        assert_eq!(m.minor, 32);
        assert_eq!(m.currency, "JPY");
    }

    #[test]
    fn comma_grouped_integer_accepted() {
        let (_, m) = consume_money("$1,000").unwrap();
        assert_eq!(m.minor, 100_000);
    }

    #[test]
    fn defaults_to_usd_with_no_symbol_or_iso() {
        let (_, m) = consume_money("5.50").unwrap();
        assert_eq!(m.currency, "USD");
        assert_eq!(m.minor, 550);
    }

    #[test]
    fn user_token_plain_slash_form() {
        let t = user_token();
        let (consumed, v) = t.consume("/u/alice rest", 0).unwrap();
        assert_eq!(v.as_str(), Some("alice"));
        assert!(consumed > 0);
    }

    #[test]
    fn user_token_bare_u_form() {
        let t = user_token();
        let (_, v) = t.consume("u/bob", 0).unwrap();
        assert_eq!(v.as_str(), Some("bob"));
    }

    #[test]
    fn user_token_markdown_link_matching_names() {
        let t = user_token();
        let (_, v) = t.consume("[/u/carol](https://reddit.com/u/carol?context=3)", 0).unwrap();
        assert_eq!(v.as_str(), Some("carol"));
    }

    #[test]
    fn user_token_markdown_link_mismatched_names_rejected() {
        let t = user_token();
        assert!(t.consume("[/u/carol](https://reddit.com/u/dave)", 0).is_none());
    }

    #[test]
    fn as_currency_token_is_case_insensitive() {
        let t = as_currency_token();
        let (_, v) = t.consume("AS jpy", 0).unwrap();
        assert_eq!(v.as_str(), Some("JPY"));
    }

    #[test]
    fn uint_token_parses_digits() {
        let t = uint_token();
        let (_, v) = t.consume("42 dollars", 0).unwrap();
        assert_eq!(v.as_int(), Some(42));
    }
}
