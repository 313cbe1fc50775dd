//! The token framework (§4.1): a [`Token`] encapsulates consuming some
//! characters from a fixed offset and producing a typed value.
//!
//! Grounded on `original_source/src/parsing/tokens.py` (`Token`,
//! `FallbackToken`, `RegexToken`, `TransformedToken`).

use std::sync::Arc;

use regex::Regex;

/// A parseable value: user handle, money amount, ISO code, integer, ...
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    Str(String),
    Money(crate::money::Money),
    Int(i64),
}

impl TokenValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TokenValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_money(&self) -> Option<&crate::money::Money> {
        match self {
            TokenValue::Money(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            TokenValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// The result of attempting to consume at an offset: how many characters
/// were consumed (if any) and the value produced.
pub type ConsumeResult = Option<(usize, TokenValue)>;

/// A single parsing primitive. `consume` must be pure (no side effects) so
/// that `might_apply`-style cheap pre-checks (§4.8) stay safe to call on
/// every comment.
pub trait Token: Send + Sync {
    fn consume(&self, text: &str, offset: usize) -> ConsumeResult;
}

/// Tries each child in order, succeeding as soon as one does.
pub struct FallbackToken {
    children: Vec<Arc<dyn Token>>,
}

impl FallbackToken {
    pub fn new(children: Vec<Arc<dyn Token>>) -> Self {
        Self { children }
    }
}

impl Token for FallbackToken {
    fn consume(&self, text: &str, offset: usize) -> ConsumeResult {
        for child in &self.children {
            if let Some(result) = child.consume(text, offset) {
                return Some(result);
            }
        }
        None
    }
}

/// Applies a regex anchored at `offset` (the pattern is matched against
/// `text[offset..]` and must itself anchor to the start, i.e. begin with
/// `\A` in the Python original — here we just `.find` starting at 0 of the
/// suffix and require the match to start there).
pub struct RegexToken {
    regex: Regex,
    capture: Capture,
}

#[derive(Clone, Copy)]
pub enum Capture {
    /// Use the whole match as the value.
    Whole,
    /// Use capture group `n` as the value.
    Group(usize),
    /// Use named capture group as the value.
    Named(&'static str),
}

impl RegexToken {
    pub fn new(regex: Regex, capture: Capture) -> Self {
        Self { regex, capture }
    }
}

impl Token for RegexToken {
    fn consume(&self, text: &str, offset: usize) -> ConsumeResult {
        let haystack = &text[offset..];
        let m = self.regex.find(haystack)?;
        // The pattern must match starting exactly at offset (anchored), matching
        // the Python original's `\A` prefix.
        if m.start() != 0 {
            return None;
        }
        let consumed = m.end();
        let caps = self.regex.captures(haystack)?;
        let value = match self.capture {
            Capture::Whole => m.as_str().to_string(),
            Capture::Group(n) => caps.get(n)?.as_str().to_string(),
            Capture::Named(name) => caps.name(name)?.as_str().to_string(),
        };
        Some((consumed, TokenValue::Str(value)))
    }
}

/// Runs an inner token, then applies a pure transform; a `None` result from
/// the transform counts as a failed match for the whole token.
pub struct TransformedToken<F> {
    inner: Arc<dyn Token>,
    transform: F,
}

impl<F> TransformedToken<F>
where
    F: Fn(TokenValue) -> Option<TokenValue> + Send + Sync,
{
    pub fn new(inner: Arc<dyn Token>, transform: F) -> Self {
        Self { inner, transform }
    }
}

impl<F> Token for TransformedToken<F>
where
    F: Fn(TokenValue) -> Option<TokenValue> + Send + Sync,
{
    fn consume(&self, text: &str, offset: usize) -> ConsumeResult {
        let (consumed, value) = self.inner.consume(text, offset)?;
        let transformed = (self.transform)(value)?;
        Some((consumed, transformed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_token_matches_anchored_at_offset() {
        let t = RegexToken::new(Regex::new(r"^[0-9]+").unwrap(), Capture::Whole);
        let (consumed, value) = t.consume("123abc", 0).unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(value.as_str(), Some("123"));
    }

    #[test]
    fn regex_token_fails_if_not_at_offset() {
        let t = RegexToken::new(Regex::new(r"^[0-9]+").unwrap(), Capture::Whole);
        assert!(t.consume("abc123", 0).is_none());
    }

    #[test]
    fn fallback_tries_children_in_order() {
        let a: Arc<dyn Token> = Arc::new(RegexToken::new(Regex::new(r"^x").unwrap(), Capture::Whole));
        let b: Arc<dyn Token> = Arc::new(RegexToken::new(Regex::new(r"^[0-9]+").unwrap(), Capture::Whole));
        let f = FallbackToken::new(vec![a, b]);
        let (consumed, value) = f.consume("42", 0).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(value.as_str(), Some("42"));
    }

    #[test]
    fn transformed_token_rejects_on_none() {
        let inner: Arc<dyn Token> = Arc::new(RegexToken::new(Regex::new(r"^[0-9]+").unwrap(), Capture::Whole));
        let t = TransformedToken::new(inner, |_| None);
        assert!(t.consume("42", 0).is_none());
    }
}
