//! The anchor + ordered-token parser (§4.1).
//!
//! Grounded on `original_source/src/parsing/parser.py::Parser.parse`: find
//! the earliest anchor occurrence, consume tokens in order from just past
//! it, backing off to resume the anchor search after a required-token
//! failure rather than giving up entirely.

use super::tokens::{Token, TokenValue};

pub struct TokenSpec {
    pub token: Box<dyn Token>,
    pub optional: bool,
}

impl TokenSpec {
    pub fn required(token: impl Token + 'static) -> Self {
        Self { token: Box::new(token), optional: false }
    }

    pub fn optional(token: impl Token + 'static) -> Self {
        Self { token: Box::new(token), optional: true }
    }
}

/// An anchor set (tried in the order given) plus an ordered token list.
pub struct Parser {
    anchors: Vec<&'static str>,
    tokens: Vec<TokenSpec>,
}

impl Parser {
    pub fn new(anchors: Vec<&'static str>, tokens: Vec<TokenSpec>) -> Self {
        assert!(!anchors.is_empty(), "at least one anchor must be specified");
        Self { anchors, tokens }
    }

    /// Attempts to parse `text`. Returns the ordered token values (optional
    /// tokens that failed to match are `None`) on the first anchor+token
    /// sequence that fully succeeds, or `None` if no anchor leads anywhere.
    pub fn parse(&self, text: &str) -> Option<Vec<Option<TokenValue>>> {
        let mut search_from: isize = -1;

        loop {
            let mut best: Option<(usize, &str)> = None;
            for anchor in &self.anchors {
                if let Some(rel) = text[((search_from + 1).max(0) as usize)..].find(anchor) {
                    let start = (search_from + 1).max(0) as usize + rel;
                    if best.is_none() || start < best.unwrap().0 {
                        best = Some((start, anchor));
                    }
                }
            }

            let (start_index, anchor) = best?;
            search_from = start_index as isize;

            let mut token_index = start_index + anchor.len();
            let mut result = Vec::with_capacity(self.tokens.len());
            let mut ok = true;

            for spec in &self.tokens {
                let consumed = if token_index < text.len() { spec.token.consume(text, token_index) } else { None };
                match consumed {
                    Some((len, value)) => {
                        result.push(Some(value));
                        token_index += len;
                    }
                    None => {
                        if spec.optional {
                            result.push(None);
                        } else {
                            ok = false;
                            break;
                        }
                    }
                }
            }

            if ok && result.len() == self.tokens.len() {
                return Some(result);
            }
            // resume search after this anchor's start, per §4.1 step 2.
        }
    }
}
