//! Interprets the title of a loan-request thread into its component blobs:
//! location, terms, payment processor, and anything left uncategorized.
//!
//! Grounded on `original_source/src/utils/req_post_interpreter.py::interpret`:
//! a single left-to-right pass over `(...)`-delimited blobs, each blob
//! classified into the first still-empty slot it matches, in order
//! location -> terms -> processor -> notes.

use std::sync::LazyLock;

use regex::Regex;

use crate::money::CURRENCY_SYMBOLS;
use crate::money::SUPPORTED_CURRENCIES;

static BLOB_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(([^)]+)\)").unwrap());
static TERM_RATIO_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d/").unwrap());

const PROCESSORS: &[&str] = &["venmo", "paypal", "bank", "cashapp", "zelle", "chime"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoanRequest {
    pub title: String,
    pub location: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub terms: Option<String>,
    pub processor: Option<String>,
    pub notes: Vec<String>,
}

fn looks_like_terms(blob: &str) -> bool {
    if TERM_RATIO_REGEX.is_match(blob) {
        return true;
    }
    if CURRENCY_SYMBOLS.keys().any(|sym| blob.contains(sym)) {
        return true;
    }
    let lower = blob.to_lowercase();
    SUPPORTED_CURRENCIES.iter().any(|c| lower.contains(&c.code.to_lowercase()))
}

fn looks_like_processor(blob: &str) -> bool {
    let lower = blob.to_lowercase();
    PROCESSORS.iter().any(|p| lower.contains(p))
}

/// Classifies each `(...)` blob in `title`, in order, into the first
/// still-empty slot it matches.
pub fn interpret(title: &str) -> LoanRequest {
    let mut result = LoanRequest {
        title: title.to_string(),
        ..Default::default()
    };

    for caps in BLOB_REGEX.captures_iter(title) {
        let blob = &caps[1];

        if result.location.is_none() && blob.starts_with('#') {
            let loc = blob[1..].to_string();
            let parts: Vec<&str> = loc.split(',').collect();
            if parts.len() == 3 {
                result.city = Some(parts[0].trim().to_string());
                result.state = Some(parts[1].trim().to_string());
                result.country = Some(parts[2].trim().to_string());
            }
            result.location = Some(loc);
            continue;
        }

        if result.terms.is_none() && looks_like_terms(blob) {
            result.terms = Some(blob.to_string());
            continue;
        }

        if result.processor.is_none() && looks_like_processor(blob) {
            result.processor = Some(blob.to_string());
            continue;
        }

        result.notes.push(blob.to_string());
    }

    result
}
