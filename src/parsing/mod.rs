//! The command-parsing kernel (§4.1, C1): anchors, ordered tokens, and the
//! concrete token types the command set is built from.

pub mod ext_tokens;
pub mod parser;
pub mod temp_ban;
pub mod tokens;

pub use parser::{Parser, TokenSpec};
pub use tokens::TokenValue;
