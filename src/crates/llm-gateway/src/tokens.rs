//! Input-size estimation for dynamic timeouts.
//!
//! When the caller did not count its prompt, we estimate with the cl100k
//! tokenizer. The estimate only drives the timeout budget; billing numbers
//! come from the backend's usage report.

use flowgraph_core::Message;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;
use tracing::warn;

fn encoder() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(error) => {
                warn!(%error, "tokenizer unavailable, falling back to character heuristic");
                None
            }
        })
        .as_ref()
}

/// Estimate the token count of a message sequence.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(|m| estimate_text(&m.content)).sum()
}

/// Estimate the token count of a single text.
pub fn estimate_text(text: &str) -> u64 {
    match encoder() {
        Some(bpe) => bpe.encode_ordinary(text).len() as u64,
        // ~4 characters per token is close enough for a timeout budget.
        None => (text.chars().count() as u64).div_ceil(4),
    }
}
