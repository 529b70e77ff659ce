//! Dynamic per-call timeouts.
//!
//! Token-heavy prompts get proportionally more time. The budget models the
//! worst case of one call: connection setup, prompt ingestion at ~2ms/1k
//! tokens, thinking at 20% of the input size, generation, and scheduling
//! slack - all doubled, clamped to [120s, 1800s]. Calls with unknown input
//! size fall back to a flat 600s.

use std::time::Duration;

/// Flat timeout when the input size is unknown.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Lower clamp for computed timeouts.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper clamp for computed timeouts.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(1800);

/// Compute the timeout for a call with the given input token count.
pub fn dynamic_timeout(input_tokens: Option<u64>) -> Duration {
    let Some(tokens) = input_tokens else {
        return DEFAULT_TIMEOUT;
    };
    let tokens = tokens as f64;
    let estimate = 2.0 * (60.0 + 0.002 * tokens + 0.015 * (0.2 * tokens) + 60.0 + 12.0);
    Duration::from_secs_f64(estimate.clamp(
        MIN_TIMEOUT.as_secs_f64(),
        MAX_TIMEOUT.as_secs_f64(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_input_gets_default() {
        assert_eq!(dynamic_timeout(None), DEFAULT_TIMEOUT);
    }

    #[test]
    fn small_inputs_hit_lower_clamp_region() {
        // 2 * (60 + 60 + 12) = 264s for an empty prompt.
        let timeout = dynamic_timeout(Some(0));
        assert_eq!(timeout.as_secs(), 264);
        assert!(timeout >= MIN_TIMEOUT);
    }

    #[test]
    fn huge_inputs_clamp_at_max() {
        assert_eq!(dynamic_timeout(Some(10_000_000)), MAX_TIMEOUT);
    }

    #[test]
    fn timeout_grows_with_input() {
        let small = dynamic_timeout(Some(1_000));
        let large = dynamic_timeout(Some(100_000));
        assert!(large > small);
    }
}
