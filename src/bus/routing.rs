//! Topic-exchange routing-key matching.
//!
//! Routing keys and binding patterns are dot-delimited words. In a pattern:
//! - `*` matches exactly one word
//! - `#` matches zero or more words
//!
//! `list.checkout.#` matches `list.checkout`, `list.checkout.completed` and
//! `list.checkout.completed.v2`; `task.*` matches `task.create` but not `task`
//! or `task.create.retry`. The empty pattern matches only the empty key.

use super::{BusError, Result};

/// Check whether a routing key matches a topic binding pattern.
pub fn pattern_matches(pattern: &str, routing_key: &str) -> bool {
    words_match(&words(pattern), &words(routing_key))
}

fn words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').collect()
    }
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Collapse runs of '#'; each extra one matches nothing new.
            if rest.first() == Some(&"#") {
                return words_match(rest, key);
            }
            (0..=key.len()).any(|skip| words_match(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

/// Reject patterns with empty words. The empty pattern itself is allowed.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if words(pattern).iter().any(|w| w.is_empty()) {
        return Err(BusError::Topology(format!(
            "binding pattern '{}' contains an empty word",
            pattern
        )));
    }
    Ok(())
}
