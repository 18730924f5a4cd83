//! Routing key matching.

use mqkit_core::ExchangeKind;

/// Whether a message published with `routing_key` follows a binding with
/// `binding_key` on an exchange of `kind`.
///
/// Headers exchanges route like fanout: bindings carry no match arguments.
#[must_use]
pub fn matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

/// `*` matches exactly one word, `#` zero or more.
fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((first, rest)) if *first == "#" => {
            (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..]))
        }
        Some((first, rest)) if *first == "*" => {
            !words.is_empty() && topic_matches(rest, &words[1..])
        }
        Some((first, rest)) => words.first() == Some(first) && topic_matches(rest, &words[1..]),
    }
}
