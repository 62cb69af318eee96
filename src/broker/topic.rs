//! Routing-key matching for the exchange kinds the bus supports.
//!
//! Topic patterns are dot-delimited; `*` matches exactly one token and `#`
//! matches zero or more tokens.

use super::ExchangeKind;

pub fn routes(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
    }
}

pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    match_tokens(&tokens(pattern), &tokens(routing_key))
}

fn tokens(value: &str) -> Vec<&str> {
    if value.is_empty() {
        Vec::new()
    } else {
        value.split('.').collect()
    }
}

fn match_tokens(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_tokens(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_tokens(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_tokens(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_exactly_one_token() {
        assert!(topic_matches("a.*", "a.b"));
        assert!(!topic_matches("a.*", "a.b.c"));
        assert!(!topic_matches("a.*", "a"));
        assert!(!topic_matches("c.*", "a.b"));
    }

    #[test]
    fn hash_matches_zero_or_more_tokens() {
        assert!(topic_matches("a.#", "a"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.done", "task.42.done"));
        assert!(topic_matches("a.#.z", "a.z"));
        assert!(!topic_matches("a.#.z", "a.b.y"));
    }

    #[test]
    fn literal_tokens_must_match() {
        assert!(topic_matches("scheduler.run", "scheduler.run"));
        assert!(!topic_matches("scheduler.run", "scheduler.stop"));
        assert!(topic_matches("", ""));
        assert!(!topic_matches("", "a"));
    }

    #[test]
    fn direct_and_fanout_routing() {
        assert!(routes(ExchangeKind::Direct, "k", "k"));
        assert!(!routes(ExchangeKind::Direct, "k.*", "k.a"));
        assert!(routes(ExchangeKind::Fanout, "ignored", "k.a"));
    }
}
