//! Merchant-name normalization.
//!
//! Every fuzzy merchant lookup (recurring patterns, correction counting,
//! merchant history) goes through a normalized key rather than repeated
//! substring scans, so stores can index it.

/// Words that carry no merchant identity.
const NOISE_TOKENS: &[&str] = &[
    "co", "company", "corp", "corporation", "inc", "incorporated", "llc", "ltd", "plc", "gmbh",
    "the", "pos", "purchase",
];

pub const MERCHANT_KEY_MAX_LEN: usize = 32;

/// Lowercases and replaces every non-alphabetic character with a space,
/// collapsing runs of whitespace. Digits and punctuation disappear.
pub fn normalize_text(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical lookup key for a merchant name, or `None` when nothing
/// alphabetic survives normalization.
pub fn merchant_key(name: &str) -> Option<String> {
    let normalized = normalize_text(name);
    if normalized.is_empty() {
        return None;
    }

    let significant: Vec<&str> = normalized
        .split(' ')
        .filter(|t| !NOISE_TOKENS.contains(t))
        .collect();
    let joined = if significant.is_empty() {
        normalized.clone()
    } else {
        significant.join(" ")
    };

    let truncated: String = joined.chars().take(MERCHANT_KEY_MAX_LEN).collect();
    Some(truncated.trim_end().to_string())
}

/// Two keys refer to the same merchant when equal or when one is a
/// whole-word prefix of the other ("starbucks" ~ "starbucks coffee").
pub fn keys_match(a: &str, b: &str) -> bool {
    a == b || is_word_prefix(a, b) || is_word_prefix(b, a)
}

fn is_word_prefix(short: &str, long: &str) -> bool {
    !short.is_empty()
        && long
            .strip_prefix(short)
            .is_some_and(|rest| rest.starts_with(' '))
}
