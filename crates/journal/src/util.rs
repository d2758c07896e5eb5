// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small helpers shared by the parser, the cache and the query engine.

use std::time::{SystemTime, UNIX_EPOCH};

/// Canonicalizes a name so it can be used as a cache key, a table suffix or a tag key.
///
/// - Surrounding whitespace is trimmed
/// - ASCII letters are lowercased, ASCII digits are kept
/// - Every run of other characters becomes a single `_`
/// - Separators at the start are dropped and one trailing `_` is removed
///
/// # Examples
///
/// ```
/// use journal::util::env_key;
///
/// assert_eq!(env_key("  Prod-EU.1 "), "prod_eu_1");
/// assert_eq!(env_key("--staging--"), "staging");
/// assert_eq!(env_key(""), "");
/// ```
pub fn env_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    // true at the start so leading separators are dropped
    let mut in_separator = true;

    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            key.push(ch.to_ascii_lowercase());
            in_separator = false;
        } else if !in_separator {
            key.push('_');
            in_separator = true;
        }
    }

    if key.ends_with('_') {
        key.pop();
    }
    key
}

/// Returns true for non-empty strings made of ASCII digits with at most one `.`.
pub fn is_numeric(value: &str) -> bool {
    let mut dots = 0;
    let mut digits = 0;
    for ch in value.chars() {
        match ch {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    digits > 0 && dots <= 1
}

/// Shortest decimal rendering of a float, without exponent.
pub fn format_float(value: f64) -> String {
    format!("{value}")
}

/// Nanoseconds since the unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("Prod"), "prod");
        assert_eq!(env_key("my env  42"), "my_env_42");
        assert_eq!(env_key("a__b"), "a_b");
        assert_eq!(env_key("_a"), "a");
        assert_eq!(env_key("a_"), "a");
        assert_eq!(env_key("___"), "");
        assert_eq!(env_key("événement"), "v_nement");
    }

    #[test]
    fn test_is_numeric() {
        assert!(is_numeric("500"));
        assert!(is_numeric("3.14"));
        assert!(is_numeric("0.5"));
        assert!(!is_numeric(""));
        assert!(!is_numeric("."));
        assert!(!is_numeric("1.2.3"));
        assert!(!is_numeric("-5"));
        assert!(!is_numeric("12a"));
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(500.0), "500");
        assert_eq!(format_float(0.25), "0.25");
        assert_eq!(format_float(-3.5), "-3.5");
    }

    proptest! {
        #[test]
        fn env_key_is_idempotent(name in ".{0,40}") {
            let key = env_key(&name);
            prop_assert_eq!(env_key(&key), key.clone());
            prop_assert!(key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
            prop_assert!(!key.starts_with('_'));
            prop_assert!(!key.ends_with('_'));
        }
    }
}
