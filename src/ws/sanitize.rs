//! Strips sensitive fields from outbound payloads.
//!
//! The walk is structural: objects, arrays and scalars. Any object key that
//! contains one of [`SENSITIVE_KEYWORDS`] (case-insensitively) is removed
//! together with its whole subtree, at any depth.

use serde_json::Value;

/// Substrings that mark an object key as sensitive.
pub const SENSITIVE_KEYWORDS: [&str; 9] = [
    "password",
    "token",
    "secret",
    "key",
    "auth",
    "private",
    "confidential",
    "secure",
    "credential",
];

/// Returns true if `key` must never leave the process.
///
/// Matching uses full Unicode lowercasing, so look-alike letters such as the
/// Kelvin sign fold onto their ASCII keyword.
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Removes every sensitive key from `value`, at any depth.
pub fn sanitize(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !is_sensitive_key(key));
            map.values_mut().for_each(sanitize);
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contains_sensitive_key(value: &Value) -> bool {
        match value {
            Value::Object(map) => map
                .iter()
                .any(|(key, nested)| is_sensitive_key(key) || contains_sensitive_key(nested)),
            Value::Array(items) => items.iter().any(contains_sensitive_key),
            _ => false,
        }
    }

    fn sanitized(mut value: Value) -> Value {
        sanitize(&mut value);
        value
    }

    #[test]
    fn predicate_is_case_insensitive_substring() {
        assert!(is_sensitive_key("password"));
        assert!(is_sensitive_key("userPassword"));
        assert!(is_sensitive_key("ACCESS_TOKEN"));
        assert!(is_sensitive_key("apiKey"));
        assert!(is_sensitive_key("AuthHeader"));
        assert!(!is_sensitive_key("latitude"));
        assert!(!is_sensitive_key("name"));
    }

    #[test]
    fn predicate_folds_non_ascii_case() {
        // U+212A KELVIN SIGN lowercases to 'k'.
        assert!(is_sensitive_key("api\u{212A}ey"));
        assert!(is_sensitive_key("\u{212A}EY_ID"));
        let cleaned = sanitized(json!({"device\u{212A}ey": "k1", "lat": 1.0}));
        assert_eq!(cleaned, json!({"lat": 1.0}));
    }

    #[test]
    fn removes_nested_sensitive_keys_and_keeps_the_rest() {
        let payload = json!({
            "user": {
                "id": "u1",
                "name": "Ada",
                "password": "hunter2",
                "devices": [
                    {"model": "pixel", "pushToken": "abc"},
                    {"model": "iphone", "settings": {"secretMode": true, "theme": "dark"}}
                ]
            },
            "location": {"lat": 51.5, "lng": -0.12},
            "refresh_token": "xyz",
            "accuracy": 5
        });

        let cleaned = sanitized(payload);

        assert!(!contains_sensitive_key(&cleaned));
        assert_eq!(
            cleaned,
            json!({
                "user": {
                    "id": "u1",
                    "name": "Ada",
                    "devices": [
                        {"model": "pixel"},
                        {"model": "iphone", "settings": {"theme": "dark"}}
                    ]
                },
                "location": {"lat": 51.5, "lng": -0.12},
                "accuracy": 5
            })
        );
    }

    #[test]
    fn scalars_and_null_pass_through() {
        assert_eq!(sanitized(Value::Null), Value::Null);
        assert_eq!(sanitized(json!(42)), json!(42));
        assert_eq!(sanitized(json!("password")), json!("password"));
        assert_eq!(sanitized(json!([1, null, "x"])), json!([1, null, "x"]));
    }

    #[test]
    fn removes_whole_subtrees_inside_arrays() {
        let payload = json!([{"a": 1, "secureHash": "h"}, {"nested": {"credentials": [1]}}]);
        assert_eq!(sanitized(payload), json!([{"a": 1}, {"nested": {}}]));
    }
}
