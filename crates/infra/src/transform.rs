//! Result normalization applied to vendor output before it is stored.
//!
//! Two passes happen in one walk over the JSON tree:
//!
//! 1. **Redaction**: values under PII-named keys, and string fragments that
//!    look like e-mail addresses, SSNs or international phone numbers, are
//!    replaced by [`REDACTION_MARKER`].
//! 2. **Trimming**: every remaining string leaf loses surrounding whitespace.
//!
//! Object and array nesting is preserved. The transform is pure and
//! idempotent: the marker matches no pattern and trimmed strings stay trimmed.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value as JsonValue};

pub const REDACTION_MARKER: &str = "<REDACTED>";

/// Key terms treated as PII, matched against a key's word segments.
pub const DEFAULT_PII_KEYS: &[&str] = &[
    "email",
    "phone",
    "mobile",
    "ssn",
    "national_id",
    "passport",
    "tax_id",
    "password",
    "passwd",
    "secret",
];

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid email pattern")
});

static SSN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid ssn pattern"));

static INTL_PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+\d[\d\s().-]{6,}\d").expect("valid phone pattern")
});

/// Redacts and trims vendor output.
#[derive(Debug, Clone)]
pub struct ResultTransformer {
    pii_keys: Vec<String>,
}

impl Default for ResultTransformer {
    fn default() -> Self {
        Self {
            pii_keys: DEFAULT_PII_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl ResultTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the PII key list (terms are lower-case, `_` separated).
    pub fn with_pii_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pii_keys
            .extend(keys.into_iter().map(|k| k.into().to_ascii_lowercase()));
        self
    }

    pub fn transform(&self, raw: &JsonValue) -> JsonValue {
        match raw {
            JsonValue::Object(map) => JsonValue::Object(self.transform_object(map)),
            JsonValue::Array(items) => {
                JsonValue::Array(items.iter().map(|v| self.transform(v)).collect())
            }
            JsonValue::String(s) => JsonValue::String(scrub_string(s)),
            other => other.clone(),
        }
    }

    fn transform_object(&self, map: &Map<String, JsonValue>) -> Map<String, JsonValue> {
        map.iter()
            .map(|(key, value)| {
                let value = if self.is_pii_key(key) {
                    self.redact(value)
                } else {
                    self.transform(value)
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Value under a PII key: scalars are masked, containers keep their shape.
    fn redact(&self, value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::String(_) | JsonValue::Number(_) => {
                JsonValue::String(REDACTION_MARKER.to_string())
            }
            JsonValue::Array(items) => JsonValue::Array(items.iter().map(|v| self.redact(v)).collect()),
            JsonValue::Object(map) => JsonValue::Object(self.transform_object(map)),
            other => other.clone(),
        }
    }

    pub fn is_pii_key(&self, key: &str) -> bool {
        let joined = format!("_{}_", key_segments(key).join("_"));
        // A segment only has to start with the term: "emails" counts, "classname" does not.
        self.pii_keys
            .iter()
            .any(|term| joined.contains(&format!("_{term}")))
    }
}

/// Lower-case word segments of a key (`userEmail` / `user-email` -> `user`, `email`).
fn key_segments(key: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for ch in key.chars() {
        if !ch.is_alphanumeric() {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            segments.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn scrub_string(s: &str) -> String {
    let trimmed = s.trim();
    let redacted = EMAIL.replace_all(trimmed, REDACTION_MARKER);
    let redacted = SSN.replace_all(&redacted, REDACTION_MARKER);
    let redacted = INTL_PHONE.replace_all(&redacted, REDACTION_MARKER);
    redacted.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_and_trims_reference_document() {
        let t = ResultTransformer::new();
        let out = t.transform(&json!({"email": "a@b.com ", "note": "hello  "}));
        assert_eq!(out, json!({"email": "<REDACTED>", "note": "hello"}));
    }

    #[test]
    fn preserves_shape_of_nested_structures() {
        let t = ResultTransformer::new();
        let out = t.transform(&json!({
            "customer": {
                "name": "  Ada ",
                "contact": {"phone_number": 5551234, "mobilePhone": "555"},
                "tags": [" a ", "b", 3, null, true]
            },
            "emails": ["x@y.io", "z@w.io"],
            "credentials": {"password": "hunter2", "hint": " none "}
        }));

        assert_eq!(
            out,
            json!({
                "customer": {
                    "name": "Ada",
                    "contact": {"phone_number": "<REDACTED>", "mobilePhone": "<REDACTED>"},
                    "tags": ["a", "b", 3, null, true]
                },
                "emails": ["<REDACTED>", "<REDACTED>"],
                "credentials": {"password": "<REDACTED>", "hint": "none"}
            })
        );
    }

    #[test]
    fn redacts_patterns_inside_free_text() {
        let t = ResultTransformer::new();
        let out = t.transform(&json!({
            "note": " reach me at jane.doe@example.com or +44 20 7946 0958 ",
            "id_check": "ssn 123-45-6789 on file"
        }));
        assert_eq!(
            out,
            json!({
                "note": "reach me at <REDACTED> or <REDACTED>",
                "id_check": "ssn <REDACTED> on file"
            })
        );
    }

    #[test]
    fn key_matching_uses_word_segments() {
        let t = ResultTransformer::new();
        assert!(t.is_pii_key("email"));
        assert!(t.is_pii_key("userEmail"));
        assert!(t.is_pii_key("Customer-SSN"));
        assert!(t.is_pii_key("national_id"));
        assert!(t.is_pii_key("passwordHash"));
        assert!(!t.is_pii_key("classname"));
        assert!(!t.is_pii_key("field1"));
    }

    #[test]
    fn custom_keys_extend_defaults() {
        let t = ResultTransformer::new().with_pii_keys(["iban"]);
        let out = t.transform(&json!({"iban": "DE00 1234", "email": "a@b.c"}));
        assert_eq!(out, json!({"iban": "<REDACTED>", "email": "<REDACTED>"}));
    }

    #[test]
    fn plain_values_pass_through() {
        let t = ResultTransformer::new();
        let doc = json!({"field1": "X", "count": 3, "ok": true, "none": null});
        assert_eq!(t.transform(&doc), doc);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_json() -> impl Strategy<Value = JsonValue> {
            let key = prop_oneof![
                Just("email".to_string()),
                Just("note".to_string()),
                Just("phone".to_string()),
                Just("userPassword".to_string()),
                "[a-z]{1,8}",
            ]
            .boxed();
            let leaf = prop_oneof![
                Just(JsonValue::Null),
                any::<bool>().prop_map(JsonValue::Bool),
                any::<i32>().prop_map(|n| json!(n)),
                "[ a-z@.+0-9-]{0,24}".prop_map(JsonValue::String),
            ];
            leaf.prop_recursive(4, 48, 6, move |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..6).prop_map(JsonValue::Array),
                    proptest::collection::btree_map(key.clone(), inner, 0..6)
                        .prop_map(|m| JsonValue::Object(m.into_iter().collect())),
                ]
            })
        }

        fn same_shape(a: &JsonValue, b: &JsonValue) -> bool {
            match (a, b) {
                (JsonValue::Object(x), JsonValue::Object(y)) => {
                    x.len() == y.len()
                        && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| same_shape(v, w)))
                }
                (JsonValue::Array(x), JsonValue::Array(y)) => {
                    x.len() == y.len() && x.iter().zip(y).all(|(v, w)| same_shape(v, w))
                }
                (JsonValue::Object(_), _) | (JsonValue::Array(_), _) => false,
                (_, JsonValue::Object(_)) | (_, JsonValue::Array(_)) => false,
                _ => true,
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: transforming twice equals transforming once.
            #[test]
            fn transform_is_idempotent(doc in arb_json()) {
                let t = ResultTransformer::new();
                let once = t.transform(&doc);
                prop_assert_eq!(t.transform(&once), once);
            }

            /// Property: nesting is preserved.
            #[test]
            fn transform_preserves_shape(doc in arb_json()) {
                let t = ResultTransformer::new();
                prop_assert!(same_shape(&doc, &t.transform(&doc)));
            }
        }
    }
}
