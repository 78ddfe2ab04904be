//! Redaction for credentials that pass through handler arguments and model
//! action payloads.

use std::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

const MASK: &str = "***";

/// Argument names whose values are credentials, matched case-insensitively
/// as substrings (`db_password`, `X-Api-Key`).
pub const SECRET_KEYS: &[&str] = &["password", "access_token", "token", "secret", "api_key", "apikey"];

pub fn is_secret_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase().replace('-', "_");
    SECRET_KEYS.iter().any(|secret| lowered.contains(secret))
}

/// Copy of `value` with every secret-named field masked, at any depth.
pub fn redact_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, value)| {
                    let redacted = if is_secret_key(key) && !value.is_null() {
                        JsonValue::String(MASK.to_string())
                    } else {
                        redact_json(value)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(redact_json).collect()),
        other => other.clone(),
    }
}

/// A credential held by a live session (API token, password). Never
/// printed or serialized; `.expose()` hands the raw value to the backend.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Debug for Sensitive<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl<T> Display for Sensitive<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl<T> Serialize for Sensitive<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(MASK)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Sensitive<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Sensitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shop_token_never_prints() {
        let token = Sensitive::new("shpat_123".to_string());
        assert_eq!(format!("{token:?} {token}"), "*** ***");
        assert_eq!(serde_json::to_string(&token).unwrap(), "\"***\"");
        assert_eq!(token.expose(), "shpat_123");
    }

    #[test]
    fn secret_names_match_loosely() {
        assert!(is_secret_key("password"));
        assert!(is_secret_key("DB_PASSWORD"));
        assert!(is_secret_key("X-Api-Key"));
        assert!(is_secret_key("access_token"));
        assert!(!is_secret_key("shop_url"));
        assert!(!is_secret_key("company_id"));
    }

    #[test]
    fn nested_credentials_are_masked() {
        let kwargs = json!({
            "model": "house_prices",
            "integration": {"host": "db", "password": "hunter2"},
            "sources": [{"api_key": "k1"}, {"api_key": null}]
        });
        assert_eq!(
            redact_json(&kwargs),
            json!({
                "model": "house_prices",
                "integration": {"host": "db", "password": "***"},
                "sources": [{"api_key": "***"}, {"api_key": null}]
            })
        );
    }

    #[test]
    fn deserializes_raw_value() {
        let token: Sensitive<String> = serde_json::from_str("\"secret\"").unwrap();
        assert_eq!(token.into_inner(), "secret");
    }
}
