//! Submission payload validation.
//!
//! Recipients are validated per channel: RFC-lite for email, E.164 for sms,
//! and an opaque token shape for push. Contexts must be string-keyed maps
//! whose leaves are strings, numbers, or bools (nested maps allowed).

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use herald_common::{Channel, DispatchError};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("valid regex")
});

static E164_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("valid regex"));

static PUSH_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,255}$").expect("valid regex"));

pub fn validate_recipient(channel: Channel, recipient: &str) -> Result<(), DispatchError> {
    let (pattern, what): (&Regex, &str) = match channel {
        Channel::Email => (&EMAIL_RE, "email address"),
        Channel::Sms => (&E164_RE, "E.164 phone number"),
        Channel::Push => (&PUSH_TOKEN_RE, "device token"),
    };

    if pattern.is_match(recipient) {
        Ok(())
    } else {
        Err(DispatchError::InvalidPayload(format!(
            "recipient is not a valid {what}"
        )))
    }
}

/// Context values may be strings, numbers, bools, or nested objects of the
/// same; arrays and nulls are rejected.
pub fn validate_context(context: &Map<String, Value>) -> Result<(), DispatchError> {
    for (key, value) in context {
        validate_context_value(key, value)?;
    }
    Ok(())
}

fn validate_context_value(key: &str, value: &Value) -> Result<(), DispatchError> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(()),
        Value::Object(map) => {
            for (nested_key, nested_value) in map {
                validate_context_value(nested_key, nested_value)?;
            }
            Ok(())
        }
        Value::Array(_) | Value::Null => Err(DispatchError::InvalidPayload(format!(
            "context value for '{key}' must be a string, number, bool, or nested map"
        ))),
    }
}
