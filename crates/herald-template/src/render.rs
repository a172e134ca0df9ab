//! Placeholder substitution and channel-shaped content validation.
//!
//! Placeholders have the form `{{name}}` or `{{path.to.value}}` for nested
//! context maps. Missing placeholders render as the empty string and are
//! counted so the per-render metric can surface them.

use herald_common::{
    DispatchError, RenderedPayload, TemplateContent, MAX_SMS_BODY_CHARS,
};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.]*)\s*\}\}").expect("valid regex"));

/// Resolve a dotted path against a nested string-keyed map.
fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = context.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        // Objects, arrays, and null do not render
        _ => None,
    }
}

/// Substitute every placeholder in `input`, counting unresolved ones.
pub fn substitute(input: &str, context: &Map<String, Value>, missing: &mut u32) -> String {
    PLACEHOLDER_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let path = &caps[1];
            match lookup(context, path).and_then(value_to_string) {
                Some(value) => value,
                None => {
                    *missing += 1;
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Render channel-shaped content with the given context.
/// Returns the payload and the number of unresolved placeholders.
pub fn render_content(
    content: &TemplateContent,
    context: &Map<String, Value>,
) -> Result<(RenderedPayload, u32), DispatchError> {
    let mut missing = 0u32;

    let payload = match content {
        TemplateContent::Email { subject, html, text } => RenderedPayload::Email {
            subject: substitute(subject, context, &mut missing),
            html: substitute(html, context, &mut missing),
            text: substitute(text, context, &mut missing),
        },
        TemplateContent::Sms { body } => {
            let body = substitute(body, context, &mut missing);
            if body.chars().count() > MAX_SMS_BODY_CHARS {
                return Err(DispatchError::TemplateInvalid(format!(
                    "rendered sms body exceeds {MAX_SMS_BODY_CHARS} chars"
                )));
            }
            RenderedPayload::Sms { body }
        }
        TemplateContent::Push { title, body, data } => {
            let data = data
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, context, &mut missing)))
                .collect();
            RenderedPayload::Push {
                title: substitute(title, context, &mut missing),
                body: substitute(body, context, &mut missing),
                data,
            }
        }
    };

    Ok((payload, missing))
}

/// Validate channel-shaped content at create/update time.
pub fn validate_content(content: &TemplateContent) -> Result<(), DispatchError> {
    match content {
        TemplateContent::Email { subject, html, text } => {
            if subject.trim().is_empty() {
                return Err(DispatchError::TemplateInvalid(
                    "email template requires a non-empty subject".to_string(),
                ));
            }
            if html.trim().is_empty() && text.trim().is_empty() {
                return Err(DispatchError::TemplateInvalid(
                    "email template requires a non-empty body".to_string(),
                ));
            }
        }
        TemplateContent::Sms { body } => {
            if body.trim().is_empty() {
                return Err(DispatchError::TemplateInvalid(
                    "sms template requires a non-empty body".to_string(),
                ));
            }
            if body.chars().count() > MAX_SMS_BODY_CHARS {
                return Err(DispatchError::TemplateInvalid(format!(
                    "sms body exceeds {MAX_SMS_BODY_CHARS} chars"
                )));
            }
        }
        TemplateContent::Push { title, body, .. } => {
            if title.trim().is_empty() || body.trim().is_empty() {
                return Err(DispatchError::TemplateInvalid(
                    "push template requires a title and a body".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn substitutes_flat_placeholders() {
        let ctx = context(json!({"name": "Ada"}));
        let mut missing = 0;
        assert_eq!(substitute("Hello {{name}}!", &ctx, &mut missing), "Hello Ada!");
        assert_eq!(missing, 0);
    }

    #[test]
    fn substitutes_nested_paths() {
        let ctx = context(json!({"user": {"profile": {"name": "Ada"}}, "count": 3}));
        let mut missing = 0;
        let out = substitute("{{user.profile.name}} has {{count}} items", &ctx, &mut missing);
        assert_eq!(out, "Ada has 3 items");
        assert_eq!(missing, 0);
    }

    #[test]
    fn missing_placeholders_render_empty_and_count() {
        let ctx = context(json!({"name": "Ada"}));
        let mut missing = 0;
        let out = substitute("Hi {{name}}, your code is {{code}}", &ctx, &mut missing);
        assert_eq!(out, "Hi Ada, your code is ");
        assert_eq!(missing, 1);
    }

    #[test]
    fn object_valued_placeholder_counts_as_missing() {
        let ctx = context(json!({"user": {"name": "Ada"}}));
        let mut missing = 0;
        assert_eq!(substitute("{{user}}", &ctx, &mut missing), "");
        assert_eq!(missing, 1);
    }

    #[test]
    fn render_is_deterministic() {
        let content = TemplateContent::Email {
            subject: "Welcome {{name}}".to_string(),
            html: "<p>Hello {{name}}</p>".to_string(),
            text: "Hello {{name}}".to_string(),
        };
        let ctx = context(json!({"name": "Ada"}));

        let (first, _) = render_content(&content, &ctx).unwrap();
        let (second, _) = render_content(&content, &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rendered_sms_over_limit_is_rejected() {
        let content = TemplateContent::Sms {
            body: "{{filler}}".to_string(),
        };
        let ctx = context(json!({"filler": "x".repeat(1601)}));
        let err = render_content(&content, &ctx).unwrap_err();
        assert!(matches!(err, DispatchError::TemplateInvalid(_)));
    }

    #[test]
    fn push_data_values_are_rendered() {
        let mut data = std::collections::HashMap::new();
        data.insert("deep_link".to_string(), "app://order/{{order_id}}".to_string());
        let content = TemplateContent::Push {
            title: "Order update".to_string(),
            body: "Order {{order_id}} shipped".to_string(),
            data,
        };
        let ctx = context(json!({"order_id": "42"}));

        let (payload, missing) = render_content(&content, &ctx).unwrap();
        assert_eq!(missing, 0);
        match payload {
            RenderedPayload::Push { data, body, .. } => {
                assert_eq!(data["deep_link"], "app://order/42");
                assert_eq!(body, "Order 42 shipped");
            }
            _ => panic!("expected push payload"),
        }
    }

    #[test]
    fn validation_rejects_empty_email_subject() {
        let content = TemplateContent::Email {
            subject: "  ".to_string(),
            html: "<p>hi</p>".to_string(),
            text: String::new(),
        };
        assert!(validate_content(&content).is_err());
    }

    #[test]
    fn validation_rejects_oversized_sms() {
        let content = TemplateContent::Sms {
            body: "x".repeat(1601),
        };
        assert!(validate_content(&content).is_err());
    }

    #[test]
    fn validation_accepts_text_only_email() {
        let content = TemplateContent::Email {
            subject: "Hi".to_string(),
            html: String::new(),
            text: "plain".to_string(),
        };
        assert!(validate_content(&content).is_ok());
    }
}
