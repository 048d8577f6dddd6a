use serde_json::{Map, Value};

use podtail_types::LogLevel;

/// Message content, parsed as structured JSON where possible
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    PlainText(String),
    Structured {
        message: String,
        /// Upper-cased level as found in the payload
        severity: Option<String>,
        /// Remaining fields once message and severity are taken out
        fields: Map<String, Value>,
    },
}

/// Common field names for the message
const MESSAGE_FIELDS: [&str; 3] = ["msg", "message", "Message"];

/// Common field names for log level
const LEVEL_FIELDS: [&str; 3] = ["level", "severity", "levelname"];

impl Payload {
    /// Parse a message body
    pub fn parse(body: &str) -> Self {
        let trimmed = body.trim();
        if !trimmed.starts_with('{') {
            return Self::PlainText(trimmed.to_string());
        }

        let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(trimmed) else {
            return Self::PlainText(trimmed.to_string());
        };

        let message = take_first(&mut fields, &MESSAGE_FIELDS, |v| match v {
            Value::String(s) => Some(s.clone()),
            _ => None,
        });

        let severity = take_first(&mut fields, &LEVEL_FIELDS, |v| match v {
            Value::String(s) => Some(s.to_uppercase()),
            // Some loggers use numeric levels
            Value::Number(n) => n.as_u64().map(|num| level_from_number(num).to_string()),
            _ => None,
        });

        Self::Structured {
            // Without a message field the whole object is the message
            message: message.unwrap_or_else(|| trimmed.to_string()),
            severity,
            fields,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::PlainText(text) => text,
            Self::Structured { message, .. } => message,
        }
    }

    pub fn level(&self) -> LogLevel {
        match self {
            Self::Structured {
                severity: Some(severity),
                ..
            } => LogLevel::parse(severity),
            _ => LogLevel::Unknown,
        }
    }
}

/// Remove and convert the first field in `keys` that `convert` accepts
fn take_first(
    fields: &mut Map<String, Value>,
    keys: &[&str],
    convert: impl Fn(&Value) -> Option<String>,
) -> Option<String> {
    for key in keys {
        if let Some(converted) = fields.get(*key).and_then(&convert) {
            fields.remove(*key);
            return Some(converted);
        }
    }
    None
}

/// Pino/bunyan style numeric levels
fn level_from_number(num: u64) -> &'static str {
    match num {
        0..=10 => "TRACE",
        11..=20 => "DEBUG",
        21..=30 => "INFO",
        31..=40 => "WARN",
        41..=50 => "ERROR",
        _ => "FATAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        let payload = Payload::parse("  server started on :8080 ");
        assert_eq!(payload, Payload::PlainText("server started on :8080".to_string()));
        assert_eq!(payload.level(), LogLevel::Unknown);
    }

    #[test]
    fn test_structured_extracts_message_and_severity() {
        let payload = Payload::parse(r#"{"level":"warning","msg":"disk almost full","pct":93}"#);
        let Payload::Structured {
            message,
            severity,
            fields,
        } = &payload
        else {
            panic!("expected structured payload");
        };
        assert_eq!(message, "disk almost full");
        assert_eq!(severity.as_deref(), Some("WARNING"));
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("pct"), Some(&Value::from(93)));
        assert_eq!(payload.level(), LogLevel::Warn);
    }

    #[test]
    fn test_structured_without_message_uses_whole_body() {
        let body = r#"{"event":"login","user":"ada"}"#;
        let payload = Payload::parse(body);
        assert_eq!(payload.message(), body);
    }

    #[test]
    fn test_numeric_level() {
        let payload = Payload::parse(r#"{"level":50,"msg":"boom"}"#);
        assert_eq!(payload.level(), LogLevel::Error);
    }

    #[test]
    fn test_invalid_json_is_plain_text() {
        let payload = Payload::parse("{not json");
        assert_eq!(payload, Payload::PlainText("{not json".to_string()));

        let payload = Payload::parse("[1, 2]");
        assert!(matches!(payload, Payload::PlainText(_)));
    }
}
