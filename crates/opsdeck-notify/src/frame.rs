//! Wire frames exchanged on the notification channel.
//!
//! Raw text is parsed exactly once, here, into [`InboundFrame`]; everything
//! downstream matches on the tag instead of on raw `type` strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::ProtocolError;

/// Frames larger than this are dropped without being parsed.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Ping,
    Pong,
    /// Server acknowledgement, including the `connection` greeting sent on open.
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Maps the wire `priority` field. Absent or unknown values are `Normal`.
    pub fn from_wire(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Priority::Normal;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Priority::Low,
            "high" | "urgent" | "critical" => Priority::High,
            _ => Priority::Normal,
        }
    }

    pub fn is_interrupt(self) -> bool {
        self == Priority::High
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub event_type: String,
    pub title: Option<String>,
    pub message: Option<String>,
    pub priority: Priority,
    /// Display only; never used for ordering.
    pub server_timestamp: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(ControlKind),
    Domain(DomainEvent),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
}

pub fn parse_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::Oversized {
            len: text.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    let kind = raw.kind.trim();
    if kind.is_empty() {
        return Err(ProtocolError::MissingType);
    }

    let control = match kind {
        "ping" => Some(ControlKind::Ping),
        "pong" => Some(ControlKind::Pong),
        "ack" | "connection" => Some(ControlKind::Ack),
        _ => None,
    };
    if let Some(control) = control {
        return Ok(InboundFrame::Control(control));
    }

    Ok(InboundFrame::Domain(DomainEvent {
        event_type: kind.to_string(),
        title: raw.title,
        message: raw.message,
        priority: Priority::from_wire(raw.priority.as_deref()),
        server_timestamp: raw.timestamp.as_ref().and_then(parse_timestamp),
    }))
}

/// Accepts epoch milliseconds or an RFC 3339 string; anything else is ignored.
fn parse_timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::Number(number) => {
            let millis = number.as_i64()?;
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
        }
        Value::String(text) => OffsetDateTime::parse(text, &Rfc3339).ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Ping { timestamp: u64 },
}

impl OutboundFrame {
    pub fn ping_at(now: OffsetDateTime) -> Self {
        let millis = now.unix_timestamp_nanos() / 1_000_000;
        OutboundFrame::Ping {
            timestamp: u64::try_from(millis).unwrap_or_default(),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Encode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_domain_event_with_all_fields() {
        let frame = parse_frame(
            r#"{"type":"new_user","title":"New Signup","message":"x@y.com","priority":"normal"}"#,
        )
        .unwrap();
        let InboundFrame::Domain(event) = frame else {
            panic!("expected domain event");
        };
        assert_eq!(event.event_type, "new_user");
        assert_eq!(event.title.as_deref(), Some("New Signup"));
        assert_eq!(event.message.as_deref(), Some("x@y.com"));
        assert_eq!(event.priority, Priority::Normal);
        assert!(event.server_timestamp.is_none());
    }

    #[test]
    fn control_types_never_become_domain_events() {
        assert_eq!(
            parse_frame(r#"{"type":"pong"}"#).unwrap(),
            InboundFrame::Control(ControlKind::Pong)
        );
        assert_eq!(
            parse_frame(r#"{"type":"connection","status":"connected"}"#).unwrap(),
            InboundFrame::Control(ControlKind::Ack)
        );
        assert_eq!(
            parse_frame(r#"{"type":"ping","timestamp":1}"#).unwrap(),
            InboundFrame::Control(ControlKind::Ping)
        );
    }

    #[test]
    fn priority_defaults_to_normal() {
        let InboundFrame::Domain(event) = parse_frame(r#"{"type":"payment"}"#).unwrap() else {
            panic!("expected domain event");
        };
        assert_eq!(event.priority, Priority::Normal);
        assert_eq!(Priority::from_wire(Some("bogus")), Priority::Normal);
        assert_eq!(Priority::from_wire(Some("HIGH")), Priority::High);
        assert_eq!(Priority::from_wire(Some("critical")), Priority::High);
        assert_eq!(Priority::from_wire(Some("low")), Priority::Low);
    }

    #[test]
    fn reads_server_timestamps_in_both_encodings() {
        let InboundFrame::Domain(millis) =
            parse_frame(r#"{"type":"upgrade","timestamp":1700000000000}"#).unwrap()
        else {
            panic!("expected domain event");
        };
        assert_eq!(
            millis.server_timestamp.map(|ts| ts.unix_timestamp()),
            Some(1_700_000_000)
        );

        let InboundFrame::Domain(rfc) =
            parse_frame(r#"{"type":"upgrade","timestamp":"2024-05-01T10:00:00Z"}"#).unwrap()
        else {
            panic!("expected domain event");
        };
        assert_eq!(
            rfc.server_timestamp.map(|ts| ts.unix_timestamp()),
            Some(1_714_557_600)
        );

        let InboundFrame::Domain(junk) =
            parse_frame(r#"{"type":"upgrade","timestamp":[1]}"#).unwrap()
        else {
            panic!("expected domain event");
        };
        assert!(junk.server_timestamp.is_none());
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(parse_frame("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(parse_frame("[1,2]"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(parse_frame(r#"{"title":"x"}"#), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            parse_frame(r#"{"type":"new_user","title":42}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(parse_frame(r#"{"type":"  "}"#), Err(ProtocolError::MissingType));
    }

    #[test]
    fn rejects_oversized_frames() {
        let big = format!(r#"{{"type":"x","message":"{}"}}"#, "a".repeat(MAX_FRAME_BYTES));
        assert!(matches!(parse_frame(&big), Err(ProtocolError::Oversized { .. })));
    }

    #[test]
    fn encodes_ping_with_client_timestamp() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let text = OutboundFrame::ping_at(now).to_text().unwrap();
        assert_eq!(text, r#"{"type":"ping","timestamp":1700000000000}"#);
    }
}
