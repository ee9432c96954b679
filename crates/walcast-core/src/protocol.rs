//! JSON control protocol spoken over each client socket.

use serde::Serialize;
use serde_json::Value;

use crate::types::{ChangeEvent, ChangeKind};

/// A message received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `{"type":"auth","token":...}`. A missing or non-string token is `None`.
    Auth { token: Option<String> },
    /// `{"type":"subscribe","tables":[...]}`. `None` when `tables` is not an array.
    Subscribe { tables: Option<Vec<String>> },
    /// `{"type":"unsubscribe","tables":[...]}`. `None` when `tables` is not an array.
    Unsubscribe { tables: Option<Vec<String>> },
    /// Any other JSON value, including objects without a string `type`.
    Unknown { message_type: Option<String> },
}

impl ClientMessage {
    /// Parse a raw text frame. Fails only when the frame is not valid JSON.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(text)?;

        let message_type = value.get("type").and_then(Value::as_str);

        let message = match message_type {
            Some("auth") => ClientMessage::Auth {
                token: value.get("token").and_then(Value::as_str).map(str::to_string),
            },
            Some("subscribe") => ClientMessage::Subscribe {
                tables: table_list(&value),
            },
            Some("unsubscribe") => ClientMessage::Unsubscribe {
                tables: table_list(&value),
            },
            other => ClientMessage::Unknown {
                message_type: other.map(str::to_string),
            },
        };

        Ok(message)
    }
}

fn table_list(value: &Value) -> Option<Vec<String>> {
    let tables = value.get("tables")?.as_array()?;
    Some(
        tables
            .iter()
            .map(|t| match t {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
    )
}

/// Informational notices sent in `{"type":"info","message":...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoCode {
    Authenticated,
    AuthenticatedViaQuery,
    NoAuthRequired,
    PleaseAuth,
}

/// Error codes sent in `{"type":"error","error":...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidJson,
    InvalidToken,
    NotAuthenticated,
    TablesMustBeArray,
    UnknownMessageType,
}

/// A message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Info {
        message: InfoCode,
    },
    Error {
        error: ErrorCode,
    },
    Subscribed {
        tables: Vec<String>,
    },
    Unsubscribed {
        tables: Vec<String>,
    },
    Change {
        table: Option<String>,
        schema: Option<String>,
        kind: ChangeKind,
        body: Value,
        lsn: String,
        timestamp: String,
    },
}

impl ServerMessage {
    pub fn info(message: InfoCode) -> Self {
        ServerMessage::Info { message }
    }

    pub fn error(error: ErrorCode) -> Self {
        ServerMessage::Error { error }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&ChangeEvent> for ServerMessage {
    fn from(event: &ChangeEvent) -> Self {
        ServerMessage::Change {
            table: event.table.clone(),
            schema: event.schema.clone(),
            kind: event.kind,
            body: event.body.clone(),
            lsn: event.lsn.to_string(),
            timestamp: event.timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::Lsn;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_parse_auth() {
        let msg = ClientMessage::parse(r#"{"type":"auth","token":"s3cr3t"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Auth {
                token: Some("s3cr3t".into())
            }
        );

        let msg = ClientMessage::parse(r#"{"type":"auth","token":42}"#).unwrap();
        assert_eq!(msg, ClientMessage::Auth { token: None });
    }

    #[test]
    fn test_parse_subscribe_tables() {
        let msg = ClientMessage::parse(r#"{"type":"subscribe","tables":["bases",7]}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                tables: Some(vec!["bases".into(), "7".into()])
            }
        );
    }

    #[test]
    fn test_parse_tables_not_array() {
        let msg = ClientMessage::parse(r#"{"type":"unsubscribe","tables":"bases"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unsubscribe { tables: None });

        let msg = ClientMessage::parse(r#"{"type":"subscribe"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { tables: None });
    }

    #[test]
    fn test_parse_unknown() {
        let msg = ClientMessage::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Unknown {
                message_type: Some("ping".into())
            }
        );

        let msg = ClientMessage::parse("[1,2,3]").unwrap();
        assert_eq!(msg, ClientMessage::Unknown { message_type: None });
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(ClientMessage::parse("{type: auth}").is_err());
        assert!(ClientMessage::parse("").is_err());
    }

    #[test]
    fn test_server_message_wire_format() {
        let info = ServerMessage::info(InfoCode::Authenticated).to_json().unwrap();
        assert_eq!(info, r#"{"type":"info","message":"authenticated"}"#);

        let error = ServerMessage::error(ErrorCode::TablesMustBeArray)
            .to_json()
            .unwrap();
        assert_eq!(error, r#"{"type":"error","error":"tables_must_be_array"}"#);

        let subscribed = ServerMessage::Subscribed {
            tables: vec!["bases".into()],
        }
        .to_json()
        .unwrap();
        assert_eq!(subscribed, r#"{"type":"subscribed","tables":["bases"]}"#);
    }

    #[test]
    fn test_change_message_from_event() {
        let event = ChangeEvent {
            kind: ChangeKind::Insert,
            schema: Some("public".into()),
            table: Some("bases".into()),
            body: json!({"kind": "insert", "table": "bases"}),
            lsn: Lsn::new(0x16B3748),
            observed_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        };

        let value: Value =
            serde_json::from_str(&ServerMessage::from(&event).to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "change");
        assert_eq!(value["table"], "bases");
        assert_eq!(value["schema"], "public");
        assert_eq!(value["kind"], "insert");
        assert_eq!(value["body"]["table"], "bases");
        assert_eq!(value["lsn"], "0/16B3748");
        assert_eq!(value["timestamp"], "2024-01-02T03:04:05.000Z");
    }
}
