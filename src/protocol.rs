//! Wire Protocol
//!
//! Defines the JSON envelopes exchanged between relay clients and the
//! server. Every frame is a single `{"type": ..., "payload": {...}}` object.
//!
//! Inbound frames are parsed in two steps: the envelope `type` selects a
//! [`ClientMessage`] variant, then the payload is deserialized into the typed
//! request for that variant. Unknown `type`/`cmd`/`info` values end up in an
//! explicit `Unknown` variant instead of being dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Greeting sent to every client right after the WebSocket is accepted
pub const GREETING_MESSAGE: &str = "WebSocket connection established.";

// ============================================
// INBOUND
// ============================================

/// Envelope as it arrives on the wire, before the payload is interpreted
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Messages sent from client to relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Device command (connect, disconnect, move, led)
    Command(CommandRequest),
    /// Device query (battery, position)
    Query(QueryRequest),
    /// System message, echoed back to the sender
    System(SystemPayload),
    /// Envelope with a missing or unrecognized `type`
    Unknown(Option<String>),
}

impl ClientMessage {
    /// Parse a text frame into a client message
    ///
    /// Fails only when the frame is not valid JSON or the payload does not
    /// have the shape its `type` requires. An unrecognized `type` parses
    /// successfully into [`ClientMessage::Unknown`].
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;

        // A missing payload behaves like an empty one
        let payload = match raw.payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let message = match raw.kind.as_deref() {
            Some("command") => ClientMessage::Command(serde_json::from_value(payload)?),
            Some("query") => ClientMessage::Query(serde_json::from_value(payload)?),
            Some("system") => ClientMessage::System(serde_json::from_value(payload)?),
            _ => ClientMessage::Unknown(raw.kind),
        };

        Ok(message)
    }
}

/// Payload of a `command` envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandRequest {
    /// Command name
    #[serde(default)]
    pub cmd: Option<String>,
    /// Target device identifier
    #[serde(default)]
    pub target: Option<String>,
    /// Command-specific parameters
    #[serde(default)]
    pub params: Value,
    /// Whether a success result should be echoed back (errors always are)
    #[serde(default)]
    pub require_result: Option<bool>,
}

impl CommandRequest {
    /// Whether the sender wants a result envelope for a successful command
    pub fn wants_ack(&self) -> bool {
        self.require_result.unwrap_or(true)
    }

    /// Interpret `cmd` and `params` as a typed command
    pub fn command(&self) -> Result<Command, serde_json::Error> {
        let command = match self.cmd.as_deref() {
            Some("connect") => Command::Connect,
            Some("disconnect") => Command::Disconnect,
            Some("move") => Command::Move(self.params_or_default()?),
            Some("led") => Command::Led(self.params_or_default()?),
            _ => Command::Unknown,
        };
        Ok(command)
    }

    fn params_or_default<T>(&self) -> Result<T, serde_json::Error>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match &self.params {
            Value::Null => Ok(T::default()),
            params => serde_json::from_value(params.clone()),
        }
    }
}

/// Typed device command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect,
    Disconnect,
    Move(MoveParams),
    Led(LedParams),
    Unknown,
}

/// Parameters of a `move` command
///
/// Speeds are forwarded to the motor unchanged; clamping is up to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct MoveParams {
    #[serde(default)]
    pub left_speed: i64,
    #[serde(default)]
    pub right_speed: i64,
}

/// Parameters of a `led` command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct LedParams {
    #[serde(default)]
    pub r: u8,
    #[serde(default)]
    pub g: u8,
    #[serde(default)]
    pub b: u8,
}

/// Payload of a `query` envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueryRequest {
    /// Query name
    #[serde(default)]
    pub info: Option<String>,
    /// Target device identifier
    #[serde(default)]
    pub target: Option<String>,
    /// Subscription toggle for `position` queries
    #[serde(default)]
    pub notify: Option<Value>,
}

impl QueryRequest {
    /// Interpret `info` as a typed query
    pub fn query(&self) -> Query {
        match self.info.as_deref() {
            Some("battery") => Query::Battery,
            Some("position") => Query::Position,
            _ => Query::Unknown,
        }
    }

    /// How this request changes the sender's position subscription
    ///
    /// `true` subscribes, any other present value unsubscribes, and an absent
    /// (or `null`) `notify` leaves the subscription alone.
    pub fn subscription_change(&self) -> SubscriptionChange {
        match &self.notify {
            None => SubscriptionChange::Keep,
            Some(Value::Bool(true)) => SubscriptionChange::Subscribe,
            Some(_) => SubscriptionChange::Unsubscribe,
        }
    }
}

/// Typed device query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Battery,
    Position,
    Unknown,
}

/// Requested change to a session's position subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    Subscribe,
    Unsubscribe,
    Keep,
}

/// Payload of a `system` envelope (both directions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPayload {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================
// OUTBOUND
// ============================================

/// Messages sent from relay to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Outcome of a command
    Result(CommandResult),
    /// Answer to a query, or a pushed position update
    Response(QueryResponse),
    /// System status
    System(SystemPayload),
    /// Protocol-level error
    Error(ErrorPayload),
}

impl ServerMessage {
    /// Greeting sent when a session opens
    pub fn connected() -> Self {
        ServerMessage::System(SystemPayload {
            status: Some("connected".to_string()),
            message: Some(GREETING_MESSAGE.to_string()),
        })
    }

    /// Protocol error envelope
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Error envelope payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Result status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Error,
}

/// Payload of a `result` envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub cmd: Option<String>,
    pub target: Option<String>,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandResult {
    pub fn success(request: &CommandRequest, message: Option<String>) -> Self {
        Self {
            cmd: request.cmd.clone(),
            target: request.target.clone(),
            status: CommandStatus::Success,
            message,
        }
    }

    pub fn error(request: &CommandRequest, message: impl Into<String>) -> Self {
        Self {
            cmd: request.cmd.clone(),
            target: request.target.clone(),
            status: CommandStatus::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == CommandStatus::Error
    }
}

/// Last-known position of a device as reported to clients
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub angle: Option<i32>,
    pub on_mat: bool,
}

/// Query-specific part of a `response` payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Battery {
        battery_level: Option<u8>,
    },
    Position {
        notify: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<PositionSnapshot>,
    },
    Bare {},
}

/// Payload of a `response` envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub info: Option<String>,
    pub target: Option<String>,
    #[serde(flatten)]
    pub body: ResponseBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl QueryResponse {
    /// Battery reading; `level` is `None` when the read failed
    pub fn battery(target: &str, level: Option<u8>, message: Option<String>) -> Self {
        Self {
            info: Some("battery".to_string()),
            target: Some(target.to_string()),
            body: ResponseBody::Battery {
                battery_level: level,
            },
            message,
        }
    }

    /// Position snapshot together with the sender's subscription state
    pub fn position(target: &str, notify: bool, snapshot: PositionSnapshot) -> Self {
        Self {
            info: Some("position".to_string()),
            target: Some(target.to_string()),
            body: ResponseBody::Position {
                notify,
                position: Some(snapshot),
            },
            message: None,
        }
    }

    /// Notice that a position subscription has ended
    pub fn termination(target: &str, reason: &str) -> Self {
        Self {
            info: Some("position".to_string()),
            target: Some(target.to_string()),
            body: ResponseBody::Position {
                notify: false,
                position: None,
            },
            message: Some(reason.to_string()),
        }
    }

    /// Response carrying only a message (device missing, unknown query)
    pub fn unavailable(info: Option<String>, target: Option<String>, message: &str) -> Self {
        Self {
            info,
            target,
            body: ResponseBody::Bare {},
            message: Some(message.to_string()),
        }
    }
}

/// Errors raised while parsing inbound frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_command() {
        let text = r#"{"type":"command","payload":{"cmd":"move","target":"X1","params":{"left_speed":30,"right_speed":-30},"require_result":false}}"#;
        let msg = ClientMessage::parse(text).unwrap();
        match msg {
            ClientMessage::Command(req) => {
                assert_eq!(req.target.as_deref(), Some("X1"));
                assert!(!req.wants_ack());
                assert_eq!(
                    req.command().unwrap(),
                    Command::Move(MoveParams {
                        left_speed: 30,
                        right_speed: -30
                    })
                );
            }
            other => panic!("Expected Command, got {:?}", other),
        }
    }

    #[test]
    fn test_require_result_defaults_to_true() {
        let text = r#"{"type":"command","payload":{"cmd":"connect","target":"X1"}}"#;
        match ClientMessage::parse(text).unwrap() {
            ClientMessage::Command(req) => {
                assert!(req.wants_ack());
                assert_eq!(req.command().unwrap(), Command::Connect);
            }
            other => panic!("Expected Command, got {:?}", other),
        }
    }

    #[test]
    fn test_led_params_default_to_zero() {
        let text = r#"{"type":"command","payload":{"cmd":"led","target":"X1","params":{"r":255}}}"#;
        match ClientMessage::parse(text).unwrap() {
            ClientMessage::Command(req) => {
                assert_eq!(
                    req.command().unwrap(),
                    Command::Led(LedParams { r: 255, g: 0, b: 0 })
                );
            }
            other => panic!("Expected Command, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_params_rejected() {
        let text = r#"{"type":"command","payload":{"cmd":"move","target":"X1","params":{"left_speed":"fast"}}}"#;
        match ClientMessage::parse(text).unwrap() {
            ClientMessage::Command(req) => assert!(req.command().is_err()),
            other => panic!("Expected Command, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command_and_type() {
        let text = r#"{"type":"command","payload":{"cmd":"jump","target":"X1"}}"#;
        match ClientMessage::parse(text).unwrap() {
            ClientMessage::Command(req) => assert_eq!(req.command().unwrap(), Command::Unknown),
            other => panic!("Expected Command, got {:?}", other),
        }

        let msg = ClientMessage::parse(r#"{"type":"telemetry","payload":{}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown(Some("telemetry".to_string())));

        let msg = ClientMessage::parse(r#"{"payload":{}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown(None));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let err = ClientMessage::parse("not json").unwrap_err();
        assert!(err.to_string().starts_with("Invalid message format"));
    }

    #[test]
    fn test_missing_payload_is_empty() {
        match ClientMessage::parse(r#"{"type":"query"}"#).unwrap() {
            ClientMessage::Query(req) => {
                assert_eq!(req.query(), Query::Unknown);
                assert!(req.target.is_none());
            }
            other => panic!("Expected Query, got {:?}", other),
        }
    }

    #[test]
    fn test_subscription_change() {
        let parse = |text: &str| match ClientMessage::parse(text).unwrap() {
            ClientMessage::Query(req) => req.subscription_change(),
            other => panic!("Expected Query, got {:?}", other),
        };

        assert_eq!(
            parse(r#"{"type":"query","payload":{"info":"position","target":"X1","notify":true}}"#),
            SubscriptionChange::Subscribe
        );
        assert_eq!(
            parse(r#"{"type":"query","payload":{"info":"position","target":"X1","notify":false}}"#),
            SubscriptionChange::Unsubscribe
        );
        assert_eq!(
            parse(r#"{"type":"query","payload":{"info":"position","target":"X1","notify":0}}"#),
            SubscriptionChange::Unsubscribe
        );
        assert_eq!(
            parse(r#"{"type":"query","payload":{"info":"position","target":"X1"}}"#),
            SubscriptionChange::Keep
        );
    }

    #[test]
    fn test_serialize_result_omits_empty_message() {
        let req = CommandRequest {
            cmd: Some("connect".to_string()),
            target: Some("X1".to_string()),
            params: Value::Null,
            require_result: None,
        };
        let msg = ServerMessage::Result(CommandResult::success(&req, None));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type":"result","payload":{"cmd":"connect","target":"X1","status":"success"}})
        );
    }

    #[test]
    fn test_serialize_position_response() {
        let snapshot = PositionSnapshot {
            x: Some(10),
            y: Some(20),
            angle: Some(90),
            on_mat: true,
        };
        let msg = ServerMessage::Response(QueryResponse::position("X1", true, snapshot));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type":"response","payload":{
                "info":"position","target":"X1","notify":true,
                "position":{"x":10,"y":20,"angle":90,"on_mat":true}
            }})
        );
    }

    #[test]
    fn test_serialize_unreported_position_is_null() {
        let msg = ServerMessage::Response(QueryResponse::position(
            "X1",
            false,
            PositionSnapshot::default(),
        ));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value["payload"]["position"],
            json!({"x":null,"y":null,"angle":null,"on_mat":false})
        );
    }

    #[test]
    fn test_serialize_battery_variants() {
        let missing = ServerMessage::Response(QueryResponse::unavailable(
            Some("battery".to_string()),
            Some("X2".to_string()),
            "Device not connected",
        ));
        let value: Value = serde_json::from_str(&missing.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type":"response","payload":{"info":"battery","target":"X2","message":"Device not connected"}})
        );

        let timed_out = ServerMessage::Response(QueryResponse::battery(
            "X1",
            None,
            Some("Timed out while reading battery level".to_string()),
        ));
        let value: Value = serde_json::from_str(&timed_out.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"]["battery_level"], Value::Null);
        assert!(value["payload"].as_object().unwrap().contains_key("battery_level"));
    }

    #[test]
    fn test_serialize_termination_notice() {
        let msg = ServerMessage::Response(QueryResponse::termination("X1", "Device disconnected"));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type":"response","payload":{
                "info":"position","target":"X1","notify":false,"message":"Device disconnected"
            }})
        );
    }

    #[test]
    fn test_serialize_greeting_and_error() {
        let value: Value =
            serde_json::from_str(&ServerMessage::connected().to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type":"system","payload":{"status":"connected","message":GREETING_MESSAGE}})
        );

        let value: Value = serde_json::from_str(
            &ServerMessage::error("Unknown message type").to_json().unwrap(),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({"type":"error","payload":{"message":"Unknown message type"}})
        );
    }
}
