//! Wire-format types: the outer envelope and the three record shapes it
//! carries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminant of an [`Envelope`], numeric on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// A call request (peer invokes one of our methods).
    Method,
    /// A reply correlated to an earlier call request.
    Response,
    /// A fire-and-forget notification.
    Event,
}

impl MessageKind {
    /// Decode the wire discriminant. Returns `None` for values no known
    /// record shape corresponds to.
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Method),
            1 => Some(Self::Response),
            2 => Some(Self::Event),
            _ => None,
        }
    }

    /// The numeric wire discriminant.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Method => 0,
            Self::Response => 1,
            Self::Event => 2,
        }
    }
}

/// Outermost unit ever placed on the wire. `kind` determines how `content`
/// is further decoded; unknown `kind` values are kept so dispatch can
/// report them distinctly from a malformed envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Wire discriminant (`0` method, `1` response, `2` event).
    pub kind: u8,
    /// Kind-specific record, decoded in a second step.
    pub content: Value,
}

impl Envelope {
    /// Serialize `content` under the given kind into wire text.
    pub fn encode<T: Serialize>(kind: MessageKind, content: &T) -> Result<String, serde_json::Error> {
        let envelope = Self {
            kind: kind.to_wire(),
            content: serde_json::to_value(content)?,
        };
        serde_json::to_string(&envelope)
    }
}

/// One outstanding call, identified by name and a sequence number unique to
/// the issuing engine for its whole lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallRequest {
    /// Correlation number, monotonically increasing, never reused.
    pub sequence: u64,
    /// Method name.
    pub name: String,
    /// Request payload, opaque at this layer.
    pub payload: Value,
}

/// Reply to a [`CallRequest`]. At most one of `payload`/`error_code` is
/// meaningful; both absent means a void-typed success.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    /// Echo of the request's correlation number.
    pub sequence: u64,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Application error code on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Fire-and-forget notification. Carries no sequence number and is never
/// correlated to a reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event name.
    pub name: String,
    /// Event payload, opaque at this layer.
    pub data: Value,
}
