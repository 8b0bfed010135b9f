//! Error taxonomy: application faults, protocol faults, and the errors a
//! caller can observe on an issued call.

use crate::transport::TransportError;

/// Application-level fault raised deliberately by a method handler,
/// carried to the remote caller as a string code.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{code}")]
pub struct RpcFault {
    /// Application-chosen error code.
    pub code: String,
}

impl RpcFault {
    /// Fault with the given code.
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

/// Malformed or unexpected peer input detected during inbound dispatch.
/// Never carried back to the remote peer; gated by the engine's safe mode
/// (swallowed vs. raised).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolFault {
    /// Raw text was not valid JSON.
    #[error("failed to parse a JSON message body")]
    MalformedJson,
    /// JSON did not fit the envelope shape.
    #[error("message envelope malformed")]
    MalformedEnvelope,
    /// Envelope content did not fit the call-request shape.
    #[error("method record malformed")]
    MalformedMethodRecord,
    /// Envelope content did not fit the call-response shape.
    #[error("response record malformed")]
    MalformedResponseRecord,
    /// Envelope content did not fit the event shape.
    #[error("event record malformed")]
    MalformedEventRecord,
    /// A response arrived for which no pending call exists (expected after
    /// a locally fired timeout).
    #[error("no callback found: {sequence}")]
    UnknownCallback {
        /// Sequence number the response carried.
        sequence: u64,
    },
    /// A response payload failed the stored response schema.
    #[error("response body malformed")]
    MalformedResponseBody,
    /// Event data failed the registered event schema.
    #[error("event body malformed")]
    MalformedEventBody,
    /// Envelope carried a kind no record shape corresponds to.
    #[error("unimplemented message kind: {kind}")]
    UnimplementedKind {
        /// The unknown wire discriminant.
        kind: u8,
    },
}

/// Failure to put an envelope on the wire.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The payload could not be serialized to JSON text.
    #[error("payload encoding failed: {0}")]
    Encode(String),
    /// The transport refused or lost the message.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What the application observes on an issued call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The remote handler returned an application fault.
    #[error("rpc fault: {0}")]
    Fault(RpcFault),
    /// No matching response arrived within the configured method timeout.
    #[error("method call timed out")]
    Timeout,
    /// The outbound send failed; the call was rejected immediately.
    #[error(transparent)]
    Send(#[from] SendError),
    /// The pending call was discarded without a resolution. Occurs when the
    /// peer answers with a payload that fails the response schema.
    #[error("call abandoned without a response")]
    Abandoned,
    /// The resolved payload failed to decode into the typed response.
    #[error("response decoding failed: {0}")]
    Decode(String),
    /// The connection has not been established yet.
    #[error("not connected")]
    NotConnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_fault_displays_code() {
        let fault = RpcFault::new("value out of range");
        assert_eq!(fault.to_string(), "value out of range");
        assert_eq!(fault.code, "value out of range");
    }

    #[test]
    fn protocol_fault_messages() {
        assert_eq!(
            ProtocolFault::MalformedJson.to_string(),
            "failed to parse a JSON message body"
        );
        assert_eq!(
            ProtocolFault::UnknownCallback { sequence: 9 }.to_string(),
            "no callback found: 9"
        );
        assert_eq!(
            ProtocolFault::UnimplementedKind { kind: 7 }.to_string(),
            "unimplemented message kind: 7"
        );
    }

    #[test]
    fn send_error_wraps_transport() {
        let err = SendError::from(TransportError::Closed);
        assert_eq!(err.to_string(), "connection closed");
    }

    #[test]
    fn call_error_from_send() {
        let err = CallError::from(SendError::Encode("bad".into()));
        assert!(matches!(err, CallError::Send(SendError::Encode(_))));
    }

    #[test]
    fn call_error_fault_display() {
        let err = CallError::Fault(RpcFault::new("nope"));
        assert_eq!(err.to_string(), "rpc fault: nope");
    }
}
