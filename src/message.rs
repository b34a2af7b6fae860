//! Wire envelopes and the inbound classifier.
//!
//! Every frame is a single JSON object. An object carrying a `result` key is an
//! [`Outcome`]; any other object is a [`Call`]. Callers only ever see the typed
//! [`Message`] produced by [`decode`].

use crate::types::{Args, CallId, Kwargs, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a [`Call`] expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Fire-and-forget; no [`Outcome`] is ever produced.
    Notification,
    /// Exactly one [`Outcome`] with this id is expected.
    Tracked(CallId),
}

impl CallKind {
    pub fn id(&self) -> Option<CallId> {
        match self {
            CallKind::Notification => None,
            CallKind::Tracked(id) => Some(*id),
        }
    }
}

/// A request to invoke a named method on the other endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: String,
    pub args: Args,
    pub kwargs: Kwargs,
    pub kind: CallKind,
}

impl Call {
    pub fn notification(method: impl Into<String>, args: Args, kwargs: Kwargs) -> Self {
        Self {
            method: method.into(),
            args,
            kwargs,
            kind: CallKind::Notification,
        }
    }

    pub fn tracked(method: impl Into<String>, args: Args, kwargs: Kwargs, id: CallId) -> Self {
        Self {
            method: method.into(),
            args,
            kwargs,
            kind: CallKind::Tracked(id),
        }
    }

    pub fn to_json(&self) -> String {
        let wire = WireCall {
            method: &self.method,
            args: &self.args,
            kwargs: &self.kwargs,
            id: self.kind.id(),
        };
        // Serializing borrowed JSON values into a string cannot fail.
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

/// The result of a tracked [`Call`], matched to it by `id`.
///
/// `error` is checked first: when it is set, `result` carries no meaning.
/// A `null` error is the same as no error, both here and on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: CallId,
    pub result: Value,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Outcome {
    pub fn success(id: CallId, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    /// An error outcome. A `null` descriptor yields a success with a `null` result.
    pub fn failure(id: CallId, error: impl Into<Value>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(error.into()).filter(|e| !e.is_null()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.error, Some(ref e) if !e.is_null())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(Call),
    Outcome(Outcome),
}

impl From<Call> for Message {
    fn from(call: Call) -> Self {
        Message::Call(call)
    }
}

impl From<Outcome> for Message {
    fn from(outcome: Outcome) -> Self {
        Message::Outcome(outcome)
    }
}

pub fn encode(message: &Message) -> String {
    match message {
        Message::Call(call) => call.to_json(),
        Message::Outcome(outcome) => outcome.to_json(),
    }
}

/// Parse and classify one frame.
pub fn decode(payload: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(payload).map_err(DecodeError::Malformed)?;
    let Value::Object(object) = value else {
        return Err(DecodeError::NotAnObject);
    };

    if object.contains_key("result") {
        let outcome: Outcome =
            serde_json::from_value(Value::Object(object)).map_err(DecodeError::InvalidOutcome)?;
        return Ok(Message::Outcome(outcome));
    }

    let wire: OwnedWireCall =
        serde_json::from_value(Value::Object(object)).map_err(DecodeError::InvalidCall)?;
    if wire.method.is_empty() {
        return Err(DecodeError::EmptyMethod);
    }
    Ok(Message::Call(Call {
        method: wire.method,
        args: wire.args,
        kwargs: wire.kwargs,
        kind: match wire.id {
            Some(id) => CallKind::Tracked(id),
            None => CallKind::Notification,
        },
    }))
}

#[derive(Serialize)]
struct WireCall<'a> {
    method: &'a str,
    args: &'a Args,
    kwargs: &'a Kwargs,
    id: Option<CallId>,
}

#[derive(Deserialize)]
struct OwnedWireCall {
    method: String,
    #[serde(default)]
    args: Args,
    #[serde(default)]
    kwargs: Kwargs,
    #[serde(default)]
    id: Option<CallId>,
}

/// An inbound frame that is neither a valid [`Call`] nor a valid [`Outcome`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("invalid call: {0}")]
    InvalidCall(#[source] serde_json::Error),
    #[error("invalid outcome: {0}")]
    InvalidOutcome(#[source] serde_json::Error),
    #[error("call has an empty method name")]
    EmptyMethod,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn null_result_is_still_an_outcome() {
        let msg = decode(br#"{"id":4,"result":null}"#).unwrap();
        assert_eq!(msg, Message::Outcome(Outcome::success(4, Value::Null)));
    }

    #[test]
    fn error_without_result_is_not_an_outcome() {
        // Only the `result` key discriminates; this parses as a call and fails.
        let err = decode(br#"{"id":4,"error":"boom"}"#).unwrap_err();
        assert_matches!(err, DecodeError::InvalidCall(_));
    }

    #[test]
    fn null_error_means_success() {
        let msg = decode(br#"{"id":1,"result":"ok","error":null}"#).unwrap();
        assert_matches!(msg, Message::Outcome(Outcome { error: None, .. }));
    }

    #[test]
    fn call_without_id_is_a_notification() {
        let msg = decode(br#"{"method":"ping"}"#).unwrap();
        let Message::Call(call) = msg else {
            panic!("expected a call");
        };
        assert_eq!(call.kind, CallKind::Notification);
        assert!(call.args.is_empty());
        assert!(call.kwargs.is_empty());

        let msg = decode(br#"{"method":"ping","args":[],"kwargs":{},"id":null}"#).unwrap();
        assert_matches!(
            msg,
            Message::Call(Call {
                kind: CallKind::Notification,
                ..
            })
        );
    }

    #[test]
    fn id_zero_is_tracked() {
        let msg = decode(br#"{"method":"ping","id":0}"#).unwrap();
        assert_matches!(
            msg,
            Message::Call(Call {
                kind: CallKind::Tracked(0),
                ..
            })
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_matches!(decode(b"{not json"), Err(DecodeError::Malformed(_)));
        assert_matches!(decode(b"[1,2]"), Err(DecodeError::NotAnObject));
        assert_matches!(decode(br#"{"args":[]}"#), Err(DecodeError::InvalidCall(_)));
        assert_matches!(decode(br#"{"method":""}"#), Err(DecodeError::EmptyMethod));
        assert_matches!(
            decode(br#"{"id":"x","result":1}"#),
            Err(DecodeError::InvalidOutcome(_))
        );
        assert_matches!(decode(&[0xff, 0xfe]), Err(DecodeError::Malformed(_)));
    }

    #[test]
    fn wire_shapes() {
        let outcome = Outcome::success(7, json!("hi"));
        assert_eq!(outcome.to_json(), r#"{"id":7,"result":"hi","error":null}"#);

        let call = Call::notification("ping", vec![], Kwargs::new());
        assert_eq!(
            call.to_json(),
            r#"{"method":"ping","args":[],"kwargs":{},"id":null}"#
        );
    }

    #[test]
    fn call_survives_the_wire() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("all".into(), json!(true));
        let call = Call::tracked("Containers", vec![json!(1), json!("x")], kwargs, 12);
        let decoded = decode(encode(&call.clone().into()).as_bytes()).unwrap();
        assert_eq!(decoded, Message::Call(call));

        let outcome = Outcome::failure(12, "KeyError");
        let decoded = decode(outcome.to_json().as_bytes()).unwrap();
        assert_eq!(decoded, Message::Outcome(outcome));
    }

    #[test]
    fn null_descriptor_builds_a_success() {
        let outcome = Outcome::failure(5, Value::Null);
        assert!(!outcome.is_error());
        assert_eq!(outcome, Outcome::success(5, Value::Null));
        let decoded = decode(outcome.to_json().as_bytes()).unwrap();
        assert_eq!(decoded, Message::Outcome(outcome));

        let literal = Outcome {
            id: 5,
            result: Value::Null,
            error: Some(Value::Null),
        };
        assert!(!literal.is_error());
        assert!(Outcome::failure(5, "KeyError").is_error());
    }
}
