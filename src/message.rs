//! The value types carried across mailboxes, channels, and the wire.

use serde::{Deserialize, Serialize};

use crate::coroutine::CoroId;

/// A value produced or consumed by a coroutine step, a mailbox message
/// payload, or an alarm delivered on timeout.
///
/// User bodies are free to stash arbitrary `Any` payloads locally (they
/// never cross a stack switch by value, only by reference/move within the
/// same process), but anything that might cross process boundaries goes
/// through this small closed set so it can always be `bincode`-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// A channel broadcast wrapper: `(channel-name, payload)`.
    Tagged(String, Box<Value>),
    /// A termination value or exception that could not be serialized;
    /// carries the type name as a deliberately lossy fallback so a remote
    /// monitor still gets *a* notification.
    Opaque(String),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn tagged(channel: impl Into<String>, payload: Value) -> Self {
        Value::Tagged(channel.into(), Box::new(payload))
    }
}

/// A message delivered to a coroutine's mailbox.
///
/// `sender` is `None` for messages injected by the runtime itself (channel
/// broadcasts, remote deliveries arriving before the sender is known).
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: Option<CoroId>,
    pub payload: Value,
}

impl Message {
    pub fn new(sender: Option<CoroId>, payload: Value) -> Self {
        Message { sender, payload }
    }
}
