//! Message types and serialization

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Positional call arguments carried by every notify and invoke message
pub type Args = Vec<Value>;

/// Opaque identity of a conversation partner, supplied by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identity
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Transaction identifier pairing an invocation with its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(i64);

impl CorrelationId {
    /// Largest magnitude that survives a round trip through an IEEE double
    pub const MAX: i64 = (1 << 53) - 1;

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from a channel
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Sender identity; `None` when the message came from the responder
    pub sender: Option<PeerId>,
    pub args: Args,
}

/// An inbound notification as seen by notify listeners
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub sender: Option<PeerId>,
    pub args: Args,
}

impl From<Inbound> for Notification {
    fn from(inbound: Inbound) -> Self {
        Self {
            sender: inbound.sender,
            args: inbound.args,
        }
    }
}

/// Outcome of an invocation as reported by the peer
///
/// `success` is false when the peer had no handler installed (no values) or
/// when its handler failed (the first value is the failure description).
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub success: bool,
    pub values: Args,
}

impl Reply {
    pub fn ok(values: Args) -> Self {
        Self {
            success: true,
            values,
        }
    }

    pub fn failed(values: Args) -> Self {
        Self {
            success: false,
            values,
        }
    }

    /// Failure description sent by the peer, if any
    pub fn description(&self) -> Option<&str> {
        if self.success {
            return None;
        }
        self.values.first().and_then(Value::as_str)
    }

    /// Convert into the returned values, turning a failure reply into an error
    pub fn into_result(self) -> Result<Args> {
        if self.success {
            Ok(self.values)
        } else {
            let description = self.description().map(str::to_string);
            Err(Error::remote_failure(description))
        }
    }
}

/// Invoke-channel frame: `(correlation id, first, ...rest)`
///
/// Whether `first` is a request argument or a success flag depends only on
/// whether the id is pending in the receiver's correlation table.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeFrame {
    pub id: CorrelationId,
    pub payload: Args,
}

impl InvokeFrame {
    pub fn request(id: CorrelationId, args: Args) -> Self {
        Self { id, payload: args }
    }

    pub fn reply(id: CorrelationId, success: bool, values: Args) -> Self {
        let mut payload = Vec::with_capacity(values.len() + 1);
        payload.push(Value::Bool(success));
        payload.extend(values);
        Self { id, payload }
    }

    pub fn encode(self) -> Args {
        let mut args = Vec::with_capacity(self.payload.len() + 1);
        args.push(Value::from(self.id.value()));
        args.extend(self.payload);
        args
    }

    pub fn decode(mut args: Args) -> Result<Self> {
        if args.is_empty() {
            return Err(Error::protocol(
                "Empty invoke frame",
                Some("correlation id".to_string()),
                None,
            ));
        }
        let head = args.remove(0);
        let id = head.as_i64().ok_or_else(|| {
            Error::protocol(
                "Invoke frame without a correlation id",
                Some("integer".to_string()),
                Some(head.to_string()),
            )
        })?;
        Ok(Self {
            id: CorrelationId::new(id),
            payload: args,
        })
    }

    /// Interpret the payload as a reply
    pub fn into_reply(self) -> Reply {
        let mut values = self.payload.into_iter();
        let success = values.next().map(|v| truthy(&v)).unwrap_or(false);
        Reply {
            success,
            values: values.collect(),
        }
    }
}

// Non-boolean success slots follow the usual truthiness of dynamic values.
fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// Which of the endpoint's two channels a frame travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Notify,
    Invoke,
}

/// Envelope used by byte-oriented transports
///
/// Arguments are carried as a JSON body because dynamic values need a
/// self-describing format; the envelope itself is bincode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WireFrame {
    /// An initiator announcing itself to the responder
    Hello { peer: PeerId },
    /// An initiator leaving the bus
    Goodbye { peer: PeerId },
    Data {
        endpoint: String,
        channel: ChannelKind,
        source: Option<PeerId>,
        body: Vec<u8>,
    },
}

impl WireFrame {
    pub fn data(
        endpoint: &str,
        channel: ChannelKind,
        source: Option<PeerId>,
        args: &Args,
    ) -> Result<Self> {
        Ok(Self::Data {
            endpoint: endpoint.to_string(),
            channel,
            source,
            body: serde_json::to_vec(args)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Decode the JSON body of a data frame
    pub fn decode_body(body: &[u8]) -> Result<Args> {
        Ok(serde_json::from_slice(body)?)
    }
}
