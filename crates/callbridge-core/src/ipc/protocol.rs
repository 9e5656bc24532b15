//! Wire messages exchanged between the host and the engine.
//!
//! Uses length-prefixed JSON frames over any byte stream.
//! Format: 4-byte length (u32 LE) + serde_json-encoded [`Message`].

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::Value;

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Method name of the inbound call the engine sends to open a sentinel-mode session.
pub const BOOTSTRAP_METHOD: &str = "__bootstrap__";

/// Input variable name used when a goal carries no inputs.
pub const ANONYMOUS_VAR: &str = "_";

/// How the first goal of a session reaches the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapMode {
    /// The engine opens the exchange with a sentinel inbound call; every goal
    /// goes through the dispatch loop.
    #[default]
    Sentinel,
    /// A goal submitted while idle is written by the submitting thread itself.
    Direct,
}

impl fmt::Display for BootstrapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapMode::Sentinel => write!(f, "sentinel"),
            BootstrapMode::Direct => write!(f, "direct"),
        }
    }
}

impl FromStr for BootstrapMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sentinel" => Ok(BootstrapMode::Sentinel),
            "direct" => Ok(BootstrapMode::Direct),
            other => Err(Error::Config(format!(
                "unknown bootstrap mode '{}' (expected 'sentinel' or 'direct')",
                other
            ))),
        }
    }
}

/// A unit of work for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalRequest {
    pub timestamp: u64,
    /// Directive text, without a trailing terminator.
    pub directive: String,
    /// Variable the engine binds to `inputs`; `_` when unused.
    pub input_var: String,
    #[serde(default)]
    pub inputs: Vec<Value>,
    /// Output template, e.g. `[X, Y]`.
    pub output_spec: String,
}

/// The engine's answer to a [`GoalRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalOutcome {
    pub timestamp: u64,
    pub succeeded: bool,
    #[serde(default)]
    pub outputs: Vec<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl GoalOutcome {
    pub fn success(timestamp: u64, outputs: Vec<Value>) -> Self {
        Self {
            timestamp,
            succeeded: true,
            outputs,
            error: None,
        }
    }

    pub fn failure(timestamp: u64) -> Self {
        Self {
            timestamp,
            succeeded: false,
            outputs: Vec::new(),
            error: None,
        }
    }

    pub fn raised(timestamp: u64, error: Value) -> Self {
        Self {
            timestamp,
            succeeded: false,
            outputs: Vec::new(),
            error: Some(error),
        }
    }
}

/// A call the engine makes into the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundCallRequest {
    pub target: Value,
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default)]
    pub echo_arguments: bool,
}

impl InboundCallRequest {
    pub fn new(target: Value, method: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            target,
            method: method.into(),
            arguments,
            echo_arguments: false,
        }
    }

    /// The call an engine sends first in [`BootstrapMode::Sentinel`].
    pub fn bootstrap(session_handle: u32) -> Self {
        Self::new(Value::Handle(session_handle), BOOTSTRAP_METHOD, Vec::new())
    }

    pub fn is_bootstrap(&self, session_handle: u32) -> bool {
        self.method == BOOTSTRAP_METHOD && self.target == Value::Handle(session_handle)
    }
}

/// Failure raised while servicing an inbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Short machine-readable category (`no_such_method`, `invalid_handle`, ...).
    pub kind: String,
    pub message: String,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::InvalidHandle(_) => "invalid_handle",
            Error::Decode(_) => "decode",
            Error::Interrupted => "interrupted",
            Error::Aborted => "aborted",
            Error::PeerFailure(_) => "peer_failure",
            _ => "host_error",
        };
        Fault::new(kind, e.to_string())
    }
}

/// The host's answer to an [`InboundCallRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundCallOutcome {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub exception: Option<Fault>,
    #[serde(default)]
    pub echoed_arguments: Option<Vec<Value>>,
}

impl InboundCallOutcome {
    pub fn returned(result: Option<Value>) -> Self {
        Self {
            result,
            exception: None,
            echoed_arguments: None,
        }
    }

    pub fn faulted(fault: Fault) -> Self {
        Self {
            result: None,
            exception: Some(fault),
            echoed_arguments: None,
        }
    }
}

/// One entry of the bootstrap catalogue: two distinct sample encodings of a
/// wire type, so the peer can learn its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamplePair {
    pub name: String,
    pub first: serde_json::Value,
    pub second: serde_json::Value,
}

/// First message of every session, sent by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Handle of the session's own anchor object (target of the sentinel call).
    pub session_handle: u32,
    pub bootstrap: BootstrapMode,
    pub examples: Vec<ExamplePair>,
}

impl Hello {
    /// Build the hello message with the fixed example catalogue.
    pub fn with_catalogue(session_handle: u32, bootstrap: BootstrapMode) -> Result<Self> {
        Ok(Self {
            session_handle,
            bootstrap,
            examples: catalogue()?,
        })
    }
}

fn example<T: Serialize>(name: &str, first: &T, second: &T) -> Result<ExamplePair> {
    let encode = |v: &T| {
        serde_json::to_value(v)
            .map_err(|e| Error::Serialization(format!("Failed to encode example {}: {}", name, e)))
    };
    Ok(ExamplePair {
        name: name.to_string(),
        first: encode(first)?,
        second: encode(second)?,
    })
}

fn catalogue() -> Result<Vec<ExamplePair>> {
    Ok(vec![
        example("bool", &Value::Bool(true), &Value::Bool(false))?,
        example("int", &Value::Int(1), &Value::Int(2))?,
        example("float", &Value::Float(1.5), &Value::Float(-2.0))?,
        example("string", &Value::from("a"), &Value::from("b"))?,
        example(
            "list",
            &Value::List(vec![]),
            &Value::List(vec![Value::Int(1), Value::Null]),
        )?,
        example("handle", &Value::Handle(0), &Value::Handle(1))?,
        example(
            "type_ref",
            &Value::TypeRef("A".into()),
            &Value::TypeRef("B".into()),
        )?,
        example(
            "static_field",
            &Value::StaticField {
                type_name: "A".into(),
                field: "x".into(),
            },
            &Value::StaticField {
                type_name: "B".into(),
                field: "y".into(),
            },
        )?,
        example(
            "goal_request",
            &GoalRequest {
                timestamp: 1,
                directive: "true".into(),
                input_var: ANONYMOUS_VAR.into(),
                inputs: vec![],
                output_spec: "[]".into(),
            },
            &GoalRequest {
                timestamp: 2,
                directive: "X = Y".into(),
                input_var: "Y".into(),
                inputs: vec![Value::Int(1)],
                output_spec: "[X]".into(),
            },
        )?,
        example(
            "goal_outcome",
            &GoalOutcome::success(1, vec![Value::Int(1)]),
            &GoalOutcome::raised(2, Value::from("oops")),
        )?,
        example(
            "inbound_call_request",
            &InboundCallRequest::new(Value::Handle(1), "m", vec![]),
            &InboundCallRequest {
                target: Value::TypeRef("A".into()),
                method: "n".into(),
                arguments: vec![Value::Int(1)],
                echo_arguments: true,
            },
        )?,
        example(
            "inbound_call_outcome",
            &InboundCallOutcome::returned(Some(Value::Int(1))),
            &InboundCallOutcome::faulted(Fault::new("host_error", "oops")),
        )?,
    ])
}

/// Every value that travels over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Hello(Hello),
    Goal(GoalRequest),
    Outcome(GoalOutcome),
    Call(InboundCallRequest),
    CallResult(InboundCallOutcome),
}

impl Message {
    /// Short name for log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Goal(_) => "goal",
            Message::Outcome(_) => "outcome",
            Message::Call(_) => "call",
            Message::CallResult(_) => "call_result",
        }
    }
}

/// Write a message to a writer using length-prefixed JSON encoding.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let bytes = serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode message: {}", e)))?;

    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Serialization(format!(
            "Message too large: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Transport(format!("Failed to write message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Transport(format!("Failed to write message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Transport(format!("Failed to flush channel: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed JSON encoding.
///
/// A frame that arrives intact but does not decode yields [`Error::Decode`];
/// the stream stays aligned on the next frame. Anything that breaks framing
/// yields [`Error::Transport`].
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::Transport("channel closed".to_string())
        } else {
            Error::Transport(format!("Failed to read message length: {}", e))
        }
    })?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Transport(format!("Message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Transport(format!("Failed to read message body: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Decode(format!("Failed to decode message: {}", e)))
}

/// Write raw bytes as one frame. Used to exercise decode-failure handling.
pub fn write_raw_frame<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Serialization(format!("Frame too large: {} bytes", bytes.len())))?;
    writer
        .write_all(&len.to_le_bytes())
        .and_then(|_| writer.write_all(bytes))
        .and_then(|_| writer.flush())
        .map_err(|e| Error::Transport(format!("Failed to write raw frame: {}", e)))
}
