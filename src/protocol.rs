//! Structured wire protocol spoken with the remote test runner.
//!
//! The test binary reports progress as newline-delimited JSON messages, one
//! per JUnit lifecycle callback. The host answers with small command
//! messages on the same connection.
//!
//! # Inbound Messages
//!
//! ```json
//! {"resultType":2,"description":{"display_name":"testA(com.example.FooTest)","sub_description":[]}}
//! {"resultType":7,"result":{"fStartTime":1405232992842,"fRunTime":6,"fCount":1,"fIgnoreCount":0,"fFailures":[]}}
//! ```
//!
//! `resultType` uses the codes of [`ResultType`]. Descriptions are recursive
//! (suite, class, method). Counters accept either a bare integer or the
//! `{"value": n}` shape some runtimes emit for atomic counters, and are always
//! written back as bare integers.
//!
//! # Outbound Commands
//!
//! ```json
//! {"command":"run","tests":["com.example.FooTest","com.example.BarTest#testA"]}
//! {"command":"terminate"}
//! ```

use serde::{Deserialize, Deserializer, Serialize};

/// Result type for protocol encoding and decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding a wire message.
///
/// All of these are per-message: the offending message is dropped and the
/// stream continues.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The line was not valid JSON or did not match the message shape.
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// The `resultType` discriminant is not one we know.
    #[error("Unknown result type: {0}")]
    UnknownResultType(u8),

    /// A field required by the result type is absent.
    #[error("Result type {result_type:?} requires field `{field}`")]
    MissingField {
        result_type: ResultType,
        field: &'static str,
    },
}

/// Discriminant of a lifecycle message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultType {
    RunStarted = 1,
    Started = 2,
    Finished = 3,
    Failed = 4,
    AssumptionFailed = 5,
    Ignored = 6,
    RunFinished = 7,
}

impl ResultType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ResultType {
    type Error = ProtocolError;

    fn try_from(code: u8) -> ProtocolResult<Self> {
        Ok(match code {
            1 => ResultType::RunStarted,
            2 => ResultType::Started,
            3 => ResultType::Finished,
            4 => ResultType::Failed,
            5 => ResultType::AssumptionFailed,
            6 => ResultType::Ignored,
            7 => ResultType::RunFinished,
            other => return Err(ProtocolError::UnknownResultType(other)),
        })
    }
}

/// Hierarchical identifier of a suite, class or test method.
///
/// Method descriptions use the JUnit display form `method(fully.qualified.Class)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    #[serde(rename = "display_name")]
    pub display_name: String,

    #[serde(rename = "sub_description", default)]
    pub children: Vec<Description>,
}

impl Description {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            children: Vec::new(),
        }
    }

    /// Description of a single test method.
    pub fn test(class_name: &str, method: &str) -> Self {
        Self::new(format!("{}({})", method, class_name))
    }

    pub fn with_child(mut self, child: Description) -> Self {
        self.children.push(child);
        self
    }

    /// The class this description belongs to.
    ///
    /// For `method(Class)` names this is `Class`; otherwise the display name
    /// itself. An empty or `"null"` name falls back to the first child.
    pub fn class_name(&self) -> &str {
        if self.display_name.is_empty() || self.display_name == "null" {
            return self
                .children
                .first()
                .map(|c| c.class_name())
                .unwrap_or("unknown");
        }
        match split_method_name(&self.display_name) {
            Some((_, class)) => class,
            None => &self.display_name,
        }
    }

    /// The method name, if this describes a single test method.
    pub fn method_name(&self) -> Option<&str> {
        split_method_name(&self.display_name).map(|(method, _)| method)
    }
}

fn split_method_name(display: &str) -> Option<(&str, &str)> {
    let open = display.find('(')?;
    let inner = display[open + 1..].strip_suffix(')')?;
    if open == 0 || inner.is_empty() {
        return None;
    }
    Some((&display[..open], inner))
}

/// A test failure: what failed and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub description: Description,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Full exception text including the stack trace.
    #[serde(default)]
    pub trace: String,
}

impl FailureInfo {
    pub fn new(description: Description, message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            description,
            message: Some(message.into()),
            trace: trace.into(),
        }
    }
}

/// Summary the remote runner attaches to a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Epoch milliseconds when the remote run started.
    #[serde(rename = "fStartTime", default)]
    pub start_time: i64,

    /// Remote run time in milliseconds.
    #[serde(rename = "fRunTime", default)]
    pub run_time: u64,

    #[serde(rename = "fCount", default, deserialize_with = "deserialize_counter")]
    pub count: u64,

    #[serde(rename = "fIgnoreCount", default, deserialize_with = "deserialize_counter")]
    pub ignore_count: u64,

    #[serde(rename = "fFailures", default)]
    pub failures: Vec<FailureInfo>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Counter {
    Plain(u64),
    Atomic { value: u64 },
}

fn deserialize_counter<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Counter::deserialize(deserializer)? {
        Counter::Plain(n) => n,
        Counter::Atomic { value } => value,
    })
}

/// The JSON shape of an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "resultType")]
    result_type: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<Description>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<RunSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<FailureInfo>,
}

/// One observable moment in a remote test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    RunStarted(Description),
    Started(Description),
    Finished(Description),
    Failed(FailureInfo),
    AssumptionFailed(FailureInfo),
    Ignored(Description),
    RunFinished(RunSummary),
}

impl LifecycleEvent {
    pub fn result_type(&self) -> ResultType {
        match self {
            LifecycleEvent::RunStarted(_) => ResultType::RunStarted,
            LifecycleEvent::Started(_) => ResultType::Started,
            LifecycleEvent::Finished(_) => ResultType::Finished,
            LifecycleEvent::Failed(_) => ResultType::Failed,
            LifecycleEvent::AssumptionFailed(_) => ResultType::AssumptionFailed,
            LifecycleEvent::Ignored(_) => ResultType::Ignored,
            LifecycleEvent::RunFinished(_) => ResultType::RunFinished,
        }
    }

    /// The description this event refers to, if any.
    pub fn description(&self) -> Option<&Description> {
        match self {
            LifecycleEvent::RunStarted(d)
            | LifecycleEvent::Started(d)
            | LifecycleEvent::Finished(d)
            | LifecycleEvent::Ignored(d) => Some(d),
            LifecycleEvent::Failed(f) | LifecycleEvent::AssumptionFailed(f) => {
                Some(&f.description)
            }
            LifecycleEvent::RunFinished(_) => None,
        }
    }

    /// Decodes one line of the wire protocol.
    pub fn decode(line: &str) -> ProtocolResult<Self> {
        let wire: WireMessage = serde_json::from_str(line.trim())?;
        Self::from_wire(wire)
    }

    /// Encodes the event as a single JSON line (without the trailing newline).
    pub fn encode(&self) -> String {
        let wire = self.to_wire();
        // WireMessage contains only strings, integers and vectors of those.
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

impl LifecycleEvent {
    fn from_wire(wire: WireMessage) -> ProtocolResult<Self> {
        let result_type = ResultType::try_from(wire.result_type)?;
        let description = |d: Option<Description>| {
            d.ok_or(ProtocolError::MissingField {
                result_type,
                field: "description",
            })
        };
        let failure = |f: Option<FailureInfo>| {
            f.ok_or(ProtocolError::MissingField {
                result_type,
                field: "failure",
            })
        };

        Ok(match result_type {
            ResultType::RunStarted => {
                LifecycleEvent::RunStarted(wire.description.unwrap_or_default())
            }
            ResultType::Started => LifecycleEvent::Started(description(wire.description)?),
            ResultType::Finished => LifecycleEvent::Finished(description(wire.description)?),
            ResultType::Failed => LifecycleEvent::Failed(failure(wire.failure)?),
            ResultType::AssumptionFailed => {
                LifecycleEvent::AssumptionFailed(failure(wire.failure)?)
            }
            ResultType::Ignored => LifecycleEvent::Ignored(description(wire.description)?),
            ResultType::RunFinished => {
                LifecycleEvent::RunFinished(wire.result.unwrap_or_default())
            }
        })
    }

    fn to_wire(&self) -> WireMessage {
        let mut wire = WireMessage {
            result_type: self.result_type().code(),
            description: None,
            result: None,
            failure: None,
        };
        match self {
            LifecycleEvent::RunStarted(d)
            | LifecycleEvent::Started(d)
            | LifecycleEvent::Finished(d)
            | LifecycleEvent::Ignored(d) => wire.description = Some(d.clone()),
            LifecycleEvent::Failed(f) | LifecycleEvent::AssumptionFailed(f) => {
                wire.description = Some(f.description.clone());
                wire.failure = Some(f.clone());
            }
            LifecycleEvent::RunFinished(r) => wire.result = Some(r.clone()),
        }
        wire
    }
}

/// A command sent from the host to the remote runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum RemoteCommand {
    /// Run the given classes (`Class`) or methods (`Class#pattern`).
    Run { tests: Vec<String> },
    /// Stop serving and exit the process.
    Terminate,
}

impl RemoteCommand {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
