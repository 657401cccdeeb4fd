/// GDB/MI types and data structures
///
/// This module defines the data structures used to represent GDB/MI protocol messages.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered `name=value` pairs, in the order GDB emitted them
pub type Tuple = IndexMap<String, Value>;

/// Represents the different types of GDB output
#[derive(Debug, Clone, PartialEq)]
pub enum GdbOutput {
    Result(GdbResult),
    Async(AsyncRecord),
    Stream(StreamRecord),
    /// The `(gdb)` prompt
    Prompt,
}

/// Represents a GDB/MI result record
#[derive(Debug, Clone, PartialEq)]
pub struct GdbResult {
    pub token: Option<u32>,
    pub class: ResultClass,
    pub results: Tuple,
}

impl GdbResult {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.results.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.results.get(key).and_then(Value::as_string)
    }

    /// The `msg` field carried by `^error` records
    pub fn error_message(&self) -> Option<&str> {
        self.get_str("msg")
    }
}

/// GDB/MI result classes
#[derive(Debug, Clone, PartialEq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
    /// Anything GDB should never send; kept so the correlator can report it
    Other(String),
}

impl ResultClass {
    pub fn parse(s: &str) -> Self {
        match s {
            "done" => ResultClass::Done,
            "running" => ResultClass::Running,
            "connected" => ResultClass::Connected,
            "error" => ResultClass::Error,
            "exit" => ResultClass::Exit,
            other => ResultClass::Other(other.to_string()),
        }
    }
}

/// Which out-of-band channel an async record arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    /// `*` records
    Exec,
    /// `+` records
    Status,
    /// `=` records
    Notify,
}

/// Represents a GDB/MI async record
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncRecord {
    pub token: Option<u32>,
    pub kind: AsyncKind,
    pub class: AsyncClass,
    pub results: Tuple,
}

impl AsyncRecord {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.results.get(key).and_then(Value::as_string)
    }
}

/// GDB/MI async classes the adapter reacts to
///
/// Everything else GDB announces (library loads, trace state variables,
/// parameter changes, ...) is carried through as `Other` with its name.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncClass {
    Running,
    Stopped,
    ThreadGroupExited,
    ThreadCreated,
    ThreadExited,
    /// `+download` progress while loading a remote target
    Download,
    Other(String),
}

impl AsyncClass {
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => AsyncClass::Running,
            "stopped" => AsyncClass::Stopped,
            "thread-group-exited" => AsyncClass::ThreadGroupExited,
            "thread-created" => AsyncClass::ThreadCreated,
            "thread-exited" => AsyncClass::ThreadExited,
            "download" => AsyncClass::Download,
            other => AsyncClass::Other(other.to_string()),
        }
    }
}

/// Represents a GDB/MI stream record
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub stream_type: StreamType,
    pub content: String,
}

impl StreamRecord {
    /// Output category the record is reported under
    pub fn category(&self) -> &'static str {
        match self.stream_type {
            StreamType::Console | StreamType::Target => "stdout",
            StreamType::Log => "log",
        }
    }
}

/// Types of GDB/MI streams
#[derive(Debug, Clone, PartialEq)]
pub enum StreamType {
    Console, // ~ prefix
    Target,  // @ prefix
    Log,     // & prefix
}

/// Represents values in GDB/MI output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    List(Vec<Value>),
    Tuple(Tuple),
}

impl Value {
    /// Get the value as a string, if possible
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a list, if possible
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Get the value as a tuple, if possible
    pub fn as_tuple(&self) -> Option<&Tuple> {
        match self {
            Value::Tuple(tuple) => Some(tuple),
            _ => None,
        }
    }

    /// Look up a field of a tuple value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_tuple().and_then(|t| t.get(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_string)
    }
}

/// `reason` field of a `*stopped` record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BreakpointHit,
    WatchpointTrigger,
    ReadWatchpointTrigger,
    AccessWatchpointTrigger,
    FunctionFinished,
    LocationReached,
    WatchpointScope,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    SolibEvent,
    Fork,
    Vfork,
    SyscallEntry,
    SyscallReturn,
    Exec,
    NoHistory,
}

const STOP_REASONS: &[(&str, StopReason)] = &[
    ("breakpoint-hit", StopReason::BreakpointHit),
    ("watchpoint-trigger", StopReason::WatchpointTrigger),
    ("read-watchpoint-trigger", StopReason::ReadWatchpointTrigger),
    ("access-watchpoint-trigger", StopReason::AccessWatchpointTrigger),
    ("function-finished", StopReason::FunctionFinished),
    ("location-reached", StopReason::LocationReached),
    ("watchpoint-scope", StopReason::WatchpointScope),
    ("end-stepping-range", StopReason::EndSteppingRange),
    ("exited-signalled", StopReason::ExitedSignalled),
    ("exited", StopReason::Exited),
    ("exited-normally", StopReason::ExitedNormally),
    ("signal-received", StopReason::SignalReceived),
    ("solib-event", StopReason::SolibEvent),
    ("fork", StopReason::Fork),
    ("vfork", StopReason::Vfork),
    ("syscall-entry", StopReason::SyscallEntry),
    ("syscall-return", StopReason::SyscallReturn),
    ("exec", StopReason::Exec),
    ("no-history", StopReason::NoHistory),
];

impl StopReason {
    pub fn parse(s: &str) -> Option<Self> {
        STOP_REASONS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, reason)| *reason)
    }

    pub fn as_str(&self) -> &'static str {
        STOP_REASONS
            .iter()
            .find(|(_, reason)| reason == self)
            .map_or("unknown", |(name, _)| *name)
    }

    /// True for the reasons that mean the inferior is gone
    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            StopReason::Exited | StopReason::ExitedNormally | StopReason::ExitedSignalled
        )
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
