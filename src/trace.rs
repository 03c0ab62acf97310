//! Chrome trace event records.
//!
//! Chrome's Performance panel exports a JSON array of trace events, written
//! one element per line. This module holds the wire types for those records,
//! the classification of the two profiler events we care about (`Profile`
//! and `ProfileChunk`), and the begin/end events we emit in their place.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category carried by both V8 CPU profiler events.
pub const CPU_PROFILER_CATEGORY: &str = "disabled-by-default-v8.cpu_profiler";

/// Category used for every emitted begin/end event.
pub const FUNCTION_CATEGORY: &str = "function";

/// Errors that can occur while decoding a single record.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to read {kind} event: {source}")]
    Json {
        /// Which record was being decoded: `trace`, `Profile` or `ProfileChunk`.
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    fn json(kind: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| DecodeError::Json { kind, source }
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;

// ============================================================================
// Input records
// ============================================================================

/// A single trace event, as found on one line of the input.
///
/// Only what is needed to classify the record is decoded eagerly, and
/// leniently: a record of any other kind must survive decoding so it can be
/// passed through untouched. `pid`, `tid` and `args` are decoded strictly
/// once the record is known to be a profiler event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceEvent {
    /// Event name.
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub name: String,
    /// Comma-separated category list.
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub cat: String,
    /// Phase, a single character such as `B`, `E`, `X` or `P`.
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub ph: String,
    #[serde(default)]
    pub pid: serde_json::Value,
    #[serde(default)]
    pub tid: serde_json::Value,
    /// Event arguments, decoded lazily depending on the event kind.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Any non-string value reads as an empty string.
fn deserialize_lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: serde_json::Value = Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        _ => Ok(String::new()),
    }
}

/// Read a process or thread ID, treating an absent one as zero.
fn decode_id(value: &serde_json::Value, kind: &'static str) -> Result<i64> {
    if value.is_null() {
        return Ok(0);
    }
    i64::deserialize(value).map_err(DecodeError::json(kind))
}

/// Identifies a special event by category, phase and name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialEvent {
    pub cat: &'static str,
    pub ph: &'static str,
    pub name: &'static str,
}

/// Start of a CPU profile for a process.
pub const PROFILE_EVENT: SpecialEvent = SpecialEvent {
    cat: CPU_PROFILER_CATEGORY,
    ph: "P",
    name: "Profile",
};

/// A batch of call-tree nodes and samples for a process.
pub const PROFILE_CHUNK_EVENT: SpecialEvent = SpecialEvent {
    cat: CPU_PROFILER_CATEGORY,
    ph: "P",
    name: "ProfileChunk",
};

/// How a decoded record should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    ProfileStart,
    ProfileChunk,
    Other,
}

impl TraceEvent {
    /// Decode an event from a trimmed line.
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_str(&String::from_utf8_lossy(bytes)).map_err(DecodeError::json("trace"))
    }

    /// Iterate over the individual categories of this event.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.cat.split(',')
    }

    /// Whether `cat` is one of this event's categories.
    pub fn has_category(&self, cat: &str) -> bool {
        self.categories().any(|c| c == cat)
    }

    pub fn is_special(&self, special: SpecialEvent) -> bool {
        self.has_category(special.cat) && self.ph == special.ph && self.name == special.name
    }

    /// Classify this event.
    pub fn kind(&self) -> RecordKind {
        if self.is_special(PROFILE_EVENT) {
            RecordKind::ProfileStart
        } else if self.is_special(PROFILE_CHUNK_EVENT) {
            RecordKind::ProfileChunk
        } else {
            RecordKind::Other
        }
    }

    /// Decode the `pid` and `tid` of a profiler event.
    pub fn ids(&self) -> Result<(i64, i64)> {
        let kind = self.kind_name();
        Ok((decode_id(&self.pid, kind)?, decode_id(&self.tid, kind)?))
    }

    /// Decode the arguments of a `Profile` event.
    pub fn profile_args(&self) -> Result<ProfileArgs> {
        ProfileArgs::deserialize(&self.args).map_err(DecodeError::json("Profile"))
    }

    /// Decode the arguments of a `ProfileChunk` event.
    pub fn profile_chunk_args(&self) -> Result<ProfileChunkArgs> {
        ProfileChunkArgs::deserialize(&self.args).map_err(DecodeError::json("ProfileChunk"))
    }

    fn kind_name(&self) -> &'static str {
        match self.kind() {
            RecordKind::ProfileStart => "Profile",
            RecordKind::ProfileChunk => "ProfileChunk",
            RecordKind::Other => "trace",
        }
    }
}

/// Arguments of a `Profile` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileArgs {
    pub data: ProfileData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileData {
    /// Profile start time in microseconds.
    pub start_time: i64,
}

/// Arguments of a `ProfileChunk` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileChunkArgs {
    pub data: ProfileChunkData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileChunkData {
    /// Call-tree nodes and samples in this chunk.
    #[serde(default)]
    pub cpu_profile: CpuProfileChunk,
    /// Time elapsed before each sample, in microseconds.
    #[serde(default)]
    pub time_deltas: Vec<i64>,
}

/// CPU profile data within a `ProfileChunk`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuProfileChunk {
    /// Nodes first seen in this chunk.
    #[serde(default)]
    pub nodes: Vec<ProfileNode>,
    /// Node ID at the top of the stack for each sample.
    #[serde(default)]
    pub samples: Vec<u64>,
}

/// A node in the profile call tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileNode {
    /// Node ID. Zero is never a real node.
    pub id: u64,
    /// Parent node ID, zero for a root.
    #[serde(default)]
    pub parent: u64,
    #[serde(default)]
    pub call_frame: CallFrame,
}

/// Information about a call frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    /// Code classification, e.g. `JS` or `other`.
    #[serde(default)]
    pub code_type: String,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub line_number: i64,
    #[serde(default)]
    pub column_number: i64,
    /// Script ID - can be string or number.
    #[serde(default = "default_script_id", deserialize_with = "deserialize_script_id")]
    pub script_id: String,
    #[serde(default)]
    pub url: String,
}

impl Default for CallFrame {
    fn default() -> Self {
        Self {
            code_type: String::new(),
            function_name: String::new(),
            line_number: 0,
            column_number: 0,
            script_id: default_script_id(),
            url: String::new(),
        }
    }
}

fn default_script_id() -> String {
    "0".to_string()
}

/// Deserialize script_id which can be either a string or number.
fn deserialize_script_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: serde_json::Value = Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(default_script_id()),
        _ => Err(D::Error::custom("expected string or number for scriptId")),
    }
}

// ============================================================================
// Output events
// ============================================================================

/// A begin or end event in the output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpallEvent {
    /// Frame name, present only on begin events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub cat: String,
    pub ph: String,
    pub ts: i64,
    pub pid: i64,
    pub tid: i64,
}

impl SpallEvent {
    pub fn begin(name: impl Into<String>, pid: i64, tid: i64, ts: i64) -> Self {
        Self {
            name: Some(name.into()),
            cat: FUNCTION_CATEGORY.to_string(),
            ph: "B".to_string(),
            ts,
            pid,
            tid,
        }
    }

    pub fn end(pid: i64, tid: i64, ts: i64) -> Self {
        Self {
            name: None,
            cat: FUNCTION_CATEGORY.to_string(),
            ph: "E".to_string(),
            ts,
            pid,
            tid,
        }
    }

    pub fn is_begin(&self) -> bool {
        self.ph == "B"
    }
}

/// Strip the JSON array framing around a single element line.
///
/// Removes any leading or trailing run of whitespace, `[`, `]` and `,`.
pub fn trim_framing(line: &[u8]) -> &[u8] {
    let is_framing = |b: &u8| b.is_ascii_whitespace() || matches!(*b, b'[' | b']' | b',');
    let start = line.iter().position(|b| !is_framing(b)).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !is_framing(b)).map_or(start, |i| i + 1);
    &line[start..end]
}
