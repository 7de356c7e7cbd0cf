//! Records exchanged with the coordinator: tasks, task updates and sessions.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;

/// A JSON object, as carried by task arguments and session sub-sections.
pub type JsonMap = Map<String, Value>;

/// A unit of work assigned to this worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    /// Task kind (`command`, `session`, ...).
    pub name: String,
    #[serde(default)]
    pub args: JsonMap,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: JsonMap) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// String view of an argument; numbers are rendered as text.
    pub fn arg_str(&self, key: &str) -> Option<String> {
        match self.args.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Like `arg_str`, but a missing argument is a task error.
    pub fn require_arg(&self, key: &str) -> Result<String, TaskError> {
        self.arg_str(key).ok_or_else(|| TaskError::MissingArgument {
            task_id: self.id.clone(),
            name: key.to_string(),
        })
    }
}

/// Progress payload sent back to the coordinator for one task.
///
/// Arbitrary keys plus the reserved `error` and `done` (1 = terminal).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskUpdate(JsonMap);

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn extend(mut self, values: JsonMap) -> Self {
        self.0.extend(values);
        self
    }

    pub fn error(self, message: impl Into<String>) -> Self {
        self.with("error", message.into())
    }

    pub fn done(self) -> Self {
        self.with("done", 1)
    }

    pub fn is_done(&self) -> bool {
        self.0.get("done").and_then(Value::as_i64) == Some(1)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &JsonMap {
        &self.0
    }
}

/// The two archivable sub-sections of a session's `extra`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionName {
    Raw,
    Otf,
}

impl SectionName {
    pub const ALL: [SectionName; 2] = [SectionName::Raw, SectionName::Otf];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Otf => "otf",
        }
    }
}

impl std::fmt::Display for SectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported on-the-fly processing pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtfWorkflow {
    Scipion,
    Unsupported(String),
}

impl OtfWorkflow {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("scipion") {
            Self::Scipion
        } else {
            Self::Unsupported(raw.to_string())
        }
    }
}

/// One named sub-section of `extra` (`raw` or `otf`).
///
/// Kept as a raw JSON object so keys this worker does not know about survive
/// a read-modify-write cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Section(JsonMap);

impl Section {
    const RETRIEVAL_KEY: &'static str = "irods";

    pub fn from_map(map: JsonMap) -> Self {
        Self(map)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Merge `values` into this section; incoming keys win.
    pub fn merge(&mut self, values: JsonMap) {
        self.0.extend(values);
    }

    /// Local data path, if recorded and non-empty.
    pub fn path(&self) -> Option<&str> {
        self.get_str("path").filter(|p| !p.trim().is_empty())
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.set("path", path.into());
    }

    pub fn status(&self) -> Option<&str> {
        self.get_str("status")
    }

    pub fn otf_workflow(&self) -> Option<OtfWorkflow> {
        self.get_str("otf_workflow").map(OtfWorkflow::parse)
    }

    /// Recorded retrieval commands as `(linux, windows)`, when both are present.
    pub fn retrieval(&self) -> Option<(&str, &str)> {
        let scripts = self.0.get(Self::RETRIEVAL_KEY)?.as_object()?;
        let linux = scripts.get("linux").and_then(Value::as_str)?;
        let windows = scripts.get("windows").and_then(Value::as_str)?;
        if linux.is_empty() || windows.is_empty() {
            return None;
        }
        Some((linux, windows))
    }

    pub fn has_retrieval(&self) -> bool {
        self.retrieval().is_some()
    }

    /// Record both retrieval commands, keeping any other retrieval keys.
    pub fn set_retrieval(&mut self, linux: &str, windows: &str) {
        let entry = self
            .0
            .entry(Self::RETRIEVAL_KEY.to_string())
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if !entry.is_object() {
            *entry = Value::Object(JsonMap::new());
        }
        if let Value::Object(scripts) = entry {
            scripts.insert("linux".to_string(), Value::String(linux.to_string()));
            scripts.insert("windows".to_string(), Value::String(windows.to_string()));
        }
    }

    pub fn as_map(&self) -> &JsonMap {
        &self.0
    }

    pub fn into_map(self) -> JsonMap {
        self.0
    }
}

/// The session's mutable `extra` mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionExtra {
    #[serde(default)]
    pub raw: Section,
    #[serde(default)]
    pub otf: Section,
    #[serde(flatten)]
    pub other: JsonMap,
}

impl SessionExtra {
    pub fn section(&self, name: SectionName) -> &Section {
        match name {
            SectionName::Raw => &self.raw,
            SectionName::Otf => &self.otf,
        }
    }

    pub fn section_mut(&mut self, name: SectionName) -> &mut Section {
        match name {
            SectionName::Raw => &mut self.raw,
            SectionName::Otf => &mut self.otf,
        }
    }
}

/// Instrument parameters recorded for an acquisition session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    /// Directory under which each session's raw data lands (`{raw_path}/{name}`).
    #[serde(default)]
    pub raw_path: Option<String>,
    #[serde(default)]
    pub images_pattern: Option<String>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub voltage: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub cs: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub magnification: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub pixel_size: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub dose: Option<f64>,
    #[serde(flatten)]
    pub other: JsonMap,
}

/// A data-acquisition session owned by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub name: String,
    #[serde(deserialize_with = "de_timestamp")]
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub acquisition: Acquisition,
    #[serde(default)]
    pub extra: SessionExtra,
}

impl SessionRecord {
    /// Raw data directory for this session, `{acquisition.raw_path}/{name}`.
    pub fn raw_data_path(&self) -> Option<String> {
        let base = self.acquisition.raw_path.as_deref()?.trim();
        if base.is_empty() {
            return None;
        }
        Some(
            std::path::Path::new(base)
                .join(&self.name)
                .to_string_lossy()
                .into_owned(),
        )
    }
}

/// Parse the timestamp formats the coordinator emits.
///
/// Naive timestamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let t_separated = raw.replacen(' ', "T", 1);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&t_separated) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&t_separated, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp {raw:?}")))
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("invalid task id {other}"))),
    }
}

fn de_opt_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
