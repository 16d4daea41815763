use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Every event a chat session writes to its log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStarted,
    ConversationCreated,
    ConversationSwitched,
    ConversationDeleted,
    TurnStarted,
    TurnCompleted,
    TurnCancelled,
    TurnFailed,
    TitleGenerated,
    SummaryGenerated,
    SpeechFailed,
    ModelFallback,
    SessionFinished,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::SessionStarted,
        EventKind::ConversationCreated,
        EventKind::ConversationSwitched,
        EventKind::ConversationDeleted,
        EventKind::TurnStarted,
        EventKind::TurnCompleted,
        EventKind::TurnCancelled,
        EventKind::TurnFailed,
        EventKind::TitleGenerated,
        EventKind::SummaryGenerated,
        EventKind::SpeechFailed,
        EventKind::ModelFallback,
        EventKind::SessionFinished,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SessionStarted => "session_started",
            EventKind::ConversationCreated => "conversation_created",
            EventKind::ConversationSwitched => "conversation_switched",
            EventKind::ConversationDeleted => "conversation_deleted",
            EventKind::TurnStarted => "turn_started",
            EventKind::TurnCompleted => "turn_completed",
            EventKind::TurnCancelled => "turn_cancelled",
            EventKind::TurnFailed => "turn_failed",
            EventKind::TitleGenerated => "title_generated",
            EventKind::SummaryGenerated => "summary_generated",
            EventKind::SpeechFailed => "speech_failed",
            EventKind::ModelFallback => "model_fallback",
            EventKind::SessionFinished => "session_finished",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

/// Session ids are derived from the session start time, millisecond
/// resolution: `session-20240131T120000123`.
pub fn session_id_at(started: DateTime<Utc>) -> String {
    format!("session-{}", started.format("%Y%m%dT%H%M%S%3f"))
}

/// Appends one JSON object per line to the session log.
///
/// Lines carry `type`, `session_id` and `ts`; payload keys are merged last.
/// Clones share one lock so lines from title threads never interleave.
#[derive(Debug, Clone)]
pub struct EventWriter {
    path: Arc<PathBuf>,
    session_id: Arc<str>,
    lock: Arc<Mutex<()>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        let session_id: String = session_id.into();
        Self {
            path: Arc::new(path.into()),
            session_id: Arc::from(session_id),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Writer for a session starting now.
    pub fn start(path: impl Into<PathBuf>) -> Self {
        Self::new(path, session_id_at(Utc::now()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// `payload` must be a JSON object or null.
    pub fn emit(&self, kind: EventKind, payload: Value) -> Result<Value> {
        let fields = match payload {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => bail!("{} payload must be an object, got {other}", kind.as_str()),
        };
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.session_id.to_string()),
        );
        event.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        event.extend(fields);
        let event = Value::Object(event);
        let line = serde_json::to_string(&event)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_path())
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(event)
    }
}

/// Reads a session log back. Blank lines are skipped; a malformed line is
/// an error.
pub fn read_events(path: &Path) -> Result<Vec<Value>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: bad event line", path.display(), index + 1))
        })
        .collect()
}
