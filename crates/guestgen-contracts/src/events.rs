use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const TOKEN_ACQUIRED: &str = "token_acquired";
pub const TOKEN_INVALIDATED: &str = "token_invalidated";
pub const SESSION_OPENED: &str = "session_opened";
pub const GENERATION_STARTED: &str = "generation_started";
pub const ARTIFACT_RESOLVED: &str = "artifact_resolved";
pub const GENERATION_FAILED: &str = "generation_failed";
pub const BATCH_ITEM_SKIPPED: &str = "batch_item_skipped";

/// Builds a payload from `(field, value)` pairs, keeping their order.
pub fn payload<const N: usize>(fields: [(&str, Value); N]) -> EventPayload {
    fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Token and generation lifecycle, one JSON object per line.
///
/// Every row carries `type`, the emitting `client_id` and a millisecond
/// UTC `ts`; payload fields such as `session_id` or `artifact_url` follow
/// and win on key collisions. Cloning shares the file and its write lock,
/// so the oracle and the orchestrator append to one log without
/// interleaving lines.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: Option<PathBuf>,
    client_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, client_id: impl Into<String>) -> Self {
        Self::build(Some(path.into()), client_id.into())
    }

    /// Builds rows without writing them, for runs without `--events`.
    pub fn disabled(client_id: impl Into<String>) -> Self {
        Self::build(None, client_id.into())
    }

    fn build(path: Option<PathBuf>, client_id: String) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path,
                client_id,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn emit(&self, event_type: &str, fields: EventPayload) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("type".to_string(), Value::String(event_type.to_string()));
        row.insert(
            "client_id".to_string(),
            Value::String(self.inner.client_id.clone()),
        );
        row.insert("ts".to_string(), Value::String(now_utc_millis()));
        row.extend(fields);

        let Some(path) = &self.inner.path else {
            return Ok(Value::Object(row));
        };
        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;

        Ok(Value::Object(row))
    }
}

fn now_utc_millis() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
