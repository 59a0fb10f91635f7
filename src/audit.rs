use chrono::Utc;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Append-only JSONL audit log.
///
/// Every plugin lifecycle transition and job state change lands here as one
/// flat record: `{"event": "plugin.started", "recorded_at": ..., ...fields}`.
/// Writes are best-effort; an unwritable log never fails the operation that
/// produced the event.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Record an event with action-specific fields. `None` values are skipped
    /// by callers; this only serializes what it is given.
    pub fn record(&self, event: &str, mut fields: Map<String, Value>) {
        fields.insert("event".into(), Value::String(event.to_string()));
        fields.insert(
            "recorded_at".into(),
            Value::String(Utc::now().to_rfc3339()),
        );

        let line = Value::Object(fields).to_string();
        if let Err(error) = self.append_line(&line) {
            tracing::warn!(path = %self.path.display(), %error, "audit append failed");
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// Build a field map, skipping `None` values the way the event contract
/// expects (absent key, never `null`).
#[macro_export]
macro_rules! audit_fields {
    ($($key:literal => $value:expr),* $(,)?) => {{
        let mut fields = serde_json::Map::new();
        $(
            if let Some(value) = $crate::audit::IntoAuditValue::into_audit_value($value) {
                fields.insert($key.to_string(), value);
            }
        )*
        fields
    }};
}

/// Conversion helper behind `audit_fields!`: `Option<T>` drops `None`,
/// everything else is serialized as-is.
pub trait IntoAuditValue {
    fn into_audit_value(self) -> Option<Value>;
}

impl<T: serde::Serialize> IntoAuditValue for Option<T> {
    fn into_audit_value(self) -> Option<Value> {
        self.and_then(|v| serde_json::to_value(v).ok())
    }
}

impl IntoAuditValue for Value {
    fn into_audit_value(self) -> Option<Value> {
        Some(self)
    }
}

impl IntoAuditValue for &str {
    fn into_audit_value(self) -> Option<Value> {
        Some(Value::String(self.to_string()))
    }
}

impl IntoAuditValue for String {
    fn into_audit_value(self) -> Option<Value> {
        Some(Value::String(self))
    }
}

impl IntoAuditValue for bool {
    fn into_audit_value(self) -> Option<Value> {
        Some(Value::Bool(self))
    }
}

impl IntoAuditValue for u64 {
    fn into_audit_value(self) -> Option<Value> {
        Some(Value::Number(self.into()))
    }
}

impl IntoAuditValue for u32 {
    fn into_audit_value(self) -> Option<Value> {
        Some(Value::Number(self.into()))
    }
}

impl IntoAuditValue for usize {
    fn into_audit_value(self) -> Option<Value> {
        Some(Value::Number((self as u64).into()))
    }
}
