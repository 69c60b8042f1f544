use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
  Screenshot,
  Request,
  Response,
  Error,
}

impl EventCategory {
  fn label(self) -> &'static str {
    match self {
      EventCategory::Screenshot => "SCREENSHOT",
      EventCategory::Request => "REQUEST",
      EventCategory::Response => "RESPONSE",
      EventCategory::Error => "ERROR",
    }
  }
}

#[derive(Serialize, Debug, Clone)]
pub struct DiagnosticEvent {
  pub timestamp: DateTime<Utc>,
  pub category: EventCategory,
  pub message: String,
  pub details: BTreeMap<String, String>,
}

/// Append-only line log for diagnostic events.
pub struct Logger {
  file: Mutex<std::fs::File>,
}

impl Logger {
  pub fn new(path: &Path) -> anyhow::Result<Self> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Self {
      file: Mutex::new(file),
    })
  }

  pub fn log(&self, event: &DiagnosticEvent) {
    let ts = event.timestamp.to_rfc3339();
    let details = serde_json::to_string(&event.details).unwrap_or_default();
    let line = format!("[{ts}] {}: {} {details}\n", event.category.label(), event.message);
    if let Ok(mut file) = self.file.lock() {
      let _ = file.write_all(line.as_bytes());
    }
  }
}

/// Best-effort diagnostic channel. Nothing in the pipeline depends on a record being seen.
#[derive(Clone)]
pub struct EventLog {
  tx: broadcast::Sender<DiagnosticEvent>,
  file: Option<Arc<Logger>>,
}

impl EventLog {
  pub fn new(file: Option<Arc<Logger>>) -> Self {
    let (tx, _) = broadcast::channel(256);
    Self { tx, file }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
    self.tx.subscribe()
  }

  pub fn record<I, K, V>(&self, category: EventCategory, message: &str, details: I)
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
  {
    let event = DiagnosticEvent {
      timestamp: Utc::now(),
      category,
      message: message.to_string(),
      details: details
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect(),
    };

    match category {
      EventCategory::Error => tracing::warn!(details = ?event.details, "{message}"),
      _ => tracing::debug!(category = category.label(), details = ?event.details, "{message}"),
    }

    if let Some(file) = &self.file {
      file.log(&event);
    }
    // No subscribers is fine.
    let _ = self.tx.send(event);
  }
}

impl Default for EventLog {
  fn default() -> Self {
    Self::new(None)
  }
}
