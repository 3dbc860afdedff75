//! Event journal for proxy failures and retries.
//!
//! Every entry is mirrored to `tracing`, kept in a bounded in-memory ring and,
//! when a file is configured, appended to it as one JSON object per line.

use crate::config::Route;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            route: None,
            message: message.into(),
            context: None,
        }
    }

    #[must_use]
    pub fn for_route(mut self, route: Route) -> Self {
        self.route = Some(route);
        self
    }

    #[must_use]
    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }

    fn emit(&self) {
        let route = self.route.map(Route::label).unwrap_or("-");
        let context = self
            .context
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        match self.level {
            LogLevel::Debug => {
                tracing::debug!(component = %self.component, route, %context, "{}", self.message);
            }
            LogLevel::Info => {
                tracing::info!(component = %self.component, route, %context, "{}", self.message);
            }
            LogLevel::Warn => {
                tracing::warn!(component = %self.component, route, %context, "{}", self.message);
            }
            LogLevel::Error => {
                tracing::error!(component = %self.component, route, %context, "{}", self.message);
            }
        }
    }
}

struct Journal {
    entries: VecDeque<LogEntry>,
    writer: Option<BufWriter<File>>,
}

impl Journal {
    fn record(&mut self, entry: LogEntry) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Journal>>);

impl SharedLogger {
    /// Journal that also appends JSONL to `file_path`.
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();
        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(Self::with_writer(Some(BufWriter::new(file))))
    }

    /// Journal kept only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_writer(None)
    }

    fn with_writer(writer: Option<BufWriter<File>>) -> Self {
        Self(Arc::new(Mutex::new(Journal {
            entries: VecDeque::with_capacity(256),
            writer,
        })))
    }

    pub fn log(&self, entry: LogEntry) {
        entry.emit();
        if let Ok(mut journal) = self.0.lock() {
            journal.record(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    pub fn route_event(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        route: Route,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.log(
            LogEntry::new(level, component, message)
                .for_route(route)
                .with_context(context),
        );
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.0
            .lock()
            .map(|j| j.entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};

    #[test]
    fn test_recent_is_newest_first() {
        let logger = SharedLogger::in_memory();
        logger.info("startup", "first");
        logger.warn("relay", "second");
        logger.route_event(
            LogLevel::Error,
            "relay",
            Route::Code,
            "third",
            serde_json::json!({ "status": 502 }),
        );

        let recent = logger.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "third");
        assert_eq!(recent[0].route, Some(Route::Code));
        assert_eq!(recent[0].context.as_ref().unwrap()["status"], 502);
        assert_eq!(recent[1].message, "second");
        assert_eq!(recent[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_file_journal_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.log");
        let logger = SharedLogger::new(&path).unwrap();
        logger.error("relay", "upstream down");
        logger.info("startup", "ready");

        let lines: Vec<String> = BufReader::new(File::open(&path).unwrap())
            .lines()
            .map(std::result::Result::unwrap)
            .collect();
        assert_eq!(lines.len(), 2);
        let first: LogEntry = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first.level, LogLevel::Error);
        assert_eq!(first.component, "relay");
        assert!(!lines[1].contains("\"route\""));
    }
}
