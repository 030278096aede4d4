//! Audit log.
//!
//! One line per record:
//! `<RFC3339 timestamp> - <instance> - <COMMAND>,<key>[,<value>]`.
//! Commands are START, PARAM, INFO, IN, OUT and DEBUG. The file is written
//! through a `tracing-appender` non-blocking worker so that session tasks
//! never wait on disk.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditCommand {
    Start,
    Param,
    Info,
    In,
    Out,
    Debug,
}

impl AuditCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditCommand::Start => "START",
            AuditCommand::Param => "PARAM",
            AuditCommand::Info => "INFO",
            AuditCommand::In => "IN",
            AuditCommand::Out => "OUT",
            AuditCommand::Debug => "DEBUG",
        }
    }
}

struct AuditInner {
    instance: String,
    sink: Mutex<Box<dyn Write + Send>>,
    _guard: Option<WorkerGuard>,
}

/// Cheaply clonable audit log handle.
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<AuditInner>,
}

impl AuditLog {
    /// Append to a daily-rolled file named after `path` (`<path>.<YYYY-MM-DD>`),
    /// creating its directory if needed.
    pub fn open(path: &str, instance: &str) -> Result<Self> {
        let path = Path::new(path);
        let file_name = path
            .file_name()
            .ok_or_else(|| GatewayError::Config(format!("audit log path {:?} has no file name", path)))?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        Ok(Self {
            inner: Arc::new(AuditInner {
                instance: instance.to_string(),
                sink: Mutex::new(Box::new(writer)),
                _guard: Some(guard),
            }),
        })
    }

    /// Write records to an arbitrary sink.
    pub fn from_writer(instance: &str, writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(AuditInner {
                instance: instance.to_string(),
                sink: Mutex::new(Box::new(writer)),
                _guard: None,
            }),
        }
    }

    pub fn instance(&self) -> &str {
        &self.inner.instance
    }

    pub fn record(&self, command: AuditCommand, key: &str, value: Option<&str>) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = match value {
            Some(value) => format!(
                "{} - {} - {},{},{}\n",
                timestamp,
                self.inner.instance,
                command.as_str(),
                key,
                value
            ),
            None => format!(
                "{} - {} - {},{}\n",
                timestamp,
                self.inner.instance,
                command.as_str(),
                key
            ),
        };
        if let Err(e) = self.inner.sink.lock().write_all(line.as_bytes()) {
            warn!("Failed to write audit record: {}", e);
        }
    }

    /// START record followed by every configuration parameter.
    pub fn record_startup(&self, config: &GatewayConfig) {
        self.record(AuditCommand::Start, &config.instance, None);
        self.record(AuditCommand::Param, "BEGIN", None);
        for (name, value) in config.params() {
            self.record(AuditCommand::Param, name, Some(&value));
        }
        self.record(AuditCommand::Param, "END", None);
    }

    pub fn info(&self, key: &str, value: &str) {
        self.record(AuditCommand::Info, key, Some(value));
    }
}
