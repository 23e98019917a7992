use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;

use super::RunContext;
use crate::error::{EngineError, Severity};

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    timestamp: u64,
    real_utc_time: String,
    correlation_id: &'a str,
    pid: u32,
    component: &'a str,
    severity: Severity,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack_trace: Option<String>,
}

/// Per-component structured log file (`<component>.log` in the run
/// directory), one JSON record per line.
///
/// Write failures are reported through tracing and swallowed: a logging
/// fault must never take the engine down.
#[derive(Debug)]
pub struct StructuredLogger {
    component: String,
    ctx: Arc<RunContext>,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl StructuredLogger {
    pub fn open(
        run_dir: &std::path::Path,
        component: &str,
        ctx: Arc<RunContext>,
    ) -> Result<Self, EngineError> {
        let path = run_dir.join(format!("{component}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| EngineError::LogWrite {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            component: component.to_string(),
            ctx,
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn log(
        &self,
        severity: Severity,
        message: &str,
        code: Option<&str>,
        fields: Option<serde_json::Value>,
    ) {
        let stack_trace = if severity >= Severity::High {
            Some(std::backtrace::Backtrace::force_capture().to_string())
        } else {
            None
        };
        let record = LogRecord {
            timestamp: self.ctx.engine_now(),
            real_utc_time: Utc::now().to_rfc3339(),
            correlation_id: &self.ctx.correlation_id,
            pid: self.ctx.pid,
            component: &self.component,
            severity,
            message,
            code,
            fields: fields.as_ref(),
            stack_trace,
        };

        match severity {
            Severity::Low | Severity::Medium => {
                tracing::info!(component = %self.component, code, "{message}")
            }
            Severity::High => tracing::warn!(component = %self.component, code, "{message}"),
            Severity::Critical => tracing::error!(component = %self.component, code, "{message}"),
        }

        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("LOG-002: failed to serialize log record: {e}");
                return;
            }
        };
        let mut writer = self.writer.lock().expect("log writer poisoned");
        if let Err(e) = writeln!(writer, "{line}") {
            tracing::warn!("LOG-002: failed to write {}: {e}", self.path.display());
        }
    }

    pub fn info(&self, message: &str) {
        self.log(Severity::Low, message, None, None);
    }

    pub fn info_with(&self, message: &str, fields: serde_json::Value) {
        self.log(Severity::Low, message, None, Some(fields));
    }

    pub fn warn(&self, message: &str, code: Option<&str>) {
        self.log(Severity::Medium, message, code, None);
    }

    /// Record an engine error with its code and mapped severity.
    pub fn engine_error(&self, error: &EngineError) {
        self.log(error.severity(), &error.to_string(), Some(error.code()), None);
    }

    pub fn flush(&self) {
        let mut writer = self.writer.lock().expect("log writer poisoned");
        if let Err(e) = writer.flush() {
            tracing::warn!("LOG-002: failed to flush {}: {e}", self.path.display());
        }
    }
}
