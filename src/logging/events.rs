use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::RunContext;
use crate::events::DomainEvent;

/// Lines buffered per stream before an automatic flush.
const FLUSH_EVERY: usize = 256;

#[derive(Debug)]
struct StreamWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    pending: usize,
}

/// Append-only JSONL writer, one stream file per event kind under
/// `events/`.
///
/// Each line is the event payload wrapped with the correlation scope and
/// real UTC time. Writes are buffered and flushed at the buffer bound, at
/// tick boundaries, and at shutdown; a crash can at worst truncate the
/// final line, which stays detectable as a JSON parse error at the tail.
#[derive(Debug)]
pub struct DomainEventLogger {
    ctx: Arc<RunContext>,
    events_dir: PathBuf,
    streams: Mutex<HashMap<&'static str, StreamWriter>>,
}

impl DomainEventLogger {
    pub fn new(events_dir: &std::path::Path, ctx: Arc<RunContext>) -> Self {
        Self {
            ctx,
            events_dir: events_dir.to_path_buf(),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Append one event to its stream. Failures are reported through
    /// tracing and swallowed (`LOG-002` is never fatal by itself).
    pub fn emit(&self, event: DomainEvent) {
        let stream = event.stream();
        let mut value = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("LOG-002: failed to serialize {stream} event: {e}");
                return;
            }
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "correlation_id".to_string(),
                serde_json::Value::String(self.ctx.correlation_id.clone()),
            );
            obj.insert("pid".to_string(), serde_json::json!(self.ctx.pid));
            obj.insert(
                "real_utc_time".to_string(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }

        let mut streams = self.streams.lock().expect("event streams poisoned");
        let writer = match self.stream_writer(&mut streams, stream) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!("LOG-002: failed to open {stream}.jsonl: {e}");
                return;
            }
        };
        if let Err(e) = writeln!(writer.writer, "{value}") {
            tracing::warn!("LOG-002: failed to append to {}: {e}", writer.path.display());
            return;
        }
        writer.pending += 1;
        if writer.pending >= FLUSH_EVERY {
            if let Err(e) = writer.writer.flush() {
                tracing::warn!("LOG-002: failed to flush {}: {e}", writer.path.display());
            }
            writer.pending = 0;
        }
    }

    fn stream_writer<'a>(
        &self,
        streams: &'a mut HashMap<&'static str, StreamWriter>,
        stream: &'static str,
    ) -> std::io::Result<&'a mut StreamWriter> {
        if !streams.contains_key(stream) {
            let path = self.events_dir.join(format!("{stream}.jsonl"));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            streams.insert(
                stream,
                StreamWriter {
                    writer: BufWriter::new(file),
                    path,
                    pending: 0,
                },
            );
        }
        Ok(streams.get_mut(stream).expect("stream just inserted"))
    }

    /// Flush every open stream (tick boundary / shutdown).
    pub fn flush_all(&self) {
        let mut streams = self.streams.lock().expect("event streams poisoned");
        for writer in streams.values_mut() {
            if let Err(e) = writer.writer.flush() {
                tracing::warn!("LOG-002: failed to flush {}: {e}", writer.path.display());
            }
            writer.pending = 0;
        }
    }
}
