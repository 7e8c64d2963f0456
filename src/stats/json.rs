//! JSON-lines output: one document per metric record.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::metric::{MetricKind, MetricRecord};
use super::output::{Clock, Output, PeriodicFlusher, RecordBuffer};
use crate::error::OutputError;

#[derive(Debug, Serialize)]
struct JsonRecord<'a> {
    metric: &'a str,
    #[serde(rename = "type")]
    kind: MetricKind,
    value: f64,
    tags: &'a BTreeMap<String, String>,
    time: DateTime<Utc>,
}

struct Shared {
    buffer: RecordBuffer,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    clock: Clock,
}

impl Shared {
    fn new(clock: Clock) -> Self {
        Self {
            buffer: RecordBuffer::default(),
            writer: Mutex::new(None),
            clock,
        }
    }

    fn flush(&self) -> Result<usize, OutputError> {
        let mut records = self.buffer.take();
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return Ok(0);
        };
        let failed = records.iter().enumerate().find_map(|(i, record)| {
            self.write_record(writer.as_mut(), record)
                .err()
                .map(|e| (i, e))
        });
        if let Some((written, e)) = failed {
            self.buffer.requeue(records.split_off(written), "JSON");
            return Err(e);
        }
        writer.flush()?;
        Ok(records.len())
    }

    fn write_record(&self, writer: &mut dyn Write, record: &MetricRecord) -> Result<(), OutputError> {
        let doc = JsonRecord {
            metric: &record.key.name,
            kind: record.kind,
            value: record.value,
            tags: &record.key.tags,
            time: self.clock.wall_time(record.timestamp),
        };
        serde_json::to_writer(&mut *writer, &doc)?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

pub struct JsonOutput {
    path: PathBuf,
    flush_period: Duration,
    shared: Arc<Shared>,
    flusher: Option<PeriodicFlusher>,
}

impl JsonOutput {
    pub fn new(path: PathBuf, flush_period: Duration) -> Self {
        Self {
            path,
            flush_period,
            shared: Arc::new(Shared::new(Clock::now())),
            flusher: None,
        }
    }
}

impl Output for JsonOutput {
    fn description(&self) -> String {
        format!("json ({})", self.path.display())
    }

    fn start(&mut self) -> Result<(), OutputError> {
        let file = File::create(&self.path)?;
        *self.shared.writer.lock() = Some(Box::new(BufWriter::new(file)));

        let shared = self.shared.clone();
        let flusher = PeriodicFlusher::start(self.flush_period, move || match shared.flush() {
            Ok(0) => {}
            Ok(n) => debug!("Flushed {} metric records", n),
            Err(e) => warn!("JSON output flush failed: {}", e),
        })?;
        self.flusher = Some(flusher);
        Ok(())
    }

    fn add_records(&self, records: &[MetricRecord]) {
        self.shared.buffer.extend(records);
    }

    fn stop(&mut self) -> Result<(), OutputError> {
        if let Some(mut flusher) = self.flusher.take() {
            flusher.stop();
        }
        self.shared.flush()?;
        if let Some(mut writer) = self.shared.writer.lock().take() {
            writer.flush()?;
        }
        Ok(())
    }
}
