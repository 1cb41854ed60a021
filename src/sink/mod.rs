use crate::buffer::{DrainFn, Item, ItemBatch, ItemKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("stream write failed: {0}")]
    Io(#[from] io::Error),
    #[error("stream encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct StreamLine<'a> {
    hostname: &'a str,
    kind: ItemKind,
    priority: u8,
    created_at: DateTime<Utc>,
    body: serde_json::Value,
}

/// Demonstration publisher: appends every drained item as one JSON line,
/// tagged with the agent hostname. Write failures surface through the drain
/// callback result, so undelivered batches are requeued by the controller.
pub struct FileSink {
    file: Mutex<File>,
    hostname: String,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            file: Mutex::new(file),
            hostname,
        })
    }

    pub fn write_batch(&self, batch: &ItemBatch) -> Result<(), SinkError> {
        let mut file = self.file.lock();
        for item in batch {
            let line = StreamLine {
                hostname: &self.hostname,
                kind: item.kind(),
                priority: item.priority().weight(),
                created_at: item.created_at(),
                body: decode_body(item),
            };
            serde_json::to_writer(&mut *file, &line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(())
    }

    /// Adapts the sink into the controller's drain callback.
    pub fn into_drain_fn(self: Arc<Self>) -> DrainFn {
        Arc::new(move |batch: ItemBatch| {
            self.write_batch(&batch)?;
            Ok(())
        })
    }
}

/// Payloads are opaque bytes; JSON payloads pass through structurally,
/// anything else is logged as a (lossy) string.
fn decode_body(item: &Item) -> serde_json::Value {
    serde_json::from_slice(item.payload()).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(item.payload()).into_owned())
    })
}
