// src/ingest/sink.rs
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::ingest::types::ChangeEvent;

#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Hand a batch of events downstream. An error means none may be assumed delivered.
    async fn deliver(&self, events: &[ChangeEvent]) -> Result<()>;
}

/// Writes each event as a structured INFO line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl EventSink for LogSink {
    async fn deliver(&self, events: &[ChangeEvent]) -> Result<()> {
        for ev in events {
            tracing::info!(
                target: "sentinel::events",
                event_id = %ev.event_id,
                source = ev.source.as_str(),
                severity = %ev.severity_hint,
                record = %ev.metadata.source_record_id,
                state = ev.geography.state_abbr.as_deref().unwrap_or("-"),
                "new record"
            );
        }
        Ok(())
    }
}

/// Appends one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl EventSink for JsonLinesSink {
    async fn deliver(&self, events: &[ChangeEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for ev in events {
            serde_json::to_writer(&mut buf, ev).context("serializing change event")?;
            buf.push(b'\n');
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        f.write_all(&buf)
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        f.flush().await?;
        Ok(())
    }
}

// --- Test helper ---
pub struct MemorySink {
    pub delivered: std::sync::Mutex<Vec<ChangeEvent>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            delivered: std::sync::Mutex::new(vec![]),
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn failing() -> Self {
        let s = Self::new();
        s.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        s
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.delivered
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventSink for MemorySink {
    async fn deliver(&self, events: &[ChangeEvent]) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("sink rejected {} events", events.len());
        }
        self.delivered
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink poisoned"))?
            .extend_from_slice(events);
        Ok(())
    }
}
