//! Durable queue of scrobbles whose submission failed. Items survive on
//! disk until a replay gets them through.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::scrobble::ScrobbleEvent;
use crate::service::ScrobbleSink;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub event: ScrobbleEvent,
    pub queued_at: i64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryQueue {
    #[serde(default)]
    items: Vec<RetryQueueItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl RetryQueue {
    pub fn items(&self) -> &[RetryQueueItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push_failed(&mut self, events: &[ScrobbleEvent], now: i64) {
        for event in events {
            self.items.push(RetryQueueItem {
                event: event.clone(),
                queued_at: now,
                attempts: 0,
            });
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Resubmits every item individually. Successes leave the queue;
    /// failures stay with their attempt count bumped. No attempt cap is
    /// enforced here.
    pub fn replay(&mut self, sink: &dyn ScrobbleSink, timeout: Duration) -> ReplaySummary {
        let mut summary = ReplaySummary::default();
        let mut remaining = Vec::new();
        for mut item in std::mem::take(&mut self.items) {
            match sink.submit(std::slice::from_ref(&item.event), timeout) {
                Ok(()) => summary.succeeded += 1,
                Err(err) => {
                    item.attempts += 1;
                    log::warn!(
                        "replay failed for \"{}\" by {} (attempt {}): {err}",
                        item.event.title,
                        item.event.artist,
                        item.attempts,
                    );
                    summary.failed += 1;
                    remaining.push(item);
                }
            }
        }
        self.items = remaining;
        summary
    }
}

pub fn load_queue(path: &Path) -> Result<RetryQueue> {
    if !path.exists() {
        return Ok(RetryQueue::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading retry queue at {}", path.display()))?;
    let queue = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing retry queue at {}", path.display()))?;
    Ok(queue)
}

pub fn save_queue(queue: &RetryQueue, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating queue directory {}", parent.display()))?;
    }
    let serialized =
        serde_json::to_string_pretty(queue).context("Failed serializing retry queue to JSON")?;
    fs::write(path, format!("{serialized}\n"))
        .with_context(|| format!("Failed writing retry queue at {}", path.display()))?;
    Ok(())
}
