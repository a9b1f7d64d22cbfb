//! Per-track sync history, keyed by a composite metadata fingerprint.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ipod::TrackDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn for_track(track: &TrackDescriptor) -> Self {
        let id = match track.id {
            Some(id) => id.to_string(),
            None => "no-id".to_string(),
        };
        Self(format!(
            "{}::{}::{}::{}::{}",
            id,
            track.title.as_deref().unwrap_or(""),
            track.artist.as_deref().unwrap_or(""),
            track.album.as_deref().unwrap_or(""),
            track.duration_ms,
        ))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub count: u32,
    pub last_played_at: i64,
    pub synced_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    entries: HashMap<Fingerprint, LedgerEntry>,
}

/// One confirmed-sync ledger write, staged by the planner and applied only
/// after the service accepts the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerUpdate {
    pub fingerprint: Fingerprint,
    pub entry: LedgerEntry,
}

impl Ledger {
    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<&LedgerEntry> {
        self.entries.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&mut self, updates: &[LedgerUpdate]) {
        for update in updates {
            self.entries
                .insert(update.fingerprint.clone(), update.entry);
        }
    }
}

pub fn load_ledger(path: &Path) -> Result<Ledger> {
    if !path.exists() {
        return Ok(Ledger::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading ledger at {}", path.display()))?;
    let ledger = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing ledger at {}", path.display()))?;
    Ok(ledger)
}

pub fn save_ledger(ledger: &Ledger, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating ledger directory {}", parent.display()))?;
    }
    let serialized =
        serde_json::to_string_pretty(ledger).context("Failed serializing ledger to JSON")?;
    fs::write(path, format!("{serialized}\n"))
        .with_context(|| format!("Failed writing ledger at {}", path.display()))?;
    Ok(())
}
