//! Reconciliation of freshly decoded play counters against the sync
//! ledger: delta computation, counter-reset handling, scrobble batch
//! construction and timestamp deconfliction.

use serde::{Deserialize, Serialize};

use crate::ipod::{self, TrackDescriptor};
use crate::ledger::{Fingerprint, Ledger, LedgerEntry, LedgerUpdate};

/// One reportable listen: track metadata plus a single timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrobbleEvent {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_ms: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerState {
    pub play_count: u32,
    pub stored_count: u32,
    pub stored_last_played: i64,
    pub last_played: i64,
    pub reset_detected: bool,
    pub has_new_timestamp: bool,
    pub previous_count: u32,
    pub treat_as_already_synced: bool,
}

#[derive(Debug, Default)]
pub struct SyncPlan {
    pub scrobbles: Vec<ScrobbleEvent>,
    pub skipped: Vec<TrackDescriptor>,
    pub ledger_updates: Vec<LedgerUpdate>,
}

pub fn has_reportable_meta(track: &TrackDescriptor) -> bool {
    fn non_empty(value: Option<&str>) -> bool {
        value.is_some_and(|text| !text.trim().is_empty())
    }
    non_empty(track.title.as_deref()) && non_empty(track.artist.as_deref())
}

/// Compares a track's on-device counter against its ledger entry. A count
/// lower than the stored one means the device counter was reset; the reset
/// is accepted (zero baseline) only when the track also carries a newer
/// last-played timestamp, otherwise the track counts as already synced.
pub fn resolve_ledger_state(track: &TrackDescriptor, entry: Option<&LedgerEntry>) -> LedgerState {
    let play_count = track.play_count;
    let stored_count = entry.map_or(0, |entry| entry.count);
    let stored_last_played = entry.map_or(0, |entry| entry.last_played_at.max(0));
    let last_played = track.last_played_at.max(0);
    let reset_detected = play_count < stored_count;
    let has_new_timestamp = last_played > stored_last_played;
    let ignore_ledger = reset_detected && has_new_timestamp;
    LedgerState {
        play_count,
        stored_count,
        stored_last_played,
        last_played,
        reset_detected,
        has_new_timestamp,
        previous_count: if ignore_ledger { 0 } else { stored_count },
        treat_as_already_synced: reset_detected && !has_new_timestamp,
    }
}

pub fn delta_between(play_count: u32, previous_count: u32, allow_repeat: bool) -> u32 {
    if allow_repeat {
        play_count.saturating_sub(previous_count)
    } else if play_count > previous_count {
        1
    } else {
        0
    }
}

fn clamp_to_now(timestamp: i64, now: i64) -> i64 {
    if timestamp <= 0 { now } else { timestamp.min(now) }
}

/// Builds `count` events for one track, the newest at the clamped anchor
/// and earlier ones spaced one track length plus a buffer apart, ascending.
pub fn build_scrobbles(
    track: &TrackDescriptor,
    count: u32,
    anchor: i64,
    now: i64,
) -> Vec<ScrobbleEvent> {
    let safe_anchor = clamp_to_now(anchor, now);
    if count <= 1 {
        return vec![make_event(track, safe_anchor)];
    }
    let spacing = ipod::spacing_seconds(track.duration_ms);
    let mut events = Vec::with_capacity(count as usize);
    for i in (0..i64::from(count)).rev() {
        events.push(make_event(track, safe_anchor - i * spacing));
    }
    events
}

fn make_event(track: &TrackDescriptor, timestamp: i64) -> ScrobbleEvent {
    ScrobbleEvent {
        title: track.title.clone().unwrap_or_default(),
        artist: track.artist.clone().unwrap_or_default(),
        album: track.album.clone(),
        duration_ms: track.duration_ms,
        timestamp,
    }
}

/// Plans one sync pass. Nothing here mutates the ledger; the returned
/// updates are applied by the caller only after the service confirms the
/// submission.
pub fn prepare_scrobbles(
    tracks: &[TrackDescriptor],
    allow_repeat: bool,
    ledger: &Ledger,
    now: i64,
) -> SyncPlan {
    let mut scrobbles = Vec::new();
    let mut skipped = Vec::new();
    let mut ledger_updates = Vec::new();
    let mut with_meta = 0usize;
    let mut delta_total = 0u64;
    let mut resets_seen = 0usize;
    let mut resets_accepted = 0usize;

    for track in tracks {
        if !has_reportable_meta(track) {
            skipped.push(track.clone());
            continue;
        }
        with_meta += 1;

        let fingerprint = Fingerprint::for_track(track);
        let state = resolve_ledger_state(track, ledger.entry(&fingerprint));
        if state.play_count == 0 {
            continue;
        }
        if state.reset_detected {
            resets_seen += 1;
            if state.has_new_timestamp {
                resets_accepted += 1;
            }
        }
        if state.treat_as_already_synced {
            continue;
        }
        let delta = delta_between(state.play_count, state.previous_count, allow_repeat);
        if delta == 0 {
            continue;
        }
        // A track with ledger history anchors at the sync instant; a track
        // seen for the first time anchors at its own last-played time.
        let anchor = if state.previous_count > 0 {
            now
        } else {
            state.last_played
        };
        scrobbles.extend(build_scrobbles(track, delta, anchor, now));
        delta_total += u64::from(delta);
        ledger_updates.push(LedgerUpdate {
            fingerprint,
            entry: LedgerEntry {
                count: state.play_count,
                last_played_at: state.last_played,
                synced_at: now,
            },
        });
    }

    log::debug!(
        "planned pass: {} tracks in, {} with metadata, {} events from {} new plays, \
         {} skipped, {} ledger updates, repeats allowed {}, resets {} ({} accepted)",
        tracks.len(),
        with_meta,
        scrobbles.len(),
        delta_total,
        skipped.len(),
        ledger_updates.len(),
        allow_repeat,
        resets_seen,
        resets_accepted,
    );

    SyncPlan {
        scrobbles: deconflict(scrobbles, now),
        skipped,
        ledger_updates,
    }
}

/// Forces pairwise-distinct timestamps, none in the future, without
/// reordering distinct events.
pub fn deconflict(events: Vec<ScrobbleEvent>, now: i64) -> Vec<ScrobbleEvent> {
    if events.len() <= 1 {
        return events;
    }
    let mut sorted = events;
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let mut previous = now + 1;
    for event in &mut sorted {
        let mut timestamp = clamp_to_now(event.timestamp, now);
        if timestamp >= previous {
            timestamp = previous - 1;
        }
        previous = timestamp;
        event.timestamp = timestamp;
    }
    sorted
}

/// Read-only view of the tracks that would contribute new plays.
pub fn filter_tracks_for_ledger<'a>(
    tracks: &'a [TrackDescriptor],
    ledger: &Ledger,
) -> Vec<&'a TrackDescriptor> {
    let filtered: Vec<&TrackDescriptor> = tracks
        .iter()
        .filter(|track| {
            let state = resolve_ledger_state(track, ledger.entry(&Fingerprint::for_track(track)));
            if state.play_count == 0 || state.treat_as_already_synced {
                return false;
            }
            state.play_count > state.previous_count
        })
        .collect();
    log::debug!(
        "{} of {} tracks carry unsynced plays",
        filtered.len(),
        tracks.len()
    );
    filtered
}

/// Read-only total of plays the ledger already accounts for.
pub fn count_already_synced_plays(tracks: &[TrackDescriptor], ledger: &Ledger) -> u64 {
    tracks
        .iter()
        .map(|track| {
            let state = resolve_ledger_state(track, ledger.entry(&Fingerprint::for_track(track)));
            if state.play_count == 0 {
                0
            } else if state.treat_as_already_synced {
                u64::from(state.play_count)
            } else if state.previous_count == 0 {
                0
            } else {
                u64::from(state.play_count.min(state.previous_count))
            }
        })
        .sum()
}
