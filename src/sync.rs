//! Batch and per-track sync passes. Planning never mutates anything; the
//! ledger changes only after a submission is confirmed, and failed events
//! land in the retry queue instead.

use std::time::Duration;

use crate::ipod::TrackDescriptor;
use crate::ledger::{Fingerprint, Ledger, LedgerEntry, LedgerUpdate};
use crate::queue::RetryQueue;
use crate::scrobble::{self, SyncPlan};
use crate::service::ScrobbleSink;

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub allow_repeat: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub submitted: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub ledger_changed: bool,
}

/// Plans one pass and submits it as a single batch. On failure the whole
/// batch goes to the retry queue and the ledger stays untouched.
pub fn sync_batch(
    tracks: &[TrackDescriptor],
    ledger: &mut Ledger,
    queue: &mut RetryQueue,
    sink: &dyn ScrobbleSink,
    options: SyncOptions,
    now: i64,
) -> SyncOutcome {
    let SyncPlan {
        scrobbles,
        skipped,
        ledger_updates,
    } = scrobble::prepare_scrobbles(tracks, options.allow_repeat, ledger, now);
    let mut outcome = SyncOutcome {
        skipped: skipped.len(),
        ..SyncOutcome::default()
    };
    if scrobbles.is_empty() {
        log::info!("nothing new to submit");
        return outcome;
    }
    match sink.submit(&scrobbles, options.timeout) {
        Ok(()) => {
            ledger.apply(&ledger_updates);
            outcome.submitted = scrobbles.len();
            outcome.ledger_changed = !ledger_updates.is_empty();
            log::info!("submitted {} scrobbles", scrobbles.len());
        }
        Err(err) => {
            log::warn!(
                "batch submission failed, queueing {} scrobbles: {err}",
                scrobbles.len()
            );
            queue.push_failed(&scrobbles, now);
            outcome.enqueued = scrobbles.len();
        }
    }
    outcome
}

/// Submits track by track. Each track's ledger update depends only on that
/// track's own submission result.
pub fn sync_individually(
    tracks: &[TrackDescriptor],
    ledger: &mut Ledger,
    queue: &mut RetryQueue,
    sink: &dyn ScrobbleSink,
    options: SyncOptions,
    now: i64,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();
    let mut ledger_updates = Vec::new();
    for track in tracks {
        if !scrobble::has_reportable_meta(track) {
            outcome.skipped += 1;
            continue;
        }
        let fingerprint = Fingerprint::for_track(track);
        let state = scrobble::resolve_ledger_state(track, ledger.entry(&fingerprint));
        // An already-synced track resolves to a zero delta here instead of
        // skipping early.
        let previous = if state.treat_as_already_synced {
            state.play_count
        } else {
            state.previous_count
        };
        let delta = scrobble::delta_between(state.play_count, previous, options.allow_repeat);
        if delta == 0 {
            continue;
        }
        let anchor = if previous > 0 { now } else { state.last_played };
        let events = scrobble::build_scrobbles(track, delta, anchor, now);
        match sink.submit(&events, options.timeout) {
            Ok(()) => {
                ledger_updates.push(LedgerUpdate {
                    fingerprint,
                    entry: LedgerEntry {
                        count: state.play_count,
                        last_played_at: state.last_played,
                        synced_at: now,
                    },
                });
                outcome.submitted += events.len();
            }
            Err(err) => {
                log::warn!(
                    "submission failed for \"{}\", queueing {} scrobbles: {err}",
                    track.title.as_deref().unwrap_or("?"),
                    events.len()
                );
                queue.push_failed(&events, now);
                outcome.enqueued += events.len();
            }
        }
    }
    if !ledger_updates.is_empty() {
        ledger.apply(&ledger_updates);
        outcome.ledger_changed = true;
    }
    log::info!(
        "per-track pass: {} submitted, {} queued, {} skipped",
        outcome.submitted,
        outcome.enqueued,
        outcome.skipped
    );
    outcome
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;
    use crate::scrobble::ScrobbleEvent;
    use crate::service::SubmitError;

    struct ScriptedSink {
        outcomes: RefCell<VecDeque<bool>>,
        batches: RefCell<Vec<Vec<ScrobbleEvent>>>,
    }

    impl ScriptedSink {
        fn new(outcomes: &[bool]) -> Self {
            Self {
                outcomes: RefCell::new(outcomes.iter().copied().collect()),
                batches: RefCell::new(Vec::new()),
            }
        }

        fn batches(&self) -> Vec<Vec<ScrobbleEvent>> {
            self.batches.borrow().clone()
        }
    }

    impl ScrobbleSink for ScriptedSink {
        fn submit(&self, events: &[ScrobbleEvent], _timeout: Duration) -> Result<(), SubmitError> {
            self.batches.borrow_mut().push(events.to_vec());
            if self.outcomes.borrow_mut().pop_front().unwrap_or(true) {
                Ok(())
            } else {
                Err(SubmitError::new("scripted failure"))
            }
        }
    }

    const NOW: i64 = 1_800_000_000;

    fn options() -> SyncOptions {
        SyncOptions {
            allow_repeat: true,
            timeout: Duration::ZERO,
        }
    }

    fn track(title: &str, play_count: u32, last_played_at: i64) -> TrackDescriptor {
        TrackDescriptor {
            id: Some(1),
            title: Some(title.to_string()),
            artist: Some("Artist".to_string()),
            album: None,
            duration_ms: 200_000,
            play_count,
            last_played_at,
            play_timestamps: Vec::new(),
        }
    }

    #[test]
    fn successful_batch_updates_ledger_and_leaves_queue_empty() {
        let tracks = vec![track("A", 2, 1_700_000_000)];
        let mut ledger = Ledger::default();
        let mut queue = RetryQueue::default();
        let sink = ScriptedSink::new(&[true]);

        let outcome = sync_batch(&tracks, &mut ledger, &mut queue, &sink, options(), NOW);

        assert_eq!(outcome.submitted, 2);
        assert_eq!(outcome.enqueued, 0);
        assert!(outcome.ledger_changed);
        assert!(queue.is_empty());
        assert_eq!(ledger.len(), 1);

        // The same device state synced again produces nothing.
        let again = sync_batch(&tracks, &mut ledger, &mut queue, &sink, options(), NOW + 60);
        assert_eq!(again.submitted, 0);
        assert!(!again.ledger_changed);
        assert_eq!(sink.batches().len(), 1);
    }

    #[test]
    fn failed_batch_fills_the_queue_and_spares_the_ledger() {
        let tracks = vec![track("A", 2, 1_700_000_000), track("B", 1, 1_700_000_500)];
        let mut ledger = Ledger::default();
        let mut queue = RetryQueue::default();
        let sink = ScriptedSink::new(&[false]);

        let outcome = sync_batch(&tracks, &mut ledger, &mut queue, &sink, options(), NOW);

        assert_eq!(outcome.submitted, 0);
        assert_eq!(outcome.enqueued, 3);
        assert!(!outcome.ledger_changed);
        assert!(ledger.is_empty());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn empty_plan_never_reaches_the_sink() {
        let mut ledger = Ledger::default();
        let mut queue = RetryQueue::default();
        let sink = ScriptedSink::new(&[]);

        let outcome = sync_batch(&[], &mut ledger, &mut queue, &sink, options(), NOW);

        assert_eq!(outcome, SyncOutcome::default());
        assert!(sink.batches().is_empty());
    }

    #[test]
    fn individual_pass_isolates_failures_per_track() {
        let tracks = vec![track("A", 1, 1_700_000_000), track("B", 2, 1_700_000_500)];
        let mut ledger = Ledger::default();
        let mut queue = RetryQueue::default();
        let sink = ScriptedSink::new(&[true, false]);

        let outcome = sync_individually(&tracks, &mut ledger, &mut queue, &sink, options(), NOW);

        assert_eq!(outcome.submitted, 1);
        assert_eq!(outcome.enqueued, 2);
        assert!(outcome.ledger_changed);
        assert_eq!(ledger.len(), 1);
        assert!(
            ledger
                .entry(&Fingerprint::for_track(&tracks[0]))
                .is_some()
        );
        assert!(
            ledger
                .entry(&Fingerprint::for_track(&tracks[1]))
                .is_none()
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.items()[0].event.title, "B");
    }

    #[test]
    fn individual_pass_reports_synced_tracks_without_submitting() {
        let current = track("A", 3, 900);
        let mut ledger = Ledger::default();
        ledger.apply(&[LedgerUpdate {
            fingerprint: Fingerprint::for_track(&current),
            entry: LedgerEntry {
                count: 50,
                last_played_at: 1_000,
                synced_at: 1_000,
            },
        }]);
        let mut queue = RetryQueue::default();
        let sink = ScriptedSink::new(&[]);

        let outcome =
            sync_individually(&[current], &mut ledger, &mut queue, &sink, options(), NOW);

        assert_eq!(outcome, SyncOutcome::default());
        assert!(sink.batches().is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn individual_pass_skips_tracks_without_metadata() {
        let mut nameless = track("A", 2, 1_700_000_000);
        nameless.artist = None;
        let mut ledger = Ledger::default();
        let mut queue = RetryQueue::default();
        let sink = ScriptedSink::new(&[]);

        let outcome =
            sync_individually(&[nameless], &mut ledger, &mut queue, &sink, options(), NOW);

        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.submitted, 0);
        assert!(sink.batches().is_empty());
        assert!(queue.is_empty());
    }
}
