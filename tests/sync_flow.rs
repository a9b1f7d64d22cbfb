//! Full pass over synthetic device files: decode, reconcile, submit,
//! persist, and come back for a second run.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clickwheel::ipod::{
    COUNTS_FILE, LIBRARY_FILE, MAC_TO_UNIX_EPOCH_SECS, TrackDescriptor, parse_library,
    parse_play_counts_with_offset,
};
use clickwheel::ledger::{Ledger, load_ledger, save_ledger};
use clickwheel::queue::{RetryQueue, load_queue, save_queue};
use clickwheel::scrobble::ScrobbleEvent;
use clickwheel::service::{ScrobbleSink, SubmitError};
use clickwheel::sync::{SyncOptions, sync_batch};

const NOW: i64 = 1_800_000_000;

struct RecordingSink {
    outcomes: RefCell<VecDeque<bool>>,
    batches: RefCell<Vec<Vec<ScrobbleEvent>>>,
}

impl RecordingSink {
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

impl ScrobbleSink for RecordingSink {
    fn submit(&self, events: &[ScrobbleEvent], _timeout: Duration) -> Result<(), SubmitError> {
        self.batches.borrow_mut().push(events.to_vec());
        if self.outcomes.borrow_mut().pop_front().unwrap_or(true) {
            Ok(())
        } else {
            Err(SubmitError::new("scripted failure"))
        }
    }
}

fn put_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_le_bytes());
}

fn string_sub_record(kind: u32, text: &str) -> Vec<u8> {
    let payload: Vec<u8> = text
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"mhod");
    put_u32(&mut bytes, 24);
    put_u32(&mut bytes, 40 + payload.len() as u32);
    put_u32(&mut bytes, kind);
    put_u32(&mut bytes, 0);
    put_u32(&mut bytes, 0);
    put_u32(&mut bytes, 1);
    put_u32(&mut bytes, payload.len() as u32);
    put_u32(&mut bytes, 0);
    put_u32(&mut bytes, 0);
    bytes.extend_from_slice(&payload);
    bytes
}

fn track_record(id: u32, duration_ms: u32, sub_records: &[Vec<u8>]) -> Vec<u8> {
    const HEADER_LEN: u32 = 0x9C;
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"mhit");
    put_u32(&mut bytes, HEADER_LEN);
    put_u32(&mut bytes, 0);
    put_u32(&mut bytes, sub_records.len() as u32);
    put_u32(&mut bytes, id);
    bytes.extend_from_slice(&[0u8; 20]);
    put_u32(&mut bytes, duration_ms);
    bytes.resize(HEADER_LEN as usize, 0);
    for sub in sub_records {
        bytes.extend_from_slice(sub);
    }
    bytes
}

fn counts_file(entries: &[(u32, u32)]) -> Vec<u8> {
    const STRIDE: u32 = 16;
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"mhdp");
    put_u32(&mut bytes, 96);
    put_u32(&mut bytes, STRIDE);
    put_u32(&mut bytes, entries.len() as u32 + 1);
    bytes.extend_from_slice(&[0u8; 80]);
    for (count, raw_time) in entries {
        let mut record = vec![0u8; STRIDE as usize];
        record[..4].copy_from_slice(&count.to_le_bytes());
        record[4..8].copy_from_slice(&raw_time.to_le_bytes());
        bytes.extend_from_slice(&record);
    }
    bytes
}

fn raw_time(unix: i64) -> u32 {
    u32::try_from(unix + MAC_TO_UNIX_EPOCH_SECS).expect("fits the on-disk field")
}

/// Two reportable tracks with plays and one without usable metadata.
fn write_device(dir: &Path) -> (PathBuf, PathBuf) {
    let mut library = Vec::new();
    library.extend_from_slice(&track_record(
        1,
        200_000,
        &[
            string_sub_record(1, "Heroes"),
            string_sub_record(4, "David"),
            string_sub_record(3, "Low"),
        ],
    ));
    library.extend_from_slice(&track_record(
        2,
        95_000,
        &[string_sub_record(1, "Ashes"), string_sub_record(4, "David")],
    ));
    library.extend_from_slice(&track_record(3, 60_000, &[]));
    let counts = counts_file(&[
        (2, raw_time(1_700_000_000)),
        (1, raw_time(1_700_050_000)),
        (5, raw_time(1_700_060_000)),
    ]);

    let library_path = dir.join(LIBRARY_FILE);
    let counts_path = dir.join(COUNTS_FILE);
    std::fs::write(&library_path, library).expect("write library");
    std::fs::write(&counts_path, counts).expect("write counts");
    (library_path, counts_path)
}

fn decode(library: &Path, counts: &Path) -> Vec<TrackDescriptor> {
    let mut tracks = parse_library(library).expect("decode library");
    // Fixed zero offset keeps the expected timestamps machine-independent.
    parse_play_counts_with_offset(counts, &mut tracks, 0).expect("merge counters");
    tracks
}

fn options() -> SyncOptions {
    SyncOptions {
        allow_repeat: true,
        timeout: Duration::from_secs(30),
    }
}

#[test]
fn full_pass_submits_new_plays_then_goes_quiet() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (library_path, counts_path) = write_device(dir.path());
    let ledger_path = dir.path().join("ledger.json");

    let tracks = decode(&library_path, &counts_path);
    assert_eq!(tracks.len(), 3);
    assert_eq!(tracks[0].play_timestamps.len(), 2);

    let mut ledger = load_ledger(&ledger_path).expect("load ledger");
    let mut queue = RetryQueue::default();
    let sink = RecordingSink::new(&[true]);

    let outcome = sync_batch(&tracks, &mut ledger, &mut queue, &sink, options(), NOW);

    // Two plays of "Heroes", one of "Ashes"; the third track has no
    // metadata and is skipped despite its five plays.
    assert_eq!(outcome.submitted, 3);
    assert_eq!(outcome.skipped, 1);
    assert!(outcome.ledger_changed);
    assert!(queue.is_empty());

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    let timestamps: Vec<i64> = batches[0].iter().map(|event| event.timestamp).collect();
    assert_eq!(
        timestamps,
        vec![1_700_050_000, 1_700_000_000, 1_700_000_000 - 230]
    );
    assert!(batches[0].iter().all(|event| event.timestamp <= NOW));
    assert_eq!(batches[0][0].title, "Ashes");
    assert_eq!(batches[0][1].album.as_deref(), Some("Low"));

    save_ledger(&ledger, &ledger_path).expect("save ledger");

    // Same device state, fresh process: nothing left to report.
    let tracks = decode(&library_path, &counts_path);
    let mut ledger = load_ledger(&ledger_path).expect("reload ledger");
    let again = sync_batch(&tracks, &mut ledger, &mut queue, &sink, options(), NOW + 3_600);

    assert_eq!(again.submitted, 0);
    assert!(!again.ledger_changed);
    assert_eq!(sink.batches().len(), 1);
}

#[test]
fn failed_batch_waits_in_the_queue_until_replay_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (library_path, counts_path) = write_device(dir.path());
    let queue_path = dir.path().join("retry-queue.json");

    let tracks = decode(&library_path, &counts_path);
    let mut ledger = Ledger::default();
    let mut queue = RetryQueue::default();
    let failing = RecordingSink::new(&[false]);

    let outcome = sync_batch(&tracks, &mut ledger, &mut queue, &failing, options(), NOW);

    assert_eq!(outcome.submitted, 0);
    assert_eq!(outcome.enqueued, 3);
    assert!(ledger.is_empty());
    save_queue(&queue, &queue_path).expect("save queue");

    // Later, with the service back up, the replay drains the queue one
    // event at a time.
    let mut queue = load_queue(&queue_path).expect("reload queue");
    assert_eq!(queue.len(), 3);
    let working = RecordingSink::new(&[true, true, true]);
    let summary = queue.replay(&working, Duration::from_secs(30));

    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);
    assert!(queue.is_empty());
    assert!(working.batches().iter().all(|batch| batch.len() == 1));
    assert!(ledger.is_empty());
}

#[test]
fn single_submission_mode_caps_each_track_at_one_event() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (library_path, counts_path) = write_device(dir.path());

    let tracks = decode(&library_path, &counts_path);
    let mut ledger = Ledger::default();
    let mut queue = RetryQueue::default();
    let sink = RecordingSink::new(&[true]);
    let single = SyncOptions {
        allow_repeat: false,
        timeout: Duration::from_secs(30),
    };

    let outcome = sync_batch(&tracks, &mut ledger, &mut queue, &sink, single, NOW);

    // One event per reportable track, however many plays the counter held.
    assert_eq!(outcome.submitted, 2);
    let batches = sink.batches();
    assert_eq!(batches[0].len(), 2);
}
