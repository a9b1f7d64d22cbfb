//! Decoders for the two on-device files: the `iTunesDB` track library and
//! the `Play Counts` counter table. All record parsing works on absolute
//! file offsets; records are never assumed to align with read blocks.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use chrono::Local;
use thiserror::Error;

pub const LIBRARY_FILE: &str = "iTunesDB";
pub const COUNTS_FILE: &str = "Play Counts";

/// Seconds between 1904-01-01 and 1970-01-01; the counts file stores
/// timestamps in the older epoch, as zone-less local time.
pub const MAC_TO_UNIX_EPOCH_SECS: i64 = 2_082_844_800;

pub const MIN_TRACK_SECONDS: i64 = 40;
pub const SHORT_TRACK_SECONDS: i64 = 60;
pub const DEFAULT_TRACK_SECONDS: i64 = 180;
pub const SCROBBLE_BUFFER_SECONDS: i64 = 30;

const SCAN_BLOCK_SIZE: usize = 1024 * 1024;
const TRACK_SIGNATURE: [u8; 4] = *b"mhit";

const SUB_RECORD_TITLE: u32 = 1;
const SUB_RECORD_ALBUM: u32 = 3;
const SUB_RECORD_ARTIST: u32 = 4;

const COUNTS_STRIDE_OFFSET: u64 = 8;
const COUNTS_ENTRY_COUNT_OFFSET: u64 = 12;
const COUNTS_FIRST_RECORD_OFFSET: u64 = 96;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed opening {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("read failed at byte {offset} of {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("truncated record at byte {offset} of {}", .path.display())]
    Truncated { path: PathBuf, offset: u64 },
    #[error("malformed record at byte {offset} of {}: {detail}", .path.display())]
    Malformed {
        path: PathBuf,
        offset: u64,
        detail: String,
    },
    #[error("{} lists {counters} counter records but the library holds {tracks} tracks", .path.display())]
    CountMismatch {
        path: PathBuf,
        counters: usize,
        tracks: usize,
    },
}

/// One track from the library file. Play fields stay zeroed until the
/// counter table is merged in by positional index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackDescriptor {
    pub id: Option<u32>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_ms: u32,
    pub play_count: u32,
    pub last_played_at: i64,
    pub play_timestamps: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    NotConnected,
    NoPlays,
    Ready,
}

pub fn probe_device(dir: &Path) -> DeviceState {
    if !dir.exists() {
        return DeviceState::NotConnected;
    }
    if !dir.join(COUNTS_FILE).exists() {
        return DeviceState::NoPlays;
    }
    DeviceState::Ready
}

/// Removes the counter file so the device starts a fresh tally. A file
/// that is already gone counts as success.
pub fn clear_play_counts(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub struct ChunkReader {
    file: File,
    path: PathBuf,
    len: u64,
}

impl ChunkReader {
    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        let open_error = |source| DecodeError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(open_error)?;
        let len = file.metadata().map_err(open_error)?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, offset: u64, source: io::Error) -> DecodeError {
        if source.kind() == io::ErrorKind::UnexpectedEof {
            DecodeError::Truncated {
                path: self.path.clone(),
                offset,
            }
        } else {
            DecodeError::Io {
                path: self.path.clone(),
                offset,
                source,
            }
        }
    }

    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DecodeError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|err| self.io_error(offset, err))?;
        self.file
            .read_exact(buf)
            .map_err(|err| self.io_error(offset, err))?;
        Ok(())
    }

    pub fn read_u32_at(&mut self, offset: u64) -> Result<u32, DecodeError> {
        let mut dword = [0u8; 4];
        self.read_exact_at(offset, &mut dword)?;
        Ok(LittleEndian::read_u32(&dword))
    }

    /// Fills as much of `buf` as the file provides at `offset`; a short
    /// fill means end of file.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, DecodeError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|err| self.io_error(offset, err))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.io_error(offset + filled as u64, err)),
            }
        }
        Ok(filled)
    }
}

pub fn parse_library(path: &Path) -> Result<Vec<TrackDescriptor>, DecodeError> {
    parse_library_with_progress(path, &mut |_| {})
}

/// Scans the library file for track records. `progress` receives the
/// cumulative number of bytes scanned, once per block.
pub fn parse_library_with_progress(
    path: &Path,
    progress: &mut dyn FnMut(u64),
) -> Result<Vec<TrackDescriptor>, DecodeError> {
    let mut reader = ChunkReader::open(path)?;
    scan_track_records(&mut reader, SCAN_BLOCK_SIZE, progress)
}

fn scan_track_records(
    reader: &mut ChunkReader,
    block_size: usize,
    progress: &mut dyn FnMut(u64),
) -> Result<Vec<TrackDescriptor>, DecodeError> {
    let mut tracks = Vec::new();
    let mut block = vec![0u8; block_size];
    let mut base = 0u64;
    loop {
        let filled = reader.read_at(base, &mut block)?;
        if filled == 0 {
            break;
        }
        for index in 0..filled {
            if block[index] != TRACK_SIGNATURE[0] {
                continue;
            }
            let at = base + index as u64;
            if !matches_signature(reader, &block[..filled], index, at)? {
                continue;
            }
            tracks.push(parse_track_record(reader, at + 4)?);
        }
        base += filled as u64;
        progress(base);
        if filled < block_size {
            break;
        }
    }
    log::debug!(
        "decoded {} track records from {}",
        tracks.len(),
        reader.path().display()
    );
    Ok(tracks)
}

fn matches_signature(
    reader: &mut ChunkReader,
    block: &[u8],
    index: usize,
    at: u64,
) -> Result<bool, DecodeError> {
    if index + TRACK_SIGNATURE.len() <= block.len() {
        return Ok(block[index..index + TRACK_SIGNATURE.len()] == TRACK_SIGNATURE);
    }
    // The candidate straddles the block boundary; check it against the file
    // itself rather than the buffer.
    let mut window = [0u8; 4];
    match reader.read_exact_at(at, &mut window) {
        Ok(()) => Ok(window == TRACK_SIGNATURE),
        Err(DecodeError::Truncated { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

// Track record, after the signature: header length, a reserved dword, the
// sub-record count, the track id, 20 bytes we do not need, then the
// duration in milliseconds. Metadata sub-records start at record start +
// header length.
fn parse_track_record(
    reader: &mut ChunkReader,
    after_signature: u64,
) -> Result<TrackDescriptor, DecodeError> {
    let record_start = after_signature - 4;
    let mut track = TrackDescriptor::default();
    let mut cursor = after_signature;

    let header_len = reader.read_u32_at(cursor)?;
    cursor += 8;
    let sub_record_count = reader.read_u32_at(cursor)?;
    cursor += 4;
    track.id = Some(reader.read_u32_at(cursor)?);
    cursor += 24;
    track.duration_ms = reader.read_u32_at(cursor)?;

    let mut sub_record_at = record_start + u64::from(header_len);
    for _ in 0..sub_record_count {
        let advance = parse_sub_record(reader, sub_record_at, &mut track)?;
        sub_record_at += advance;
    }
    Ok(track)
}

// Sub-records self-describe their total size at +8 and their type code at
// +12. Types 1/3/4 carry a string length at +28 and a UTF-16LE payload at
// +40; everything else is skipped via the declared size.
fn parse_sub_record(
    reader: &mut ChunkReader,
    start: u64,
    track: &mut TrackDescriptor,
) -> Result<u64, DecodeError> {
    let total_size = reader.read_u32_at(start + 8)?;
    if total_size == 0 {
        return Err(DecodeError::Malformed {
            path: reader.path().to_path_buf(),
            offset: start + 8,
            detail: "metadata sub-record declares zero size".to_string(),
        });
    }
    let kind = reader.read_u32_at(start + 12)?;
    if matches!(kind, SUB_RECORD_TITLE | SUB_RECORD_ALBUM | SUB_RECORD_ARTIST) {
        let byte_len = reader.read_u32_at(start + 28)?;
        let payload_at = start + 40;
        if payload_at + u64::from(byte_len) > reader.len() {
            return Err(DecodeError::Truncated {
                path: reader.path().to_path_buf(),
                offset: payload_at,
            });
        }
        let mut raw = vec![0u8; byte_len as usize];
        reader.read_exact_at(payload_at, &mut raw)?;
        let value = utf16le_to_string(&raw);
        let slot = match kind {
            SUB_RECORD_TITLE => &mut track.title,
            SUB_RECORD_ALBUM => &mut track.album,
            _ => &mut track.artist,
        };
        *slot = Some(value);
    }
    Ok(u64::from(total_size))
}

fn utf16le_to_string(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Merges the counter table into `tracks` using the decode-time local
/// timezone offset.
pub fn parse_play_counts(path: &Path, tracks: &mut [TrackDescriptor]) -> Result<(), DecodeError> {
    parse_play_counts_with_offset(path, tracks, local_utc_offset())
}

/// The Nth counter record belongs to the Nth library track; that is a
/// format contract, so more counters than tracks is a decode error.
pub fn parse_play_counts_with_offset(
    path: &Path,
    tracks: &mut [TrackDescriptor],
    utc_offset_secs: i64,
) -> Result<(), DecodeError> {
    let mut reader = ChunkReader::open(path)?;
    let stride = reader.read_u32_at(COUNTS_STRIDE_OFFSET)?;
    let entry_count = reader.read_u32_at(COUNTS_ENTRY_COUNT_OFFSET)?;
    if stride < 4 {
        return Err(DecodeError::Malformed {
            path: reader.path().to_path_buf(),
            offset: COUNTS_STRIDE_OFFSET,
            detail: format!("counter stride {stride} cannot hold a play count"),
        });
    }
    let records = entry_count.saturating_sub(1) as usize;
    if records > tracks.len() {
        return Err(DecodeError::CountMismatch {
            path: reader.path().to_path_buf(),
            counters: records,
            tracks: tracks.len(),
        });
    }
    let mut record_at = COUNTS_FIRST_RECORD_OFFSET;
    for track in tracks.iter_mut().take(records) {
        let play_count = reader.read_u32_at(record_at)?;
        if play_count > 0 {
            let raw = reader.read_u32_at(record_at + 4)?;
            let last_played = mac_to_unix(raw, utc_offset_secs);
            track.play_count = play_count;
            track.last_played_at = last_played;
            track.play_timestamps =
                synthesize_play_timestamps(last_played, play_count, track.duration_ms);
        }
        // Trailing padding is legal; always advance by the declared stride.
        record_at += u64::from(stride);
    }
    log::debug!("merged {records} counter records from {}", path.display());
    Ok(())
}

pub fn mac_to_unix(raw: u32, utc_offset_secs: i64) -> i64 {
    i64::from(raw) - MAC_TO_UNIX_EPOCH_SECS - utc_offset_secs
}

fn local_utc_offset() -> i64 {
    i64::from(Local::now().offset().local_minus_utc())
}

pub fn spacing_seconds(duration_ms: u32) -> i64 {
    let effective_ms = if duration_ms > 0 {
        i64::from(duration_ms)
    } else {
        DEFAULT_TRACK_SECONDS * 1000
    };
    let mut seconds = effective_ms / 1000;
    if seconds < MIN_TRACK_SECONDS {
        seconds = SHORT_TRACK_SECONDS;
    }
    seconds + SCROBBLE_BUFFER_SECONDS
}

/// The device keeps one timestamp per track no matter how often it was
/// played; earlier plays are back-dated from it, one track length plus a
/// buffer apart, in ascending order.
pub fn synthesize_play_timestamps(last_played: i64, play_count: u32, duration_ms: u32) -> Vec<i64> {
    let spacing = spacing_seconds(duration_ms);
    let mut timestamps = Vec::with_capacity(play_count as usize);
    for i in (0..i64::from(play_count)).rev() {
        timestamps.push(last_played - i * spacing);
    }
    timestamps
}
