//! Binary session recording for audit and playback.
//!
//! One file per relay session, append-only. Each entry is a fixed 16-byte
//! header followed by the raw payload:
//!
//! ```text
//! [u16 type][u16 flags][u32 payload length][48-bit timestamp ms]  (big-endian)
//! ```
//!
//! Entry types: 1 = session header (UTF-8 JSON metadata), 2 = data
//! (flag bit 0 = binary payload, bit 1 = originated from the client rather
//! than the device), 3 = trailer (fixed magic payload, always last).
//!
//! Entries are serialized through a single background writer task so there
//! is never more than one in-flight write per file and frames cannot
//! interleave. A write failure permanently disables the recorder for the
//! session; the relay itself keeps forwarding unrecorded.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::util::now_ms;

/// Session header entry: JSON metadata.
pub const ENTRY_HEADER: u16 = 1;
/// Data entry: one forwarded chunk.
pub const ENTRY_DATA: u16 = 2;
/// Trailer entry: fixed magic, closes the file.
pub const ENTRY_TRAILER: u16 = 3;

/// Payload is binary (as opposed to text).
pub const FLAG_BINARY: u16 = 1;
/// Payload originated from the client rather than the device.
pub const FLAG_FROM_CLIENT: u16 = 2;

/// Trailer payload marking a complete recording.
pub const TRAILER_MAGIC: &[u8] = b"AmtRelayTrailer!";

struct RecordFrame {
    entry_type: u16,
    flags: u16,
    payload: Vec<u8>,
}

/// Append-only recorder for a single relay session.
pub struct SessionRecorder {
    tx: Option<mpsc::Sender<RecordFrame>>,
    writer: Option<tokio::task::JoinHandle<()>>,
    /// Cleared by the writer task on the first I/O error.
    alive: Arc<AtomicBool>,
}

impl SessionRecorder {
    /// Create the recording file (and parent directories), write the session
    /// header entry, and spawn the background writer.
    pub async fn open(path: &Path, header: &Value) -> Result<Self, std::io::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let (tx, rx) = mpsc::channel(256);
        let alive = Arc::new(AtomicBool::new(true));
        let writer = tokio::spawn(recorder_writer_task(file, rx, Arc::clone(&alive)));

        let recorder = Self {
            tx: Some(tx),
            writer: Some(writer),
            alive,
        };
        recorder
            .append(ENTRY_HEADER, 0, header.to_string().into_bytes())
            .await;
        Ok(recorder)
    }

    /// Queue one entry for writing. Best-effort: once the writer has failed,
    /// appends become no-ops and the session continues unrecorded.
    pub async fn append(&self, entry_type: u16, flags: u16, payload: Vec<u8>) {
        if !self.alive.load(Ordering::Relaxed) {
            return;
        }
        let Some(tx) = &self.tx else { return };
        let frame = RecordFrame {
            entry_type,
            flags,
            payload,
        };
        if tx.send(frame).await.is_err() {
            self.alive.store(false, Ordering::Relaxed);
        }
    }

    /// Record one forwarded data chunk.
    pub async fn record_data(&self, payload: &[u8], binary: bool, from_client: bool) {
        let mut flags = 0;
        if binary {
            flags |= FLAG_BINARY;
        }
        if from_client {
            flags |= FLAG_FROM_CLIENT;
        }
        self.append(ENTRY_DATA, flags, payload.to_vec()).await;
    }

    /// Whether the background writer is still accepting entries.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Finish the recording: the writer drains queued entries, appends the
    /// trailer, and releases the file. Waits for the writer to exit so the
    /// file is complete when this returns.
    pub async fn close(mut self) {
        drop(self.tx.take());
        if let Some(writer) = self.writer.take() {
            if writer.await.is_err() {
                warn!("Recording writer task panicked");
            }
        }
    }
}

/// Encode one entry: 16-byte header then payload.
fn encode_entry(entry_type: u16, flags: u16, timestamp_ms: u64, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(&entry_type.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    // 48-bit big-endian milliseconds: low six bytes of the u64.
    out.extend_from_slice(&timestamp_ms.to_be_bytes()[2..8]);
    out.extend_from_slice(payload);
    out
}

/// Background task that owns the file handle and performs all writes, one at
/// a time, in queue order. Writes the trailer when the channel closes.
async fn recorder_writer_task(
    mut file: fs::File,
    mut rx: mpsc::Receiver<RecordFrame>,
    alive: Arc<AtomicBool>,
) {
    while let Some(frame) = rx.recv().await {
        let encoded = encode_entry(frame.entry_type, frame.flags, now_ms(), &frame.payload);
        if let Err(e) = file.write_all(&encoded).await {
            error!("Recording write error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
        if let Err(e) = file.flush().await {
            error!("Recording flush error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
    }

    // Channel closed: seal the file with the trailer entry.
    let trailer = encode_entry(ENTRY_TRAILER, 0, now_ms(), TRAILER_MAGIC);
    if let Err(e) = file.write_all(&trailer).await {
        error!("Recording trailer write error: {e}");
        alive.store(false, Ordering::Relaxed);
        return;
    }
    if let Err(e) = file.flush().await {
        error!("Recording trailer flush error: {e}");
        alive.store(false, Ordering::Relaxed);
    }
}

/// A decoded recording entry, for playback and inspection tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEntry {
    pub entry_type: u16,
    pub flags: u16,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

impl RecordedEntry {
    pub fn from_client(&self) -> bool {
        self.flags & FLAG_FROM_CLIENT != 0
    }
}

/// Decode a complete recording file into its entries.
///
/// Fails on a truncated header or payload; a valid file ends with exactly
/// one trailer entry.
pub fn decode_entries(data: &[u8]) -> Result<Vec<RecordedEntry>, String> {
    let mut entries = Vec::new();
    let mut at = 0usize;
    while at < data.len() {
        if data.len() - at < 16 {
            return Err(format!("truncated entry header at offset {at}"));
        }
        let entry_type = u16::from_be_bytes([data[at], data[at + 1]]);
        let flags = u16::from_be_bytes([data[at + 2], data[at + 3]]);
        let len =
            u32::from_be_bytes([data[at + 4], data[at + 5], data[at + 6], data[at + 7]]) as usize;
        let mut ts_bytes = [0u8; 8];
        ts_bytes[2..8].copy_from_slice(&data[at + 8..at + 16]);
        let timestamp_ms = u64::from_be_bytes(ts_bytes);
        at += 16;
        if data.len() - at < len {
            return Err(format!("truncated payload at offset {at}"));
        }
        entries.push(RecordedEntry {
            entry_type,
            flags,
            timestamp_ms,
            payload: data[at..at + len].to_vec(),
        });
        at += len;
    }
    Ok(entries)
}
