//! Append-only audit history.
//!
//! Every entry is framed on disk as `u32 len | json | u32 crc32` after an
//! 8-byte magic header, and chained to its predecessor by a SHA-256 digest
//! so that a rewritten or dropped entry is detected on open. A torn final
//! frame (crash mid-append) is cut off; damage anywhere else is an
//! integrity failure.

use crate::error::{Error, Result};
use crate::model::{HistoryEntry, ItemId};
use bytes::{Buf, BufMut, BytesMut};
use chrono::Utc;
use crc32fast::Hasher;
use parking_lot::RwLock;
use ring::digest;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const MAGIC: &[u8] = b"RHHIST01";
const SEGMENT_NAME: &str = "history-00000000.log";

struct Segment {
    file: File,
    path: PathBuf,
    /// Length of the file up to the end of the last committed frame.
    committed: u64,
}

impl Segment {
    /// Write one frame after the last committed one. Bytes left behind by an
    /// earlier failed write are cut off first, and a failed write is rolled
    /// back so the next append starts from a clean frame boundary.
    fn append(&mut self, frame: &[u8]) -> Result<()> {
        if self.file.metadata()?.len() != self.committed {
            tracing::warn!(
                path = %self.path.display(),
                committed = self.committed,
                "dropping uncommitted history bytes"
            );
            self.file.set_len(self.committed)?;
        }
        let written = self
            .file
            .write_all(frame)
            .and_then(|_| self.file.sync_data());
        if let Err(err) = written {
            if let Err(undo) = self.file.set_len(self.committed) {
                tracing::error!(path = %self.path.display(), %undo, "history rollback failed");
            }
            return Err(err.into());
        }
        self.committed += frame.len() as u64;
        Ok(())
    }
}

#[derive(Default)]
struct Inner {
    entries: Vec<HistoryEntry>,
    by_item: HashMap<ItemId, Vec<usize>>,
    segment: Option<Segment>,
}

impl Inner {
    fn last_digest(&self) -> String {
        self.entries
            .last()
            .map(|e| e.digest.clone())
            .unwrap_or_default()
    }

    fn push(&mut self, entry: HistoryEntry) {
        self.by_item
            .entry(entry.item_id)
            .or_default()
            .push(self.entries.len());
        self.entries.push(entry);
    }
}

pub struct HistoryLog {
    inner: RwLock<Inner>,
}

impl HistoryLog {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Open (or create) the log under `dir` and replay it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(SEGMENT_NAME);

        let mut inner = Inner::default();
        let raw = if path.exists() {
            std::fs::read(&path)?
        } else {
            Vec::new()
        };
        let valid_len = if raw.is_empty() {
            0
        } else {
            let (entries, valid_len) = decode_segment(&raw)?;
            for entry in entries {
                inner.push(entry);
            }
            valid_len
        };
        verify_chain(&inner.entries)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let committed = if raw.is_empty() {
            file.write_all(MAGIC)?;
            file.sync_data()?;
            MAGIC.len() as u64
        } else {
            valid_len
        };
        if (valid_len as usize) < raw.len() {
            tracing::warn!(
                path = %path.display(),
                dropped = raw.len() - valid_len as usize,
                "truncating torn history tail"
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        file = OpenOptions::new().append(true).open(&path)?;

        tracing::debug!(entries = inner.entries.len(), "history log opened");
        inner.segment = Some(Segment {
            file,
            path,
            committed,
        });
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Append an entry. The log assigns its sequence number, timestamp and
    /// digest, and returns the stored entry.
    pub fn append(&self, mut entry: HistoryEntry) -> Result<HistoryEntry> {
        let mut inner = self.inner.write();
        entry.sequence = inner.entries.len() as u64;
        entry.occurred_at = match inner.entries.last() {
            Some(last) if last.occurred_at > Utc::now() => last.occurred_at,
            _ => Utc::now(),
        };
        entry.prev_digest = inner.last_digest();
        entry.digest = entry_digest(&entry)?;

        if let Some(segment) = inner.segment.as_mut() {
            segment.append(&encode_frame(&entry)?)?;
        }
        inner.push(entry.clone());
        Ok(entry)
    }

    /// All entries about `item`, oldest first.
    pub fn entries_for(&self, item: ItemId) -> Vec<HistoryEntry> {
        let inner = self.inner.read();
        let mut out: Vec<HistoryEntry> = inner
            .by_item
            .get(&item)
            .into_iter()
            .flatten()
            .filter_map(|idx| inner.entries.get(*idx))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recompute every digest and check the chain links.
    pub fn verify(&self) -> Result<()> {
        verify_chain(&self.inner.read().entries)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.read().segment.as_ref().map(|s| s.path.clone())
    }
}

fn entry_digest(entry: &HistoryEntry) -> Result<String> {
    let mut unsealed = entry.clone();
    unsealed.digest = String::new();
    let bytes = serde_json::to_vec(&unsealed)?;
    Ok(hex::encode(digest::digest(&digest::SHA256, &bytes)))
}

fn verify_chain(entries: &[HistoryEntry]) -> Result<()> {
    let mut prev = String::new();
    for (idx, entry) in entries.iter().enumerate() {
        if entry.sequence != idx as u64 {
            return Err(Error::Integrity(format!(
                "history entry {} carries sequence {}",
                idx, entry.sequence
            )));
        }
        if entry.prev_digest != prev {
            return Err(Error::Integrity(format!(
                "history entry {} does not follow its predecessor",
                entry.sequence
            )));
        }
        if entry_digest(entry)? != entry.digest {
            return Err(Error::Integrity(format!(
                "history entry {} has been altered",
                entry.sequence
            )));
        }
        prev = entry.digest.clone();
    }
    Ok(())
}

fn encode_frame(entry: &HistoryEntry) -> Result<Vec<u8>> {
    let data = serde_json::to_vec(entry)?;
    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut buf = BytesMut::with_capacity(data.len() + 8);
    buf.put_u32(data.len() as u32 + 4);
    buf.put_slice(&data);
    buf.put_u32(crc);
    Ok(buf.to_vec())
}

/// Decode a whole segment. Returns the entries and the byte length of the
/// valid prefix.
fn decode_segment(raw: &[u8]) -> Result<(Vec<HistoryEntry>, u64)> {
    if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
        return Err(Error::Integrity("history segment has a bad header".into()));
    }
    let mut cursor = &raw[MAGIC.len()..];
    let mut entries = Vec::new();
    let mut valid = MAGIC.len();
    while cursor.has_remaining() {
        if cursor.remaining() < 4 {
            break;
        }
        let len = (&cursor[..4]).get_u32() as usize;
        if len < 4 {
            // zero fill past the last write is a torn tail, anything else is not
            if cursor.iter().all(|b| *b == 0) {
                break;
            }
            return Err(Error::Integrity(format!(
                "history frame at offset {valid} has an impossible length {len}"
            )));
        }
        if cursor.remaining() - 4 < len {
            if holds_whole_frame(&cursor[4..]) {
                return Err(Error::Integrity(format!(
                    "history frame at offset {valid} claims {len} bytes past the end of the log"
                )));
            }
            break;
        }
        cursor.advance(4);
        let (data, crc_bytes) = cursor[..len].split_at(len - 4);
        let crc = (&crc_bytes[..]).get_u32();
        let mut hasher = Hasher::new();
        hasher.update(data);
        let at_end = cursor.remaining() == len;
        if hasher.finalize() != crc {
            if at_end {
                break;
            }
            return Err(Error::Integrity(format!(
                "history frame at offset {valid} fails its checksum"
            )));
        }
        entries.push(serde_json::from_slice(data)?);
        cursor.advance(len);
        valid += 4 + len;
    }
    Ok((entries, valid as u64))
}

/// Whether `body` starts with a complete entry and its checksum. A torn
/// final write never does, so a frame length that overruns the file in
/// front of such bytes is damage rather than a crash.
fn holds_whole_frame(body: &[u8]) -> bool {
    let mut stream = serde_json::Deserializer::from_slice(body).into_iter::<HistoryEntry>();
    match stream.next() {
        Some(Ok(_)) => body.len() >= stream.byte_offset() + 4,
        _ => false,
    }
}
