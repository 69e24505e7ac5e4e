//! On-disk format for the bonus ledger.
//!
//! Layout: a 16-byte header followed by framed records
//! `[len: u32][crc32: u32][bincode(LedgerRecord)]`. The whole file is
//! rewritten on every mutation into a temp file in the same directory and
//! renamed over the old one, so a crash leaves either the old or the new
//! file, never a mix.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

/// Ledger file magic bytes
pub const LEDGER_MAGIC: [u8; 4] = *b"QBNS";

/// Ledger format version
pub const LEDGER_VERSION: u32 = 1;

/// Serialized header size
const HEADER_LEN: usize = 16;

/// Frame prefix: length + checksum
const FRAME_PREFIX_LEN: usize = 8;

/// Ledger file header (16 bytes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub reserved: [u8; 8],
}

impl LedgerHeader {
    pub fn new() -> Self {
        Self {
            magic: LEDGER_MAGIC,
            version: LEDGER_VERSION,
            reserved: [0; 8],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == LEDGER_MAGIC && self.version == LEDGER_VERSION
    }
}

impl Default for LedgerHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// One ledger entry: user id (as u128) and its bonus count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub user: u128,
    pub bonus: u64,
}

/// Result of reading a ledger file.
#[derive(Debug, Default)]
pub struct LoadedLedger {
    /// Records in file order
    pub records: Vec<LedgerRecord>,
    /// Records dropped because of checksum or decode errors
    pub skipped: usize,
}

/// Encode a record into its frame.
fn encode_record(record: &LedgerRecord) -> io::Result<Vec<u8>> {
    let data =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let checksum = hasher.finalize();

    let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

/// Atomically replace the ledger file with the given records.
pub fn write_ledger<'a, I>(path: &Path, records: I) -> io::Result<()>
where
    I: IntoIterator<Item = &'a LedgerRecord>,
{
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let temp = NamedTempFile::new_in(parent)?;
    {
        let mut writer = BufWriter::new(temp.as_file());

        let header = bincode::serialize(&LedgerHeader::new())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.write_all(&header)?;

        for record in records {
            writer.write_all(&encode_record(record)?)?;
        }
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    sync_dir(parent)?;
    Ok(())
}

/// Flush a directory entry so a completed rename survives a crash.
fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(dir)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Read a ledger file.
///
/// A bad header is an error: the caller must not overwrite a file it does
/// not understand. Individual corrupt records are skipped with a warning; a
/// truncated tail ends the read.
pub fn read_ledger(path: &Path) -> io::Result<LoadedLedger> {
    let bytes = fs::read(path)?;

    if bytes.len() < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ledger file shorter than header",
        ));
    }
    let header: LedgerHeader = bincode::deserialize(&bytes[..HEADER_LEN])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if !header.is_valid() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid ledger header",
        ));
    }

    let mut loaded = LoadedLedger::default();
    let mut pos = HEADER_LEN;

    while pos < bytes.len() {
        if bytes.len() - pos < FRAME_PREFIX_LEN {
            warn!("Ledger {:?} has a truncated record at offset {}", path, pos);
            break;
        }
        let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let expected = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]);
        let start = pos + FRAME_PREFIX_LEN;
        if bytes.len() - start < len {
            warn!("Ledger {:?} has a truncated record at offset {}", path, pos);
            break;
        }
        let data = &bytes[start..start + len];
        pos = start + len;

        let mut hasher = Hasher::new();
        hasher.update(data);
        let actual = hasher.finalize();
        if actual != expected {
            warn!(
                "Skipping ledger record at offset {}: checksum mismatch (expected {}, got {})",
                start - FRAME_PREFIX_LEN,
                expected,
                actual
            );
            loaded.skipped += 1;
            continue;
        }

        match bincode::deserialize::<LedgerRecord>(data) {
            Ok(record) => loaded.records.push(record),
            Err(e) => {
                warn!(
                    "Skipping undecodable ledger record at offset {}: {}",
                    start - FRAME_PREFIX_LEN,
                    e
                );
                loaded.skipped += 1;
            }
        }
    }

    Ok(loaded)
}
