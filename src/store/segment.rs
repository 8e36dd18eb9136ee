//! Transaction Log Segments
//!
//! One file per log version of a resource. Sealed segments are history;
//! the highest unsealed version is the active log.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::TxRecord;
use crate::error::{Error, Result};

/// Magic bytes at the start of each segment file
const SEGMENT_MAGIC: &[u8; 8] = b"WGTXLOG1";

/// Segment file format version
const SEGMENT_FORMAT: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Header flag: no more appends
const FLAG_SEALED: u32 = 1;

/// Per-entry overhead: length, compression flag, checksum
const ENTRY_OVERHEAD: u64 = 4 + 1 + 4;

/// Segment file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Log version of this segment
    pub log_version: u64,
    /// Last transaction id committed before this segment started
    pub prev_last_tx: i64,
    /// Whether this segment is sealed (no more writes)
    pub sealed: bool,
}

impl SegmentHeader {
    /// Create header for a new segment
    pub fn new(log_version: u64, prev_last_tx: i64) -> Self {
        Self {
            log_version,
            prev_last_tx,
            sealed: false,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let flags = if self.sealed { FLAG_SEALED } else { 0 };
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(SEGMENT_MAGIC);
        bytes[8..12].copy_from_slice(&SEGMENT_FORMAT.to_le_bytes());
        bytes[12..16].copy_from_slice(&flags.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.log_version.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.prev_last_tx.to_le_bytes());
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Store("Segment header too short".into()));
        }

        if &bytes[0..8] != SEGMENT_MAGIC {
            return Err(Error::Store("Invalid segment magic bytes".into()));
        }

        let format = u32::from_le_bytes(le4(&bytes[8..12]));
        if format != SEGMENT_FORMAT {
            return Err(Error::Store(format!(
                "Unsupported segment format: {}",
                format
            )));
        }

        let flags = u32::from_le_bytes(le4(&bytes[12..16]));
        Ok(Self {
            log_version: u64::from_le_bytes(le8(&bytes[16..24])),
            prev_last_tx: i64::from_le_bytes(le8(&bytes[24..32])),
            sealed: flags & FLAG_SEALED != 0,
        })
    }
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(bytes);
    out
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

/// Location and provenance of one entry, as found by [`Segment::scan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Byte offset of the entry
    pub pos: u64,
    /// Transaction id
    pub tx_id: i64,
    /// Committing master
    pub master_id: i32,
}

/// A single transaction log segment file
pub struct Segment {
    /// Log version
    pub version: u64,
    /// File path
    pub path: PathBuf,
    /// File handle
    file: File,
    /// Current write position
    write_pos: u64,
    /// Segment header
    header: SegmentHeader,
    /// Whether compression is enabled for new entries
    compression: bool,
    /// Whether appends are fsynced
    fsync: bool,
}

impl Segment {
    /// Create a new segment file
    pub fn create(
        path: PathBuf,
        version: u64,
        prev_last_tx: i64,
        compression: bool,
        fsync: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut segment = Self {
            version,
            path,
            file,
            write_pos: HEADER_SIZE as u64,
            header: SegmentHeader::new(version, prev_last_tx),
            compression,
            fsync,
        };

        segment.write_header()?;
        segment.sync()?;

        Ok(segment)
    }

    /// Open an existing segment file
    pub fn open(path: PathBuf, compression: bool, fsync: bool) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes)?;

        let write_pos = file.seek(SeekFrom::End(0))?;

        Ok(Self {
            version: header.log_version,
            path,
            file,
            write_pos,
            header,
            compression,
            fsync,
        })
    }

    /// Write a record to the segment, returning its position
    pub fn append(&mut self, record: &TxRecord) -> Result<u64> {
        if self.header.sealed {
            return Err(Error::Store(format!(
                "Segment {} is sealed",
                self.path.display()
            )));
        }

        let serialized = bincode::serialize(record)?;
        let data = if self.compression {
            lz4_flex::compress_prepend_size(&serialized)
        } else {
            serialized
        };

        // Entry format: [length: u32][compressed: u8][data: bytes][checksum: u32]
        let checksum = crc32fast::hash(&data);
        let mut entry = Vec::with_capacity(data.len() + ENTRY_OVERHEAD as usize);
        entry.extend_from_slice(&(data.len() as u32).to_le_bytes());
        entry.push(self.compression as u8);
        entry.extend_from_slice(&data);
        entry.extend_from_slice(&checksum.to_le_bytes());

        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(&entry)?;
        if self.fsync {
            self.file.sync_data()?;
        }

        let entry_pos = self.write_pos;
        self.write_pos += entry.len() as u64;
        Ok(entry_pos)
    }

    /// Read the record at a position, returning it with the next position
    pub fn read_at(&mut self, pos: u64) -> Result<(TxRecord, u64)> {
        self.file.seek(SeekFrom::Start(pos))?;

        let mut len_bytes = [0u8; 4];
        self.file.read_exact(&mut len_bytes)?;
        let entry_len = u32::from_le_bytes(len_bytes) as u64;

        if pos + ENTRY_OVERHEAD + entry_len > self.write_pos {
            return Err(self.corrupted("entry runs past end of segment"));
        }

        let mut compressed_flag = [0u8; 1];
        self.file.read_exact(&mut compressed_flag)?;
        let is_compressed = compressed_flag[0] != 0;

        let mut data = vec![0u8; entry_len as usize];
        self.file.read_exact(&mut data)?;

        let mut checksum_bytes = [0u8; 4];
        self.file.read_exact(&mut checksum_bytes)?;
        if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(&data) {
            return Err(self.corrupted("checksum mismatch"));
        }

        let serialized = if is_compressed {
            lz4_flex::decompress_size_prepended(&data)
                .map_err(|e| self.corrupted(&format!("decompression failed: {}", e)))?
        } else {
            data
        };

        let record: TxRecord = bincode::deserialize(&serialized)?;
        Ok((record, pos + ENTRY_OVERHEAD + entry_len))
    }

    /// Walk every entry. A torn or corrupt tail is truncated away.
    pub fn scan(&mut self) -> Result<Vec<EntryInfo>> {
        let mut entries = Vec::new();
        let mut pos = HEADER_SIZE as u64;

        while pos < self.write_pos {
            match self.read_at(pos) {
                Ok((record, next)) => {
                    entries.push(EntryInfo {
                        pos,
                        tx_id: record.tx_id,
                        master_id: record.master_id,
                    });
                    pos = next;
                }
                Err(e) => {
                    if self.header.sealed {
                        return Err(e);
                    }
                    tracing::warn!(
                        "Truncating {} at offset {} after unreadable entry: {}",
                        self.path.display(),
                        pos,
                        e
                    );
                    self.file.set_len(pos)?;
                    self.write_pos = pos;
                    self.sync()?;
                    break;
                }
            }
        }

        Ok(entries)
    }

    /// Sync segment to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Seal the segment (no more writes)
    pub fn seal(&mut self) -> Result<()> {
        self.header.sealed = true;
        self.write_header()?;
        self.sync()
    }

    /// Check if segment is sealed
    pub fn is_sealed(&self) -> bool {
        self.header.sealed
    }

    /// Last transaction id before this segment started
    pub fn prev_last_tx(&self) -> i64 {
        self.header.prev_last_tx
    }

    /// Write header to file
    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        Ok(())
    }

    fn corrupted(&self, reason: &str) -> Error {
        Error::StoreCorrupted {
            resource: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Path of a resource's log segment
pub fn segment_path(dir: &Path, resource: &str, version: u64) -> PathBuf {
    dir.join(format!("{}.log.{}", resource, version))
}

/// Parse `<resource>.log.<version>` file names
pub fn parse_segment_name(name: &str) -> Option<(&str, u64)> {
    let (resource, version) = name.rsplit_once(".log.")?;
    if resource.is_empty() {
        return None;
    }
    version.parse().ok().map(|v| (resource, v))
}

/// List a resource's segment versions in ascending order
pub fn list_versions(dir: &Path, resource: &str) -> io::Result<Vec<u64>> {
    let mut versions = Vec::new();

    if !dir.exists() {
        return Ok(versions);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some((res, version)) = name.to_str().and_then(parse_segment_name) {
            if res == resource {
                versions.push(version);
            }
        }
    }

    versions.sort_unstable();
    Ok(versions)
}
