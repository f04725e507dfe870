//! Chunk record codec for series files
//!
//! A series file is an append-only sequence of fixed-size chunk records,
//! one series per file. Each record is `CHUNK_LEN_WITH_HEADER` bytes:
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │ HEADER (21 bytes)                     │
//! │   encoding: u8                        │
//! │   first_time: i64                     │
//! │   last_time: i64                      │
//! │   payload_checksum: u32               │
//! ├───────────────────────────────────────┤
//! │ PAYLOAD (1024 bytes, encoded samples) │
//! └───────────────────────────────────────┘
//! ```
//!
//! Crash recovery only relies on the record size and the header-resident
//! time bounds; payloads are opaque to it. The checksum is verified when a
//! full chunk is read, not when descriptors are scanned.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Timestamp;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

/// Payload bytes per chunk
pub const CHUNK_LEN: usize = 1024;

/// Header bytes per chunk: encoding(1) + first_time(8) + last_time(8) + crc(4)
pub const CHUNK_HEADER_LEN: usize = 21;

/// Total on-disk size of one chunk record
pub const CHUNK_LEN_WITH_HEADER: usize = CHUNK_LEN + CHUNK_HEADER_LEN;

/// The only chunk encoding currently defined
const CHUNK_ENCODING_RAW: u8 = 0;

/// One chunk's worth of encoded samples with its time bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    /// Timestamp of the first sample in the chunk
    pub first_time: Timestamp,
    /// Timestamp of the last sample in the chunk
    pub last_time: Timestamp,
    /// Encoded sample payload, exactly `CHUNK_LEN` bytes
    payload: Vec<u8>,
}

impl ChunkData {
    /// Create a chunk with a zeroed payload
    pub fn new(first_time: Timestamp, last_time: Timestamp) -> Self {
        Self {
            first_time,
            last_time,
            payload: vec![0; CHUNK_LEN],
        }
    }

    /// Create a chunk from an encoded payload, padded or truncated to
    /// `CHUNK_LEN`
    pub fn with_payload(first_time: Timestamp, last_time: Timestamp, mut payload: Vec<u8>) -> Self {
        payload.resize(CHUNK_LEN, 0);
        Self {
            first_time,
            last_time,
            payload,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// In-memory descriptor of one chunk
///
/// Descriptors form an ordered sequence by time per series. The chunk
/// itself may or may not be resident; `evicted` marks descriptors whose
/// payload has been dropped from memory.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub first_time: Timestamp,
    pub last_time: Timestamp,
    /// The loaded chunk, if resident
    pub chunk: Option<ChunkData>,
    /// True once the payload has been dropped from memory
    pub evicted: bool,
}

impl ChunkDescriptor {
    /// Descriptor for a persisted chunk whose payload is not resident
    pub fn evicted(first_time: Timestamp, last_time: Timestamp) -> Self {
        Self {
            first_time,
            last_time,
            chunk: None,
            evicted: true,
        }
    }

    /// Descriptor holding a resident chunk
    pub fn resident(chunk: ChunkData) -> Self {
        Self {
            first_time: chunk.first_time,
            last_time: chunk.last_time,
            chunk: Some(chunk),
            evicted: false,
        }
    }
}

/// Write one chunk record
pub fn write_chunk<W: Write>(w: &mut W, chunk: &ChunkData) -> StorageResult<()> {
    let mut header = [0u8; CHUNK_HEADER_LEN];
    header[0] = CHUNK_ENCODING_RAW;
    header[1..9].copy_from_slice(&chunk.first_time.to_le_bytes());
    header[9..17].copy_from_slice(&chunk.last_time.to_le_bytes());
    let checksum = crc32fast::hash(&chunk.payload);
    header[17..21].copy_from_slice(&checksum.to_le_bytes());

    w.write_all(&header)?;
    w.write_all(&chunk.payload)?;
    Ok(())
}

/// Read one full chunk record, verifying the payload checksum
///
/// Returns `Ok(None)` at a clean end of stream.
pub fn read_chunk<R: Read>(r: &mut R) -> StorageResult<Option<ChunkData>> {
    let header = match read_header(r)? {
        Some(header) => header,
        None => return Ok(None),
    };

    let mut payload = vec![0; CHUNK_LEN];
    r.read_exact(&mut payload)?;

    let computed = crc32fast::hash(&payload);
    if computed != header.checksum {
        return Err(StorageError::Corruption(format!(
            "Chunk checksum mismatch: stored={}, computed={}",
            header.checksum, computed
        )));
    }

    Ok(Some(ChunkData {
        first_time: header.first_time,
        last_time: header.last_time,
        payload,
    }))
}

struct ChunkHeader {
    first_time: Timestamp,
    last_time: Timestamp,
    checksum: u32,
}

/// Read and parse one record header; `Ok(None)` at a clean end of stream
///
/// End of stream is only clean on a record boundary; a partial header is
/// an error.
fn read_header<R: Read>(r: &mut R) -> StorageResult<Option<ChunkHeader>> {
    let mut buf = [0u8; CHUNK_HEADER_LEN];
    match r.read_exact(&mut buf[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    r.read_exact(&mut buf[1..]).map_err(|e| {
        StorageError::InvalidSeriesFile(format!("short chunk header: {}", e))
    })?;

    if buf[0] != CHUNK_ENCODING_RAW {
        return Err(StorageError::Corruption(format!(
            "Unknown chunk encoding: {}",
            buf[0]
        )));
    }

    let first_time = i64::from_le_bytes([
        buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
    ]);
    let last_time = i64::from_le_bytes([
        buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15], buf[16],
    ]);
    let checksum = u32::from_le_bytes([buf[17], buf[18], buf[19], buf[20]]);

    Ok(Some(ChunkHeader {
        first_time,
        last_time,
        checksum,
    }))
}

/// Load the chunk descriptors of a series file by scanning record headers
///
/// Payloads are skipped, not loaded; the returned descriptors are marked
/// evicted. Scanning stops at the first record starting at or after
/// `before`, so chunks "from the future" are never loaded. A header that
/// cannot be read (short record, bad encoding byte) is an error; the file
/// is expected to be size-aligned before this is called.
pub fn read_chunk_descs(path: &Path, before: Timestamp) -> StorageResult<Vec<ChunkDescriptor>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut descs = Vec::new();

    while let Some(header) = read_header(&mut reader)? {
        if header.first_time >= before {
            break;
        }
        descs.push(ChunkDescriptor::evicted(header.first_time, header.last_time));
        reader.seek_relative(CHUNK_LEN as i64)?;
    }

    Ok(descs)
}
