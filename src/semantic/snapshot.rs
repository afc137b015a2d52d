//! Binary snapshot format for a tenant index.
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, sorted by id):
//! - id_len: u16 (little-endian)
//! - id: [u8; id_len] (UTF-8)
//! - embedding: [f32; dimensions] (little-endian)
//!
//! Trailer:
//! - body_checksum: u32 (CRC32 of all entry bytes)

use crate::semantic::index::TenantIndex;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

const TRAILER_SIZE: usize = 4;

/// Errors that can occur while encoding or decoding snapshots.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: snapshot uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: snapshot may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, snapshot has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

impl TenantIndex {
    /// Encode the index. Output is byte-identical for equal contents.
    pub fn serialize(&self, model_id: &[u8; 32]) -> Result<Vec<u8>, SnapshotError> {
        let dimensions = u16::try_from(self.dimensions()).map_err(|_| {
            SnapshotError::InvalidFormat(format!("{} dimensions do not fit", self.dimensions()))
        })?;

        let mut entries: Vec<(&str, &[f32])> = self.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let entry_size = |id: &str| 2 + id.len() + self.dimensions() * 4;
        let body_len: usize = entries.iter().map(|(id, _)| entry_size(id)).sum();
        let mut out = Vec::with_capacity(HEADER_SIZE + body_len + TRAILER_SIZE);

        write_header(
            &mut out,
            &Header {
                version: FORMAT_VERSION,
                model_id: *model_id,
                dimensions,
                entry_count: entries.len() as u64,
            },
        );

        for (id, embedding) in entries {
            let id_len = u16::try_from(id.len())
                .map_err(|_| SnapshotError::InvalidFormat(format!("item id too long: {id}")))?;
            out.extend_from_slice(&id_len.to_le_bytes());
            out.extend_from_slice(id.as_bytes());
            for &value in embedding {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }

        let body_checksum = crc32fast::hash(&out[HEADER_SIZE..]);
        out.extend_from_slice(&body_checksum.to_le_bytes());

        Ok(out)
    }

    /// Decode a snapshot produced by [`TenantIndex::serialize`], checking it
    /// was written by the same model at the same dimension.
    pub fn deserialize(
        bytes: &[u8],
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<TenantIndex, SnapshotError> {
        let header = read_header(bytes)?;

        if header.model_id != *expected_model_id {
            return Err(SnapshotError::ModelMismatch);
        }
        let dimensions = header.dimensions as usize;
        if dimensions != expected_dimensions {
            return Err(SnapshotError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(SnapshotError::InvalidFormat("missing trailer".to_string()));
        }
        let body = &bytes[HEADER_SIZE..bytes.len() - TRAILER_SIZE];
        let stored = read_u32(&bytes[bytes.len() - TRAILER_SIZE..]);
        if crc32fast::hash(body) != stored {
            return Err(SnapshotError::ChecksumMismatch);
        }

        let capacity = usize::try_from(header.entry_count).unwrap_or(0).min(body.len());
        let mut index = TenantIndex::with_capacity(dimensions, capacity);
        let mut cursor = Reader { buf: body, pos: 0 };

        for _ in 0..header.entry_count {
            let id_len = u16::from_le_bytes(cursor.take_array()?) as usize;
            let id = std::str::from_utf8(cursor.take(id_len)?)
                .map_err(|_| SnapshotError::InvalidFormat("item id is not UTF-8".to_string()))?
                .to_string();

            let mut embedding = Vec::with_capacity(dimensions);
            for _ in 0..dimensions {
                embedding.push(f32::from_le_bytes(cursor.take_array()?));
            }

            index
                .upsert(id, embedding)
                .map_err(|e| SnapshotError::InvalidFormat(e.to_string()))?;
        }

        if cursor.pos != body.len() {
            return Err(SnapshotError::InvalidFormat(format!(
                "{} trailing bytes after entries",
                body.len() - cursor.pos
            )));
        }

        Ok(index)
    }
}

fn write_header(out: &mut Vec<u8>, header: &Header) {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    out.extend_from_slice(&header_bytes);
}

fn read_header(bytes: &[u8]) -> Result<Header, SnapshotError> {
    if bytes.len() < HEADER_SIZE {
        return Err(SnapshotError::InvalidFormat(format!(
            "snapshot is {} bytes, header needs {HEADER_SIZE}",
            bytes.len()
        )));
    }

    let version = bytes[0];
    if version != FORMAT_VERSION {
        return Err(SnapshotError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = read_u32(&bytes[43..47]);
    if crc32fast::hash(&bytes[0..43]) != stored_checksum {
        return Err(SnapshotError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&bytes[1..33]);

    let mut entry_count = [0u8; 8];
    entry_count.copy_from_slice(&bytes[35..43]);

    Ok(Header {
        version,
        model_id,
        dimensions: u16::from_le_bytes([bytes[33], bytes[34]]),
        entry_count: u64::from_le_bytes(entry_count),
    })
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| SnapshotError::InvalidFormat("unexpected end of snapshot".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], SnapshotError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }
}
