//! Chunked transfer: split a binary payload into checksummed frames, decode them, reassemble.
//!
//! Frame layout (big-endian), 16-byte header followed by the payload:
//!
//! ```text
//! ┌─────────────┬────────────┬─────────────┬──────────────┬──────────────┬──────────┬─────────────┐
//! │ contentHash │ chunkIndex │ totalChunks │ payloadLength│ payloadCrc32 │ reserved │ payload     │
//! │ u32         │ u16        │ u16         │ u16          │ u32          │ u16      │ ≤ 496 bytes │
//! └─────────────┴────────────┴─────────────┴──────────────┴──────────────┴──────────┴─────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::hash::crc32;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Largest payload carried by one chunk.
pub const MAX_CHUNK_PAYLOAD: usize = 496;

/// Largest frame the engine ever produces.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_CHUNK_PAYLOAD;

/// Upper bound on chunks per content; larger payloads are rejected up front.
pub const MAX_TOTAL_CHUNKS: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub content_hash: u32,
    pub chunk_index: u16,
    pub total_chunks: u16,
    pub payload_length: u16,
    pub payload_checksum: u32,
    pub reserved: u16,
}

impl ChunkHeader {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.content_hash.to_be_bytes());
        out.extend_from_slice(&self.chunk_index.to_be_bytes());
        out.extend_from_slice(&self.total_chunks.to_be_bytes());
        out.extend_from_slice(&self.payload_length.to_be_bytes());
        out.extend_from_slice(&self.payload_checksum.to_be_bytes());
        out.extend_from_slice(&self.reserved.to_be_bytes());
    }

    /// Parse the fixed header from the front of `bytes`. Structural checks only.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let u16_at = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        let u32_at = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Some(Self {
            content_hash: u32_at(0),
            chunk_index: u16_at(4),
            total_chunks: u16_at(6),
            payload_length: u16_at(8),
            payload_checksum: u32_at(10),
            reserved: u16_at(14),
        })
    }
}

/// One framed, checksummed fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub payload: Vec<u8>,
}

impl Chunk {
    /// Serialize header + payload into one transport frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        self.header.write_to(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    /// True iff the payload still matches the checksum recorded in the header.
    pub fn verify_checksum(&self) -> bool {
        self.payload.len() == self.header.payload_length as usize
            && crc32(&self.payload) == self.header.payload_checksum
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("payload of {len} bytes needs {chunks} chunks (max {MAX_TOTAL_CHUNKS})")]
    Oversize { len: usize, chunks: usize },
    #[error("frame budget leaves no room for payload")]
    EmptyFrameBudget,
}

/// Payload bytes per chunk for a given maximum frame size.
pub fn payload_budget(max_frame: usize) -> usize {
    max_frame.saturating_sub(HEADER_LEN).min(MAX_CHUNK_PAYLOAD)
}

/// Split `payload` into chunks of at most `chunk_payload` bytes. An empty payload yields a
/// single empty chunk. Fails before producing anything if the chunk count would exceed
/// [`MAX_TOTAL_CHUNKS`].
pub fn encode_chunks(
    content_hash: u32,
    payload: &[u8],
    chunk_payload: usize,
) -> Result<Vec<Chunk>, ChunkError> {
    let size = chunk_payload.min(MAX_CHUNK_PAYLOAD);
    if size == 0 {
        return Err(ChunkError::EmptyFrameBudget);
    }
    let total = payload.len().div_ceil(size).max(1);
    if total > MAX_TOTAL_CHUNKS {
        return Err(ChunkError::Oversize {
            len: payload.len(),
            chunks: total,
        });
    }
    let mut out = Vec::with_capacity(total);
    for index in 0..total {
        let start = index * size;
        let end = (start + size).min(payload.len());
        let body = payload[start..end].to_vec();
        out.push(Chunk {
            header: ChunkHeader {
                content_hash,
                chunk_index: index as u16,
                total_chunks: total as u16,
                payload_length: body.len() as u16,
                payload_checksum: crc32(&body),
                reserved: 0,
            },
            payload: body,
        });
    }
    Ok(out)
}

/// Decode one frame. Returns None on any structural violation; the checksum is checked
/// separately with [`Chunk::verify_checksum`].
pub fn decode_chunk(frame: &[u8]) -> Option<Chunk> {
    let header = ChunkHeader::parse(frame)?;
    if header.total_chunks == 0
        || header.chunk_index >= header.total_chunks
        || header.total_chunks as usize > MAX_TOTAL_CHUNKS
        || header.payload_length as usize > MAX_CHUNK_PAYLOAD
    {
        return None;
    }
    let end = HEADER_LEN + header.payload_length as usize;
    if frame.len() < end {
        return None;
    }
    Some(Chunk {
        header,
        payload: frame[HEADER_LEN..end].to_vec(),
    })
}

/// Concatenate a complete, ordered chunk list. None if any chunk is missing, out of order,
/// from another content, or fails its checksum.
pub fn reassemble(chunks: &[Chunk]) -> Option<Vec<u8>> {
    let first = chunks.first()?;
    let total = first.header.total_chunks as usize;
    if chunks.len() != total {
        return None;
    }
    let mut out = Vec::new();
    for (i, c) in chunks.iter().enumerate() {
        if c.header.chunk_index as usize != i
            || c.header.content_hash != first.header.content_hash
            || !c.verify_checksum()
        {
            return None;
        }
        out.extend_from_slice(&c.payload);
    }
    Some(out)
}

/// Immutable chunk list for one piece of content, as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSet {
    pub content_hash: u32,
    pub chunk_payload: usize,
    pub chunks: Vec<Chunk>,
}

impl ChunkSet {
    pub fn encode(content_hash: u32, payload: &[u8], chunk_payload: usize) -> Result<Self, ChunkError> {
        let chunks = encode_chunks(content_hash, payload, chunk_payload)?;
        Ok(Self {
            content_hash,
            chunk_payload: chunk_payload.min(MAX_CHUNK_PAYLOAD),
            chunks,
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Original payload bytes.
    pub fn payload(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.payload.iter().copied()).collect()
    }

    /// Same content split for a smaller frame budget. Returns self when it already fits.
    pub fn fit_to(self: &Arc<Self>, chunk_payload: usize) -> Result<Arc<Self>, ChunkError> {
        if chunk_payload >= self.chunk_payload {
            return Ok(Arc::clone(self));
        }
        Ok(Arc::new(Self::encode(
            self.content_hash,
            &self.payload(),
            chunk_payload,
        )?))
    }
}

/// One in-flight chunked send to a device. Holds its own reference to the chunk list, so
/// cache eviction never affects a running session.
#[derive(Debug)]
pub struct TransferSession {
    key: String,
    chunks: Arc<ChunkSet>,
    cursor: usize,
    created_at: Instant,
}

impl TransferSession {
    pub fn new(key: impl Into<String>, chunks: Arc<ChunkSet>) -> Self {
        Self {
            key: key.into(),
            chunks,
            cursor: 0,
            created_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn content_hash(&self) -> u32 {
        self.chunks.content_hash
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Frames handed out so far.
    pub fn sent(&self) -> usize {
        self.cursor
    }

    pub fn total(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.chunks.len()
    }

    /// Next frame to send, advancing the cursor.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.chunks.get(self.cursor)?;
        self.cursor += 1;
        Some(chunk.to_frame())
    }

    /// Start over from chunk 0.
    pub fn restart(&mut self) {
        self.cursor = 0;
        self.created_at = Instant::now();
    }
}

/// Result of feeding one frame to a [`ChunkAssembler`].
#[derive(Debug, PartialEq, Eq)]
pub enum AssemblyProgress {
    /// All chunks present; reassembled bytes are ready.
    Complete(Vec<u8>),
    InProgress { received: usize, total: usize },
    /// Malformed frame, bad checksum, or a chunk that contradicts the current transfer.
    Rejected,
}

/// Receiving side: collects chunks for one content hash and reassembles them.
/// A chunk for a different hash starts a new transfer.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    content_hash: Option<u32>,
    total: usize,
    received: BTreeMap<u16, Vec<u8>>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&mut self, frame: &[u8]) -> AssemblyProgress {
        match decode_chunk(frame) {
            Some(chunk) => self.push(chunk),
            None => AssemblyProgress::Rejected,
        }
    }

    pub fn push(&mut self, chunk: Chunk) -> AssemblyProgress {
        if !chunk.verify_checksum() {
            return AssemblyProgress::Rejected;
        }
        let h = chunk.header;
        if self.content_hash != Some(h.content_hash) {
            self.content_hash = Some(h.content_hash);
            self.total = h.total_chunks as usize;
            self.received.clear();
        } else if self.total != h.total_chunks as usize {
            return AssemblyProgress::Rejected;
        }
        self.received.insert(h.chunk_index, chunk.payload);
        if self.received.len() < self.total {
            return AssemblyProgress::InProgress {
                received: self.received.len(),
                total: self.total,
            };
        }
        let bytes = self.received.values().flatten().copied().collect();
        self.content_hash = None;
        self.received.clear();
        AssemblyProgress::Complete(bytes)
    }
}
