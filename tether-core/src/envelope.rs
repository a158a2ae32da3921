//! Type-tagged envelopes for compact messages.
//!
//! A serialized message body is split across one or more frames, each prefixed with a
//! 3-byte header: `messageType u8 | chunkIndex u8 | totalChunks u8`. Receivers reassemble
//! per message type, so different message types can be in flight at the same time.

use std::collections::{BTreeMap, HashMap};

/// Envelope header size in bytes.
pub const ENVELOPE_HEADER_LEN: usize = 3;

/// Most envelopes one message may span (u8 counter).
pub const MAX_ENVELOPES: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ChannelList = 0x01,
    RecentItems = 0x02,
    ChannelItems = 0x03,
    DeviceList = 0x04,
    MediaState = 0x10,
    TimeSync = 0x11,
    Settings = 0x12,
    Error = 0x1F,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::ChannelList,
            0x02 => Self::RecentItems,
            0x03 => Self::ChannelItems,
            0x04 => Self::DeviceList,
            0x10 => Self::MediaState,
            0x11 => Self::TimeSync,
            0x12 => Self::Settings,
            0x1F => Self::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_type: MessageType,
    pub chunk_index: u8,
    pub total_chunks: u8,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn to_frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.body.len());
        out.push(self.message_type as u8);
        out.push(self.chunk_index);
        out.push(self.total_chunks);
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse one envelope frame. None on unknown type or inconsistent counters.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < ENVELOPE_HEADER_LEN {
            return None;
        }
        let message_type = MessageType::from_u8(frame[0])?;
        let (chunk_index, total_chunks) = (frame[1], frame[2]);
        if total_chunks == 0 || chunk_index >= total_chunks {
            return None;
        }
        Some(Self {
            message_type,
            chunk_index,
            total_chunks,
            body: frame[ENVELOPE_HEADER_LEN..].to_vec(),
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("{len}-byte message needs {needed} envelopes (max {MAX_ENVELOPES})")]
    Oversize { len: usize, needed: usize },
    #[error("frame size {0} too small for an envelope")]
    FrameTooSmall(usize),
}

/// Split `body` into envelopes that each fit `max_frame` bytes.
pub fn wrap(
    message_type: MessageType,
    body: &[u8],
    max_frame: usize,
) -> Result<Vec<Envelope>, EnvelopeError> {
    let per = max_frame.saturating_sub(ENVELOPE_HEADER_LEN);
    if per == 0 {
        return Err(EnvelopeError::FrameTooSmall(max_frame));
    }
    let total = body.len().div_ceil(per).max(1);
    if total > MAX_ENVELOPES {
        return Err(EnvelopeError::Oversize {
            len: body.len(),
            needed: total,
        });
    }
    Ok((0..total)
        .map(|i| {
            let start = i * per;
            let end = (start + per).min(body.len());
            Envelope {
                message_type,
                chunk_index: i as u8,
                total_chunks: total as u8,
                body: body[start..end].to_vec(),
            }
        })
        .collect())
}

/// Convenience: [`wrap`] straight to frames.
pub fn wrap_frames(
    message_type: MessageType,
    body: &[u8],
    max_frame: usize,
) -> Result<Vec<Vec<u8>>, EnvelopeError> {
    Ok(wrap(message_type, body, max_frame)?
        .iter()
        .map(Envelope::to_frame)
        .collect())
}

#[derive(Default)]
struct Partial {
    total: u8,
    bodies: BTreeMap<u8, Vec<u8>>,
}

/// Receiving side: reassembles envelopes independently per message type.
#[derive(Default)]
pub struct EnvelopeAssembler {
    partial: HashMap<MessageType, Partial>,
}

impl EnvelopeAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame. Returns the message type and full body once the last piece arrives.
    /// Index 0 always starts a fresh message of that type.
    pub fn push(&mut self, frame: &[u8]) -> Option<(MessageType, Vec<u8>)> {
        let env = Envelope::parse(frame)?;
        if env.chunk_index == 0 {
            self.partial.remove(&env.message_type);
        }
        let part = self.partial.entry(env.message_type).or_default();
        if part.bodies.is_empty() {
            part.total = env.total_chunks;
        } else if part.total != env.total_chunks {
            self.partial.remove(&env.message_type);
            return None;
        }
        part.bodies.insert(env.chunk_index, env.body);
        if part.bodies.len() < part.total as usize {
            return None;
        }
        let done = self.partial.remove(&env.message_type)?;
        Some((env.message_type, done.bodies.into_values().flatten().collect()))
    }
}
