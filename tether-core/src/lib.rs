//! Tether peripheral protocol engine.
//! Host-driven: no I/O; host passes link and domain events and receives actions.

pub mod arbiter;
pub mod cache;
pub mod catalog;
pub mod channel;
pub mod chunk;
pub mod collab;
pub mod core;
pub mod envelope;
pub mod hash;
pub mod protocol;

pub use arbiter::{PlaybackCommand, Resolution, SourceArbiter, SourceId, TrackMetadata};
pub use cache::{ChunkCache, ContentClass};
pub use channel::{LogicalChannel, SERVICE_UUID};
pub use chunk::{ChunkAssembler, ChunkError, ChunkHeader, ChunkSet, TransferSession};
pub use collab::{
    CatalogStore, Clock, Item, MediaState, MemoryCatalog, PlaybackSink, SystemClock, TimeSnapshot,
};
pub use crate::core::{Action, CoreConfig, CoreError, DeviceId, DisconnectReason, PeripheralCore};
pub use envelope::{Envelope, EnvelopeAssembler, MessageType};
pub use protocol::PROTOCOL_VERSION;
