//! Host-driven API: PeripheralCore receives link and domain events from the host, returns actions.
//!
//! The core owns every per-device connection record and is the only producer of outbound
//! frames. Each (device, channel) pair has a FIFO queue with at most one frame in flight;
//! the host reports `on_frame_sent` once the transport accepted a frame (or the pacing
//! delay elapsed), which releases the next one. Channels and devices never wait on each other.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::arbiter::{PlaybackCommand, Resolution, SourceArbiter, SourceId};
use crate::cache::{ChunkCache, ContentClass, DEFAULT_ARTWORK_ENTRIES, DEFAULT_LYRICS_ENTRIES};
use crate::catalog::{self, CatalogMessage, DEFAULT_PAGE_LIMIT, DEFAULT_RECENT_LIMIT};
use crate::channel::LogicalChannel;
use crate::chunk::{self, ChunkError, ChunkSet, TransferSession, MAX_CHUNK_PAYLOAD, MAX_FRAME_LEN};
use crate::collab::{CatalogStore, Clock, Item, MediaState};
use crate::envelope::{self, EnvelopeError, MessageType};
use crate::hash;
use crate::protocol::{self, CatalogRequest, ErrorMessage, StateMessage, TimeSyncMessage};

/// Default ATT MTU before any exchange.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// ATT notification overhead (opcode + handle).
const ATT_OVERHEAD: usize = 3;

/// Smallest usable frame (default MTU minus ATT overhead).
pub const MIN_FRAME_LEN: usize = DEFAULT_ATT_MTU as usize - ATT_OVERHEAD;

/// Frame size available for a negotiated ATT MTU.
pub fn frame_size_for_mtu(att_mtu: u16) -> usize {
    (att_mtu as usize)
        .saturating_sub(ATT_OVERHEAD)
        .clamp(MIN_FRAME_LEN, MAX_FRAME_LEN)
}

/// Opaque remote device identifier (BLE address or host-assigned id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Peripheral-wide link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Idle,
    Advertising,
}

/// Lifecycle of one remote device as seen by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhase {
    Idle,
    Advertising,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Remote,
    SendFailed,
}

/// Tunables for the core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub artwork_cache_entries: usize,
    pub lyrics_cache_entries: usize,
    pub default_page_limit: usize,
    pub recent_limit: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            artwork_cache_entries: DEFAULT_ARTWORK_ENTRIES,
            lyrics_cache_entries: DEFAULT_LYRICS_ENTRIES,
            default_page_limit: DEFAULT_PAGE_LIMIT,
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write one frame to the device on this channel. The host must call
    /// [`PeripheralCore::on_frame_sent`] once the transport accepted it, or
    /// [`PeripheralCore::on_pacing_elapsed`] with `seq` under delay pacing.
    Notify {
        device: DeviceId,
        channel: LogicalChannel,
        frame: Vec<u8>,
        seq: u64,
    },
    /// Fetch raw content on a cache miss and report back via `on_content_fetched`.
    Fetch {
        class: ContentClass,
        key: String,
        url: String,
    },
    /// Deliver a resolved transport command to the playback sink.
    Playback(Resolution),
    /// Start playing a catalog item on the internal player.
    PlayItem(Item),
    /// The remote device wrote settings.
    SettingsWritten {
        device: DeviceId,
        value: serde_json::Value,
    },
    /// An in-flight chunked transfer was aborted.
    TransferCancelled {
        device: DeviceId,
        channel: LogicalChannel,
        key: String,
    },
    /// Connection state for the device was cleared.
    Disconnected {
        device: DeviceId,
        reason: DisconnectReason,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("channel {0} is not subscribed")]
    NotSubscribed(LogicalChannel),
    #[error("no catalog channel {0}")]
    UnknownCatalogChannel(String),
    #[error("{0} is not a catalog query")]
    NotACatalogQuery(&'static str),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Default)]
struct ChannelQueue {
    pending: VecDeque<Vec<u8>>,
    /// Sequence number of the frame the transport has not released yet.
    in_flight: Option<u64>,
}

/// Per-device state: negotiated frame size, subscriptions, send queues, transfer sessions.
struct PeripheralConnection {
    max_frame: usize,
    subscribed: HashSet<LogicalChannel>,
    queues: HashMap<LogicalChannel, ChannelQueue>,
    /// At most one session per content channel, hence per content hash.
    sessions: HashMap<LogicalChannel, TransferSession>,
}

impl PeripheralConnection {
    fn new(att_mtu: u16) -> Self {
        Self {
            max_frame: frame_size_for_mtu(att_mtu),
            subscribed: HashSet::new(),
            queues: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    fn chunk_payload(&self) -> usize {
        chunk::payload_budget(self.max_frame)
    }

    fn enqueue(&mut self, channel: LogicalChannel, frames: Vec<Vec<u8>>) {
        self.queues
            .entry(channel)
            .or_default()
            .pending
            .extend(frames);
    }

    /// Release the next frame on `channel` if nothing is in flight there. `next_seq` is the
    /// core-wide frame counter, so a stale release never matches a later frame.
    fn pump(
        &mut self,
        device: &DeviceId,
        channel: LogicalChannel,
        next_seq: &mut u64,
    ) -> Option<Action> {
        let queue = self.queues.entry(channel).or_default();
        if queue.in_flight.is_some() {
            return None;
        }
        let frame = match queue.pending.pop_front() {
            Some(f) => Some(f),
            None => match self.sessions.get_mut(&channel) {
                Some(session) => {
                    let next = session.next_frame();
                    if next.is_none() {
                        tracing::debug!(%device, %channel, key = session.key(), chunks = session.total(), "transfer complete");
                        self.sessions.remove(&channel);
                    }
                    next
                }
                None => None,
            },
        }?;
        let seq = *next_seq;
        *next_seq += 1;
        queue.in_flight = Some(seq);
        Some(Action::Notify {
            device: device.clone(),
            channel,
            frame,
            seq,
        })
    }

    fn drop_channel(&mut self, channel: LogicalChannel) -> Option<TransferSession> {
        self.queues.remove(&channel);
        self.sessions.remove(&channel)
    }
}

/// Recently disconnected devices remembered for [`PeripheralCore::phase`].
const DEPARTED_MEMORY: usize = 64;

fn content_channel(class: ContentClass) -> LogicalChannel {
    match class {
        ContentClass::Artwork => LogicalChannel::Artwork,
        ContentClass::Lyrics => LogicalChannel::Lyrics,
    }
}

/// Main coordinator. Host passes events; core returns actions.
pub struct PeripheralCore {
    state: PeripheralState,
    connections: HashMap<DeviceId, PeripheralConnection>,
    /// Oldest first, at most [`DEPARTED_MEMORY`].
    departed: VecDeque<DeviceId>,
    frame_seq: u64,
    artwork: Arc<ChunkCache>,
    lyrics: Arc<ChunkCache>,
    /// Where to fetch content for a known key. Pruned to keys that are cached, being
    /// fetched, awaited, or named by the latest state.
    sources: HashMap<(ContentClass, String), String>,
    /// Devices waiting for an in-flight fetch.
    waiters: HashMap<(ContentClass, String), Vec<DeviceId>>,
    latest_state: Option<Vec<u8>>,
    latest_settings: Option<Vec<u8>>,
    arbiter: Arc<SourceArbiter>,
    catalog: Arc<dyn CatalogStore>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
}

impl PeripheralCore {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        arbiter: Arc<SourceArbiter>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        Self {
            state: PeripheralState::Idle,
            connections: HashMap::new(),
            departed: VecDeque::new(),
            frame_seq: 0,
            artwork: Arc::new(ChunkCache::new(
                ContentClass::Artwork,
                config.artwork_cache_entries,
            )),
            lyrics: Arc::new(ChunkCache::new(
                ContentClass::Lyrics,
                config.lyrics_cache_entries,
            )),
            sources: HashMap::new(),
            waiters: HashMap::new(),
            latest_state: None,
            latest_settings: None,
            arbiter,
            catalog,
            clock,
            config,
        }
    }

    pub fn arbiter(&self) -> &Arc<SourceArbiter> {
        &self.arbiter
    }

    pub fn cache(&self, class: ContentClass) -> &Arc<ChunkCache> {
        match class {
            ContentClass::Artwork => &self.artwork,
            ContentClass::Lyrics => &self.lyrics,
        }
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    pub fn start_advertising(&mut self) {
        tracing::info!("advertising");
        self.state = PeripheralState::Advertising;
    }

    pub fn stop_advertising(&mut self) {
        self.state = PeripheralState::Idle;
    }

    pub fn phase(&self, device: &DeviceId) -> DevicePhase {
        if self.connections.contains_key(device) {
            DevicePhase::Connected
        } else if self.departed.contains(device) {
            DevicePhase::Disconnected
        } else if self.state == PeripheralState::Advertising {
            DevicePhase::Advertising
        } else {
            DevicePhase::Idle
        }
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.connections.keys().cloned().collect()
    }

    /// Negotiated frame size for a connected device.
    pub fn max_frame(&self, device: &DeviceId) -> Option<usize> {
        self.connections.get(device).map(|c| c.max_frame)
    }

    pub fn is_subscribed(&self, device: &DeviceId, channel: LogicalChannel) -> bool {
        self.connections
            .get(device)
            .is_some_and(|c| c.subscribed.contains(&channel))
    }

    /// Content key of the transfer currently running on `channel`, if any.
    pub fn active_transfer(&self, device: &DeviceId, channel: LogicalChannel) -> Option<&str> {
        self.connections
            .get(device)?
            .sessions
            .get(&channel)
            .map(TransferSession::key)
    }

    /// Device connected. A reconnect starts from a fresh connection record with no
    /// subscriptions; the time sync goes out when the remote subscribes to it.
    pub fn on_connected(&mut self, device: DeviceId, att_mtu: u16) {
        tracing::info!(%device, att_mtu, "device connected");
        self.departed.retain(|d| d != &device);
        self.connections
            .insert(device, PeripheralConnection::new(att_mtu));
    }

    /// MTU exchange completed after connect.
    pub fn on_mtu_changed(&mut self, device: &DeviceId, att_mtu: u16) {
        if let Some(conn) = self.connections.get_mut(device) {
            conn.max_frame = frame_size_for_mtu(att_mtu);
            tracing::debug!(%device, att_mtu, max_frame = conn.max_frame, "mtu updated");
        }
    }

    pub fn on_disconnected(&mut self, device: &DeviceId) -> Vec<Action> {
        self.clear_connection(device, DisconnectReason::Remote)
    }

    /// The transport rejected a send: the device is treated as gone.
    pub fn on_send_failed(&mut self, device: &DeviceId) -> Vec<Action> {
        tracing::warn!(%device, "send failed; dropping connection");
        self.clear_connection(device, DisconnectReason::SendFailed)
    }

    fn clear_connection(&mut self, device: &DeviceId, reason: DisconnectReason) -> Vec<Action> {
        let Some(conn) = self.connections.remove(device) else {
            return vec![];
        };
        self.departed.retain(|d| d != device);
        self.departed.push_back(device.clone());
        if self.departed.len() > DEPARTED_MEMORY {
            self.departed.pop_front();
        }
        for waiting in self.waiters.values_mut() {
            waiting.retain(|d| d != device);
        }
        let mut actions: Vec<Action> = conn
            .sessions
            .into_iter()
            .map(|(channel, session)| Action::TransferCancelled {
                device: device.clone(),
                channel,
                key: session.key().to_string(),
            })
            .collect();
        tracing::info!(%device, ?reason, cancelled = actions.len(), "device disconnected");
        actions.push(Action::Disconnected {
            device: device.clone(),
            reason,
        });
        actions
    }

    /// Remote enabled or disabled notifications on a channel. Enabling replays the latest
    /// state/settings and sends a fresh time sync.
    pub fn on_subscription(
        &mut self,
        device: &DeviceId,
        channel: LogicalChannel,
        enabled: bool,
    ) -> Vec<Action> {
        if !channel.directions().notify {
            tracing::warn!(%device, %channel, "subscription on non-notify channel ignored");
            return vec![];
        }
        let Some(conn) = self.connections.get_mut(device) else {
            return vec![];
        };
        if !enabled {
            conn.subscribed.remove(&channel);
            return match conn.drop_channel(channel) {
                Some(session) => vec![Action::TransferCancelled {
                    device: device.clone(),
                    channel,
                    key: session.key().to_string(),
                }],
                None => vec![],
            };
        }
        conn.subscribed.insert(channel);
        match channel {
            LogicalChannel::TimeSync => self.send_time_sync(device),
            LogicalChannel::State => match self.latest_state.clone() {
                Some(body) => self.send_envelopes(device, channel, MessageType::MediaState, &body),
                None => vec![],
            },
            LogicalChannel::Settings => match self.latest_settings.clone() {
                Some(body) => self.send_envelopes(device, channel, MessageType::Settings, &body),
                None => vec![],
            },
            _ => vec![],
        }
    }

    /// The transport accepted the in-flight frame on `channel`; release the next one.
    pub fn on_frame_sent(&mut self, device: &DeviceId, channel: LogicalChannel) -> Vec<Action> {
        self.release(device, channel, None)
    }

    /// Delay pacing for frame `seq` elapsed. Ignored unless `seq` is still the frame in
    /// flight on `channel` (the channel may have been dropped and refilled since).
    pub fn on_pacing_elapsed(
        &mut self,
        device: &DeviceId,
        channel: LogicalChannel,
        seq: u64,
    ) -> Vec<Action> {
        self.release(device, channel, Some(seq))
    }

    fn release(&mut self, device: &DeviceId, channel: LogicalChannel, seq: Option<u64>) -> Vec<Action> {
        let Some(conn) = self.connections.get_mut(device) else {
            return vec![];
        };
        if let Some(q) = conn.queues.get_mut(&channel) {
            if seq.is_some() && q.in_flight != seq {
                tracing::debug!(%device, %channel, ?seq, "stale frame release ignored");
                return vec![];
            }
            q.in_flight = None;
        }
        conn.pump(device, channel, &mut self.frame_seq)
            .into_iter()
            .collect()
    }

    /// Inbound write from the remote device. Undecodable writes are logged and dropped.
    pub fn on_channel_write(
        &mut self,
        device: &DeviceId,
        channel: LogicalChannel,
        bytes: &[u8],
    ) -> Vec<Action> {
        if !self.connections.contains_key(device) {
            tracing::warn!(%device, %channel, "write from unknown device dropped");
            return vec![];
        }
        if !channel.directions().write {
            tracing::warn!(%device, %channel, "write on read-only channel dropped");
            return vec![];
        }
        match channel {
            LogicalChannel::Control => match protocol::decode_control(bytes) {
                Ok(command) => self.on_control(command),
                Err(e) => {
                    tracing::warn!(%device, error = %e, "bad control frame dropped");
                    vec![]
                }
            },
            LogicalChannel::Catalog => match protocol::decode_catalog_request(bytes) {
                Ok(request) => self.on_catalog_request(device, &request),
                Err(e) => {
                    tracing::warn!(%device, error = %e, "bad catalog request");
                    self.send_error(device, "unknown", "bad_request")
                }
            },
            LogicalChannel::Artwork | LogicalChannel::Lyrics => {
                let class = if channel == LogicalChannel::Artwork {
                    ContentClass::Artwork
                } else {
                    ContentClass::Lyrics
                };
                match protocol::decode_content_request(bytes) {
                    Ok(key) => self.request_content(device, class, &key),
                    Err(e) => {
                        tracing::warn!(%device, %channel, error = %e, "bad content request dropped");
                        vec![]
                    }
                }
            }
            LogicalChannel::Settings => match serde_json::from_slice(bytes) {
                Ok(value) => vec![Action::SettingsWritten {
                    device: device.clone(),
                    value,
                }],
                Err(e) => {
                    tracing::warn!(%device, error = %e, "bad settings frame dropped");
                    vec![]
                }
            },
            LogicalChannel::State | LogicalChannel::TimeSync => vec![],
        }
    }

    fn on_control(&self, command: PlaybackCommand) -> Vec<Action> {
        let resolution = self.arbiter.resolve(command);
        if resolution.target == SourceId::None {
            tracing::debug!(?command, "no playback source to route command to");
            return vec![];
        }
        tracing::debug!(?command, target = %resolution.target, effective = ?resolution.command, "routing command");
        vec![Action::Playback(resolution)]
    }

    /// Which source a generic command applies to.
    pub fn resolve_target(&self, command: PlaybackCommand) -> SourceId {
        self.arbiter.resolve_target(command)
    }

    fn on_catalog_request(&mut self, device: &DeviceId, request: &CatalogRequest) -> Vec<Action> {
        if let CatalogRequest::Play {
            channel_hash,
            item_hash,
        } = request
        {
            return match catalog::find_item(self.catalog.as_ref(), channel_hash, item_hash) {
                Some(item) => vec![Action::PlayItem(item)],
                None => self.send_error(device, request.kind(), "not_found"),
            };
        }
        let Some(max_frame) = self.max_frame(device) else {
            return vec![];
        };
        match self.handle_catalog_request(request, max_frame) {
            Ok(frames) => self.enqueue_frames(device, LogicalChannel::Catalog, frames),
            Err(CoreError::UnknownCatalogChannel(h)) => {
                tracing::debug!(%device, channel = %h, "catalog request for unknown channel");
                self.send_error(device, request.kind(), "not_found")
            }
            Err(e) => {
                tracing::warn!(%device, kind = request.kind(), error = %e, "catalog response failed");
                self.send_error(device, request.kind(), "too_large")
            }
        }
    }

    /// Build the response to a catalog request.
    pub fn catalog_response(&self, request: &CatalogRequest) -> Result<CatalogMessage, CoreError> {
        let store = self.catalog.as_ref();
        Ok(match request {
            CatalogRequest::Channels => CatalogMessage::Channels(catalog::channel_list(store)),
            CatalogRequest::Recent { limit } => CatalogMessage::Recent(catalog::recent_items(
                store,
                limit.unwrap_or(self.config.recent_limit),
            )),
            CatalogRequest::Items {
                channel_hash,
                offset,
                limit,
            } => CatalogMessage::Items(
                catalog::channel_page(
                    store,
                    channel_hash,
                    *offset,
                    limit.unwrap_or(self.config.default_page_limit),
                )
                .ok_or_else(|| CoreError::UnknownCatalogChannel(channel_hash.clone()))?,
            ),
            CatalogRequest::Devices => CatalogMessage::Devices(store.output_devices()),
            CatalogRequest::Play { .. } => {
                return Err(CoreError::NotACatalogQuery(request.kind()));
            }
        })
    }

    /// Serve a catalog request as envelope frames sized for `max_frame`.
    pub fn handle_catalog_request(
        &self,
        request: &CatalogRequest,
        max_frame: usize,
    ) -> Result<Vec<Vec<u8>>, CoreError> {
        let message = self.catalog_response(request)?;
        let body = message.body()?;
        Ok(envelope::wrap_frames(message.message_type(), &body, max_frame)?)
    }

    fn send_error(&mut self, device: &DeviceId, request: &str, code: &str) -> Vec<Action> {
        let msg = ErrorMessage {
            request: request.to_string(),
            code: code.to_string(),
        };
        match serde_json::to_vec(&msg) {
            Ok(body) => self.send_envelopes(device, LogicalChannel::Catalog, MessageType::Error, &body),
            Err(_) => vec![],
        }
    }

    fn send_time_sync(&mut self, device: &DeviceId) -> Vec<Action> {
        let msg = TimeSyncMessage::from(self.clock.now());
        match serde_json::to_vec(&msg) {
            Ok(body) => {
                self.send_envelopes(device, LogicalChannel::TimeSync, MessageType::TimeSync, &body)
            }
            Err(_) => vec![],
        }
    }

    fn send_envelopes(
        &mut self,
        device: &DeviceId,
        channel: LogicalChannel,
        message_type: MessageType,
        body: &[u8],
    ) -> Vec<Action> {
        let Some(max_frame) = self.max_frame(device) else {
            return vec![];
        };
        match envelope::wrap_frames(message_type, body, max_frame) {
            Ok(frames) => self.enqueue_frames(device, channel, frames),
            Err(e) => {
                tracing::warn!(%device, %channel, error = %e, "message dropped");
                vec![]
            }
        }
    }

    /// Queue frames behind anything already pending on the channel. Dropped when the remote
    /// has not subscribed.
    fn enqueue_frames(
        &mut self,
        device: &DeviceId,
        channel: LogicalChannel,
        frames: Vec<Vec<u8>>,
    ) -> Vec<Action> {
        let Some(conn) = self.connections.get_mut(device) else {
            return vec![];
        };
        if !conn.subscribed.contains(&channel) {
            tracing::debug!(%device, %channel, frames = frames.len(), "not subscribed; frames dropped");
            return vec![];
        }
        conn.enqueue(channel, frames);
        conn.pump(device, channel, &mut self.frame_seq)
            .into_iter()
            .collect()
    }

    /// Remote asked for content by key: serve from cache, or fetch once and serve on arrival.
    fn request_content(&mut self, device: &DeviceId, class: ContentClass, key: &str) -> Vec<Action> {
        if let Some(set) = self.cache(class).get(key) {
            return self.start_session_or_log(device, class, key, set);
        }
        let id = (class, key.to_string());
        let Some(url) = self.sources.get(&id).cloned() else {
            tracing::debug!(%device, %class, key, "no source for requested content");
            return vec![];
        };
        let waiting = self.waiters.entry(id).or_default();
        if !waiting.contains(device) {
            waiting.push(device.clone());
        }
        if self.cache(class).try_begin_fetch(key) {
            vec![Action::Fetch {
                class,
                key: key.to_string(),
                url,
            }]
        } else {
            tracing::debug!(%device, %class, key, "fetch already in flight");
            vec![]
        }
    }

    /// Begin (or restart) a chunked transfer of `payload` to `device`. Cached content for
    /// `key` wins over `payload`. Content needing more chunks than allowed at this link's
    /// frame size fails before any session exists and is not cached.
    pub fn begin_or_resume_transfer(
        &mut self,
        device: &DeviceId,
        class: ContentClass,
        key: &str,
        payload: &[u8],
    ) -> Result<Vec<Action>, CoreError> {
        let channel = content_channel(class);
        let conn = self
            .connections
            .get(device)
            .ok_or_else(|| CoreError::UnknownDevice(device.clone()))?;
        if !conn.subscribed.contains(&channel) {
            return Err(CoreError::NotSubscribed(channel));
        }
        if let Some(set) = self.cache(class).get(key) {
            return self.start_session(device, class, key, set);
        }
        let set = Arc::new(ChunkSet::encode(
            hash::content_id(key),
            payload,
            MAX_CHUNK_PAYLOAD,
        )?);
        let actions = self.start_session(device, class, key, Arc::clone(&set))?;
        self.cache(class).put(key, set);
        Ok(actions)
    }

    /// Start a session for a remote-initiated request, where there is no caller to report to.
    fn start_session_or_log(
        &mut self,
        device: &DeviceId,
        class: ContentClass,
        key: &str,
        set: Arc<ChunkSet>,
    ) -> Vec<Action> {
        self.start_session(device, class, key, set)
            .unwrap_or_else(|e| {
                tracing::warn!(%device, %class, key, error = %e, "transfer not started");
                vec![]
            })
    }

    /// Re-chunk `set` for the device's frame size and make it the channel's session.
    fn start_session(
        &mut self,
        device: &DeviceId,
        class: ContentClass,
        key: &str,
        set: Arc<ChunkSet>,
    ) -> Result<Vec<Action>, CoreError> {
        let channel = content_channel(class);
        let Some(conn) = self.connections.get_mut(device) else {
            return Err(CoreError::UnknownDevice(device.clone()));
        };
        if !conn.subscribed.contains(&channel) {
            return Err(CoreError::NotSubscribed(channel));
        }
        let set = set.fit_to(conn.chunk_payload())?;
        let mut actions = Vec::new();
        if let Some(old) = conn.sessions.remove(&channel) {
            if old.key() != key {
                tracing::debug!(%device, %channel, old = old.key(), new = key, "superseding transfer");
                actions.push(Action::TransferCancelled {
                    device: device.clone(),
                    channel,
                    key: old.key().to_string(),
                });
            }
        }
        tracing::debug!(%device, %channel, key, chunks = set.len(), "starting transfer");
        conn.sessions
            .insert(channel, TransferSession::new(key, set));
        actions.extend(conn.pump(device, channel, &mut self.frame_seq));
        Ok(actions)
    }

    /// Host finished an upstream fetch. `None` means the content is unavailable.
    pub fn on_content_fetched(
        &mut self,
        class: ContentClass,
        key: &str,
        bytes: Option<Vec<u8>>,
    ) -> Vec<Action> {
        let cache = Arc::clone(self.cache(class));
        cache.end_fetch(key);
        let waiting = self
            .waiters
            .remove(&(class, key.to_string()))
            .unwrap_or_default();
        let Some(bytes) = bytes else {
            tracing::warn!(%class, key, waiters = waiting.len(), "content unavailable");
            return vec![];
        };
        let set = match ChunkSet::encode(hash::content_id(key), &bytes, MAX_CHUNK_PAYLOAD) {
            Ok(set) => Arc::new(set),
            Err(e) => {
                tracing::warn!(%class, key, error = %e, "fetched content rejected");
                return vec![];
            }
        };
        cache.put(key, Arc::clone(&set));
        tracing::debug!(%class, key, bytes = bytes.len(), chunks = set.len(), "content cached");
        waiting
            .iter()
            .flat_map(|device| self.start_session_or_log(device, class, key, Arc::clone(&set)))
            .collect()
    }

    /// Two-phase publish: resolve content identities (registering sources and prefetching
    /// misses), then notify every subscribed device of the new state.
    pub fn publish_media_state(&mut self, state: &MediaState) -> Vec<Action> {
        let mut actions = Vec::new();
        let artwork_hash = state.artwork_url.as_ref().map(|url| {
            let key = hash::artwork_hash(&state.track.artist, &state.track.album);
            actions.extend(self.register_source(ContentClass::Artwork, &key, url));
            key
        });
        let lyrics_hash = state.lyrics_url.as_ref().map(|url| {
            let key = hash::text_hash(&state.track.title, &state.track.artist);
            actions.extend(self.register_source(ContentClass::Lyrics, &key, url));
            key
        });
        self.prune_sources(&[
            (ContentClass::Artwork, artwork_hash.as_deref()),
            (ContentClass::Lyrics, lyrics_hash.as_deref()),
        ]);
        let msg = StateMessage::from_media(state, artwork_hash, lyrics_hash);
        let body = match serde_json::to_vec(&msg) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "state encode failed");
                return actions;
            }
        };
        self.latest_state = Some(body.clone());
        for device in self.connected_devices() {
            actions.extend(self.send_envelopes(
                &device,
                LogicalChannel::State,
                MessageType::MediaState,
                &body,
            ));
        }
        actions
    }

    fn register_source(&mut self, class: ContentClass, key: &str, url: &str) -> Option<Action> {
        self.sources
            .insert((class, key.to_string()), url.to_string());
        let cache = self.cache(class);
        if cache.contains(key) || !cache.try_begin_fetch(key) {
            return None;
        }
        Some(Action::Fetch {
            class,
            key: key.to_string(),
            url: url.to_string(),
        })
    }

    /// Forget sources nobody can ask for anymore: evicted or never cached, not in flight,
    /// not awaited, and not named by the state being published.
    fn prune_sources(&mut self, current: &[(ContentClass, Option<&str>)]) {
        let (artwork, lyrics, waiters) = (&self.artwork, &self.lyrics, &self.waiters);
        self.sources.retain(|id, _| {
            let (class, key) = (id.0, id.1.as_str());
            let cache = match class {
                ContentClass::Artwork => artwork,
                ContentClass::Lyrics => lyrics,
            };
            current.contains(&(class, Some(key)))
                || cache.contains(key)
                || cache.is_fetching(key)
                || waiters.contains_key(id)
        });
    }

    /// Push settings to every device subscribed to the settings channel.
    pub fn publish_settings(&mut self, value: &serde_json::Value) -> Vec<Action> {
        let body = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(_) => return vec![],
        };
        self.latest_settings = Some(body.clone());
        let mut actions = Vec::new();
        for device in self.connected_devices() {
            actions.extend(self.send_envelopes(
                &device,
                LogicalChannel::Settings,
                MessageType::Settings,
                &body,
            ));
        }
        actions
    }
}
