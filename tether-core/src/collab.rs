//! Interfaces to the collaborators around the core: catalog store, playback sink, clock.
//! Domain records here carry no protocol concerns.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::arbiter::{PlaybackCommand, SourceId, TrackMetadata};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: String,
    pub name: String,
    pub item_count: u32,
}

/// One catalog item (e.g. a podcast episode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub channel_id: String,
    pub channel_name: String,
    pub feed_url: String,
    pub title: String,
    pub publish_ms: i64,
    pub duration_ms: i64,
}

/// Persistent catalog (subscriptions and episodes).
pub trait CatalogStore: Send + Sync {
    fn list_channels(&self) -> Vec<ChannelSummary>;

    /// Items of one channel in the store's natural order, and the channel's total count.
    fn items_for_channel(&self, channel_id: &str, offset: usize, limit: usize) -> (Vec<Item>, usize);

    /// Most recent items across channels, at most `limit`.
    fn recent_items(&self, limit: usize) -> Vec<Item>;

    /// Channel currently being played, if any.
    fn active_channel(&self) -> Option<String> {
        None
    }

    /// Names of selectable output devices.
    fn output_devices(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Receives resolved playback commands.
pub trait PlaybackSink: Send + Sync {
    fn dispatch(&self, target: &SourceId, command: PlaybackCommand);

    fn play_item(&self, item: &Item);
}

/// Snapshot of the wall clock sent on the time-sync channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSnapshot {
    pub epoch_ms: i64,
    pub utc_offset_minutes: i32,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> TimeSnapshot;
}

/// Wall clock with a fixed UTC offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    pub utc_offset_minutes: i32,
}

impl Clock for SystemClock {
    fn now(&self) -> TimeSnapshot {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        TimeSnapshot {
            epoch_ms,
            utc_offset_minutes: self.utc_offset_minutes,
        }
    }
}

/// Now-playing information published by the local environment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaState {
    pub source: SourceId,
    #[serde(flatten)]
    pub track: TrackMetadata,
    pub position_ms: i64,
    pub is_playing: bool,
    pub artwork_url: Option<String>,
    pub lyrics_url: Option<String>,
}

/// Catalog held in memory, loadable from JSON. Items of a channel keep insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCatalog {
    pub channels: Vec<ChannelSummary>,
    pub items: Vec<Item>,
    pub active_channel: Option<String>,
    pub output_devices: Vec<String>,
}

impl MemoryCatalog {
    /// Build from items alone; channel summaries are derived in first-seen order.
    pub fn from_items(items: Vec<Item>) -> Self {
        let mut channels: Vec<ChannelSummary> = Vec::new();
        for item in &items {
            match channels.iter_mut().find(|c| c.id == item.channel_id) {
                Some(c) => c.item_count += 1,
                None => channels.push(ChannelSummary {
                    id: item.channel_id.clone(),
                    name: item.channel_name.clone(),
                    item_count: 1,
                }),
            }
        }
        Self {
            channels,
            items,
            ..Default::default()
        }
    }
}

impl CatalogStore for MemoryCatalog {
    fn list_channels(&self) -> Vec<ChannelSummary> {
        self.channels.clone()
    }

    fn items_for_channel(&self, channel_id: &str, offset: usize, limit: usize) -> (Vec<Item>, usize) {
        let all: Vec<&Item> = self
            .items
            .iter()
            .filter(|i| i.channel_id == channel_id)
            .collect();
        let page = all
            .iter()
            .skip(offset)
            .take(limit)
            .map(|i| (*i).clone())
            .collect();
        (page, all.len())
    }

    fn recent_items(&self, limit: usize) -> Vec<Item> {
        let mut items = self.items.clone();
        items.sort_by(|a, b| b.publish_ms.cmp(&a.publish_ms));
        items.truncate(limit);
        items
    }

    fn active_channel(&self) -> Option<String> {
        self.active_channel.clone()
    }

    fn output_devices(&self) -> Vec<String> {
        self.output_devices.clone()
    }
}
