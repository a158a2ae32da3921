//! Compact catalog protocol: channel list, recent items, per-channel pages, device list.
//!
//! Bodies use short JSON field names, whole seconds and integers only. Each body is then
//! wrapped into envelopes tagged with its [`MessageType`].

use serde::{Deserialize, Serialize};

use crate::collab::{CatalogStore, Item};
use crate::envelope::MessageType;
use crate::hash::{channel_hash, episode_hash};

/// Page size when the remote does not ask for one.
pub const DEFAULT_PAGE_LIMIT: usize = 15;
/// Upper bound on a single page, to keep responses within the envelope budget.
pub const MAX_PAGE_LIMIT: usize = 50;
/// Recent items when the remote does not ask for a count.
pub const DEFAULT_RECENT_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    #[serde(rename = "h")]
    pub hash: String,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "c")]
    pub item_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelList {
    #[serde(rename = "p")]
    pub channels: Vec<ChannelEntry>,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEntry {
    #[serde(rename = "h")]
    pub item_hash: String,
    #[serde(rename = "ph")]
    pub channel_hash: String,
    #[serde(rename = "pn")]
    pub channel_name: String,
    #[serde(rename = "t")]
    pub title: String,
    #[serde(rename = "d")]
    pub duration_seconds: u32,
    #[serde(rename = "ts")]
    pub publish_unix_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentItems {
    #[serde(rename = "e")]
    pub items: Vec<RecentEntry>,
    #[serde(rename = "tot")]
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    #[serde(rename = "h")]
    pub item_hash: String,
    #[serde(rename = "t")]
    pub title: String,
    #[serde(rename = "d")]
    pub duration_seconds: u32,
    #[serde(rename = "ts")]
    pub publish_unix_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelItems {
    #[serde(rename = "ph")]
    pub channel_hash: String,
    #[serde(rename = "pn")]
    pub channel_name: String,
    #[serde(rename = "tot")]
    pub total_items: u32,
    #[serde(rename = "o")]
    pub offset: u32,
    #[serde(rename = "m")]
    pub has_more: bool,
    #[serde(rename = "e")]
    pub items: Vec<PageEntry>,
}

/// A fully built catalog response, ready to be serialized and wrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogMessage {
    Channels(ChannelList),
    Recent(RecentItems),
    Items(ChannelItems),
    Devices(Vec<String>),
}

impl CatalogMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            CatalogMessage::Channels(_) => MessageType::ChannelList,
            CatalogMessage::Recent(_) => MessageType::RecentItems,
            CatalogMessage::Items(_) => MessageType::ChannelItems,
            CatalogMessage::Devices(_) => MessageType::DeviceList,
        }
    }

    /// Serialized body (compact JSON, or the binary name array for devices).
    pub fn body(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            CatalogMessage::Channels(m) => serde_json::to_vec(m),
            CatalogMessage::Recent(m) => serde_json::to_vec(m),
            CatalogMessage::Items(m) => serde_json::to_vec(m),
            CatalogMessage::Devices(names) => Ok(encode_device_list(names)),
        }
    }
}

fn seconds(ms: i64) -> i64 {
    ms.div_euclid(1000)
}

fn duration_seconds(ms: i64) -> u32 {
    seconds(ms).clamp(0, u32::MAX as i64) as u32
}

fn item_hash(item: &Item) -> String {
    episode_hash(&item.feed_url, item.publish_ms, item.duration_ms)
}

/// `hasMore` for a page starting at `offset` with `returned` items out of `total`.
pub fn has_more(offset: usize, returned: usize, total: usize) -> bool {
    offset.saturating_add(returned) < total
}

pub fn channel_list(store: &dyn CatalogStore) -> ChannelList {
    ChannelList {
        channels: store
            .list_channels()
            .into_iter()
            .map(|c| ChannelEntry {
                hash: channel_hash(&c.id),
                name: c.name,
                item_count: c.item_count,
            })
            .collect(),
        active: store.active_channel().map(|id| channel_hash(&id)),
    }
}

/// Recent items across channels, newest first.
pub fn recent_items(store: &dyn CatalogStore, limit: usize) -> RecentItems {
    let mut items = store.recent_items(limit);
    items.sort_by(|a, b| b.publish_ms.cmp(&a.publish_ms));
    items.truncate(limit);
    RecentItems {
        total: items.len() as u32,
        items: items
            .iter()
            .map(|i| RecentEntry {
                item_hash: item_hash(i),
                channel_hash: channel_hash(&i.channel_id),
                channel_name: i.channel_name.clone(),
                title: i.title.clone(),
                duration_seconds: duration_seconds(i.duration_ms),
                publish_unix_seconds: seconds(i.publish_ms),
            })
            .collect(),
    }
}

/// Resolve a wire channel hash back to the store's channel id.
pub fn find_channel(store: &dyn CatalogStore, hash: &str) -> Option<(String, String)> {
    store
        .list_channels()
        .into_iter()
        .find(|c| channel_hash(&c.id) == hash)
        .map(|c| (c.id, c.name))
}

/// One page of a channel. None if the channel hash is unknown. Out-of-range offsets give an
/// empty page with `has_more == false`.
pub fn channel_page(
    store: &dyn CatalogStore,
    channel_hash_value: &str,
    offset: usize,
    limit: usize,
) -> Option<ChannelItems> {
    let (channel_id, channel_name) = find_channel(store, channel_hash_value)?;
    let limit = limit.min(MAX_PAGE_LIMIT);
    let (mut items, total) = store.items_for_channel(&channel_id, offset, limit);
    if offset >= total {
        items.clear();
    }
    items.truncate(limit);
    Some(ChannelItems {
        channel_hash: channel_hash_value.to_string(),
        channel_name,
        total_items: total as u32,
        offset: offset as u32,
        has_more: has_more(offset, items.len(), total),
        items: items
            .iter()
            .map(|i| PageEntry {
                item_hash: item_hash(i),
                title: i.title.clone(),
                duration_seconds: duration_seconds(i.duration_ms),
                publish_unix_seconds: seconds(i.publish_ms),
            })
            .collect(),
    })
}

/// Find an item by channel hash and item hash, scanning the channel page by page.
pub fn find_item(store: &dyn CatalogStore, channel_hash_value: &str, hash: &str) -> Option<Item> {
    let (channel_id, _) = find_channel(store, channel_hash_value)?;
    let mut offset = 0;
    loop {
        let (items, total) = store.items_for_channel(&channel_id, offset, MAX_PAGE_LIMIT);
        if let Some(found) = items.iter().find(|i| item_hash(i) == hash) {
            return Some(found.clone());
        }
        if items.is_empty() || offset + items.len() >= total {
            return None;
        }
        offset += items.len();
    }
}

/// `count u8`, then per name `len u8 | utf8`. Names over 255 bytes are cut on a char
/// boundary; at most 255 names.
pub fn encode_device_list(names: &[String]) -> Vec<u8> {
    let names = &names[..names.len().min(u8::MAX as usize)];
    let mut out = vec![names.len() as u8];
    for name in names {
        let mut end = name.len().min(u8::MAX as usize);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        out.push(end as u8);
        out.extend_from_slice(&name.as_bytes()[..end]);
    }
    out
}

pub fn decode_device_list(bytes: &[u8]) -> Option<Vec<String>> {
    let (&count, mut rest) = bytes.split_first()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (&len, tail) = rest.split_first()?;
        if tail.len() < len as usize {
            return None;
        }
        let (name, tail) = tail.split_at(len as usize);
        out.push(String::from_utf8(name.to_vec()).ok()?);
        rest = tail;
    }
    Some(out)
}
