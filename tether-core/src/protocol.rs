//! Inbound request decoding and outbound notification bodies.
//!
//! Requests arrive as small JSON objects (control, catalog) or bare ASCII hashes (artwork,
//! lyrics). Notifications use the same short-field JSON style as the catalog messages.

use serde::{Deserialize, Serialize};

use crate::arbiter::PlaybackCommand;
use crate::collab::{MediaState, TimeSnapshot};

/// Protocol version. Bump on any wire-visible change.
pub const PROTOCOL_VERSION: u8 = 1;

/// Longest content key accepted on the artwork/lyrics channels (u32 decimal is 10 chars).
pub const MAX_CONTENT_KEY_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request is not valid utf-8")]
    Utf8,
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("command {0} needs a value")]
    MissingValue(&'static str),
    #[error("invalid content key")]
    BadContentKey,
}

#[derive(Deserialize)]
struct RawControl {
    c: String,
    #[serde(default)]
    v: Option<i64>,
}

/// Decode a control-channel write: `{"c":"seek","v":12000}`.
pub fn decode_control(bytes: &[u8]) -> Result<PlaybackCommand, RequestError> {
    let raw: RawControl = serde_json::from_slice(bytes)?;
    let cmd = match raw.c.as_str() {
        "play" => PlaybackCommand::Play,
        "pause" => PlaybackCommand::Pause,
        "toggle" => PlaybackCommand::Toggle,
        "next" => PlaybackCommand::Next,
        "previous" | "prev" => PlaybackCommand::Previous,
        "stop" => PlaybackCommand::Stop,
        "seek" => PlaybackCommand::Seek(raw.v.ok_or(RequestError::MissingValue("seek"))?.max(0)),
        "volume" => {
            let v = raw.v.ok_or(RequestError::MissingValue("volume"))?;
            PlaybackCommand::Volume(v.clamp(0, 100) as u8)
        }
        other => return Err(RequestError::UnknownCommand(other.to_string())),
    };
    Ok(cmd)
}

/// Catalog-channel request, tagged by `t`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum CatalogRequest {
    Channels,
    Recent {
        #[serde(rename = "l", default)]
        limit: Option<usize>,
    },
    Items {
        #[serde(rename = "ph")]
        channel_hash: String,
        #[serde(rename = "o", default)]
        offset: usize,
        #[serde(rename = "l", default)]
        limit: Option<usize>,
    },
    Devices,
    Play {
        #[serde(rename = "ph")]
        channel_hash: String,
        #[serde(rename = "h")]
        item_hash: String,
    },
}

impl CatalogRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            CatalogRequest::Channels => "channels",
            CatalogRequest::Recent { .. } => "recent",
            CatalogRequest::Items { .. } => "items",
            CatalogRequest::Devices => "devices",
            CatalogRequest::Play { .. } => "play",
        }
    }
}

pub fn decode_catalog_request(bytes: &[u8]) -> Result<CatalogRequest, RequestError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decode an artwork/lyrics request: the ASCII hash of the wanted content.
pub fn decode_content_request(bytes: &[u8]) -> Result<String, RequestError> {
    let s = std::str::from_utf8(bytes).map_err(|_| RequestError::Utf8)?;
    let key = s.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\0');
    if key.is_empty()
        || key.len() > MAX_CONTENT_KEY_LEN
        || !key.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(RequestError::BadContentKey);
    }
    Ok(key.to_string())
}

/// Compact now-playing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMessage {
    #[serde(rename = "s")]
    pub source: String,
    #[serde(rename = "t")]
    pub title: String,
    #[serde(rename = "ar")]
    pub artist: String,
    #[serde(rename = "al")]
    pub album: String,
    #[serde(rename = "d")]
    pub duration_seconds: u32,
    #[serde(rename = "p")]
    pub position_seconds: u32,
    #[serde(rename = "pl")]
    pub playing: bool,
    #[serde(rename = "ah", default, skip_serializing_if = "Option::is_none")]
    pub artwork_hash: Option<String>,
    #[serde(rename = "lh", default, skip_serializing_if = "Option::is_none")]
    pub lyrics_hash: Option<String>,
}

fn whole_seconds(ms: i64) -> u32 {
    ms.div_euclid(1000).clamp(0, u32::MAX as i64) as u32
}

impl StateMessage {
    pub fn from_media(
        state: &MediaState,
        artwork_hash: Option<String>,
        lyrics_hash: Option<String>,
    ) -> Self {
        Self {
            source: state.source.wire_name().to_string(),
            title: state.track.title.clone(),
            artist: state.track.artist.clone(),
            album: state.track.album.clone(),
            duration_seconds: whole_seconds(state.track.duration_ms),
            position_seconds: whole_seconds(state.position_ms),
            playing: state.is_playing,
            artwork_hash,
            lyrics_hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSyncMessage {
    #[serde(rename = "ts")]
    pub epoch_ms: i64,
    #[serde(rename = "tz")]
    pub utc_offset_minutes: i32,
}

impl From<TimeSnapshot> for TimeSyncMessage {
    fn from(t: TimeSnapshot) -> Self {
        Self {
            epoch_ms: t.epoch_ms,
            utc_offset_minutes: t.utc_offset_minutes,
        }
    }
}

/// Answer to a catalog request that could not be served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "r")]
    pub request: String,
    #[serde(rename = "c")]
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{SourceId, TrackMetadata};

    #[test]
    fn control_commands() {
        assert_eq!(decode_control(br#"{"c":"play"}"#).unwrap(), PlaybackCommand::Play);
        assert_eq!(decode_control(br#"{"c":"toggle"}"#).unwrap(), PlaybackCommand::Toggle);
        assert_eq!(decode_control(br#"{"c":"prev"}"#).unwrap(), PlaybackCommand::Previous);
        assert_eq!(
            decode_control(br#"{"c":"seek","v":12000}"#).unwrap(),
            PlaybackCommand::Seek(12000)
        );
        assert_eq!(
            decode_control(br#"{"c":"volume","v":140}"#).unwrap(),
            PlaybackCommand::Volume(100)
        );
    }

    #[test]
    fn control_errors() {
        assert!(matches!(
            decode_control(br#"{"c":"seek"}"#),
            Err(RequestError::MissingValue("seek"))
        ));
        assert!(matches!(
            decode_control(br#"{"c":"rewind"}"#),
            Err(RequestError::UnknownCommand(_))
        ));
        assert!(matches!(decode_control(b"\xff\x00"), Err(RequestError::Json(_))));
    }

    #[test]
    fn catalog_requests() {
        assert_eq!(
            decode_catalog_request(br#"{"t":"channels"}"#).unwrap(),
            CatalogRequest::Channels
        );
        assert_eq!(
            decode_catalog_request(br#"{"t":"items","ph":"abcd1234","o":30,"l":15}"#).unwrap(),
            CatalogRequest::Items {
                channel_hash: "abcd1234".into(),
                offset: 30,
                limit: Some(15)
            }
        );
        assert_eq!(
            decode_catalog_request(br#"{"t":"recent"}"#).unwrap(),
            CatalogRequest::Recent { limit: None }
        );
        assert!(decode_catalog_request(br#"{"t":"items"}"#).is_err());
        assert!(decode_catalog_request(br#"{"t":"bogus"}"#).is_err());
    }

    #[test]
    fn content_request_keys() {
        assert_eq!(decode_content_request(b"123456789").unwrap(), "123456789");
        assert_eq!(decode_content_request(b" 42\n\0").unwrap(), "42");
        assert!(decode_content_request(b"").is_err());
        assert!(decode_content_request(b"12 34").is_err());
        assert!(decode_content_request(b"../etc").is_err());
        assert!(decode_content_request(&[b'1'; 17]).is_err());
    }

    #[test]
    fn state_message_compact() {
        let state = MediaState {
            source: SourceId::External("spotify".into()),
            track: TrackMetadata {
                title: "Song".into(),
                artist: "Band".into(),
                album: "Record".into(),
                duration_ms: 200_999,
            },
            position_ms: 61_500,
            is_playing: true,
            ..Default::default()
        };
        let msg = StateMessage::from_media(&state, Some("123".into()), None);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"s":"spotify","t":"Song","ar":"Band","al":"Record","d":200,"p":61,"pl":true,"ah":"123"}"#
        );
    }

    #[test]
    fn time_sync_fields() {
        let msg = TimeSyncMessage::from(TimeSnapshot {
            epoch_ms: 1_700_000_000_123,
            utc_offset_minutes: -300,
        });
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"ts":1700000000123,"tz":-300}"#
        );
    }
}
