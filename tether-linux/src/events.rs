//! Domain events from the local media environment, read as JSON lines on stdin.
//!
//! ```text
//! {"event":"source_started","source":{"external":"spotify"},"metadata":{"title":"Song"}}
//! {"event":"playing_changed","source":"internal","playing":true}
//! {"event":"media","state":{"source":"internal","title":"Song","artwork_url":"https://..."}}
//! ```

use serde::Deserialize;
use tether_core::{MediaState, SourceId, TrackMetadata};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::host::Event;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostInput {
    SourceStarted {
        source: SourceId,
        #[serde(default)]
        metadata: TrackMetadata,
    },
    PlayingChanged {
        source: SourceId,
        playing: bool,
    },
    Paused {
        position_ms: i64,
    },
    Stopped,
    Media {
        state: MediaState,
    },
    Settings {
        value: serde_json::Value,
    },
}

pub fn parse_line(line: &str) -> Option<Result<HostInput, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// Forward stdin events until EOF.
pub async fn run_stdin(events: mpsc::UnboundedSender<Event>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Some(Ok(input)) => {
                if events.send(Event::Input(input)).is_err() {
                    break;
                }
            }
            Some(Err(e)) => tracing::warn!(error = %e, "ignoring bad event line"),
            None => {}
        }
    }
    tracing::debug!("stdin closed");
    Ok(())
}
