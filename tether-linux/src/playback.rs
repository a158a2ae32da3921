//! Playback sink for the daemon: commands are logged; a media player integration hooks in here.

use tether_core::{Item, PlaybackCommand, PlaybackSink, SourceId};

#[derive(Debug, Default)]
pub struct LoggingSink;

impl PlaybackSink for LoggingSink {
    fn dispatch(&self, target: &SourceId, command: PlaybackCommand) {
        tracing::info!(%target, ?command, "playback command");
    }

    fn play_item(&self, item: &Item) {
        tracing::info!(channel = %item.channel_name, title = %item.title, "play item");
    }
}
