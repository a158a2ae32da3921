//! Source arbitration: which playback source a generic transport command applies to.
//!
//! State is mutated only by source lifecycle events (started / playing-changed / paused /
//! stopped). Mutations are serialized behind a write lock; the last resolution is kept so
//! readers can observe it without taking the state lock.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A playback source. `None` means no command target is known.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    #[default]
    None,
    Internal,
    External(String),
}

impl SourceId {
    /// Short name carried in compact state messages.
    pub fn wire_name(&self) -> &str {
        match self {
            SourceId::None => "none",
            SourceId::Internal => "internal",
            SourceId::External(id) => id,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::External(id) => write!(f, "external:{id}"),
            other => f.write_str(other.wire_name()),
        }
    }
}

/// Generic transport command as sent by the remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackCommand {
    Play,
    Pause,
    Toggle,
    Next,
    Previous,
    /// Absolute position in milliseconds.
    Seek(i64),
    /// Volume in percent, 0..=100.
    Volume(u8),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_ms: i64,
}

/// What was last playing and where it stopped, for resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PausedContent {
    pub source: SourceId,
    pub metadata: TrackMetadata,
    pub position_ms: i64,
}

/// Routing decision for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub target: SourceId,
    /// Command to deliver. `Toggle` is resolved into `Play` or `Pause`.
    pub command: PlaybackCommand,
    /// Set when the command resumes content recorded for `target`.
    pub resume: Option<PausedContent>,
}

#[derive(Debug, Default, Clone)]
pub struct SourceState {
    pub active: SourceId,
    pub playing: BTreeMap<SourceId, bool>,
    pub last_paused: Option<PausedContent>,
}

impl SourceState {
    fn playing_source(&self) -> Option<SourceId> {
        if self.playing.get(&SourceId::Internal).copied().unwrap_or(false) {
            return Some(SourceId::Internal);
        }
        self.playing
            .iter()
            .find(|(_, &on)| on)
            .map(|(s, _)| s.clone())
    }

    fn current_active_source(&self) -> SourceId {
        self.playing_source().unwrap_or_else(|| self.active.clone())
    }

    fn resume_for(&self, target: &SourceId) -> Option<PausedContent> {
        self.last_paused
            .as_ref()
            .filter(|p| &p.source == target)
            .cloned()
    }
}

#[derive(Default)]
pub struct SourceArbiter {
    state: RwLock<SourceState>,
    last: RwLock<Option<Resolution>>,
}

impl SourceArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source started playing new content: it becomes the command target.
    pub fn started(&self, source: SourceId, metadata: TrackMetadata) {
        let mut s = self.state.write();
        tracing::debug!(%source, title = %metadata.title, "source started");
        s.active = source.clone();
        s.last_paused = Some(PausedContent {
            source,
            metadata,
            position_ms: 0,
        });
    }

    /// A source reported a play/pause transition. Becoming playing switches the target.
    pub fn playing_changed(&self, source: SourceId, is_playing: bool) {
        let mut s = self.state.write();
        if is_playing {
            s.active = source.clone();
        }
        s.playing.insert(source, is_playing);
    }

    /// Playback paused at `position_ms`. The target does not change.
    pub fn paused(&self, position_ms: i64) {
        let mut s = self.state.write();
        let active = s.active.clone();
        s.playing.insert(active, false);
        if let Some(p) = s.last_paused.as_mut() {
            p.position_ms = position_ms;
        }
    }

    /// Everything stopped: no target, no playing flags.
    pub fn stopped(&self) {
        let mut s = self.state.write();
        s.active = SourceId::None;
        s.playing.clear();
    }

    pub fn current_active_source(&self) -> SourceId {
        self.state.read().current_active_source()
    }

    pub fn is_anything_playing(&self) -> bool {
        self.state.read().playing_source().is_some()
    }

    /// Decide target and effective command for a generic command. Resolutions are
    /// recorded in the order they were decided.
    pub fn resolve(&self, command: PlaybackCommand) -> Resolution {
        // Upgradable reads exclude each other and writers, so `last` cannot be overwritten
        // by a resolution decided earlier.
        let s = self.state.upgradable_read();
        let resolution = match command {
            PlaybackCommand::Toggle => match s.playing_source() {
                Some(playing) => Resolution {
                    target: playing,
                    command: PlaybackCommand::Pause,
                    resume: None,
                },
                None => Resolution {
                    resume: s.resume_for(&s.active),
                    target: s.active.clone(),
                    command: PlaybackCommand::Play,
                },
            },
            PlaybackCommand::Play => {
                let target = s.current_active_source();
                Resolution {
                    resume: s.resume_for(&target),
                    target,
                    command,
                }
            }
            _ => Resolution {
                target: s.current_active_source(),
                command,
                resume: None,
            },
        };
        *self.last.write() = Some(resolution.clone());
        drop(s);
        resolution
    }

    /// Target of `command` without the effective-command details.
    pub fn resolve_target(&self, command: PlaybackCommand) -> SourceId {
        self.resolve(command).target
    }

    pub fn last_decision(&self) -> Option<Resolution> {
        self.last.read().clone()
    }

    pub fn snapshot(&self) -> SourceState {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ext(id: &str) -> SourceId {
        SourceId::External(id.to_string())
    }

    fn meta(title: &str) -> TrackMetadata {
        TrackMetadata {
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn toggle_after_pause_resumes_external() {
        let arb = SourceArbiter::new();
        arb.started(ext("A"), meta("song"));
        arb.playing_changed(ext("A"), true);
        arb.paused(5000);
        let r = arb.resolve(PlaybackCommand::Toggle);
        assert_eq!(r.target, ext("A"));
        assert_eq!(r.command, PlaybackCommand::Play);
        let resume = r.resume.unwrap();
        assert_eq!(resume.position_ms, 5000);
        assert_eq!(resume.metadata.title, "song");
    }

    #[test]
    fn toggle_while_playing_pauses_the_playing_source() {
        let arb = SourceArbiter::new();
        arb.started(SourceId::Internal, meta("ep"));
        arb.playing_changed(ext("B"), true);
        // Internal is still the last started, but B is the one playing.
        let r = arb.resolve(PlaybackCommand::Toggle);
        assert_eq!(r.target, ext("B"));
        assert_eq!(r.command, PlaybackCommand::Pause);
    }

    #[test]
    fn pause_does_not_reassign_target() {
        let arb = SourceArbiter::new();
        arb.started(ext("A"), meta("x"));
        arb.playing_changed(ext("A"), true);
        arb.paused(10);
        assert_eq!(arb.current_active_source(), ext("A"));
        assert!(!arb.is_anything_playing());
    }

    #[test]
    fn auto_switch_on_play() {
        let arb = SourceArbiter::new();
        arb.started(SourceId::Internal, meta("ep"));
        arb.playing_changed(ext("C"), true);
        assert_eq!(arb.current_active_source(), ext("C"));
        arb.playing_changed(ext("C"), false);
        // Falls back to the last assigned active source, which is now C.
        assert_eq!(arb.current_active_source(), ext("C"));
    }

    #[test]
    fn internal_preferred_when_both_report_playing() {
        let arb = SourceArbiter::new();
        arb.playing_changed(SourceId::Internal, true);
        arb.playing_changed(ext("A"), true);
        assert_eq!(arb.resolve_target(PlaybackCommand::Pause), SourceId::Internal);
    }

    #[test]
    fn stopped_clears_everything() {
        let arb = SourceArbiter::new();
        arb.started(ext("A"), meta("x"));
        arb.playing_changed(ext("A"), true);
        arb.stopped();
        assert_eq!(arb.current_active_source(), SourceId::None);
        assert!(!arb.is_anything_playing());
        let r = arb.resolve(PlaybackCommand::Toggle);
        assert_eq!(r.target, SourceId::None);
        assert_eq!(r.command, PlaybackCommand::Play);
    }

    #[test]
    fn other_commands_follow_current_source() {
        let arb = SourceArbiter::new();
        arb.started(SourceId::Internal, meta("ep"));
        let r = arb.resolve(PlaybackCommand::Seek(42_000));
        assert_eq!(r.target, SourceId::Internal);
        assert_eq!(r.command, PlaybackCommand::Seek(42_000));
        assert!(r.resume.is_none());
        assert_eq!(arb.last_decision(), Some(r));
    }

    #[test]
    fn resume_only_for_matching_source() {
        let arb = SourceArbiter::new();
        arb.started(SourceId::Internal, meta("ep"));
        arb.paused(1234);
        arb.playing_changed(ext("A"), true);
        arb.playing_changed(ext("A"), false);
        let r = arb.resolve(PlaybackCommand::Play);
        assert_eq!(r.target, ext("A"));
        assert!(r.resume.is_none());
    }

    #[test]
    fn concurrent_mutations_are_serialized() {
        let arb = Arc::new(SourceArbiter::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let arb = Arc::clone(&arb);
                thread::spawn(move || {
                    for _ in 0..100 {
                        arb.playing_changed(ext(&format!("s{i}")), true);
                        arb.playing_changed(ext(&format!("s{i}")), false);
                        arb.resolve(PlaybackCommand::Toggle);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(!arb.is_anything_playing());
        assert_eq!(arb.snapshot().playing.len(), 8);
    }

    #[test]
    fn decision_waits_for_pending_mutation() {
        let arb = Arc::new(SourceArbiter::new());
        arb.started(ext("A"), meta("x"));
        let guard = arb.state.write();
        let resolver = {
            let arb = Arc::clone(&arb);
            thread::spawn(move || arb.resolve(PlaybackCommand::Next))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(arb.last_decision(), None);
        drop(guard);
        arb.started(ext("B"), meta("y"));
        let r = resolver.join().unwrap();
        // Whichever side won the lock, the recorded decision is the one returned.
        assert!(r.target == ext("A") || r.target == ext("B"));
        assert_eq!(arb.last_decision(), Some(r));
    }

    #[test]
    fn concurrent_resolves_record_a_decision() {
        let arb = Arc::new(SourceArbiter::new());
        arb.started(SourceId::Internal, meta("ep"));
        thread::scope(|scope| {
            for i in 0..8i64 {
                let arb = &arb;
                scope.spawn(move || {
                    for n in 0..200 {
                        arb.resolve(PlaybackCommand::Seek(i * 1000 + n));
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..200 {
                    arb.playing_changed(ext("A"), true);
                    arb.playing_changed(ext("A"), false);
                }
            });
        });
        let last = arb.last_decision().unwrap();
        assert!(matches!(last.command, PlaybackCommand::Seek(_)));
        assert!(last.target == SourceId::Internal || last.target == ext("A"));
        let again = arb.resolve(PlaybackCommand::Seek(7));
        assert_eq!(arb.last_decision(), Some(again));
    }
}
