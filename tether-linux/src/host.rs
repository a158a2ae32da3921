//! Host loop: the single place that drives PeripheralCore. Link, stdin, fetch and pacing
//! tasks post events here; actions returned by the core are carried out in order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tether_core::core::DEFAULT_ATT_MTU;
use tether_core::{Action, ContentClass, DeviceId, LogicalChannel, PeripheralCore, PlaybackSink};
use tokio::sync::{mpsc, Mutex};

use crate::bridge::LinkFrame;
use crate::config::Pacing;
use crate::events::HostInput;
use crate::fetch::Fetcher;

pub enum Event {
    Connected {
        device: DeviceId,
        link: mpsc::UnboundedSender<LinkFrame>,
    },
    Mtu {
        device: DeviceId,
        att_mtu: u16,
    },
    Subscription {
        device: DeviceId,
        channel: LogicalChannel,
        enabled: bool,
    },
    Write {
        device: DeviceId,
        channel: LogicalChannel,
        bytes: Vec<u8>,
    },
    /// Link reported the notification on `channel` as sent.
    Ack {
        device: DeviceId,
        channel: LogicalChannel,
    },
    /// Delay pacing elapsed for frame `seq` on `channel`.
    PaceElapsed {
        device: DeviceId,
        channel: LogicalChannel,
        seq: u64,
    },
    SendFailed {
        device: DeviceId,
    },
    Closed {
        device: DeviceId,
    },
    Fetched {
        class: ContentClass,
        key: String,
        bytes: Option<Vec<u8>>,
    },
    Input(HostInput),
}

pub struct Host {
    core: Arc<Mutex<PeripheralCore>>,
    links: HashMap<DeviceId, mpsc::UnboundedSender<LinkFrame>>,
    fetcher: Arc<Fetcher>,
    sink: Arc<dyn PlaybackSink>,
    events: mpsc::UnboundedSender<Event>,
    pacing: Pacing,
    frame_interval: Duration,
}

impl Host {
    pub fn new(
        core: Arc<Mutex<PeripheralCore>>,
        fetcher: Arc<Fetcher>,
        sink: Arc<dyn PlaybackSink>,
        events: mpsc::UnboundedSender<Event>,
        pacing: Pacing,
        frame_interval: Duration,
    ) -> Self {
        Self {
            core,
            links: HashMap::new(),
            fetcher,
            sink,
            events,
            pacing,
            frame_interval,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            let actions = self.apply(event).await;
            self.perform(actions).await;
        }
    }

    async fn apply(&mut self, event: Event) -> Vec<Action> {
        let mut core = self.core.lock().await;
        match event {
            Event::Connected { device, link } => {
                self.links.insert(device.clone(), link);
                core.on_connected(device, DEFAULT_ATT_MTU);
                vec![]
            }
            Event::Mtu { device, att_mtu } => {
                core.on_mtu_changed(&device, att_mtu);
                vec![]
            }
            Event::Subscription {
                device,
                channel,
                enabled,
            } => core.on_subscription(&device, channel, enabled),
            Event::Write {
                device,
                channel,
                bytes,
            } => core.on_channel_write(&device, channel, &bytes),
            Event::Ack { device, channel } if self.pacing == Pacing::Ack => {
                core.on_frame_sent(&device, channel)
            }
            Event::Ack { .. } => vec![],
            Event::PaceElapsed {
                device,
                channel,
                seq,
            } => core.on_pacing_elapsed(&device, channel, seq),
            Event::SendFailed { device } => core.on_send_failed(&device),
            Event::Closed { device } => {
                self.links.remove(&device);
                core.on_disconnected(&device)
            }
            Event::Fetched { class, key, bytes } => core.on_content_fetched(class, &key, bytes),
            Event::Input(input) => match input {
                HostInput::SourceStarted { source, metadata } => {
                    core.arbiter().started(source, metadata);
                    vec![]
                }
                HostInput::PlayingChanged { source, playing } => {
                    core.arbiter().playing_changed(source, playing);
                    vec![]
                }
                HostInput::Paused { position_ms } => {
                    core.arbiter().paused(position_ms);
                    vec![]
                }
                HostInput::Stopped => {
                    core.arbiter().stopped();
                    vec![]
                }
                HostInput::Media { state } => core.publish_media_state(&state),
                HostInput::Settings { value } => core.publish_settings(&value),
            },
        }
    }

    async fn perform(&mut self, actions: Vec<Action>) {
        let mut pending: VecDeque<Action> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Notify {
                    device,
                    channel,
                    frame,
                    seq,
                } => {
                    let sent = self
                        .links
                        .get(&device)
                        .is_some_and(|link| link.send(LinkFrame::notify(channel, frame)).is_ok());
                    if !sent {
                        pending.extend(self.core.lock().await.on_send_failed(&device));
                    } else if self.pacing == Pacing::Delay {
                        let events = self.events.clone();
                        let interval = self.frame_interval;
                        tokio::spawn(async move {
                            tokio::time::sleep(interval).await;
                            let _ = events.send(Event::PaceElapsed {
                                device,
                                channel,
                                seq,
                            });
                        });
                    }
                }
                Action::Fetch { class, key, url } => {
                    let fetcher = Arc::clone(&self.fetcher);
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        let bytes = match fetcher.fetch(&url).await {
                            Ok(b) => Some(b),
                            Err(e) => {
                                tracing::warn!(%class, key = %key, url = %url, error = %e, "fetch failed");
                                None
                            }
                        };
                        let _ = events.send(Event::Fetched { class, key, bytes });
                    });
                }
                Action::Playback(resolution) => {
                    if let Some(resume) = &resolution.resume {
                        tracing::debug!(
                            title = %resume.metadata.title,
                            position_ms = resume.position_ms,
                            "resuming paused content"
                        );
                    }
                    self.sink.dispatch(&resolution.target, resolution.command);
                }
                Action::PlayItem(item) => self.sink.play_item(&item),
                Action::SettingsWritten { device, value } => {
                    tracing::info!(%device, %value, "settings written by remote");
                }
                Action::TransferCancelled {
                    device,
                    channel,
                    key,
                } => {
                    tracing::debug!(%device, %channel, key = %key, "transfer cancelled");
                }
                Action::Disconnected { device, reason } => {
                    tracing::debug!(%device, ?reason, "link released");
                    self.links.remove(&device);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tether_core::{
        CoreConfig, Item, MemoryCatalog, PlaybackCommand, SourceArbiter, SourceId, SystemClock,
    };

    #[derive(Default)]
    struct RecordingSink {
        commands: StdMutex<Vec<(SourceId, PlaybackCommand)>>,
    }

    impl PlaybackSink for RecordingSink {
        fn dispatch(&self, target: &SourceId, command: PlaybackCommand) {
            self.commands.lock().unwrap().push((target.clone(), command));
        }

        fn play_item(&self, _item: &Item) {}
    }

    fn host(pacing: Pacing, sink: Arc<RecordingSink>) -> (Host, mpsc::UnboundedReceiver<Event>) {
        let core = PeripheralCore::new(
            Arc::new(MemoryCatalog::default()),
            Arc::new(SourceArbiter::new()),
            Arc::new(SystemClock::default()),
            CoreConfig::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Host::new(
            Arc::new(Mutex::new(core)),
            Arc::new(Fetcher::new(Duration::from_secs(1)).unwrap()),
            sink,
            tx,
            pacing,
            Duration::from_millis(15),
        );
        (host, rx)
    }

    async fn step(host: &mut Host, event: Event) {
        let actions = host.apply(event).await;
        host.perform(actions).await;
    }

    #[tokio::test]
    async fn notifications_reach_the_link() {
        let (mut host, _rx) = host(Pacing::Ack, Arc::default());
        let (link, mut frames) = mpsc::unbounded_channel();
        let device = DeviceId::new("d1");
        step(&mut host, Event::Connected { device: device.clone(), link }).await;
        step(
            &mut host,
            Event::Subscription {
                device: device.clone(),
                channel: LogicalChannel::TimeSync,
                enabled: true,
            },
        )
        .await;
        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.channel, LogicalChannel::TimeSync.id());
        assert_eq!(frame.op, crate::bridge::OP_NOTIFY);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_pacing_schedules_release() {
        let (mut host, mut rx) = host(Pacing::Delay, Arc::default());
        let (link, _frames) = mpsc::unbounded_channel();
        let device = DeviceId::new("d1");
        step(&mut host, Event::Connected { device: device.clone(), link }).await;
        step(
            &mut host,
            Event::Subscription {
                device: device.clone(),
                channel: LogicalChannel::TimeSync,
                enabled: true,
            },
        )
        .await;
        match rx.recv().await {
            Some(Event::PaceElapsed { channel, .. }) => assert_eq!(channel, LogicalChannel::TimeSync),
            _ => panic!("expected pacing event"),
        }
    }

    #[tokio::test]
    async fn closed_link_turns_into_disconnect() {
        let (mut host, _rx) = host(Pacing::Ack, Arc::default());
        let (link, frames) = mpsc::unbounded_channel();
        drop(frames);
        let device = DeviceId::new("d1");
        step(&mut host, Event::Connected { device: device.clone(), link }).await;
        step(
            &mut host,
            Event::Subscription {
                device: device.clone(),
                channel: LogicalChannel::TimeSync,
                enabled: true,
            },
        )
        .await;
        assert!(host.links.is_empty());
        assert_eq!(
            host.core.lock().await.phase(&device),
            tether_core::core::DevicePhase::Disconnected
        );
    }

    #[tokio::test]
    async fn control_write_reaches_sink() {
        let sink = Arc::new(RecordingSink::default());
        let (mut host, _rx) = host(Pacing::Ack, Arc::clone(&sink));
        let (link, _frames) = mpsc::unbounded_channel();
        let device = DeviceId::new("d1");
        step(&mut host, Event::Connected { device: device.clone(), link }).await;
        step(
            &mut host,
            Event::Input(HostInput::PlayingChanged {
                source: SourceId::External("radio".into()),
                playing: true,
            }),
        )
        .await;
        step(
            &mut host,
            Event::Write {
                device,
                channel: LogicalChannel::Control,
                bytes: br#"{"c":"next"}"#.to_vec(),
            },
        )
        .await;
        assert_eq!(
            *sink.commands.lock().unwrap(),
            vec![(SourceId::External("radio".into()), PlaybackCommand::Next)]
        );
    }

    #[tokio::test]
    async fn ack_pacing_walks_a_transfer() {
        let (mut host, _rx) = host(Pacing::Ack, Arc::default());
        let (link, mut frames) = mpsc::unbounded_channel();
        let device = DeviceId::new("d1");
        step(&mut host, Event::Connected { device: device.clone(), link }).await;
        step(
            &mut host,
            Event::Subscription {
                device: device.clone(),
                channel: LogicalChannel::Artwork,
                enabled: true,
            },
        )
        .await;
        // Default ATT MTU leaves 4 payload bytes per frame: 10 frames.
        let actions = host
            .core
            .lock()
            .await
            .begin_or_resume_transfer(&device, ContentClass::Artwork, "9", &[7u8; 40])
            .unwrap();
        host.perform(actions).await;

        let mut sent = 0;
        while let Ok(frame) = frames.try_recv() {
            assert_eq!(frame.channel, LogicalChannel::Artwork.id());
            sent += 1;
            assert!(frames.try_recv().is_err(), "second frame before ack");
            step(
                &mut host,
                Event::Ack {
                    device: device.clone(),
                    channel: LogicalChannel::Artwork,
                },
            )
            .await;
        }
        assert_eq!(sent, 10);
        assert!(host
            .core
            .lock()
            .await
            .active_transfer(&device, LogicalChannel::Artwork)
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_pacing_ignores_timer_from_dropped_queue() {
        let (mut host, mut rx) = host(Pacing::Delay, Arc::default());
        let (link, mut frames) = mpsc::unbounded_channel();
        let device = DeviceId::new("d1");
        let subscribe = |enabled| Event::Subscription {
            device: device.clone(),
            channel: LogicalChannel::TimeSync,
            enabled,
        };
        step(&mut host, Event::Connected { device: device.clone(), link }).await;
        step(&mut host, subscribe(true)).await;
        step(&mut host, subscribe(false)).await;
        step(&mut host, subscribe(true)).await;
        step(&mut host, subscribe(false)).await;
        step(&mut host, subscribe(true)).await;
        assert_eq!(std::iter::from_fn(|| frames.try_recv().ok()).count(), 3);
        // The core is asked to resend; the next time sync waits behind the current one.
        let queued = host
            .core
            .lock()
            .await
            .on_subscription(&device, LogicalChannel::TimeSync, true);
        assert!(queued.is_empty());

        let mut elapsed = Vec::new();
        for _ in 0..3 {
            match rx.recv().await {
                Some(Event::PaceElapsed { seq, .. }) => elapsed.push(seq),
                _ => panic!("expected pacing event"),
            }
        }
        elapsed.sort_unstable();
        let (stale, current) = elapsed.split_at(2);
        for &seq in stale {
            let actions = host.core.lock().await.on_pacing_elapsed(
                &device,
                LogicalChannel::TimeSync,
                seq,
            );
            assert!(actions.is_empty());
        }
        let actions = host.core.lock().await.on_pacing_elapsed(
            &device,
            LogicalChannel::TimeSync,
            current[0],
        );
        assert_eq!(actions.len(), 1);
    }
}
