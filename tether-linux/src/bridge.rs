//! Link bridge: a local TCP socket stands in for the GATT server. One TCP connection is one
//! remote device. Frames in both directions are `op u8 | channel u8 | len u16 BE | bytes`.

use std::io;

use tether_core::{DeviceId, LogicalChannel};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::host::Event;

/// Link -> daemon: negotiated ATT MTU, body is u16 BE.
pub const OP_MTU: u8 = 0x01;
/// Link -> daemon: body is one byte, non-zero enables notifications.
pub const OP_SUBSCRIBE: u8 = 0x02;
/// Link -> daemon: characteristic write.
pub const OP_WRITE: u8 = 0x03;
/// Daemon -> link: notification.
pub const OP_NOTIFY: u8 = 0x04;
/// Link -> daemon: previous notification on the channel went out.
pub const OP_ACK: u8 = 0x05;

const LINK_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFrame {
    pub op: u8,
    pub channel: u8,
    pub body: Vec<u8>,
}

impl LinkFrame {
    pub fn notify(channel: LogicalChannel, body: Vec<u8>) -> Self {
        Self {
            op: OP_NOTIFY,
            channel: channel.id(),
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LINK_HEADER_LEN + self.body.len());
        out.push(self.op);
        out.push(self.channel);
        out.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Read one frame. `Ok(None)` on clean EOF between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<LinkFrame>> {
    let mut header = [0u8; LINK_HEADER_LEN];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(Some(LinkFrame {
        op: header[0],
        channel: header[1],
        body,
    }))
}

/// Translate an inbound link frame into a host event.
fn to_event(device: &DeviceId, frame: LinkFrame) -> Option<Event> {
    let device = device.clone();
    if frame.op == OP_MTU {
        let att_mtu = u16::from_be_bytes(frame.body.get(..2)?.try_into().ok()?);
        return Some(Event::Mtu { device, att_mtu });
    }
    let Some(channel) = LogicalChannel::from_id(frame.channel) else {
        tracing::warn!(%device, channel = frame.channel, "frame for unknown channel");
        return None;
    };
    match frame.op {
        OP_SUBSCRIBE => Some(Event::Subscription {
            device,
            channel,
            enabled: frame.body.first().is_some_and(|&b| b != 0),
        }),
        OP_WRITE => Some(Event::Write {
            device,
            channel,
            bytes: frame.body,
        }),
        OP_ACK => Some(Event::Ack { device, channel }),
        op => {
            tracing::warn!(%device, op, "unknown link op");
            None
        }
    }
}

pub async fn run_bridge(port: u16, events: mpsc::UnboundedSender<Event>) -> io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(port, "link bridge listening");
    loop {
        let (stream, addr) = listener.accept().await?;
        tracing::debug!(%addr, "link accepted");
        tokio::spawn(handle_link(stream, events.clone()));
    }
}

async fn handle_link(stream: TcpStream, events: mpsc::UnboundedSender<Event>) {
    let device = DeviceId::new(uuid::Uuid::new_v4().to_string());
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<LinkFrame>();
    if events
        .send(Event::Connected {
            device: device.clone(),
            link: tx,
        })
        .is_err()
    {
        return;
    }

    let writer_events = events.clone();
    let writer_device = device.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame.encode()).await {
                tracing::warn!(device = %writer_device, error = %e, "link write failed");
                let _ = writer_events.send(Event::SendFailed {
                    device: writer_device,
                });
                return;
            }
        }
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if let Some(event) = to_event(&device, frame) {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%device, error = %e, "link read failed");
                break;
            }
        }
    }
    let _ = events.send(Event::Closed { device });
}
