//! Logical channels multiplexed over the single GATT connection.
//!
//! | Channel   | UUID                                   | Read | Write | Notify |
//! |-----------|----------------------------------------|------|-------|--------|
//! | state     | `7e1a0001-4c2b-4f6e-9d3a-1b5c0e8f2a60` | yes  |       | yes    |
//! | control   | `7e1a0002-4c2b-4f6e-9d3a-1b5c0e8f2a60` |      | yes   |        |
//! | artwork   | `7e1a0003-4c2b-4f6e-9d3a-1b5c0e8f2a60` |      | yes   | yes    |
//! | catalog   | `7e1a0004-4c2b-4f6e-9d3a-1b5c0e8f2a60` |      | yes   | yes    |
//! | lyrics    | `7e1a0005-4c2b-4f6e-9d3a-1b5c0e8f2a60` |      | yes   | yes    |
//! | settings  | `7e1a0006-4c2b-4f6e-9d3a-1b5c0e8f2a60` | yes  | yes   | yes    |
//! | time-sync | `7e1a0007-4c2b-4f6e-9d3a-1b5c0e8f2a60` | yes  |       | yes    |

use std::fmt;

/// Primary service UUID.
pub const SERVICE_UUID: &str = "7e1a0000-4c2b-4f6e-9d3a-1b5c0e8f2a60";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directions {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogicalChannel {
    State = 1,
    Control = 2,
    Artwork = 3,
    Catalog = 4,
    Lyrics = 5,
    Settings = 6,
    TimeSync = 7,
}

impl LogicalChannel {
    pub const ALL: [LogicalChannel; 7] = [
        LogicalChannel::State,
        LogicalChannel::Control,
        LogicalChannel::Artwork,
        LogicalChannel::Catalog,
        LogicalChannel::Lyrics,
        LogicalChannel::Settings,
        LogicalChannel::TimeSync,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.id() == id)
    }

    pub fn uuid(self) -> &'static str {
        match self {
            LogicalChannel::State => "7e1a0001-4c2b-4f6e-9d3a-1b5c0e8f2a60",
            LogicalChannel::Control => "7e1a0002-4c2b-4f6e-9d3a-1b5c0e8f2a60",
            LogicalChannel::Artwork => "7e1a0003-4c2b-4f6e-9d3a-1b5c0e8f2a60",
            LogicalChannel::Catalog => "7e1a0004-4c2b-4f6e-9d3a-1b5c0e8f2a60",
            LogicalChannel::Lyrics => "7e1a0005-4c2b-4f6e-9d3a-1b5c0e8f2a60",
            LogicalChannel::Settings => "7e1a0006-4c2b-4f6e-9d3a-1b5c0e8f2a60",
            LogicalChannel::TimeSync => "7e1a0007-4c2b-4f6e-9d3a-1b5c0e8f2a60",
        }
    }

    pub fn from_uuid(uuid: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.uuid().eq_ignore_ascii_case(uuid))
    }

    pub fn directions(self) -> Directions {
        let (read, write, notify) = match self {
            LogicalChannel::State => (true, false, true),
            LogicalChannel::Control => (false, true, false),
            LogicalChannel::Artwork => (false, true, true),
            LogicalChannel::Catalog => (false, true, true),
            LogicalChannel::Lyrics => (false, true, true),
            LogicalChannel::Settings => (true, true, true),
            LogicalChannel::TimeSync => (true, false, true),
        };
        Directions {
            read,
            write,
            notify,
        }
    }

    /// Channels whose outbound traffic is chunked content rather than envelopes.
    pub fn carries_chunks(self) -> bool {
        matches!(self, LogicalChannel::Artwork | LogicalChannel::Lyrics)
    }
}

impl fmt::Display for LogicalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogicalChannel::State => "state",
            LogicalChannel::Control => "control",
            LogicalChannel::Artwork => "artwork",
            LogicalChannel::Catalog => "catalog",
            LogicalChannel::Lyrics => "lyrics",
            LogicalChannel::Settings => "settings",
            LogicalChannel::TimeSync => "time-sync",
        };
        f.write_str(name)
    }
}
