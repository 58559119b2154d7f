use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Connect,
    Disconnect,
    ReadValue,
    WriteValue,
}

/// A unit of work for the radio worker. `payload` only matters for `WriteValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub payload: i8,
}

impl Command {
    pub const fn connect() -> Self {
        Self { kind: CommandKind::Connect, payload: 0 }
    }

    pub const fn disconnect() -> Self {
        Self { kind: CommandKind::Disconnect, payload: 0 }
    }

    pub const fn read_value() -> Self {
        Self { kind: CommandKind::ReadValue, payload: 0 }
    }

    pub const fn write_value(value: i8) -> Self {
        Self { kind: CommandKind::WriteValue, payload: value }
    }

    /// Commands that scan and connect before doing anything else.
    pub fn opens_session(&self) -> bool {
        !matches!(self.kind, CommandKind::Disconnect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Disconnected => "Disconnected",
            LinkStatus::Connecting => "Connecting",
            LinkStatus::Connected => "Connected",
            LinkStatus::Failed => "Failed",
        }
    }
}

/// Direction of one knob detent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Left,
    Right,
}

impl Tick {
    pub fn delta(&self) -> i8 {
        match self {
            Tick::Left => -1,
            Tick::Right => 1,
        }
    }
}

pub const DEFAULT_TARGET_WEIGHT: i8 = 36;
pub const COMMAND_QUEUE_DEPTH: usize = 10;
pub const RADIO_EVENT_QUEUE_DEPTH: usize = 4;
pub const SUBMIT_WAIT_MS: u64 = 10;
pub const DEBOUNCE_QUIET_MS: u64 = 1000;
pub const SCAN_DURATION_MS: u64 = 5000;
pub const SCAN_INTERVAL: u16 = 100;
pub const SCAN_WINDOW: u16 = 99;
pub const RADIO_OPERATION_TIMEOUT_MS: u64 = 10_000;
pub const AUTOMATION_LOOP_PERIOD_MS: u64 = 10;
pub const NETWORK_RECONNECT_BACKOFF_MS: u64 = 5000;
