pub mod channel;
pub mod commands;
pub mod info;
pub mod session;

use std::time::Duration;

use thiserror::Error;

use crate::skyq::commands::{CommandSet, LogicalCommand};

/// Default REST port on Sky Q boxes. Some firmware builds expose the same
/// service on 8080 instead; that is configured per endpoint.
pub const DEFAULT_HTTP_PORT: u16 = 9006;
/// Remote-control port of the binary command protocol.
pub const DEFAULT_TCP_PORT: u16 = 49160;

/// Network location of one configured set-top box. Immutable once added to
/// the registry; reconfiguration replaces the entry wholesale.
#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
    pub id: String,
    pub name: String,
    pub host: String,
    pub http_port: u16,
    pub tcp_port: u16,
}

impl DeviceEndpoint {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.tcp_port)
    }
}

/// Identity reported by the box over HTTP, cached for the session lifetime
/// and refreshed on reconnect and on the poll cadence.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub model: String,
    pub serial: String,
    pub software_version: Option<String>,
    pub mac_address: Option<String>,
    pub capabilities: CommandSet,
}

/// Advisory power reading. `Unknown` covers every transient failure mode of
/// the info endpoint; power polling never blocks command sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Standby,
    Unknown,
}

/// Connection lifecycle of one device session. Exactly one instance per
/// endpoint, written only by its own session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    SendingCommand,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::SendingCommand => write!(f, "sending_command"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Error taxonomy of the protocol client.
///
/// Transport-layer variants (`HandshakeFailed`, `ChannelBroken`, `Timeout`)
/// are absorbed into state transitions by the owning session; only command
/// and usage errors normally cross the registry boundary.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("command {0} has no wire code on this device")]
    UnsupportedCommand(LogicalCommand),

    #[error("device info endpoint unavailable: {0}")]
    InfoUnavailable(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("control channel broken: {0}")]
    ChannelBroken(String),

    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("device is not connected, try again later")]
    NotConnected,

    #[error("registry is full ({0} devices)")]
    CapacityExceeded(usize),

    #[error("endpoint already registered: {0}")]
    DuplicateEndpoint(String),

    #[error("unknown device id: {0}")]
    UnknownDevice(String),
}

impl DeviceError {
    /// Transport failures drive the reconnect path; everything else is
    /// reported to the caller and leaves the channel alone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed(_) | Self::ChannelBroken(_) | Self::Timeout(_)
        )
    }
}
