//! Logical command vocabulary and the wire-code table of the remote
//! protocol.
//!
//! The table is fixed at build time and mirrors the legacy remote-control
//! byte values exactly, including their aliasing: the box exposes a single
//! power key, search and services share a code, and so do guide and home.
//! Volume and mute have no wire code at all on this protocol (the TV owns
//! volume), so they resolve to `UnsupportedCommand`.

use std::collections::HashSet;
use std::str::FromStr;

use thiserror::Error;

use super::DeviceError;

/// A named user-facing action, independent of wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalCommand {
    PowerToggle,
    PowerOn,
    Standby,
    Up,
    Down,
    Left,
    Right,
    Select,
    Back,
    Home,
    Menu,
    Play,
    Pause,
    Stop,
    Record,
    Rewind,
    FastForward,
    Digit0,
    Digit1,
    Digit2,
    Digit3,
    Digit4,
    Digit5,
    Digit6,
    Digit7,
    Digit8,
    Digit9,
    ChannelUp,
    Guide,
    Info,
    VolumeUp,
    VolumeDown,
    Mute,
    Red,
    Green,
    Yellow,
    Blue,
    Sky,
    Search,
    Text,
    Help,
    Services,
}

/// Every member of the closed vocabulary.
pub const ALL: &[LogicalCommand] = &[
    LogicalCommand::PowerToggle,
    LogicalCommand::PowerOn,
    LogicalCommand::Standby,
    LogicalCommand::Up,
    LogicalCommand::Down,
    LogicalCommand::Left,
    LogicalCommand::Right,
    LogicalCommand::Select,
    LogicalCommand::Back,
    LogicalCommand::Home,
    LogicalCommand::Menu,
    LogicalCommand::Play,
    LogicalCommand::Pause,
    LogicalCommand::Stop,
    LogicalCommand::Record,
    LogicalCommand::Rewind,
    LogicalCommand::FastForward,
    LogicalCommand::Digit0,
    LogicalCommand::Digit1,
    LogicalCommand::Digit2,
    LogicalCommand::Digit3,
    LogicalCommand::Digit4,
    LogicalCommand::Digit5,
    LogicalCommand::Digit6,
    LogicalCommand::Digit7,
    LogicalCommand::Digit8,
    LogicalCommand::Digit9,
    LogicalCommand::ChannelUp,
    LogicalCommand::Guide,
    LogicalCommand::Info,
    LogicalCommand::VolumeUp,
    LogicalCommand::VolumeDown,
    LogicalCommand::Mute,
    LogicalCommand::Red,
    LogicalCommand::Green,
    LogicalCommand::Yellow,
    LogicalCommand::Blue,
    LogicalCommand::Sky,
    LogicalCommand::Search,
    LogicalCommand::Text,
    LogicalCommand::Help,
    LogicalCommand::Services,
];

/// Wire code for a logical command, or `None` where the protocol has no
/// key for it. Values are the legacy remote-control codes, bit-exact.
pub fn wire_code(command: LogicalCommand) -> Option<u8> {
    use LogicalCommand::*;
    match command {
        // Single power key; on/standby are firmware aliases of the toggle.
        PowerToggle | PowerOn | Standby => Some(0),
        Select => Some(1),
        Back => Some(2),
        ChannelUp => Some(6),
        Menu => Some(8),
        Help => Some(9),
        Search | Services => Some(10),
        Guide | Home => Some(11),
        Info => Some(14),
        Text => Some(15),
        Up => Some(16),
        Down => Some(17),
        Left => Some(18),
        Right => Some(19),
        Red => Some(32),
        Green => Some(33),
        Yellow => Some(34),
        Blue => Some(35),
        Digit0 => Some(48),
        Digit1 => Some(49),
        Digit2 => Some(50),
        Digit3 => Some(51),
        Digit4 => Some(52),
        Digit5 => Some(53),
        Digit6 => Some(54),
        Digit7 => Some(55),
        Digit8 => Some(56),
        Digit9 => Some(57),
        Play => Some(64),
        Pause => Some(65),
        Stop => Some(66),
        Record => Some(67),
        FastForward => Some(69),
        Rewind => Some(71),
        Sky => Some(241),
        // Volume is handled by the TV, not the box.
        VolumeUp | VolumeDown | Mute => None,
    }
}

/// Resolve a logical command to its wire code.
pub fn resolve(command: LogicalCommand) -> Result<u8, DeviceError> {
    wire_code(command).ok_or(DeviceError::UnsupportedCommand(command))
}

impl LogicalCommand {
    /// Canonical snake_case name, as the hub passes it to `dispatch`.
    pub fn name(&self) -> &'static str {
        use LogicalCommand::*;
        match self {
            PowerToggle => "power",
            PowerOn => "power_on",
            Standby => "standby",
            Up => "up",
            Down => "down",
            Left => "left",
            Right => "right",
            Select => "select",
            Back => "back",
            Home => "home",
            Menu => "menu",
            Play => "play",
            Pause => "pause",
            Stop => "stop",
            Record => "record",
            Rewind => "rewind",
            FastForward => "fast_forward",
            Digit0 => "0",
            Digit1 => "1",
            Digit2 => "2",
            Digit3 => "3",
            Digit4 => "4",
            Digit5 => "5",
            Digit6 => "6",
            Digit7 => "7",
            Digit8 => "8",
            Digit9 => "9",
            ChannelUp => "channel_up",
            Guide => "guide",
            Info => "info",
            VolumeUp => "volume_up",
            VolumeDown => "volume_down",
            Mute => "mute",
            Red => "red",
            Green => "green",
            Yellow => "yellow",
            Blue => "blue",
            Sky => "sky",
            Search => "search",
            Text => "text",
            Help => "help",
            Services => "services",
        }
    }
}

impl std::fmt::Display for LogicalCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A command name the hub sent that is outside the closed vocabulary.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown logical command name: {0}")]
pub struct UnknownCommandName(pub String);

impl FromStr for LogicalCommand {
    type Err = UnknownCommandName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use LogicalCommand::*;
        // Canonical names first, then the aliases the legacy integration
        // accepted.
        let command = match s {
            "power" | "power_toggle" => PowerToggle,
            "power_on" | "on" => PowerOn,
            "standby" | "off" => Standby,
            "up" => Up,
            "down" => Down,
            "left" => Left,
            "right" => Right,
            "select" => Select,
            "back" => Back,
            "home" => Home,
            "menu" => Menu,
            "play" => Play,
            "pause" => Pause,
            "stop" => Stop,
            "record" => Record,
            "rewind" => Rewind,
            "fast_forward" | "fastforward" => FastForward,
            "0" => Digit0,
            "1" => Digit1,
            "2" => Digit2,
            "3" => Digit3,
            "4" => Digit4,
            "5" => Digit5,
            "6" => Digit6,
            "7" => Digit7,
            "8" => Digit8,
            "9" => Digit9,
            "channel_up" | "channelup" => ChannelUp,
            "guide" | "tvguide" => Guide,
            "info" => Info,
            "volume_up" | "volumeup" => VolumeUp,
            "volume_down" | "volumedown" => VolumeDown,
            "mute" => Mute,
            "red" => Red,
            "green" => Green,
            "yellow" => Yellow,
            "blue" => Blue,
            "sky" => Sky,
            "search" => Search,
            "text" => Text,
            "help" => Help,
            "services" => Services,
            other => return Err(UnknownCommandName(other.to_string())),
        };
        Ok(command)
    }
}

/// Per-device capability set, derived from the reported model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet(HashSet<LogicalCommand>);

impl CommandSet {
    /// Every wire-mapped command has worked on all Q hardware surveyed so
    /// far; confirmed per-model gaps get carved out of this set.
    pub fn for_model(model: &str) -> Self {
        let supported: HashSet<LogicalCommand> = ALL
            .iter()
            .copied()
            .filter(|c| wire_code(*c).is_some())
            .collect();
        tracing::debug!("capability set for model {model}: {} commands", supported.len());
        Self(supported)
    }

    pub fn supports(&self, command: LogicalCommand) -> bool {
        self.0.contains(&command)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
