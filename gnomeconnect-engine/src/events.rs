//! Typed plugin and membership events decoded from engine signals.

use serde::Serialize;

use crate::device::Device;

/// Battery threshold event value meaning "battery is low".
pub const BATTERY_THRESHOLD_LOW: i32 = 1;

/// Device lifecycle events from the engine.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Device became reachable. Unpaired devices are offered pairing.
    Joined(Device),
    /// Remote side asked to pair with us.
    PairRequested(Device),
    Paired(Device),
    Unpaired(Device),
    Left(Device),
}

impl DeviceEvent {
    pub fn device(&self) -> &Device {
        match self {
            Self::Joined(d)
            | Self::PairRequested(d)
            | Self::Paired(d)
            | Self::Unpaired(d)
            | Self::Left(d) => d,
        }
    }
}

/// Ping plugin event. Carries nothing beyond the source device.
#[derive(Debug, Clone)]
pub struct PingEvent {
    pub device: Device,
}

/// Battery plugin event.
#[derive(Debug, Clone)]
pub struct BatteryEvent {
    pub device: Device,
    /// Charge percentage, 0-100.
    pub charge: i32,
    pub is_charging: bool,
    /// Threshold crossing tag; [`BATTERY_THRESHOLD_LOW`] means low battery.
    pub threshold_event: i32,
}

impl BatteryEvent {
    pub fn is_low_threshold(&self) -> bool {
        self.threshold_event == BATTERY_THRESHOLD_LOW
    }
}

/// Mirrored remote notification event.
#[derive(Debug, Clone)]
pub struct MirrorEvent {
    pub device: Device,
    /// Remote-side notification id; stable across updates of one notification.
    pub remote_id: String,
    pub app_name: String,
    pub ticker: String,
    /// Remote side dismissed the notification.
    pub is_cancel: bool,
}

/// Media-control plugin request.
#[derive(Debug, Clone)]
pub struct MediaEvent {
    pub device: Device,
    /// Target player name; empty when only the player list is requested.
    pub player: String,
    /// Raw transport action tag; see [`MediaAction::parse`].
    pub action: String,
    pub request_player_list: bool,
    pub request_now_playing: bool,
    pub request_volume: bool,
    /// Requested volume as an integer percentage. Zero means "no change
    /// requested" on the wire; there is no way to distinguish it from an
    /// explicit request to mute.
    pub set_volume: i32,
}

/// Recognized media transport actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAction {
    Next,
    Previous,
    Pause,
    PlayPause,
    Stop,
    Play,
}

impl MediaAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Next" => Some(Self::Next),
            "Previous" => Some(Self::Previous),
            "Pause" => Some(Self::Pause),
            "PlayPause" => Some(Self::PlayPause),
            "Stop" => Some(Self::Stop),
            "Play" => Some(Self::Play),
            _ => None,
        }
    }

    /// MPRIS2 method name for this action.
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Next => "Next",
            Self::Previous => "Previous",
            Self::Pause => "Pause",
            Self::PlayPause => "PlayPause",
            Self::Stop => "Stop",
            Self::Play => "Play",
        }
    }
}

/// Reply body for a media-control request.
///
/// Only the fields the remote asked for are present; the engine relays the
/// body verbatim to the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NowPlayingReply {
    #[serde(skip_serializing_if = "Option::is_none", rename = "nowPlaying")]
    pub now_playing: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "isPlaying")]
    pub is_playing: Option<bool>,
    /// Track length in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    /// Playback position in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<i64>,
    /// Volume as an integer percentage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<i32>,
}

/// Phone call event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Ringing,
    Talking,
    MissedCall,
    /// Text message; handled separately from the call notification flow.
    Sms,
}

impl CallEvent {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ringing" => Some(Self::Ringing),
            "talking" => Some(Self::Talking),
            "missedCall" => Some(Self::MissedCall),
            "sms" => Some(Self::Sms),
            _ => None,
        }
    }
}

/// Telephony plugin event.
#[derive(Debug, Clone)]
pub struct TelephonyEvent {
    pub device: Device,
    /// Parsed call event; `None` for tags this client does not know.
    pub event: Option<CallEvent>,
    pub phone_number: String,
    /// Contact name resolved on the phone; often empty.
    pub contact_name: String,
    /// Message body for SMS events.
    pub message_body: String,
    /// The call ended or the notification was withdrawn remotely.
    pub is_cancel: bool,
}

impl TelephonyEvent {
    /// Display name for the remote party, falling back to the raw number.
    pub fn display_name(&self) -> &str {
        if self.contact_name.is_empty() {
            &self.phone_number
        } else {
            &self.contact_name
        }
    }
}

/// File-browse session offer from a device.
#[derive(Debug, Clone)]
pub struct SftpEvent {
    pub device: Device,
    pub ip: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Remote path to open once mounted.
    pub path: String,
}
