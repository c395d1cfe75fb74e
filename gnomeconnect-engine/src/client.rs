//! Session-bus client for the engine service.
//!
//! The engine exposes one object with membership and plugin signals; this
//! client fans each signal stream into its own channel so the shell can
//! multiplex them with `select!` without cross-source ordering guarantees.

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};
use zbus::{proxy, Connection};

use crate::device::{Device, DeviceType, KnownDevice};
use crate::error::EngineError;
use crate::events::{
    BatteryEvent, CallEvent, DeviceEvent, MediaEvent, MirrorEvent, NowPlayingReply, PingEvent,
    SftpEvent, TelephonyEvent as TelephonyEventData,
};
use crate::Result;

/// Well-known bus name of the engine service.
pub const ENGINE_BUS_NAME: &str = "org.gnomeconnect.Engine";

/// Engine object path.
pub const ENGINE_OBJECT_PATH: &str = "/org/gnomeconnect/Engine";

/// Per-source event channel capacity. Within one source events stay FIFO;
/// a full channel applies backpressure to the engine's signal pump only.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[proxy(
    interface = "org.gnomeconnect.Engine1",
    default_service = "org.gnomeconnect.Engine",
    default_path = "/org/gnomeconnect/Engine"
)]
trait Engine {
    /// Hand the engine its identity key material. The shell owns the key
    /// file; the engine never touches disk for it.
    fn load_identity(&self, private_key_pem: &str) -> zbus::Result<()>;

    /// Seed the engine with the persisted known-device list as (id, name).
    fn set_known_devices(&self, devices: &[(String, String)]) -> zbus::Result<()>;

    fn pair_device(&self, device_id: &str) -> zbus::Result<bool>;

    fn unpair_device(&self, device_id: &str) -> zbus::Result<bool>;

    /// Ask the device to start a file-browse (sftp) session.
    fn request_browse(&self, device_id: &str) -> zbus::Result<()>;

    /// Reply to a media-control request with the local player names.
    fn send_player_list(&self, device_id: &str, players: &[String]) -> zbus::Result<()>;

    /// Reply to a media-control request with a now-playing body (JSON,
    /// relayed verbatim to the device).
    fn send_now_playing(&self, device_id: &str, body: &str) -> zbus::Result<()>;

    // Membership signals.

    #[zbus(signal)]
    fn device_joined(
        &self,
        device_id: &str,
        name: &str,
        device_type: &str,
        paired: bool,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    fn device_pair_requested(&self, device_id: &str, name: &str, device_type: &str)
        -> zbus::Result<()>;

    #[zbus(signal)]
    fn device_paired(&self, device_id: &str, name: &str, device_type: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn device_unpaired(&self, device_id: &str, name: &str, device_type: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn device_left(&self, device_id: &str, name: &str, device_type: &str) -> zbus::Result<()>;

    // Plugin signals.

    #[zbus(signal)]
    fn ping_received(&self, device_id: &str, name: &str, device_type: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn battery_updated(
        &self,
        device_id: &str,
        name: &str,
        device_type: &str,
        charge: i32,
        is_charging: bool,
        threshold_event: i32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    #[allow(clippy::too_many_arguments)]
    fn notification_mirrored(
        &self,
        device_id: &str,
        name: &str,
        device_type: &str,
        remote_id: &str,
        app_name: &str,
        ticker: &str,
        is_cancel: bool,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    #[allow(clippy::too_many_arguments)]
    fn media_requested(
        &self,
        device_id: &str,
        name: &str,
        device_type: &str,
        player: &str,
        action: &str,
        request_player_list: bool,
        request_now_playing: bool,
        request_volume: bool,
        set_volume: i32,
    ) -> zbus::Result<()>;

    // Named to keep the generated signal type clear of the event struct.
    #[zbus(signal, name = "TelephonyEvent")]
    #[allow(clippy::too_many_arguments)]
    fn telephony_received(
        &self,
        device_id: &str,
        name: &str,
        device_type: &str,
        event: &str,
        phone_number: &str,
        contact_name: &str,
        message_body: &str,
        is_cancel: bool,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    #[allow(clippy::too_many_arguments)]
    fn sftp_ready(
        &self,
        device_id: &str,
        name: &str,
        device_type: &str,
        ip: &str,
        port: u16,
        user: &str,
        password: &str,
        path: &str,
    ) -> zbus::Result<()>;
}

/// Startup configuration handed to the engine right after connecting.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bus name override, mainly for talking to a test instance.
    pub bus_name: Option<String>,
    /// PEM-encoded identity key material.
    pub private_key_pem: String,
    /// Persisted known-device list.
    pub known_devices: Vec<KnownDevice>,
}

/// Receiving ends of the per-source event channels.
///
/// Each field preserves arrival order for its own source; nothing is implied
/// about ordering across fields.
pub struct EngineEvents {
    pub devices: mpsc::Receiver<DeviceEvent>,
    pub ping: mpsc::Receiver<PingEvent>,
    pub battery: mpsc::Receiver<BatteryEvent>,
    pub mirror: mpsc::Receiver<MirrorEvent>,
    pub media: mpsc::Receiver<MediaEvent>,
    pub telephony: mpsc::Receiver<TelephonyEventData>,
    pub sftp: mpsc::Receiver<SftpEvent>,
}

/// Handle for engine commands, cheap to clone.
#[derive(Clone)]
pub struct EngineClient {
    proxy: EngineProxy<'static>,
}

fn snapshot(id: &str, name: &str, device_type: &str, paired: bool) -> Device {
    Device {
        id: id.to_string(),
        name: name.to_string(),
        device_type: DeviceType::from_str(device_type),
        paired,
    }
}

impl EngineClient {
    /// Connect to the engine, upload identity and known devices, and start
    /// pumping signals into event channels.
    pub async fn connect(config: &EngineConfig) -> Result<(Self, EngineEvents)> {
        let connection = Connection::session().await?;

        let proxy = match &config.bus_name {
            Some(name) => {
                EngineProxy::builder(&connection)
                    .destination(name.clone())?
                    .build()
                    .await?
            }
            None => EngineProxy::new(&connection).await?,
        };

        proxy.load_identity(&config.private_key_pem).await?;

        let known: Vec<(String, String)> = config
            .known_devices
            .iter()
            .map(|d| (d.id.clone(), d.name.clone()))
            .collect();
        proxy.set_known_devices(&known).await?;

        info!(
            known_devices = known.len(),
            "connected to engine on session bus"
        );

        let events = Self::spawn_signal_pumps(&proxy).await?;

        Ok((Self { proxy }, events))
    }

    /// One pump task per signal stream; membership signals share a channel
    /// so their relative order is preserved.
    async fn spawn_signal_pumps(proxy: &EngineProxy<'static>) -> Result<EngineEvents> {
        let (device_tx, devices) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (ping_tx, ping) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (battery_tx, battery) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (mirror_tx, mirror) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (media_tx, media) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (telephony_tx, telephony) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (sftp_tx, sftp) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut joined = proxy.receive_device_joined().await?;
        let tx = device_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = joined.next().await {
                if let Ok(args) = signal.args() {
                    let device = snapshot(args.device_id, args.name, args.device_type, args.paired);
                    if tx.send(DeviceEvent::Joined(device)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut pair_requested = proxy.receive_device_pair_requested().await?;
        let tx = device_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = pair_requested.next().await {
                if let Ok(args) = signal.args() {
                    let device = snapshot(args.device_id, args.name, args.device_type, false);
                    if tx.send(DeviceEvent::PairRequested(device)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut paired = proxy.receive_device_paired().await?;
        let tx = device_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = paired.next().await {
                if let Ok(args) = signal.args() {
                    let device = snapshot(args.device_id, args.name, args.device_type, true);
                    if tx.send(DeviceEvent::Paired(device)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut unpaired = proxy.receive_device_unpaired().await?;
        let tx = device_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = unpaired.next().await {
                if let Ok(args) = signal.args() {
                    let device = snapshot(args.device_id, args.name, args.device_type, false);
                    if tx.send(DeviceEvent::Unpaired(device)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut left = proxy.receive_device_left().await?;
        let tx = device_tx;
        tokio::spawn(async move {
            while let Some(signal) = left.next().await {
                if let Ok(args) = signal.args() {
                    let device = snapshot(args.device_id, args.name, args.device_type, false);
                    if tx.send(DeviceEvent::Left(device)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut pings = proxy.receive_ping_received().await?;
        tokio::spawn(async move {
            while let Some(signal) = pings.next().await {
                if let Ok(args) = signal.args() {
                    let device = snapshot(args.device_id, args.name, args.device_type, false);
                    if ping_tx.send(PingEvent { device }).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut batteries = proxy.receive_battery_updated().await?;
        tokio::spawn(async move {
            while let Some(signal) = batteries.next().await {
                if let Ok(args) = signal.args() {
                    let event = BatteryEvent {
                        device: snapshot(args.device_id, args.name, args.device_type, false),
                        charge: args.charge,
                        is_charging: args.is_charging,
                        threshold_event: args.threshold_event,
                    };
                    if battery_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut mirrors = proxy.receive_notification_mirrored().await?;
        tokio::spawn(async move {
            while let Some(signal) = mirrors.next().await {
                if let Ok(args) = signal.args() {
                    let event = MirrorEvent {
                        device: snapshot(args.device_id, args.name, args.device_type, false),
                        remote_id: args.remote_id.to_string(),
                        app_name: args.app_name.to_string(),
                        ticker: args.ticker.to_string(),
                        is_cancel: args.is_cancel,
                    };
                    if mirror_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut media_requests = proxy.receive_media_requested().await?;
        tokio::spawn(async move {
            while let Some(signal) = media_requests.next().await {
                if let Ok(args) = signal.args() {
                    let event = MediaEvent {
                        device: snapshot(args.device_id, args.name, args.device_type, false),
                        player: args.player.to_string(),
                        action: args.action.to_string(),
                        request_player_list: args.request_player_list,
                        request_now_playing: args.request_now_playing,
                        request_volume: args.request_volume,
                        set_volume: args.set_volume,
                    };
                    if media_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut calls = proxy.receive_telephony_received().await?;
        tokio::spawn(async move {
            while let Some(signal) = calls.next().await {
                if let Ok(args) = signal.args() {
                    if CallEvent::parse(args.event).is_none() && !args.is_cancel {
                        debug!(event = args.event, "dropping unknown telephony event");
                    }
                    let event = TelephonyEventData {
                        device: snapshot(args.device_id, args.name, args.device_type, false),
                        event: CallEvent::parse(args.event),
                        phone_number: args.phone_number.to_string(),
                        contact_name: args.contact_name.to_string(),
                        message_body: args.message_body.to_string(),
                        is_cancel: args.is_cancel,
                    };
                    if telephony_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut sftp_offers = proxy.receive_sftp_ready().await?;
        tokio::spawn(async move {
            while let Some(signal) = sftp_offers.next().await {
                if let Ok(args) = signal.args() {
                    let event = SftpEvent {
                        device: snapshot(args.device_id, args.name, args.device_type, false),
                        ip: args.ip.to_string(),
                        port: args.port,
                        user: args.user.to_string(),
                        password: args.password.to_string(),
                        path: args.path.to_string(),
                    };
                    if sftp_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(EngineEvents {
            devices,
            ping,
            battery,
            mirror,
            media,
            telephony,
            sftp,
        })
    }

    pub async fn pair_device(&self, device_id: &str) -> Result<bool> {
        debug!(device_id, "requesting pairing");
        Ok(self.proxy.pair_device(device_id).await?)
    }

    pub async fn unpair_device(&self, device_id: &str) -> Result<bool> {
        debug!(device_id, "requesting unpair");
        Ok(self.proxy.unpair_device(device_id).await?)
    }

    pub async fn request_browse(&self, device_id: &str) -> Result<()> {
        debug!(device_id, "requesting file browse session");
        Ok(self.proxy.request_browse(device_id).await?)
    }

    pub async fn send_player_list(&self, device_id: &str, players: &[String]) -> Result<()> {
        debug!(device_id, count = players.len(), "sending player list");
        Ok(self.proxy.send_player_list(device_id, players).await?)
    }

    pub async fn send_now_playing(&self, device_id: &str, reply: &NowPlayingReply) -> Result<()> {
        let body = serde_json::to_string(reply).map_err(EngineError::Encode)?;
        debug!(device_id, %body, "sending now-playing reply");
        Ok(self.proxy.send_now_playing(device_id, &body).await?)
    }
}
