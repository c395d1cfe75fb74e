//! The two event dispatch loops.
//!
//! All engine traffic is split between two single-owner loops, each with its
//! own notification handle table: [`PluginDispatcher`] handles plugin events
//! (ping, battery, mirrored notifications, media control, telephony, sftp),
//! [`DeviceDispatcher`] handles membership, notification feedback and
//! presence reconciliation.
//!
//! Events from one source are processed in arrival order. Nothing is
//! promised about ordering across sources; `select!` polls branches in
//! random order on purpose.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use gnomeconnect_engine::{
    BatteryEvent, CallEvent, Device, DeviceEvent, EngineClient, MediaAction, MediaEvent,
    MirrorEvent, NowPlayingReply, PingEvent, SftpEvent, TelephonyEvent,
};

use crate::media::MediaBridge;
use crate::notify::{Notification, NotificationBuilder, NotificationSink, NotifyFeedback};
use crate::registry::{DeviceRegistry, HandleKey, HandleTable};
use crate::sftp::SftpCommands;
use crate::store;

/// Commands the dispatchers send back to the engine.
#[async_trait]
pub trait EngineCommands: Send + Sync {
    async fn pair_device(&self, device_id: &str) -> Result<()>;
    async fn unpair_device(&self, device_id: &str) -> Result<()>;
    async fn request_browse(&self, device_id: &str) -> Result<()>;
    async fn send_player_list(&self, device_id: &str, players: &[String]) -> Result<()>;
    async fn send_now_playing(&self, device_id: &str, reply: &NowPlayingReply) -> Result<()>;
}

#[async_trait]
impl EngineCommands for EngineClient {
    async fn pair_device(&self, device_id: &str) -> Result<()> {
        EngineClient::pair_device(self, device_id).await?;
        Ok(())
    }

    async fn unpair_device(&self, device_id: &str) -> Result<()> {
        EngineClient::unpair_device(self, device_id).await?;
        Ok(())
    }

    async fn request_browse(&self, device_id: &str) -> Result<()> {
        EngineClient::request_browse(self, device_id).await?;
        Ok(())
    }

    async fn send_player_list(&self, device_id: &str, players: &[String]) -> Result<()> {
        EngineClient::send_player_list(self, device_id, players).await?;
        Ok(())
    }

    async fn send_now_playing(&self, device_id: &str, reply: &NowPlayingReply) -> Result<()> {
        EngineClient::send_now_playing(self, device_id, reply).await?;
        Ok(())
    }
}

/// Run a call to an external surface under the configured time budget.
///
/// A failed or timed-out call is logged and swallowed; the caller's
/// bookkeeping stays as it was.
async fn bounded<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Option<T> {
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(what, %err, "external call failed");
            None
        }
        Err(_) => {
            warn!(what, budget_ms = limit.as_millis() as u64, "external call timed out");
            None
        }
    }
}

fn device_notification(device: &Device, summary: impl Into<String>) -> NotificationBuilder {
    NotificationBuilder::new(summary).icon(device.icon_name())
}

/// Receiving ends the plugin loop consumes.
pub struct PluginStreams {
    pub ping: mpsc::Receiver<PingEvent>,
    pub battery: mpsc::Receiver<BatteryEvent>,
    pub mirror: mpsc::Receiver<MirrorEvent>,
    pub media: mpsc::Receiver<MediaEvent>,
    pub telephony: mpsc::Receiver<TelephonyEvent>,
    pub sftp: mpsc::Receiver<SftpEvent>,
    /// Handles the notification server reports closed.
    pub closed: mpsc::Receiver<u32>,
}

/// Plugin event loop: owns the handle table for mirrored, battery and call
/// notifications.
pub struct PluginDispatcher<S, B, E> {
    sink: Arc<S>,
    media: Arc<B>,
    engine: Arc<E>,
    sftp: SftpCommands,
    budget: Duration,
    handles: HandleTable,
}

impl<S, B, E> PluginDispatcher<S, B, E>
where
    S: NotificationSink,
    B: MediaBridge,
    E: EngineCommands,
{
    pub fn new(
        sink: Arc<S>,
        media: Arc<B>,
        engine: Arc<E>,
        sftp: SftpCommands,
        budget: Duration,
    ) -> Self {
        Self {
            sink,
            media,
            engine,
            sftp,
            budget,
            handles: HandleTable::new(),
        }
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub async fn run(mut self, mut streams: PluginStreams, mut shutdown: watch::Receiver<bool>) {
        info!("plugin dispatcher running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(event) = streams.ping.recv() => self.handle_ping(event).await,
                Some(event) = streams.battery.recv() => self.handle_battery(event).await,
                Some(event) = streams.mirror.recv() => self.handle_mirror(event).await,
                Some(event) = streams.media.recv() => self.handle_media(event).await,
                Some(event) = streams.telephony.recv() => self.handle_telephony(event).await,
                Some(event) = streams.sftp.recv() => self.handle_sftp(event).await,
                Some(handle) = streams.closed.recv() => self.handle_closed(handle),
                else => break,
            }
        }
        self.close_all().await;
        info!("plugin dispatcher stopped");
    }

    pub async fn handle_ping(&mut self, event: PingEvent) {
        info!(device = %event.device.name, "ping");
        let note = device_notification(&event.device, format!("Ping from {}", event.device.name))
            .build();
        bounded(self.budget, "notify ping", self.sink.send(note)).await;
    }

    /// Low-threshold reports raise one rotating bubble per device; the
    /// start of charging withdraws it.
    pub async fn handle_battery(&mut self, event: BatteryEvent) {
        debug!(device = %event.device.name, charge = event.charge,
            charging = event.is_charging, "battery");
        let key = HandleKey::Battery(event.device.id.clone());

        if event.is_low_threshold() {
            let mut builder =
                NotificationBuilder::new(format!("{} has low battery", event.device.name))
                    .icon("battery-caution");
            if let Some(existing) = self.handles.get(&key) {
                builder = builder.replaces(existing);
            }
            if let Some(handle) =
                bounded(self.budget, "notify battery", self.sink.send(builder.build())).await
            {
                self.handles.insert(key.clone(), handle);
            }
        }

        if event.is_charging {
            if let Some(handle) = self.handles.remove(&key) {
                bounded(self.budget, "close battery", self.sink.close(handle)).await;
            }
        }
    }

    /// Mirrored notifications key on (device, remote id): updates replace
    /// the visible bubble, cancels withdraw it, cancels for an unknown id
    /// are ignored.
    pub async fn handle_mirror(&mut self, event: MirrorEvent) {
        debug!(device = %event.device.name, remote_id = %event.remote_id,
            cancel = event.is_cancel, "mirrored notification");
        let key = HandleKey::mirror(&event.device.id, &event.remote_id);

        if event.is_cancel {
            if let Some(handle) = self.handles.remove(&key) {
                bounded(self.budget, "close mirror", self.sink.close(handle)).await;
            }
            return;
        }

        let mut builder = device_notification(
            &event.device,
            format!("Notification from {} on {}", event.app_name, event.device.name),
        )
        .body(&event.ticker);
        if let Some(existing) = self.handles.get(&key) {
            builder = builder.replaces(existing);
        }

        if let Some(handle) =
            bounded(self.budget, "notify mirror", self.sink.send(builder.build())).await
        {
            self.handles.insert(key, handle);
        }
    }

    /// Media control requests. The now-playing part of the reply is driven
    /// solely by a recognized transport action; the incoming request flag is
    /// ignored. A volume write of zero means no volume change was requested.
    pub async fn handle_media(&mut self, event: MediaEvent) {
        debug!(device = %event.device.name, player = %event.player,
            action = %event.action, "media request");

        if event.request_player_list {
            match bounded(self.budget, "list players", self.media.list_players()).await {
                Some(players) => {
                    bounded(
                        self.budget,
                        "send player list",
                        self.engine.send_player_list(&event.device.id, &players),
                    )
                    .await;
                }
                None => return,
            }
        }

        if event.player.is_empty() {
            return;
        }

        let mut want_now_playing = false;
        if let Some(action) = MediaAction::parse(&event.action) {
            if bounded(
                self.budget,
                "transport action",
                self.media.transport(&event.player, action),
            )
            .await
            .is_some()
            {
                want_now_playing = true;
            }
        }

        let mut want_volume = event.request_volume;
        if event.set_volume != 0 {
            if bounded(
                self.budget,
                "set volume",
                self.media.set_volume(&event.player, event.set_volume),
            )
            .await
            .is_some()
            {
                want_volume = true;
            }
        }

        if !want_now_playing && !want_volume {
            return;
        }

        let mut reply = NowPlayingReply::default();
        if want_now_playing {
            if let Some(snapshot) =
                bounded(self.budget, "now playing", self.media.now_playing(&event.player)).await
            {
                reply.now_playing = Some(snapshot.title);
                reply.is_playing = Some(snapshot.is_playing);
                reply.length = Some(snapshot.length_ms);
                reply.pos = Some(snapshot.position_ms);
            }
        }
        if want_volume {
            if let Some(volume) =
                bounded(self.budget, "get volume", self.media.volume(&event.player)).await
            {
                reply.volume = Some(volume);
            }
        }

        if reply == NowPlayingReply::default() {
            return;
        }
        bounded(
            self.budget,
            "send now playing",
            self.engine.send_now_playing(&event.device.id, &reply),
        )
        .await;
    }

    /// SMS arrives as a transient bubble; call state rotates through one
    /// bubble per device, withdrawn on cancel.
    pub async fn handle_telephony(&mut self, event: TelephonyEvent) {
        debug!(device = %event.device.name, event = ?event.event,
            cancel = event.is_cancel, "telephony");
        let who = event.display_name().to_string();
        let key = HandleKey::Call(event.device.id.clone());

        if event.event == Some(CallEvent::Sms) {
            let note = device_notification(
                &event.device,
                format!("SMS from {} on {}", who, event.device.name),
            )
            .body(&event.message_body)
            .category("im.received")
            .build();
            bounded(self.budget, "notify sms", self.sink.send(note)).await;
            return;
        }

        if event.is_cancel {
            if let Some(handle) = self.handles.remove(&key) {
                bounded(self.budget, "close call", self.sink.close(handle)).await;
            }
            return;
        }

        let (icon, summary) = match event.event {
            Some(CallEvent::Ringing) => {
                ("call-start", format!("Call from {} on {}", who, event.device.name))
            }
            Some(CallEvent::Talking) => {
                ("call-start", format!("Calling {} on {}", who, event.device.name))
            }
            Some(CallEvent::MissedCall) => (
                "call-stop",
                format!("Missed call from {} on {}", who, event.device.name),
            ),
            Some(CallEvent::Sms) | None => return,
        };

        let mut builder = NotificationBuilder::new(summary)
            .icon(icon)
            .category("im")
            .timeout(0);
        if let Some(existing) = self.handles.get(&key) {
            builder = builder.replaces(existing);
        }

        if let Some(handle) =
            bounded(self.budget, "notify call", self.sink.send(builder.build())).await
        {
            self.handles.insert(key, handle);
        }
    }

    pub async fn handle_sftp(&mut self, event: SftpEvent) {
        info!(device = %event.device.name, "sftp share ready");
        if let Err(err) = self.sftp.browse(&event).await {
            warn!(device = %event.device.name, %err, "failed to open sftp share");
        }
    }

    /// The server closed one of our bubbles; clear its slot so the next
    /// event for that concern gets a fresh one.
    pub fn handle_closed(&mut self, handle: u32) {
        if let Some(key) = self.handles.remove_handle(handle) {
            debug!(handle, ?key, "notification dismissed");
        }
    }

    pub async fn close_all(&mut self) {
        for handle in self.handles.drain_handles() {
            bounded(self.budget, "close on shutdown", self.sink.close(handle)).await;
        }
    }
}

/// Receiving ends the membership loop consumes.
pub struct DeviceStreams {
    pub devices: mpsc::Receiver<DeviceEvent>,
    pub feedback: mpsc::Receiver<NotifyFeedback>,
    /// Presence reconciliation requests (SIGUSR1).
    pub nudge: mpsc::Receiver<()>,
}

/// Membership loop: owns the presence handle table, the device registry
/// and the persisted known-device list.
pub struct DeviceDispatcher<S, E> {
    sink: Arc<S>,
    engine: Arc<E>,
    registry: DeviceRegistry,
    handles: HandleTable,
    budget: Duration,
    data_dir: PathBuf,
    ui_feed: Option<mpsc::Sender<Vec<Device>>>,
}

impl<S, E> DeviceDispatcher<S, E>
where
    S: NotificationSink,
    E: EngineCommands,
{
    pub fn new(
        sink: Arc<S>,
        engine: Arc<E>,
        registry: DeviceRegistry,
        budget: Duration,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            sink,
            engine,
            registry,
            handles: HandleTable::new(),
            budget,
            data_dir,
            ui_feed: None,
        }
    }

    /// Feed registry snapshots to the device list window after each
    /// membership change.
    pub fn with_ui_feed(mut self, feed: mpsc::Sender<Vec<Device>>) -> Self {
        self.ui_feed = Some(feed);
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub async fn run(mut self, mut streams: DeviceStreams, mut shutdown: watch::Receiver<bool>) {
        info!("device dispatcher running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(event) = streams.devices.recv() => self.handle_device_event(event).await,
                Some(feedback) = streams.feedback.recv() => self.handle_feedback(feedback).await,
                Some(()) = streams.nudge.recv() => self.handle_nudge().await,
                else => break,
            }
        }
        self.close_all().await;
        info!("device dispatcher stopped");
    }

    pub async fn handle_device_event(&mut self, event: DeviceEvent) {
        if event.device().id.is_empty() {
            return;
        }

        match event {
            DeviceEvent::Joined(device) => {
                info!(device = %device.name, paired = device.paired, "device joined");
                self.registry.upsert(device.clone());
                if device.paired {
                    self.notify_connected(&device).await;
                } else {
                    self.notify_available(&device).await;
                }
            }
            DeviceEvent::PairRequested(device) => {
                info!(device = %device.name, "pair requested");
                self.registry.upsert(device.clone());
                self.close_presence(&device.id).await;
                self.notify_pair_request(&device).await;
            }
            DeviceEvent::Paired(device) => {
                info!(device = %device.name, "paired");
                self.registry.upsert(device.clone());
                if self.registry.mark_known(&device) {
                    self.persist_known();
                }
                self.close_presence(&device.id).await;
                self.notify_connected(&device).await;
            }
            DeviceEvent::Unpaired(device) => {
                info!(device = %device.name, "unpaired");
                self.registry.set_paired(&device.id, false);
                if self.registry.forget_known(&device.id) {
                    self.persist_known();
                }
                self.close_presence(&device.id).await;
            }
            DeviceEvent::Left(device) => {
                info!(device = %device.name, "device left");
                self.close_presence(&device.id).await;
                self.registry.remove(&device.id);
            }
        }

        if let Some(feed) = &self.ui_feed {
            let snapshot: Vec<Device> = self.registry.present().cloned().collect();
            // Stale snapshots are fine to drop; a newer one follows.
            let _ = feed.try_send(snapshot);
        }
    }

    pub async fn handle_feedback(&mut self, feedback: NotifyFeedback) {
        match feedback {
            NotifyFeedback::Action { handle, action } => {
                let Some(HandleKey::Presence(device_id)) = self.handles.key_for_handle(handle)
                else {
                    return;
                };
                let Some(device) = self.registry.get(device_id).cloned() else {
                    return;
                };

                info!(device = %device.name, %action, "notification action");
                let result = match action.as_str() {
                    "pair" => {
                        bounded(self.budget, "pair", self.engine.pair_device(&device.id)).await
                    }
                    "unpair" => {
                        bounded(self.budget, "unpair", self.engine.unpair_device(&device.id)).await
                    }
                    "browse" => {
                        bounded(self.budget, "browse", self.engine.request_browse(&device.id))
                            .await
                    }
                    _ => {
                        debug!(%action, "ignoring unknown action");
                        return;
                    }
                };
                if result.is_none() {
                    warn!(device = %device.name, %action, "engine command did not complete");
                }
            }
            NotifyFeedback::Closed { handle } => {
                if let Some(key) = self.handles.remove_handle(handle) {
                    debug!(handle, ?key, "presence notification dismissed");
                }
            }
        }
    }

    /// Re-issue presence notifications for paired devices whose bubble has
    /// been dismissed. Triggered by SIGUSR1, usually from a second launch.
    pub async fn handle_nudge(&mut self) {
        info!("reconciling presence notifications");
        for device in self.registry.paired_present() {
            if !self.handles.contains(&HandleKey::Presence(device.id.clone())) {
                self.notify_connected(&device).await;
            }
        }
    }

    async fn notify_available(&mut self, device: &Device) {
        let note = device_notification(device, &device.name)
            .body("New device available")
            .category("device")
            .action("pair", "Pair device")
            .build();
        self.issue_presence(&device.id, note).await;
    }

    async fn notify_pair_request(&mut self, device: &Device) {
        let note = device_notification(device, &device.name)
            .body("New pair request")
            .category("device")
            .timeout(0)
            .action("pair", "Accept")
            .action("unpair", "Reject")
            .build();
        self.issue_presence(&device.id, note).await;
    }

    async fn notify_connected(&mut self, device: &Device) {
        let note = device_notification(device, &device.name)
            .body("Device connected")
            .category("device.added")
            .resident()
            .action("browse", "Browse")
            .build();
        self.issue_presence(&device.id, note).await;
    }

    /// Send a presence notification, replacing whatever bubble the device
    /// currently has.
    async fn issue_presence(&mut self, device_id: &str, mut note: Notification) {
        let key = HandleKey::Presence(device_id.to_string());
        if let Some(existing) = self.handles.get(&key) {
            note.replaces_id = existing;
        }
        if let Some(handle) = bounded(self.budget, "notify presence", self.sink.send(note)).await {
            self.handles.insert(key, handle);
        }
    }

    async fn close_presence(&mut self, device_id: &str) {
        let key = HandleKey::Presence(device_id.to_string());
        if let Some(handle) = self.handles.remove(&key) {
            bounded(self.budget, "close presence", self.sink.close(handle)).await;
        }
    }

    fn persist_known(&self) {
        if let Err(err) = store::save_known_devices(&self.data_dir, self.registry.known()) {
            warn!(%err, "cannot save known devices");
        }
    }

    pub async fn close_all(&mut self) {
        for handle in self.handles.drain_handles() {
            bounded(self.budget, "close on shutdown", self.sink.close(handle)).await;
        }
    }
}
