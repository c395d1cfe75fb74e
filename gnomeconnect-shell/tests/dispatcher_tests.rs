//! End-to-end dispatcher behavior against mock desktop surfaces.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use gnomeconnect_engine::{
    BatteryEvent, CallEvent, Device, DeviceEvent, DeviceType, KnownDevice, MediaAction,
    MediaEvent, MirrorEvent, NowPlayingReply, PingEvent, SftpEvent, TelephonyEvent,
    BATTERY_THRESHOLD_LOW,
};
use gnomeconnect_shell::dispatch::{
    DeviceDispatcher, DeviceStreams, EngineCommands, PluginDispatcher, PluginStreams,
};
use gnomeconnect_shell::media::{MediaBridge, NowPlaying};
use gnomeconnect_shell::notify::{Notification, NotificationSink, NotifyFeedback};
use gnomeconnect_shell::registry::{DeviceRegistry, HandleKey};
use gnomeconnect_shell::sftp::SftpCommands;
use gnomeconnect_shell::store;

#[derive(Default)]
struct SinkState {
    next_handle: u32,
    sent: Vec<Notification>,
    handles: Vec<u32>,
    closed: Vec<u32>,
    fail: bool,
}

#[derive(Default)]
struct MockSink {
    state: Mutex<SinkState>,
}

impl MockSink {
    fn sent(&self) -> Vec<Notification> {
        self.state.lock().unwrap().sent.clone()
    }

    fn handles(&self) -> Vec<u32> {
        self.state.lock().unwrap().handles.clone()
    }

    fn closed(&self) -> Vec<u32> {
        self.state.lock().unwrap().closed.clone()
    }

    fn set_fail(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }
}

#[async_trait]
impl NotificationSink for MockSink {
    async fn send(&self, note: Notification) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            bail!("notification server unreachable");
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.sent.push(note);
        state.handles.push(handle);
        Ok(handle)
    }

    async fn close(&self, handle: u32) -> Result<()> {
        self.state.lock().unwrap().closed.push(handle);
        Ok(())
    }
}

#[derive(Default)]
struct BridgeState {
    transport: Vec<(String, MediaAction)>,
    volume_writes: Vec<(String, i32)>,
}

struct MockBridge {
    players: Vec<String>,
    now: NowPlaying,
    volume: i32,
    state: Mutex<BridgeState>,
}

impl Default for MockBridge {
    fn default() -> Self {
        Self {
            players: vec!["spotify".to_string()],
            now: NowPlaying {
                title: "Song".to_string(),
                is_playing: true,
                length_ms: 180_000,
                position_ms: 42_000,
            },
            volume: 70,
            state: Mutex::default(),
        }
    }
}

#[async_trait]
impl MediaBridge for MockBridge {
    async fn list_players(&self) -> Result<Vec<String>> {
        Ok(self.players.clone())
    }

    async fn transport(&self, player: &str, action: MediaAction) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .transport
            .push((player.to_string(), action));
        Ok(())
    }

    async fn now_playing(&self, _player: &str) -> Result<NowPlaying> {
        Ok(self.now.clone())
    }

    async fn volume(&self, _player: &str) -> Result<i32> {
        Ok(self.volume)
    }

    async fn set_volume(&self, player: &str, percent: i32) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .volume_writes
            .push((player.to_string(), percent));
        Ok(())
    }
}

#[derive(Default)]
struct EngineState {
    paired: Vec<String>,
    unpaired: Vec<String>,
    browsed: Vec<String>,
    player_lists: Vec<(String, Vec<String>)>,
    replies: Vec<(String, NowPlayingReply)>,
}

#[derive(Default)]
struct MockEngine {
    state: Mutex<EngineState>,
}

#[async_trait]
impl EngineCommands for MockEngine {
    async fn pair_device(&self, device_id: &str) -> Result<()> {
        self.state.lock().unwrap().paired.push(device_id.to_string());
        Ok(())
    }

    async fn unpair_device(&self, device_id: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .unpaired
            .push(device_id.to_string());
        Ok(())
    }

    async fn request_browse(&self, device_id: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .browsed
            .push(device_id.to_string());
        Ok(())
    }

    async fn send_player_list(&self, device_id: &str, players: &[String]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .player_lists
            .push((device_id.to_string(), players.to_vec()));
        Ok(())
    }

    async fn send_now_playing(&self, device_id: &str, reply: &NowPlayingReply) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .replies
            .push((device_id.to_string(), reply.clone()));
        Ok(())
    }
}

fn phone() -> Device {
    Device::new("dev-1", "Pixel", DeviceType::Phone)
}

fn sftp_commands() -> SftpCommands {
    SftpCommands {
        mount_command: "true".to_string(),
        open_command: "true".to_string(),
        mount_timeout: Duration::from_secs(1),
    }
}

type TestPlugin = PluginDispatcher<MockSink, MockBridge, MockEngine>;
type TestDevices = DeviceDispatcher<MockSink, MockEngine>;

fn plugin_dispatcher() -> (TestPlugin, Arc<MockSink>, Arc<MockBridge>, Arc<MockEngine>) {
    let sink = Arc::new(MockSink::default());
    let bridge = Arc::new(MockBridge::default());
    let engine = Arc::new(MockEngine::default());
    let dispatcher = PluginDispatcher::new(
        sink.clone(),
        bridge.clone(),
        engine.clone(),
        sftp_commands(),
        Duration::from_secs(1),
    );
    (dispatcher, sink, bridge, engine)
}

fn device_dispatcher(
    data_dir: &Path,
    known: Vec<KnownDevice>,
) -> (TestDevices, Arc<MockSink>, Arc<MockEngine>) {
    let sink = Arc::new(MockSink::default());
    let engine = Arc::new(MockEngine::default());
    let dispatcher = DeviceDispatcher::new(
        sink.clone(),
        engine.clone(),
        DeviceRegistry::new(known),
        Duration::from_secs(1),
        data_dir.to_path_buf(),
    );
    (dispatcher, sink, engine)
}

fn mirror(remote_id: &str, ticker: &str, is_cancel: bool) -> MirrorEvent {
    MirrorEvent {
        device: phone(),
        remote_id: remote_id.to_string(),
        app_name: "Mail".to_string(),
        ticker: ticker.to_string(),
        is_cancel,
    }
}

#[tokio::test]
async fn mirror_update_replaces_visible_bubble() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher.handle_mirror(mirror("n-1", "first", false)).await;
    dispatcher.handle_mirror(mirror("n-1", "second", false)).await;

    let sent = sink.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].replaces_id, 0);
    assert_eq!(sent[1].replaces_id, sink.handles()[0]);
    assert_eq!(sent[1].body, "second");
    assert_eq!(sent[1].summary, "Notification from Mail on Pixel");
    assert_eq!(dispatcher.handles().len(), 1);
}

#[tokio::test]
async fn mirror_cancel_withdraws_bubble() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher.handle_mirror(mirror("n-1", "hello", false)).await;
    let handle = sink.handles()[0];
    dispatcher.handle_mirror(mirror("n-1", "", true)).await;

    assert_eq!(sink.closed(), vec![handle]);
    assert!(dispatcher.handles().is_empty());
}

#[tokio::test]
async fn cancel_for_unknown_remote_id_is_ignored() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher.handle_mirror(mirror("never-seen", "", true)).await;

    assert!(sink.sent().is_empty());
    assert!(sink.closed().is_empty());
}

#[tokio::test]
async fn failed_send_leaves_slot_unchanged() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher.handle_mirror(mirror("n-1", "first", false)).await;
    let handle = sink.handles()[0];

    sink.set_fail(true);
    dispatcher.handle_mirror(mirror("n-1", "second", false)).await;

    let key = HandleKey::mirror("dev-1", "n-1");
    assert_eq!(dispatcher.handles().get(&key), Some(handle));

    // The next successful update still replaces the old bubble.
    sink.set_fail(false);
    dispatcher.handle_mirror(mirror("n-1", "third", false)).await;
    let sent = sink.sent();
    assert_eq!(sent.last().unwrap().replaces_id, handle);
}

#[tokio::test]
async fn dismissed_bubble_gets_a_fresh_handle() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher.handle_mirror(mirror("n-1", "first", false)).await;
    let handle = sink.handles()[0];

    dispatcher.handle_closed(handle);
    assert!(dispatcher.handles().is_empty());

    dispatcher.handle_mirror(mirror("n-1", "second", false)).await;
    assert_eq!(sink.sent()[1].replaces_id, 0);
}

fn battery(threshold_event: i32, is_charging: bool) -> BatteryEvent {
    BatteryEvent {
        device: phone(),
        charge: 8,
        is_charging,
        threshold_event,
    }
}

#[tokio::test]
async fn low_battery_raises_and_charging_withdraws() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher.handle_battery(battery(BATTERY_THRESHOLD_LOW, false)).await;
    let sent = sink.sent();
    assert_eq!(sent[0].summary, "Pixel has low battery");
    assert_eq!(sent[0].icon, "battery-caution");

    dispatcher.handle_battery(battery(0, true)).await;
    assert_eq!(sink.closed(), vec![sink.handles()[0]]);
    assert!(dispatcher.handles().is_empty());
}

#[tokio::test]
async fn repeated_low_battery_replaces_existing_bubble() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher.handle_battery(battery(BATTERY_THRESHOLD_LOW, false)).await;
    dispatcher.handle_battery(battery(BATTERY_THRESHOLD_LOW, false)).await;

    let sent = sink.sent();
    assert_eq!(sent[1].replaces_id, sink.handles()[0]);
    assert_eq!(dispatcher.handles().len(), 1);
}

#[tokio::test]
async fn charging_report_without_low_bubble_is_a_no_op() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher.handle_battery(battery(0, true)).await;

    assert!(sink.sent().is_empty());
    assert!(sink.closed().is_empty());
}

#[tokio::test]
async fn ping_is_transient() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher.handle_ping(PingEvent { device: phone() }).await;

    let sent = sink.sent();
    assert_eq!(sent[0].summary, "Ping from Pixel");
    assert_eq!(sent[0].icon, "phone");
    assert!(dispatcher.handles().is_empty());
}

fn telephony(event: Option<CallEvent>, is_cancel: bool) -> TelephonyEvent {
    TelephonyEvent {
        device: phone(),
        event,
        phone_number: "+155501".to_string(),
        contact_name: String::new(),
        message_body: "see you at 8".to_string(),
        is_cancel,
    }
}

#[tokio::test]
async fn call_states_rotate_one_bubble() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher
        .handle_telephony(telephony(Some(CallEvent::Ringing), false))
        .await;
    dispatcher
        .handle_telephony(telephony(Some(CallEvent::MissedCall), false))
        .await;

    let sent = sink.sent();
    assert_eq!(sent[0].summary, "Call from +155501 on Pixel");
    assert_eq!(sent[0].icon, "call-start");
    assert_eq!(sent[0].category.as_deref(), Some("im"));
    assert_eq!(sent[1].summary, "Missed call from +155501 on Pixel");
    assert_eq!(sent[1].icon, "call-stop");
    assert_eq!(sent[1].replaces_id, sink.handles()[0]);

    dispatcher.handle_telephony(telephony(None, true)).await;
    assert_eq!(sink.closed(), vec![sink.handles()[1]]);
}

#[tokio::test]
async fn contact_name_wins_over_number() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    let mut event = telephony(Some(CallEvent::Talking), false);
    event.contact_name = "Alice".to_string();
    dispatcher.handle_telephony(event).await;

    assert_eq!(sink.sent()[0].summary, "Calling Alice on Pixel");
}

#[tokio::test]
async fn call_cancel_without_call_is_ignored() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher.handle_telephony(telephony(None, true)).await;

    assert!(sink.sent().is_empty());
    assert!(sink.closed().is_empty());
}

#[tokio::test]
async fn sms_is_transient_and_categorized() {
    let (mut dispatcher, sink, _, _) = plugin_dispatcher();

    dispatcher
        .handle_telephony(telephony(Some(CallEvent::Sms), false))
        .await;

    let sent = sink.sent();
    assert_eq!(sent[0].summary, "SMS from +155501 on Pixel");
    assert_eq!(sent[0].body, "see you at 8");
    assert_eq!(sent[0].category.as_deref(), Some("im.received"));
    assert!(dispatcher.handles().is_empty());
}

fn media_event() -> MediaEvent {
    MediaEvent {
        device: phone(),
        player: String::new(),
        action: String::new(),
        request_player_list: false,
        request_now_playing: false,
        request_volume: false,
        set_volume: 0,
    }
}

#[tokio::test]
async fn player_list_request_answers_without_player_state() {
    let (mut dispatcher, _, _, engine) = plugin_dispatcher();

    let mut event = media_event();
    event.request_player_list = true;
    dispatcher.handle_media(event).await;

    let state = engine.state.lock().unwrap();
    assert_eq!(
        state.player_lists,
        vec![("dev-1".to_string(), vec!["spotify".to_string()])]
    );
    assert!(state.replies.is_empty());
}

#[tokio::test]
async fn transport_action_implies_now_playing_reply() {
    let (mut dispatcher, _, bridge, engine) = plugin_dispatcher();

    let mut event = media_event();
    event.player = "spotify".to_string();
    event.action = "PlayPause".to_string();
    dispatcher.handle_media(event).await;

    assert_eq!(
        bridge.state.lock().unwrap().transport,
        vec![("spotify".to_string(), MediaAction::PlayPause)]
    );

    let state = engine.state.lock().unwrap();
    assert_eq!(state.replies.len(), 1);
    let (device_id, reply) = &state.replies[0];
    assert_eq!(device_id, "dev-1");
    assert_eq!(reply.now_playing.as_deref(), Some("Song"));
    assert_eq!(reply.is_playing, Some(true));
    assert_eq!(reply.length, Some(180_000));
    assert_eq!(reply.pos, Some(42_000));
    assert_eq!(reply.volume, None);
}

#[tokio::test]
async fn unrecognized_action_suppresses_now_playing_reply() {
    let (mut dispatcher, _, bridge, engine) = plugin_dispatcher();

    let mut event = media_event();
    event.player = "spotify".to_string();
    event.action = "Rewind".to_string();
    event.request_now_playing = true;
    dispatcher.handle_media(event).await;

    assert!(bridge.state.lock().unwrap().transport.is_empty());
    assert!(engine.state.lock().unwrap().replies.is_empty());
}

#[tokio::test]
async fn zero_volume_means_no_volume_change() {
    let (mut dispatcher, _, bridge, engine) = plugin_dispatcher();

    let mut event = media_event();
    event.player = "spotify".to_string();
    dispatcher.handle_media(event).await;

    assert!(bridge.state.lock().unwrap().volume_writes.is_empty());
    assert!(engine.state.lock().unwrap().replies.is_empty());
}

#[tokio::test]
async fn volume_write_is_echoed_back() {
    let (mut dispatcher, _, bridge, engine) = plugin_dispatcher();

    let mut event = media_event();
    event.player = "spotify".to_string();
    event.set_volume = 55;
    dispatcher.handle_media(event).await;

    assert_eq!(
        bridge.state.lock().unwrap().volume_writes,
        vec![("spotify".to_string(), 55)]
    );

    let state = engine.state.lock().unwrap();
    assert_eq!(state.replies.len(), 1);
    let reply = &state.replies[0].1;
    assert_eq!(reply.volume, Some(70));
    assert_eq!(reply.now_playing, None);
}

#[tokio::test]
async fn pairing_flow_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let (mut dispatcher, sink, engine) = device_dispatcher(dir.path(), vec![]);

    let mut device = phone();
    dispatcher
        .handle_device_event(DeviceEvent::Joined(device.clone()))
        .await;

    let sent = sink.sent();
    assert_eq!(sent[0].summary, "Pixel");
    assert_eq!(sent[0].body, "New device available");
    assert_eq!(
        sent[0].actions,
        vec![("pair".to_string(), "Pair device".to_string())]
    );
    let available_handle = sink.handles()[0];

    dispatcher
        .handle_feedback(NotifyFeedback::Action {
            handle: available_handle,
            action: "pair".to_string(),
        })
        .await;
    assert_eq!(engine.state.lock().unwrap().paired, vec!["dev-1".to_string()]);

    device.paired = true;
    dispatcher
        .handle_device_event(DeviceEvent::Paired(device))
        .await;

    // The available bubble went away and a resident connected one replaced it.
    assert!(sink.closed().contains(&available_handle));
    let sent = sink.sent();
    let connected = sent.last().unwrap();
    assert_eq!(connected.body, "Device connected");
    assert!(connected.resident);
    assert_eq!(connected.category.as_deref(), Some("device.added"));
    assert_eq!(
        connected.actions,
        vec![("browse".to_string(), "Browse".to_string())]
    );

    // Pairing persisted the device.
    let known = store::load_known_devices(dir.path());
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].id, "dev-1");
    assert_eq!(known[0].name, "Pixel");
}

#[tokio::test]
async fn pair_request_offers_accept_and_reject() {
    let dir = tempfile::TempDir::new().unwrap();
    let (mut dispatcher, sink, engine) = device_dispatcher(dir.path(), vec![]);

    dispatcher
        .handle_device_event(DeviceEvent::PairRequested(phone()))
        .await;

    let sent = sink.sent();
    assert_eq!(sent[0].body, "New pair request");
    assert_eq!(sent[0].timeout, 0);
    assert_eq!(
        sent[0].actions,
        vec![
            ("pair".to_string(), "Accept".to_string()),
            ("unpair".to_string(), "Reject".to_string()),
        ]
    );

    dispatcher
        .handle_feedback(NotifyFeedback::Action {
            handle: sink.handles()[0],
            action: "unpair".to_string(),
        })
        .await;
    assert_eq!(engine.state.lock().unwrap().unpaired, vec!["dev-1".to_string()]);
}

#[tokio::test]
async fn unpairing_forgets_the_device() {
    let dir = tempfile::TempDir::new().unwrap();
    let known = vec![KnownDevice {
        id: "dev-1".into(),
        name: "Pixel".into(),
    }];
    store::save_known_devices(dir.path(), &known).unwrap();
    let (mut dispatcher, sink, _) = device_dispatcher(dir.path(), known);

    let mut device = phone();
    device.paired = true;
    dispatcher
        .handle_device_event(DeviceEvent::Joined(device.clone()))
        .await;
    let presence = sink.handles()[0];

    device.paired = false;
    dispatcher
        .handle_device_event(DeviceEvent::Unpaired(device))
        .await;

    assert_eq!(sink.closed(), vec![presence]);
    assert!(store::load_known_devices(dir.path()).is_empty());
}

#[tokio::test]
async fn leaving_device_withdraws_presence() {
    let dir = tempfile::TempDir::new().unwrap();
    let (mut dispatcher, sink, _) = device_dispatcher(dir.path(), vec![]);

    dispatcher
        .handle_device_event(DeviceEvent::Joined(phone()))
        .await;
    let presence = sink.handles()[0];

    dispatcher
        .handle_device_event(DeviceEvent::Left(phone()))
        .await;

    assert_eq!(sink.closed(), vec![presence]);
    assert!(dispatcher.registry().get("dev-1").is_none());
}

#[tokio::test]
async fn empty_device_id_is_ignored() {
    let dir = tempfile::TempDir::new().unwrap();
    let (mut dispatcher, sink, _) = device_dispatcher(dir.path(), vec![]);

    let device = Device::new("", "Ghost", DeviceType::Unknown);
    dispatcher
        .handle_device_event(DeviceEvent::Joined(device))
        .await;

    assert!(sink.sent().is_empty());
    assert!(dispatcher.registry().present().next().is_none());
}

#[tokio::test]
async fn browse_action_reaches_engine() {
    let dir = tempfile::TempDir::new().unwrap();
    let (mut dispatcher, sink, engine) = device_dispatcher(dir.path(), vec![]);

    let mut device = phone();
    device.paired = true;
    dispatcher
        .handle_device_event(DeviceEvent::Joined(device))
        .await;

    dispatcher
        .handle_feedback(NotifyFeedback::Action {
            handle: sink.handles()[0],
            action: "browse".to_string(),
        })
        .await;

    assert_eq!(engine.state.lock().unwrap().browsed, vec!["dev-1".to_string()]);
}

#[tokio::test]
async fn action_on_unknown_handle_is_ignored() {
    let dir = tempfile::TempDir::new().unwrap();
    let (mut dispatcher, _, engine) = device_dispatcher(dir.path(), vec![]);

    dispatcher
        .handle_feedback(NotifyFeedback::Action {
            handle: 999,
            action: "pair".to_string(),
        })
        .await;

    let state = engine.state.lock().unwrap();
    assert!(state.paired.is_empty());
    assert!(state.browsed.is_empty());
}

#[tokio::test]
async fn nudge_restores_dismissed_presence_bubbles() {
    let dir = tempfile::TempDir::new().unwrap();
    let (mut dispatcher, sink, _) = device_dispatcher(dir.path(), vec![]);

    let mut paired = phone();
    paired.paired = true;
    dispatcher
        .handle_device_event(DeviceEvent::Joined(paired))
        .await;
    let mut other = Device::new("dev-2", "Tab", DeviceType::Tablet);
    other.paired = true;
    dispatcher
        .handle_device_event(DeviceEvent::Joined(other))
        .await;

    // The user dismisses one of the two bubbles.
    let dismissed = sink.handles()[0];
    dispatcher
        .handle_feedback(NotifyFeedback::Closed { handle: dismissed })
        .await;

    dispatcher.handle_nudge().await;

    // Only the dismissed device got a fresh bubble.
    assert_eq!(sink.sent().len(), 3);
    assert_eq!(sink.sent()[2].body, "Device connected");
}

#[tokio::test]
async fn shutdown_withdraws_every_owned_bubble() {
    let dir = tempfile::TempDir::new().unwrap();
    let (mut dispatcher, sink, _) = device_dispatcher(dir.path(), vec![]);

    dispatcher
        .handle_device_event(DeviceEvent::Joined(phone()))
        .await;
    dispatcher
        .handle_device_event(DeviceEvent::Joined(Device::new(
            "dev-2",
            "Tab",
            DeviceType::Tablet,
        )))
        .await;

    dispatcher.close_all().await;

    let mut closed = sink.closed();
    closed.sort_unstable();
    assert_eq!(closed, sink.handles());
    assert!(dispatcher.handles().is_empty());
}

// Sending ends matching PluginStreams; kept alive so the loop keeps
// polling every branch.
struct PluginFeeds {
    ping: mpsc::Sender<PingEvent>,
    battery: mpsc::Sender<BatteryEvent>,
    mirror: mpsc::Sender<MirrorEvent>,
    media: mpsc::Sender<MediaEvent>,
    telephony: mpsc::Sender<TelephonyEvent>,
    sftp: mpsc::Sender<SftpEvent>,
    closed: mpsc::Sender<u32>,
}

fn plugin_streams() -> (PluginFeeds, PluginStreams) {
    let (ping_tx, ping) = mpsc::channel(8);
    let (battery_tx, battery) = mpsc::channel(8);
    let (mirror_tx, mirror) = mpsc::channel(8);
    let (media_tx, media) = mpsc::channel(8);
    let (telephony_tx, telephony) = mpsc::channel(8);
    let (sftp_tx, sftp) = mpsc::channel(8);
    let (closed_tx, closed) = mpsc::channel(8);
    let feeds = PluginFeeds {
        ping: ping_tx,
        battery: battery_tx,
        mirror: mirror_tx,
        media: media_tx,
        telephony: telephony_tx,
        sftp: sftp_tx,
        closed: closed_tx,
    };
    let streams = PluginStreams {
        ping,
        battery,
        mirror,
        media,
        telephony,
        sftp,
        closed,
    };
    (feeds, streams)
}

struct DeviceFeeds {
    devices: mpsc::Sender<DeviceEvent>,
    feedback: mpsc::Sender<NotifyFeedback>,
    nudge: mpsc::Sender<()>,
}

fn device_streams() -> (DeviceFeeds, DeviceStreams) {
    let (devices_tx, devices) = mpsc::channel(8);
    let (feedback_tx, feedback) = mpsc::channel(8);
    let (nudge_tx, nudge) = mpsc::channel(8);
    let feeds = DeviceFeeds {
        devices: devices_tx,
        feedback: feedback_tx,
        nudge: nudge_tx,
    };
    let streams = DeviceStreams {
        devices,
        feedback,
        nudge,
    };
    (feeds, streams)
}

// Give the spawned loop time to drain what was queued before signalling it.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn plugin_loop_handles_one_source_in_arrival_order() {
    let (dispatcher, sink, _, _) = plugin_dispatcher();
    let (feeds, streams) = plugin_streams();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for ticker in ["first", "second", "third"] {
        feeds.mirror.send(mirror("n1", ticker, false)).await.unwrap();
    }
    let loop_task = tokio::spawn(dispatcher.run(streams, shutdown_rx));
    settle().await;
    shutdown_tx.send(true).unwrap();
    loop_task.await.unwrap();

    let sent = sink.sent();
    let handles = sink.handles();
    assert_eq!(
        sent.iter().map(|n| n.body.as_str()).collect::<Vec<_>>(),
        ["first", "second", "third"]
    );
    // Each update replaced the bubble the previous one produced.
    assert_eq!(sent[0].replaces_id, 0);
    assert_eq!(sent[1].replaces_id, handles[0]);
    assert_eq!(sent[2].replaces_id, handles[1]);
}

#[tokio::test]
async fn plugin_loop_shutdown_withdraws_live_bubbles() {
    let (dispatcher, sink, _, _) = plugin_dispatcher();
    let (feeds, streams) = plugin_streams();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    feeds.mirror.send(mirror("n1", "hello", false)).await.unwrap();
    feeds.mirror.send(mirror("n2", "world", false)).await.unwrap();
    let loop_task = tokio::spawn(dispatcher.run(streams, shutdown_rx));
    settle().await;
    shutdown_tx.send(true).unwrap();
    loop_task.await.unwrap();

    let mut closed = sink.closed();
    closed.sort_unstable();
    assert_eq!(closed, sink.handles());
}

#[tokio::test]
async fn device_loop_processes_events_and_closes_presence_on_shutdown() {
    let dir = tempfile::TempDir::new().unwrap();
    let (dispatcher, sink, engine) = device_dispatcher(dir.path(), vec![]);
    let (feeds, streams) = device_streams();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    feeds
        .devices
        .send(DeviceEvent::Joined(phone()))
        .await
        .unwrap();
    let loop_task = tokio::spawn(dispatcher.run(streams, shutdown_rx));
    settle().await;

    let handles = sink.handles();
    assert_eq!(handles.len(), 1);
    feeds
        .feedback
        .send(NotifyFeedback::Action {
            handle: handles[0],
            action: "pair".to_string(),
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(engine.state.lock().unwrap().paired, vec!["dev-1"]);

    // The pair action leaves the presence bubble up; shutdown withdraws it.
    shutdown_tx.send(true).unwrap();
    loop_task.await.unwrap();
    assert_eq!(sink.closed(), vec![handles[0]]);
}
