//! Local MPRIS2 media player bridge.
//!
//! Discovers players on the session bus by their org.mpris.MediaPlayer2.
//! prefix and exposes the slice of MPRIS the remote media-control plugin
//! needs: transport actions, a now-playing snapshot and volume.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;
use zbus::zvariant::OwnedValue;
use zbus::Connection;

use gnomeconnect_engine::MediaAction;

pub const MPRIS_BUS_PREFIX: &str = "org.mpris.MediaPlayer2.";
pub const MPRIS_PLAYER_INTERFACE: &str = "org.mpris.MediaPlayer2.Player";
const MPRIS_OBJECT_PATH: &str = "/org/mpris/MediaPlayer2";

/// Snapshot of a player's current track and playback state.
///
/// Lengths and positions are in milliseconds; MPRIS reports microseconds
/// and the remote side expects milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NowPlaying {
    pub title: String,
    pub is_playing: bool,
    pub length_ms: i64,
    pub position_ms: i64,
}

/// Seam between the plugin dispatcher and the local media players.
///
/// Volume is an integer percent on this boundary; the MPRIS 0.0 to 1.0
/// scale stays inside the implementation.
#[async_trait]
pub trait MediaBridge: Send + Sync {
    async fn list_players(&self) -> Result<Vec<String>>;

    async fn transport(&self, player: &str, action: MediaAction) -> Result<()>;

    async fn now_playing(&self, player: &str) -> Result<NowPlaying>;

    async fn volume(&self, player: &str) -> Result<i32>;

    async fn set_volume(&self, player: &str, percent: i32) -> Result<()>;
}

/// MPRIS bridge backed by the session bus.
#[derive(Debug, Clone)]
pub struct MprisBridge {
    connection: Connection,
}

impl MprisBridge {
    pub async fn new() -> Result<Self> {
        let connection = Connection::session()
            .await
            .context("Failed to connect to session bus")?;
        Ok(Self { connection })
    }

    pub fn with_connection(connection: Connection) -> Self {
        Self { connection }
    }

    fn player_bus_name(player: &str) -> String {
        format!("{MPRIS_BUS_PREFIX}{player}")
    }

    async fn player_proxy(&self, player: &str) -> Result<zbus::Proxy<'static>> {
        zbus::Proxy::new(
            &self.connection,
            Self::player_bus_name(player),
            MPRIS_OBJECT_PATH,
            MPRIS_PLAYER_INTERFACE,
        )
        .await
        .with_context(|| format!("Failed to create proxy for player {player}"))
    }
}

#[async_trait]
impl MediaBridge for MprisBridge {
    async fn list_players(&self) -> Result<Vec<String>> {
        let dbus_proxy = zbus::fdo::DBusProxy::new(&self.connection)
            .await
            .context("Failed to create DBus proxy")?;

        let names = dbus_proxy
            .list_names()
            .await
            .context("Failed to list bus names")?;

        let mut players = Vec::new();
        for name in names {
            if let Some(player) = name.strip_prefix(MPRIS_BUS_PREFIX) {
                players.push(player.to_string());
            }
        }
        players.sort();

        debug!(count = players.len(), "discovered MPRIS players");
        Ok(players)
    }

    async fn transport(&self, player: &str, action: MediaAction) -> Result<()> {
        let method = action.method_name();
        self.player_proxy(player)
            .await?
            .call_method(method, &())
            .await
            .with_context(|| format!("Failed to call {method} on {player}"))?;

        debug!(player, method, "sent transport action");
        Ok(())
    }

    async fn now_playing(&self, player: &str) -> Result<NowPlaying> {
        let proxy = self.player_proxy(player).await?;

        let playback_status: String = proxy
            .get_property("PlaybackStatus")
            .await
            .unwrap_or_else(|_| "Stopped".to_string());
        let position: i64 = proxy.get_property("Position").await.unwrap_or(0);

        let metadata: HashMap<String, OwnedValue> =
            proxy.get_property("Metadata").await.unwrap_or_default();
        let title = metadata
            .get("xesam:title")
            .and_then(|v| <&str>::try_from(v).ok())
            .unwrap_or_default()
            .to_string();
        let length = metadata
            .get("mpris:length")
            .and_then(|v| i64::try_from(v).ok())
            .unwrap_or(0);

        Ok(NowPlaying {
            title,
            is_playing: playback_status == "Playing",
            length_ms: length / 1000,
            position_ms: position / 1000,
        })
    }

    async fn volume(&self, player: &str) -> Result<i32> {
        let volume: f64 = self
            .player_proxy(player)
            .await?
            .get_property("Volume")
            .await
            .unwrap_or(1.0);
        Ok((volume * 100.0).round() as i32)
    }

    async fn set_volume(&self, player: &str, percent: i32) -> Result<()> {
        let volume = f64::from(percent.clamp(0, 100)) / 100.0;
        self.player_proxy(player)
            .await?
            .set_property("Volume", volume)
            .await
            .with_context(|| format!("Failed to set volume on {player}"))?;

        debug!(player, percent, "set player volume");
        Ok(())
    }
}
