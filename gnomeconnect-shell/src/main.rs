//! GNOMEConnect shell: connects the device sync engine to the desktop.
//!
//! One process, two dispatch loops. The engine's plugin traffic (pings,
//! battery, mirrored notifications, media control, telephony, sftp) goes to
//! the plugin loop; membership changes, notification feedback and signals
//! go to the device loop. SIGUSR1 asks the running instance to re-issue its
//! presence notifications; SIGINT and SIGTERM withdraw everything and exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::info;
#[cfg(feature = "gui")]
use tracing::warn;
use tracing_subscriber::EnvFilter;

use gnomeconnect_engine::{EngineClient, EngineConfig};

use gnomeconnect_shell::config::Config;
use gnomeconnect_shell::dispatch::{
    DeviceDispatcher, DeviceStreams, PluginDispatcher, PluginStreams,
};
use gnomeconnect_shell::media::MprisBridge;
use gnomeconnect_shell::notify::Notifier;
use gnomeconnect_shell::registry::DeviceRegistry;
use gnomeconnect_shell::store::{self, InstanceLock};
#[cfg(feature = "gui")]
use gnomeconnect_shell::ui;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    info!("Starting GNOMEConnect shell");

    let config = Config::load().context("Failed to load configuration")?;
    let state_dir = Config::config_dir()?;

    let Some(_lock) = InstanceLock::acquire(&state_dir)? else {
        // The running instance got a SIGUSR1 and will restore its
        // notifications; nothing left to do here.
        return Ok(());
    };

    let identity = store::load_or_generate_identity(&state_dir)?;
    let known_devices = store::load_known_devices(&state_dir);
    info!(known = known_devices.len(), "loaded persisted state");

    let (engine, events) = EngineClient::connect(&EngineConfig {
        bus_name: config.engine.bus_name.clone(),
        private_key_pem: identity,
        known_devices: known_devices.clone(),
    })
    .await
    .context("Failed to connect to engine")?;
    let engine = Arc::new(engine);

    let notifier = Arc::new(Notifier::new().await?);
    let bridge = Arc::new(MprisBridge::new().await?);

    let feedback = notifier.subscribe_feedback().await?;

    // The plugin loop keeps its own handle table, so it gets its own view
    // of close reports.
    let (closed_tx, closed_rx) = mpsc::channel(64);
    let mut closed = notifier.closed_stream().await?;
    tokio::spawn(async move {
        while let Some(handle) = closed.next().await {
            if closed_tx.send(handle).await.is_err() {
                break;
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (nudge_tx, nudge_rx) = mpsc::channel(4);
    let budget = config.external_call_timeout();

    let plugin_dispatcher = PluginDispatcher::new(
        notifier.clone(),
        bridge,
        engine.clone(),
        config.sftp_commands(),
        budget,
    );
    let plugin_task = tokio::spawn(plugin_dispatcher.run(
        PluginStreams {
            ping: events.ping,
            battery: events.battery,
            mirror: events.mirror,
            media: events.media,
            telephony: events.telephony,
            sftp: events.sftp,
            closed: closed_rx,
        },
        shutdown_rx.clone(),
    ));

    #[allow(unused_mut)]
    let mut device_dispatcher = DeviceDispatcher::new(
        notifier.clone(),
        engine.clone(),
        DeviceRegistry::new(known_devices),
        budget,
        state_dir.clone(),
    );

    #[cfg(feature = "gui")]
    {
        let (snapshot_tx, snapshot_rx) = mpsc::channel(16);
        let (command_tx, mut command_rx) = mpsc::channel(16);
        device_dispatcher = device_dispatcher.with_ui_feed(snapshot_tx);
        ui::spawn(snapshot_rx, command_tx);

        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let result = match &command {
                    ui::UiCommand::Pair(id) => engine.pair_device(id).await.map(|_| ()),
                    ui::UiCommand::Unpair(id) => engine.unpair_device(id).await.map(|_| ()),
                    ui::UiCommand::Browse(id) => engine.request_browse(id).await,
                };
                if let Err(err) = result {
                    warn!(?command, %err, "window command failed");
                }
            }
        });
    }

    let device_task = tokio::spawn(device_dispatcher.run(
        DeviceStreams {
            devices: events.devices,
            feedback,
            nudge: nudge_rx,
        },
        shutdown_rx,
    ));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sigusr1.recv() => {
                if nudge_tx.send(()).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = plugin_task.await;
    let _ = device_task.await;

    Ok(())
}
