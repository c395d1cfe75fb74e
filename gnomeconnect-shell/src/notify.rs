//! Desktop notification client.
//!
//! Talks to org.freedesktop.Notifications over the session bus. Replacement
//! of an existing bubble goes through `replaces_id`; action clicks and
//! server-side closes come back as a feedback stream keyed by handle.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zbus::Connection;

const NOTIFICATIONS_SERVICE: &str = "org.freedesktop.Notifications";
const NOTIFICATIONS_PATH: &str = "/org/freedesktop/Notifications";

/// Notification urgency level per the freedesktop spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low = 0,
    Normal = 1,
    Critical = 2,
}

/// A fully-described notification, ready to send.
#[derive(Debug, Clone)]
pub struct Notification {
    pub replaces_id: u32,
    pub summary: String,
    pub body: String,
    pub icon: String,
    pub urgency: Urgency,
    pub category: Option<String>,
    /// Resident notifications stay after an action is invoked.
    pub resident: bool,
    pub timeout: i32,
    pub actions: Vec<(String, String)>,
}

/// Builder for [`Notification`].
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    note: Notification,
}

impl NotificationBuilder {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            note: Notification {
                replaces_id: 0,
                summary: summary.into(),
                body: String::new(),
                icon: "phone-symbolic".to_string(),
                urgency: Urgency::Normal,
                category: None,
                resident: false,
                timeout: 5000,
                actions: Vec::new(),
            },
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.note.body = body.into();
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.note.icon = icon.into();
        self
    }

    pub fn urgency(mut self, urgency: Urgency) -> Self {
        self.note.urgency = urgency;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.note.category = Some(category.into());
        self
    }

    pub fn resident(mut self) -> Self {
        self.note.resident = true;
        self
    }

    /// Timeout in milliseconds; 0 means never auto-dismiss.
    pub fn timeout(mut self, timeout_ms: i32) -> Self {
        self.note.timeout = timeout_ms;
        self
    }

    /// Replace an existing bubble instead of creating a new one.
    pub fn replaces(mut self, handle: u32) -> Self {
        self.note.replaces_id = handle;
        self
    }

    pub fn action(mut self, id: impl Into<String>, label: impl Into<String>) -> Self {
        self.note.actions.push((id.into(), label.into()));
        self
    }

    pub fn build(self) -> Notification {
        self.note
    }
}

/// User feedback reported by the notification server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyFeedback {
    /// The user clicked an action button.
    Action { handle: u32, action: String },
    /// The bubble was closed, by the user or by the server.
    Closed { handle: u32 },
}

/// Seam between the dispatchers and the notification server.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Send or replace a notification, returning the server handle.
    async fn send(&self, note: Notification) -> Result<u32>;

    /// Close a notification by handle. Closing an unknown handle is not an
    /// error on the server side.
    async fn close(&self, handle: u32) -> Result<()>;
}

/// Notification client backed by the session bus.
#[derive(Debug, Clone)]
pub struct Notifier {
    connection: Connection,
}

impl Notifier {
    pub async fn new() -> Result<Self> {
        let connection = Connection::session()
            .await
            .context("Failed to connect to session bus")?;
        Ok(Self { connection })
    }

    pub fn with_connection(connection: Connection) -> Self {
        Self { connection }
    }

    async fn proxy(&self) -> Result<zbus::Proxy<'static>> {
        zbus::Proxy::new(
            &self.connection,
            NOTIFICATIONS_SERVICE,
            NOTIFICATIONS_PATH,
            NOTIFICATIONS_SERVICE,
        )
        .await
        .context("Failed to create notifications proxy")
    }

    /// Stream of (handle, action key) pairs for clicked action buttons.
    pub async fn action_stream(
        &self,
    ) -> Result<impl futures::Stream<Item = (u32, String)> + Unpin> {
        let mut stream = self.signal_stream("ActionInvoked").await?;
        Ok(Box::pin(async_stream::stream! {
            while let Some(Ok(msg)) = stream.next().await {
                if let Ok((handle, action)) = msg.body().deserialize::<(u32, String)>() {
                    debug!(handle, %action, "notification action invoked");
                    yield (handle, action);
                }
            }
        }))
    }

    /// Stream of handles the server reports closed, for any reason.
    pub async fn closed_stream(&self) -> Result<impl futures::Stream<Item = u32> + Unpin> {
        let mut stream = self.signal_stream("NotificationClosed").await?;
        Ok(Box::pin(async_stream::stream! {
            while let Some(Ok(msg)) = stream.next().await {
                if let Ok((handle, _reason)) = msg.body().deserialize::<(u32, u32)>() {
                    debug!(handle, "notification closed by server");
                    yield handle;
                }
            }
        }))
    }

    /// Merge both feedback signals into one channel for the dispatch loop.
    /// Relative order between the two signal kinds is not guaranteed.
    pub async fn subscribe_feedback(&self) -> Result<mpsc::Receiver<NotifyFeedback>> {
        let (tx, rx) = mpsc::channel(64);

        let mut actions = self.action_stream().await?;
        let action_tx = tx.clone();
        tokio::spawn(async move {
            while let Some((handle, action)) = actions.next().await {
                if action_tx
                    .send(NotifyFeedback::Action { handle, action })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let mut closed = self.closed_stream().await?;
        tokio::spawn(async move {
            while let Some(handle) = closed.next().await {
                if tx.send(NotifyFeedback::Closed { handle }).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn signal_stream(&self, member: &str) -> Result<zbus::MessageStream> {
        zbus::MessageStream::for_match_rule(
            zbus::MatchRule::builder()
                .msg_type(zbus::message::Type::Signal)
                .sender(NOTIFICATIONS_SERVICE)?
                .interface(NOTIFICATIONS_SERVICE)?
                .member(member)?
                .build(),
            &self.connection,
            Some(64),
        )
        .await
        .with_context(|| format!("Failed to subscribe to {member}"))
    }
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn send(&self, note: Notification) -> Result<u32> {
        let mut hints: HashMap<String, zbus::zvariant::Value<'static>> = HashMap::new();
        hints.insert(
            "urgency".to_string(),
            zbus::zvariant::Value::U8(note.urgency as u8),
        );
        if let Some(category) = &note.category {
            hints.insert(
                "category".to_string(),
                zbus::zvariant::Value::from(category.clone()),
            );
        }
        if note.resident {
            hints.insert("resident".to_string(), zbus::zvariant::Value::Bool(true));
        }

        let actions_flat: Vec<String> = note
            .actions
            .iter()
            .flat_map(|(id, label)| [id.clone(), label.clone()])
            .collect();

        let handle: u32 = self
            .proxy()
            .await?
            .call_method(
                "Notify",
                &(
                    "GNOMEConnect",
                    note.replaces_id,
                    &note.icon,
                    &note.summary,
                    &note.body,
                    &actions_flat,
                    &hints,
                    note.timeout,
                ),
            )
            .await
            .context("Failed to send notification")?
            .body()
            .deserialize()
            .context("Failed to parse notification handle")?;

        debug!(summary = %note.summary, handle, "sent notification");
        Ok(handle)
    }

    async fn close(&self, handle: u32) -> Result<()> {
        if let Err(err) = self
            .proxy()
            .await?
            .call_method("CloseNotification", &(handle,))
            .await
        {
            warn!(handle, %err, "failed to close notification");
        }
        Ok(())
    }
}
