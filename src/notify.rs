use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

/// A fan-out destination on the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    User(Ulid),
    Station(Ulid),
    Admin,
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user_{id}"),
            Room::Station(id) => write!(f, "station_{id}"),
            Room::Admin => f.write_str("admin"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid channel: {0} (expected user_{{id}}, station_{{id}} or admin)")]
pub struct BadRoom(pub String);

impl FromStr for Room {
    type Err = BadRoom;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_matches('"');
        if s.eq_ignore_ascii_case("admin") {
            return Ok(Room::Admin);
        }
        let parse = |rest: &str| Ulid::from_string(rest).map_err(|_| BadRoom(s.to_string()));
        if let Some(rest) = s.strip_prefix("user_") {
            return parse(rest).map(Room::User);
        }
        if let Some(rest) = s.strip_prefix("station_") {
            return parse(rest).map(Room::Station);
        }
        Err(BadRoom(s.to_string()))
    }
}

/// Event-channel message names. Advisory UI triggers, never authoritative state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    DashboardRefresh,
    Notification,
    BookingUpdate,
    BookingReminder,
    ForceLogout,
    RoleChanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub event: PushKind,
    pub payload: serde_json::Value,
}

impl PushMessage {
    pub fn new(event: PushKind, payload: serde_json::Value) -> Self {
        Self { event, payload }
    }

    pub fn dashboard_refresh() -> Self {
        Self::new(PushKind::DashboardRefresh, serde_json::Value::Null)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("nobody listening on {0}")]
    NoListeners(Room),
    #[error("transport: {0}")]
    Transport(String),
}

/// Outbound side effects the lifecycle core depends on. Everything behind
/// this trait is best-effort.
#[async_trait]
pub trait PushPort: Send + Sync {
    async fn push(&self, room: Room, message: PushMessage) -> Result<(), PushError>;

    /// Email delivery lives outside this crate; the default only records intent.
    async fn queue_email(&self, user_id: Ulid, subject: &str, body: &str) -> Result<(), PushError> {
        tracing::debug!(%user_id, subject, len = body.len(), "email queued");
        Ok(())
    }
}

/// Broadcast hub, one channel per room.
pub struct NotifyHub {
    channels: DashMap<Room, broadcast::Sender<PushMessage>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a room. Creates the channel if needed.
    pub fn subscribe(&self, room: Room) -> broadcast::Receiver<PushMessage> {
        let sender = self
            .channels
            .entry(room)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send to a room. Returns the number of receivers reached.
    pub fn send(&self, room: Room, message: PushMessage) -> usize {
        match self.channels.get(&room) {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop channels nobody listens on any more.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[async_trait]
impl PushPort for NotifyHub {
    async fn push(&self, room: Room, message: PushMessage) -> Result<(), PushError> {
        if self.send(room, message) == 0 {
            return Err(PushError::NoListeners(room));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let uid = Ulid::new();
        let mut rx = hub.subscribe(Room::User(uid));

        let msg = PushMessage::new(PushKind::BookingUpdate, serde_json::json!({"status": "confirmed"}));
        hub.push(Room::User(uid), msg.clone()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn push_without_subscribers_reports_miss() {
        let hub = NotifyHub::new();
        let result = hub.push(Room::Admin, PushMessage::dashboard_refresh()).await;
        assert!(matches!(result, Err(PushError::NoListeners(Room::Admin))));
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(Room::Station(a));
        let _rx_b = hub.subscribe(Room::Station(b));

        hub.send(Room::Station(b), PushMessage::dashboard_refresh());
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn prune_drops_dead_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(Room::Admin);
        drop(rx);
        hub.prune();
        assert_eq!(hub.send(Room::Admin, PushMessage::dashboard_refresh()), 0);
        assert!(hub.channels.is_empty());
    }

    #[test]
    fn room_names_round_trip() {
        let id = Ulid::new();
        assert_eq!(format!("{}", Room::User(id)).parse::<Room>().unwrap(), Room::User(id));
        assert_eq!("station_".to_string() + &id.to_string(), Room::Station(id).to_string());
        assert_eq!("ADMIN".parse::<Room>().unwrap(), Room::Admin);
        assert!("resource_x".parse::<Room>().is_err());
    }

    #[test]
    fn push_message_json_uses_snake_case_names() {
        let json = PushMessage::dashboard_refresh().to_json();
        assert_eq!(json, r#"{"event":"dashboard_refresh","payload":null}"#);
    }
}
