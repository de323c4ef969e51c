use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use safetag_types::events::{RoomEvent, SignalKind, signal_room};

/// Room a user's own sockets join after identifying.
pub fn user_room(user_id: Uuid) -> String {
    user_id.to_string()
}

/// Named rooms of live connections. Every chat session and every identified
/// owner has a room; events are fanned out to whoever is in it right now.
///
/// Delivery is best effort: a frame sent to a connection that has already
/// gone away is dropped.
#[derive(Clone, Default)]
pub struct Rooms {
    inner: Arc<RwLock<RoomTable>>,
}

#[derive(Default)]
struct RoomTable {
    /// conn_id -> outbound frames
    connections: HashMap<Uuid, mpsc::UnboundedSender<String>>,

    /// room -> members
    members: HashMap<String, HashSet<Uuid>>,

    /// conn_id -> rooms it is in, so disconnect can clean up
    joined: HashMap<Uuid, HashSet<String>>,
}

impl RoomTable {
    fn deliver(&self, conn_id: &Uuid, frame: &str) -> bool {
        match self.connections.get(conn_id) {
            Some(tx) => {
                if tx.send(frame.to_string()).is_err() {
                    debug!("Dropping frame for closed connection {}", conn_id);
                    return false;
                }
                true
            }
            None => false,
        }
    }
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns its id and the receiver its writer drains.
    pub async fn connect(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().await.connections.insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Remove a connection from every room it joined.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let mut table = self.inner.write().await;
        table.connections.remove(&conn_id);

        let rooms = table.joined.remove(&conn_id).unwrap_or_default();
        for room in rooms {
            if let Some(members) = table.members.get_mut(&room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    table.members.remove(&room);
                }
            }
        }
    }

    /// Returns false if the connection is not registered.
    pub async fn join(&self, conn_id: Uuid, room: &str) -> bool {
        let mut table = self.inner.write().await;
        if !table.connections.contains_key(&conn_id) {
            return false;
        }
        table.members.entry(room.to_string()).or_default().insert(conn_id);
        table.joined.entry(conn_id).or_default().insert(room.to_string());
        true
    }

    pub async fn leave(&self, conn_id: Uuid, room: &str) {
        let mut table = self.inner.write().await;
        if let Some(rooms) = table.joined.get_mut(&conn_id) {
            rooms.remove(room);
        }
        if let Some(members) = table.members.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                table.members.remove(room);
            }
        }
    }

    pub async fn is_member(&self, conn_id: Uuid, room: &str) -> bool {
        self.inner
            .read()
            .await
            .members
            .get(room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Send an event to one connection.
    pub async fn send_to(&self, conn_id: Uuid, event: &RoomEvent) -> bool {
        let Some(frame) = encode(event) else {
            return false;
        };
        self.inner.read().await.deliver(&conn_id, &frame)
    }

    /// Send an event to every member of `room`. Returns how many connections it reached.
    pub async fn emit(&self, room: &str, event: &RoomEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let table = self.inner.read().await;
        let delivered = table
            .members
            .get(room)
            .map(|members| members.iter().filter(|id| table.deliver(id, &frame)).count())
            .unwrap_or(0);

        debug!("Emitted {} to room {} ({} connections)", event.name(), room, delivered);
        delivered
    }

    /// Send an event to everyone in any of `rooms`. A connection sitting in
    /// several of them still gets the frame once.
    pub async fn emit_many(&self, rooms: &[&str], event: &RoomEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let table = self.inner.read().await;
        let targets: HashSet<&Uuid> = rooms
            .iter()
            .filter_map(|room| table.members.get(*room))
            .flatten()
            .collect();
        let delivered = targets.into_iter().filter(|id| table.deliver(id, &frame)).count();

        debug!("Emitted {} to rooms {:?} ({} connections)", event.name(), rooms, delivered);
        delivered
    }

    /// Forward a WebRTC signaling payload to the other members of the room it
    /// names. The sender has to be in that room itself; otherwise nothing is sent.
    pub async fn relay(&self, from: Uuid, kind: SignalKind, payload: serde_json::Value) -> usize {
        let Some(room) = signal_room(&payload).map(str::to_string) else {
            debug!("Dropping {} from {}: no sessionId", kind.event_name(), from);
            return 0;
        };

        let event = RoomEvent::Signal { kind, payload };
        let Some(frame) = encode(&event) else {
            return 0;
        };

        let table = self.inner.read().await;
        let Some(members) = table.members.get(&room).filter(|m| m.contains(&from)) else {
            debug!("Dropping {} from {}: not in room {}", kind.event_name(), from, room);
            return 0;
        };

        members
            .iter()
            .filter(|id| **id != from)
            .filter(|id| table.deliver(id, &frame))
            .count()
    }
}

fn encode(event: &RoomEvent) -> Option<String> {
    match event.to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Failed to serialize {}: {}", event.name(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use safetag_types::events::Frame;

    fn parse(frame: &str) -> Frame {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn emit_reaches_only_room_members() {
        let rooms = Rooms::new();
        let (a, mut rx_a) = rooms.connect().await;
        let (b, mut rx_b) = rooms.connect().await;
        let (_c, mut rx_c) = rooms.connect().await;

        assert!(rooms.join(a, "session-1").await);
        assert!(rooms.join(b, "session-1").await);

        let session_id = Uuid::new_v4();
        let sent = rooms.emit("session-1", &RoomEvent::SessionClosed { session_id }).await;
        assert_eq!(sent, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = parse(&rx.try_recv().unwrap());
            assert_eq!(frame.event, "session_closed");
            assert_eq!(frame.data["sessionId"], session_id.to_string());
        }
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_and_disconnect_stop_delivery() {
        let rooms = Rooms::new();
        let (a, mut rx_a) = rooms.connect().await;
        let (b, _rx_b) = rooms.connect().await;
        rooms.join(a, "r").await;
        rooms.join(b, "r").await;

        rooms.leave(a, "r").await;
        assert!(!rooms.is_member(a, "r").await);
        rooms.disconnect(b).await;

        let event = RoomEvent::SessionClosed { session_id: Uuid::new_v4() };
        assert_eq!(rooms.emit("r", &event).await, 0);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rooms.connection_count().await, 1);
        assert!(!rooms.join(b, "r").await);
    }

    #[tokio::test]
    async fn emit_to_closed_receiver_is_ignored() {
        let rooms = Rooms::new();
        let (a, rx_a) = rooms.connect().await;
        rooms.join(a, "r").await;
        drop(rx_a);

        let event = RoomEvent::SessionClosed { session_id: Uuid::new_v4() };
        assert_eq!(rooms.emit("r", &event).await, 0);
    }

    #[tokio::test]
    async fn emit_many_sends_once_to_members_of_several_rooms() {
        let rooms = Rooms::new();
        let (owner, mut rx_owner) = rooms.connect().await;
        let (stranger, mut rx_stranger) = rooms.connect().await;
        let owner_room = user_room(Uuid::new_v4());
        rooms.join(owner, &owner_room).await;
        rooms.join(owner, "s1").await;
        rooms.join(stranger, "s1").await;

        let event = RoomEvent::SessionClosed { session_id: Uuid::new_v4() };
        assert_eq!(rooms.emit_many(&["s1", owner_room.as_str(), "nobody"], &event).await, 2);

        assert_eq!(parse(&rx_owner.try_recv().unwrap()).event, "session_closed");
        assert!(rx_owner.try_recv().is_err());
        assert_eq!(parse(&rx_stranger.try_recv().unwrap()).event, "session_closed");
    }

    #[tokio::test]
    async fn relay_requires_membership_and_skips_sender() {
        let rooms = Rooms::new();
        let (owner, mut rx_owner) = rooms.connect().await;
        let (stranger, mut rx_stranger) = rooms.connect().await;
        let (outsider, _rx_outsider) = rooms.connect().await;
        rooms.join(owner, "s1").await;
        rooms.join(stranger, "s1").await;

        let offer = json!({ "sessionId": "s1", "sdp": "v=0" });
        assert_eq!(rooms.relay(outsider, SignalKind::Offer, offer.clone()).await, 0);
        assert!(rx_owner.try_recv().is_err());

        assert_eq!(rooms.relay(stranger, SignalKind::Offer, offer).await, 1);
        let frame = parse(&rx_owner.try_recv().unwrap());
        assert_eq!(frame.event, "webrtc_offer");
        assert_eq!(frame.data["sdp"], "v=0");
        assert!(rx_stranger.try_recv().is_err());

        assert_eq!(rooms.relay(stranger, SignalKind::Answer, json!({ "sdp": "x" })).await, 0);
    }
}
