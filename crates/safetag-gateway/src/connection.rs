use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{debug, info, warn};
use uuid::Uuid;

use safetag_db::{Database, hash_stranger_token};
use safetag_types::api::Claims;
use safetag_types::events::{ClientCommand, RoomEvent};

use crate::rooms::{Rooms, user_room};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Everything a socket needs to check what it is allowed to join.
#[derive(Clone)]
pub struct GatewayContext {
    pub rooms: Rooms,
    pub db: Arc<Database>,
    pub jwt_secret: Arc<str>,
}

/// Drive one WebSocket until either side goes away.
///
/// Sockets start anonymous. Owners send `identify` with their bearer token to
/// join their own room. A session room is only joined with proof: the
/// stranger token for that session, or an identify as the tag's owner.
pub async fn handle_connection(socket: WebSocket, ctx: GatewayContext) {
    let rooms = ctx.rooms.clone();
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut outbound) = rooms.connect().await;

    debug!("Connection {} opened", conn_id);
    rooms.send_to(conn_id, &RoomEvent::Ready { connection_id: conn_id }).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Outbound frames -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client commands
    let mut recv_task = tokio::spawn(async move {
        let mut identified: Option<Uuid> = None;
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(cmd) => handle_command(&ctx, conn_id, &mut identified, cmd).await,
                    Err(e) => {
                        warn!(
                            "Connection {} bad command: {} -- raw: {}",
                            conn_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    rooms.disconnect(conn_id).await;
    debug!("Connection {} closed", conn_id);
}

async fn handle_command(
    ctx: &GatewayContext,
    conn_id: Uuid,
    identified: &mut Option<Uuid>,
    cmd: ClientCommand,
) {
    let rooms = &ctx.rooms;
    match cmd {
        ClientCommand::Identify { token } => {
            let Some(claims) = verify_token(&token, &ctx.jwt_secret) else {
                warn!("Connection {} sent an invalid identify token", conn_id);
                return;
            };
            let user_id = claims.sub.to_string();
            if lookup(&ctx.db, move |db| db.get_user_by_id(&user_id)).await.is_none() {
                warn!("Connection {} identified as deleted user {}", conn_id, claims.sub);
                return;
            }

            if let Some(previous) = identified.replace(claims.sub).filter(|p| *p != claims.sub) {
                rooms.leave(conn_id, &user_room(previous)).await;
            }
            rooms.join(conn_id, &user_room(claims.sub)).await;
            rooms.send_to(conn_id, &RoomEvent::Identified { user_id: claims.sub }).await;
            info!("{} ({}) identified on connection {}", claims.name, claims.sub, conn_id);
        }

        ClientCommand::JoinSession { session_id, stranger_token } => {
            if may_join(ctx, *identified, &session_id, stranger_token).await {
                rooms.join(conn_id, &session_id).await;
                rooms.send_to(conn_id, &RoomEvent::SessionJoined { session_id: session_id.clone() }).await;
                debug!("Connection {} joined session {}", conn_id, session_id);
            } else {
                warn!("Connection {} refused session {}", conn_id, session_id);
                rooms.send_to(conn_id, &RoomEvent::JoinRefused { session_id }).await;
            }
        }

        ClientCommand::LeaveSession(session_id) => {
            rooms.leave(conn_id, &session_id).await;
            debug!("Connection {} left session {}", conn_id, session_id);
        }

        signal @ (ClientCommand::WebrtcOffer(_)
        | ClientCommand::WebrtcAnswer(_)
        | ClientCommand::WebrtcIceCandidate(_)) => {
            if let Some((kind, payload)) = signal.into_signal() {
                rooms.relay(conn_id, kind, payload).await;
            }
        }
    }
}

/// A stranger proves a session with its token; an owner by having
/// identified as the owner of the session's tag. Owner rooms are never
/// joinable this way since no session carries a user's id.
async fn may_join(
    ctx: &GatewayContext,
    identified: Option<Uuid>,
    session_id: &str,
    stranger_token: Option<String>,
) -> bool {
    if let Some(token) = stranger_token {
        let hash = hash_stranger_token(&token);
        let session = lookup(&ctx.db, move |db| db.get_session_by_token_hash(&hash)).await;
        if session.is_some_and(|s| s.id == session_id) {
            return true;
        }
    }

    let Some(owner) = identified else {
        return false;
    };
    let id = session_id.to_string();
    lookup(&ctx.db, move |db| db.get_session(&id))
        .await
        .is_some_and(|s| s.owner_id == owner.to_string())
}

/// Store lookups run off the runtime. A failed lookup counts as not found.
async fn lookup<T, F>(db: &Arc<Database>, f: F) -> Option<T>
where
    F: FnOnce(&Database) -> anyhow::Result<Option<T>> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    match tokio::task::spawn_blocking(move || f(db.as_ref())).await {
        Ok(Ok(found)) => found,
        Ok(Err(e)) => {
            warn!("Gateway lookup failed: {:#}", e);
            None
        }
        Err(e) => {
            warn!("Gateway lookup task failed: {}", e);
            None
        }
    }
}

fn verify_token(token: &str, jwt_secret: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}
