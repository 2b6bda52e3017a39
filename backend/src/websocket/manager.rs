//! Registry of connected clients and the rooms they listen to
//!
//! Lock order is always `clients` then `rooms`. Outbound messages go through
//! a bounded channel per client, drained by that socket's writer task, so a
//! slow or dead socket never blocks a broadcast.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use glimmr_shared::{JobCounts, JobEventKind, WsMessage};

use super::events::{server_events, ClientRequest, JobEvent, Room};
use crate::auth::{authorize, AuthError, Principal, RoomAction, TokenVerifier};
use crate::error::{ApiResult, AppError};

/// Per-client outbound buffer
pub const CLIENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub socket_id: Uuid,
    pub user_id: String,
    pub roles: HashSet<String>,
    pub subscribed_rooms: HashSet<String>,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<WsMessage>,
}

pub struct EventGateway {
    clients: RwLock<HashMap<Uuid, ConnectedClient>>,
    rooms: RwLock<HashMap<String, HashSet<Uuid>>>,
    verifier: TokenVerifier,
    channel_capacity: usize,
}

impl EventGateway {
    pub fn new(verifier: TokenVerifier) -> Self {
        Self::with_capacity(verifier, CLIENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(verifier: TokenVerifier, channel_capacity: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            verifier,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Check a handshake token. Nothing is registered here.
    pub fn authenticate(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        self.verifier.verify(token).inspect_err(|e| {
            warn!(error = %e, "WebSocket authentication failed");
        })
    }

    /// Add an authenticated client and greet it with `connected`
    pub async fn register(&self, principal: Principal) -> (Uuid, mpsc::Receiver<WsMessage>) {
        let socket_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.channel_capacity);

        let client = ConnectedClient {
            socket_id,
            user_id: principal.user_id,
            roles: principal.roles,
            subscribed_rooms: HashSet::new(),
            connected_at: Utc::now(),
            sender,
        };

        info!(
            client_id = %socket_id,
            user_id = %client.user_id,
            roles = ?client.roles,
            "WebSocket client connected"
        );

        let greeting = WsMessage::new(
            server_events::CONNECTED,
            json!({
                "message": "Connected to job event stream",
                "clientId": socket_id,
            }),
        );
        deliver(socket_id, &client.sender, greeting);

        self.clients.write().await.insert(socket_id, client);
        (socket_id, receiver)
    }

    /// Authenticate then register
    pub async fn connect(
        &self,
        token: Option<&str>,
    ) -> Result<(Uuid, mpsc::Receiver<WsMessage>), AuthError> {
        let principal = self.authenticate(token)?;
        Ok(self.register(principal).await)
    }

    /// Remove a client and leave all its rooms. Safe to call repeatedly;
    /// returns whether the client was still registered.
    pub async fn disconnect(&self, client_id: Uuid) -> bool {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(&client_id);

        if let Some(client) = &removed {
            let mut rooms = self.rooms.write().await;
            for room in &client.subscribed_rooms {
                leave(&mut rooms, room, client_id);
            }
        }
        drop(clients);

        match &removed {
            Some(client) => info!(
                client_id = %client_id,
                user_id = %client.user_id,
                rooms = client.subscribed_rooms.len(),
                "WebSocket client disconnected"
            ),
            None => debug!(client_id = %client_id, "WebSocket client already disconnected"),
        }
        removed.is_some()
    }

    pub async fn subscribe(&self, client_id: Uuid, room: &Room) -> ApiResult<()> {
        let name = room.name();
        let mut clients = self.clients.write().await;
        let client = clients
            .get_mut(&client_id)
            .ok_or_else(|| AppError::Unauthorized("Client is not connected".to_string()))?;

        if let Err(e) = authorize(&client.roles, room.kind(), RoomAction::Subscribe, &name) {
            warn!(
                client_id = %client_id,
                user_id = %client.user_id,
                room = %name,
                "Room subscription denied"
            );
            return Err(e);
        }

        client.subscribed_rooms.insert(name.clone());
        self.rooms
            .write()
            .await
            .entry(name.clone())
            .or_default()
            .insert(client_id);

        info!(client_id = %client_id, user_id = %client.user_id, room = %name, "Client subscribed");
        Ok(())
    }

    /// Returns whether the client was in the room
    pub async fn unsubscribe(&self, client_id: Uuid, room: &Room) -> ApiResult<bool> {
        let name = room.name();
        let mut clients = self.clients.write().await;
        let client = clients
            .get_mut(&client_id)
            .ok_or_else(|| AppError::Unauthorized("Client is not connected".to_string()))?;

        authorize(&client.roles, room.kind(), RoomAction::Unsubscribe, &name)?;

        let was_member = client.subscribed_rooms.remove(&name);
        leave(&mut *self.rooms.write().await, &name, client_id);

        debug!(client_id = %client_id, room = %name, was_member, "Client unsubscribed");
        Ok(was_member)
    }

    /// Dispatch one client message and answer it
    pub async fn handle_request(&self, client_id: Uuid, msg: WsMessage) {
        let request = match ClientRequest::parse(&msg) {
            Ok(request) => request,
            Err(e) => {
                debug!(client_id = %client_id, event = %msg.event_type, "Rejected client request");
                self.reject(client_id, e).await;
                return;
            }
        };

        let reply = match &request {
            ClientRequest::Ping => Ok(WsMessage::new(
                server_events::PONG,
                json!({ "timestamp": Utc::now().to_rfc3339() }),
            )),
            ClientRequest::SubscribeQueue(_)
            | ClientRequest::SubscribeAll
            | ClientRequest::SubscribeJob(_) => match request.room() {
                Some(room) => self
                    .subscribe(client_id, &room)
                    .await
                    .map(|()| room_reply(server_events::SUBSCRIBED, &room)),
                None => Err(AppError::BadRequest("No room in request".to_string())),
            },
            ClientRequest::UnsubscribeQueue(_)
            | ClientRequest::UnsubscribeAll
            | ClientRequest::UnsubscribeJob(_) => match request.room() {
                Some(room) => self
                    .unsubscribe(client_id, &room)
                    .await
                    .map(|_| room_reply(server_events::UNSUBSCRIBED, &room)),
                None => Err(AppError::BadRequest("No room in request".to_string())),
            },
        };

        match reply {
            Ok(message) => {
                self.send_to(client_id, message).await;
            }
            Err(e) => self.reject(client_id, e).await,
        }
    }

    /// Send an `error` event to one client
    pub async fn reject(&self, client_id: Uuid, error: AppError) {
        let payload = serde_json::to_value(error.to_api_error()).unwrap_or(Value::Null);
        self.send_to(client_id, WsMessage::new(server_events::ERROR, payload))
            .await;
    }

    pub async fn send_to(&self, client_id: Uuid, msg: WsMessage) -> bool {
        let sender = self
            .clients
            .read()
            .await
            .get(&client_id)
            .map(|client| client.sender.clone());

        match sender {
            Some(sender) => deliver(client_id, &sender, msg),
            None => false,
        }
    }

    /// Deliver `msg` once to every client in any of `rooms`. Returns the
    /// number of clients it was handed to; failures are logged only.
    pub async fn broadcast_to_rooms(&self, rooms: &[Room], msg: WsMessage) -> usize {
        let recipients: Vec<(Uuid, mpsc::Sender<WsMessage>)> = {
            let clients = self.clients.read().await;
            let index = self.rooms.read().await;

            let members: HashSet<Uuid> = rooms
                .iter()
                .filter_map(|room| index.get(&room.name()))
                .flatten()
                .copied()
                .collect();

            members
                .into_iter()
                .filter_map(|id| clients.get(&id).map(|c| (id, c.sender.clone())))
                .collect()
        };

        recipients
            .iter()
            .filter(|(id, sender)| deliver(*id, sender, msg.clone()))
            .count()
    }

    pub async fn emit(&self, event: JobEvent) -> usize {
        let delivered = self
            .broadcast_to_rooms(&event.target_rooms(), event.to_message())
            .await;
        debug!(
            queue = %event.queue,
            job_id = ?event.job_id,
            kind = event.kind.as_str(),
            delivered,
            "Job event broadcast"
        );
        delivered
    }

    pub async fn job_started(&self, queue: &str, job_id: &str) -> usize {
        self.emit(JobEvent::for_job(queue, job_id, JobEventKind::Started))
            .await
    }

    pub async fn job_progress(&self, queue: &str, job_id: &str, progress: Value) -> usize {
        self.emit(
            JobEvent::for_job(queue, job_id, JobEventKind::Progress).with_field("progress", progress),
        )
        .await
    }

    pub async fn job_completed(&self, queue: &str, job_id: &str, result: Value) -> usize {
        self.emit(
            JobEvent::for_job(queue, job_id, JobEventKind::Completed).with_field("result", result),
        )
        .await
    }

    pub async fn job_failed(&self, queue: &str, job_id: &str, error: &str) -> usize {
        self.emit(
            JobEvent::for_job(queue, job_id, JobEventKind::Failed).with_field("error", json!(error)),
        )
        .await
    }

    /// `job` is the job as the queue reports it; its `id` selects the job room
    pub async fn job_added(&self, queue: &str, job: Value) -> usize {
        let job_id = match job.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        let event = match job_id {
            Some(id) => JobEvent::for_job(queue, id, JobEventKind::Added),
            None => JobEvent::new(queue, JobEventKind::Added),
        };
        self.emit(event.with_field("job", job)).await
    }

    pub async fn job_removed(&self, queue: &str, job_id: &str) -> usize {
        self.emit(JobEvent::for_job(queue, job_id, JobEventKind::Removed))
            .await
    }

    pub async fn queue_state_change(&self, queue: &str, state: &str) -> usize {
        self.emit(JobEvent::new(queue, JobEventKind::StateChange).with_field("state", json!(state)))
            .await
    }

    pub async fn alert(&self, queue: &str, severity: &str, message: &str) -> usize {
        self.emit(
            JobEvent::new(queue, JobEventKind::Alert)
                .with_field("severity", json!(severity))
                .with_field("message", json!(message)),
        )
        .await
    }

    pub async fn queue_stats(&self, queue: &str, counts: &JobCounts) -> usize {
        let msg = WsMessage::new(
            server_events::QUEUE_STATS,
            json!({
                "queue": queue,
                "counts": counts,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        self.broadcast_to_rooms(&[Room::Queue(queue.to_string()), Room::AllJobs], msg)
            .await
    }

    pub async fn system_stats(&self, totals: &JobCounts, queues: usize) -> usize {
        let msg = WsMessage::new(
            server_events::SYSTEM_STATS,
            json!({
                "queues": queues,
                "totals": totals,
                "connectedClients": self.client_count().await,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        self.broadcast_to_rooms(&[Room::AllJobs], msg).await
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn room_size(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, HashSet::len)
    }

    pub async fn client(&self, client_id: Uuid) -> Option<ConnectedClient> {
        self.clients.read().await.get(&client_id).cloned()
    }
}

fn room_reply(event: &str, room: &Room) -> WsMessage {
    WsMessage::new(event, json!({ "room": room.name() }))
}

fn leave(rooms: &mut HashMap<String, HashSet<Uuid>>, room: &str, client_id: Uuid) {
    if let Some(members) = rooms.get_mut(room) {
        members.remove(&client_id);
        if members.is_empty() {
            rooms.remove(room);
        }
    }
}

fn deliver(client_id: Uuid, sender: &mpsc::Sender<WsMessage>, msg: WsMessage) -> bool {
    match sender.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            warn!(client_id = %client_id, event = %msg.event_type, "Client outbound buffer full, dropping event");
            false
        }
        Err(TrySendError::Closed(msg)) => {
            debug!(client_id = %client_id, event = %msg.event_type, "Client channel closed, dropping event");
            false
        }
    }
}
