//! Transport-independent relay core.
//!
//! ```text
//!  join(deviceId) ──► register / mark online ─► room.add ─► last_operation? ─► connection_ack
//!  inbound frame ───► classify ─► record ─► enrich ─► fan-out to N-1 members (+N outbound records)
//!  leave(session) ──► room.remove ─► (room empty? drop room + mark offline) ─► record disconnect
//! ```
//!
//! Room mutations and the store writes that belong to them run inside one
//! critical section (`rooms` mutex), so a broadcast never sees a
//! half-joined or half-removed member and a device flips offline exactly
//! once when its last connection leaves.
//!
//! The socket side lives in [`server`](crate::server); everything here can be
//! driven directly from tests through the returned outbound receivers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use hublink_store::{DeviceStatus, DeviceStore, Direction, LogLevel, Operation, OperationStatus};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::protocol::{
    encode_envelope, enrich, ErrorNotice, Frame, Inbound, InboundMessage, Notice, ProtocolError,
    DEFAULT_OPERATION_TYPE,
};
use crate::room::{ConnectionId, Departure, Outbox, RoomTable};

/// Interaction type for regular traffic.
const MESSAGE_INTERACTION: &str = "message";

/// One joined connection.
///
/// Dropping a session without calling [`Relay::leave`] leaves a dead member
/// in the room until the next leave; the server always calls `leave`.
#[derive(Debug)]
pub struct Session {
    device_id: String,
    conn_id: ConnectionId,
    /// Sender half of this connection's own queue, for direct replies.
    reply: Outbox,
}

impl Session {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub active_rooms: usize,
    pub total_messages: u64,
    pub messages_fanned_out: u64,
    pub sends_skipped: u64,
    pub invalid_messages: u64,
    pub known_devices: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    messages_fanned_out: AtomicU64,
    sends_skipped: AtomicU64,
    invalid_messages: AtomicU64,
}

/// Pin switch command accepted by [`Relay::dispatch_control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    On,
    Off,
}

impl ControlAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ON" => Some(Self::On),
            "OFF" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    /// Pin level: ON = 1, OFF = 0.
    pub fn state(&self) -> u8 {
        match self {
            Self::On => 1,
            Self::Off => 0,
        }
    }
}

/// Outcome of a server-originated control command.
#[derive(Debug, Clone)]
pub struct ControlDispatch {
    pub operation: Operation,
    /// Room members the command was queued for.
    pub delivered: usize,
}

/// Room relay: membership, classification, recording, fan-out.
pub struct Relay {
    store: Arc<DeviceStore>,
    rooms: Mutex<RoomTable>,
    counters: Counters,
}

impl Relay {
    pub fn new(store: Arc<DeviceStore>) -> Self {
        Self {
            store,
            rooms: Mutex::new(RoomTable::new()),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    /// Admit a connection to the room named `device_id`.
    ///
    /// Returns the session and the receiver the transport must drain. The
    /// `last_operation` hint (if any) and the `connection_ack` are already
    /// queued on it, ahead of any broadcast.
    pub async fn join(&self, device_id: &str) -> (Session, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            device_id: device_id.to_string(),
            conn_id: Uuid::new_v4(),
            reply: tx.clone(),
        };

        let mut rooms = self.rooms.lock().await;
        if self.store.contains(device_id) {
            self.store.update_device_status(device_id, DeviceStatus::Online);
        } else {
            self.store.register_device(device_id, None);
        }
        self.store
            .add_interaction(device_id, "connected", Direction::Inbound, json!({}));
        rooms.join(device_id, session.conn_id, tx);

        let now = Utc::now();
        if let Some(op) = self.store.get_last_operation(device_id) {
            queue(&session.reply, Notice::last_operation(op, now).encode());
        }
        queue(&session.reply, Notice::connection_ack(device_id, now).encode());
        let members = rooms.member_count(device_id);
        drop(rooms);

        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Client connected to instance: {device_id} ({members} member(s))");
        (session, rx)
    }

    /// Process one text frame from `session`.
    pub async fn handle_text(&self, session: &Session, text: &str) {
        self.handle_parsed(session, Inbound::parse(text)).await;
    }

    /// Process one binary frame (UTF-8 JSON) from `session`.
    pub async fn handle_binary(&self, session: &Session, bytes: &[u8]) {
        self.handle_parsed(session, Inbound::parse_bytes(bytes)).await;
    }

    async fn handle_parsed(&self, session: &Session, parsed: Result<Inbound, ProtocolError>) {
        match parsed {
            Ok(inbound) => self.relay_message(session, inbound).await,
            Err(e) => self.reject(session, &e),
        }
    }

    /// Malformed payload: tell the sender, log it, touch nothing else.
    fn reject(&self, session: &Session, error: &ProtocolError) {
        self.counters.invalid_messages.fetch_add(1, Ordering::Relaxed);
        log::warn!("Invalid payload from {}: {error}", session.device_id);
        self.store.add_log(
            &session.device_id,
            LogLevel::Error,
            "Invalid JSON received",
            Some(json!({ "error": error.to_string() })),
        );
        queue(&session.reply, ErrorNotice::invalid_json().encode());
    }

    async fn relay_message(&self, session: &Session, inbound: Inbound) {
        let device_id = session.device_id.as_str();
        let raw = inbound.raw_value();
        let now = Utc::now();

        let mut rooms = self.rooms.lock().await;
        self.record(device_id, &inbound.kind);
        self.store
            .add_interaction(device_id, MESSAGE_INTERACTION, Direction::Inbound, raw.clone());

        let frame = match encode_envelope(&enrich(&inbound.raw, device_id, now)) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode envelope for {device_id}: {e}");
                return;
            }
        };
        let outcome = rooms.fan_out(device_id, Some(&session.conn_id), &frame);
        // One outbound record per recipient, carrying the un-enriched message.
        for _ in 0..outcome.delivered {
            self.store
                .add_interaction(device_id, MESSAGE_INTERACTION, Direction::Outbound, raw.clone());
        }
        drop(rooms);

        self.counters.total_messages.fetch_add(1, Ordering::Relaxed);
        self.counters
            .messages_fanned_out
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.counters
            .sends_skipped
            .fetch_add(outcome.skipped as u64, Ordering::Relaxed);
        log::trace!(
            "Relayed message in {device_id} to {} peer(s), {} skipped",
            outcome.delivered,
            outcome.skipped
        );
    }

    /// Store side effects of a classified message.
    fn record(&self, device_id: &str, kind: &InboundMessage) {
        match kind {
            InboundMessage::Operation {
                operation_type,
                action,
                payload,
            } => {
                let op = self.store.add_operation(
                    device_id,
                    operation_type,
                    action,
                    payload.clone(),
                    OperationStatus::Pending,
                );
                self.store.add_log(
                    device_id,
                    LogLevel::Info,
                    &format!("Operation initiated: {action}"),
                    Some(json!({ "operationId": op.id })),
                );
            }
            InboundMessage::OperationStatus {
                operation_id,
                status,
                error,
            } => {
                self.store
                    .update_operation_status(device_id, operation_id, *status, error.clone());
                let (level, message) = match (status, error) {
                    (OperationStatus::Failed, Some(error)) => (
                        LogLevel::Error,
                        format!("Operation {operation_id} failed: {error}"),
                    ),
                    (OperationStatus::Failed, None) => {
                        (LogLevel::Error, format!("Operation {operation_id} failed"))
                    }
                    (status, _) => (
                        LogLevel::Info,
                        format!("Operation {operation_id} {}", status.as_str()),
                    ),
                };
                self.store.add_log(
                    device_id,
                    level,
                    &message,
                    Some(json!({ "operationId": operation_id })),
                );
            }
            InboundMessage::Log {
                level,
                message,
                metadata,
            } => {
                self.store.add_log(device_id, *level, message, metadata.clone());
            }
            InboundMessage::Generic => {}
        }
    }

    /// Remove a closed connection from its room.
    ///
    /// The device goes offline only when the room empties, which the
    /// returned [`Departure`] reports as `room_closed`.
    pub async fn leave(&self, session: Session) -> Departure {
        let device_id = session.device_id.as_str();

        let mut rooms = self.rooms.lock().await;
        let departure = rooms.leave(device_id, &session.conn_id);
        if !departure.removed {
            return departure;
        }
        if departure.room_closed {
            self.store.update_device_status(device_id, DeviceStatus::Offline);
        }
        self.store
            .add_interaction(device_id, "disconnected", Direction::Inbound, json!({}));
        self.store
            .add_log(device_id, LogLevel::Info, "Client disconnected", None);
        drop(rooms);

        log::info!("Client disconnected from instance: {device_id}");
        departure
    }

    /// Send a pin command to every member of `instance_id`.
    ///
    /// Records a pending operation and queues the enriched `operation`
    /// envelope for all members, including the outbound interaction per
    /// recipient.
    pub async fn dispatch_control(
        &self,
        instance_id: &str,
        pin: i64,
        action: ControlAction,
    ) -> Result<ControlDispatch, ProtocolError> {
        let payload = json!({ "pin": pin, "state": action.state() });
        let now = Utc::now();

        let mut rooms = self.rooms.lock().await;
        let operation = self.store.add_operation(
            instance_id,
            DEFAULT_OPERATION_TYPE,
            action.as_str(),
            Some(payload.clone()),
            OperationStatus::Pending,
        );
        self.store.add_log(
            instance_id,
            LogLevel::Info,
            &format!("Operation initiated: {}", action.as_str()),
            Some(json!({ "operationId": operation.id, "source": "http" })),
        );

        let mut message = Map::new();
        message.insert("type".into(), Value::from("operation"));
        message.insert("action".into(), Value::from(action.as_str()));
        message.insert("payload".into(), payload);
        message.insert("operationId".into(), Value::from(operation.id.clone()));

        let frame = encode_envelope(&enrich(&message, instance_id, now))?;
        let outcome = rooms.fan_out(instance_id, None, &frame);
        let raw = Value::Object(message);
        for _ in 0..outcome.delivered {
            self.store
                .add_interaction(instance_id, MESSAGE_INTERACTION, Direction::Outbound, raw.clone());
        }
        drop(rooms);

        self.counters
            .messages_fanned_out
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        log::info!(
            "Control {} pin {pin} sent to {instance_id} ({} member(s))",
            action.as_str(),
            outcome.delivered
        );
        Ok(ControlDispatch {
            operation,
            delivered: outcome.delivered,
        })
    }

    /// Latest ON/OFF command recorded for `pin` in `instance_id`.
    ///
    /// Looks for the newest operation whose payload names the pin and whose
    /// action is a control action. Operations that later failed are skipped.
    pub fn pin_state(&self, instance_id: &str, pin: i64) -> Option<(ControlAction, Operation)> {
        self.store
            .get_operations(instance_id, None)
            .into_iter()
            .rev()
            .filter(|op| op.status != OperationStatus::Failed)
            .filter(|op| {
                op.payload
                    .as_ref()
                    .and_then(|p| p.get("pin"))
                    .and_then(Value::as_i64)
                    == Some(pin)
            })
            .find_map(|op| ControlAction::parse(&op.action).map(|action| (action, op)))
    }

    /// Number of open connections in `room_id`.
    pub async fn member_count(&self, room_id: &str) -> usize {
        self.rooms.lock().await.member_count(room_id)
    }

    pub async fn has_room(&self, room_id: &str) -> bool {
        self.rooms.lock().await.room(room_id).is_some()
    }

    pub async fn stats(&self) -> RelayStats {
        let (active_rooms, active_connections) = {
            let rooms = self.rooms.lock().await;
            (rooms.room_count(), rooms.connection_count())
        };
        RelayStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections,
            active_rooms,
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            messages_fanned_out: self.counters.messages_fanned_out.load(Ordering::Relaxed),
            sends_skipped: self.counters.sends_skipped.load(Ordering::Relaxed),
            invalid_messages: self.counters.invalid_messages.load(Ordering::Relaxed),
            known_devices: self.store.device_count(),
        }
    }
}

fn queue(outbox: &Outbox, frame: Result<Frame, ProtocolError>) {
    match frame {
        Ok(frame) => {
            // A closed receiver means the transport is already gone.
            let _ = outbox.send(frame);
        }
        Err(e) => log::error!("Failed to encode notice: {e}"),
    }
}
