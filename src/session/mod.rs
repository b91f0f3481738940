pub mod config;

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

use config::SessionOverrides;

/// Process-unique identifier for one socket connection.
pub type ConnId = u64;

/// Which of the three sockets a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Twilio media stream (`/call`).
    Telephony,
    /// Operator UI (`/logs`).
    Observer,
    /// Realtime model socket.
    Model,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Telephony => "telephony",
            Role::Observer => "observer",
            Role::Model => "model",
        })
    }
}

/// Frames queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Write half of a live socket, as seen by the relay.
///
/// The socket task owns the actual WebSocket; the relay only queues frames.
/// Sending never blocks and silently does nothing once the socket is gone.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    role: Role,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    /// Create a connection handle and the receiver its socket task drains.
    pub fn open(id: ConnId, role: Role) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, role, tx }, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send_text(&self, text: String) {
        if self.tx.send(Outbound::Text(text)).is_err() {
            tracing::trace!(role = %self.role, conn = self.id, "Dropping frame for closed socket");
        }
    }

    pub fn send<T: Serialize>(&self, message: &T) {
        self.send_text(crate::codec::to_text(message));
    }

    /// Ask the socket task to close the connection.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// State of the model socket for the current call.
#[derive(Debug, Default)]
pub enum ModelLink {
    #[default]
    Closed,
    /// Dial in flight; frames for the model are dropped until it opens.
    Connecting(ConnId),
    Open(Connection),
}

impl ModelLink {
    pub fn connection(&self) -> Option<&Connection> {
        match self {
            ModelLink::Open(conn) if conn.is_open() => Some(conn),
            _ => None,
        }
    }

    pub fn is_attached(&self) -> bool {
        !matches!(self, ModelLink::Closed)
    }

    fn id(&self) -> Option<ConnId> {
        match self {
            ModelLink::Closed => None,
            ModelLink::Connecting(id) => Some(*id),
            ModelLink::Open(conn) => Some(conn.id()),
        }
    }

    fn shutdown(&mut self) {
        if let ModelLink::Open(conn) = std::mem::take(self) {
            conn.close();
        }
    }
}

/// The assistant speech currently playing out on the call.
///
/// Item id and start timestamp only ever exist together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantTurn {
    pub item_id: String,
    /// Telephony-clock time (ms) at which the first audio delta was relayed.
    pub started_at_ms: u64,
}

/// Authoritative state of the single active call.
#[derive(Debug, Default)]
pub struct Session {
    pub telephony: Option<Connection>,
    pub observer: Option<Connection>,
    pub model: ModelLink,
    pub stream_sid: Option<String>,
    pub saved_config: Option<SessionOverrides>,
    pub assistant_turn: Option<AssistantTurn>,
    pub latest_media_timestamp_ms: u64,
    pub api_key: Option<String>,
}

impl Session {
    /// True when no socket of any role is attached.
    pub fn is_vacant(&self) -> bool {
        self.telephony.is_none() && self.observer.is_none() && !self.model.is_attached()
    }

    /// Whether `id` is the live connection for `role`.
    pub fn is_current(&self, role: Role, id: ConnId) -> bool {
        match role {
            Role::Telephony => self.telephony.as_ref().map(Connection::id) == Some(id),
            Role::Observer => self.observer.as_ref().map(Connection::id) == Some(id),
            Role::Model => self.model.id() == Some(id),
        }
    }

    /// Install a new telephony socket, closing any previous one.
    ///
    /// A preempted call has ended, so its model turn and call state go too.
    pub fn attach_telephony(&mut self, conn: Connection, api_key: String) {
        if let Some(previous) = self.telephony.take() {
            tracing::info!(
                previous = previous.id(),
                next = conn.id(),
                "Preempting telephony connection"
            );
            previous.close();
            self.end_call();
        }
        self.telephony = Some(conn);
        self.api_key = Some(api_key);
    }

    /// Install a new observer socket, closing any previous one.
    pub fn attach_observer(&mut self, conn: Connection) {
        if let Some(previous) = self.observer.replace(conn) {
            tracing::info!(previous = previous.id(), "Preempting observer connection");
            previous.close();
        }
    }

    /// Clear `role` if `id` is still its live connection. Returns false for
    /// stale ids (e.g. a socket that was already preempted).
    ///
    /// Detaching telephony also ends the model turn. The session resets once
    /// nothing is attached.
    pub fn detach(&mut self, role: Role, id: ConnId) -> bool {
        if !self.is_current(role, id) {
            return false;
        }
        match role {
            Role::Telephony => {
                if let Some(conn) = self.telephony.take() {
                    conn.close();
                }
                self.end_call();
            }
            Role::Observer => {
                if let Some(conn) = self.observer.take() {
                    conn.close();
                }
            }
            Role::Model => self.model.shutdown(),
        }
        self.reset_if_vacant();
        true
    }

    /// Close every socket and forget everything, including saved config.
    pub fn close_all(&mut self) {
        if let Some(conn) = self.telephony.take() {
            conn.close();
        }
        self.model.shutdown();
        if let Some(conn) = self.observer.take() {
            conn.close();
        }
        *self = Session::default();
    }

    pub fn reset_if_vacant(&mut self) {
        if self.is_vacant() {
            tracing::debug!("No connections left, discarding session");
            *self = Session::default();
        }
    }

    fn end_call(&mut self) {
        self.model.shutdown();
        self.stream_sid = None;
        self.assistant_turn = None;
        self.latest_media_timestamp_ms = 0;
    }
}
