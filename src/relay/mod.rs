//! The session relay.
//!
//! One [`Relay`] owns the [`Session`] and consumes a single event queue. Socket
//! tasks (telephony, observer, model) and capability tasks only ever talk to it
//! through a [`RelayHandle`], so session state is mutated from exactly one
//! place and no locking is needed.

mod dispatch;
mod model;
mod observer;
mod telephony;
mod truncation;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::realtime::ModelDialer;
use crate::registry::CapabilityRegistry;
use crate::session::config::SessionConfig;
use crate::session::{ConnId, Connection, Role, Session};

use dispatch::FunctionCallDispatcher;

/// Everything that can happen to the session.
#[derive(Debug)]
pub enum RelayEvent {
    /// A telephony or observer socket was accepted.
    Connected(Connection),
    /// A text frame arrived on a socket.
    Message { role: Role, id: ConnId, text: String },
    /// A socket closed or failed.
    Closed { role: Role, id: ConnId },
    /// The model dial finished and the socket is ready for writing.
    ModelOpened(Connection),
    ModelDialFailed { id: ConnId, error: String },
    /// A capability finished; its output goes back to the model socket
    /// `model` that asked for it.
    FunctionOutput {
        model: ConnId,
        call_id: String,
        output: Value,
    },
    /// Hang up everything and reset the session, if `model` is still the
    /// call's model socket.
    DisconnectAll {
        model: ConnId,
        reason: Option<String>,
    },
}

/// Cloneable sender side of the relay's event queue.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayEvent>,
    next_id: Arc<AtomicU64>,
}

impl RelayHandle {
    /// A handle and the queue it feeds.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            rx,
        )
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn send(&self, event: RelayEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Relay is not running, dropping event");
        }
    }

    pub fn disconnect_all(&self, model: ConnId, reason: Option<String>) {
        self.send(RelayEvent::DisconnectAll { model, reason });
    }
}

/// Fixed inputs of the relay.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Credential for the model socket.
    pub api_key: String,
    /// `session.update` sent before any observer overrides.
    pub session_defaults: SessionConfig,
}

pub struct Relay {
    session: Session,
    settings: RelaySettings,
    dialer: Arc<dyn ModelDialer>,
    dispatcher: FunctionCallDispatcher,
    handle: RelayHandle,
}

impl Relay {
    pub fn new(
        settings: RelaySettings,
        registry: Arc<CapabilityRegistry>,
        dialer: Arc<dyn ModelDialer>,
    ) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (handle, events) = RelayHandle::channel();
        let relay = Self {
            session: Session::default(),
            settings,
            dialer,
            dispatcher: FunctionCallDispatcher::new(registry),
            handle,
        };
        (relay, events)
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    #[cfg(test)]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Consume events until every handle is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        tracing::info!("Relay started");
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        tracing::info!("Relay stopped");
    }

    /// Apply one event. Never blocks: slow work (model dial, capability
    /// handlers) is spawned and reports back through the queue.
    pub fn handle_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected(conn) => match conn.role() {
                Role::Telephony => {
                    tracing::info!(conn = conn.id(), "Telephony connected");
                    self.session
                        .attach_telephony(conn, self.settings.api_key.clone());
                }
                Role::Observer => {
                    tracing::info!(conn = conn.id(), "Observer connected");
                    self.session.attach_observer(conn);
                }
                Role::Model => {
                    tracing::warn!(conn = conn.id(), "Model sockets must announce via ModelOpened");
                    conn.close();
                }
            },
            RelayEvent::Message { role, id, text } => {
                if !self.session.is_current(role, id) {
                    tracing::trace!(%role, conn = id, "Ignoring frame from stale connection");
                    return;
                }
                match role {
                    Role::Telephony => self.on_telephony_message(&text),
                    Role::Observer => self.on_observer_message(&text),
                    Role::Model => self.on_model_message(id, &text),
                }
            }
            RelayEvent::Closed { role, id } => {
                if self.session.detach(role, id) {
                    tracing::info!(%role, conn = id, "Connection closed");
                }
            }
            RelayEvent::ModelOpened(conn) => self.on_model_opened(conn),
            RelayEvent::ModelDialFailed { id, error } => {
                tracing::error!(conn = id, "Model connection failed: {error}");
                self.session.detach(Role::Model, id);
            }
            RelayEvent::FunctionOutput {
                model,
                call_id,
                output,
            } => {
                if !self.session.is_current(Role::Model, model) {
                    tracing::debug!(conn = model, call_id, "Dropping output for a finished call");
                    return;
                }
                self.on_function_output(&call_id, output)
            }
            RelayEvent::DisconnectAll { model, reason } => {
                if !self.session.is_current(Role::Model, model) {
                    tracing::debug!(conn = model, "Ignoring hang-up from a finished call");
                    return;
                }
                tracing::info!(
                    reason = reason.as_deref().unwrap_or(""),
                    "Disconnecting all connections"
                );
                self.session.close_all();
            }
        }
    }
}
