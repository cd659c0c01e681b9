//! In-process relay.
//!
//! Routes envelopes by destination inbox between transports connected to the
//! same [`MemoryRelay`]. Envelopes for an inbox nobody subscribed yet, or
//! whose owner is disconnected, wait in a mailbox and are flushed on
//! subscribe or reconnect. Every envelope crosses the relay as encoded bytes.
//!
//! All routing happens under one lock, so envelopes from one sender to one
//! inbox arrive in send order.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use tether_proto::{Address, Envelope};
use tokio::sync::mpsc;

use crate::transport::{Transport, TransportError, TransportEvent};

type ClientId = u64;

struct Client {
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: bool,
}

#[derive(Default)]
struct RelayState {
    next_client: ClientId,
    clients: HashMap<ClientId, Client>,
    routes: HashMap<Address, ClientId>,
    mailboxes: HashMap<Address, VecDeque<Envelope>>,
}

impl RelayState {
    fn deliverable(&self, inbox: &Address) -> Option<&Client> {
        let client = self.clients.get(self.routes.get(inbox)?)?;
        client.connected.then_some(client)
    }

    fn flush(&mut self, inbox: Address) {
        let Some(events) = self.deliverable(&inbox).map(|client| client.events.clone()) else {
            return;
        };
        let Some(mut queued) = self.mailboxes.remove(&inbox) else {
            return;
        };
        while let Some(envelope) = queued.pop_front() {
            if let Err(mpsc::error::SendError(event)) = events.send(TransportEvent::Envelope(envelope)) {
                if let TransportEvent::Envelope(envelope) = event {
                    queued.push_front(envelope);
                }
                self.mailboxes.insert(inbox, queued);
                return;
            }
        }
    }
}

/// Shared in-memory relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client.
    ///
    /// The returned receiver yields `Connect` first.
    pub fn connect(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().expect("relay lock poisoned");
        let id = state.next_client;
        state.next_client += 1;

        let _ = tx.send(TransportEvent::Connect);
        state.clients.insert(id, Client { events: tx, connected: true });
        drop(state);

        tracing::debug!(client = id, "memory transport connected");
        let transport = MemoryTransport { relay: self.clone(), client: id, sent: Arc::new(AtomicUsize::new(0)) };
        (transport, rx)
    }

    /// Envelopes waiting for `inbox`.
    pub fn queued(&self, inbox: &Address) -> usize {
        let state = self.state.lock().expect("relay lock poisoned");
        state.mailboxes.get(inbox).map_or(0, VecDeque::len)
    }

    fn set_connected(&self, client: ClientId, connected: bool, reason: Option<String>) {
        let mut state = self.state.lock().expect("relay lock poisoned");
        let Some(entry) = state.clients.get_mut(&client) else {
            return;
        };
        if entry.connected == connected {
            return;
        }
        entry.connected = connected;
        let event = if connected { TransportEvent::Connect } else { TransportEvent::Disconnect { reason } };
        let _ = entry.events.send(event);

        if connected {
            let inboxes: Vec<Address> =
                state.routes.iter().filter(|(_, owner)| **owner == client).map(|(inbox, _)| *inbox).collect();
            for inbox in inboxes {
                state.flush(inbox);
            }
        }
    }

    fn route(&self, client: ClientId, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = envelope.to_bytes().map_err(|e| TransportError::Protocol(e.to_string()))?;
        let received = Envelope::decode(&bytes).map_err(|e| TransportError::Protocol(e.to_string()))?;

        let mut state = self.state.lock().expect("relay lock poisoned");
        if !state.clients.get(&client).is_some_and(|c| c.connected) {
            return Err(TransportError::Disconnected);
        }

        let to = received.to;
        let mailbox_empty = state.mailboxes.get(&to).is_none_or(VecDeque::is_empty);
        if mailbox_empty
            && let Some(owner) = state.deliverable(&to)
            && owner.events.send(TransportEvent::Envelope(received.clone())).is_ok()
        {
            return Ok(());
        }
        state.mailboxes.entry(to).or_default().push_back(received);
        tracing::trace!(%to, "envelope queued");
        Ok(())
    }

    fn subscribe(&self, client: ClientId, inbox: Address) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("relay lock poisoned");
        if !state.clients.get(&client).is_some_and(|c| c.connected) {
            return Err(TransportError::Disconnected);
        }
        state.routes.insert(inbox, client);
        state.flush(inbox);
        Ok(())
    }

    fn is_connected(&self, client: ClientId) -> bool {
        let state = self.state.lock().expect("relay lock poisoned");
        state.clients.get(&client).is_some_and(|c| c.connected)
    }
}

/// One client's connection to a [`MemoryRelay`].
#[derive(Clone)]
pub struct MemoryTransport {
    relay: MemoryRelay,
    client: ClientId,
    sent: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Simulate losing the relay.
    pub fn disconnect(&self, reason: impl Into<String>) {
        self.relay.set_connected(self.client, false, Some(reason.into()));
    }

    /// Restore the connection and flush queued envelopes.
    pub fn reconnect(&self) {
        self.relay.set_connected(self.client, true, None);
    }

    /// Envelopes accepted by the relay from this transport.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, envelope: Envelope) -> impl Future<Output = Result<(), TransportError>> + Send {
        let result = self.relay.route(self.client, &envelope);
        if result.is_ok() {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
        std::future::ready(result)
    }

    fn subscribe(&self, inbox: Address) -> impl Future<Output = Result<(), TransportError>> + Send {
        std::future::ready(self.relay.subscribe(self.client, inbox))
    }

    fn is_connected(&self) -> bool {
        self.relay.is_connected(self.client)
    }
}
