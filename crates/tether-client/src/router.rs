//! Background router for inbound transport events.
//!
//! Demultiplexes envelopes by kind into the account's state machines:
//!
//! - `KeyPackage`: establish a channel as responder
//! - `Welcome`: complete one of our negotiations
//! - `Commit` / `Proposal`: verify and surface
//! - `Message`: open, acknowledge, then deliver or resolve discovery
//! - `Acknowledgement` / `Error`: settle the outgoing message
//!
//! Nothing inbound can fail the account. A frame that cannot be processed is
//! logged and surfaced as [`AccountEvent::Dropped`].

use std::sync::Arc;

use tether_core::{DiscoveryError, DispatchError, Environment, HandshakeError, Message, Resolution};
use tether_proto::{
    Acknowledgement, Address, CommitData, DiscoveryResponse, EncryptedMessage, Envelope, ErrorPayload, KeyPackage,
    Payload, ProposalData, Status, TypedContent, Welcome,
};
use tokio::sync::mpsc;

use crate::{
    account::Shared,
    error::AccountError,
    event::AccountEvent,
    transport::{Transport, TransportEvent},
};

pub(crate) struct EventRouter<T, E: Environment> {
    shared: Arc<Shared<T, E>>,
}

impl<T: Transport, E: Environment> EventRouter<T, E> {
    pub(crate) fn new(shared: Arc<Shared<T, E>>) -> Self {
        Self { shared }
    }

    /// Process events until the transport closes its channel.
    pub(crate) async fn run(self, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            self.route(event).await;
        }
        tracing::debug!("transport event stream closed");
    }

    async fn route(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connect => self.on_connect().await,
            TransportEvent::Disconnect { reason } => {
                tracing::warn!(reason = reason.as_deref().unwrap_or("unknown"), "transport disconnected");
                self.shared.emit(AccountEvent::Disconnected { reason });
            },
            TransportEvent::Envelope(envelope) => self.on_envelope(envelope).await,
        }
    }

    async fn on_connect(&self) {
        for inbox in self.shared.live_inboxes() {
            if let Err(err) = self.shared.transport.subscribe(inbox).await {
                tracing::warn!(%inbox, error = %err, "resubscribe failed");
            }
        }
        tracing::info!("transport connected");
        self.shared.emit(AccountEvent::Connected);
    }

    async fn on_envelope(&self, envelope: Envelope) {
        let (kind, from, to) = (envelope.kind, envelope.from, envelope.to);
        tracing::trace!(?kind, %from, %to, "envelope received");

        let result = if self.shared.owns_inbox(&to) {
            match Payload::from_envelope(&envelope) {
                Ok(payload) => self.dispatch(from, to, payload).await,
                Err(err) => Err(err.into()),
            }
        } else {
            Err(HandshakeError::Misaddressed(to).into())
        };

        if let Err(err) = result {
            let status = err.status();
            tracing::warn!(?kind, %from, %to, ?status, error = %err, "inbound envelope dropped");
            self.shared.emit(AccountEvent::Dropped { kind, from, status });
        }
    }

    async fn dispatch(&self, from: Address, to: Address, payload: Payload) -> Result<(), AccountError> {
        match payload {
            Payload::KeyPackage(key_package) => self.on_key_package(to, &key_package).await,
            Payload::Welcome(welcome) => self.on_welcome(&welcome).await,
            Payload::Commit(commit) => self.on_commit(from, &commit),
            Payload::Proposal(proposal) => self.on_proposal(from, &proposal),
            Payload::Message(message) => self.on_message(from, to, &message).await,
            Payload::Acknowledgement(ack) => self.on_acknowledgement(from, &ack),
            Payload::Error(error) => self.on_error(from, &error),
        }
    }

    async fn on_key_package(&self, local: Address, key_package: &KeyPackage) -> Result<(), AccountError> {
        let settled = self.shared.establish(local, key_package).await?;
        if !settled.replayed {
            self.shared.emit(AccountEvent::ConnectionEstablished {
                status: Status::Success,
                peer: settled.peer,
                group: settled.group,
            });
        }
        Ok(())
    }

    async fn on_welcome(&self, welcome: &Welcome) -> Result<(), AccountError> {
        let settled = self.shared.accept(welcome).await?;
        if !settled.replayed {
            tracing::info!(peer = %settled.peer, group = %settled.group, "connection accepted");
            self.shared.emit(AccountEvent::ConnectionAccepted {
                status: Status::Success,
                peer: settled.peer,
                group: settled.group,
            });
        }
        Ok(())
    }

    fn on_commit(&self, from: Address, commit: &CommitData) -> Result<(), AccountError> {
        if self.shared.handshake().on_commit(from, commit)? {
            self.shared.emit(AccountEvent::Commit { from, group: commit.group, epoch: commit.epoch });
        }
        Ok(())
    }

    fn on_proposal(&self, from: Address, proposal: &ProposalData) -> Result<(), AccountError> {
        self.shared.handshake().on_proposal(from, proposal)?;
        self.shared.emit(AccountEvent::Proposal { from, group: proposal.group });
        Ok(())
    }

    async fn on_message(&self, from: Address, to: Address, encrypted: &EncryptedMessage) -> Result<(), AccountError> {
        let opened = {
            let mut channels = self.shared.channels();
            match channels.get_mut(&from) {
                None => Err(DispatchError::ChannelNotReady { peer: from, state: None }),
                Some(channel) => {
                    let dispatcher = self.shared.dispatcher();
                    match dispatcher.receive(channel, encrypted) {
                        Ok(message) => dispatcher.acknowledge(channel, message.id).map(|ack| (message, ack)),
                        Err(err) => Err(err),
                    }
                },
            }
        };

        let (message, ack) = match opened {
            Ok(opened) => opened,
            Err(DispatchError::UnsupportedContentType(code)) => {
                self.reject(to, from, encrypted, Status::UnsupportedContentType, format!("content type {code:#06x}"))
                    .await;
                return Err(DispatchError::UnsupportedContentType(code).into());
            },
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = self.shared.send(ack).await {
            tracing::warn!(message = %message.id, error = %err, "acknowledgement not sent");
        }
        self.deliver(message)
    }

    fn deliver(&self, message: Message) -> Result<(), AccountError> {
        tracing::debug!(
            message = %message.id,
            from = %message.from,
            content_type = message.content.content_type().name(),
            "message received"
        );
        match &message.content {
            TypedContent::DiscoveryResponse(response) => return self.on_discovery_response(response, message.from),
            TypedContent::Introduction(introduction) => {
                self.shared.store_tokens(message.from, message.to, introduction.tokens.clone());
            },
            TypedContent::DiscoveryRequest(_) | TypedContent::Chat(_) => {},
        }
        self.shared.emit(AccountEvent::MessageReceived(message));
        Ok(())
    }

    fn on_discovery_response(&self, response: &DiscoveryResponse, responder: Address) -> Result<(), AccountError> {
        let now = self.shared.now();
        let resolution = self.shared.discovery().on_response(response, responder, now)?;
        match resolution {
            Resolution::Resolved { request_id, responder } => {
                tracing::info!(%request_id, %responder, "discovery request resolved");
                self.shared.resolve_discovery(request_id, Ok(responder));
            },
            Resolution::Expired { request_id } => {
                tracing::warn!(%request_id, %responder, "discovery response arrived after expiry");
                self.shared.resolve_discovery(request_id, Err(DiscoveryError::Expired(request_id).into()));
            },
        }
        Ok(())
    }

    fn on_acknowledgement(&self, from: Address, ack: &Acknowledgement) -> Result<(), AccountError> {
        let reference = self.shared.dispatcher().on_acknowledgement(from, ack)?;
        self.shared.settle(reference, Status::Success);
        tracing::debug!(message = %reference, %from, "message acknowledged");
        self.shared.emit(AccountEvent::Acknowledged { reference, from });
        Ok(())
    }

    fn on_error(&self, from: Address, error: &ErrorPayload) -> Result<(), AccountError> {
        let status = error.status();
        let Some(reference) = error.reference else {
            tracing::warn!(%from, ?status, message = %error.message, "peer reported an error");
            self.shared.emit(AccountEvent::PeerError { from, status, message: error.message.clone() });
            return Ok(());
        };

        self.shared.dispatcher().on_error(from, reference, status)?;
        self.shared.settle(reference, status);
        tracing::warn!(message = %reference, %from, ?status, reason = %error.message, "message refused by peer");
        self.shared.emit(AccountEvent::DeliveryFailed { reference, status });
        Ok(())
    }

    async fn reject(&self, local: Address, peer: Address, encrypted: &EncryptedMessage, status: Status, reason: String) {
        let envelope = self.shared.dispatcher().reject(local, peer, Some(encrypted.id), status, reason);
        let sent = match envelope {
            Ok(envelope) => self.shared.send(envelope).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = sent {
            tracing::warn!(message = %encrypted.id, %peer, error = %err, "error report not sent");
        }
    }
}
