//! Discovery engine: pending out-of-band requests and their responses.
//!
//! A request is registered when created and resolved exactly once: by a
//! matching response, by expiry (lazily on lookup or by [`DiscoveryEngine::sweep`])
//! or by cancellation. Resolved ids are remembered until their expiry so that
//! a late duplicate response is reported as unknown and an id is never reused.
//!
//! The expiry is part of the content an id is derived from, and an expired
//! request is never registered. Forgetting a retired id once it has expired
//! therefore cannot let it come back.
//!
//! # Invariants
//!
//! - An id is pending at most once over the engine's lifetime
//! - A pending request is removed exactly when it resolves
//! - A retired id is kept until its expiry, then dropped by the next sweep

use std::collections::HashMap;

use tether_proto::{Address, DiscoveryRequest, DiscoveryResponse, Flags, KeyPackage, RequestId};

use crate::error::DiscoveryError;

/// How a pending request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A peer answered before the expiry
    Resolved {
        /// Request that was answered
        request_id: RequestId,
        /// Inbox of the responder
        responder: Address,
    },
    /// The response arrived after the expiry
    Expired {
        /// Request that expired
        request_id: RequestId,
    },
}

/// Pending discovery requests.
#[derive(Debug, Default)]
pub struct DiscoveryEngine {
    pending: HashMap<RequestId, DiscoveryRequest>,
    /// Resolved ids and their expiry
    retired: HashMap<RequestId, u64>,
}

impl DiscoveryEngine {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a request.
    ///
    /// Creating a request identical to one that is still pending returns the
    /// pending request (a retransmission shares the id).
    ///
    /// # Errors
    ///
    /// - `DiscoveryError::Expired` if `expires` is not after `now_secs`;
    ///   nothing is registered
    /// - `DiscoveryError::RequestIdReused` if the id was already resolved
    /// - `DiscoveryError::Protocol` if the request cannot be encoded
    pub fn create_request(
        &mut self,
        key_package: KeyPackage,
        expires: u64,
        flags: Flags,
        now_secs: u64,
    ) -> Result<DiscoveryRequest, DiscoveryError> {
        let request = DiscoveryRequest::new(key_package, expires, flags)?;

        if request.is_expired(now_secs) {
            return Err(DiscoveryError::Expired(request.id));
        }
        if self.retired.contains_key(&request.id) {
            return Err(DiscoveryError::RequestIdReused(request.id));
        }
        if let Some(existing) = self.pending.get(&request.id) {
            return Ok(existing.clone());
        }

        tracing::debug!(request_id = %request.id, expires, "discovery request registered");
        self.pending.insert(request.id, request.clone());
        Ok(request)
    }

    /// Correlate a response with its request.
    ///
    /// A response to an expired request resolves it as
    /// [`Resolution::Expired`]: the request is no longer pending afterwards
    /// either way.
    ///
    /// # Errors
    ///
    /// - `DiscoveryError::UnknownRequest` if nothing is pending under
    ///   `response_to` (never created, already resolved, or cancelled)
    pub fn on_response(
        &mut self,
        response: &DiscoveryResponse,
        responder: Address,
        now_secs: u64,
    ) -> Result<Resolution, DiscoveryError> {
        let request_id = response.response_to;
        let request =
            self.pending.remove(&request_id).ok_or(DiscoveryError::UnknownRequest(request_id))?;
        self.retired.insert(request_id, request.expires);

        if request.is_expired(now_secs) {
            tracing::debug!(%request_id, expires = request.expires, "discovery response after expiry");
            return Ok(Resolution::Expired { request_id });
        }

        tracing::debug!(%request_id, %responder, "discovery request resolved");
        Ok(Resolution::Resolved { request_id, responder })
    }

    /// Remove every request expired at `now_secs` and forget retired ids
    /// that expired before this sweep. Returns the newly expired ids.
    pub fn sweep(&mut self, now_secs: u64) -> Vec<RequestId> {
        self.retired.retain(|_, expires| now_secs < *expires);

        let expired: Vec<RequestId> = self
            .pending
            .values()
            .filter(|request| request.is_expired(now_secs))
            .map(|request| request.id)
            .collect();

        for id in &expired {
            if let Some(request) = self.pending.remove(id) {
                self.retired.insert(*id, request.expires);
            }
        }
        expired
    }

    /// Abandon a pending request. Returns true if it was pending.
    pub fn cancel(&mut self, request_id: &RequestId) -> bool {
        let Some(request) = self.pending.remove(request_id) else {
            return false;
        };
        self.retired.insert(*request_id, request.expires);
        true
    }

    /// True if `request_id` is awaiting a response.
    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of resolved ids still remembered.
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }
}
