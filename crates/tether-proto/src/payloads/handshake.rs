//! Handshake payloads: key packages, welcomes, proposals and commits.
//!
//! Signatures are opaque bytes here; producing and verifying them is the
//! identity layer's job. Each type exposes the exact byte string that is
//! signed so both sides agree on it.

use serde::{Deserialize, Serialize};

use crate::{Address, KeyPackageRef, WelcomeId};

/// Ephemeral key material published so a peer can open a channel with us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPackage {
    /// Inbox that owns this key package
    pub owner: Address,
    /// X25519 public key used for the channel key agreement
    pub init_key: [u8; 32],
    /// Unix seconds after which the key package must be rejected
    pub expires: u64,
    /// Ed25519 signature by `owner` over [`KeyPackage::to_be_signed`]
    pub signature: Vec<u8>,
}

impl KeyPackage {
    /// Domain separation label for key package signatures.
    pub const SIGNING_LABEL: &'static [u8] = b"tether key package v1";

    /// Bytes covered by the owner's signature.
    #[must_use]
    pub fn to_be_signed(&self) -> Vec<u8> {
        let mut tbs = Vec::with_capacity(Self::SIGNING_LABEL.len() + 72);
        tbs.extend_from_slice(Self::SIGNING_LABEL);
        tbs.extend_from_slice(self.owner.as_bytes());
        tbs.extend_from_slice(&self.init_key);
        tbs.extend_from_slice(&self.expires.to_be_bytes());
        tbs
    }

    /// Hash reference identifying this key package.
    ///
    /// Covers the signed fields only, so it is stable before and after
    /// signing.
    #[must_use]
    pub fn reference(&self) -> KeyPackageRef {
        KeyPackageRef::digest(&[&self.to_be_signed()])
    }

    /// True once `now_secs` has reached the expiry.
    #[must_use]
    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.expires
    }
}

/// Admits the recipient to a channel created from one of its key packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Responder inbox that created the channel
    pub from: Address,
    /// Initiator inbox the welcome is addressed to
    pub to: Address,
    /// Key package the responder consumed
    pub key_package_ref: KeyPackageRef,
    /// Responder's ephemeral X25519 public key
    pub init_key: [u8; 32],
    /// Ed25519 signature by `from` over [`Welcome::to_be_signed`]
    pub signature: Vec<u8>,
}

impl Welcome {
    /// Domain separation label for welcome signatures.
    pub const SIGNING_LABEL: &'static [u8] = b"tether welcome v1";

    /// Bytes covered by the responder's signature.
    #[must_use]
    pub fn to_be_signed(&self) -> Vec<u8> {
        let mut tbs = Vec::with_capacity(Self::SIGNING_LABEL.len() + 128);
        tbs.extend_from_slice(Self::SIGNING_LABEL);
        tbs.extend_from_slice(self.from.as_bytes());
        tbs.extend_from_slice(self.to.as_bytes());
        tbs.extend_from_slice(self.key_package_ref.as_bytes());
        tbs.extend_from_slice(&self.init_key);
        tbs
    }

    /// Identifier used to detect replays.
    #[must_use]
    pub fn id(&self) -> WelcomeId {
        WelcomeId::digest(&[&self.to_be_signed(), &self.signature])
    }
}

/// Membership proposal for a group.
///
/// The proposal body is opaque to the handshake layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalData {
    /// Group the proposal applies to
    pub group: Address,
    /// Opaque proposal body
    pub proposal: Vec<u8>,
    /// Signature by the proposing inbox
    pub signature: Vec<u8>,
}

impl ProposalData {
    /// Domain separation label for proposal signatures.
    pub const SIGNING_LABEL: &'static [u8] = b"tether proposal v1";

    /// Bytes covered by the proposer's signature.
    #[must_use]
    pub fn to_be_signed(&self) -> Vec<u8> {
        let mut tbs = Vec::with_capacity(Self::SIGNING_LABEL.len() + 32 + self.proposal.len());
        tbs.extend_from_slice(Self::SIGNING_LABEL);
        tbs.extend_from_slice(self.group.as_bytes());
        tbs.extend_from_slice(&self.proposal);
        tbs
    }
}

/// Membership commit for a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitData {
    /// Group the commit applies to
    pub group: Address,
    /// Epoch the commit moves the group to
    pub epoch: u64,
    /// Opaque commit body
    pub commit: Vec<u8>,
    /// Signature by the committing inbox
    pub signature: Vec<u8>,
}

impl CommitData {
    /// Domain separation label for commit signatures.
    pub const SIGNING_LABEL: &'static [u8] = b"tether commit v1";

    /// Bytes covered by the committer's signature.
    #[must_use]
    pub fn to_be_signed(&self) -> Vec<u8> {
        let mut tbs = Vec::with_capacity(Self::SIGNING_LABEL.len() + 40 + self.commit.len());
        tbs.extend_from_slice(Self::SIGNING_LABEL);
        tbs.extend_from_slice(self.group.as_bytes());
        tbs.extend_from_slice(&self.epoch.to_be_bytes());
        tbs.extend_from_slice(&self.commit);
        tbs
    }

    /// Identifier used to make commit processing idempotent.
    #[must_use]
    pub fn id(&self) -> WelcomeId {
        WelcomeId::digest(&[&self.to_be_signed(), &self.signature])
    }
}
