//! Channel key agreement, message sealing and identity signatures.
//!
//! All functions are pure - random bytes must be provided by the caller.
//!
//! # Key schedule
//!
//! ```text
//! shared   = X25519(init_secret, ephemeral_public)
//! okm[64]  = HKDF-SHA256(salt = key_package_ref, ikm = shared,
//!                        info = "tether channel v1" || initiator || responder)
//! key      = okm[0..32]
//! group    = SHA-256("tether group v1" || okm[32..64])
//! ```
//!
//! Both sides compute the same `(key, group)` pair: the initiator from its
//! init key secret and the responder's ephemeral public key, the responder the
//! other way round.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::Sha256;
use tether_proto::{Address, KeyPackageRef};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const CHANNEL_INFO: &[u8] = b"tether channel v1";
const GROUP_LABEL: &[u8] = b"tether group v1";
const STORAGE_AAD: &[u8] = b"tether key store v1";

/// Size of `XChaCha20` nonces.
pub const NONCE_SIZE: usize = 24;

/// Symmetric key protecting one channel.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelKey(..)")
    }
}

/// Key agreement failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonContributory;

/// Public half of an X25519 secret.
pub fn x25519_public(secret: &[u8; 32]) -> [u8; 32] {
    PublicKey::from(&StaticSecret::from(*secret)).to_bytes()
}

/// Derive the channel key and group address.
///
/// `initiator` is the key package owner, `responder` the welcome sender.
///
/// # Errors
///
/// - `NonContributory` if the peer's public key is a low-order point
pub fn derive_channel(
    local_secret: &[u8; 32],
    remote_public: &[u8; 32],
    key_package_ref: &KeyPackageRef,
    initiator: &Address,
    responder: &Address,
) -> Result<(ChannelKey, Address), NonContributory> {
    let secret = StaticSecret::from(*local_secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*remote_public));
    if !shared.was_contributory() {
        return Err(NonContributory);
    }

    let mut info = Vec::with_capacity(CHANNEL_INFO.len() + 64);
    info.extend_from_slice(CHANNEL_INFO);
    info.extend_from_slice(initiator.as_bytes());
    info.extend_from_slice(responder.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(key_package_ref.as_bytes()), shared.as_bytes());
    let mut okm = [0u8; 64];
    let Ok(()) = hk.expand(&info, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut key = [0u8; 32];
    key.copy_from_slice(&okm[..32]);
    let group = Address::digest(&[GROUP_LABEL, &okm[32..]]);
    okm.zeroize();

    Ok((ChannelKey(key), group))
}

/// Encrypt `plaintext` with associated data.
///
/// # Security
///
/// Caller MUST provide a fresh random nonce per message. 24-byte nonces make
/// random selection safe.
pub fn seal(key: &[u8; 32], nonce: &[u8; NONCE_SIZE], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Decrypt and authenticate. `None` if the tag, key or aad is wrong.
pub fn open(key: &[u8; 32], nonce: &[u8; NONCE_SIZE], aad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher.decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad }).ok()
}

/// Seal a key store record. Output is `nonce || ciphertext`.
pub fn seal_record(storage_key: &[u8; 32], nonce: &[u8; NONCE_SIZE], record: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(NONCE_SIZE + record.len() + 16);
    out.extend_from_slice(nonce);
    out.extend_from_slice(&seal(storage_key, nonce, STORAGE_AAD, record));
    out
}

/// Open a record produced by [`seal_record`].
pub fn open_record(storage_key: &[u8; 32], sealed: &[u8]) -> Option<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return None;
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce: &[u8; NONCE_SIZE] = nonce.try_into().ok()?;
    open(storage_key, nonce, STORAGE_AAD, ciphertext)
}

/// Identity key pair behind an inbox address.
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Identity from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(seed) }
    }

    /// Seed bytes, for persistence.
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Inbox address (the verifying key).
    pub fn address(&self) -> Address {
        Address::from_bytes(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("address", &self.address()).finish_non_exhaustive()
    }
}

/// Verify `signature` over `message` by the identity behind `signer`.
pub fn verify(signer: &Address, message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(signer.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}
