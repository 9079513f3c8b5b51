//! Key management for end-to-end encrypted transfers.
//!
//! - X25519 identity keypair, used only to wrap keys
//! - AES-256-GCM transfer key for bulk chunk encryption
//! - Rotating session key that wraps the transfer key before the asymmetric layer
//!
//! Wire format of every encrypted payload: `nonce (12 B) || ciphertext || tag`.
//! A wrapped transfer key is `ephemeral_public (32 B) || AES-GCM(kek, AES-GCM(session, key))`
//! where `kek = HKDF-SHA256(X25519(ephemeral, recipient))`.

use crate::error::{Result, TransferError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};

pub use x25519_dalek::PublicKey as IdentityPublicKey;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const WRAP_INFO: &[u8] = b"codeshare-key-wrap-v1";

/// Fill a fixed-size buffer from the operating system RNG
pub(crate) fn os_random<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| TransferError::CryptoUnavailable(e.to_string()))?;
    Ok(buf)
}

/// 256-bit symmetric key (transfer key or session key)
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn generate() -> Result<Self> {
        Ok(Self(os_random()?))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Option<Self> {
        let raw = BASE64.decode(encoded).ok()?;
        Self::from_slice(&raw)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| TransferError::CryptoUnavailable(e.to_string()))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Long-lived X25519 identity used for key wrapping
pub struct IdentityKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeypair {
    pub fn generate() -> Result<Self> {
        let secret = StaticSecret::from(os_random::<KEY_LEN>()?);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn public_key_base64(&self) -> String {
        encode_public_key(&self.public)
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

pub fn encode_public_key(key: &PublicKey) -> String {
    BASE64.encode(key.as_bytes())
}

pub fn decode_public_key(encoded: &str) -> Option<PublicKey> {
    let raw = BASE64.decode(encoded).ok()?;
    let arr: [u8; KEY_LEN] = raw.try_into().ok()?;
    Some(PublicKey::from(arr))
}

/// Encrypt with a fresh random nonce prepended to the ciphertext
pub fn encrypt_payload(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = key.cipher()?;
    let nonce_bytes: [u8; NONCE_LEN] = os_random()?;
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| TransferError::CryptoUnavailable(e.to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

pub fn decrypt_payload(key: &SymmetricKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(TransferError::AuthenticationFailed);
    }
    let cipher = key.cipher()?;
    let (nonce, body) = ciphertext.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| TransferError::AuthenticationFailed)
}

fn derive_kek(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> Result<SymmetricKey> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(WRAP_INFO, &mut okm)
        .map_err(|e| TransferError::CryptoUnavailable(format!("key derivation failed: {}", e)))?;
    Ok(SymmetricKey(okm))
}

/// Session-key layer first, then the recipient's public key
pub fn wrap_transfer_key(
    recipient: &PublicKey,
    transfer_key: &SymmetricKey,
    session_key: &SymmetricKey,
) -> Result<Vec<u8>> {
    let inner = encrypt_payload(session_key, transfer_key.as_bytes())?;

    let ephemeral = StaticSecret::from(os_random::<KEY_LEN>()?);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let kek = derive_kek(shared.as_bytes(), &ephemeral_public, recipient)?;
    let outer = encrypt_payload(&kek, &inner)?;

    let mut wrapped = Vec::with_capacity(KEY_LEN + outer.len());
    wrapped.extend_from_slice(ephemeral_public.as_bytes());
    wrapped.extend_from_slice(&outer);
    Ok(wrapped)
}

pub fn unwrap_transfer_key(
    recipient: &IdentityKeypair,
    session_key: &SymmetricKey,
    wrapped: &[u8],
) -> Result<SymmetricKey> {
    if wrapped.len() < KEY_LEN {
        return Err(TransferError::KeyUnwrapFailed);
    }
    let (ephemeral_raw, outer) = wrapped.split_at(KEY_LEN);
    let ephemeral_arr: [u8; KEY_LEN] = ephemeral_raw
        .try_into()
        .map_err(|_| TransferError::KeyUnwrapFailed)?;
    let ephemeral_public = PublicKey::from(ephemeral_arr);
    let shared = recipient.secret.diffie_hellman(&ephemeral_public);
    let kek = derive_kek(shared.as_bytes(), &ephemeral_public, &recipient.public)?;

    let inner = decrypt_payload(&kek, outer).map_err(|_| TransferError::KeyUnwrapFailed)?;
    let raw = decrypt_payload(session_key, &inner).map_err(|_| TransferError::KeyUnwrapFailed)?;
    SymmetricKey::from_slice(&raw).ok_or(TransferError::KeyUnwrapFailed)
}

/// Side channel both peers can read, used to publish new session keys
pub trait NegotiationChannel: Send + Sync {
    fn publish_session_key(&self, key: &SymmetricKey) -> impl Future<Output = Result<()>> + Send;
}

/// Session key waiting to be embedded in the next negotiation offer
#[derive(Clone, Default)]
pub struct SessionKeySlot {
    inner: Arc<RwLock<Option<SymmetricKey>>>,
}

impl SessionKeySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<SymmetricKey> {
        self.inner.read().await.clone()
    }
}

impl NegotiationChannel for SessionKeySlot {
    async fn publish_session_key(&self, key: &SymmetricKey) -> Result<()> {
        *self.inner.write().await = Some(key.clone());
        Ok(())
    }
}

struct CachedSessionKey {
    key: SymmetricKey,
    created_at: Instant,
}

/// Owns the identity private key and the session-key cache.
///
/// One vault is shared by every transfer in a process; session-key
/// rotation is serialized so two handshakes never race a rotation.
pub struct KeyVault {
    identity: IdentityKeypair,
    session: Mutex<Option<CachedSessionKey>>,
}

impl KeyVault {
    pub fn new() -> Result<Self> {
        Ok(Self::with_identity(Self::generate_identity_keypair()?))
    }

    pub fn with_identity(identity: IdentityKeypair) -> Self {
        Self {
            identity,
            session: Mutex::new(None),
        }
    }

    pub fn generate_identity_keypair() -> Result<IdentityKeypair> {
        IdentityKeypair::generate()
    }

    pub fn generate_transfer_key() -> Result<SymmetricKey> {
        SymmetricKey::generate()
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn public_key_base64(&self) -> String {
        self.identity.public_key_base64()
    }

    pub fn encrypt_payload(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        encrypt_payload(key, plaintext)
    }

    pub fn decrypt_payload(key: &SymmetricKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        decrypt_payload(key, ciphertext)
    }

    pub fn wrap_transfer_key(
        recipient: &PublicKey,
        transfer_key: &SymmetricKey,
        session_key: &SymmetricKey,
    ) -> Result<Vec<u8>> {
        wrap_transfer_key(recipient, transfer_key, session_key)
    }

    /// Unwrap a key addressed to this vault's identity
    pub fn unwrap_transfer_key(
        &self,
        session_key: &SymmetricKey,
        wrapped: &[u8],
    ) -> Result<SymmetricKey> {
        unwrap_transfer_key(&self.identity, session_key, wrapped)
    }

    pub async fn current_session_key(&self) -> Option<SymmetricKey> {
        self.session.lock().await.as_ref().map(|c| c.key.clone())
    }

    /// Replace the cached session key and publish it to the peer
    pub async fn rotate_session_key<C: NegotiationChannel>(
        &self,
        channel: &C,
    ) -> Result<SymmetricKey> {
        let mut cached = self.session.lock().await;
        let key = SymmetricKey::generate()?;
        channel.publish_session_key(&key).await?;
        *cached = Some(CachedSessionKey {
            key: key.clone(),
            created_at: Instant::now(),
        });
        info!("Session key rotated");
        Ok(key)
    }

    /// Rotate if no key is cached or the cached one is older than `max_age`
    pub async fn check_and_rotate<C: NegotiationChannel>(
        &self,
        max_age: Duration,
        channel: &C,
    ) -> Result<SymmetricKey> {
        let mut cached = self.session.lock().await;
        if let Some(current) = cached.as_ref() {
            if current.created_at.elapsed() <= max_age {
                debug!(age_secs = current.created_at.elapsed().as_secs(), "Session key still fresh");
                channel.publish_session_key(&current.key).await?;
                return Ok(current.key.clone());
            }
        }
        let key = SymmetricKey::generate()?;
        channel.publish_session_key(&key).await?;
        *cached = Some(CachedSessionKey {
            key: key.clone(),
            created_at: Instant::now(),
        });
        info!(max_age_secs = max_age.as_secs(), "Session key rotated by age policy");
        Ok(key)
    }

    /// Store a session key read from the negotiation channel (receiving side)
    pub async fn adopt_session_key(&self, key: SymmetricKey) {
        *self.session.lock().await = Some(CachedSessionKey {
            key,
            created_at: Instant::now(),
        });
    }
}
