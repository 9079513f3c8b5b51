//! Short-code rendezvous: maps a 5-character code to a connection offer.
//!
//! Each code owns two slots in the backend, the sender's offer and the
//! receiver's answer. Slot ids are BLAKE3 digests of the code, so backends
//! never see codes in the clear; sealed backends additionally store the
//! payloads encrypted under a key derived from the code.

pub mod backend;
pub mod remote;
pub mod server;

use crate::error::{Result, TransferError};
use crate::keyvault::{SymmetricKey, decrypt_payload, encrypt_payload};
use backend::{RendezvousBackend, StoredRecord};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use backend::{FileBackend, MemoryBackend};
pub use remote::RemoteBackend;

pub const CODE_LEN: usize = 5;

/// Regeneration attempts before accepting an overwrite
pub const MAX_CODE_ATTEMPTS: usize = 10;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// How often waiting peers re-read their slot
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

const SEAL_SALT: &[u8] = b"codeshare-rendezvous";

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Connection offer published by the sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: String,
    pub ice_server: String,
    pub chunk_size: usize,
    /// Sender identity, base64 X25519
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub high_performance: bool,
    /// Current session key, present when the transfer is encrypted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Negotiation round, bumped each time the sender moves to the next server
    #[serde(default)]
    pub attempt: u32,
}

/// Receiver's reply, posted under the same code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub attempt: u32,
}

/// Decoded view of a published code
#[derive(Debug, Clone, PartialEq)]
pub struct RendezvousRecord {
    pub code: String,
    pub offer: OfferPayload,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Offer,
    Answer,
}

impl Slot {
    fn tag(self) -> &'static [u8] {
        match self {
            Self::Offer => b"offer",
            Self::Answer => b"answer",
        }
    }

    fn id(self, code: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"codeshare/");
        hasher.update(self.tag());
        hasher.update(b"/");
        hasher.update(code.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn seal_key(self, code: &str) -> Result<SymmetricKey> {
        let hk = Hkdf::<Sha256>::new(Some(SEAL_SALT), code.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(self.tag(), &mut okm)
            .map_err(|e| TransferError::CryptoUnavailable(format!("seal key derivation failed: {}", e)))?;
        Ok(SymmetricKey::from_bytes(okm))
    }
}

/// Fixed-length, case-sensitive `[0-9A-Za-z]`
pub fn validate_code(code: &str) -> Result<()> {
    if code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(TransferError::InvalidCodeFormat(code.to_string()))
    }
}

pub fn generate_code() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(CODE_LEN)
        .map(char::from)
        .collect()
}

/// Code → offer mapping over a pluggable backend.
///
/// Every mutating operation runs under one lock, so concurrent sessions
/// never interleave a collision check with another session's publish.
pub struct RendezvousStore<B> {
    backend: B,
    op_lock: Mutex<()>,
}

impl<B: RendezvousBackend> RendezvousStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            op_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn encode<T: Serialize>(slot: Slot, code: &str, value: &T) -> Result<String> {
        let json = serde_json::to_string(value)?;
        if !B::SEALED {
            return Ok(json);
        }
        let sealed = encrypt_payload(&slot.seal_key(code)?, json.as_bytes())?;
        Ok(BASE64.encode(sealed))
    }

    fn decode<T: DeserializeOwned>(slot: Slot, code: &str, payload: &str) -> Result<T> {
        if !B::SEALED {
            return Ok(serde_json::from_str(payload)?);
        }
        let sealed = BASE64
            .decode(payload)
            .map_err(|e| TransferError::Backend(format!("corrupt sealed payload: {}", e)))?;
        let json = decrypt_payload(&slot.seal_key(code)?, &sealed)?;
        Ok(serde_json::from_slice(&json)?)
    }

    async fn live_record(&self, slot: Slot, code: &str) -> Result<Option<StoredRecord>> {
        Ok(self
            .backend
            .get(&slot.id(code))
            .await?
            .filter(|r| !r.is_expired(now_ms())))
    }

    /// Store an offer under a fresh code and return the code
    pub async fn publish(&self, offer: &OfferPayload, ttl: Duration) -> Result<String> {
        let _guard = self.op_lock.lock().await;

        if let Err(e) = self.backend.remove_expired(now_ms()).await {
            warn!("Opportunistic sweep failed: {}", e);
        }

        let mut attempts = 0;
        let code = loop {
            attempts += 1;
            let code = generate_code();
            let created_at_ms = now_ms();
            let record = StoredRecord {
                payload: Self::encode(Slot::Offer, &code, offer)?,
                created_at_ms,
                expires_at_ms: created_at_ms.saturating_add(ttl.as_millis() as u64),
            };
            let slot = Slot::Offer.id(&code);
            if attempts >= MAX_CODE_ATTEMPTS {
                warn!(attempts, "Could not find a free code, overwriting an existing one");
                self.backend.put(&slot, record).await?;
                break code;
            }
            // Check and store in one step, so concurrent publishers cannot share a code
            if self.backend.put_if_absent(&slot, record, created_at_ms).await? {
                break code;
            }
            debug!(attempts, "Code already taken, drawing another");
        };
        self.backend.remove(&Slot::Answer.id(&code)).await?;

        info!(code = %code, attempts, ttl_secs = ttl.as_secs(), "Offer published");
        Ok(code)
    }

    /// Replace the offer behind an issued code, keeping its expiry
    pub async fn republish(&self, code: &str, offer: &OfferPayload) -> Result<()> {
        validate_code(code)?;
        let _guard = self.op_lock.lock().await;

        let current = self.lookup(code).await?;
        let record = StoredRecord {
            payload: Self::encode(Slot::Offer, code, offer)?,
            created_at_ms: now_ms(),
            expires_at_ms: current.expires_at_ms,
        };
        self.backend.put(&Slot::Offer.id(code), record).await?;
        self.backend.remove(&Slot::Answer.id(code)).await?;
        debug!(code, attempt = offer.attempt, "Offer republished");
        Ok(())
    }

    /// Expired records are evicted as a side effect
    async fn lookup(&self, code: &str) -> Result<StoredRecord> {
        let slot_id = Slot::Offer.id(code);
        let record = self
            .backend
            .get(&slot_id)
            .await?
            .ok_or_else(|| TransferError::CodeNotFound(code.to_string()))?;

        if record.is_expired(now_ms()) {
            self.backend.remove(&slot_id).await?;
            self.backend.remove(&Slot::Answer.id(code)).await?;
            info!(code, "Evicted expired code");
            return Err(TransferError::CodeExpired(code.to_string()));
        }
        Ok(record)
    }

    pub async fn resolve_record(&self, code: &str) -> Result<RendezvousRecord> {
        validate_code(code)?;
        let _guard = self.op_lock.lock().await;

        let record = self.lookup(code).await?;
        Ok(RendezvousRecord {
            code: code.to_string(),
            offer: Self::decode(Slot::Offer, code, &record.payload)?,
            created_at_ms: record.created_at_ms,
            expires_at_ms: record.expires_at_ms,
        })
    }

    pub async fn resolve(&self, code: &str) -> Result<OfferPayload> {
        Ok(self.resolve_record(code).await?.offer)
    }

    /// Resolve and delete in one step
    pub async fn consume(&self, code: &str) -> Result<OfferPayload> {
        validate_code(code)?;
        let _guard = self.op_lock.lock().await;

        let record = self.lookup(code).await?;
        let offer = Self::decode(Slot::Offer, code, &record.payload)?;
        self.backend.remove(&Slot::Offer.id(code)).await?;
        Ok(offer)
    }

    /// Drop both slots of a code once the peers no longer need it
    pub async fn release(&self, code: &str) -> Result<()> {
        validate_code(code)?;
        let _guard = self.op_lock.lock().await;
        self.backend.remove(&Slot::Offer.id(code)).await?;
        self.backend.remove(&Slot::Answer.id(code)).await?;
        Ok(())
    }

    pub async fn sweep_expired(&self) -> Result<usize> {
        let _guard = self.op_lock.lock().await;
        let removed = self.backend.remove_expired(now_ms()).await?;
        if removed > 0 {
            info!(removed, "Swept expired rendezvous records");
        }
        Ok(removed)
    }

    /// Post the receiver's answer; the offer must still be live
    pub async fn post_answer(&self, code: &str, answer: &AnswerPayload) -> Result<()> {
        validate_code(code)?;
        let _guard = self.op_lock.lock().await;

        let offer = self.lookup(code).await?;
        let record = StoredRecord {
            payload: Self::encode(Slot::Answer, code, answer)?,
            created_at_ms: now_ms(),
            expires_at_ms: offer.expires_at_ms,
        };
        self.backend.put(&Slot::Answer.id(code), record).await?;
        debug!(code, attempt = answer.attempt, "Answer posted");
        Ok(())
    }

    /// Take the posted answer, if any
    pub async fn take_answer(&self, code: &str) -> Result<Option<AnswerPayload>> {
        validate_code(code)?;
        let _guard = self.op_lock.lock().await;

        let Some(record) = self.live_record(Slot::Answer, code).await? else {
            return Ok(None);
        };
        self.backend.remove(&Slot::Answer.id(code)).await?;
        Ok(Some(Self::decode(Slot::Answer, code, &record.payload)?))
    }

    /// Poll until an answer for `attempt` arrives
    pub async fn await_answer(
        &self,
        code: &str,
        attempt: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AnswerPayload> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(answer) = self.take_answer(code).await? {
                if answer.attempt == attempt {
                    return Ok(answer);
                }
                debug!(code, got = answer.attempt, want = attempt, "Discarding stale answer");
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransferError::ChannelTimeout(format!(
                    "no answer for code {} within {:?}",
                    code, timeout
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::TransferCancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Poll until the offer reaches negotiation round `min_attempt`.
    ///
    /// Lookup failures surface immediately.
    pub async fn await_offer(
        &self,
        code: &str,
        min_attempt: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<OfferPayload> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let offer = self.resolve(code).await?;
            if offer.attempt >= min_attempt {
                return Ok(offer);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransferError::ChannelTimeout(format!(
                    "sender did not renegotiate code {} within {:?}",
                    code, timeout
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::TransferCancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn offer(n: usize) -> OfferPayload {
        OfferPayload {
            sdp: format!("v=0 session {}", n),
            ice_server: "stun:stun.l.google.com:19302".into(),
            chunk_size: 16384,
            public_key: None,
            high_performance: false,
            session_key: None,
            attempt: 0,
        }
    }

    #[test]
    fn test_validate_code() {
        assert!(validate_code("aB3dE").is_ok());
        assert!(validate_code("abcd").is_err());
        assert!(validate_code("abcdef").is_err());
        assert!(validate_code("ab-de").is_err());
        assert!(validate_code("ab\u{e9}d").is_err());
    }

    #[test]
    fn test_generated_codes_are_valid() {
        for _ in 0..100 {
            assert!(validate_code(&generate_code()).is_ok());
        }
    }

    #[test]
    fn test_offer_wire_names() {
        let json = serde_json::to_value(offer(1)).unwrap();
        assert!(json.get("iceServer").is_some());
        assert!(json.get("chunkSize").is_some());
        assert!(json.get("highPerformance").is_some());
        assert!(json.get("publicKey").is_none());
    }

    /// Memory store whose first `refusals` claims report the slot as taken
    struct ContestedBackend {
        inner: MemoryBackend,
        refusals: std::sync::atomic::AtomicUsize,
        plain_puts: std::sync::atomic::AtomicUsize,
    }

    impl ContestedBackend {
        fn new(refusals: usize) -> Self {
            Self {
                inner: MemoryBackend::new(),
                refusals: refusals.into(),
                plain_puts: 0.into(),
            }
        }
    }

    impl RendezvousBackend for ContestedBackend {
        const SEALED: bool = false;

        async fn get(&self, slot: &str) -> Result<Option<StoredRecord>> {
            self.inner.get(slot).await
        }

        async fn put(&self, slot: &str, record: StoredRecord) -> Result<()> {
            self.plain_puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put(slot, record).await
        }

        async fn put_if_absent(&self, slot: &str, record: StoredRecord, now_ms: u64) -> Result<bool> {
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Ok(false);
            }
            self.inner.put_if_absent(slot, record, now_ms).await
        }

        async fn remove(&self, slot: &str) -> Result<bool> {
            self.inner.remove(slot).await
        }

        async fn remove_expired(&self, now_ms: u64) -> Result<usize> {
            self.inner.remove_expired(now_ms).await
        }
    }

    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_publish_claims_codes_atomically() {
        let store = RendezvousStore::new(ContestedBackend::new(2));
        let code = store.publish(&offer(1), DEFAULT_TTL).await.unwrap();
        assert!(store.resolve(&code).await.is_ok());
        assert_eq!(store.backend.plain_puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_publish_overwrites_after_ceiling() {
        let store = RendezvousStore::new(ContestedBackend::new(usize::MAX));
        let code = store.publish(&offer(1), DEFAULT_TTL).await.unwrap();
        assert!(store.resolve(&code).await.is_ok());
        assert_eq!(store.backend.plain_puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stores_sharing_a_file_never_share_a_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rendezvous.json");
        let mut tasks = Vec::new();
        for n in 0..4 {
            let store = RendezvousStore::new(FileBackend::new(&path));
            tasks.push(tokio::spawn(async move {
                let mut codes = Vec::new();
                for i in 0..5 {
                    codes.push(store.publish(&offer(n * 10 + i), DEFAULT_TTL).await.unwrap());
                }
                codes
            }));
        }
        let mut all = HashSet::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        assert_eq!(all.len(), 20);

        let reader = RendezvousStore::new(FileBackend::new(&path));
        for code in &all {
            assert!(reader.resolve(code).await.is_ok());
        }
    }

    #[test]
    fn test_seal_keys_are_derived_per_slot() {
        let offer = Slot::Offer.seal_key("aB3dE").unwrap();
        let again = Slot::Offer.seal_key("aB3dE").unwrap();
        let answer = Slot::Answer.seal_key("aB3dE").unwrap();
        assert_eq!(offer.as_bytes(), again.as_bytes());
        assert_ne!(offer.as_bytes(), answer.as_bytes());
    }

    #[tokio::test]
    async fn test_distinct_codes() {
        let store = RendezvousStore::new(MemoryBackend::new());
        let mut codes = HashSet::new();
        for n in 0..200 {
            codes.insert(store.publish(&offer(n), DEFAULT_TTL).await.unwrap());
        }
        assert_eq!(codes.len(), 200);
        for code in &codes {
            assert!(store.resolve(code).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_expired_code_is_evicted() {
        let store = RendezvousStore::new(MemoryBackend::new());
        let code = store.publish(&offer(1), Duration::ZERO).await.unwrap();

        assert!(matches!(
            store.resolve(&code).await,
            Err(TransferError::CodeExpired(_))
        ));
        assert!(matches!(
            store.resolve(&code).await,
            Err(TransferError::CodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_format_before_lookup() {
        let store = RendezvousStore::new(MemoryBackend::new());
        assert!(matches!(
            store.resolve("12").await,
            Err(TransferError::InvalidCodeFormat(_))
        ));
        assert!(matches!(
            store.resolve("zzzzz").await,
            Err(TransferError::CodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_counts_removed() {
        let store = RendezvousStore::new(MemoryBackend::new());
        store.publish(&offer(1), Duration::ZERO).await.unwrap();
        store.publish(&offer(2), Duration::ZERO).await.unwrap();
        let live = store.publish(&offer(3), DEFAULT_TTL).await.unwrap();
        // publish sweeps first, so at most the last expired record is still stored
        assert!(store.sweep_expired().await.unwrap() <= 1);
        assert_eq!(store.sweep_expired().await.unwrap(), 0);
        assert_eq!(store.resolve(&live).await.unwrap(), offer(3));
    }

    #[tokio::test]
    async fn test_consume_deletes() {
        let store = RendezvousStore::new(MemoryBackend::new());
        let code = store.publish(&offer(7), DEFAULT_TTL).await.unwrap();
        assert_eq!(store.consume(&code).await.unwrap(), offer(7));
        assert!(matches!(
            store.resolve(&code).await,
            Err(TransferError::CodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_answer_slot() {
        let store = RendezvousStore::new(MemoryBackend::new());
        let code = store.publish(&offer(1), DEFAULT_TTL).await.unwrap();
        assert!(store.take_answer(&code).await.unwrap().is_none());

        let answer = AnswerPayload {
            sdp: "answer".into(),
            public_key: Some("pk".into()),
            attempt: 0,
        };
        store.post_answer(&code, &answer).await.unwrap();

        let cancel = CancellationToken::new();
        let got = store
            .await_answer(&code, 0, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(got, answer);
        assert!(store.take_answer(&code).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_republish_clears_stale_answer() {
        let store = RendezvousStore::new(MemoryBackend::new());
        let code = store.publish(&offer(1), DEFAULT_TTL).await.unwrap();
        let stale = AnswerPayload {
            sdp: "old".into(),
            public_key: None,
            attempt: 0,
        };
        store.post_answer(&code, &stale).await.unwrap();

        let mut next = offer(1);
        next.attempt = 1;
        store.republish(&code, &next).await.unwrap();
        assert!(store.take_answer(&code).await.unwrap().is_none());

        let cancel = CancellationToken::new();
        let seen = store
            .await_offer(&code, 1, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(seen.attempt, 1);
    }

    #[tokio::test]
    async fn test_await_answer_timeout_and_cancel() {
        let store = RendezvousStore::new(MemoryBackend::new());
        let code = store.publish(&offer(1), DEFAULT_TTL).await.unwrap();
        let cancel = CancellationToken::new();
        assert!(matches!(
            store
                .await_answer(&code, 0, Duration::from_millis(10), &cancel)
                .await,
            Err(TransferError::ChannelTimeout(_))
        ));

        cancel.cancel();
        assert!(matches!(
            store
                .await_answer(&code, 0, Duration::from_secs(10), &cancel)
                .await,
            Err(TransferError::TransferCancelled)
        ));
    }

    #[tokio::test]
    async fn test_sealed_backend_hides_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = RendezvousStore::new(FileBackend::new(dir.path().join("r.json")));
        let mut secret = offer(1);
        secret.sdp = "very-identifiable-sdp".into();
        let code = store.publish(&secret, DEFAULT_TTL).await.unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join("r.json")).await.unwrap();
        assert!(!raw.contains("very-identifiable-sdp"));
        assert!(!raw.contains(&code));
        assert_eq!(store.resolve(&code).await.unwrap(), secret);
    }
}
