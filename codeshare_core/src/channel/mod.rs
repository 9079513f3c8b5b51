//! Peer connection and data channel lifecycle.
//!
//! ```text
//! Idle → Negotiating → Connected → Transferring → Closed
//!            │             │            │
//!            └──────── Failed ◄─────────┘   (next candidate server → Negotiating)
//! ```
//!
//! The transport itself sits behind [`PeerConnector`]; offers and answers
//! travel through a [`Signaling`] implementation, normally [`CodeSignaling`]
//! over the rendezvous store.

/// In-process loopback transport for tests; real peers use `codeshare_rtc`
pub mod memory;

use crate::AppEvent;
use crate::error::{Result, TransferError};
use crate::probe::{DeviceClass, RetryStrategy, TransferProfile};
use crate::rendezvous::backend::RendezvousBackend;
use crate::rendezvous::{AnswerPayload, OfferPayload, RendezvousStore};
use crate::transfer::constants::*;
use anyhow::anyhow;
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on renegotiation rounds an answerer follows
const MAX_ANSWER_ROUNDS: u32 = 32;

/// One application message on the data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Idle,
    Negotiating,
    Connected,
    Transferring,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle | Failed, Negotiating) => true,
            (Negotiating, Connected | Failed) => true,
            (Connected, Transferring | Failed) => true,
            (Transferring, Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub ordered: bool,
    /// Retransmission ceiling per message
    pub max_retransmits: u16,
    /// Bound on ICE candidate gathering; the partial description is used after it
    pub gather_timeout: Duration,
    pub open_timeout: Duration,
    pub open_retries: u32,
    /// How long an offerer waits for the peer's answer
    pub answer_timeout: Duration,
    /// Sends are withheld while the buffered amount exceeds this
    pub low_water_mark: usize,
    pub poll_interval: Duration,
    pub retry_strategy: RetryStrategy,
    pub retry_base_delay: Duration,
    /// Bound on draining the buffer and on waiting for the peer's acknowledgement
    pub completion_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::for_device(DeviceClass::Desktop)
    }
}

impl ChannelOptions {
    pub fn for_device(device: DeviceClass) -> Self {
        let constrained = device.is_constrained();
        Self {
            ordered: true,
            max_retransmits: if constrained {
                MOBILE_MAX_RETRANSMITS
            } else {
                DEFAULT_MAX_RETRANSMITS
            },
            gather_timeout: if constrained {
                MOBILE_GATHER_TIMEOUT
            } else {
                DEFAULT_GATHER_TIMEOUT
            },
            open_timeout: if constrained {
                DEFAULT_OPEN_TIMEOUT * 2
            } else {
                DEFAULT_OPEN_TIMEOUT
            },
            open_retries: OPEN_RETRIES,
            answer_timeout: DEFAULT_ANSWER_TIMEOUT,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            poll_interval: BUFFER_POLL_INTERVAL,
            retry_strategy: RetryStrategy::Exponential,
            retry_base_delay: RETRY_BASE_DELAY,
            completion_timeout: COMPLETION_ACK_TIMEOUT,
        }
    }

    /// Adopt the retry policy and timeout of a transfer profile
    pub fn apply_profile(&mut self, profile: &TransferProfile) {
        self.open_retries = profile.retry_attempts;
        self.retry_strategy = profile.retry_strategy;
        self.completion_timeout = profile.timeout;
    }
}

/// An open, ordered data channel
pub trait PeerLink: Send + Sync + 'static {
    fn send(&self, frame: Frame) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// `None` once the channel is closed and drained
    fn recv(&self) -> impl Future<Output = Option<Frame>> + Send;

    /// Bytes queued locally but not yet handed to the network
    fn buffered_amount(&self) -> impl Future<Output = usize> + Send;

    fn is_open(&self) -> bool;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// One peer connection attempt against a single candidate server
pub trait PeerSession: Send + Sync + 'static {
    type Link: PeerLink;

    fn apply_answer(&self, sdp: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Wait up to `timeout` for the data channel to report ready
    fn open_link(&self, timeout: Duration) -> impl Future<Output = anyhow::Result<Self::Link>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub trait PeerConnector: Send + Sync {
    type Session: PeerSession;

    /// Create a connection and data channel; returns the local offer description
    fn create_offer(
        &self,
        server: &str,
        options: &ChannelOptions,
    ) -> impl Future<Output = anyhow::Result<(Self::Session, String)>> + Send;

    /// Apply a remote offer; returns the local answer description
    fn accept_offer(
        &self,
        server: &str,
        offer_sdp: &str,
        options: &ChannelOptions,
    ) -> impl Future<Output = anyhow::Result<(Self::Session, String)>> + Send;
}

/// Exchange of offers and answers between the two peers
pub trait Signaling: Send + Sync {
    /// Publish an offer and wait for the answer to the same round
    fn exchange(
        &self,
        offer: OfferPayload,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<AnswerPayload>> + Send;

    /// Wait for an offer of round `min_attempt` or later
    fn wait_offer(
        &self,
        min_attempt: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<OfferPayload>> + Send;

    fn send_answer(&self, answer: AnswerPayload) -> impl Future<Output = Result<()>> + Send;
}

/// Signaling through a rendezvous code
pub struct CodeSignaling<B> {
    store: Arc<RendezvousStore<B>>,
    code: OnceLock<String>,
    ttl: Duration,
    answer_timeout: Duration,
    event_tx: Option<mpsc::Sender<AppEvent>>,
}

impl<B: RendezvousBackend> CodeSignaling<B> {
    /// Sender side: a code is issued on the first offer
    pub fn offerer(store: Arc<RendezvousStore<B>>, ttl: Duration, answer_timeout: Duration) -> Self {
        Self {
            store,
            code: OnceLock::new(),
            ttl,
            answer_timeout,
            event_tx: None,
        }
    }

    /// Receiver side: the code was typed in by the user
    pub fn answerer(
        store: Arc<RendezvousStore<B>>,
        code: &str,
        answer_timeout: Duration,
    ) -> Result<Self> {
        crate::rendezvous::validate_code(code)?;
        Ok(Self {
            store,
            code: OnceLock::from(code.to_string()),
            ttl: crate::rendezvous::DEFAULT_TTL,
            answer_timeout,
            event_tx: None,
        })
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<AppEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.get().map(String::as_str)
    }

    /// Delete the code once the peers are connected
    pub async fn release(&self) -> Result<()> {
        match self.code() {
            Some(code) => self.store.release(code).await,
            None => Ok(()),
        }
    }
}

impl<B: RendezvousBackend> Signaling for CodeSignaling<B> {
    async fn exchange(
        &self,
        offer: OfferPayload,
        cancel: &CancellationToken,
    ) -> Result<AnswerPayload> {
        let code = match self.code() {
            Some(code) => {
                self.store.republish(code, &offer).await?;
                code.to_string()
            }
            None => {
                let code = self.store.publish(&offer, self.ttl).await?;
                let _ = self.code.set(code.clone());
                if let Some(tx) = &self.event_tx {
                    let _ = tx.send(AppEvent::CodeReady { code: code.clone() }).await;
                }
                code
            }
        };
        self.store
            .await_answer(&code, offer.attempt, self.answer_timeout, cancel)
            .await
    }

    async fn wait_offer(&self, min_attempt: u32, cancel: &CancellationToken) -> Result<OfferPayload> {
        let code = self
            .code()
            .ok_or_else(|| TransferError::Protocol("no code to resolve".into()))?;
        self.store
            .await_offer(code, min_attempt, self.answer_timeout, cancel)
            .await
    }

    async fn send_answer(&self, answer: AnswerPayload) -> Result<()> {
        let code = self
            .code()
            .ok_or_else(|| TransferError::Protocol("no code to answer".into()))?;
        self.store.post_answer(code, &answer).await
    }
}

/// Offer fields that stay the same across candidate servers
#[derive(Debug, Clone, Default)]
pub struct OfferDetails {
    pub chunk_size: usize,
    pub public_key: Option<String>,
    pub high_performance: bool,
    pub session_key: Option<String>,
}

#[derive(Debug, Clone)]
enum Role {
    Offerer(OfferDetails),
    Answerer { public_key: Option<String> },
}

#[derive(Debug, Default)]
struct Cursor {
    candidates: Vec<String>,
    next: usize,
    attempt: u32,
    role: Option<Role>,
}

enum AttemptError {
    /// Try the next candidate server
    Retry(anyhow::Error),
    /// Surface immediately
    Fatal(TransferError),
}

impl AttemptError {
    fn classify(e: TransferError) -> Self {
        if e.is_code_error()
            || matches!(
                e,
                TransferError::TransferCancelled | TransferError::AuthenticationFailed
            )
        {
            Self::Fatal(e)
        } else {
            Self::Retry(anyhow!(e))
        }
    }
}

type LinkOf<C> = <<C as PeerConnector>::Session as PeerSession>::Link;

pub struct ChannelManager<C: PeerConnector> {
    connector: C,
    options: std::sync::RwLock<ChannelOptions>,
    state: watch::Sender<ChannelState>,
    session: Mutex<Option<C::Session>>,
    link: RwLock<Option<Arc<LinkOf<C>>>>,
    send_lock: Mutex<()>,
    cursor: Mutex<Cursor>,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<AppEvent>>,
}

impl<C: PeerConnector> ChannelManager<C> {
    pub fn new(connector: C, options: ChannelOptions, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            connector,
            options: std::sync::RwLock::new(options),
            state,
            session: Mutex::new(None),
            link: RwLock::new(None),
            send_lock: Mutex::new(()),
            cursor: Mutex::new(Cursor::default()),
            cancel,
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<AppEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Snapshot of the current options
    pub fn options(&self) -> ChannelOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Retune retries and timeouts for the profile about to be used
    pub fn apply_profile(&self, profile: &TransferProfile) {
        let mut options = self.options.write().unwrap_or_else(PoisonError::into_inner);
        options.apply_profile(profile);
        debug!(
            open_retries = options.open_retries,
            completion_timeout = ?options.completion_timeout,
            "Channel options follow transfer profile"
        );
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn set_state(&self, next: ChannelState) {
        let mut changed = false;
        self.state.send_if_modified(|current| {
            if *current == next || !current.can_transition_to(next) {
                return false;
            }
            *current = next;
            changed = true;
            true
        });
        if changed {
            info!(state = ?next, "Channel state changed");
            if let Some(tx) = &self.event_tx {
                let _ = tx.send(AppEvent::ChannelState(next)).await;
            }
        }
    }

    /// Run `fut` unless cancellation fires first
    async fn guard<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> std::result::Result<T, AttemptError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AttemptError::Fatal(TransferError::TransferCancelled)),
            res = fut => res.map_err(AttemptError::Retry),
        }
    }

    async fn teardown(&self) {
        if let Some(link) = self.link.write().await.take() {
            link.close().await;
        }
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }

    async fn fail_with(&self, e: TransferError) -> TransferError {
        self.teardown().await;
        if matches!(e, TransferError::TransferCancelled) {
            self.set_state(ChannelState::Closed).await;
        } else {
            self.set_state(ChannelState::Failed).await;
        }
        e
    }

    /// Negotiate as the offering side, trying `candidates` in order
    pub async fn connect_as_offerer<S: Signaling>(
        &self,
        signaling: &S,
        candidates: Vec<String>,
        details: OfferDetails,
    ) -> Result<AnswerPayload> {
        {
            let mut cursor = self.cursor.lock().await;
            *cursor = Cursor {
                candidates,
                role: Some(Role::Offerer(details.clone())),
                ..Cursor::default()
            };
        }
        self.negotiate_offerer(signaling, &details).await
    }

    async fn negotiate_offerer<S: Signaling>(
        &self,
        signaling: &S,
        details: &OfferDetails,
    ) -> Result<AnswerPayload> {
        loop {
            let (server, attempt) = {
                let mut cursor = self.cursor.lock().await;
                if cursor.next >= cursor.candidates.len() {
                    break;
                }
                let server = cursor.candidates[cursor.next].clone();
                cursor.next += 1;
                cursor.attempt += 1;
                (server, cursor.attempt - 1)
            };

            if self.cancel.is_cancelled() {
                return Err(self.fail_with(TransferError::TransferCancelled).await);
            }

            self.set_state(ChannelState::Negotiating).await;
            info!(server = %server, attempt, "Negotiating as offerer");

            match self.try_offer(signaling, &server, attempt, details).await {
                Ok(answer) => {
                    self.set_state(ChannelState::Connected).await;
                    return Ok(answer);
                }
                Err(AttemptError::Fatal(e)) => return Err(self.fail_with(e).await),
                Err(AttemptError::Retry(e)) => {
                    warn!(server = %server, attempt, "Candidate failed: {:#}", e);
                    self.set_state(ChannelState::Failed).await;
                    self.teardown().await;
                }
            }
        }

        let attempts = self.cursor.lock().await.attempt as usize;
        self.set_state(ChannelState::Failed).await;
        Err(TransferError::ChannelNegotiationFailed { attempts })
    }

    async fn try_offer<S: Signaling>(
        &self,
        signaling: &S,
        server: &str,
        attempt: u32,
        details: &OfferDetails,
    ) -> std::result::Result<AnswerPayload, AttemptError> {
        let (session, sdp) = self
            .guard(self.connector.create_offer(server, &self.options()))
            .await?;
        *self.session.lock().await = Some(session);

        let offer = OfferPayload {
            sdp,
            ice_server: server.to_string(),
            chunk_size: details.chunk_size,
            public_key: details.public_key.clone(),
            high_performance: details.high_performance,
            session_key: details.session_key.clone(),
            attempt,
        };
        let answer = signaling
            .exchange(offer, &self.cancel)
            .await
            .map_err(AttemptError::classify)?;

        {
            let session = self.session.lock().await;
            let session = session
                .as_ref()
                .ok_or_else(|| AttemptError::Retry(anyhow!("session vanished")))?;
            self.guard(session.apply_answer(&answer.sdp)).await?;
        }
        self.open_link().await?;
        Ok(answer)
    }

    /// Negotiate as the answering side, following the offerer across servers
    pub async fn connect_as_answerer<S: Signaling>(
        &self,
        signaling: &S,
        public_key: Option<String>,
    ) -> Result<OfferPayload> {
        {
            let mut cursor = self.cursor.lock().await;
            *cursor = Cursor {
                role: Some(Role::Answerer {
                    public_key: public_key.clone(),
                }),
                ..Cursor::default()
            };
        }
        self.negotiate_answerer(signaling, public_key).await
    }

    async fn negotiate_answerer<S: Signaling>(
        &self,
        signaling: &S,
        public_key: Option<String>,
    ) -> Result<OfferPayload> {
        for round in 0..MAX_ANSWER_ROUNDS {
            let min_attempt = self.cursor.lock().await.attempt;
            self.set_state(ChannelState::Negotiating).await;

            let offer = match signaling.wait_offer(min_attempt, &self.cancel).await {
                Ok(offer) => offer,
                Err(TransferError::ChannelTimeout(reason)) if round > 0 => {
                    debug!("Offerer stopped renegotiating: {}", reason);
                    let e = TransferError::ChannelNegotiationFailed {
                        attempts: round as usize,
                    };
                    return Err(self.fail_with(e).await);
                }
                Err(e) => return Err(self.fail_with(e).await),
            };
            self.cursor.lock().await.attempt = offer.attempt + 1;
            info!(server = %offer.ice_server, attempt = offer.attempt, "Negotiating as answerer");

            match self.try_answer(signaling, &offer, public_key.clone()).await {
                Ok(()) => {
                    self.set_state(ChannelState::Connected).await;
                    return Ok(offer);
                }
                Err(AttemptError::Fatal(e)) => return Err(self.fail_with(e).await),
                Err(AttemptError::Retry(e)) => {
                    warn!(server = %offer.ice_server, "Answer attempt failed: {:#}", e);
                    self.set_state(ChannelState::Failed).await;
                    self.teardown().await;
                }
            }
        }

        let e = TransferError::ChannelNegotiationFailed {
            attempts: MAX_ANSWER_ROUNDS as usize,
        };
        Err(self.fail_with(e).await)
    }

    async fn try_answer<S: Signaling>(
        &self,
        signaling: &S,
        offer: &OfferPayload,
        public_key: Option<String>,
    ) -> std::result::Result<(), AttemptError> {
        let (session, sdp) = self
            .guard(
                self.connector
                    .accept_offer(&offer.ice_server, &offer.sdp, &self.options()),
            )
            .await?;
        *self.session.lock().await = Some(session);

        let answer = AnswerPayload {
            sdp,
            public_key,
            attempt: offer.attempt,
        };
        signaling
            .send_answer(answer)
            .await
            .map_err(AttemptError::classify)?;
        self.open_link().await
    }

    async fn open_link(&self) -> std::result::Result<(), AttemptError> {
        let session = self.session.lock().await;
        let session = session
            .as_ref()
            .ok_or_else(|| AttemptError::Retry(anyhow!("no session to open")))?;

        let options = self.options();
        let mut last_err = None;
        for retry in 0..=options.open_retries {
            if retry > 0 {
                let delay = options
                    .retry_strategy
                    .delay(options.retry_base_delay, retry - 1);
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(AttemptError::Fatal(TransferError::TransferCancelled));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            match self.guard(session.open_link(options.open_timeout)).await {
                Ok(link) => {
                    *self.link.write().await = Some(Arc::new(link));
                    return Ok(());
                }
                Err(AttemptError::Retry(e)) => {
                    debug!(retry, "Data channel not open yet: {:#}", e);
                    last_err = Some(e);
                }
                Err(fatal) => return Err(fatal),
            }
        }
        Err(AttemptError::Retry(
            last_err.unwrap_or_else(|| anyhow!("data channel never opened")),
        ))
    }

    /// Offerer: after losing the connection, renegotiate on the remaining candidates
    pub async fn recover_as_offerer<S: Signaling>(&self, signaling: &S) -> Result<AnswerPayload> {
        let role = self.cursor.lock().await.role.clone();
        let Some(Role::Offerer(details)) = role else {
            return Err(TransferError::Protocol("not negotiated as offerer".into()));
        };
        warn!("Connection lost, renegotiating");
        self.set_state(ChannelState::Failed).await;
        self.teardown().await;
        self.negotiate_offerer(signaling, &details).await
    }

    /// Answerer: after losing the connection, follow the offerer's next round
    pub async fn recover_as_answerer<S: Signaling>(&self, signaling: &S) -> Result<OfferPayload> {
        let role = self.cursor.lock().await.role.clone();
        let Some(Role::Answerer { public_key }) = role else {
            return Err(TransferError::Protocol("not negotiated as answerer".into()));
        };
        warn!("Connection lost, waiting for renegotiation");
        self.set_state(ChannelState::Failed).await;
        self.teardown().await;
        self.negotiate_answerer(signaling, public_key).await
    }

    /// Connected → Transferring
    pub async fn begin_transfer(&self) -> Result<()> {
        match self.state() {
            ChannelState::Connected => {
                self.set_state(ChannelState::Transferring).await;
                Ok(())
            }
            ChannelState::Transferring => Ok(()),
            other => Err(TransferError::Protocol(format!(
                "cannot start transferring from {:?}",
                other
            ))),
        }
    }

    async fn current_link(&self) -> Result<Arc<LinkOf<C>>> {
        self.link
            .read()
            .await
            .clone()
            .ok_or_else(|| TransferError::ConnectionLost("no open data channel".into()))
    }

    /// Send once the buffered amount is at or below the low-water mark
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let link = self.current_link().await?;
        let _guard = self.send_lock.lock().await;
        let options = self.options();

        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::TransferCancelled);
            }
            if !link.is_open() {
                return Err(TransferError::ConnectionLost("data channel closed".into()));
            }
            let buffered = link.buffered_amount().await;
            if buffered <= options.low_water_mark {
                break;
            }
            debug!(buffered, low_water = options.low_water_mark, "Backpressure");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::TransferCancelled),
                _ = tokio::time::sleep(options.poll_interval) => {}
            }
        }

        link.send(frame)
            .await
            .map_err(|e| TransferError::ConnectionLost(format!("{:#}", e)))
    }

    pub async fn recv(&self) -> Result<Frame> {
        let link = self.current_link().await?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::TransferCancelled),
            frame = link.recv() => frame.ok_or_else(|| TransferError::ConnectionLost("data channel closed".into())),
        }
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Frame> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| TransferError::ChannelTimeout(format!("no message within {:?}", timeout)))?
    }

    pub async fn buffered_amount(&self) -> usize {
        match self.link.read().await.as_ref() {
            Some(link) => link.buffered_amount().await,
            None => 0,
        }
    }

    /// Drain pending data, then tear down and move to `Closed`
    pub async fn complete(&self) -> Result<()> {
        if let Some(link) = self.link.read().await.clone() {
            let options = self.options();
            let drained = async {
                while link.is_open() && link.buffered_amount().await > 0 {
                    tokio::time::sleep(options.poll_interval).await;
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.teardown().await;
                    self.set_state(ChannelState::Closed).await;
                    return Err(TransferError::TransferCancelled);
                }
                res = tokio::time::timeout(options.completion_timeout, drained) => {
                    if res.is_err() {
                        warn!("Buffer did not drain before close");
                    }
                }
            }
        }
        self.teardown().await;
        self.set_state(ChannelState::Closed).await;
        Ok(())
    }

    /// Tear down after an unrecoverable transfer error
    pub async fn abort(&self) {
        self.teardown().await;
        self.set_state(ChannelState::Closed).await;
    }

    /// Caller-initiated cancellation, valid from any state
    pub async fn cancel(&self) {
        self.cancel.cancel();
        self.teardown().await;
        self.set_state(ChannelState::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        use ChannelState::*;
        assert!(Idle.can_transition_to(Negotiating));
        assert!(Negotiating.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Negotiating));
        assert!(Transferring.can_transition_to(Closed));
        assert!(Idle.can_transition_to(Closed));
        assert!(!Idle.can_transition_to(Transferring));
        assert!(!Closed.can_transition_to(Negotiating));
        assert!(!Negotiating.can_transition_to(Transferring));
    }

    #[test]
    fn test_mobile_options() {
        let mobile = ChannelOptions::for_device(DeviceClass::Mobile);
        let desktop = ChannelOptions::default();
        assert!(mobile.max_retransmits < desktop.max_retransmits);
        assert!(mobile.gather_timeout > desktop.gather_timeout);
        assert!(desktop.ordered && mobile.ordered);
    }

    #[test]
    fn test_profile_sets_retry_policy() {
        let mut options = ChannelOptions::default();
        let profile = TransferProfile {
            retry_attempts: 7,
            retry_strategy: RetryStrategy::Linear,
            timeout: Duration::from_secs(90),
            ..TransferProfile::with_chunk_size(4096)
        };
        options.apply_profile(&profile);
        assert_eq!(options.open_retries, 7);
        assert_eq!(options.retry_strategy, RetryStrategy::Linear);
        assert_eq!(options.completion_timeout, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_manager_retunes_from_profile() {
        let manager = ChannelManager::new(
            memory::MemoryNetwork::new(),
            ChannelOptions::default(),
            CancellationToken::new(),
        );
        let mobile = crate::probe::derive_profile(
            &crate::probe::NetworkMeasurement::CONSERVATIVE,
            DeviceClass::Mobile,
        );
        manager.apply_profile(&mobile);
        let options = manager.options();
        assert_eq!(options.open_retries, DEFAULT_RETRY_ATTEMPTS + CONSTRAINED_EXTRA_RETRIES);
        assert_eq!(options.completion_timeout, DEFAULT_TIMEOUT * CONSTRAINED_TIMEOUT_FACTOR);
    }
}
