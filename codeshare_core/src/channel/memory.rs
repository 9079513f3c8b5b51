//! In-process loopback transport.
//!
//! Nothing leaves the process: this is the transport the test suites drive
//! the session flows with, and never a way to reach a real peer.
//!
//! Both peers hold clones of one [`MemoryNetwork`]. Each direction of a
//! link runs a pump task that moves frames from the sender's queue to the
//! receiver, optionally pausing per frame; bytes still queued count as the
//! sender's buffered amount. Servers can be marked unreachable or stalled,
//! and live links can be severed, to exercise failover.

use super::{ChannelOptions, Frame, PeerConnector, PeerLink, PeerSession};
use anyhow::{Result, anyhow, bail};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";

struct PendingOffer {
    link: MemoryLink,
    answered: Arc<watch::Sender<bool>>,
    closed: CancellationToken,
}

#[derive(Default)]
struct NetworkInner {
    pending: Mutex<HashMap<String, PendingOffer>>,
    unreachable: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
    live: Mutex<Vec<CancellationToken>>,
    /// Offerer → answerer frames, in delivery order
    delivered: Arc<Mutex<Vec<Frame>>>,
    peak_buffered: Arc<AtomicUsize>,
    /// Sever the next link after this many delivered offerer frames
    sever_after: Arc<Mutex<Option<usize>>>,
}

/// Loopback [`PeerConnector`]: offerer and answerer must share one instance
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
    drain_delay: Duration,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each forwarded frame waits `delay`, so senders build up a buffer
    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = delay;
        self
    }

    /// Offers and answers on `server` fail immediately
    pub async fn fail_server(&self, server: &str) {
        self.inner.unreachable.lock().await.insert(server.to_string());
    }

    /// Sessions on `server` negotiate but their channel never opens
    pub async fn stall_server(&self, server: &str) {
        self.inner.stalled.lock().await.insert(server.to_string());
    }

    /// Drop the live link once `frames` offerer frames have been delivered
    pub async fn sever_after(&self, frames: usize) {
        *self.inner.sever_after.lock().await = Some(frames);
    }

    /// Drop every live link
    pub async fn sever_all(&self) {
        for token in self.inner.live.lock().await.drain(..) {
            token.cancel();
        }
    }

    /// Highest buffered amount any sender reached
    pub fn peak_buffered(&self) -> usize {
        self.inner.peak_buffered.load(Ordering::SeqCst)
    }

    pub async fn delivered_frames(&self) -> Vec<Frame> {
        self.inner.delivered.lock().await.clone()
    }

    async fn check_reachable(&self, server: &str) -> Result<()> {
        if self.inner.unreachable.lock().await.contains(server) {
            bail!("candidate server {} is unreachable", server);
        }
        Ok(())
    }

    async fn link_pair(&self) -> (MemoryLink, MemoryLink, CancellationToken) {
        let closed = CancellationToken::new();
        let (offer_out_tx, offer_out_rx) = mpsc::unbounded_channel();
        let (answer_out_tx, answer_out_rx) = mpsc::unbounded_channel();
        let (offer_in_tx, offer_in_rx) = mpsc::unbounded_channel();
        let (answer_in_tx, answer_in_rx) = mpsc::unbounded_channel();
        let offer_buffered = Arc::new(AtomicUsize::new(0));
        let answer_buffered = Arc::new(AtomicUsize::new(0));

        tokio::spawn(pump(Pump {
            from: offer_out_rx,
            to: answer_in_tx,
            buffered: offer_buffered.clone(),
            delay: self.drain_delay,
            closed: closed.clone(),
            log: Some(self.inner.delivered.clone()),
            sever_after: Some(self.inner.sever_after.clone()),
        }));
        tokio::spawn(pump(Pump {
            from: answer_out_rx,
            to: offer_in_tx,
            buffered: answer_buffered.clone(),
            delay: self.drain_delay,
            closed: closed.clone(),
            log: None,
            sever_after: None,
        }));

        let offer_side = MemoryLink {
            outbound: offer_out_tx,
            inbound: Mutex::new(offer_in_rx),
            buffered: offer_buffered,
            peak: self.inner.peak_buffered.clone(),
            closed: closed.clone(),
        };
        let answer_side = MemoryLink {
            outbound: answer_out_tx,
            inbound: Mutex::new(answer_in_rx),
            buffered: answer_buffered,
            peak: self.inner.peak_buffered.clone(),
            closed: closed.clone(),
        };
        self.inner.live.lock().await.push(closed.clone());
        (offer_side, answer_side, closed)
    }
}

struct Pump {
    from: mpsc::UnboundedReceiver<Frame>,
    to: mpsc::UnboundedSender<Frame>,
    buffered: Arc<AtomicUsize>,
    delay: Duration,
    closed: CancellationToken,
    log: Option<Arc<Mutex<Vec<Frame>>>>,
    sever_after: Option<Arc<Mutex<Option<usize>>>>,
}

impl Pump {
    async fn forward(&mut self, frame: Frame) -> bool {
        self.buffered.fetch_sub(frame.len(), Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.lock().await.push(frame.clone());
        }
        if self.to.send(frame).is_err() {
            return false;
        }
        if let Some(sever) = &self.sever_after {
            let mut sever = sever.lock().await;
            if let Some(remaining) = sever.as_mut() {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    *sever = None;
                    debug!("Severing memory link");
                    self.closed.cancel();
                }
            }
        }
        true
    }
}

/// Forward frames until the pair closes, then flush what is already queued
async fn pump(mut p: Pump) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = p.closed.cancelled() => break,
            frame = p.from.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        if !p.delay.is_zero() {
            tokio::time::sleep(p.delay).await;
        }
        if !p.forward(frame).await {
            return;
        }
    }
    while let Ok(frame) = p.from.try_recv() {
        if !p.forward(frame).await {
            return;
        }
    }
}

pub struct MemoryLink {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    buffered: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    closed: CancellationToken,
}

impl PeerLink for MemoryLink {
    async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            bail!("memory link closed");
        }
        let len = frame.len();
        let now = self.buffered.fetch_add(len, Ordering::SeqCst) + len;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.outbound.send(frame).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            anyhow!("memory link closed")
        })
    }

    async fn recv(&self) -> Option<Frame> {
        self.inbound.lock().await.recv().await
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

pub struct MemorySession {
    id: String,
    server: String,
    network: MemoryNetwork,
    link: Mutex<Option<MemoryLink>>,
    answered: Arc<watch::Sender<bool>>,
    closed: CancellationToken,
}

impl PeerSession for MemorySession {
    type Link = MemoryLink;

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let id = sdp
            .strip_prefix(ANSWER_PREFIX)
            .ok_or_else(|| anyhow!("not a memory answer: {}", sdp))?;
        if id != self.id {
            bail!("answer {} does not match offer {}", id, self.id);
        }
        if self.network.inner.stalled.lock().await.contains(&self.server) {
            debug!(server = %self.server, "Stalled server swallowed the answer");
            return Ok(());
        }
        self.answered.send_replace(true);
        Ok(())
    }

    async fn open_link(&self, timeout: Duration) -> Result<MemoryLink> {
        let mut answered = self.answered.subscribe();
        let opened = tokio::time::timeout(timeout, answered.wait_for(|open| *open))
            .await
            .map(|seen| seen.is_ok());
        match opened {
            Ok(true) => {}
            Ok(false) => bail!("session dropped"),
            Err(_) => bail!("data channel did not open within {:?}", timeout),
        }

        if self.closed.is_cancelled() {
            bail!("session closed");
        }
        self.link
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("data channel already handed out"))
    }

    async fn close(&self) {
        self.closed.cancel();
        self.network.inner.pending.lock().await.remove(&self.id);
    }
}

impl PeerConnector for MemoryNetwork {
    type Session = MemorySession;

    async fn create_offer(
        &self,
        server: &str,
        _options: &ChannelOptions,
    ) -> Result<(MemorySession, String)> {
        self.check_reachable(server).await?;

        let id = Uuid::new_v4().to_string();
        let (offer_side, answer_side, closed) = self.link_pair().await;
        let (answered, _) = watch::channel(false);
        let answered = Arc::new(answered);

        self.inner.pending.lock().await.insert(
            id.clone(),
            PendingOffer {
                link: answer_side,
                answered: answered.clone(),
                closed: closed.clone(),
            },
        );

        let session = MemorySession {
            id: id.clone(),
            server: server.to_string(),
            network: self.clone(),
            link: Mutex::new(Some(offer_side)),
            answered,
            closed,
        };
        Ok((session, format!("{}{}", OFFER_PREFIX, id)))
    }

    async fn accept_offer(
        &self,
        server: &str,
        offer_sdp: &str,
        _options: &ChannelOptions,
    ) -> Result<(MemorySession, String)> {
        self.check_reachable(server).await?;

        let id = offer_sdp
            .strip_prefix(OFFER_PREFIX)
            .ok_or_else(|| anyhow!("not a memory offer: {}", offer_sdp))?;
        let pending = self
            .inner
            .pending
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| anyhow!("offer {} is unknown or already answered", id))?;

        let session = MemorySession {
            id: id.to_string(),
            server: server.to_string(),
            network: self.clone(),
            link: Mutex::new(Some(pending.link)),
            answered: pending.answered,
            closed: pending.closed,
        };
        Ok((session, format!("{}{}", ANSWER_PREFIX, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn connected(network: &MemoryNetwork) -> (MemoryLink, MemoryLink) {
        let options = ChannelOptions::default();
        let (offerer, offer) = network.create_offer("s1", &options).await.unwrap();
        let (answerer, answer) = network.accept_offer("s1", &offer, &options).await.unwrap();
        offerer.apply_answer(&answer).await.unwrap();
        let a = offerer.open_link(Duration::from_secs(1)).await.unwrap();
        let b = answerer.open_link(Duration::from_secs(1)).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let network = MemoryNetwork::new();
        let (a, b) = connected(&network).await;

        a.send(Frame::Text("hi".into())).await.unwrap();
        b.send(Frame::Binary(Bytes::from_static(b"yo"))).await.unwrap();
        assert_eq!(b.recv().await, Some(Frame::Text("hi".into())));
        assert_eq!(a.recv().await, Some(Frame::Binary(Bytes::from_static(b"yo"))));
        assert_eq!(network.delivered_frames().await.len(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_then_ends() {
        let network = MemoryNetwork::new();
        let (a, b) = connected(&network).await;

        a.send(Frame::Text("last".into())).await.unwrap();
        a.close().await;
        assert_eq!(b.recv().await, Some(Frame::Text("last".into())));
        assert_eq!(b.recv().await, None);
        assert!(!b.is_open());
        assert!(a.send(Frame::Text("late".into())).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let network = MemoryNetwork::new();
        network.fail_server("bad").await;
        assert!(network.create_offer("bad", &ChannelOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_server_never_opens() {
        let network = MemoryNetwork::new();
        network.stall_server("slow").await;
        let options = ChannelOptions::default();
        let (offerer, offer) = network.create_offer("slow", &options).await.unwrap();
        let (_answerer, answer) = network.accept_offer("slow", &offer, &options).await.unwrap();
        offerer.apply_answer(&answer).await.unwrap();
        assert!(offerer.open_link(Duration::from_millis(50)).await.is_err());
    }

    #[tokio::test]
    async fn test_buffered_amount_drains() {
        let network = MemoryNetwork::new().with_drain_delay(Duration::from_millis(5));
        let (a, b) = connected(&network).await;

        for _ in 0..4 {
            a.send(Frame::Binary(Bytes::from(vec![0u8; 100]))).await.unwrap();
        }
        assert!(a.buffered_amount().await > 0);
        for _ in 0..4 {
            b.recv().await.unwrap();
        }
        assert_eq!(a.buffered_amount().await, 0);
        assert!(network.peak_buffered() >= 300);
    }
}
