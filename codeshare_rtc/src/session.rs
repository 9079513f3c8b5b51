use anyhow::{Context, Result, anyhow};
use codeshare_core::channel::{Frame, PeerSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::link::RtcLink;

/// Dropping the sender ends the link's receive side
type InboundSender = Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>;

/// One peer connection and its data channel, before and after it opens
pub struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    opened: Arc<watch::Sender<bool>>,
    inbound_tx: InboundSender,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
}

impl RtcSession {
    pub(crate) fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (opened, _) = watch::channel(false);
        let session = Self {
            pc,
            channel: Arc::new(Mutex::new(None)),
            opened: Arc::new(opened),
            inbound_tx: Arc::new(Mutex::new(Some(tx))),
            inbound_rx: Mutex::new(Some(rx)),
        };
        session.watch_connection_state();
        session
    }

    fn watch_connection_state(&self) {
        let inbound = self.inbound_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let inbound = inbound.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            info!(event = "webrtc_connected", "Peer connection established");
                        }
                        RTCPeerConnectionState::Disconnected => {
                            warn!(event = "webrtc_disconnected", "Transient disconnect, ICE may recover");
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            error!(event = "webrtc_down", ?state, "Peer connection is down");
                            inbound.lock().await.take();
                        }
                        _ => {}
                    }
                })
            }));
    }

    /// Wire callbacks of `dc` into this session
    pub(crate) async fn attach(&self, dc: Arc<RTCDataChannel>) {
        *self.channel.lock().await = Some(dc.clone());
        attach_handlers(&dc, self.opened.clone(), self.inbound_tx.clone());
    }

    /// Answerer side: the channel arrives from the remote peer
    pub(crate) fn accept_remote_channels(&self) {
        let channel = self.channel.clone();
        let opened = self.opened.clone();
        let inbound = self.inbound_tx.clone();
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel = channel.clone();
            let opened = opened.clone();
            let inbound = inbound.clone();
            Box::pin(async move {
                debug!(label = %dc.label(), "Remote data channel announced");
                *channel.lock().await = Some(dc.clone());
                attach_handlers(&dc, opened, inbound);
            })
        }));
    }
}

fn attach_handlers(
    dc: &Arc<RTCDataChannel>,
    opened: Arc<watch::Sender<bool>>,
    inbound: InboundSender,
) {
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        let label = label.clone();
        let opened = opened.clone();
        Box::pin(async move {
            info!(event = "dc_open", channel = %label, "Data channel open");
            opened.send_replace(true);
        })
    }));

    let label = dc.label().to_string();
    let on_close_inbound = inbound.clone();
    dc.on_close(Box::new(move || {
        let label = label.clone();
        let inbound = on_close_inbound.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", channel = %label, "Data channel closed by transport");
            inbound.lock().await.take();
        })
    }));

    let label = dc.label().to_string();
    dc.on_error(Box::new(move |err| {
        let label = label.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %label, %err, "Data channel transport error");
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let inbound = inbound.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => Frame::Text(text),
                    Err(e) => {
                        warn!(%e, "Dropping non UTF-8 text message");
                        return;
                    }
                }
            } else {
                Frame::Binary(msg.data)
            };
            if let Some(tx) = inbound.lock().await.as_ref() {
                let _ = tx.send(frame);
            }
        })
    }));
}

impl PeerSession for RtcSession {
    type Link = RtcLink;

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let desc: RTCSessionDescription =
            serde_json::from_str(sdp).context("Malformed answer description")?;
        self.pc
            .set_remote_description(desc)
            .await
            .context("Failed to apply answer")?;
        Ok(())
    }

    async fn open_link(&self, timeout: Duration) -> Result<RtcLink> {
        let mut opened = self.opened.subscribe();
        let became_open = async move { opened.wait_for(|open| *open).await.is_ok() };
        let open = tokio::time::timeout(timeout, became_open)
            .await
            .map_err(|_| anyhow!("data channel did not open within {:?}", timeout))?;
        if !open {
            return Err(anyhow!("session dropped while opening"));
        }

        let dc = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("data channel reported open but is missing"))?;
        let inbound = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("link already taken"))?;
        Ok(RtcLink::new(dc, inbound))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(%e, "Peer connection close failed");
        }
    }
}
