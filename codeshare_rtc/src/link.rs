use anyhow::{Context, Result};
use codeshare_core::channel::{Frame, PeerLink};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

/// An open data channel
pub struct RtcLink {
    dc: Arc<RTCDataChannel>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl RtcLink {
    pub(crate) fn new(dc: Arc<RTCDataChannel>, inbound: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            dc,
            inbound: Mutex::new(inbound),
        }
    }

    pub fn label(&self) -> &str {
        self.dc.label()
    }
}

impl PeerLink for RtcLink {
    async fn send(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Text(text) => self.dc.send_text(text).await,
            Frame::Binary(bytes) => self.dc.send(&bytes).await,
        }
        .context("Data channel send failed")?;
        Ok(())
    }

    async fn recv(&self) -> Option<Frame> {
        self.inbound.lock().await.recv().await
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(%e, channel = %self.dc.label(), "Data channel close failed");
        }
    }
}
