use anyhow::{Context, Result, anyhow};
use codeshare_core::channel::{ChannelOptions, PeerConnector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::session::RtcSession;

/// Label of the single data channel carrying transfer frames
pub const DATA_CHANNEL_LABEL: &str = "codeshare";

/// Largest SCTP message either side will send or accept
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Opens WebRTC peer connections, one per candidate server
#[derive(Debug, Clone, Default)]
pub struct RtcConnector {
    include_loopback: bool,
}

impl RtcConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also gather 127.0.0.1 candidates (two peers on one host)
    pub fn with_loopback(mut self, include_loopback: bool) -> Self {
        self.include_loopback = include_loopback;
        self
    }

    fn build_api(&self) -> Result<API> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .context("Failed to register interceptors")?;

        let mut settings = SettingEngine::default();
        settings.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(
            SCTP_MAX_MESSAGE_SIZE,
        ));
        settings.set_include_loopback_candidate(self.include_loopback);

        Ok(APIBuilder::new()
            .with_setting_engine(settings)
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build())
    }

    async fn new_peer_connection(&self, server: &str) -> Result<Arc<RTCPeerConnection>> {
        let api = self.build_api()?;
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: ice_servers_for(server),
                ..Default::default()
            })
            .await
            .context("Failed to create peer connection")?;
        Ok(Arc::new(pc))
    }
}

/// An empty server means host candidates only
pub fn ice_servers_for(server: &str) -> Vec<RTCIceServer> {
    if server.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: vec![server.to_string()],
        ..Default::default()
    }]
}

pub fn data_channel_init(options: &ChannelOptions) -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(options.ordered),
        max_retransmits: Some(options.max_retransmits),
        ..Default::default()
    }
}

/// Advertise our receive limit; without the attribute peers assume 64 KiB
pub fn inject_max_message_size(mut desc: RTCSessionDescription) -> RTCSessionDescription {
    if !desc.sdp.contains("a=max-message-size:") {
        desc.sdp
            .push_str(&format!("a=max-message-size:{}\r\n", SCTP_MAX_MESSAGE_SIZE));
    }
    desc
}

/// Wait for ICE gathering up to `timeout`, then serialise the local description.
/// A timeout is not fatal: whatever was gathered so far is used.
async fn gathered_description(pc: &RTCPeerConnection, timeout: Duration) -> Result<String> {
    let mut complete = pc.gathering_complete_promise().await;
    if tokio::time::timeout(timeout, complete.recv()).await.is_err() {
        warn!(?timeout, "ICE gathering timed out, using partial candidates");
    }

    let desc = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("No local description after ICE gathering"))?;
    Ok(serde_json::to_string(&inject_max_message_size(desc))?)
}

impl PeerConnector for RtcConnector {
    type Session = RtcSession;

    async fn create_offer(
        &self,
        server: &str,
        options: &ChannelOptions,
    ) -> Result<(RtcSession, String)> {
        info!(server = %server, "Creating WebRTC offer");
        let pc = self.new_peer_connection(server).await?;
        let session = RtcSession::new(pc.clone());

        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(data_channel_init(options)))
            .await
            .context("Failed to create data channel")?;
        session.attach(dc).await;

        let offer = pc.create_offer(None).await.context("Failed to create offer")?;
        pc.set_local_description(offer)
            .await
            .context("Failed to set local description")?;
        let sdp = gathered_description(&pc, options.gather_timeout).await?;
        Ok((session, sdp))
    }

    async fn accept_offer(
        &self,
        server: &str,
        offer_sdp: &str,
        options: &ChannelOptions,
    ) -> Result<(RtcSession, String)> {
        info!(server = %server, "Answering WebRTC offer");
        let pc = self.new_peer_connection(server).await?;
        let session = RtcSession::new(pc.clone());
        session.accept_remote_channels();

        let desc: RTCSessionDescription =
            serde_json::from_str(offer_sdp).context("Malformed offer description")?;
        pc.set_remote_description(desc)
            .await
            .context("Failed to apply offer")?;

        let answer = pc.create_answer(None).await.context("Failed to create answer")?;
        pc.set_local_description(answer)
            .await
            .context("Failed to set local description")?;
        let sdp = gathered_description(&pc, options.gather_timeout).await?;
        Ok((session, sdp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeshare_core::probe::DeviceClass;

    #[test]
    fn test_ice_servers_for() {
        assert!(ice_servers_for("").is_empty());
        let servers = ice_servers_for("stun:stun.l.google.com:19302");
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
    }

    #[test]
    fn test_data_channel_init_follows_options() {
        let init = data_channel_init(&ChannelOptions::for_device(DeviceClass::Mobile));
        assert_eq!(init.ordered, Some(true));
        assert_eq!(
            init.max_retransmits,
            Some(codeshare_core::transfer::constants::MOBILE_MAX_RETRANSMITS)
        );
    }

    #[test]
    fn test_inject_max_message_size_once() {
        let mut desc = RTCSessionDescription::default();
        desc.sdp = "v=0\r\n".to_string();
        let desc = inject_max_message_size(inject_max_message_size(desc));
        assert_eq!(desc.sdp.matches("a=max-message-size:").count(), 1);
    }
}
