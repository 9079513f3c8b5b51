use anyhow::Result;
use bytes::Bytes;
use codeshare_core::channel::{ChannelOptions, Frame, PeerConnector, PeerLink, PeerSession};
use codeshare_rtc::RtcConnector;
use std::time::Duration;

/// Two peers on one host, host candidates only
#[tokio::test]
#[ignore = "opens real UDP sockets"]
async fn test_loopback_data_channel() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .try_init()
        .ok();

    let connector = RtcConnector::new().with_loopback(true);
    let options = ChannelOptions::default();

    let (offerer, offer_sdp) = connector.create_offer("", &options).await?;
    let (answerer, answer_sdp) = connector.accept_offer("", &offer_sdp, &options).await?;
    offerer.apply_answer(&answer_sdp).await?;

    let timeout = Duration::from_secs(20);
    let (sender, receiver) = tokio::try_join!(offerer.open_link(timeout), answerer.open_link(timeout))?;
    assert!(sender.is_open());

    sender.send(Frame::Text("hello".into())).await?;
    sender
        .send(Frame::Binary(Bytes::from_static(&[1, 2, 3, 4])))
        .await?;

    assert_eq!(receiver.recv().await, Some(Frame::Text("hello".into())));
    assert_eq!(
        receiver.recv().await,
        Some(Frame::Binary(Bytes::from_static(&[1, 2, 3, 4])))
    );

    sender.close().await;
    offerer.close().await;
    answerer.close().await;
    Ok(())
}
