mod common;

use codeshare_core::channel::memory::MemoryNetwork;
use codeshare_core::rendezvous::MemoryBackend;
use codeshare_core::transfer::{ReceiveOptions, TransferStatus};
use codeshare_core::{AppEvent, ChannelState, ErrorKind, RendezvousStore, TransferError, TransferProfile};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_fails_over_to_third_candidate() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(48 * 1024);
    let path = write_file(dir.path(), "failover.bin", &data).await;

    let network = MemoryNetwork::new();
    network.fail_server("bad").await;
    network.stall_server("slow").await;
    let store = Arc::new(RendezvousStore::new(MemoryBackend::new()));
    let candidates = ["bad", "slow", "good"];

    let (tx, rx) = mpsc::channel(256);
    let (code_rx, events) = collect_events(rx);
    let sender = session(&network, &store, test_config(&candidates), CancellationToken::new())
        .with_events(tx);
    let send_task = tokio::spawn(async move {
        sender
            .send(&path, TransferProfile::with_chunk_size(4096), false)
            .await
    });

    let code = code_rx.await.unwrap();
    let receiver = session(&network, &store, test_config(&candidates), CancellationToken::new());
    let file = receiver
        .receive(&code, ReceiveOptions::default(), None)
        .await
        .unwrap();

    let state = send_task.await.unwrap().unwrap();
    assert!(tokio::fs::read(file.path()).await.unwrap() == data);
    assert_eq!(state.status(), TransferStatus::Success);

    // Two candidates failed on the way
    let events = events.await.unwrap();
    let failures = events
        .iter()
        .filter(|e| matches!(e, AppEvent::ChannelState(ChannelState::Failed)))
        .count();
    assert_eq!(failures, 2);
    let codes = events
        .iter()
        .filter(|e| matches!(e, AppEvent::CodeReady { .. }))
        .count();
    assert_eq!(codes, 1, "the code must survive failover");
}

#[tokio::test]
async fn test_every_candidate_failing_reports_attempts() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "nowhere.bin", &pattern(1024)).await;

    let network = MemoryNetwork::new();
    network.fail_server("bad1").await;
    network.fail_server("bad2").await;
    let store = Arc::new(RendezvousStore::new(MemoryBackend::new()));

    let sender = session(
        &network,
        &store,
        test_config(&["bad1", "bad2"]),
        CancellationToken::new(),
    );
    let err = sender
        .send(&path, TransferProfile::with_chunk_size(1024), false)
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransferError::ChannelNegotiationFailed { attempts: 2 }),
        "{:?}",
        err
    );
    assert_eq!(sender.manager().state(), ChannelState::Failed);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_receiver() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "lonely.bin", &pattern(4096)).await;

    let network = MemoryNetwork::new();
    let store = Arc::new(RendezvousStore::new(MemoryBackend::new()));
    let cancel = CancellationToken::new();
    let sender = session(&network, &store, test_config(&["s1"]), cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = sender
        .send(&path, TransferProfile::with_chunk_size(1024), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransferCancelled);
    assert_eq!(sender.manager().state(), ChannelState::Closed);
}

#[tokio::test]
async fn test_restreams_after_link_severed() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(32 * 1024);
    let path = write_file(dir.path(), "resume.bin", &data).await;

    let network = MemoryNetwork::new().with_drain_delay(Duration::from_millis(2));
    network.sever_after(5).await;
    let store = Arc::new(RendezvousStore::new(MemoryBackend::new()));
    let mut config = test_config(&["s1", "s2"]);
    config.channel.low_water_mark = 2048;

    let (tx, rx) = mpsc::channel(512);
    let (code_rx, events) = collect_events(rx);
    let sender = session(&network, &store, config.clone(), CancellationToken::new()).with_events(tx);
    let send_task = tokio::spawn(async move {
        sender
            .send(&path, TransferProfile::with_chunk_size(1024), false)
            .await
    });

    let code = code_rx.await.unwrap();
    let receiver = session(&network, &store, config, CancellationToken::new());
    let file = receiver
        .receive(&code, ReceiveOptions::default(), None)
        .await
        .unwrap();

    let state = send_task.await.unwrap().unwrap();
    assert!(tokio::fs::read(file.path()).await.unwrap() == data);
    assert_eq!(file.info.total_chunks, 32);
    assert_eq!(state.status(), TransferStatus::Success);
    assert_eq!(state.total_chunks, 32);

    let events = events.await.unwrap();
    assert!(events.iter().any(|e| matches!(e, AppEvent::ChannelState(ChannelState::Failed))));
    assert!(events.iter().any(|e| matches!(e, AppEvent::TransferCompleted(_))));
}
