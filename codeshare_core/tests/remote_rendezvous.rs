mod common;

use codeshare_core::channel::memory::MemoryNetwork;
use codeshare_core::rendezvous::backend::RendezvousBackend;
use codeshare_core::rendezvous::server::serve;
use codeshare_core::rendezvous::{FileBackend, RemoteBackend};
use codeshare_core::transfer::ReceiveOptions;
use codeshare_core::{ErrorKind, RendezvousStore, TransferProfile};
use common::*;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Run one transfer where each side owns its own store handle
async fn transfer_through<B: RendezvousBackend + 'static>(
    sender_store: RendezvousStore<B>,
    receiver_store: RendezvousStore<B>,
) {
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(40 * 1024 + 3);
    let path = write_file(dir.path(), "shared.bin", &data).await;

    let network = MemoryNetwork::new();
    let sender_store = Arc::new(sender_store);
    let receiver_store = Arc::new(receiver_store);

    let (tx, rx) = mpsc::channel(256);
    let (code_rx, _events) = collect_events(rx);
    let sender = session(&network, &sender_store, test_config(&["s1"]), CancellationToken::new())
        .with_events(tx);
    let send_task = tokio::spawn(async move {
        sender
            .send(&path, TransferProfile::with_chunk_size(8192), true)
            .await
    });

    let code = code_rx.await.unwrap();
    let receiver = session(&network, &receiver_store, test_config(&["s1"]), CancellationToken::new());
    let file = receiver
        .receive(&code, ReceiveOptions::default(), None)
        .await
        .unwrap();
    send_task.await.unwrap().unwrap();
    assert!(tokio::fs::read(file.path()).await.unwrap() == data);

    // The sender released the code once acknowledged
    let again = receiver
        .receive(&code, ReceiveOptions::default(), None)
        .await
        .unwrap_err();
    assert_eq!(again.kind(), ErrorKind::CodeNotFound);
}

#[tokio::test]
async fn test_transfer_via_rendezvous_server() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(serve(listener, cancel.clone()));

    let url = format!("ws://{}/rendezvous", addr);
    transfer_through(
        RendezvousStore::new(RemoteBackend::new(&url).unwrap()),
        RendezvousStore::new(RemoteBackend::new(&url).unwrap()),
    )
    .await;

    cancel.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_transfer_via_shared_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("rendezvous.json");
    transfer_through(
        RendezvousStore::new(FileBackend::new(&store_path)),
        RendezvousStore::new(FileBackend::new(&store_path)),
    )
    .await;
}
