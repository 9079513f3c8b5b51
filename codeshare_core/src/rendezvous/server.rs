//! Rendezvous server hosting the remote backend.
//!
//! Stores sealed records in memory; clients speak [`StoreRequest`] /
//! [`StoreResponse`] over a WebSocket at `/rendezvous`.

use super::backend::{MemoryBackend, RendezvousBackend, StoredRecord};
use super::remote::{StoreRequest, StoreResponse};
use super::now_ms;
use anyhow::Result;
use axum::{
    Router,
    extract::{
        Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, header},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;

/// Default port for `codeshare serve`
pub const RENDEZVOUS_PORT: u16 = 8787;

/// Largest request frame a client may send (sealed offers are a few KB)
const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Idle time after which a socket with no request is dropped
const IDLE_TIMEOUT_SECS: u64 = 30;

/// Longest lifetime the server grants a record, whatever the client asks
pub const MAX_RECORD_TTL_MS: u64 = 60 * 60 * 1000;

/// Live records the server holds before refusing new slots
pub const MAX_RECORDS: usize = 10_000;

pub struct ServerState {
    pub records: MemoryBackend,
    capacity: usize,
    /// Serialises writes so the capacity check and the insert agree
    write_lock: tokio::sync::Mutex<()>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::with_capacity(MAX_RECORDS)
    }
}

impl ServerState {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: MemoryBackend::default(),
            capacity,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// Re-stamp a client record with the server clock and clamp its expiry
fn admit(mut record: StoredRecord, now: u64) -> StoredRecord {
    let ttl = record
        .expires_at_ms
        .saturating_sub(record.created_at_ms)
        .min(MAX_RECORD_TTL_MS);
    record.created_at_ms = now;
    record.expires_at_ms = now.saturating_add(ttl);
    record
}

/// Sweep, refuse a new slot once the table is full, then store.
/// An `exclusive` write only lands on a free slot.
async fn write_record(
    state: &ServerState,
    slot: &str,
    record: StoredRecord,
    exclusive: bool,
) -> crate::error::Result<bool> {
    let _write = state.write_lock.lock().await;
    let now = now_ms();
    // Writes are the natural moment to drop stale codes
    state.records.remove_expired(now).await?;
    if state.records.len().await >= state.capacity && state.records.get(slot).await?.is_none() {
        return Err(crate::error::TransferError::Backend(format!(
            "rendezvous store is full ({} records)",
            state.capacity
        )));
    }

    let record = admit(record, now);
    if exclusive {
        state.records.put_if_absent(slot, record, now).await
    } else {
        state.records.put(slot, record).await.map(|_| true)
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Middleware to add security headers
async fn add_security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/rendezvous", get(ws_upgrade_handler))
        .layer(RequestBodyLimitLayer::new(MAX_FRAME_SIZE))
        .layer(middleware::from_fn(add_security_headers))
        .with_state(state)
}

/// Apply one request to the record table
pub async fn apply_request(state: &ServerState, request: StoreRequest) -> StoreResponse {
    let result = match request {
        StoreRequest::Get { slot } => state
            .records
            .get(&slot)
            .await
            .map(|record| StoreResponse::Record { record }),
        StoreRequest::Put { slot, record } => write_record(state, &slot, record, false)
            .await
            .map(|_| StoreResponse::Stored),
        StoreRequest::Claim { slot, record } => write_record(state, &slot, record, true)
            .await
            .map(|stored| StoreResponse::Claimed { stored }),
        // Slot ids are digests of codes, so only a code holder can name one
        StoreRequest::Remove { slot } => {
            let _write = state.write_lock.lock().await;
            state
                .records
                .remove(&slot)
                .await
                .map(|removed| StoreResponse::Removed { removed })
        }
        StoreRequest::Sweep => {
            let _write = state.write_lock.lock().await;
            state
                .records
                .remove_expired(now_ms())
                .await
                .map(|count| StoreResponse::Swept { count })
        }
    };

    result.unwrap_or_else(|e| StoreResponse::Error {
        message: e.to_string(),
    })
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        let next = tokio::time::timeout(
            std::time::Duration::from_secs(IDLE_TIMEOUT_SECS),
            receiver.next(),
        )
        .await;

        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::debug!("Rendezvous socket error: {}", e);
                break;
            }
            Ok(None) | Err(_) => break,
        };

        let response = match msg {
            Message::Text(text) => match serde_json::from_str::<StoreRequest>(text.as_str()) {
                Ok(request) => apply_request(&state, request).await,
                Err(e) => StoreResponse::Error {
                    message: format!("malformed request: {}", e),
                },
            },
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(json) = serde_json::to_string(&response) else {
            break;
        };
        if sender.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}

/// Serve the rendezvous router until `cancel` fires
pub async fn serve(listener: TcpListener, cancel: CancellationToken) -> Result<()> {
    let state = Arc::new(ServerState::default());
    let router = create_router(state);

    tracing::info!("Rendezvous server listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::info!("Rendezvous server shutting down gracefully");
        })
        .await?;

    Ok(())
}
