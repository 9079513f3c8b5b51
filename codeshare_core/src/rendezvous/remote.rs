//! Rendezvous backend reachable over a WebSocket.
//!
//! Each operation opens a connection, sends one [`StoreRequest`] text frame
//! and waits for the matching [`StoreResponse`].

use super::backend::{RendezvousBackend, StoredRecord};
use crate::error::{Result, TransferError};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

/// Bound on a single request/response exchange
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Requests from store clients to the rendezvous server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreRequest {
    Get { slot: String },
    Put { slot: String, record: StoredRecord },
    /// Store only if no live record holds the slot
    Claim { slot: String, record: StoredRecord },
    Remove { slot: String },
    /// Expiry is judged by the server's clock
    Sweep,
}

/// Replies from the rendezvous server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreResponse {
    Record { record: Option<StoredRecord> },
    Stored,
    Claimed { stored: bool },
    Removed { removed: bool },
    Swept { count: usize },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct RemoteBackend {
    url: Url,
}

impl RemoteBackend {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| TransferError::Backend(format!("invalid rendezvous URL {}: {}", url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransferError::Backend(format!(
                "rendezvous URL must be ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn exchange(&self, request: &StoreRequest) -> Result<StoreResponse> {
        let fut = async {
            let (mut ws, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| TransferError::Backend(format!("connect {}: {}", self.url, e)))?;

            let text = serde_json::to_string(request)?;
            ws.send(Message::Text(text.into()))
                .await
                .map_err(|e| TransferError::Backend(e.to_string()))?;

            while let Some(msg) = ws.next().await {
                match msg.map_err(|e| TransferError::Backend(e.to_string()))? {
                    Message::Text(text) => {
                        let response: StoreResponse = serde_json::from_str(text.as_str())?;
                        let _ = ws.close(None).await;
                        return Ok(response);
                    }
                    Message::Close(_) => break,
                    _ => continue,
                }
            }
            Err(TransferError::Backend("server closed without replying".into()))
        };

        tokio::time::timeout(REQUEST_TIMEOUT, fut)
            .await
            .map_err(|_| TransferError::Backend(format!("{} did not answer in time", self.url)))?
    }
}

fn unexpected(response: StoreResponse) -> TransferError {
    match response {
        StoreResponse::Error { message } => TransferError::Backend(message),
        other => TransferError::Backend(format!("unexpected reply {:?}", other)),
    }
}

impl RendezvousBackend for RemoteBackend {
    const SEALED: bool = true;

    async fn get(&self, slot: &str) -> Result<Option<StoredRecord>> {
        let request = StoreRequest::Get { slot: slot.to_string() };
        match self.exchange(&request).await? {
            StoreResponse::Record { record } => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    async fn put(&self, slot: &str, record: StoredRecord) -> Result<()> {
        let request = StoreRequest::Put {
            slot: slot.to_string(),
            record,
        };
        match self.exchange(&request).await? {
            StoreResponse::Stored => {
                debug!(slot, "Record stored remotely");
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    /// `now_ms` is ignored; the server decides what is live
    async fn put_if_absent(&self, slot: &str, record: StoredRecord, _now_ms: u64) -> Result<bool> {
        let request = StoreRequest::Claim {
            slot: slot.to_string(),
            record,
        };
        match self.exchange(&request).await? {
            StoreResponse::Claimed { stored } => Ok(stored),
            other => Err(unexpected(other)),
        }
    }

    async fn remove(&self, slot: &str) -> Result<bool> {
        let request = StoreRequest::Remove { slot: slot.to_string() };
        match self.exchange(&request).await? {
            StoreResponse::Removed { removed } => Ok(removed),
            other => Err(unexpected(other)),
        }
    }

    async fn remove_expired(&self, _now_ms: u64) -> Result<usize> {
        match self.exchange(&StoreRequest::Sweep).await? {
            StoreResponse::Swept { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }
}
