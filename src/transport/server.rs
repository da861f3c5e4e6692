//! Inbound side of the peer transport.
//!
//! A single `POST /raft` route accepts protobuf-encoded raft messages and
//! forwards them to the orchestrator's step entry point.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::{Transport, HEADER_CLUSTER_ID, HEADER_NODE_ID, HEADER_PEER_URL};
use crate::error::{NodeError, Result};
use crate::node::NodeHandle;

struct RaftServerState {
    transport: Arc<Transport>,
    handle: NodeHandle,
    cluster_id: u64,
}

/// Bind the transport listener and serve until the returned sender fires.
pub(crate) async fn start_server(
    port: u16,
    transport: Arc<Transport>,
    handle: NodeHandle,
) -> Result<oneshot::Sender<()>> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| NodeError::Transport(format!("bind raft port {}: {}", port, e)))?;

    let cluster_id = handle.cluster_id();
    let state = Arc::new(RaftServerState {
        transport,
        handle,
        cluster_id,
    });
    let app = Router::new()
        .route("/raft", post(receive_message))
        .with_state(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = served {
            debug!(error = %e, "raft transport server exited");
        }
    });

    info!(port, "raft transport listening");
    Ok(shutdown_tx)
}

async fn receive_message(
    State(state): State<Arc<RaftServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(cluster) = header_u64(&headers, HEADER_CLUSTER_ID) {
        if cluster != state.cluster_id {
            debug!(cluster, "rejecting message from foreign cluster");
            return StatusCode::PRECONDITION_FAILED;
        }
    }

    let message = match Message::parse_from_bytes(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "undecodable raft message");
            return StatusCode::BAD_REQUEST;
        }
    };

    // Learn the sender's address so replies can flow before membership
    // entries have been applied locally.
    if let (Some(from), Some(url)) = (
        header_u64(&headers, HEADER_NODE_ID),
        headers
            .get(HEADER_PEER_URL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    ) {
        if from != state.handle.id() {
            state.transport.add_remote(from, url);
        }
    }

    match state.handle.step(message).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .and_then(|v| v.parse().ok())
}
