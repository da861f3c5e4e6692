//! Membership HTTP API.
//!
//! Handlers only *propose* conf-changes and await their commit through the
//! observer registry; the peer map itself is mutated solely by the Ready
//! loop when the corresponding entry is applied.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result};
use crate::node::NodeHandle;
use crate::types::{JoinRequest, MembersResponse};

/// Bind the membership API listener and serve until the returned sender
/// fires.
pub(crate) async fn start_server(port: u16, handle: NodeHandle) -> Result<oneshot::Sender<()>> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| NodeError::Transport(format!("bind api port {}: {}", port, e)))?;

    let app = Router::new()
        .route("/cluster/members", post(add_member).get(get_members))
        .route("/cluster/members/rejoin", post(rejoin_member))
        .route("/cluster/members/:id", delete(remove_member))
        .with_state(handle);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = served {
            debug!(error = %e, "membership api server exited");
        }
    });

    info!(port, "membership api listening");
    Ok(shutdown_tx)
}

/// `POST /cluster/members`: add the requester to the cluster. Replies once
/// the conf-change commits; `408` when the commit wait times out, `503`
/// when this node cannot drive a membership change right now.
async fn add_member(State(handle): State<NodeHandle>, Json(request): Json<JoinRequest>) -> Response {
    if !handle.can_alter_membership() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    debug!(node = request.id, ip = %request.ip, "member addition requested");
    match handle.propose_member_add(request.id, &request.record()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => membership_error(e, "add"),
    }
}

/// `POST /cluster/members/rejoin`: an existing member announces a changed
/// address. Same flow as an addition, but the reply carries the current
/// peer list so the caller can rebuild its transport.
async fn rejoin_member(
    State(handle): State<NodeHandle>,
    Json(request): Json<JoinRequest>,
) -> Response {
    if !handle.can_alter_membership() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    debug!(node = request.id, ip = %request.ip, "member rejoin requested");
    match handle.propose_member_add(request.id, &request.record()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(MembersResponse {
                peers: handle.peers_snapshot(),
            }),
        )
            .into_response(),
        Err(e) => membership_error(e, "rejoin"),
    }
}

/// `DELETE /cluster/members/{id}`: remove a member, re-proposing until the
/// removal commits.
async fn remove_member(State(handle): State<NodeHandle>, Path(id): Path<u64>) -> Response {
    if !handle.can_alter_membership() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    debug!(node = id, "member removal requested");
    match handle.propose_member_remove(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => membership_error(e, "remove"),
    }
}

/// `GET /cluster/members`: the current committed peer map.
async fn get_members(State(handle): State<NodeHandle>) -> Json<MembersResponse> {
    Json(MembersResponse {
        peers: handle.peers_snapshot(),
    })
}

fn membership_error(error: NodeError, what: &str) -> Response {
    warn!(error = %error, "membership {} failed", what);
    match error {
        NodeError::ConfChangeTimeout => StatusCode::REQUEST_TIMEOUT.into_response(),
        // Proposals are rejected outright while no leader is known.
        NodeError::Raft(_) | NodeError::Stopped => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
