//! Outbound side of the discovery protocol.
//!
//! A fresh non-bootstrap node asks an existing cluster to add it; a
//! rejoining node announces its (possibly changed) address. Both walk
//! their target list round-robin under the configured exponential backoff
//! until one request succeeds or the budget runs out.

use std::time::Duration;

use tracing::{debug, warn};

use super::backoff::ExponentialBackoff;
use crate::config::BackoffConfig;
use crate::error::{NodeError, Result};
use crate::types::{JoinRequest, MembersResponse};

/// Headroom over the server-side 10 s conf-change wait.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const MEMBERS_PATH: &str = "/cluster/members";
const REJOIN_PATH: &str = "/cluster/members/rejoin";

pub(crate) struct DiscoveryClient {
    http: reqwest::Client,
    backoff: BackoffConfig,
}

impl DiscoveryClient {
    pub fn new(backoff: BackoffConfig) -> DiscoveryClient {
        DiscoveryClient {
            http: reqwest::Client::new(),
            backoff,
        }
    }

    /// Ask the cluster to add this node. `targets` are `host:api_port`
    /// addresses of possible members.
    pub async fn join(&self, targets: &[String], request: &JoinRequest) -> Result<()> {
        self.retry_post("join", MEMBERS_PATH, targets, request)
            .await?;
        Ok(())
    }

    /// Announce a changed address for an existing member. Returns the
    /// cluster's current peer list so the caller can refresh its
    /// transport.
    pub async fn rejoin(&self, targets: &[String], request: &JoinRequest) -> Result<MembersResponse> {
        let body = self
            .retry_post("rejoin", REJOIN_PATH, targets, request)
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| NodeError::Membership(format!("bad rejoin response: {}", e)))
    }

    /// Round-robin `targets` under the backoff schedule until one POST
    /// succeeds; returns that response's body.
    async fn retry_post(
        &self,
        what: &str,
        path: &str,
        targets: &[String],
        request: &JoinRequest,
    ) -> Result<Vec<u8>> {
        if targets.is_empty() {
            return Err(NodeError::Membership(format!(
                "no peers available for {}",
                what
            )));
        }

        let mut backoff = ExponentialBackoff::new(&self.backoff);
        let mut round = 0usize;
        loop {
            let target = &targets[round % targets.len()];
            round += 1;

            match self.post(target, path, request).await {
                Ok(body) => {
                    debug!(target = %target, what, "discovery handshake succeeded");
                    return Ok(body);
                }
                Err(e) => match backoff.next_interval() {
                    Some(wait) => {
                        warn!(
                            target = %target,
                            error = %e,
                            retry_in = ?wait,
                            "couldn't {} cluster, trying again",
                            what
                        );
                        tokio::time::sleep(wait).await;
                    }
                    None => {
                        return Err(NodeError::Membership(format!(
                            "{} failed within the backoff budget: {}",
                            what, e
                        )));
                    }
                },
            }
        }
    }

    async fn post(&self, base: &str, path: &str, request: &JoinRequest) -> Result<Vec<u8>> {
        let url = format!("http://{}{}", base, path);
        let response = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await
            .map_err(|e| NodeError::Membership(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::Membership(format!("{} answered {}", url, status)));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| NodeError::Membership(format!("{}: {}", url, e)))?;
        Ok(body.to_vec())
    }
}
