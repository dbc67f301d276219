//! Peer transport.
//!
//! Members heartbeat each other by reading the peer's `GET /member` and
//! fetch WAL segments for catch-up from `GET /wal/segments`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::controller::status::MemberStatus;
use crate::wal::WalSegment;

/// Requests a member makes to its peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Read the peer's published status.
    async fn heartbeat(&self, address: &str) -> Result<MemberStatus>;

    /// Fetch the segments a member needs after `since` (all retained
    /// segments when `None`).
    async fn fetch_segments(&self, address: &str, since: Option<u64>) -> Result<Vec<WalSegment>>;
}

/// Body of a 409 response from `/wal/segments`.
#[derive(Debug, Deserialize)]
struct DataGapBody {
    required_from: u64,
    oldest_retained: Option<u64>,
}

/// HTTP transport against the peers' REST API.
#[derive(Debug, Clone)]
pub struct HttpPeerTransport {
    http: reqwest::Client,
}

impl HttpPeerTransport {
    /// Create a transport whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Peer(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    fn url(address: &str, path: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}", address.trim_end_matches('/'), path)
        } else {
            format!("http://{}{}", address, path)
        }
    }
}

fn peer_error(address: &str, e: reqwest::Error) -> Error {
    Error::Peer(format!("{}: {}", address, e))
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn heartbeat(&self, address: &str) -> Result<MemberStatus> {
        let response = self
            .http
            .get(Self::url(address, "/member"))
            .send()
            .await
            .map_err(|e| peer_error(address, e))?
            .error_for_status()
            .map_err(|e| peer_error(address, e))?;
        response.json().await.map_err(|e| peer_error(address, e))
    }

    async fn fetch_segments(&self, address: &str, since: Option<u64>) -> Result<Vec<WalSegment>> {
        let mut request = self.http.get(Self::url(address, "/wal/segments"));
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }
        let response = request.send().await.map_err(|e| peer_error(address, e))?;

        if response.status() == StatusCode::CONFLICT {
            let gap: DataGapBody = response.json().await.map_err(|e| peer_error(address, e))?;
            debug!(peer = %address, required_from = gap.required_from, "Peer reported a data gap");
            return Err(Error::DataGap {
                required_from: gap.required_from,
                oldest_retained: gap.oldest_retained,
            });
        }
        let response = response
            .error_for_status()
            .map_err(|e| peer_error(address, e))?;
        response.json().await.map_err(|e| peer_error(address, e))
    }
}
