//! Meeting reachability probes.
//!
//! The detector asks a [`MeetingActivityProbe`] whether each watched meeting
//! URL is live. [`HttpProbe`] answers with a plain HTTP request: any 2xx or
//! 3xx means reachable, any other status is a definite "no", and transport
//! failures are reported as errors so callers can fail open.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tc_core::detection::MeetingStatus;
use thiserror::Error;
use tracing::debug;

/// Timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);
const MIN_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TIMEOUT: Duration = Duration::from_secs(8);

/// Probe construction errors.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// Source of meeting reachability.
#[async_trait]
pub trait MeetingActivityProbe: Send + Sync {
    /// Never fails; transport problems come back in [`MeetingStatus::error`].
    async fn probe(&self, url: &str) -> MeetingStatus;
}

/// Probes a meeting URL with `HEAD`, retrying with `GET` when the server
/// rejects `HEAD` with 405.
///
/// # Thread Safety
///
/// Safe to clone and share; clones share the connection pool.
#[derive(Clone)]
pub struct HttpProbe {
    http: reqwest::Client,
    timeout: Duration,
}

impl fmt::Debug for HttpProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProbe")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Keeps probe timeouts within 5 to 8 seconds.
pub fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT)
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let timeout = clamp_timeout(timeout);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProbeError::ClientBuild)?;
        Ok(Self { http, timeout })
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(&self, method: Method, url: &str) -> Result<StatusCode, reqwest::Error> {
        let response = self.http.request(method, url).send().await?;
        Ok(response.status())
    }
}

fn status_for(code: StatusCode) -> MeetingStatus {
    let reachable = code.is_success() || code.is_redirection();
    MeetingStatus::observed(reachable, false).with_http_status(code.as_u16())
}

#[async_trait]
impl MeetingActivityProbe for HttpProbe {
    async fn probe(&self, url: &str) -> MeetingStatus {
        let head = match self.send(Method::HEAD, url).await {
            Ok(code) => code,
            Err(err) => {
                debug!(url, error = %err, "meeting probe failed");
                return MeetingStatus::failed(err.to_string());
            }
        };
        if head != StatusCode::METHOD_NOT_ALLOWED {
            return status_for(head);
        }
        match self.send(Method::GET, url).await {
            Ok(code) => status_for(code),
            Err(err) => {
                debug!(url, error = %err, "meeting probe failed");
                MeetingStatus::failed(err.to_string())
            }
        }
    }
}
