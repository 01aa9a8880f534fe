use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::jsonrpc::Frame;

/// Failure of a single POST. Retry policy belongs to the supervisor; the
/// sender reports and stops.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {status}")]
    Status { status: u16, body: String },
}

/// Client→server channel: one POST per frame to the session endpoint.
///
/// Replaced wholesale by the supervisor on each reconnect; dropping the
/// in-flight `send` future aborts the request.
#[derive(Debug, Clone)]
pub struct PostSender {
    http: reqwest::Client,
    endpoint: Url,
}

impl PostSender {
    pub fn new(http: reqwest::Client, endpoint: Url) -> Self {
        Self { http, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Any 2xx is success; the response body is ignored because replies
    /// arrive out-of-band over the SSE channel.
    pub async fn send(&self, frame: &Frame) -> Result<(), SendError> {
        let body = frame.to_line();
        let resp = self
            .http
            .post(self.endpoint.clone())
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "frame posted");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(SendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
