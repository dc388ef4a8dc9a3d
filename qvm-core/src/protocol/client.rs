//! Client side of the command transport.

use super::wire::{decode_response, WireRequest};
use super::{recv_json, send_json};
use crate::command::{CommandError, CommandRequest, CommandResponse};
use crate::error::{QvmError, Result};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default ceiling on a response body. Listings can be larger than requests.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// Sends one request per connection to a running daemon.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    addr: String,
    max_response_bytes: usize,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            timeout: Duration::from_secs(330),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Overall deadline for `request`. A live sample waits out its interval
    /// on the daemon before replying, so that time is added on top.
    pub fn deadline_for(&self, request: &WireRequest) -> Duration {
        match request {
            WireRequest::SampleStats { interval, .. } => {
                self.timeout.saturating_add(Duration::from_secs(*interval))
            }
            _ => self.timeout,
        }
    }

    /// Send `request` and return the raw response object.
    pub async fn send(&self, request: &WireRequest) -> Result<Value> {
        let deadline = self.deadline_for(request);
        let exchange = async {
            let mut stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| {
                    QvmError::Transport(format!("failed to connect to {}: {}", self.addr, e))
                })?;
            send_json(&mut stream, request).await?;
            recv_json::<_, Value>(&mut stream, self.max_response_bytes).await
        };

        let response = tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| QvmError::Timeout {
                what: format!("request to {}", self.addr),
                secs: deadline.as_secs(),
            })??;
        debug!(addr = %self.addr, "Received response");
        Ok(response)
    }

    /// Send `request` and decode the response. Transport failures are
    /// reported as `ConnectionFailed`.
    pub async fn call(&self, request: WireRequest) -> CommandResponse {
        let value = self
            .send(&request)
            .await
            .map_err(|e| {
                let reason = format!("Daemon at {} unavailable: {}", self.addr, e);
                CommandError::ConnectionFailed(reason)
            })?;
        decode_response(value)
    }

    pub async fn execute(&self, request: CommandRequest) -> CommandResponse {
        self.call(WireRequest::from(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_deadline_covers_interval() {
        let client = RemoteClient::new("127.0.0.1:1").with_timeout(Duration::from_secs(30));
        assert_eq!(client.deadline_for(&WireRequest::ListVms), Duration::from_secs(30));

        let sample = WireRequest::SampleStats { name: "web".into(), interval: 600 };
        assert_eq!(client.deadline_for(&sample), Duration::from_secs(630));
    }
}
