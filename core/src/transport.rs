//! Blocking HTTP execution.
//!
//! The client and session only ever describe requests as `HttpRequest`
//! values. A `Transport` performs the round-trip; `UreqTransport` is the
//! network implementation, and tests substitute their own.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};

/// Executes one HTTP request and returns the raw reply.
///
/// Non-2xx statuses must be returned as data, not as `Err`; `Err` is for
/// failures where no reply was received at all.
pub trait Transport {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        (**self).execute(request)
    }
}

/// `Transport` backed by a shared `ureq::Agent`.
#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .new_agent();
        Self { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Transport for UreqTransport {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let HttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body,
        } = request;

        let req = headers
            .iter()
            .fold(self.agent.post(&url), |req, (k, v)| req.header(k.as_str(), v.as_str()));
        let result = match body {
            Some(body) => req.send(body.as_bytes()),
            None => req.send_empty(),
        };
        let mut response = result.map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(HttpResponse { status, headers, body })
    }
}
