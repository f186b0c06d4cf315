//! Minimal blocking HTTP GET client.
//!
//! Identity rebuild, signing-key bootstrap and playurl resolution all go
//! through the [`Fetch`] trait so the network can be stubbed in tests.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

/// Desktop browser UA sent when the caller did not supply one.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Ordered request headers.
pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A blocking GET. Non-2xx answers are returned as responses, only transport
/// failures are errors.
pub trait Fetch: Send + Sync {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse>;
}

/// `ureq`-backed fetcher with bounded connect and read timeouts.
pub struct UreqFetcher {
    agent: ureq::Agent,
}

impl UreqFetcher {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .redirects(5)
            .build();
        Self { agent }
    }
}

impl Default for UreqFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }
}

impl Fetch for UreqFetcher {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        let mut request = self.agent.get(url);
        if !has_header(headers, "User-Agent") {
            request = request.set("User-Agent", DESKTOP_USER_AGENT);
        }
        for (name, value) in headers {
            request = request.set(name, value);
        }

        let response = match request.call() {
            Ok(response) => response,
            // ureq reports 4xx/5xx as errors; callers want the body anyway.
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => return Err(anyhow!("GET {url}: {err}")),
        };

        let status = response.status();
        let body = response
            .into_string()
            .with_context(|| format!("reading response body of {url}"))?;
        debug!(url, status, bytes = body.len(), "fetched");
        Ok(HttpResponse { status, body })
    }
}

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    header_value(headers, name).is_some()
}
