//! Server probing
//!
//! One HEAD request per call. The client never follows redirects, so each
//! hop comes back here as a [`ProbeOutcome::Redirect`] and the caller
//! decides whether to continue.

use crate::error::{NetworkErrorKind, PumpError, Result};
use reqwest::{header, Client, StatusCode};
use url::Url;

/// Server capabilities determined from a HEAD request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// Content-Length header value
    pub content_length: Option<u64>,
    /// Whether server supports Range requests
    pub supports_range: bool,
}

/// Result of probing one URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The server points somewhere else
    Redirect(Url),
    /// The resource is here
    Ready(ServerCapabilities),
}

/// Probe `url` with a HEAD request
pub async fn probe(client: &Client, url: &Url) -> Result<ProbeOutcome> {
    let response = client.head(url.clone()).send().await.map_err(|e| {
        let err = PumpError::from(e);
        tracing::debug!(url = %url, "HEAD request failed: {}", err);
        err
    })?;

    let status = response.status();

    if status.is_redirection() {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                PumpError::connection(
                    NetworkErrorKind::BadRedirect,
                    format!("{} redirect from {} without Location", status, url),
                )
            })?;
        let next = url.join(location).map_err(|e| {
            PumpError::connection(
                NetworkErrorKind::BadRedirect,
                format!("Bad Location '{}': {}", location, e),
            )
        })?;
        return Ok(ProbeOutcome::Redirect(next));
    }

    // Some servers refuse HEAD; the GET will tell us the rest
    if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
        return Ok(ProbeOutcome::Ready(ServerCapabilities::default()));
    }

    if !status.is_success() {
        return Err(PumpError::connection(
            NetworkErrorKind::HttpStatus(status.as_u16()),
            format!("HEAD request returned: {}", status),
        ));
    }

    let headers = response.headers();

    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());

    let supports_range = headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("bytes"))
        .unwrap_or(false);

    Ok(ProbeOutcome::Ready(ServerCapabilities {
        content_length,
        supports_range,
    }))
}
