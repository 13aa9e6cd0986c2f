//! Remote size and range-support probe

use crate::error::{Error, Result};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap, RANGE};
use std::time::Duration;

/// What the server told us about a resource
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Full size of the resource, if reported
    pub total: Option<u64>,
    /// Whether byte-range requests are honoured
    pub accepts_ranges: bool,
    /// Entity tag, if any
    pub etag: Option<String>,
}

/// Parsed `Content-Range: bytes start-end/total` header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte served (None for the `*/total` form of a 416)
    pub start: Option<u64>,
    /// Full resource size (None for `/*`)
    pub total: Option<u64>,
}

/// Parse a Content-Range header value
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let start = match range.trim() {
        "*" => None,
        r => {
            let (start, _end) = r.split_once('-')?;
            Some(start.trim().parse().ok()?)
        }
    };
    Some(ContentRange { start, total })
}

/// Content-Range of a response, if present and well-formed
pub fn content_range(headers: &HeaderMap) -> Option<ContentRange> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
}

/// ETag of a response
pub fn etag(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Ask the server for the size of `url` and whether it serves ranges
///
/// Uses a one-byte ranged GET rather than HEAD; many CDNs answer HEAD
/// differently from GET.
pub async fn probe(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<RemoteInfo> {
    let request = client.get(url).header(RANGE, "bytes=0-0").send();
    let response = tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| Error::Timeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })??;

    let headers = response.headers();
    let info = match response.status() {
        StatusCode::PARTIAL_CONTENT => RemoteInfo {
            total: content_range(headers).and_then(|r| r.total),
            accepts_ranges: true,
            etag: etag(headers),
        },
        StatusCode::OK => RemoteInfo {
            total: headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
            accepts_ranges: headers
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes")),
            etag: etag(headers),
        },
        // An empty resource cannot satisfy byte 0
        StatusCode::RANGE_NOT_SATISFIABLE => RemoteInfo {
            total: Some(content_range(headers).and_then(|r| r.total).unwrap_or(0)),
            accepts_ranges: true,
            etag: etag(headers),
        },
        status => return Err(Error::from_status(status.as_u16(), url)),
    };

    tracing::debug!(
        url,
        total = ?info.total,
        accepts_ranges = info.accepts_ranges,
        "probed remote stream"
    );
    Ok(info)
}
