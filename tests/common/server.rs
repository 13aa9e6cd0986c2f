//! Range-aware mock CDN built on wiremock

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serves one body with HTTP range support and optional faults
///
/// - no `Range` header: 200 with the whole body and `Accept-Ranges: bytes`
/// - `Range: bytes=a-b` / `bytes=a-`: 206 with `Content-Range`
/// - a range starting past the end: 416 with `Content-Range: bytes */len`
/// - `If-Range` not matching the current ETag: 200 with the whole body
#[derive(Clone)]
pub struct RangedBody {
    body: Arc<Vec<u8>>,
    etag: Option<String>,
    fail_first: usize,
    fail_status: u16,
    ignore_range: bool,
    delay: Option<Duration>,
    replacement: Option<(usize, Arc<Vec<u8>>, String)>,
    calls: Arc<AtomicUsize>,
}

impl RangedBody {
    /// Serve `body`
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            etag: None,
            fail_first: 0,
            fail_status: 503,
            ignore_range: false,
            delay: None,
            replacement: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer the first `n` requests with `status`
    pub fn failing_first(mut self, n: usize, status: u16) -> Self {
        self.fail_first = n;
        self.fail_status = status;
        self
    }

    /// Behave like a server without range support
    pub fn ignoring_ranges(mut self) -> Self {
        self.ignore_range = true;
        self
    }

    /// Send this ETag with every response
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// From request `n` on, serve `body` under `etag` instead
    pub fn replaced_after(mut self, n: usize, body: Vec<u8>, etag: impl Into<String>) -> Self {
        self.replacement = Some((n, Arc::new(body), etag.into()));
        self
    }

    /// Delay every response
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests seen so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn template(&self, request: &Request) -> ResponseTemplate {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return ResponseTemplate::new(self.fail_status);
        }

        let (body, etag) = match &self.replacement {
            Some((n, body, etag)) if call >= *n => (body, Some(etag)),
            _ => (&self.body, self.etag.as_ref()),
        };
        let len = body.len() as u64;
        let validator_matches = match request.headers.get("if-range") {
            Some(value) => etag.is_some_and(|etag| value.to_str().ok() == Some(etag.as_str())),
            None => true,
        };
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range)
            .filter(|_| validator_matches);

        let template = match range {
            Some((start, _)) if !self.ignore_range && start >= len => {
                ResponseTemplate::new(416).insert_header("Content-Range", format!("bytes */{len}"))
            }
            Some((start, end)) if !self.ignore_range => {
                let end = end.unwrap_or(len - 1).min(len - 1);
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {start}-{end}/{len}"))
                    .insert_header("Accept-Ranges", "bytes")
                    .set_body_bytes(body[start as usize..=end as usize].to_vec())
            }
            _ => {
                let template = ResponseTemplate::new(200).set_body_bytes(body.to_vec());
                if self.ignore_range {
                    template
                } else {
                    template.insert_header("Accept-Ranges", "bytes")
                }
            }
        };

        let template = match etag {
            Some(etag) => template.insert_header("ETag", etag.as_str()),
            None => template,
        };
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

impl Respond for RangedBody {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.template(request)
    }
}

/// `bytes=a-b` or `bytes=a-`
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().ok()?),
    };
    Some((start, end))
}

/// Mount `responder` at `route` and return its URL
pub async fn mount(server: &MockServer, route: &str, responder: RangedBody) -> String {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(responder)
        .mount(server)
        .await;
    format!("{}{}", server.uri(), route)
}

/// Mount a fixed status at `route` and return its URL
pub async fn mount_status(server: &MockServer, route: &str, status: u16) -> String {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
    format!("{}{}", server.uri(), route)
}

/// Requests the server received for `route`
pub async fn requests_to(server: &MockServer, route: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == route)
        .collect()
}

/// `Range` header values of the requests to `route`, in arrival order
pub async fn ranges_requested(server: &MockServer, route: &str) -> Vec<Option<String>> {
    requests_to(server, route)
        .await
        .iter()
        .map(|r| {
            r.headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .collect()
}
