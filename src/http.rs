//! HTTP message capabilities.
//!
//! The engine never touches the host proxy's message internals. It consumes
//! a request/response through the [RequestView] and [ResponseView]
//! capabilities, so a single pipeline serves every HTTP representation the
//! host speaks.

use bytes::Bytes;
use chrono::NaiveDateTime;
use http::header::{self, HeaderMap};
use http::{Method, StatusCode, Uri};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Read access to the request the host proxy is forwarding.
pub trait RequestView {
    fn method(&self) -> &Method;
    fn scheme(&self) -> Scheme;
    fn uri(&self) -> &Uri;
    fn headers(&self) -> &HeaderMap;

    /// Buffered request body, when the host buffered one.
    fn body(&self) -> Option<&Bytes>;
}

/// Read access to the upstream response headers.
pub trait ResponseView {
    fn status(&self) -> StatusCode;
    fn headers(&self) -> &HeaderMap;
}

/// Request fields extracted once per stream.
///
/// Components referenced by later rules get stable copies here, so key
/// building never re-parses the message.
#[derive(Clone, Debug, Default)]
pub struct PrebuiltReq {
    pub method: String,
    pub scheme: &'static str,
    pub host: Option<String>,
    pub uri: String,
    pub path: String,
    pub has_query: bool,
    pub query: Option<String>,
    pub cookie: Option<String>,
    pub content_type: Option<String>,
    pub transfer_encoding: Option<String>,
}

impl PrebuiltReq {

    pub fn snapshot(req: &dyn RequestView) -> PrebuiltReq {
        let uri = req.uri();

        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .or_else(|| uri.host().map(|s| s.to_string()));

        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string());

        let header_str = |name: header::HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };

        PrebuiltReq {
            method: req.method().as_str().to_string(),
            scheme: req.scheme().as_str(),
            host,
            uri: path_and_query,
            path: uri.path().to_string(),
            has_query: uri.query().is_some(),
            query: uri.query().map(|s| s.to_string()),
            cookie: header_str(header::COOKIE),
            content_type: header_str(header::CONTENT_TYPE),
            transfer_encoding: header_str(header::TRANSFER_ENCODING),
        }
    }
}

/// Outcome of the conditional-request evaluation on a hit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CondOutcome {
    /// serve the cached body
    Serve,
    /// 304, no body
    NotModified,
    /// 412
    PreconditionFailed,
}

fn strip_weak(tag: &[u8]) -> &[u8] {
    if tag.starts_with(b"W/") {
        &tag[2..]
    } else {
        tag
    }
}

fn etag_list_matches(list: &str, etag: &[u8], weak: bool) -> bool {
    for candidate in list.split(',') {
        let candidate = candidate.trim().as_bytes();

        if candidate == b"*" {
            return true;
        }

        let matches = if weak {
            strip_weak(candidate) == strip_weak(etag)
        } else {
            // strong comparison: weak tags never match
            !candidate.starts_with(b"W/") && !etag.starts_with(b"W/") && candidate == etag
        };

        if matches {
            return true;
        }
    }

    false
}

/// Evaluate `If-Match` / `If-Unmodified-Since` / `If-None-Match` /
/// `If-Modified-Since` against the stored validators.
pub fn evaluate_conditional(
    headers: &HeaderMap,
    etag: Option<&[u8]>,
    last_modified: Option<&[u8]>,
) -> CondOutcome {

    let modified_ts = last_modified
        .and_then(|lm| std::str::from_utf8(lm).ok())
        .and_then(parse_http_date);

    if let Some(if_match) = headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) {
        match etag {
            Some(etag) if etag_list_matches(if_match, etag, false) => {}
            _ => return CondOutcome::PreconditionFailed,
        }
    } else if let Some(since) = headers
        .get(header::IF_UNMODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
    {
        match modified_ts {
            Some(modified) if modified <= since => {}
            _ => return CondOutcome::PreconditionFailed,
        }
    }

    if let Some(if_none) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(etag) = etag {
            if etag_list_matches(if_none, etag, true) {
                return CondOutcome::NotModified;
            }
        }
        return CondOutcome::Serve;
    }

    if let (Some(since), Some(modified)) = (
        headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date),
        modified_ts,
    ) {
        if modified <= since {
            return CondOutcome::NotModified;
        }
    }

    CondOutcome::Serve
}

const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Format a unix timestamp as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn http_date(ts: u64) -> String {
    let date = NaiveDateTime::from_timestamp(ts as i64, 0);
    date.format(IMF_FIXDATE).to_string()
}

/// Parse an IMF-fixdate into unix seconds.
pub fn parse_http_date(s: &str) -> Option<u64> {
    let date = NaiveDateTime::parse_from_str(s.trim(), IMF_FIXDATE).ok()?;
    let ts = date.timestamp();

    if ts < 0 {
        None
    } else {
        Some(ts as u64)
    }
}

/// Validator for responses the upstream sent without an `ETag`.
pub fn synthesize_etag(hash: u64, len: u64, ts: u64) -> Vec<u8> {
    format!("\"{:016x}-{:x}-{:x}\"", hash, len, ts).into_bytes()
}

/// A request as seen by the demo proxy and the test suite.
pub struct ProxyRequest {
    pub parts: http::request::Parts,
    pub scheme: Scheme,
    pub body: Option<Bytes>,
}

impl ProxyRequest {

    pub fn new(parts: http::request::Parts, scheme: Scheme, body: Option<Bytes>) -> Self {
        ProxyRequest { parts, scheme, body }
    }
}

impl RequestView for ProxyRequest {

    fn method(&self) -> &Method {
        &self.parts.method
    }

    fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

impl ResponseView for http::response::Parts {

    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn request(uri: &str, headers: &[(&str, &str)]) -> ProxyRequest {
        let mut builder = http::Request::builder().method("GET").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        ProxyRequest::new(parts, Scheme::Http, None)
    }

    #[test]
    fn snapshot_splits_uri() {
        let req = request("/a/b?x=1&y=2", &[("host", "example.com")]);
        let pre = PrebuiltReq::snapshot(&req);

        assert_eq!(pre.host.as_deref(), Some("example.com"));
        assert_eq!(pre.uri, "/a/b?x=1&y=2");
        assert_eq!(pre.path, "/a/b");
        assert_eq!(pre.query.as_deref(), Some("x=1&y=2"));
        assert!(pre.has_query);
    }

    #[test]
    fn snapshot_without_query() {
        let req = request("/a", &[("host", "example.com")]);
        let pre = PrebuiltReq::snapshot(&req);

        assert!(!pre.has_query);
        assert!(pre.query.is_none());
    }

    #[test]
    fn date_round_trip() {
        let ts = 784111777; // Sun, 06 Nov 1994 08:49:37 GMT
        let formatted = http_date(ts);
        assert_eq!(formatted, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&formatted), Some(ts));
    }

    #[test]
    fn if_none_match_hits_304() {
        let req = request("/", &[("if-none-match", "\"abc\"")]);
        let out = evaluate_conditional(req.headers(), Some(b"\"abc\""), None);
        assert_eq!(out, CondOutcome::NotModified);
    }

    #[test]
    fn if_none_match_star() {
        let req = request("/", &[("if-none-match", "*")]);
        let out = evaluate_conditional(req.headers(), Some(b"\"anything\""), None);
        assert_eq!(out, CondOutcome::NotModified);
    }

    #[test]
    fn weak_compare_for_if_none_match() {
        let req = request("/", &[("if-none-match", "W/\"abc\"")]);
        let out = evaluate_conditional(req.headers(), Some(b"\"abc\""), None);
        assert_eq!(out, CondOutcome::NotModified);
    }

    #[test]
    fn if_match_mismatch_fails() {
        let req = request("/", &[("if-match", "\"other\"")]);
        let out = evaluate_conditional(req.headers(), Some(b"\"abc\""), None);
        assert_eq!(out, CondOutcome::PreconditionFailed);
    }

    #[test]
    fn if_modified_since_serves_newer() {
        let lm = http_date(784111777);
        let earlier = http_date(784111000);
        let req = request("/", &[("if-modified-since", earlier.as_str())]);
        let out = evaluate_conditional(req.headers(), None, Some(lm.as_bytes()));
        assert_eq!(out, CondOutcome::Serve);
    }

    #[test]
    fn if_modified_since_304_when_unchanged() {
        let lm = http_date(784111777);
        let req = request("/", &[("if-modified-since", lm.as_str())]);
        let out = evaluate_conditional(req.headers(), None, Some(lm.as_bytes()));
        assert_eq!(out, CondOutcome::NotModified);
    }

    #[test]
    fn synthesized_etag_is_quoted() {
        let etag = synthesize_etag(0xdead, 5, 99);
        assert!(etag.starts_with(b"\""));
        assert!(etag.ends_with(b"\""));
    }
}
