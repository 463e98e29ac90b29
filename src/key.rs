//! Request fingerprinting.
//!
//! A key is the concatenation of rule-selected request components, each
//! terminated by a delimiter byte that cannot appear inside a component.
//! Two keys are equal iff their bytes are equal; the 64-bit hash only
//! narrows the bucket and collisions are resolved by full comparison.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::http::{PrebuiltReq, RequestView};
use crate::rule::KeyComponent;

/// Separator written after every component, absent ones included.
pub const KEY_DELIMITER: u8 = 0x1f;

// fixed keys: the hash must be identical across process restarts
const HASH_KEY_0: u64 = 0x4c41_5244_4552_4831;
const HASH_KEY_1: u64 = 0x4c41_5244_4552_4832;

/// Stable 64-bit hash over key bytes.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(HASH_KEY_0, HASH_KEY_1);
    hasher.write(bytes);
    hasher.finish()
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Key {
    buf: Vec<u8>,
}

impl Key {

    pub fn new() -> Key {
        Key { buf: Vec::new() }
    }

    /// Append one component slot. Empty slots still emit their delimiter so
    /// absent components keep keys distinguishable.
    pub fn append(&mut self, part: &[u8]) {
        self.buf.extend_from_slice(part);
        self.buf.push(KEY_DELIMITER);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn hash(&self) -> u64 {
        hash_bytes(&self.buf)
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn cookie_value(cookie: &str, name: &str) -> Option<String> {
    for pair in cookie.split(';') {
        let pair = pair.trim();
        if let Some(pos) = pair.find('=') {
            if &pair[..pos] == name {
                return Some(pair[pos + 1..].to_string());
            }
        }
    }
    None
}

/// Compose the key for one rule from the prebuilt snapshot plus the raw
/// message (arbitrary headers and the body are not snapshotted).
pub fn build_key(
    components: &[KeyComponent],
    pre: &PrebuiltReq,
    req: &dyn RequestView,
) -> Key {

    let mut key = Key::new();

    for component in components {
        match component {
            KeyComponent::Method => key.append(pre.method.as_bytes()),
            KeyComponent::Scheme => key.append(pre.scheme.as_bytes()),
            KeyComponent::Host => {
                key.append(pre.host.as_deref().unwrap_or("").as_bytes())
            }
            KeyComponent::Uri => key.append(pre.uri.as_bytes()),
            KeyComponent::Path => key.append(pre.path.as_bytes()),
            KeyComponent::Delimiter => {
                key.append(if pre.has_query { b"?" } else { b"" })
            }
            KeyComponent::Query => {
                key.append(pre.query.as_deref().unwrap_or("").as_bytes())
            }
            KeyComponent::Param(name) => {
                let value = pre
                    .query
                    .as_deref()
                    .and_then(|query| query_param(query, name));
                key.append(value.as_deref().unwrap_or("").as_bytes());
            }
            KeyComponent::Header(name) => {
                let value = req
                    .headers()
                    .get(name.as_str())
                    .map(|v| v.as_bytes())
                    .unwrap_or(b"");
                key.append(value);
            }
            KeyComponent::Cookie(name) => {
                let value = pre
                    .cookie
                    .as_deref()
                    .and_then(|cookie| cookie_value(cookie, name));
                key.append(value.as_deref().unwrap_or("").as_bytes());
            }
            KeyComponent::Body => {
                key.append(req.body().map(|b| b.as_ref()).unwrap_or(b""));
            }
        }
    }

    key
}

#[cfg(test)]
mod tests {

    use bytes::Bytes;

    use super::*;
    use crate::http::{ProxyRequest, Scheme};
    use crate::rule::parse_key_format;

    fn request(uri: &str, headers: &[(&str, &str)], body: Option<&[u8]>) -> ProxyRequest {
        let mut builder = http::Request::builder().method("GET").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        ProxyRequest::new(parts, Scheme::Http, body.map(Bytes::copy_from_slice))
    }

    fn key_for(format: &str, req: &ProxyRequest) -> Key {
        let components = parse_key_format(format).unwrap();
        let pre = PrebuiltReq::snapshot(req);
        build_key(&components, &pre, req)
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }

    #[test]
    fn identical_requests_agree() {
        let a = request("/a?x=1", &[("host", "h")], None);
        let b = request("/a?x=1", &[("host", "h")], None);
        assert_eq!(key_for("method.scheme.host.uri", &a), key_for("method.scheme.host.uri", &b));
    }

    #[test]
    fn query_variance_changes_key() {
        let a = request("/a?x=1", &[("host", "h")], None);
        let b = request("/a?x=2", &[("host", "h")], None);
        assert_ne!(key_for("method.host.uri", &a), key_for("method.host.uri", &b));
    }

    #[test]
    fn path_only_key_ignores_query() {
        let a = request("/a?x=1", &[("host", "h")], None);
        let b = request("/a?x=2", &[("host", "h")], None);
        assert_eq!(key_for("method.host.path", &a), key_for("method.host.path", &b));
    }

    #[test]
    fn param_component_extracts_value() {
        let a = request("/a?sid=42&x=1", &[("host", "h")], None);
        let b = request("/b?sid=42", &[("host", "h")], None);
        assert_eq!(key_for("param_sid", &a), key_for("param_sid", &b));

        let c = request("/a?sid=43", &[("host", "h")], None);
        assert_ne!(key_for("param_sid", &a), key_for("param_sid", &c));
    }

    #[test]
    fn absent_component_still_delimits() {
        // "ab" + "" must differ from "a" + "b"
        let components = parse_key_format("header_one.header_two").unwrap();

        let a = request("/", &[("one", "ab")], None);
        let b = request("/", &[("one", "a"), ("two", "b")], None);

        let pre_a = PrebuiltReq::snapshot(&a);
        let pre_b = PrebuiltReq::snapshot(&b);

        assert_ne!(
            build_key(&components, &pre_a, &a),
            build_key(&components, &pre_b, &b)
        );
    }

    #[test]
    fn cookie_component() {
        let a = request("/", &[("host", "h"), ("cookie", "sid=abc; theme=dark")], None);
        let pre = PrebuiltReq::snapshot(&a);
        let components = parse_key_format("cookie_sid").unwrap();
        let key = build_key(&components, &pre, &a);
        assert_eq!(key.as_bytes(), b"abc\x1f");
    }

    #[test]
    fn body_component() {
        let a = request("/", &[("host", "h")], Some(b"payload"));
        let components = parse_key_format("body").unwrap();
        let pre = PrebuiltReq::snapshot(&a);
        let key = build_key(&components, &pre, &a);
        assert_eq!(key.as_bytes(), b"payload\x1f");
    }

    #[test]
    fn delimiter_component_reflects_query() {
        let with = request("/a?x=1", &[("host", "h")], None);
        let without = request("/a", &[("host", "h")], None);
        assert_ne!(key_for("delimiter", &with), key_for("delimiter", &without));
    }
}
