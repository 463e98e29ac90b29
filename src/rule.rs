//! Cache rules.
//!
//! A rule says how to fingerprint a request (its key components), whether a
//! response qualifies (status allowlist and acceptance predicate), how long
//! the entry lives (ttl plus the auto-extend policy) and where it lives
//! (memory and/or disk).

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Error};

use crate::http::RequestView;

/// One component of a rule's key recipe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyComponent {
    /// method: GET, POST...
    Method,
    /// scheme: http, https
    Scheme,
    /// host: Host header
    Host,
    /// uri: first slash to end of the url
    Uri,
    /// path: first slash to question mark
    Path,
    /// delimiter: `?` or ``
    Delimiter,
    /// query: question mark to end of the url, or empty
    Query,
    /// param: query key/value pair
    Param(String),
    Header(String),
    Cookie(String),
    /// full request body
    Body,
}

impl KeyComponent {

    fn parse(token: &str) -> Option<KeyComponent> {
        match token {
            "method" => Some(KeyComponent::Method),
            "scheme" => Some(KeyComponent::Scheme),
            "host" => Some(KeyComponent::Host),
            "uri" => Some(KeyComponent::Uri),
            "path" => Some(KeyComponent::Path),
            "delimiter" => Some(KeyComponent::Delimiter),
            "query" => Some(KeyComponent::Query),
            "body" => Some(KeyComponent::Body),
            _ => {
                if let Some(name) = token.strip_prefix("param_") {
                    if !name.is_empty() {
                        return Some(KeyComponent::Param(name.to_string()));
                    }
                }
                if let Some(name) = token.strip_prefix("header_") {
                    if !name.is_empty() {
                        return Some(KeyComponent::Header(name.to_string()));
                    }
                }
                if let Some(name) = token.strip_prefix("cookie_") {
                    if !name.is_empty() {
                        return Some(KeyComponent::Cookie(name.to_string()));
                    }
                }
                None
            }
        }
    }
}

/// Parse a `.`-separated key recipe, e.g. `method.scheme.host.uri`.
pub fn parse_key_format(text: &str) -> Result<Vec<KeyComponent>, Error> {
    let mut components = Vec::new();

    for token in text.split('.') {
        match KeyComponent::parse(token) {
            Some(component) => components.push(component),
            None => bail!("invalid key component '{}'", token),
        }
    }

    if components.is_empty() {
        bail!("empty key definition");
    }

    Ok(components)
}

/// The default key recipe.
pub fn default_key() -> Vec<KeyComponent> {
    vec![
        KeyComponent::Method,
        KeyComponent::Scheme,
        KeyComponent::Host,
        KeyComponent::Uri,
    ]
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DiskMode {
    /// no disk persistence
    Off,
    /// disk persistence only, do not cache in memory
    Only,
    /// persist the response on disk before returning to the client
    Sync,
    /// cache in memory first and persist on disk later
    Async,
}

impl DiskMode {

    pub fn parse(text: &str) -> Result<DiskMode, Error> {
        match text {
            "off" => Ok(DiskMode::Off),
            "only" => Ok(DiskMode::Only),
            "sync" => Ok(DiskMode::Sync),
            "async" => Ok(DiskMode::Async),
            _ => bail!("disk expects [off|only|sync|async], got '{}'", text),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiskMode::Off => "off",
            DiskMode::Only => "only",
            DiskMode::Sync => "sync",
            DiskMode::Async => "async",
        }
    }
}

/// Automatic ttl extension.
///
/// The interval `[ctime, expire]` is split into four sub-intervals whose
/// lengths are `(100-e0-e1-e2)%`, `e0%`, `e1%` and `e2%` of the ttl; reads
/// bump the access counter of the sub-interval they land in. A read inside
/// the grace window `[expire, expire + e2% * ttl]` extends `expire` by one
/// ttl when `access[3] >= access[2] >= access[1]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtendPolicy {
    pct: [u8; 4],
}

impl ExtendPolicy {

    pub fn new(parts: [u8; 3]) -> Result<ExtendPolicy, Error> {
        let sum = parts[0] as u32 + parts[1] as u32 + parts[2] as u32;

        if sum > 100 {
            bail!("extend percentages sum to {}, exceeding 100", sum);
        }

        // the grace window reuses the last percentage
        Ok(ExtendPolicy {
            pct: [parts[0], parts[1], parts[2], parts[2]],
        })
    }

    /// `extend on` shorthand.
    pub fn default_on() -> ExtendPolicy {
        ExtendPolicy::new([33, 33, 33]).unwrap()
    }

    fn slice(ttl: u32, pct: u8) -> u64 {
        ttl as u64 * pct as u64 / 100
    }

    /// Which access counter a read at `now` bumps. `now` past `expire`
    /// counts into the last sub-interval.
    pub fn stage(&self, ttl: u32, expire: u64, now: u64) -> usize {
        if now >= expire {
            return 3;
        }

        let left = expire - now;

        if left <= Self::slice(ttl, self.pct[2]) {
            3
        } else if left <= Self::slice(ttl, self.pct[1]) + Self::slice(ttl, self.pct[2]) {
            2
        } else if left
            <= Self::slice(ttl, self.pct[0])
                + Self::slice(ttl, self.pct[1])
                + Self::slice(ttl, self.pct[2])
        {
            1
        } else {
            0
        }
    }

    /// True while `now` is inside the grace window past `expire`.
    pub fn in_grace(&self, ttl: u32, expire: u64, now: u64) -> bool {
        now >= expire && now <= expire + Self::slice(ttl, self.pct[3])
    }

    /// The access-history predicate for an extension.
    pub fn qualifies(&self, access: &[u32; 4]) -> bool {
        access[3] >= access[2] && access[2] >= access[1]
    }
}

/// Acceptance predicate seam. The ACL expression engine lives in the host;
/// the rule only keeps a direction-aware callback.
pub enum Acl {
    Always,
    If(Box<AclFn>),
    Unless(Box<AclFn>),
}

pub type AclFn = dyn Fn(&dyn RequestView, bool) -> bool + Send + Sync;

pub struct Rule {
    /// shared across equally-named rules
    pub id: u32,
    /// unique rule id
    pub uuid: u32,
    pub name: String,
    pub key: Vec<KeyComponent>,
    /// allowed response codes, empty accepts all
    pub codes: Vec<u16>,
    /// seconds, 0 never expires
    pub ttl: u32,
    pub acl: Acl,
    pub disk: DiskMode,
    pub etag: bool,
    pub last_modified: bool,
    pub extend: Option<ExtendPolicy>,
    state: AtomicBool,
}

impl Rule {

    pub fn new(id: u32, uuid: u32, name: &str) -> Rule {
        Rule {
            id,
            uuid,
            name: name.to_string(),
            key: default_key(),
            codes: Vec::new(),
            ttl: 0,
            acl: Acl::Always,
            disk: DiskMode::Off,
            etag: false,
            last_modified: false,
            extend: None,
            state: AtomicBool::new(true),
        }
    }

    pub fn enabled(&self) -> bool {
        self.state.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.state.store(on, Ordering::Relaxed);
    }

    pub fn code_ok(&self, status: u16) -> bool {
        self.codes.is_empty() || self.codes.contains(&status)
    }

    /// Evaluate the acceptance predicate for this request, with the
    /// response-side flag set during the response phase.
    pub fn test(&self, req: &dyn RequestView, is_response: bool) -> bool {
        match &self.acl {
            Acl::Always => true,
            Acl::If(cond) => cond(req, is_response),
            Acl::Unless(cond) => !cond(req, is_response),
        }
    }
}

/// Parse a size with `m|M|g|G` suffix. Values below 1 MiB clamp to 1 MiB.
pub fn parse_size(text: &str) -> Result<u64, Error> {
    const MIN: u64 = 1024 * 1024;

    let (digits, suffix) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => text.split_at(pos),
        None => (text, ""),
    };

    if digits.is_empty() {
        bail!("invalid size '{}'", text);
    }

    let value: u64 = digits.parse()?;

    let value = match suffix {
        "" => value,
        "m" | "M" => value
            .checked_shl(20)
            .ok_or_else(|| anyhow::format_err!("size '{}' overflows", text))?,
        "g" | "G" => value
            .checked_shl(30)
            .ok_or_else(|| anyhow::format_err!("size '{}' overflows", text))?,
        _ => bail!("invalid size '{}', expects [m|M|g|G]", text),
    };

    Ok(value.max(MIN))
}

/// Parse a ttl with `s|m|h|d` suffix into seconds.
pub fn parse_ttl(text: &str) -> Result<u32, Error> {
    let (digits, suffix) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => text.split_at(pos),
        None => (text, ""),
    };

    if digits.is_empty() {
        bail!("invalid ttl '{}'", text);
    }

    let value: u32 = digits.parse()?;

    let mult = match suffix {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => bail!("invalid ttl '{}', expects [s|m|h|d]", text),
    };

    value
        .checked_mul(mult)
        .ok_or_else(|| anyhow::format_err!("ttl '{}' overflows", text))
}

/// Parse `extend on|off|n1,n2,n3`.
pub fn parse_extend(text: &str) -> Result<Option<ExtendPolicy>, Error> {
    match text {
        "on" => Ok(Some(ExtendPolicy::default_on())),
        "off" => Ok(None),
        _ => {
            let parts: Vec<&str> = text.split(',').collect();

            if parts.len() != 3 {
                bail!("extend expects [on|off|n1,n2,n3], got '{}'", text);
            }

            let mut values = [0u8; 3];
            for (i, part) in parts.iter().enumerate() {
                values[i] = part
                    .parse()
                    .map_err(|_| anyhow::format_err!("invalid extend value '{}'", part))?;
            }

            Ok(Some(ExtendPolicy::new(values)?))
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn key_format_parses_components() {
        let key = parse_key_format("method.scheme.host.uri.header_Accept.cookie_sid").unwrap();
        assert_eq!(key.len(), 6);
        assert_eq!(key[4], KeyComponent::Header("Accept".to_string()));
        assert_eq!(key[5], KeyComponent::Cookie("sid".to_string()));
    }

    #[test]
    fn key_format_rejects_unknown() {
        assert!(parse_key_format("method.bogus").is_err());
        assert!(parse_key_format("").is_err());
        assert!(parse_key_format("param_").is_err());
    }

    #[test]
    fn size_dsl() {
        assert_eq!(parse_size("2m").unwrap(), 2 << 20);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        // below the floor clamps up
        assert_eq!(parse_size("100").unwrap(), 1 << 20);
        assert!(parse_size("x").is_err());
        assert!(parse_size("1k").is_err());
    }

    #[test]
    fn ttl_dsl() {
        assert_eq!(parse_ttl("90").unwrap(), 90);
        assert_eq!(parse_ttl("90s").unwrap(), 90);
        assert_eq!(parse_ttl("2m").unwrap(), 120);
        assert_eq!(parse_ttl("1h").unwrap(), 3600);
        assert_eq!(parse_ttl("2d").unwrap(), 172800);
        assert!(parse_ttl("5w").is_err());
    }

    #[test]
    fn extend_dsl() {
        assert_eq!(parse_extend("on").unwrap(), Some(ExtendPolicy::default_on()));
        assert_eq!(parse_extend("off").unwrap(), None);
        assert!(parse_extend("20,30,40").unwrap().is_some());
        assert!(parse_extend("50,30,40").is_err());
        assert!(parse_extend("1,2").is_err());
    }

    #[test]
    fn extend_stages() {
        let policy = ExtendPolicy::new([20, 30, 40]).unwrap();
        let ttl = 100;
        let ctime = 1000;
        let expire = ctime + ttl as u64;

        // first 10% of the ttl falls outside every extend slice
        assert_eq!(policy.stage(ttl, expire, ctime + 5), 0);
        assert_eq!(policy.stage(ttl, expire, ctime + 15), 1);
        assert_eq!(policy.stage(ttl, expire, ctime + 45), 2);
        assert_eq!(policy.stage(ttl, expire, ctime + 75), 3);
        assert_eq!(policy.stage(ttl, expire, expire + 1), 3);
    }

    #[test]
    fn extend_grace_window() {
        let policy = ExtendPolicy::new([20, 30, 40]).unwrap();
        let ttl = 100;
        let expire = 1100;

        assert!(policy.in_grace(ttl, expire, 1100));
        assert!(policy.in_grace(ttl, expire, 1140));
        assert!(!policy.in_grace(ttl, expire, 1141));
        assert!(!policy.in_grace(ttl, expire, 1099));
    }

    #[test]
    fn extend_predicate() {
        let policy = ExtendPolicy::default_on();
        assert!(policy.qualifies(&[0, 1, 2, 3]));
        assert!(policy.qualifies(&[9, 0, 0, 0]));
        assert!(!policy.qualifies(&[0, 3, 2, 1]));
    }

    #[test]
    fn code_allowlist() {
        let mut rule = Rule::new(1, 1, "r");
        assert!(rule.code_ok(200));
        assert!(rule.code_ok(500));

        rule.codes = vec![200, 301];
        assert!(rule.code_ok(200));
        assert!(!rule.code_ok(500));
    }

    #[test]
    fn rule_toggle() {
        let rule = Rule::new(1, 1, "r");
        assert!(rule.enabled());
        rule.set_enabled(false);
        assert!(!rule.enabled());
    }
}
