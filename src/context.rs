//! Per-request filter context.
//!
//! One `CacheCtx` rides along with each stream the host proxy forwards. The
//! engine drives it through the state machine; the host only inspects the
//! state to decide what to do with the wire.

use std::path::PathBuf;

use crate::data::DataId;
use crate::http::PrebuiltReq;
use crate::key::Key;

/// Context states.
///
/// `Wait` is reserved for hosts that can park a request on an in-flight
/// entry; this engine's policy resolves a concurrent second miss to
/// `Bypass` instead.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CtxState {
    Init,
    /// serve from memory
    Hit { data: DataId },
    /// serve from the persistence file
    HitDisk { file: PathBuf },
    /// a rule accepted the request, waiting for the response
    Pass,
    /// streaming the upstream response into a fresh entry
    Create { entry: u32, data: Option<DataId> },
    Wait,
    /// hand the stream through untouched
    Bypass,
    /// response fully cached
    Done,
    Invalid,
    /// purge executed
    Delete,
    /// arena exhausted
    Full,
    /// nosql write waiting for its body
    CheckPersist,
}

/// A built key stashed per rule, so the response phase recovers it without
/// rebuilding.
pub struct Stash {
    pub rule: u32,
    pub key: Key,
    pub hash: u64,
}

pub struct CacheCtx {
    pub state: CtxState,
    pub stash: Vec<Stash>,
    pub pre: Option<PrebuiltReq>,
    /// matched rule uuid
    pub rule: Option<u32>,
    pub key: Option<Key>,
    pub hash: u64,
    /// proxy uuid
    pub pid: i32,
    pub header_len: u32,
    /// bytes appended so far during CREATE
    pub cache_len: u64,
    pub etag: Option<Vec<u8>>,
    pub last_modified: Option<Vec<u8>>,
    /// holds a reader refcount on the hit data
    pub attached: bool,
    /// the create was given up (arena full, upstream failure)
    pub aborted: bool,
}

impl CacheCtx {

    pub fn new(pid: i32) -> CacheCtx {
        CacheCtx {
            state: CtxState::Init,
            stash: Vec::new(),
            pre: None,
            rule: None,
            key: None,
            hash: 0,
            pid,
            header_len: 0,
            cache_len: 0,
            etag: None,
            last_modified: None,
            attached: false,
            aborted: false,
        }
    }

    pub fn stash_rule(&mut self, rule: u32, key: Key, hash: u64) {
        self.stash.push(Stash { rule, key, hash });
    }

    /// Recover the key built for `rule` during the request phase.
    pub fn stashed(&mut self, rule: u32) -> Option<Stash> {
        let pos = self.stash.iter().position(|stash| stash.rule == rule)?;
        Some(self.stash.swap_remove(pos))
    }

    pub fn is_hit(&self) -> bool {
        matches!(self.state, CtxState::Hit { .. } | CtxState::HitDisk { .. })
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn stash_recovers_by_rule() {
        let mut ctx = CacheCtx::new(-1);

        let mut key_a = Key::new();
        key_a.append(b"a");
        let mut key_b = Key::new();
        key_b.append(b"b");

        ctx.stash_rule(1, key_a.clone(), key_a.hash());
        ctx.stash_rule(2, key_b.clone(), key_b.hash());

        let stash = ctx.stashed(2).unwrap();
        assert_eq!(stash.key, key_b);
        assert!(ctx.stashed(2).is_none());
        assert!(ctx.stashed(1).is_some());
    }

    #[test]
    fn hit_states() {
        let mut ctx = CacheCtx::new(-1);
        assert!(!ctx.is_hit());

        ctx.state = CtxState::Hit { data: 3 };
        assert!(ctx.is_hit());

        ctx.state = CtxState::HitDisk { file: PathBuf::from("/x") };
        assert!(ctx.is_hit());
    }
}
