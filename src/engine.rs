//! The storage and lookup engine.
//!
//! One [Engine] instance serves one configured mode (`cache` or `nosql`).
//! The host proxy attaches a [CacheCtx] to every stream, feeds request
//! headers through [Engine::check_request], forwards upstream response
//! headers through [Engine::on_response], mirrors payload chunks through
//! [Engine::append] and closes the stream with [Engine::on_response_end]
//! or [Engine::abort], finally releasing with [Engine::detach].
//!
//! The arena, the dict/data core and the stats block each sit behind their
//! own lock; no lock is held across an I/O boundary.

use std::path::PathBuf;

use anyhow::{bail, Error};
use bytes::Bytes;
use http::Method;

use crate::context::{CacheCtx, CtxState};
use crate::data::{DataId, DataRing, ResponseInfo};
use crate::dict::{Dict, EntryState};
use crate::http::{
    evaluate_conditional, http_date, synthesize_etag, CondOutcome, PrebuiltReq, RequestView,
    ResponseView,
};
use crate::key::build_key;
use crate::memory::Arena;
use crate::persist::{self, DiskScan, EntryFile, PersistMeta};
use crate::rule::{DiskMode, Rule};
use crate::shctx::ShCtx;
use crate::stats::{ReqOutcome, Stats};
use crate::tools;

const ARENA_BLOCK_SIZE: u32 = 16 * 1024;
const ARENA_CHUNK_SIZE: u32 = 64;

/// Attempts before a file target is abandoned and the entry stays
/// memory-only.
const PERSIST_MAX_RETRIES: u8 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    Cache,
    Nosql,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub mode: Mode,
    pub name: String,
    pub data_size: u64,
    pub dict_size: u64,
    /// persistence root; `None` disables disk
    pub dir: Option<PathBuf>,
    /// stats endpoint path (cache only)
    pub uri: Option<String>,
    pub purge_method: String,
    pub dict_cleaner: usize,
    pub data_cleaner: usize,
    pub disk_cleaner: usize,
    pub disk_loader: usize,
    pub disk_saver: usize,
}

impl EngineConfig {

    pub fn new(mode: Mode, name: &str) -> EngineConfig {
        EngineConfig {
            mode,
            name: name.to_string(),
            data_size: 1024 * 1024,
            dict_size: 1024 * 1024,
            dir: None,
            uri: None,
            purge_method: "PURGE".to_string(),
            dict_cleaner: 100,
            data_cleaner: 100,
            disk_cleaner: 100,
            disk_loader: 100,
            disk_saver: 100,
        }
    }
}

/// What the host should do with the request after the request phase.
pub enum CheckOutcome {
    /// forward untouched
    Bypass,
    /// forward, the response may populate the cache
    Pass,
    /// stream the cached body via [Engine::read_element]
    Hit {
        data: DataId,
        info: ResponseInfo,
        etag: Option<Vec<u8>>,
        last_modified: Option<Vec<u8>>,
    },
    /// stream the body from the persistence file
    HitDisk { file: EntryFile },
    /// answer 304 with the stored validators
    NotModified {
        etag: Option<Vec<u8>>,
        last_modified: Option<Vec<u8>>,
    },
    /// answer 412
    PreconditionFailed,
}

/// Result of a nosql write.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NosqlSetOutcome {
    Created,
    /// no rule accepted the request
    NotAllowed,
    /// engine out of memory
    Full,
}

struct Core {
    dict: Dict,
    data: DataRing,
}

struct DiskState {
    root: PathBuf,
    loader: DiskScan,
    cleaner: DiskScan,
    loader_done: bool,
}

pub struct Engine {
    conf: EngineConfig,
    rules: Vec<Rule>,
    arena: Arena,
    core: ShCtx<Core>,
    stats: Stats,
    disk: Option<ShCtx<DiskState>>,
    /// saver cursor over dict slots
    persist_idx: ShCtx<usize>,
}

enum Found {
    Memory {
        data: DataId,
        info: ResponseInfo,
        etag: Option<Vec<u8>>,
        last_modified: Option<Vec<u8>>,
    },
    Disk(PathBuf),
    Creating,
    Miss,
}

impl Engine {

    pub fn new(conf: EngineConfig, rules: Vec<Rule>) -> Result<Engine, Error> {

        for rule in &rules {
            if rule.disk != DiskMode::Off && conf.dir.is_none() {
                bail!(
                    "rule {}: disk {} enabled but no `dir` defined",
                    rule.name,
                    rule.disk.as_str()
                );
            }
        }

        let arena = Arena::new(&conf.name, conf.data_size, ARENA_BLOCK_SIZE, ARENA_CHUNK_SIZE)?;

        let disk = match &conf.dir {
            Some(root) => {
                tools::create_path(root)?;
                Some(ShCtx::new(DiskState {
                    root: root.clone(),
                    loader: DiskScan::new(root),
                    cleaner: DiskScan::new(root),
                    loader_done: false,
                }))
            }
            None => None,
        };

        let stats = Stats::new(conf.data_size);
        let dict = Dict::new(conf.dict_size);

        Ok(Engine {
            conf,
            rules,
            arena,
            core: ShCtx::new(Core {
                dict,
                data: DataRing::new(),
            }),
            stats,
            disk,
            persist_idx: ShCtx::new(0),
        })
    }

    pub fn mode(&self) -> Mode {
        self.conf.mode
    }

    pub fn conf(&self) -> &EngineConfig {
        &self.conf
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn rule_by_uuid(&self, uuid: u32) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.uuid == uuid)
    }

    fn sync_used_mem(&self) {
        let used = self.arena.used();
        let counted = self.stats.snapshot().used_mem;
        self.stats.update_used_mem(used as i64 - counted as i64);
    }

    /// Probe the dict for the stashed fingerprint. Updates access
    /// accounting and applies the auto-extend policy on a usable entry.
    fn lookup(&self, key_bytes: &[u8], hash: u64, rule: &Rule, now: u64) -> Found {
        let mut core = self.core.lock();

        let id = match core.dict.get(&self.arena, key_bytes, hash) {
            Some(id) => id,
            None => return Found::Miss,
        };

        let entry = core.dict.entry_mut(id).unwrap();

        match entry.state {
            EntryState::Creating => return Found::Creating,
            EntryState::Invalid | EntryState::Expired => return Found::Miss,
            EntryState::Valid => {}
        }

        if entry.expired(now) {
            let extended = match (&rule.extend, rule.ttl) {
                (Some(policy), ttl) if ttl > 0 => {
                    policy.in_grace(ttl, entry.expire, now) && policy.qualifies(&entry.access)
                }
                _ => false,
            };

            if extended {
                entry.expire += rule.ttl as u64;
                entry.access = [0; 4];
                log::debug!("[{}] ttl extended for hash {:x}", self.conf.name, hash);
            } else {
                entry.state = EntryState::Expired;
                return Found::Miss;
            }
        }

        entry.atime = now;

        if let (Some(policy), true) = (&rule.extend, rule.ttl > 0) {
            let stage = policy.stage(rule.ttl, entry.expire, now);
            entry.access[stage] += 1;
        }

        let etag = entry.etag.clone();
        let last_modified = entry.last_modified.clone();
        let data_id = entry.data;
        let file = entry.file.clone();

        match (data_id, file) {
            (Some(data), _) => {
                let info = core
                    .data
                    .get(data)
                    .map(|d| d.info.clone())
                    .unwrap_or_default();
                Found::Memory { data, info, etag, last_modified }
            }
            (None, Some(file)) => Found::Disk(file),
            (None, None) => Found::Miss,
        }
    }

    /// Request phase. Runs the rule loop: build key, stash, look up, and
    /// fall back to the acceptance predicate on a miss.
    pub fn check_request(&self, ctx: &mut CacheCtx, req: &dyn RequestView) -> CheckOutcome {

        if ctx.state != CtxState::Init {
            return CheckOutcome::Bypass;
        }

        if req.method() != Method::GET {
            ctx.state = CtxState::Bypass;
            return CheckOutcome::Bypass;
        }

        let now = tools::now();
        let pre = PrebuiltReq::snapshot(req);
        ctx.pre = Some(pre.clone());

        for rule in &self.rules {
            log::debug!("[{}] checking rule {}", self.conf.name, rule.name);

            if !rule.enabled() {
                continue;
            }

            let key = build_key(&rule.key, &pre, req);
            let hash = key.hash();
            let key_bytes = key.as_bytes().to_vec();

            ctx.stash_rule(rule.uuid, key, hash);

            match self.lookup(&key_bytes, hash, rule, now) {
                Found::Memory { data: data_id, info, etag, last_modified } => {
                    match evaluate_conditional(
                        req.headers(),
                        etag.as_deref(),
                        last_modified.as_deref(),
                    ) {
                        CondOutcome::NotModified => {
                            ctx.state = CtxState::Hit { data: data_id };
                            return CheckOutcome::NotModified { etag, last_modified };
                        }
                        CondOutcome::PreconditionFailed => {
                            ctx.state = CtxState::Hit { data: data_id };
                            return CheckOutcome::PreconditionFailed;
                        }
                        CondOutcome::Serve => {}
                    }

                    self.core.lock().data.attach(data_id);
                    ctx.attached = true;
                    ctx.state = CtxState::Hit { data: data_id };
                    log::debug!("[{}] hit memory for {}", self.conf.name, rule.name);

                    return CheckOutcome::Hit { data: data_id, info, etag, last_modified };
                }
                Found::Disk(path) => {
                    // meta is read outside every engine lock
                    let file = match persist::open_entry(&path) {
                        Ok(file) => file,
                        Err(err) => {
                            log::warn!("[{}] disk hit lost {:?}: {}", self.conf.name, path, err);
                            let mut core = self.core.lock();
                            if let Some(id) = core.dict.get(&self.arena, &key_bytes, hash) {
                                let Core { ref mut dict, ref mut data } = *core;
                                dict.invalidate(id, data);
                            }
                            ctx.state = CtxState::Bypass;
                            return CheckOutcome::Bypass;
                        }
                    };

                    let etag = file.meta.etag.clone();
                    let last_modified = file.meta.last_modified.clone();

                    match evaluate_conditional(
                        req.headers(),
                        etag.as_deref(),
                        last_modified.as_deref(),
                    ) {
                        CondOutcome::NotModified => {
                            ctx.state = CtxState::HitDisk { file: path };
                            return CheckOutcome::NotModified { etag, last_modified };
                        }
                        CondOutcome::PreconditionFailed => {
                            ctx.state = CtxState::HitDisk { file: path };
                            return CheckOutcome::PreconditionFailed;
                        }
                        CondOutcome::Serve => {}
                    }

                    log::debug!("[{}] hit disk for {}", self.conf.name, rule.name);
                    ctx.state = CtxState::HitDisk { file: path };

                    return CheckOutcome::HitDisk { file };
                }
                Found::Creating => {
                    // someone else is streaming this entry in; see the
                    // WAIT/BYPASS note on CtxState
                    ctx.state = CtxState::Bypass;
                    return CheckOutcome::Bypass;
                }
                Found::Miss => {
                    if rule.test(req, false) {
                        log::debug!("[{}] rule {} accepted", self.conf.name, rule.name);
                        ctx.state = CtxState::Pass;
                        ctx.rule = Some(rule.uuid);
                        return CheckOutcome::Pass;
                    }
                }
            }
        }

        ctx.state = CtxState::Bypass;
        CheckOutcome::Bypass
    }

    fn response_info(res: &dyn ResponseView) -> ResponseInfo {
        let header_bytes = |name: http::header::HeaderName| {
            res.headers().get(name).map(|v| v.as_bytes().to_vec())
        };

        let transfer_encoding = header_bytes(http::header::TRANSFER_ENCODING);
        let chunked = transfer_encoding
            .as_deref()
            .map(|te| te.windows(7).any(|w| w.eq_ignore_ascii_case(b"chunked")))
            .unwrap_or(false);

        ResponseInfo {
            status: res.status().as_u16(),
            content_type: header_bytes(http::header::CONTENT_TYPE),
            transfer_encoding,
            content_length: res
                .headers()
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
            chunked,
        }
    }

    fn serialized_header_len(res: &dyn ResponseView) -> u32 {
        let mut len = "HTTP/1.1 200 \r\n".len();
        for (name, value) in res.headers() {
            len += name.as_str().len() + 2 + value.len() + 2;
        }
        (len + 2) as u32
    }

    /// Response phase. Decides whether this response populates the cache
    /// and, if so, allocates the entry and its data chain.
    pub fn on_response(&self, ctx: &mut CacheCtx, req: &dyn RequestView, res: &dyn ResponseView) {

        if ctx.state == CtxState::Init {
            // the header phase was pure-request; re-evaluate with the
            // response-side flag
            for rule in &self.rules {
                if rule.enabled() && rule.test(req, true) {
                    ctx.state = CtxState::Pass;
                    ctx.rule = Some(rule.uuid);
                    break;
                }
            }
        }

        if ctx.state != CtxState::Pass {
            return;
        }

        let rule = match ctx.rule.and_then(|uuid| self.rule_by_uuid(uuid)) {
            Some(rule) => rule,
            None => {
                ctx.state = CtxState::Bypass;
                return;
            }
        };

        let status = res.status().as_u16();
        if !rule.code_ok(status) {
            log::debug!("[{}] status {} not cacheable for {}", self.conf.name, status, rule.name);
            ctx.state = CtxState::Bypass;
            return;
        }

        let stash = match ctx.stashed(rule.uuid) {
            Some(stash) => stash,
            None => {
                ctx.state = CtxState::Bypass;
                return;
            }
        };

        if self.stats.full() {
            log::debug!("[{}] full, not caching", self.conf.name);
            ctx.state = CtxState::Full;
            return;
        }

        let now = tools::now();

        let etag = if rule.etag {
            Some(
                res.headers()
                    .get(http::header::ETAG)
                    .map(|v| v.as_bytes().to_vec())
                    .unwrap_or_else(|| synthesize_etag(stash.hash, stash.key.len() as u64, now)),
            )
        } else {
            None
        };

        let last_modified = if rule.last_modified {
            Some(
                res.headers()
                    .get(http::header::LAST_MODIFIED)
                    .map(|v| v.as_bytes().to_vec())
                    .unwrap_or_else(|| http_date(now).into_bytes()),
            )
        } else {
            None
        };

        let info = Self::response_info(res);
        let header_len = Self::serialized_header_len(res);

        let mut core = self.core.lock();

        let entry_id = match core.dict.set(
            &self.arena,
            stash.key.as_bytes(),
            stash.hash,
            rule.uuid,
            ctx.pid,
            rule.ttl,
            now,
        ) {
            Some(id) => id,
            None => {
                drop(core);
                log::warn!("[{}] arena full while creating entry", self.conf.name);
                ctx.state = CtxState::Full;
                return;
            }
        };

        let data_id = core.data.insert(info);

        {
            let entry = core.dict.entry_mut(entry_id).unwrap();
            entry.data = Some(data_id);
            entry.header_len = header_len;
            entry.etag = etag.clone();
            entry.last_modified = last_modified.clone();
            entry.host = ctx
                .pre
                .as_ref()
                .and_then(|pre| pre.host.as_ref())
                .map(|host| host.as_bytes().to_vec());
            entry.path = ctx.pre.as_ref().map(|pre| pre.path.as_bytes().to_vec());
        }

        drop(core);
        self.sync_used_mem();

        ctx.key = Some(stash.key);
        ctx.hash = stash.hash;
        ctx.etag = etag;
        ctx.last_modified = last_modified;
        ctx.header_len = header_len;
        ctx.state = CtxState::Create {
            entry: entry_id,
            data: Some(data_id),
        };

        log::debug!("[{}] creating entry for {}", self.conf.name, rule.name);
    }

    /// Mirror one forwarded payload chunk into the data chain.
    pub fn append(&self, ctx: &mut CacheCtx, bytes: &[u8]) {

        let (entry_id, data_id) = match ctx.state {
            CtxState::Create { entry, data: Some(data) } => (entry, data),
            _ => return,
        };

        if bytes.is_empty() {
            return;
        }

        let result = {
            let mut core = self.core.lock();
            core.data.append(&self.arena, data_id, bytes)
        };

        match result {
            Ok(()) => {
                ctx.cache_len += bytes.len() as u64;
                self.sync_used_mem();
            }
            Err(err) => {
                log::warn!("[{}] append failed: {}", self.conf.name, err);
                self.fail_create(entry_id, data_id);
                ctx.aborted = true;
                ctx.state = CtxState::Bypass;
            }
        }
    }

    fn fail_create(&self, entry_id: u32, data_id: DataId) {
        let mut core = self.core.lock();
        let Core { ref mut dict, ref mut data } = *core;

        if let Some(entry) = dict.entry_mut(entry_id) {
            entry.state = EntryState::Invalid;
            entry.data = None;
        }

        data.invalidate(data_id);
    }

    /// The upstream message ended; publish the entry.
    pub fn on_response_end(&self, ctx: &mut CacheCtx) {

        let (entry_id, data_id) = match ctx.state {
            CtxState::Create { entry, data: Some(data) } => (entry, data),
            _ => return,
        };

        let rule_disk = ctx
            .rule
            .and_then(|uuid| self.rule_by_uuid(uuid))
            .map(|rule| rule.disk)
            .unwrap_or(DiskMode::Off);

        {
            let mut core = self.core.lock();

            if let Some(data) = core.data.get_mut(data_id) {
                if data.info.content_length.is_none() {
                    data.info.content_length = Some(ctx.cache_len);
                }
            }

            // publication: readers that observe VALID also observe the
            // chain appended above, both under this lock
            if let Some(entry) = core.dict.entry_mut(entry_id) {
                entry.state = EntryState::Valid;
            }
        }

        ctx.state = CtxState::Done;

        match rule_disk {
            DiskMode::Sync | DiskMode::Only => {
                if let Err(err) = self.flush_entry(entry_id, data_id, rule_disk == DiskMode::Only) {
                    log::warn!("[{}] sync persist failed: {}", self.conf.name, err);
                }
            }
            DiskMode::Async | DiskMode::Off => {}
        }
    }

    /// Serialize one entry to its persistence file. With `drop_data` the
    /// memory copy is released afterwards and only the file pointer stays.
    fn flush_entry(&self, entry_id: u32, data_id: DataId, drop_data: bool) -> Result<(), Error> {

        let root = match &self.disk {
            Some(disk) => disk.lock().root.clone(),
            None => bail!("no persistence root configured"),
        };

        // copy meta and body out under the lock, write outside it
        let (meta, body) = {
            let core = self.core.lock();

            let entry = match core.dict.entry(entry_id) {
                Some(entry) if entry.state == EntryState::Valid => entry,
                _ => bail!("entry vanished before persist"),
            };

            let data = match core.data.get(data_id) {
                Some(data) => data,
                None => bail!("data vanished before persist"),
            };

            let mut body = Vec::new();
            for element in &data.elements {
                body.extend_from_slice(self.arena.bytes(element.chunk, element.len as usize));
            }

            let meta = PersistMeta {
                hash: entry.hash,
                expire: entry.expire,
                header_len: entry.header_len,
                etag: entry.etag.clone(),
                last_modified: entry.last_modified.clone(),
                host: entry.host.clone(),
                path: entry.path.clone(),
                key: entry.key_bytes(&self.arena).to_vec(),
                info: data.info.clone(),
            };

            (meta, body)
        };

        let path = persist::write_entry(&root, &meta, &body)?;

        let mut core = self.core.lock();
        let Core { ref mut dict, ref mut data } = *core;

        if let Some(entry) = dict.entry_mut(entry_id) {
            entry.file = Some(path);

            if drop_data {
                entry.data = None;
                data.invalidate(data_id);
                data.release(&self.arena, data_id);
            }
        }

        drop(core);
        self.sync_used_mem();

        Ok(())
    }

    /// The upstream failed mid-stream; invalidate the half-built entry.
    /// Attached readers drain the chain written so far, then see EOF.
    pub fn abort(&self, ctx: &mut CacheCtx) {
        if let CtxState::Create { entry, data: Some(data) } = ctx.state {
            self.fail_create(entry, data);
            ctx.aborted = true;
            ctx.state = CtxState::Invalid;
        }
    }

    /// Copy one element of a cached body. `None` past the end.
    pub fn read_element(&self, data_id: DataId, idx: usize) -> Option<Bytes> {
        let core = self.core.lock();
        core.data
            .element_bytes(&self.arena, data_id, idx)
            .map(Bytes::from)
    }

    /// Release the context: final stats accounting, reader detach, abort of
    /// an unfinished create. The stash drops with the context.
    pub fn detach(&self, ctx: &mut CacheCtx) {

        let outcome = if ctx.aborted {
            ReqOutcome::Abort
        } else {
            match &ctx.state {
                CtxState::Hit { .. } | CtxState::HitDisk { .. } => ReqOutcome::Hit,
                CtxState::Done => ReqOutcome::Fetch,
                CtxState::Create { .. } => ReqOutcome::Abort,
                _ => ReqOutcome::Other,
            }
        };

        self.stats.update_req(outcome);

        match ctx.state.clone() {
            CtxState::Hit { data } => {
                if ctx.attached {
                    self.core.lock().data.detach(data);
                    ctx.attached = false;
                }
            }
            CtxState::Create { entry, data: Some(data) } => {
                // client went away mid-create
                self.fail_create(entry, data);
            }
            _ => {}
        }

        ctx.stash.clear();
    }

    /// Delete the entry matching this request, if any. The key is built
    /// with each enabled rule in declared order; first match wins.
    pub fn purge(&self, req: &dyn RequestView) -> bool {
        let now = tools::now();
        let pre = PrebuiltReq::snapshot(req);

        for rule in &self.rules {
            if !rule.enabled() {
                continue;
            }

            let key = build_key(&rule.key, &pre, req);
            let hash = key.hash();

            let file = {
                let mut core = self.core.lock();
                let Core { ref mut dict, ref mut data } = *core;

                let id = match dict.get(&self.arena, key.as_bytes(), hash) {
                    Some(id) => id,
                    None => continue,
                };

                let usable = dict
                    .entry(id)
                    .map(|entry| entry.usable(now))
                    .unwrap_or(false);

                if !usable {
                    continue;
                }

                let file = dict.entry(id).and_then(|entry| entry.file.clone());
                dict.invalidate(id, data);
                file
            };

            if let Some(path) = file {
                if let Err(err) = std::fs::remove_file(&path) {
                    log::warn!("[{}] purge unlink {:?}: {}", self.conf.name, path, err);
                }
            }

            log::debug!("[{}] purged hash {:x}", self.conf.name, hash);
            return true;
        }

        false
    }

    /// Delete an exact key. Used by the nosql DELETE verb.
    pub fn purge_key(&self, key_bytes: &[u8], hash: u64) -> bool {
        let now = tools::now();

        let file = {
            let mut core = self.core.lock();
            let Core { ref mut dict, ref mut data } = *core;

            let id = match dict.get(&self.arena, key_bytes, hash) {
                Some(id) => id,
                None => return false,
            };

            let usable = dict
                .entry(id)
                .map(|entry| entry.usable(now))
                .unwrap_or(false);

            if !usable {
                return false;
            }

            let file = dict.entry(id).and_then(|entry| entry.file.clone());
            dict.invalidate(id, data);
            file
        };

        if let Some(path) = file {
            let _ = std::fs::remove_file(path);
        }

        true
    }

    /// Invalidate every usable entry the predicate selects. Returns the
    /// number of entries dropped.
    pub fn purge_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(Option<&[u8]>, Option<&[u8]>) -> bool,
    {
        let now = tools::now();
        let mut purged = 0;
        let mut files = Vec::new();

        {
            let mut core = self.core.lock();
            let Core { ref mut dict, ref mut data } = *core;

            for id in 0..dict.slot_count() as u32 {
                let selected = match dict.entry(id) {
                    Some(entry) if entry.usable(now) => {
                        predicate(entry.host.as_deref(), entry.path.as_deref())
                    }
                    _ => false,
                };

                if selected {
                    if let Some(path) = dict.entry(id).and_then(|e| e.file.clone()) {
                        files.push(path);
                    }
                    dict.invalidate(id, data);
                    purged += 1;
                }
            }
        }

        for path in files {
            let _ = std::fs::remove_file(path);
        }

        purged
    }

    /// Store the request body under the fingerprint of the first accepting
    /// rule. Serves the nosql POST/PUT verbs; an existing entry is
    /// replaced.
    pub fn nosql_set(&self, ctx: &mut CacheCtx, req: &dyn RequestView) -> NosqlSetOutcome {

        let now = tools::now();
        let pre = PrebuiltReq::snapshot(req);
        ctx.pre = Some(pre.clone());

        let rule = match self
            .rules
            .iter()
            .find(|rule| rule.enabled() && rule.test(req, false))
        {
            Some(rule) => rule,
            None => {
                ctx.state = CtxState::Bypass;
                return NosqlSetOutcome::NotAllowed;
            }
        };

        let key = build_key(&rule.key, &pre, req);
        let hash = key.hash();

        self.purge_key(key.as_bytes(), hash);

        if self.stats.full() {
            ctx.state = CtxState::Full;
            return NosqlSetOutcome::Full;
        }

        let body = req.body().cloned().unwrap_or_default();

        let info = ResponseInfo {
            status: 200,
            content_type: req
                .headers()
                .get(http::header::CONTENT_TYPE)
                .map(|v| v.as_bytes().to_vec()),
            transfer_encoding: None,
            content_length: Some(body.len() as u64),
            chunked: false,
        };

        let (entry_id, data_id) = {
            let mut core = self.core.lock();

            let entry_id = match core.dict.set(
                &self.arena,
                key.as_bytes(),
                hash,
                rule.uuid,
                ctx.pid,
                rule.ttl,
                now,
            ) {
                Some(id) => id,
                None => {
                    ctx.state = CtxState::Full;
                    return NosqlSetOutcome::Full;
                }
            };

            let data_id = core.data.insert(info);

            {
                let entry = core.dict.entry_mut(entry_id).unwrap();
                entry.data = Some(data_id);
                entry.host = pre.host.as_ref().map(|host| host.as_bytes().to_vec());
                entry.path = Some(pre.path.as_bytes().to_vec());
            }

            if let Err(err) = core.data.append(&self.arena, data_id, &body) {
                log::warn!("[{}] nosql set failed: {}", self.conf.name, err);
                let Core { ref mut dict, ref mut data } = *core;
                dict.invalidate(entry_id, data);
                ctx.state = CtxState::Full;
                return NosqlSetOutcome::Full;
            }

            core.dict.entry_mut(entry_id).unwrap().state = EntryState::Valid;

            (entry_id, data_id)
        };

        self.sync_used_mem();
        ctx.cache_len = body.len() as u64;
        ctx.state = CtxState::Done;

        match rule.disk {
            DiskMode::Sync | DiskMode::Only => {
                if let Err(err) = self.flush_entry(entry_id, data_id, rule.disk == DiskMode::Only) {
                    log::warn!("[{}] nosql persist failed: {}", self.conf.name, err);
                }
            }
            DiskMode::Async | DiskMode::Off => {}
        }

        NosqlSetOutcome::Created
    }

    /// The nosql DELETE verb.
    pub fn nosql_delete(&self, req: &dyn RequestView) -> bool {
        self.purge(req)
    }

    /// One housekeeping tick: bounded units of rehash, dict cleanup, data
    /// cleanup, disk load, disk save and disk cleanup.
    pub fn housekeeping(&self) {
        let now = tools::now();

        {
            let mut core = self.core.lock();
            let Core { ref mut dict, ref mut data } = *core;

            dict.rehash(self.conf.dict_cleaner);
            dict.cleanup(&self.arena, data, self.conf.dict_cleaner, now);
            data.cleanup(&self.arena, self.conf.data_cleaner);
        }

        self.sync_used_mem();

        if self.disk.is_some() {
            self.disk_load_tick(now);
            self.disk_save_tick();
            self.disk_clean_tick(now);
        }
    }

    fn disk_load_tick(&self, now: u64) {
        let disk = self.disk.as_ref().unwrap();

        let files = {
            let mut disk = disk.lock();
            if disk.loader_done {
                return;
            }

            let files = disk.loader.tick(self.conf.disk_loader);
            if disk.loader.finished {
                disk.loader_done = true;
                log::info!("[{}] disk load complete", self.conf.name);
            }
            files
        };

        for file in files {
            if file.meta.expire != 0 && file.meta.expire <= now {
                continue;
            }

            let mut core = self.core.lock();

            if core.dict.get(&self.arena, &file.meta.key, file.meta.hash).is_some() {
                continue;
            }

            let inserted = core.dict.set_from_disk(
                &self.arena,
                &file.meta.key,
                file.meta.hash,
                file.path.clone(),
                file.meta.expire,
                file.meta.header_len,
                file.meta.host.clone(),
                file.meta.path.clone(),
                file.meta.etag.clone(),
                file.meta.last_modified.clone(),
                now,
            );

            if inserted.is_none() {
                log::warn!("[{}] arena full while loading {:?}", self.conf.name, file.path);
            }
        }

        self.sync_used_mem();
    }

    fn disk_save_tick(&self) {
        let quota = self.conf.disk_saver;

        // pick candidates under the lock, write outside it
        let candidates = {
            let core = self.core.lock();
            let slots = core.dict.slot_count();
            if slots == 0 {
                return;
            }

            let mut idx = self.persist_idx.lock();
            let mut picked = Vec::new();

            for _ in 0..slots {
                if picked.len() >= quota {
                    break;
                }

                let id = (*idx % slots) as u32;
                *idx = (*idx + 1) % slots;

                let entry = match core.dict.entry(id) {
                    Some(entry) => entry,
                    None => continue,
                };

                let rule_async = self
                    .rule_by_uuid(entry.rule)
                    .map(|rule| rule.disk == DiskMode::Async)
                    .unwrap_or(false);

                if entry.state == EntryState::Valid
                    && entry.file.is_none()
                    && !entry.persist_failed
                    && entry.data.is_some()
                    && rule_async
                {
                    picked.push(id);
                }
            }

            picked
        };

        for id in candidates {
            let data_id = {
                let core = self.core.lock();
                match core.dict.entry(id).and_then(|entry| entry.data) {
                    Some(data_id) => data_id,
                    None => continue,
                }
            };

            if let Err(err) = self.flush_entry(id, data_id, false) {
                let mut core = self.core.lock();
                if let Some(entry) = core.dict.entry_mut(id) {
                    entry.persist_retries += 1;
                    if entry.persist_retries >= PERSIST_MAX_RETRIES {
                        entry.persist_failed = true;
                        log::warn!(
                            "[{}] abandoning persist for hash {:x} after {} attempts: {}",
                            self.conf.name, entry.hash, entry.persist_retries, err
                        );
                    }
                }
            }
        }
    }

    fn disk_clean_tick(&self, now: u64) {
        let disk = self.disk.as_ref().unwrap();

        let files = {
            let mut disk = disk.lock();

            // the loader shares the directory; never race the initial sweep
            if !disk.loader_done {
                return;
            }

            if disk.cleaner.finished {
                disk.cleaner.rewind();
            }

            disk.cleaner.tick(self.conf.disk_cleaner)
        };

        for file in files {
            let stale = if file.meta.expire != 0 && file.meta.expire <= now {
                true
            } else {
                let core = self.core.lock();
                match core.dict.get(&self.arena, &file.meta.key, file.meta.hash) {
                    Some(id) => {
                        let entry = core.dict.entry(id).unwrap();
                        !entry.usable(now) || entry.file.as_deref() != Some(file.path.as_path())
                    }
                    None => true,
                }
            };

            if stale {
                log::debug!("[{}] disk cleaner unlinking {:?}", self.conf.name, file.path);
                let _ = std::fs::remove_file(&file.path);
            }
        }
    }

    /// True once the startup load sweep completed (or no disk is
    /// configured).
    pub fn loaded(&self) -> bool {
        match &self.disk {
            Some(disk) => disk.lock().loader_done,
            None => true,
        }
    }

    /// Plain-text stats section for this engine.
    pub fn render_stats(&self, out: &mut String) {
        use std::fmt::Write;

        let counters = self.stats.snapshot();
        let (used, dict_used) = {
            let core = self.core.lock();
            (self.arena.used(), core.dict.used())
        };

        let name = &self.conf.name;
        let _ = writeln!(out, "**{}**", name.to_uppercase());
        let _ = writeln!(out, "{}.data.size: {}", name, self.conf.data_size);
        let _ = writeln!(out, "{}.data.used: {}", name, used);
        let _ = writeln!(out, "{}.dict.size: {}", name, self.conf.dict_size);
        let _ = writeln!(out, "{}.dict.used: {}", name, dict_used);
        let _ = writeln!(out, "{}.persistence: {}",
            name,
            self.conf
                .dir
                .as_ref()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|| "off".to_string()),
        );
        let _ = writeln!(out, "{}.purge_method: {}", name, self.conf.purge_method);
        let _ = writeln!(out, "{}.req.total: {}", name, counters.req_total);
        let _ = writeln!(out, "{}.req.hit: {}", name, counters.req_hit);
        let _ = writeln!(out, "{}.req.fetch: {}", name, counters.req_fetch);
        let _ = writeln!(out, "{}.req.abort: {}", name, counters.req_abort);

        for rule in &self.rules {
            let _ = writeln!(
                out,
                "{}.rule.{}: ttl={} disk={} etag={} last-modified={} state={}",
                name,
                rule.name,
                rule.ttl,
                rule.disk.as_str(),
                if rule.etag { "on" } else { "off" },
                if rule.last_modified { "on" } else { "off" },
                if rule.enabled() { "enabled" } else { "disabled" },
            );
        }
    }

    /// The same stats section as JSON, for `?format=json` on the stats URI.
    pub fn render_stats_json(&self) -> serde_json::Value {
        let dict_used = self.core.lock().dict.used();

        serde_json::json!({
            "name": self.conf.name,
            "data": { "size": self.conf.data_size, "used": self.arena.used() },
            "dict": { "size": self.conf.dict_size, "used": dict_used },
            "persistence": self.conf.dir.as_ref().map(|dir| dir.display().to_string()),
            "purge_method": self.conf.purge_method,
            "req": self.stats.render_json(),
            "rules": self.rules.iter().map(|rule| serde_json::json!({
                "name": rule.name,
                "ttl": rule.ttl,
                "disk": rule.disk.as_str(),
                "etag": rule.etag,
                "last_modified": rule.last_modified,
                "enabled": rule.enabled(),
            })).collect::<Vec<_>>(),
        })
    }
}
