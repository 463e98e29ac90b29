//! End-to-end engine scenarios, driven through the same call sequence the
//! proxy filter uses: check the request, replay an upstream response on a
//! miss, then read back.

use bytes::Bytes;

use larder::http::{ProxyRequest, Scheme};
use larder::persist;
use larder::rule::{parse_extend, parse_key_format, Rule};
use larder::{CacheCtx, CheckOutcome, Engine, EngineConfig, Mode};

fn request(method: &str, uri: &str, host: &str, extra: &[(&str, &str)]) -> ProxyRequest {
    let mut builder = http::Request::builder()
        .method(method)
        .uri(uri)
        .header("host", host);
    for (name, value) in extra {
        builder = builder.header(*name, *value);
    }
    let (parts, _) = builder.body(()).unwrap().into_parts();
    ProxyRequest::new(parts, Scheme::Http, None)
}

fn get(uri: &str, host: &str) -> ProxyRequest {
    request("GET", uri, host, &[])
}

fn rule(name: &str, key: &str, ttl: u32) -> Rule {
    let mut rule = Rule::new(1, 1, name);
    rule.key = parse_key_format(key).unwrap();
    rule.ttl = ttl;
    rule
}

fn engine_with(rules: Vec<Rule>) -> Engine {
    let conf = EngineConfig::new(Mode::Cache, "cache");
    Engine::new(conf, rules).unwrap()
}

fn upstream(status: u16, headers: &[(&str, &str)]) -> http::response::Parts {
    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let (parts, _) = builder.body(()).unwrap().into_parts();
    parts
}

#[derive(Debug, PartialEq)]
enum Served {
    Hit(Vec<u8>),
    DiskHit(Vec<u8>),
    Fetched,
    Bypassed,
    NotModified(Option<Vec<u8>>),
    PreconditionFailed,
}

/// One full request/response cycle against the engine. `origin` plays the
/// upstream; it is only consulted on a miss.
fn roundtrip(engine: &Engine, req: &ProxyRequest, origin: Option<(u16, &[(&str, &str)], &[u8])>) -> Served {
    let mut ctx = CacheCtx::new(1);

    let served = match engine.check_request(&mut ctx, req) {
        CheckOutcome::Hit { data, .. } => {
            let mut body = Vec::new();
            let mut idx = 0;
            while let Some(chunk) = engine.read_element(data, idx) {
                body.extend_from_slice(&chunk);
                idx += 1;
            }
            Served::Hit(body)
        }
        CheckOutcome::HitDisk { file } => {
            Served::DiskHit(persist::read_body(&file.path).unwrap())
        }
        CheckOutcome::NotModified { etag, .. } => Served::NotModified(etag),
        CheckOutcome::PreconditionFailed => Served::PreconditionFailed,
        CheckOutcome::Pass => {
            let (status, headers, body) = origin.expect("unexpected upstream fetch");
            let parts = upstream(status, headers);

            engine.on_response(&mut ctx, req, &parts);
            engine.append(&mut ctx, body);
            engine.on_response_end(&mut ctx);
            Served::Fetched
        }
        CheckOutcome::Bypass => Served::Bypassed,
    };

    engine.detach(&mut ctx);
    served
}

#[test]
fn s1_cache_hit() {
    let engine = engine_with(vec![rule("r1", "method.host.uri", 10)]);
    let req = get("/a", "x");

    assert_eq!(roundtrip(&engine, &req, Some((200, &[], b"hi"))), Served::Fetched);

    // second request never consults the upstream
    assert_eq!(roundtrip(&engine, &req, None), Served::Hit(b"hi".to_vec()));

    let counters = engine.stats().snapshot();
    assert_eq!(counters.req_hit, 1);
    assert_eq!(counters.req_fetch, 1);
}

#[test]
fn s2_key_variance() {
    let engine = engine_with(vec![rule("r1", "method.host.uri", 10)]);

    let one = get("/a?x=1", "x");
    let two = get("/a?x=2", "x");

    roundtrip(&engine, &one, Some((200, &[], b"one")));
    roundtrip(&engine, &two, Some((200, &[], b"two")));

    assert_eq!(roundtrip(&engine, &one, None), Served::Hit(b"one".to_vec()));
    assert_eq!(roundtrip(&engine, &two, None), Served::Hit(b"two".to_vec()));
}

#[test]
fn s3_expiration() {
    // small dict so a few cleanup ticks sweep every bucket
    let mut conf = EngineConfig::new(Mode::Cache, "cache");
    conf.dict_size = 1024;
    let engine = Engine::new(conf, vec![rule("r1", "method.host.uri", 1)]).unwrap();

    let req = get("/a", "x");

    roundtrip(&engine, &req, Some((200, &[], b"v")));
    assert_eq!(roundtrip(&engine, &req, None), Served::Hit(b"v".to_vec()));

    std::thread::sleep(std::time::Duration::from_millis(1100));

    // expired now; the engine asks the upstream again
    assert_eq!(roundtrip(&engine, &req, Some((200, &[], b"v2"))), Served::Fetched);

    for _ in 0..3 {
        engine.housekeeping();
    }

    let stats = {
        let mut out = String::new();
        engine.render_stats(&mut out);
        out
    };
    assert!(stats.contains("cache.dict.used: 1"), "stale entry not cleaned:\n{}", stats);
}

#[test]
fn s4_purge() {
    // key without the method component, so the PURGE verb builds the same
    // fingerprint as the GET
    let engine = engine_with(vec![rule("r1", "host.uri", 10)]);
    let req = get("/a", "x");

    roundtrip(&engine, &req, Some((200, &[], b"hi")));
    assert_eq!(roundtrip(&engine, &req, None), Served::Hit(b"hi".to_vec()));

    let purge_req = request("PURGE", "/a", "x", &[]);
    assert!(engine.purge(&purge_req));

    // idempotent: repeating has the same effect as one
    assert!(!engine.purge(&purge_req));
    assert!(!engine.purge(&purge_req));

    // next read misses and refetches
    assert_eq!(roundtrip(&engine, &req, Some((200, &[], b"fresh"))), Served::Fetched);
    assert_eq!(roundtrip(&engine, &req, None), Served::Hit(b"fresh".to_vec()));
}

#[test]
fn s5_disk_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    let build = || {
        let mut conf = EngineConfig::new(Mode::Cache, "cache");
        conf.dir = Some(dir.path().to_path_buf());

        let mut r = rule("r1", "host.uri", 0);
        r.disk = larder::rule::DiskMode::Sync;
        Engine::new(conf, vec![r]).unwrap()
    };

    let req = get("/k", "x");

    {
        let engine = build();
        roundtrip(&engine, &req, Some((200, &[("content-type", "text/plain")], b"v")));
        assert_eq!(roundtrip(&engine, &req, None), Served::Hit(b"v".to_vec()));
        // engine dropped here: simulates the process dying
    }

    let engine = build();
    while !engine.loaded() {
        engine.housekeeping();
    }

    assert_eq!(roundtrip(&engine, &req, None), Served::DiskHit(b"v".to_vec()));
}

#[test]
fn s6_conditional() {
    let mut r = rule("r1", "host.uri", 10);
    r.etag = true;
    let engine = engine_with(vec![r]);

    let req = get("/a", "x");
    roundtrip(&engine, &req, Some((200, &[("etag", "\"tag-1\"")], b"body")));

    let etag = match roundtrip(&engine, &req, None) {
        Served::Hit(body) => {
            assert_eq!(body, b"body");
            b"\"tag-1\"".to_vec()
        }
        other => panic!("expected hit, got {:?}", other),
    };

    let conditional = request(
        "GET",
        "/a",
        "x",
        &[("if-none-match", std::str::from_utf8(&etag).unwrap())],
    );

    match roundtrip(&engine, &conditional, None) {
        Served::NotModified(Some(tag)) => assert_eq!(tag, etag),
        other => panic!("expected 304, got {:?}", other),
    }
}

#[test]
fn ttl_zero_persists_until_purge() {
    let engine = engine_with(vec![rule("r1", "host.uri", 0)]);
    let req = get("/pinned", "x");

    roundtrip(&engine, &req, Some((200, &[], b"pinned")));

    for i in 0..50 {
        let other = get(&format!("/other/{}", i), "x");
        roundtrip(&engine, &other, Some((200, &[], b"noise")));
        engine.housekeeping();

        assert_eq!(
            roundtrip(&engine, &req, None),
            Served::Hit(b"pinned".to_vec()),
            "lost after {} interleaved writes",
            i
        );
    }

    assert!(engine.purge(&request("PURGE", "/pinned", "x", &[])));
    assert_eq!(
        roundtrip(&engine, &req, Some((200, &[], b"again"))),
        Served::Fetched
    );
}

#[test]
fn concurrent_miss_single_create() {
    let engine = engine_with(vec![rule("r1", "host.uri", 10)]);
    let req = get("/a", "x");

    // first miss starts creating
    let mut first = CacheCtx::new(1);
    assert!(matches!(
        engine.check_request(&mut first, &req),
        CheckOutcome::Pass
    ));
    let parts = upstream(200, &[]);
    engine.on_response(&mut first, &req, &parts);
    engine.append(&mut first, b"racing");

    // a second miss for the same fingerprint sees CREATING and bypasses
    let mut second = CacheCtx::new(1);
    assert!(matches!(
        engine.check_request(&mut second, &req),
        CheckOutcome::Bypass
    ));
    engine.detach(&mut second);

    engine.on_response_end(&mut first);
    engine.detach(&mut first);

    // exactly one valid entry resulted
    assert_eq!(roundtrip(&engine, &req, None), Served::Hit(b"racing".to_vec()));
}

#[test]
fn upstream_failure_invalidates_entry() {
    let engine = engine_with(vec![rule("r1", "host.uri", 10)]);
    let req = get("/flaky", "x");

    let mut ctx = CacheCtx::new(1);
    assert!(matches!(engine.check_request(&mut ctx, &req), CheckOutcome::Pass));
    let parts = upstream(200, &[]);
    engine.on_response(&mut ctx, &req, &parts);
    engine.append(&mut ctx, b"half");
    engine.abort(&mut ctx);
    engine.detach(&mut ctx);

    // the aborted body never surfaces
    assert_eq!(
        roundtrip(&engine, &req, Some((200, &[], b"whole"))),
        Served::Fetched
    );
    assert_eq!(roundtrip(&engine, &req, None), Served::Hit(b"whole".to_vec()));
}

#[test]
fn status_allowlist_gates_create() {
    let mut r = rule("r1", "host.uri", 10);
    r.codes = vec![200];
    let engine = engine_with(vec![r]);

    let req = get("/e", "x");

    let mut ctx = CacheCtx::new(1);
    assert!(matches!(engine.check_request(&mut ctx, &req), CheckOutcome::Pass));
    let parts = upstream(500, &[]);
    engine.on_response(&mut ctx, &req, &parts);
    engine.append(&mut ctx, b"oops");
    engine.on_response_end(&mut ctx);
    engine.detach(&mut ctx);

    // the 500 was not cached
    assert_eq!(
        roundtrip(&engine, &req, Some((200, &[], b"good"))),
        Served::Fetched
    );
}

#[test]
fn async_saver_flushes_to_disk() {
    let dir = tempfile::tempdir().unwrap();

    let mut conf = EngineConfig::new(Mode::Cache, "cache");
    conf.dir = Some(dir.path().to_path_buf());

    let mut r = rule("r1", "host.uri", 0);
    r.disk = larder::rule::DiskMode::Async;
    let engine = Engine::new(conf, vec![r]).unwrap();

    let req = get("/lazy", "x");
    roundtrip(&engine, &req, Some((200, &[], b"deferred")));

    // ticks run the loader sweep first, then the saver
    for _ in 0..4 {
        engine.housekeeping();
    }

    let mut scan = persist::DiskScan::new(dir.path());
    let mut files = Vec::new();
    while !scan.finished {
        files.extend(scan.tick(16));
    }

    assert_eq!(files.len(), 1);
    assert_eq!(persist::read_body(&files[0].path).unwrap(), b"deferred");
}

#[test]
fn disk_only_drops_memory_copy() {
    let dir = tempfile::tempdir().unwrap();

    let mut conf = EngineConfig::new(Mode::Cache, "cache");
    conf.dir = Some(dir.path().to_path_buf());

    let mut r = rule("r1", "host.uri", 0);
    r.disk = larder::rule::DiskMode::Only;
    let engine = Engine::new(conf, vec![r]).unwrap();

    let req = get("/cold", "x");
    roundtrip(&engine, &req, Some((200, &[], b"cold body")));

    // served from the file, not from memory
    assert_eq!(roundtrip(&engine, &req, None), Served::DiskHit(b"cold body".to_vec()));
}

#[test]
fn nosql_set_get_delete() {
    let mut conf = EngineConfig::new(Mode::Nosql, "nosql");
    conf.data_size = 1024 * 1024;

    let r = rule("kv", "host.uri", 0);
    let engine = Engine::new(conf, vec![r]).unwrap();

    let put = {
        let (parts, _) = http::Request::builder()
            .method("PUT")
            .uri("/k1")
            .header("host", "kv")
            .header("content-type", "application/json")
            .body(())
            .unwrap()
            .into_parts();
        ProxyRequest::new(parts, Scheme::Http, Some(Bytes::from_static(b"{\"a\":1}")))
    };

    let mut ctx = CacheCtx::new(1);
    assert_eq!(
        engine.nosql_set(&mut ctx, &put),
        larder::NosqlSetOutcome::Created
    );
    engine.detach(&mut ctx);

    let read = get("/k1", "kv");
    match roundtrip(&engine, &read, None) {
        Served::Hit(body) => assert_eq!(body, b"{\"a\":1}"),
        other => panic!("expected hit, got {:?}", other),
    }

    assert!(engine.nosql_delete(&request("DELETE", "/k1", "kv", &[])));
    assert!(!engine.nosql_delete(&request("DELETE", "/k1", "kv", &[])));

    // the key is gone: the next lookup is a plain miss
    let mut ctx = CacheCtx::new(1);
    assert!(matches!(
        engine.check_request(&mut ctx, &read),
        CheckOutcome::Pass | CheckOutcome::Bypass
    ));
    engine.detach(&mut ctx);
}

#[test]
fn nosql_overwrite_replaces_value() {
    let conf = EngineConfig::new(Mode::Nosql, "nosql");
    let r = rule("kv", "host.uri", 0);
    let engine = Engine::new(conf, vec![r]).unwrap();

    let put = |value: &'static [u8]| {
        let (parts, _) = http::Request::builder()
            .method("PUT")
            .uri("/k")
            .header("host", "kv")
            .body(())
            .unwrap()
            .into_parts();
        ProxyRequest::new(parts, Scheme::Http, Some(Bytes::from_static(value)))
    };

    let mut ctx = CacheCtx::new(1);
    engine.nosql_set(&mut ctx, &put(b"first"));
    engine.detach(&mut ctx);

    let mut ctx = CacheCtx::new(1);
    engine.nosql_set(&mut ctx, &put(b"second"));
    engine.detach(&mut ctx);

    match roundtrip(&engine, &get("/k", "kv"), None) {
        Served::Hit(body) => assert_eq!(body, b"second"),
        other => panic!("expected hit, got {:?}", other),
    }

    // the replaced body is reclaimed by the cleaners
    engine.housekeeping();
}

#[test]
fn auto_extend_advances_expiry() {
    let mut r = rule("r1", "host.uri", 1);
    r.extend = parse_extend("on").unwrap();
    let engine = engine_with(vec![r]);

    let req = get("/hot", "x");
    roundtrip(&engine, &req, Some((200, &[], b"hot")));

    // keep the object hot across several ttl periods; reads in the late
    // sub-intervals and the grace window keep extending it
    for _ in 0..6 {
        std::thread::sleep(std::time::Duration::from_millis(450));
        match roundtrip(&engine, &req, None) {
            Served::Hit(_) => {}
            other => panic!("hot object expired: {:?}", other),
        }
    }
}

#[test]
fn arena_exhaustion_aborts_create() {
    let mut conf = EngineConfig::new(Mode::Cache, "cache");
    conf.data_size = 32 * 1024; // two arena blocks
    let engine = Engine::new(conf, vec![rule("r1", "host.uri", 0)]).unwrap();

    let req = get("/big", "x");

    let mut ctx = CacheCtx::new(1);
    assert!(matches!(engine.check_request(&mut ctx, &req), CheckOutcome::Pass));
    let parts = upstream(200, &[]);
    engine.on_response(&mut ctx, &req, &parts);

    // larger than the whole arena
    engine.append(&mut ctx, &vec![0u8; 64 * 1024]);
    assert_eq!(ctx.state, larder::CtxState::Bypass);

    engine.on_response_end(&mut ctx);
    engine.detach(&mut ctx);

    assert_eq!(engine.stats().snapshot().req_abort, 1);

    // the half-built entry never serves
    assert_eq!(roundtrip(&engine, &req, Some((200, &[], b"ok"))), Served::Fetched);
}

#[test]
fn non_get_methods_bypass() {
    let engine = engine_with(vec![rule("r1", "host.uri", 10)]);
    let post = request("POST", "/a", "x", &[]);

    assert_eq!(roundtrip(&engine, &post, None), Served::Bypassed);
}

#[test]
fn stats_render_as_json() {
    let engine = engine_with(vec![rule("r1", "host.uri", 10)]);
    let req = get("/a", "x");

    roundtrip(&engine, &req, Some((200, &[], b"hi")));
    roundtrip(&engine, &req, None);

    let value = engine.render_stats_json();
    assert_eq!(value["name"], "cache");
    assert_eq!(value["req"]["req_total"], 2);
    assert_eq!(value["req"]["req_hit"], 1);
    assert_eq!(value["req"]["req_fetch"], 1);
    assert_eq!(value["rules"][0]["name"], "r1");
    assert_eq!(value["rules"][0]["ttl"], 10);
    assert!(value["persistence"].is_null());
}
