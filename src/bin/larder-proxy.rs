//! Demonstration reverse proxy embedding the larder engine.
//!
//! Forwards everything to one upstream, with the cache filter attached to
//! every stream. The nosql engine, when configured instead, turns the
//! proxy into a REST key/value store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use bytes::Bytes;
use futures::stream::Stream;
use hyper::body::HttpBody;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, Server, StatusCode};

use larder::http::{ProxyRequest, Scheme};
use larder::{config, CacheCtx, CheckOutcome, Engine, Larder, NosqlSetOutcome};

const HOUSEKEEPING_PERIOD: Duration = Duration::from_millis(500);

struct Options {
    config: PathBuf,
    listen: SocketAddr,
    upstream: String,
}

fn parse_args() -> Result<Options, Error> {
    let mut config = PathBuf::from(larder::configdir!("/larder.conf"));
    let mut listen: SocketAddr = "127.0.0.1:8080".parse()?;
    let mut upstream = String::new();

    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        let mut value = || {
            args.next()
                .ok_or_else(|| format_err!("{} expects a value", arg))
        };

        match arg.as_str() {
            "-c" | "--config" => config = PathBuf::from(value()?),
            "-l" | "--listen" => listen = value()?.parse()?,
            "-u" | "--upstream" => upstream = value()?,
            "-h" | "--help" => {
                eprintln!("usage: larder-proxy -u <upstream-addr> [-c <config>] [-l <listen-addr>]");
                std::process::exit(0);
            }
            other => bail!("unknown argument '{}'", other),
        }
    }

    Ok(Options { config, listen, upstream })
}

fn no_acls(_name: &str) -> Option<Box<larder::rule::AclFn>> {
    None
}

fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn apply_validators(response: &mut Response<Body>, etag: Option<Vec<u8>>, last_modified: Option<Vec<u8>>) {
    if let Some(etag) = etag.and_then(|v| HeaderValue::from_bytes(&v).ok()) {
        response.headers_mut().insert(ETAG, etag);
    }
    if let Some(lm) = last_modified.and_then(|v| HeaderValue::from_bytes(&v).ok()) {
        response.headers_mut().insert(LAST_MODIFIED, lm);
    }
}

/// Resumable producer over a cached body. Yields one element per poll and
/// releases the reader refcount when dropped, so a client disconnect
/// cannot leak it.
struct HitStream {
    engine: Arc<Engine>,
    ctx: Option<CacheCtx>,
    data: larder::data::DataId,
    idx: usize,
}

impl Stream for HitStream {
    type Item = Result<Bytes, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.engine.read_element(this.data, this.idx) {
            Some(chunk) => {
                this.idx += 1;
                Poll::Ready(Some(Ok(chunk)))
            }
            None => Poll::Ready(None),
        }
    }
}

impl Drop for HitStream {
    fn drop(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            self.engine.detach(&mut ctx);
        }
    }
}

/// Stream a memory hit without buffering the whole body.
fn serve_hit(
    engine: Arc<Engine>,
    ctx: CacheCtx,
    data: larder::data::DataId,
    info: larder::data::ResponseInfo,
    etag: Option<Vec<u8>>,
    last_modified: Option<Vec<u8>>,
) -> Response<Body> {

    let body = Body::wrap_stream(HitStream {
        engine,
        ctx: Some(ctx),
        data,
        idx: 0,
    });

    let mut response = Response::new(body);
    *response.status_mut() =
        StatusCode::from_u16(info.status).unwrap_or(StatusCode::OK);

    if let Some(ct) = info.content_type.and_then(|v| HeaderValue::from_bytes(&v).ok()) {
        response.headers_mut().insert(CONTENT_TYPE, ct);
    }
    if let Some(len) = info.content_length {
        response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(len));
    }

    apply_validators(&mut response, etag, last_modified);
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static("HIT"));

    response
}

async fn serve_disk_hit(
    engine: Arc<Engine>,
    mut ctx: CacheCtx,
    file: larder::persist::EntryFile,
) -> Response<Body> {

    let path = file.path.clone();
    let body = tokio::task::spawn_blocking(move || larder::persist::read_body(&path)).await;

    let body = match body {
        Ok(Ok(body)) => body,
        _ => {
            engine.detach(&mut ctx);
            return text_response(StatusCode::BAD_GATEWAY, "cache file lost\n");
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() =
        StatusCode::from_u16(file.meta.info.status).unwrap_or(StatusCode::OK);

    if let Some(ct) = file.meta.info.content_type.clone().and_then(|v| HeaderValue::from_bytes(&v).ok()) {
        response.headers_mut().insert(CONTENT_TYPE, ct);
    }

    apply_validators(&mut response, file.meta.etag.clone(), file.meta.last_modified.clone());
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static("HIT"));

    engine.detach(&mut ctx);
    response
}

/// Forward upstream, mirroring payload chunks into the cache while the
/// context is in CREATE.
async fn forward(
    engine: Arc<Engine>,
    mut ctx: CacheCtx,
    preq: ProxyRequest,
    client: Client<hyper::client::HttpConnector>,
    upstream: String,
    request_body: Body,
) -> Result<Response<Body>, Error> {

    let path = preq
        .parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri: hyper::Uri = format!("http://{}{}", upstream, path).parse()?;

    let mut builder = Request::builder().method(preq.parts.method.clone()).uri(uri);
    for (name, value) in &preq.parts.headers {
        builder = builder.header(name, value);
    }

    let upstream_response = client.request(builder.body(request_body)?).await?;
    let (parts, mut upstream_body) = upstream_response.into_parts();

    engine.on_response(&mut ctx, &preq, &parts);

    let mut response = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        response = response.header(name, value);
    }
    let response = response.header("x-cache", "MISS");

    let (mut tx, body) = Body::channel();

    tokio::spawn(async move {
        let mut failed = false;

        loop {
            match upstream_body.data().await {
                Some(Ok(chunk)) => {
                    engine.append(&mut ctx, &chunk);
                    if tx.send_data(chunk).await.is_err() {
                        // client disconnect mid-stream
                        failed = true;
                        break;
                    }
                }
                Some(Err(err)) => {
                    log::warn!("upstream stream error: {}", err);
                    engine.abort(&mut ctx);
                    failed = true;
                    break;
                }
                None => break,
            }
        }

        if !failed {
            engine.on_response_end(&mut ctx);
        }

        engine.detach(&mut ctx);
    });

    Ok(response.body(body)?)
}

async fn handle_cache(
    engine: Arc<Engine>,
    client: Client<hyper::client::HttpConnector>,
    upstream: String,
    req: Request<Body>,
) -> Result<Response<Body>, Error> {

    if req.method().as_str() == engine.conf().purge_method {
        let (parts, _) = req.into_parts();
        let preq = ProxyRequest::new(parts, Scheme::Http, None);

        return Ok(if engine.purge(&preq) {
            text_response(StatusCode::OK, "purged\n")
        } else {
            text_response(StatusCode::NOT_FOUND, "not found\n")
        });
    }

    if req.method() == Method::GET {
        if let Some(uri) = &engine.conf().uri {
            if req.uri().path() == uri.as_str() {
                let json = req
                    .uri()
                    .query()
                    .map(|query| query.split('&').any(|pair| pair == "format=json"))
                    .unwrap_or(false);

                let (body, content_type) = match larder::global() {
                    Some(larder) if json => {
                        (larder.render_stats_json().to_string(), "application/json")
                    }
                    Some(larder) => (larder.render_stats(), "text/plain"),
                    None => (String::new(), "text/plain"),
                };

                let mut response = Response::new(Body::from(body));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                response
                    .headers_mut()
                    .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                return Ok(response);
            }
        }
    }

    let (parts, request_body) = req.into_parts();
    let preq = ProxyRequest::new(parts, Scheme::Http, None);

    let mut ctx = CacheCtx::new(1);

    match engine.check_request(&mut ctx, &preq) {
        CheckOutcome::Hit { data, info, etag, last_modified } => {
            Ok(serve_hit(engine, ctx, data, info, etag, last_modified))
        }
        CheckOutcome::HitDisk { file } => Ok(serve_disk_hit(engine, ctx, file).await),
        CheckOutcome::NotModified { etag, last_modified } => {
            let mut response = text_response(StatusCode::NOT_MODIFIED, "");
            apply_validators(&mut response, etag, last_modified);
            engine.detach(&mut ctx);
            Ok(response)
        }
        CheckOutcome::PreconditionFailed => {
            engine.detach(&mut ctx);
            Ok(text_response(StatusCode::PRECONDITION_FAILED, ""))
        }
        CheckOutcome::Pass | CheckOutcome::Bypass => {
            forward(engine, ctx, preq, client, upstream, request_body).await
        }
    }
}

async fn handle_nosql(engine: Arc<Engine>, req: Request<Body>) -> Result<Response<Body>, Error> {

    let method = req.method().clone();
    let (parts, body) = req.into_parts();

    match method {
        Method::GET => {
            let preq = ProxyRequest::new(parts, Scheme::Http, None);
            let mut ctx = CacheCtx::new(1);

            match engine.check_request(&mut ctx, &preq) {
                CheckOutcome::Hit { data, info, etag, last_modified } => {
                    Ok(serve_hit(engine, ctx, data, info, etag, last_modified))
                }
                CheckOutcome::HitDisk { file } => Ok(serve_disk_hit(engine, ctx, file).await),
                CheckOutcome::NotModified { etag, last_modified } => {
                    let mut response = text_response(StatusCode::NOT_MODIFIED, "");
                    apply_validators(&mut response, etag, last_modified);
                    engine.detach(&mut ctx);
                    Ok(response)
                }
                CheckOutcome::PreconditionFailed => {
                    engine.detach(&mut ctx);
                    Ok(text_response(StatusCode::PRECONDITION_FAILED, ""))
                }
                _ => {
                    engine.detach(&mut ctx);
                    Ok(text_response(StatusCode::NOT_FOUND, "not found\n"))
                }
            }
        }
        Method::POST | Method::PUT => {
            let bytes = hyper::body::to_bytes(body).await?;
            let preq = ProxyRequest::new(parts, Scheme::Http, Some(bytes));
            let mut ctx = CacheCtx::new(1);

            let outcome = engine.nosql_set(&mut ctx, &preq);
            engine.detach(&mut ctx);

            Ok(match outcome {
                NosqlSetOutcome::Created => text_response(StatusCode::OK, "ok\n"),
                NosqlSetOutcome::NotAllowed => {
                    text_response(StatusCode::METHOD_NOT_ALLOWED, "no rule accepts this key\n")
                }
                NosqlSetOutcome::Full => {
                    text_response(StatusCode::INSUFFICIENT_STORAGE, "storage full\n")
                }
            })
        }
        Method::DELETE => {
            let preq = ProxyRequest::new(parts, Scheme::Http, None);

            Ok(if engine.nosql_delete(&preq) {
                text_response(StatusCode::OK, "deleted\n")
            } else {
                text_response(StatusCode::NOT_FOUND, "not found\n")
            })
        }
        _ => Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "")),
    }
}

async fn handle(
    larder: Arc<Larder>,
    client: Client<hyper::client::HttpConnector>,
    upstream: String,
    req: Request<Body>,
) -> Response<Body> {

    let result = if let Some(engine) = &larder.cache {
        handle_cache(Arc::clone(engine), client, upstream, req).await
    } else if let Some(engine) = &larder.nosql {
        handle_nosql(Arc::clone(engine), req).await
    } else {
        Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, "no engine configured\n"))
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            log::error!("request failed: {}", err);
            text_response(StatusCode::BAD_GATEWAY, "upstream error\n")
        }
    }
}

async fn run(options: Options) -> Result<(), Error> {

    let parsed = config::load(&options.config, &no_acls)?;
    let larder = Arc::new(Larder::from_config(parsed)?);
    larder::setup_global(Arc::clone(&larder))?;

    if larder.cache.is_some() && options.upstream.is_empty() {
        bail!("cache mode needs an upstream (-u)");
    }

    tokio::spawn(larder::housekeeping_loop(
        Arc::clone(&larder),
        HOUSEKEEPING_PERIOD,
    ));

    let client = Client::new();
    let listen = options.listen;
    let upstream = options.upstream;

    let make_service = make_service_fn(move |_conn| {
        let larder = Arc::clone(&larder);
        let client = client.clone();
        let upstream = upstream.clone();

        async move {
            Ok::<_, Error>(service_fn(move |req| {
                let larder = Arc::clone(&larder);
                let client = client.clone();
                let upstream = upstream.clone();

                async move { Ok::<_, Error>(handle(larder, client, upstream, req).await) }
            }))
        }
    });

    log::info!("listening on {}", listen);
    Server::bind(&listen).serve(make_service).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(2);
        }
    };

    if let Err(err) = run(options).await {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
