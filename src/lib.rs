//! This crate implements an HTTP caching and key/value storage engine that
//! embeds as a filter in a reverse proxy.
//!
//! # Architecture
//!
//! Requests flowing through the host proxy are fingerprinted against an
//! ordered list of [rules](rule::Rule); the fingerprint is looked up in a
//! two-table [dict](dict::Dict) with incremental rehashing. A hit streams
//! the stored body out of the shared-memory [arena](memory::Arena) (or from
//! a persistence file); a miss that a rule accepts streams the upstream
//! response into a fresh entry while it is forwarded to the client.
//!
//! The same machinery doubles as a REST-accessible key/value store: the
//! `nosql` engine serves GET from the dict and materializes POST/PUT
//! bodies as entries directly.
//!
//! Cache memory is owned by the arena, a fixed-capacity slab allocator
//! over an anonymous shared mapping; the dict and the
//! [data ring](data::DataRing) both draw from it. All shared state sits
//! behind [shctx](shctx::ShCtx) locks, and a periodic
//! [housekeeping](Larder::housekeeping) tick drives rehashing, cleanup and
//! the disk loader/saver/cleaner in bounded work units.
//!
//! # Persistence
//!
//! Entries whose rule enables disk persistence serialize to one file each
//! below the configured root, fanned out by hash prefix. Files are written
//! atomically (temp file plus rename); on startup the loader walks the
//! root and repopulates the dict without blocking request traffic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};
use once_cell::sync::OnceCell;

#[macro_use]
pub mod buildcfg;

pub mod tools;

mod error;
pub use error::*;

pub mod shctx;

pub mod memory;

pub mod key;

pub mod rule;

pub mod http;

pub mod data;

pub mod dict;

pub mod context;
pub use context::{CacheCtx, CtxState};

pub mod stats;

pub mod persist;

pub mod engine;
pub use engine::{CheckOutcome, Engine, EngineConfig, Mode, NosqlSetOutcome};

pub mod config;

/// The process-wide engine pair, one per configured mode.
pub struct Larder {
    pub cache: Option<Arc<Engine>>,
    pub nosql: Option<Arc<Engine>>,
}

impl Larder {

    pub fn from_config(parsed: config::LarderConfig) -> Result<Larder, Error> {

        let build = |section: Option<config::Section>| -> Result<Option<Arc<Engine>>, Error> {
            match section {
                Some(section) if section.on => {
                    Ok(Some(Arc::new(Engine::new(section.conf, section.rules)?)))
                }
                _ => Ok(None),
            }
        };

        Ok(Larder {
            cache: build(parsed.cache)?,
            nosql: build(parsed.nosql)?,
        })
    }

    /// One bounded housekeeping tick across both engines.
    pub fn housekeeping(&self) {
        if let Some(engine) = &self.cache {
            engine.housekeeping();
        }
        if let Some(engine) = &self.nosql {
            engine.housekeeping();
        }
    }

    /// Plain-text stats summary served on the stats URI.
    pub fn render_stats(&self) -> String {
        let mut out = String::new();

        if let Some(engine) = &self.cache {
            engine.render_stats(&mut out);
        }
        if let Some(engine) = &self.nosql {
            engine.render_stats(&mut out);
        }

        out
    }

    /// The same summary as JSON, served on `<stats-uri>?format=json`.
    pub fn render_stats_json(&self) -> serde_json::Value {
        let engines: Vec<_> = self
            .cache
            .iter()
            .chain(self.nosql.iter())
            .map(|engine| engine.render_stats_json())
            .collect();

        serde_json::json!({ "engines": engines })
    }
}

/// Drive the housekeeping tick from the host's event loop.
pub async fn housekeeping_loop(larder: Arc<Larder>, period: Duration) {
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        larder.housekeeping();
    }
}

static GLOBAL: OnceCell<Arc<Larder>> = OnceCell::new();

/// Install the process-wide instance. Only exists to bridge hosts with a
/// plugin ABI that cannot thread a handle through.
pub fn setup_global(larder: Arc<Larder>) -> Result<(), Error> {
    if GLOBAL.set(larder).is_err() {
        bail!("global larder instance already installed");
    }
    Ok(())
}

pub fn global() -> Option<&'static Arc<Larder>> {
    GLOBAL.get()
}
