//! Request and memory counters.
//!
//! Kept under their own lock so hot-path accounting never contends with the
//! arena lock.

use serde::Serialize;
use serde_json::json;

use crate::shctx::ShCtx;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub used_mem: u64,
    pub req_total: u64,
    pub req_hit: u64,
    pub req_fetch: u64,
    pub req_abort: u64,
}

pub struct Stats {
    inner: ShCtx<Counters>,
    data_size: u64,
}

/// Final context state classes fed back into the counters on detach.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReqOutcome {
    Hit,
    Fetch,
    Abort,
    Other,
}

impl Stats {

    pub fn new(data_size: u64) -> Stats {
        Stats {
            inner: ShCtx::new(Counters::default()),
            data_size,
        }
    }

    pub fn update_used_mem(&self, delta: i64) {
        let mut counters = self.inner.lock();

        if delta >= 0 {
            counters.used_mem += delta as u64;
        } else {
            counters.used_mem = counters.used_mem.saturating_sub((-delta) as u64);
        }
    }

    pub fn update_req(&self, outcome: ReqOutcome) {
        let mut counters = self.inner.lock();
        counters.req_total += 1;

        match outcome {
            ReqOutcome::Hit => counters.req_hit += 1,
            ReqOutcome::Fetch => counters.req_fetch += 1,
            ReqOutcome::Abort => counters.req_abort += 1,
            ReqOutcome::Other => {}
        }
    }

    /// True once the accounted memory reaches the configured data size.
    pub fn full(&self) -> bool {
        self.inner.lock().used_mem >= self.data_size
    }

    pub fn snapshot(&self) -> Counters {
        *self.inner.lock()
    }

    /// Counters as a JSON object.
    pub fn render_json(&self) -> serde_json::Value {
        json!(self.snapshot())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn req_counters_by_outcome() {
        let stats = Stats::new(1024);

        stats.update_req(ReqOutcome::Hit);
        stats.update_req(ReqOutcome::Hit);
        stats.update_req(ReqOutcome::Fetch);
        stats.update_req(ReqOutcome::Abort);
        stats.update_req(ReqOutcome::Other);

        let counters = stats.snapshot();
        assert_eq!(counters.req_total, 5);
        assert_eq!(counters.req_hit, 2);
        assert_eq!(counters.req_fetch, 1);
        assert_eq!(counters.req_abort, 1);
    }

    #[test]
    fn used_mem_saturates_at_zero() {
        let stats = Stats::new(1024);

        stats.update_used_mem(100);
        stats.update_used_mem(-200);
        assert_eq!(stats.snapshot().used_mem, 0);
    }

    #[test]
    fn full_threshold() {
        let stats = Stats::new(100);
        assert!(!stats.full());

        stats.update_used_mem(100);
        assert!(stats.full());
    }

    #[test]
    fn json_counters() {
        let stats = Stats::new(1024);
        stats.update_req(ReqOutcome::Hit);
        stats.update_used_mem(42);

        let value = stats.render_json();
        assert_eq!(value["req_total"], 1);
        assert_eq!(value["req_hit"], 1);
        assert_eq!(value["used_mem"], 42);
    }
}
