//! Admission controller: global + per-trunk slot reservation and CPS
//! pacing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    GlobalFull,
    TrunkFull,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::GlobalFull => "global_full",
            RejectReason::TrunkFull => "trunk_full",
        }
    }
}

#[derive(Debug)]
struct Counters {
    global_max: u32,
    global_in_use: u32,
    trunk_max: HashMap<String, u32>,
    trunk_in_use: HashMap<String, u32>,
}

#[derive(Debug)]
struct Shared {
    counters: Mutex<Counters>,
    cps: Semaphore,
    max_cps: u32,
}

/// A held reservation against the global and per-trunk counters. Released
/// exactly once, either explicitly or on drop (idempotent either way) —
/// this is the admission slot handed back by `ChannelPool::reserve`.
#[derive(Debug)]
pub struct Slot {
    shared: Arc<Shared>,
    trunk: String,
    released: AtomicBool,
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
            && self.trunk == other.trunk
            && self.released.load(Ordering::SeqCst) == other.released.load(Ordering::SeqCst)
    }
}

impl Slot {
    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    /// Decrements both counters. A second call (or the eventual `Drop`) is
    /// a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut counters = self.shared.counters.lock();
        counters.global_in_use = counters.global_in_use.saturating_sub(1);
        if let Some(n) = counters.trunk_in_use.get_mut(&self.trunk) {
            *n = n.saturating_sub(1);
        }
        debug!(trunk = %self.trunk, "released admission slot");
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Admission control: `Reserve`/`Release` under one lock so "admit on both
/// dimensions or admit on neither" is atomic, plus a FIFO CPS token bucket.
pub struct ChannelPool {
    shared: Arc<Shared>,
}

impl ChannelPool {
    pub fn new(global_max: u32, max_cps: u32) -> Self {
        let shared = Arc::new(Shared {
            counters: Mutex::new(Counters {
                global_max,
                global_in_use: 0,
                trunk_max: HashMap::new(),
                trunk_in_use: HashMap::new(),
            }),
            cps: Semaphore::new(max_cps.max(1) as usize),
            max_cps: max_cps.max(1),
        });
        let refill_shared = shared.clone();
        tokio::spawn(async move { refill_loop(refill_shared).await });
        Self { shared }
    }

    pub fn register_trunk(&self, trunk: impl Into<String>, max_channels: u32) {
        let mut counters = self.shared.counters.lock();
        counters.trunk_max.insert(trunk.into(), max_channels);
    }

    pub fn trunk_in_use(&self, trunk: &str) -> u32 {
        self.shared.counters.lock().trunk_in_use.get(trunk).copied().unwrap_or(0)
    }

    pub fn trunk_free(&self, trunk: &str) -> u32 {
        let counters = self.shared.counters.lock();
        let max = counters.trunk_max.get(trunk).copied().unwrap_or(0);
        let used = counters.trunk_in_use.get(trunk).copied().unwrap_or(0);
        max.saturating_sub(used)
    }

    pub fn global_free(&self) -> u32 {
        let counters = self.shared.counters.lock();
        counters.global_max.saturating_sub(counters.global_in_use)
    }

    /// Atomically checks and reserves one slot against both the global and
    /// the named trunk's counters.
    pub fn reserve(&self, trunk: &str) -> Result<Slot, RejectReason> {
        let mut counters = self.shared.counters.lock();
        if counters.global_in_use >= counters.global_max {
            return Err(RejectReason::GlobalFull);
        }
        let trunk_max = counters.trunk_max.get(trunk).copied().unwrap_or(0);
        let trunk_used = counters.trunk_in_use.get(trunk).copied().unwrap_or(0);
        if trunk_used >= trunk_max {
            return Err(RejectReason::TrunkFull);
        }
        counters.global_in_use += 1;
        *counters.trunk_in_use.entry(trunk.to_string()).or_insert(0) += 1;
        drop(counters);

        Ok(Slot {
            shared: self.shared.clone(),
            trunk: trunk.to_string(),
            released: AtomicBool::new(false),
        })
    }

    /// Blocks until a CPS token is available. Called only after a
    /// successful `reserve`, so rejected admissions never consume a token.
    pub async fn acquire_cps(&self) {
        match self.shared.cps.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => warn!("cps semaphore closed unexpectedly"),
        }
    }
}

async fn refill_loop(shared: Arc<Shared>) {
    let period = Duration::from_secs_f64(1.0 / shared.max_cps as f64);
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if shared.cps.available_permits() < shared.max_cps as usize {
            shared.cps.add_permits(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_respects_global_and_trunk_limits() {
        let pool = ChannelPool::new(3, 100);
        pool.register_trunk("sbc233", 2);

        let s1 = pool.reserve("sbc233").unwrap();
        let s2 = pool.reserve("sbc233").unwrap();
        assert_eq!(pool.trunk_free("sbc233"), 0);

        // Trunk full even though global has room.
        assert_eq!(pool.reserve("sbc233"), Err(RejectReason::TrunkFull));

        s1.release();
        let s3 = pool.reserve("sbc233").unwrap();
        assert_eq!(pool.global_free(), 0);

        drop(s2);
        drop(s3);
        assert_eq!(pool.global_free(), 3);
    }

    #[test]
    fn double_release_is_a_no_op() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let pool = ChannelPool::new(1, 100);
        pool.register_trunk("t", 1);
        let slot = pool.reserve("t").unwrap();
        slot.release();
        slot.release();
        assert_eq!(pool.global_free(), 1);
    }

}

// global_in_use must never exceed global_max, and trunk_in_use must never
// exceed trunk_max, no matter how many tasks hammer reserve/release at once
// or how the switch's CPS pacing interleaves with them.
#[cfg(test)]
mod invariant_proptests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU32;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn reserve_release_acquire_cps_never_exceeds_limits(
            global_max in 2u32..8,
            trunk_max in 1u32..5,
            task_count in 1usize..12,
            iterations in 1usize..60,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let violations = rt.block_on(async move {
                let pool = Arc::new(ChannelPool::new(global_max, 1000));
                pool.register_trunk("t1", trunk_max);
                let violations = Arc::new(AtomicU32::new(0));

                let mut handles = Vec::new();
                for _ in 0..task_count {
                    let pool = pool.clone();
                    let violations = violations.clone();
                    handles.push(tokio::spawn(async move {
                        for _ in 0..iterations {
                            match pool.reserve("t1") {
                                Ok(slot) => {
                                    if pool.global_free() > global_max || pool.trunk_free("t1") > trunk_max {
                                        violations.fetch_add(1, Ordering::SeqCst);
                                    }
                                    pool.acquire_cps().await;
                                    tokio::task::yield_now().await;
                                    slot.release();
                                }
                                Err(_) => {
                                    tokio::task::yield_now().await;
                                }
                            }
                        }
                    }));
                }
                for h in handles {
                    h.await.unwrap();
                }

                let global_free_after = pool.global_free();
                let trunk_free_after = pool.trunk_free("t1");
                prop_assert_eq!(global_free_after, global_max);
                prop_assert_eq!(trunk_free_after, trunk_max);
                Ok::<u32, proptest::test_runner::TestCaseError>(violations.load(Ordering::SeqCst))
            })?;

            prop_assert_eq!(violations, 0);
        }
    }
}
