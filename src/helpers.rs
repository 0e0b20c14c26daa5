// src/helpers.rs

//! Small cross-cutting primitives shared by the engines (spec §4.11, C11).

use crc::{CRC_16_USB, Crc};
use std::future::Future;
use tokio::task::JoinSet;

/// CAS-loop accumulation into a caller-owned counter (spec §4.11
/// `atomic_add`), grounded on the teacher's `AtomicU64::fetch_add` usage for
/// shard memory accounting (`core/state/cache.rs`, `core/commands/*`).
/// `fetch_add` already is the CAS loop on every target tokio runs on, so
/// this is a thin, documented wrapper rather than a hand-rolled CAS.
pub fn atomic_add(counter: &std::sync::atomic::AtomicU64, v: u64) -> u64 {
    counter.fetch_add(v, std::sync::atomic::Ordering::SeqCst)
}

/// Stable, platform-independent hash used for KV routing (spec §4.11
/// `hash`, §4.9 "`index = hash(name) mod server_count`"). Grounded on the
/// teacher's CRC-16 slot hashing (`core/cluster/slot.rs`) — any fast,
/// uniformly-distributed non-cryptographic hash suffices per the spec, and
/// reusing the teacher's own `crc` dependency keeps the stack aligned.
pub fn hash(s: &str) -> u32 {
    const ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_USB);
    ALGO.checksum(s.as_bytes()) as u32
}

/// Spawns `n - 1` background tasks plus runs one instance on the caller's
/// own task, then waits for all `n` to finish (spec §4.11
/// `execute_parallel`). Ordering of completion must not affect the result —
/// callers are expected to only perform commutative reductions (atomic
/// adds, AND, max/sum) from within `make_task`. Grounded on the teacher's
/// `JoinSet`-based fan-out (`server/connection_loop.rs`).
pub async fn execute_parallel<F, Fut>(n: usize, make_task: F)
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    if n == 0 {
        return;
    }
    let mut joinset = JoinSet::new();
    for idx in 1..n {
        joinset.spawn(make_task(idx));
    }
    make_task(0).await;
    while joinset.join_next().await.is_some() {}
}
