// src/distribution/mod.rs

//! Splits a byte range across N servers by a stripe policy (spec §2 C3, §4.3).
//!
//! Per the "Dynamic dispatch over Distribution kinds" design note, the
//! source's vtable-of-function-pointers becomes a sum type over the three
//! strategies with a shared trait, rather than `Box<dyn Trait>` per call
//! site — the strategy is chosen once at `Distribution::new` and is cheap
//! enough to store by value.

mod round_robin;
mod single_server;
mod weighted;

pub use round_robin::RoundRobin;
pub use single_server::SingleServer;
pub use weighted::Weighted;

use crate::errors::{JuleaError, Result};

/// One sub-range produced by `distribute` (spec §3 Invariants, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRange {
    pub server_idx: usize,
    pub sub_length: u64,
    pub sub_offset: u64,
    pub block_id: u64,
}

/// Strategy-specific behavior, selected once by `Distribution::new` and
/// addressed centrally by the owning `Distribution`'s `(length, offset,
/// cursor)` scratch state (spec §3 "Distribution").
pub trait Strategy: std::fmt::Debug {
    /// `set(key, value)`, e.g. weighted's `("weight", server_idx)` probe.
    fn set(&mut self, key: &str, value: u64) -> Result<()>;

    /// `set2(key, v1, v2)`, e.g. weighted's `("weight", server_idx, weight)`.
    fn set2(&mut self, key: &str, v1: u64, v2: u64) -> Result<()>;

    /// Locates the server and remote-file sub-offset for stripe `block`
    /// (measured in units of the distribution's block size), given the
    /// byte position within that block (`displacement`).
    fn locate(&self, server_count: usize, block: u64, displacement: u64) -> (usize, u64);
}

/// Which stripe policy a `Distribution` uses (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    RoundRobin,
    SingleServer,
    Weighted,
}

#[derive(Debug, Clone)]
enum StrategyState {
    RoundRobin(RoundRobin),
    SingleServer(SingleServer),
    Weighted(Weighted),
}

impl StrategyState {
    fn as_strategy(&mut self) -> &mut dyn Strategy {
        match self {
            StrategyState::RoundRobin(s) => s,
            StrategyState::SingleServer(s) => s,
            StrategyState::Weighted(s) => s,
        }
    }

    fn as_strategy_ref(&self) -> &dyn Strategy {
        match self {
            StrategyState::RoundRobin(s) => s,
            StrategyState::SingleServer(s) => s,
            StrategyState::Weighted(s) => s,
        }
    }
}

/// Splits a `(length, offset)` byte range across `server_count` servers by
/// `block_size`-sized blocks (spec §3, §4.3). Cheap, but scratch state makes
/// it unsafe to share across concurrent operations on different ranges —
/// treat as owned per-call, matching the spec's data-model note. Cloning
/// preserves the chosen strategy parameters (e.g. round-robin's start index)
/// but carries over whatever scratch state `reset`/`distribute` left behind,
/// so callers that want a fresh scratch copy of a fixed strategy should
/// `clone()` before `reset()`, not after.
#[derive(Debug, Clone)]
pub struct Distribution {
    kind: Kind,
    strategy: StrategyState,
    server_count: usize,
    block_size: u64,
    remaining: u64,
    offset: u64,
    block: u64,
}

impl Distribution {
    /// Creates a distribution of `kind` over `server_count` servers with the
    /// given `stripe_size`. Round-robin and single-server pick their start
    /// index with a uniform RNG at construction time (spec §4.3).
    pub fn new(kind: Kind, server_count: usize, stripe_size: u64) -> Result<Self> {
        if server_count == 0 {
            return Err(JuleaError::Config(
                "distribution requires at least one server".into(),
            ));
        }
        if stripe_size == 0 {
            return Err(JuleaError::Config("stripe size cannot be 0".into()));
        }
        let strategy = match kind {
            Kind::RoundRobin => StrategyState::RoundRobin(RoundRobin::new(server_count)),
            Kind::SingleServer => StrategyState::SingleServer(SingleServer::new(server_count)),
            Kind::Weighted => StrategyState::Weighted(Weighted::new(server_count)),
        };
        Ok(Self {
            kind,
            strategy,
            server_count,
            block_size: stripe_size,
            remaining: 0,
            offset: 0,
            block: 0,
        })
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn server_count(&self) -> usize {
        self.server_count
    }

    /// Strategy-specific single-value parameter (spec §4.3 `set`).
    pub fn set(&mut self, key: &str, value: u64) -> Result<()> {
        self.strategy.as_strategy().set(key, value)
    }

    /// Strategy-specific two-value parameter (spec §4.3 `set2`), e.g.
    /// weighted's `("weight", server_idx, weight)`.
    pub fn set2(&mut self, key: &str, v1: u64, v2: u64) -> Result<()> {
        self.strategy.as_strategy().set2(key, v1, v2)
    }

    /// Sets the remaining range to cover; resets the block cursor to the
    /// block containing `offset` (spec §4.3 `reset`).
    pub fn reset(&mut self, length: u64, offset: u64) {
        self.remaining = length;
        self.offset = offset;
        self.block = offset / self.block_size;
    }

    /// Returns the next sub-range, or `None` when the range is exhausted
    /// (spec §4.3 `distribute`). Remaining = 0 returns `None` without
    /// advancing any state (spec "Tie-break and edge cases").
    pub fn distribute(&mut self) -> Option<SubRange> {
        if self.remaining == 0 {
            return None;
        }
        let displacement = self.offset % self.block_size;
        let (server_idx, sub_offset_blocks) =
            self.strategy.as_strategy_ref().locate(self.server_count, self.block, displacement);
        let sub_offset = match self.kind {
            // Single-server keeps the caller's own coordinate space (spec
            // §4.3: "sub_offset equals the caller's offset").
            Kind::SingleServer => self.offset,
            _ => sub_offset_blocks * self.block_size + displacement,
        };
        let available_in_block = self.block_size - displacement;
        let sub_length = self.remaining.min(available_in_block);
        let block_id = self.block;

        self.remaining -= sub_length;
        self.offset += sub_length;
        self.block = self.offset / self.block_size;

        Some(SubRange {
            server_idx,
            sub_length,
            sub_offset,
            block_id,
        })
    }
}
