// src/distribution/weighted.rs

//! Weighted striping (spec §4.3): each server gets `weight[s]` blocks out of
//! every `sum(weights)`-block cycle, with its own share mapped densely into
//! its remote-file coordinate space, generalizing round-robin's mapping.

use super::Strategy;
use crate::errors::{JuleaError, Result};

#[derive(Debug, Clone)]
pub struct Weighted {
    weights: Vec<u8>,
}

impl Weighted {
    pub fn new(server_count: usize) -> Self {
        Self {
            weights: vec![1u8; server_count],
        }
    }

    fn sum(&self) -> u64 {
        self.weights.iter().map(|&w| w as u64).sum()
    }
}

impl Strategy for Weighted {
    fn set(&mut self, _key: &str, _value: u64) -> Result<()> {
        Ok(())
    }

    /// `("weight", server_idx, weight)` with `weight` in `[0, 255]` (spec
    /// allows `[1, 255]` for a server kept in rotation; `0` is accepted to
    /// remove a server from the cycle, as long as the new total is > 0 —
    /// spec §4.3 "Tie-break and edge cases").
    fn set2(&mut self, key: &str, v1: u64, v2: u64) -> Result<()> {
        if key != "weight" {
            return Err(JuleaError::Config(format!(
                "weighted distribution has no parameter '{key}'"
            )));
        }
        let server_idx = v1 as usize;
        let weight = v2;
        if weight > 255 {
            return Err(JuleaError::Config(format!(
                "weight {weight} out of range [0, 255]"
            )));
        }
        let server = self.weights.get_mut(server_idx).ok_or_else(|| {
            JuleaError::Config(format!("server index {server_idx} out of range"))
        })?;
        let previous = *server;
        *server = weight as u8;
        if self.sum() == 0 {
            *self.weights.get_mut(server_idx).unwrap() = previous;
            return Err(JuleaError::Config(
                "rejecting weight update: all server weights would become 0".into(),
            ));
        }
        Ok(())
    }

    fn locate(&self, _server_count: usize, block: u64, _displacement: u64) -> (usize, u64) {
        let sum = self.sum();
        let cycle = block / sum;
        let block_in_cycle = block % sum;

        let mut prefix = 0u64;
        for (server_idx, &weight) in self.weights.iter().enumerate() {
            let weight = weight as u64;
            if block_in_cycle < prefix + weight {
                let local_block = block_in_cycle - prefix;
                let sub_offset_blocks = cycle * weight + local_block;
                return (server_idx, sub_offset_blocks);
            }
            prefix += weight;
        }
        unreachable!("block_in_cycle is always < sum by construction")
    }
}
