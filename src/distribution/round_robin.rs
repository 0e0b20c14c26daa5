// src/distribution/round_robin.rs

//! Round-robin striping (spec §4.3): `server = (start_index + block) mod N`,
//! with each server's share mapped densely into its own remote-file
//! coordinate space (the interpretation picked in DESIGN.md for the
//! round-robin `sub_offset` open question).

use super::Strategy;
use crate::errors::Result;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct RoundRobin {
    start_index: usize,
}

impl RoundRobin {
    pub fn new(server_count: usize) -> Self {
        let start_index = rand::thread_rng().gen_range(0..server_count);
        Self { start_index }
    }

    /// Test/diagnostic hook to pin the RNG-chosen start index so fixtures
    /// like spec §8's S1/S2 scenarios are reproducible.
    pub fn force_start_index(&mut self, start_index: usize) {
        self.start_index = start_index;
    }
}

impl Strategy for RoundRobin {
    fn set(&mut self, _key: &str, _value: u64) -> Result<()> {
        Ok(())
    }

    fn set2(&mut self, _key: &str, _v1: u64, _v2: u64) -> Result<()> {
        Ok(())
    }

    fn locate(&self, server_count: usize, block: u64, _displacement: u64) -> (usize, u64) {
        let server = (self.start_index as u64 + block) % server_count as u64;
        let sub_offset_blocks = block / server_count as u64;
        (server as usize, sub_offset_blocks)
    }
}
