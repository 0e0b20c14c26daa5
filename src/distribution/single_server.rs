// src/distribution/single_server.rs

//! Pins every block to a single, RNG-chosen server (spec §4.3). Unlike
//! round-robin and weighted, the remote-file offset is left in the caller's
//! own coordinate space — see `Distribution::distribute`.

use super::Strategy;
use crate::errors::Result;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct SingleServer {
    server: usize,
}

impl SingleServer {
    pub fn new(server_count: usize) -> Self {
        let server = rand::thread_rng().gen_range(0..server_count);
        Self { server }
    }

    pub fn force_server(&mut self, server: usize) {
        self.server = server;
    }
}

impl Strategy for SingleServer {
    fn set(&mut self, _key: &str, _value: u64) -> Result<()> {
        Ok(())
    }

    fn set2(&mut self, _key: &str, _v1: u64, _v2: u64) -> Result<()> {
        Ok(())
    }

    fn locate(&self, _server_count: usize, _block: u64, _displacement: u64) -> (usize, u64) {
        (self.server, 0)
    }
}
