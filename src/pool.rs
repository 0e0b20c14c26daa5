// src/pool.rs

//! Bounded per-server connection pool (spec §4.6, C6).
//!
//! Grounded on the teacher's `tokio::sync::Semaphore`-capped accept loop
//! (`server/initialization.rs`'s `connection_permits`) for the "block once
//! the cap is reached" half, and on the `WardenClient`/`ClusterClient`
//! `connect` + handshake pattern (`core/warden/client.rs`) for opening a
//! fresh connection and greeting it with a `PING`.

use crate::config::{BackendType, Configuration};
use crate::connection::Connection;
use crate::errors::{JuleaError, Result};
use crate::message::{Message, MessageReader, OpType};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One `{FIFO, atomic live_count}` slot for a `(backend_type, server_index)`
/// pair (spec §4.6 `init`).
struct Slot {
    idle: Mutex<VecDeque<Connection>>,
    notify: tokio::sync::Notify,
    live_count: AtomicUsize,
}

impl Slot {
    fn new() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            notify: tokio::sync::Notify::new(),
            live_count: AtomicUsize::new(0),
        }
    }
}

/// Bounded per-`(backend, server)` pool of `Connection`s. No connections are
/// opened eagerly — `pop` opens lazily up to `max_connections` and blocks
/// beyond that (spec §4.6).
pub struct ConnectionPool {
    config: Arc<Configuration>,
    slots: HashMap<(BackendType, usize), Slot>,
}

impl ConnectionPool {
    /// Creates one slot per configured `(backend_type, server_index)` pair;
    /// no connections are opened yet (spec §4.6 `init`).
    pub fn new(config: Arc<Configuration>) -> Self {
        let mut slots = HashMap::new();
        for backend in [BackendType::Object, BackendType::Kv, BackendType::Db] {
            for index in 0..config.server_count(backend) {
                slots.insert((backend, index), Slot::new());
            }
        }
        Self { config, slots }
    }

    fn slot(&self, backend: BackendType, server_index: usize) -> Result<&Slot> {
        self.slots.get(&(backend, server_index)).ok_or_else(|| {
            JuleaError::Config(format!(
                "no server configured at index {server_index} for {backend:?}"
            ))
        })
    }

    /// Checks out a connection for `(backend, server_index)` (spec §4.6
    /// `pop`): returns an idle one if available; else opens a new one if
    /// under `max_connections`; else blocks until one is returned.
    pub async fn pop(&self, backend: BackendType, server_index: usize) -> Result<Connection> {
        let slot = self.slot(backend, server_index)?;
        loop {
            {
                let mut idle = slot.idle.lock().await;
                if let Some(conn) = idle.pop_front() {
                    return Ok(conn);
                }
            }
            let previous = slot.live_count.fetch_add(1, Ordering::SeqCst);
            if previous < self.config.max_connections {
                match self.open_and_handshake(backend, server_index).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        slot.live_count.fetch_sub(1, Ordering::SeqCst);
                        return Err(e);
                    }
                }
            }
            slot.live_count.fetch_sub(1, Ordering::SeqCst);
            slot.notify.notified().await;
        }
    }

    async fn open_and_handshake(
        &self,
        backend: BackendType,
        server_index: usize,
    ) -> Result<Connection> {
        let addr = self.config.server_addr(backend, server_index)?;
        let mut conn = Connection::connect(addr).await?;
        let backends = handshake(&mut conn).await?;
        conn.set_remote_backends(backends);
        info!(?backend, server_index, %addr, "opened connection");
        Ok(conn)
    }

    /// Returns `connection` to `(backend, server_index)`'s idle FIFO (spec
    /// §4.6 `push`). A caller that saw a transport error must drop the
    /// connection instead of calling this.
    pub async fn push(&self, backend: BackendType, server_index: usize, connection: Connection) {
        let Ok(slot) = self.slot(backend, server_index) else {
            return;
        };
        slot.idle.lock().await.push_back(connection);
        slot.notify.notify_one();
    }

    /// Drains every slot's FIFO and shuts each connection down, reporting
    /// but not propagating close errors (spec §4.6 `fini`).
    pub async fn fini(&self) {
        for ((backend, server_index), slot) in &self.slots {
            let mut idle = slot.idle.lock().await;
            for conn in idle.drain(..) {
                conn.fini().await;
            }
            if slot.live_count.load(Ordering::SeqCst) > 0 {
                warn!(
                    ?backend,
                    server_index, "connections still checked out during pool shutdown"
                );
            }
        }
    }
}

/// Sends the handshake `PING` and parses the backend-type list from the
/// reply (spec §6 "Connection handshake").
async fn handshake(conn: &mut Connection) -> Result<Vec<String>> {
    let mut request = Message::new(OpType::Ping, 64);
    let program_name = "julea-core";
    request.add_operation(program_name.len() + 1 + 4);
    request.append_string(program_name);
    let uid = unsafe { libc::getuid() };
    request.append_u32(uid);

    let wire = conn.send_and_receive(request.finish()).await?;
    if wire.header.op_type != OpType::Ping as u32 {
        return Err(JuleaError::Protocol(format!(
            "expected PING reply, got op_type {}",
            wire.header.op_type
        )));
    }
    let mut reader = MessageReader::new(&wire.body);
    let mut backends = Vec::with_capacity(wire.header.op_count as usize);
    for _ in 0..wire.header.op_count {
        backends.push(reader.get_string()?);
    }
    Ok(backends)
}
