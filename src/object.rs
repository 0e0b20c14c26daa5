// src/object.rs

//! Distributed-Object Engine (spec §4.8, C8): create/delete/read/write/
//! status/sync on a byte-addressable blob striped across servers by a
//! `Distribution`.
//!
//! Per-server fan-out is grounded on the teacher's `JoinSet` accept-loop
//! pattern (`server/connection_loop.rs`): spawn one task per involved
//! server, then join all before returning, exactly as spec §9 "Parallel
//! fan-out" asks for.

use crate::config::BackendType;
use crate::context::Context;
use crate::distribution::{Distribution, Kind};
use crate::errors::{JuleaError, Result};
use crate::message::{Message, MessageReader, OpType};
use crate::semantics::{Safety, Semantics};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinSet;

/// The in-process backend a co-located object service would expose (spec
/// §4.8 "When the object backend runs in-process..."). Real JULEA backends
/// are plugins; here this is a trait so the bypass path is testable without
/// a network.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn create(&self, namespace: &str, name: &str) -> Result<()>;
    /// Returns whether the object existed.
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool>;
    async fn read(&self, namespace: &str, name: &str, buf: &mut [u8], offset: u64) -> Result<u64>;
    async fn write(&self, namespace: &str, name: &str, data: &[u8], offset: u64) -> Result<u64>;
    async fn status(&self, namespace: &str, name: &str) -> Result<(i64, u64)>;
    async fn sync(&self, namespace: &str, name: &str) -> Result<()>;
}

/// A simple in-memory `ObjectBackend` for tests and co-located bypass
/// demonstrations (spec B.5 supplemented feature).
#[derive(Default)]
pub struct InMemoryObjectBackend {
    objects: tokio::sync::Mutex<HashMap<(String, String), Vec<u8>>>,
}

#[async_trait]
impl ObjectBackend for InMemoryObjectBackend {
    async fn create(&self, namespace: &str, name: &str) -> Result<()> {
        let mut objects = self.objects.lock().await;
        objects
            .entry((namespace.to_string(), name.to_string()))
            .or_default();
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut objects = self.objects.lock().await;
        Ok(objects
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some())
    }

    async fn read(&self, namespace: &str, name: &str, buf: &mut [u8], offset: u64) -> Result<u64> {
        let objects = self.objects.lock().await;
        let Some(data) = objects.get(&(namespace.to_string(), name.to_string())) else {
            return Ok(0);
        };
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n as u64)
    }

    async fn write(&self, namespace: &str, name: &str, data: &[u8], offset: u64) -> Result<u64> {
        let mut objects = self.objects.lock().await;
        let entry = objects
            .entry((namespace.to_string(), name.to_string()))
            .or_default();
        let offset = offset as usize;
        if entry.len() < offset + data.len() {
            entry.resize(offset + data.len(), 0);
        }
        entry[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len() as u64)
    }

    async fn status(&self, namespace: &str, name: &str) -> Result<(i64, u64)> {
        let objects = self.objects.lock().await;
        let size = objects
            .get(&(namespace.to_string(), name.to_string()))
            .map(|d| d.len() as u64)
            .unwrap_or(0);
        Ok((crate::trace::now_unix_seconds() as i64, size))
    }

    async fn sync(&self, _namespace: &str, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Splits `length` bytes starting at `offset` into pieces no larger than
/// `max_operation_size` (spec §4.8 "Read and write are chunked at the
/// client"). Each returned `(piece_offset, piece_len)` is independently
/// distributed and fanned out.
pub fn chunk_ranges(length: u64, offset: u64, max_operation_size: u64) -> Vec<(u64, u64)> {
    if length == 0 {
        return Vec::new();
    }
    let mut pieces = Vec::new();
    let mut remaining = length;
    let mut cursor = offset;
    while remaining > 0 {
        let piece = remaining.min(max_operation_size);
        pieces.push((cursor, piece));
        cursor += piece;
        remaining -= piece;
    }
    pieces
}

/// A logical distributed object identified by `(namespace, name)` (spec §3,
/// §4.8). Cheap to construct; holds no connections of its own — those come
/// from the shared `Context`'s pool.
pub struct DistributedObject {
    context: Arc<Context>,
    namespace: String,
    name: String,
    semantics: Semantics,
    distribution_kind: Kind,
    /// The object's distribution is part of its identity (spec §3: "Logical
    /// object: triple (namespace, name, distribution)") and must stay fixed
    /// across every read/write for the object's lifetime — a round-robin
    /// start index re-rolled on every call would make a read disagree with
    /// an earlier write about which server holds which byte range. Built
    /// lazily (server count/stripe size come from config, already known at
    /// `new`, but the kind can still change via `with_distribution_kind`
    /// before first use) and cached once.
    distribution_template: tokio::sync::OnceCell<Distribution>,
    /// When set, bypasses the Message path entirely (spec §4.8 "co-located
    /// backend").
    backend: Option<Arc<dyn ObjectBackend>>,
}

impl DistributedObject {
    pub fn new(context: Arc<Context>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            context,
            namespace: namespace.into(),
            name: name.into(),
            semantics: Semantics::default_template(),
            distribution_kind: Kind::RoundRobin,
            distribution_template: tokio::sync::OnceCell::new(),
            backend: None,
        }
    }

    pub fn with_semantics(mut self, semantics: Semantics) -> Self {
        self.semantics = semantics;
        self
    }

    pub fn with_distribution_kind(mut self, kind: Kind) -> Self {
        self.distribution_kind = kind;
        self
    }

    /// Installs a co-located backend, bypassing the Message path for every
    /// subsequent operation (spec §4.8 last paragraph).
    pub fn with_colocated_backend(mut self, backend: Arc<dyn ObjectBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    fn server_count(&self) -> usize {
        self.context.config.server_count(BackendType::Object)
    }

    /// Returns a fresh scratch copy of this object's distribution, building
    /// and caching the template (with its RNG-chosen strategy parameters) on
    /// first use. Every subsequent call clones the same template, so the
    /// server mapping a write used is guaranteed to still apply to a later
    /// read of the same object.
    async fn distribution_template(&self) -> Result<Distribution> {
        let server_count = self.server_count();
        let stripe_size = self.context.config.stripe_size as u64;
        let kind = self.distribution_kind;
        let template = self
            .distribution_template
            .get_or_try_init(|| async move { Distribution::new(kind, server_count, stripe_size) })
            .await?;
        Ok(template.clone())
    }

    pub async fn create(&self) -> Result<bool> {
        if let Some(backend) = &self.backend {
            backend.create(&self.namespace, &self.name).await?;
            return Ok(true);
        }
        self.fan_out_to_all_servers(OpType::ObjectCreate).await
    }

    pub async fn delete(&self) -> Result<bool> {
        if let Some(backend) = &self.backend {
            return backend.delete(&self.namespace, &self.name).await;
        }
        self.fan_out_to_all_servers(OpType::ObjectDelete).await
    }

    pub async fn sync(&self) -> Result<bool> {
        if let Some(backend) = &self.backend {
            backend.sync(&self.namespace, &self.name).await?;
            return Ok(true);
        }
        self.fan_out_to_all_servers(OpType::ObjectSync).await
    }

    /// Mod-time reduced by max across servers, size reduced by sum (spec
    /// §4.8 "Status reduction").
    pub async fn status(&self) -> Result<(i64, u64)> {
        if let Some(backend) = &self.backend {
            return backend.status(&self.namespace, &self.name).await;
        }
        let server_count = self.server_count();
        if server_count == 0 {
            return Err(JuleaError::Config("no object servers configured".into()));
        }
        let mut joinset: JoinSet<Result<(i64, u64)>> = JoinSet::new();
        for server_idx in 0..server_count {
            let context = self.context.clone();
            let namespace = self.namespace.clone();
            let name = self.name.clone();
            joinset.spawn(async move {
                let mut msg = Message::new(OpType::ObjectStatus, namespace.len() + name.len() + 2);
                msg.append_string(&namespace);
                msg.append_string(&name);
                msg.add_operation(0);
                run_request_reply(&context, server_idx, msg, |reader, _op_count| {
                    let mod_time = reader.get_i64()?;
                    let size = reader.get_u64()?;
                    Ok((mod_time, size))
                })
                .await
            });
        }
        let mut mod_time = 0i64;
        let mut size = 0u64;
        while let Some(joined) = joinset.join_next().await {
            let (server_mod_time, server_size) = joined
                .map_err(|e| JuleaError::Transport(format!("status task panicked: {e}")))??;
            mod_time = mod_time.max(server_mod_time);
            size += server_size;
        }
        Ok((mod_time, size))
    }

    /// Fan out a no-body request (create/delete/sync) to every configured
    /// object server, AND-reducing success.
    async fn fan_out_to_all_servers(&self, op_type: OpType) -> Result<bool> {
        let server_count = self.server_count();
        if server_count == 0 {
            return Err(JuleaError::Config("no object servers configured".into()));
        }
        let mut joinset: JoinSet<Result<bool>> = JoinSet::new();
        for server_idx in 0..server_count {
            let context = self.context.clone();
            let namespace = self.namespace.clone();
            let name = self.name.clone();
            joinset.spawn(async move {
                let mut msg = Message::new(op_type, namespace.len() + name.len() + 2);
                msg.append_string(&namespace);
                msg.append_string(&name);
                if op_type == OpType::ObjectDelete {
                    msg.add_operation(name.len() + 1);
                    msg.append_string(&name);
                } else {
                    msg.add_operation(0);
                }
                run_request_reply(&context, server_idx, msg, move |reader, _op_count| {
                    if op_type == OpType::ObjectDelete {
                        Ok(reader.get_u32()? == 1)
                    } else {
                        Ok(true)
                    }
                })
                .await
            });
        }
        let mut aggregate = true;
        while let Some(joined) = joinset.join_next().await {
            let ok = joined.map_err(|e| JuleaError::Transport(format!("op task panicked: {e}")))??;
            aggregate &= ok;
        }
        Ok(aggregate)
    }

    /// Chunked, distributed write (spec §4.8). Returns the number of bytes
    /// actually written (accumulated via `atomic_add`, even under partial
    /// failure).
    pub async fn write(&self, data: &[u8], offset: u64) -> Result<u64> {
        if let Some(backend) = &self.backend {
            return backend.write(&self.namespace, &self.name, data, offset).await;
        }
        let bytes_written = Arc::new(AtomicU64::new(0));
        for (piece_offset, piece_len) in
            chunk_ranges(data.len() as u64, offset, self.context.config.max_operation_size as u64)
        {
            let piece_start = (piece_offset - offset) as usize;
            let piece = &data[piece_start..piece_start + piece_len as usize];
            // Partial writes are reported honestly via the byte-count sum
            // (spec §7 "Propagation policy"); a chunk's own boolean result
            // is not separately surfaced here.
            self.write_chunk(piece, piece_offset, &bytes_written).await?;
        }
        Ok(bytes_written.load(Ordering::SeqCst))
    }

    async fn write_chunk(
        &self,
        data: &[u8],
        offset: u64,
        bytes_written: &Arc<AtomicU64>,
    ) -> Result<bool> {
        // `distribute` walks the chunk in ascending-offset order, so the
        // payload can be sliced directly off a running cursor as each
        // sub-range is produced (spec §5: "chunks are submitted in
        // ascending-offset order").
        let mut distribution = self.distribution_template().await?;
        distribution.reset(data.len() as u64, offset);
        let mut cursor = 0usize;
        let mut per_server: HashMap<usize, Vec<(u64, u64, Bytes)>> = HashMap::new();
        while let Some(range) = distribution.distribute() {
            let len = range.sub_length as usize;
            let slice = Bytes::copy_from_slice(&data[cursor..cursor + len]);
            cursor += len;
            per_server
                .entry(range.server_idx)
                .or_default()
                .push((range.sub_length, range.sub_offset, slice));
        }

        let safety = self.semantics.safety;
        if safety == Safety::None {
            for pieces in per_server.values() {
                for (len, ..) in pieces {
                    bytes_written.fetch_add(*len, Ordering::SeqCst);
                }
            }
        }

        let mut joinset: JoinSet<Result<(bool, u64)>> = JoinSet::new();
        for (server_idx, pieces) in per_server {
            let context = self.context.clone();
            let namespace = self.namespace.clone();
            let name = self.name.clone();
            let semantics = self.semantics;
            joinset.spawn(async move {
                write_to_server(context, namespace, name, semantics, server_idx, pieces).await
            });
        }

        let mut overall_ok = true;
        while let Some(joined) = joinset.join_next().await {
            let (ok, written) =
                joined.map_err(|e| JuleaError::Transport(format!("write task panicked: {e}")))??;
            overall_ok &= ok;
            if safety != Safety::None {
                bytes_written.fetch_add(written, Ordering::SeqCst);
            }
        }
        Ok(overall_ok)
    }

    /// Chunked, distributed read (spec §4.8, symmetric to `write`).
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> Result<u64> {
        if let Some(backend) = &self.backend {
            return backend.read(&self.namespace, &self.name, buf, offset).await;
        }
        let bytes_read = Arc::new(AtomicU64::new(0));
        for (piece_offset, piece_len) in
            chunk_ranges(buf.len() as u64, offset, self.context.config.max_operation_size as u64)
        {
            let piece_start = (piece_offset - offset) as usize;
            self.read_chunk(
                &mut buf[piece_start..piece_start + piece_len as usize],
                piece_offset,
                &bytes_read,
            )
            .await?;
        }
        Ok(bytes_read.load(Ordering::SeqCst))
    }

    async fn read_chunk(&self, buf: &mut [u8], offset: u64, bytes_read: &Arc<AtomicU64>) -> Result<()> {
        let mut distribution = self.distribution_template().await?;
        distribution.reset(buf.len() as u64, offset);

        // `(server_idx, sub_length, sub_offset, slot_in_buf)` in delivery
        // order, so replies can be copied back into the right spot.
        let mut plan: Vec<(usize, u64, u64, usize)> = Vec::new();
        let mut cursor = 0usize;
        while let Some(range) = distribution.distribute() {
            plan.push((range.server_idx, range.sub_length, range.sub_offset, cursor));
            cursor += range.sub_length as usize;
        }

        let mut per_server: HashMap<usize, Vec<(u64, u64, usize)>> = HashMap::new();
        for (server_idx, len, off, slot) in plan {
            per_server.entry(server_idx).or_default().push((len, off, slot));
        }

        let mut joinset: JoinSet<Result<Vec<(usize, Vec<u8>)>>> = JoinSet::new();
        for (server_idx, pieces) in per_server {
            let context = self.context.clone();
            let namespace = self.namespace.clone();
            let name = self.name.clone();
            joinset.spawn(async move {
                read_from_server(context, namespace, name, server_idx, pieces).await
            });
        }

        while let Some(joined) = joinset.join_next().await {
            let slots =
                joined.map_err(|e| JuleaError::Transport(format!("read task panicked: {e}")))??;
            // One server may own several non-contiguous slots when a
            // distribution wraps around more than one full stripe cycle
            // (e.g. round-robin covering several blocks per server), so each
            // piece must be copied back to its own slot independently.
            for (slot, data) in slots {
                buf[slot..slot + data.len()].copy_from_slice(&data);
                bytes_read.fetch_add(data.len() as u64, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Sends one request message to `server_idx`'s pool, optionally waits for a
/// reply and decodes it with `decode`. Drops the connection instead of
/// returning it to the pool on any transport error (spec §4.6 `push`'s "a
/// caller that observes a transport error must drop the connection").
async fn run_request_reply<T>(
    context: &Arc<Context>,
    server_idx: usize,
    message: Message,
    decode: impl FnOnce(&mut MessageReader, u32) -> Result<T>,
) -> Result<T> {
    let mut conn = context.pool.pop(BackendType::Object, server_idx).await?;
    let wire = message.finish();
    let result = conn.send_and_receive(wire).await;
    match result {
        Ok(reply) => {
            let mut reader = MessageReader::new(&reply.body);
            let decoded = decode(&mut reader, reply.header.op_count);
            context.pool.push(BackendType::Object, server_idx, conn).await;
            decoded
        }
        Err(e) => Err(e),
    }
}

async fn write_to_server(
    context: Arc<Context>,
    namespace: String,
    name: String,
    semantics: Semantics,
    server_idx: usize,
    pieces: Vec<(u64, u64, Bytes)>,
) -> Result<(bool, u64)> {
    let mut msg = Message::new(OpType::ObjectWrite, namespace.len() + name.len() + 2);
    msg.semantics_bits = semantics.to_bits();
    msg.append_string(&namespace);
    msg.append_string(&name);
    let mut send_indices = Vec::with_capacity(pieces.len());
    for (len, off, data) in &pieces {
        // `add_send` itself counts as this sub-op's `add_operation` call
        // (spec §4.4: the RMA descriptor is appended "as a normal
        // operation"), so the length/offset fields are plain field appends
        // that piggyback on the capacity `add_send` already guarantees —
        // calling `add_operation` here too would double-count `op_count`
        // and desync a real server's per-op read loop.
        msg.append_u64(*len);
        msg.append_u64(*off);
        let idx = msg.add_send(data.clone(), None);
        send_indices.push(idx);
    }

    let mut conn = context.pool.pop(BackendType::Object, server_idx).await?;
    for idx in &send_indices {
        let data = pieces[*idx].2.clone();
        let handle = conn.rma_register(BytesMut::from(&data[..]));
        let descriptor = conn
            .memory_get_id(handle)
            .expect("just-registered handle must resolve");
        msg.patch_rma_descriptor(*idx, descriptor);
    }

    let wire = msg.finish();
    if semantics.safety == Safety::None {
        // Fire-and-forget: the caller already fabricated `bytes_written`
        // and must not block on a reply (spec §4.8 safety mapping).
        let _ = conn.send(wire).await;
        context.pool.push(BackendType::Object, server_idx, conn).await;
        return Ok((true, 0));
    }

    match conn.send_and_receive(wire).await {
        Ok(reply) => {
            let mut reader = MessageReader::new(&reply.body);
            let mut written = 0u64;
            for _ in 0..reply.header.op_count {
                written += reader.get_u64()?;
            }
            context.pool.push(BackendType::Object, server_idx, conn).await;
            Ok((true, written))
        }
        Err(_) => Ok((false, 0)),
    }
}

async fn read_from_server(
    context: Arc<Context>,
    namespace: String,
    name: String,
    server_idx: usize,
    pieces: Vec<(u64, u64, usize)>,
) -> Result<Vec<(usize, Vec<u8>)>> {
    let mut msg = Message::new(OpType::ObjectRead, namespace.len() + name.len() + 2);
    msg.append_string(&namespace);
    msg.append_string(&name);
    for (len, off, _slot) in &pieces {
        msg.add_operation(16);
        msg.append_u64(*len);
        msg.append_u64(*off);
    }

    let mut conn = context.pool.pop(BackendType::Object, server_idx).await?;
    let wire = msg.finish();
    let reply = match conn.send_and_receive(wire).await {
        Ok(reply) => reply,
        Err(e) => return Err(e),
    };
    let mut reader = MessageReader::new(&reply.body);
    let mut out = Vec::with_capacity(pieces.len());
    for (_len, _off, slot) in &pieces {
        let n = reader.get_u64()? as usize;
        out.push((*slot, reader.get_n(n)?.to_vec()));
    }
    context.pool.push(BackendType::Object, server_idx, conn).await;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_splits_into_ceil_pieces_per_spec_8_item_7() {
        let max_op = 64u64;
        let pieces = chunk_ranges((4.5 * max_op as f64) as u64, 0, max_op);
        assert_eq!(pieces.len(), 5);
        let total: u64 = pieces.iter().map(|(_, len)| *len).sum();
        assert_eq!(total, (4.5 * max_op as f64) as u64);
    }

    #[test]
    fn chunking_of_exact_multiple_has_no_remainder_piece() {
        let pieces = chunk_ranges(128, 0, 64);
        assert_eq!(pieces, vec![(0, 64), (64, 64)]);
    }

    #[test]
    fn zero_length_chunks_to_nothing() {
        assert!(chunk_ranges(0, 10, 64).is_empty());
    }

    #[tokio::test]
    async fn colocated_backend_bypasses_the_message_path() {
        let backend = Arc::new(InMemoryObjectBackend::default());
        backend.create("ns", "x").await.unwrap();
        let written = backend.write("ns", "x", b"hello", 0).await.unwrap();
        assert_eq!(written, 5);
        let mut buf = [0u8; 5];
        let read = backend.read("ns", "x", &mut buf, 0).await.unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");
        let (_, size) = backend.status("ns", "x").await.unwrap();
        assert_eq!(size, 5);
        assert!(backend.delete("ns", "x").await.unwrap());
        assert!(!backend.delete("ns", "x").await.unwrap());
    }
}
