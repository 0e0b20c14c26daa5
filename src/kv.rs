// src/kv.rs

//! KV Engine (spec §4.9, C9): same skeleton as the object engine, but a key
//! routes to a single server via `hash(name) mod server_count` rather than
//! being striped.

use crate::config::BackendType;
use crate::context::Context;
use crate::errors::{JuleaError, Result};
use crate::helpers::hash;
use crate::message::{Message, MessageReader, OpType};
use std::sync::Arc;

/// A finite, non-restartable lazy sequence of `(name, bytes)` tuples (spec
/// §4.9 `iterate`). Backed by one fully-buffered reply since the wire
/// protocol returns a complete listing per request; "lazy" here means the
/// caller drives it with `next()` rather than getting a `Vec` up front.
pub struct KvIterator {
    entries: std::vec::IntoIter<(String, Vec<u8>)>,
}

impl KvIterator {
    pub fn next_entry(&mut self) -> Option<(String, Vec<u8>)> {
        self.entries.next()
    }
}

impl Iterator for KvIterator {
    type Item = (String, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

/// A namespace-scoped handle to the KV engine (spec §4.9).
pub struct KvStore {
    context: Arc<Context>,
    namespace: String,
}

impl KvStore {
    pub fn new(context: Arc<Context>, namespace: impl Into<String>) -> Self {
        Self {
            context,
            namespace: namespace.into(),
        }
    }

    fn server_count(&self) -> usize {
        self.context.config.server_count(BackendType::Kv)
    }

    /// `index = hash(name) mod server_count` (spec §4.9).
    fn route(&self, key: &str) -> Result<usize> {
        let server_count = self.server_count();
        if server_count == 0 {
            return Err(JuleaError::Config("no kv servers configured".into()));
        }
        Ok((hash(key) as usize) % server_count)
    }

    async fn request_reply(&self, server_idx: usize, message: Message) -> Result<crate::message::WireMessage> {
        let mut conn = self.context.pool.pop(BackendType::Kv, server_idx).await?;
        let wire = message.finish();
        match conn.send_and_receive(wire).await {
            Ok(reply) => {
                self.context.pool.push(BackendType::Kv, server_idx, conn).await;
                Ok(reply)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<bool> {
        let server_idx = self.route(key)?;
        let mut msg = Message::new(OpType::KvPut, self.namespace.len() + key.len() + value.len() + 16);
        msg.append_string(&self.namespace);
        msg.add_operation(key.len() + 1 + 8 + value.len());
        msg.append_string(key);
        msg.append_u64(value.len() as u64);
        msg.append_n(value);
        let reply = self.request_reply(server_idx, msg).await?;
        let mut reader = MessageReader::new(&reply.body);
        Ok(reader.get_u32()? == 1)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let server_idx = self.route(key)?;
        let mut msg = Message::new(OpType::KvGet, self.namespace.len() + key.len() + 2);
        msg.append_string(&self.namespace);
        msg.add_operation(key.len() + 1);
        msg.append_string(key);
        let reply = self.request_reply(server_idx, msg).await?;
        let mut reader = MessageReader::new(&reply.body);
        let len = reader.get_u64()? as usize;
        if len == 0 && reader.remaining() == 0 {
            return Ok(None);
        }
        Ok(Some(reader.get_n(len)?.to_vec()))
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let server_idx = self.route(key)?;
        let mut msg = Message::new(OpType::KvDelete, self.namespace.len() + key.len() + 2);
        msg.append_string(&self.namespace);
        msg.add_operation(key.len() + 1);
        msg.append_string(key);
        let reply = self.request_reply(server_idx, msg).await?;
        let mut reader = MessageReader::new(&reply.body);
        Ok(reader.get_u32()? == 1)
    }

    /// Fans out to every configured KV server (there is no single owner for
    /// "all entries in a namespace") and merges the results.
    pub async fn get_all(&self) -> Result<KvIterator> {
        self.fan_out_listing(OpType::KvGetAll, None).await
    }

    pub async fn get_by_prefix(&self, prefix: &str) -> Result<KvIterator> {
        self.fan_out_listing(OpType::KvGetByPrefix, Some(prefix)).await
    }

    async fn fan_out_listing(&self, op_type: OpType, prefix: Option<&str>) -> Result<KvIterator> {
        let server_count = self.server_count();
        if server_count == 0 {
            return Err(JuleaError::Config("no kv servers configured".into()));
        }
        let mut entries = Vec::new();
        let mut joinset = tokio::task::JoinSet::new();
        for server_idx in 0..server_count {
            let context = self.context.clone();
            let namespace = self.namespace.clone();
            let prefix = prefix.map(|s| s.to_string());
            joinset.spawn(async move {
                let mut msg = Message::new(op_type, namespace.len() + 2);
                msg.append_string(&namespace);
                if let Some(prefix) = &prefix {
                    msg.add_operation(prefix.len() + 1);
                    msg.append_string(prefix);
                } else {
                    msg.add_operation(0);
                }
                let mut conn = context.pool.pop(BackendType::Kv, server_idx).await?;
                let reply = conn.send_and_receive(msg.finish()).await?;
                context.pool.push(BackendType::Kv, server_idx, conn).await;
                let mut reader = MessageReader::new(&reply.body);
                let mut server_entries = Vec::with_capacity(reply.header.op_count as usize);
                for _ in 0..reply.header.op_count {
                    let name = reader.get_string()?;
                    let len = reader.get_u64()? as usize;
                    let value = reader.get_n(len)?.to_vec();
                    server_entries.push((name, value));
                }
                Ok::<_, JuleaError>(server_entries)
            });
        }
        while let Some(joined) = joinset.join_next().await {
            let server_entries =
                joined.map_err(|e| JuleaError::Transport(format!("listing task panicked: {e}")))??;
            entries.extend(server_entries);
        }
        Ok(KvIterator {
            entries: entries.into_iter(),
        })
    }

    /// `iterate(iter) -> (name, value, len)` (spec §4.9): this crate exposes
    /// the iterator as a plain finite, non-restartable Rust iterator rather
    /// than a caller-supplied cursor value — `KvIterator::next_entry`.
    pub async fn iterate(&self) -> Result<KvIterator> {
        self.fan_out_listing(OpType::KvIterate, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_stable_and_in_range() {
        let h1 = hash("k1");
        let h2 = hash("k2");
        for server_count in [1usize, 2, 3, 7] {
            assert!((h1 as usize) % server_count < server_count);
            assert!((h2 as usize) % server_count < server_count);
        }
    }
}
