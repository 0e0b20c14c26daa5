// tests/common/mod.rs

//! A minimal in-process fake server speaking the real wire protocol
//! (spec §6), used to exercise the client engines end-to-end instead of
//! mocking `Connection`/`ConnectionPool` directly — mirroring the teacher's
//! `tests/integration/test_helpers.rs::TestContext`, which drives a real
//! `ServerState` rather than stubbing command dispatch.
//!
//! Each spawned server is an independent storage node with its own store,
//! matching the spec's model of N independent servers each holding a
//! different slice of a striped object.

use bytes::BytesMut;
use julea_core::message::{Message, MessageReader, OpType, WireMessage};
use julea_core::semantics::{Safety, Semantics};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Default)]
struct Store {
    objects: HashMap<(String, String), Vec<u8>>,
    kv: HashMap<(String, String), Vec<u8>>,
}

/// One running fake storage node (spec §6 wire format, §4.6 handshake).
pub struct FakeServer {
    pub addr: SocketAddr,
}

/// Spawns `count` independent fake servers and returns their addresses in
/// server-index order, ready to be dropped into a `[servers]` config list.
pub async fn spawn_servers(count: usize) -> Vec<FakeServer> {
    let mut servers = Vec::with_capacity(count);
    for _ in 0..count {
        servers.push(spawn_one().await);
    }
    servers
}

async fn spawn_one() -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let store = Arc::new(Mutex::new(Store::default()));
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let store = store.clone();
            tokio::spawn(handle_connection(stream, store));
        }
    });
    FakeServer { addr }
}

pub fn servers_toml_list(servers: &[FakeServer]) -> String {
    servers
        .iter()
        .map(|s| format!("\"{}\"", s.addr))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn handle_connection(mut stream: TcpStream, store: Arc<Mutex<Store>>) {
    let mut codec = julea_core::message::MessageCodec;
    let mut buf = BytesMut::new();
    loop {
        let wire = loop {
            if let Some(w) = codec.decode(&mut buf).ok().flatten() {
                break w;
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        };
        match handle_message(&wire, &store).await {
            Some(reply) => {
                let mut out = BytesMut::new();
                if codec.encode(reply, &mut out).is_err() {
                    return;
                }
                if stream.write_all(&out).await.is_err() {
                    return;
                }
            }
            None => continue, // safety=none write: no reply is sent at all
        }
    }
}

async fn handle_message(wire: &WireMessage, store: &Arc<Mutex<Store>>) -> Option<WireMessage> {
    let Some(op_type) = OpType::from_repr(wire.header.op_type) else {
        return None;
    };
    match op_type {
        OpType::Ping => Some(handle_ping(wire)),
        OpType::ObjectCreate => Some(handle_object_create(wire, store).await),
        OpType::ObjectDelete => Some(handle_object_delete(wire, store).await),
        OpType::ObjectSync => Some(handle_object_sync(wire)),
        OpType::ObjectStatus => Some(handle_object_status(wire, store).await),
        OpType::ObjectWrite => handle_object_write(wire, store).await,
        OpType::ObjectRead => Some(handle_object_read(wire, store).await),
        OpType::KvPut => Some(handle_kv_put(wire, store).await),
        OpType::KvGet => Some(handle_kv_get(wire, store).await),
        OpType::KvDelete => Some(handle_kv_delete(wire, store).await),
        OpType::KvGetAll => Some(handle_kv_listing(wire, store, false).await),
        OpType::KvGetByPrefix => Some(handle_kv_listing(wire, store, true).await),
        OpType::KvIterate => Some(handle_kv_listing(wire, store, false).await),
    }
}

fn handle_ping(wire: &WireMessage) -> WireMessage {
    let mut reply = Message::new(OpType::Ping, 16);
    reply.id = wire.header.id;
    reply.add_operation(7);
    reply.append_string("object");
    reply.finish()
}

async fn handle_object_create(wire: &WireMessage, store: &Arc<Mutex<Store>>) -> WireMessage {
    let mut reader = MessageReader::new(&wire.body);
    let namespace = reader.get_string().unwrap();
    let name = reader.get_string().unwrap();
    store.lock().await.objects.entry((namespace, name)).or_default();
    let mut reply = Message::new(OpType::ObjectCreate, 0);
    reply.id = wire.header.id;
    reply.finish()
}

async fn handle_object_delete(wire: &WireMessage, store: &Arc<Mutex<Store>>) -> WireMessage {
    let mut reader = MessageReader::new(&wire.body);
    let namespace = reader.get_string().unwrap();
    let name = reader.get_string().unwrap();
    let _op_name = reader.get_string().unwrap();
    let existed = store
        .lock()
        .await
        .objects
        .remove(&(namespace, name))
        .is_some();
    let mut reply = Message::new(OpType::ObjectDelete, 4);
    reply.id = wire.header.id;
    reply.add_operation(4);
    reply.append_u32(if existed { 1 } else { 0 });
    reply.finish()
}

fn handle_object_sync(wire: &WireMessage) -> WireMessage {
    let mut reply = Message::new(OpType::ObjectSync, 0);
    reply.id = wire.header.id;
    reply.finish()
}

async fn handle_object_status(wire: &WireMessage, store: &Arc<Mutex<Store>>) -> WireMessage {
    let mut reader = MessageReader::new(&wire.body);
    let namespace = reader.get_string().unwrap();
    let name = reader.get_string().unwrap();
    let size = store
        .lock()
        .await
        .objects
        .get(&(namespace, name))
        .map(|v| v.len() as u64)
        .unwrap_or(0);
    let mut reply = Message::new(OpType::ObjectStatus, 16);
    reply.id = wire.header.id;
    reply.add_operation(16);
    reply.append_i64(1_700_000_000);
    reply.append_u64(size);
    reply.finish()
}

async fn handle_object_write(
    wire: &WireMessage,
    store: &Arc<Mutex<Store>>,
) -> Option<WireMessage> {
    let mut reader = MessageReader::new(&wire.body);
    let namespace = reader.get_string().unwrap();
    let name = reader.get_string().unwrap();
    let mut metas = Vec::with_capacity(wire.header.op_count as usize);
    for _ in 0..wire.header.op_count {
        let len = reader.get_u64().unwrap();
        let off = reader.get_u64().unwrap();
        let desc = reader.get_memory_id().unwrap();
        metas.push((len, off, desc));
    }
    let mut payloads = Vec::with_capacity(metas.len());
    for (_len, _off, desc) in &metas {
        payloads.push(reader.get_n(desc.size as usize).unwrap().to_vec());
    }

    {
        let mut store = store.lock().await;
        let entry = store.objects.entry((namespace, name)).or_default();
        for ((_len, off, _desc), data) in metas.iter().zip(payloads.iter()) {
            let off = *off as usize;
            if entry.len() < off + data.len() {
                entry.resize(off + data.len(), 0);
            }
            entry[off..off + data.len()].copy_from_slice(data);
        }
    }

    // Safety=none writes get no reply at all: the client never reads one
    // (spec §4.8 safety mapping), and sending one anyway would desync the
    // next request/reply pair on a reused connection.
    let semantics = Semantics::from_bits(wire.header.semantics_bits);
    if semantics.safety == Safety::None {
        return None;
    }

    let mut reply = Message::new(OpType::ObjectWrite, 8 * metas.len());
    reply.id = wire.header.id;
    for (len, _off, _desc) in &metas {
        reply.add_operation(8);
        reply.append_u64(*len);
    }
    Some(reply.finish())
}

async fn handle_object_read(wire: &WireMessage, store: &Arc<Mutex<Store>>) -> WireMessage {
    let mut reader = MessageReader::new(&wire.body);
    let namespace = reader.get_string().unwrap();
    let name = reader.get_string().unwrap();
    let mut metas = Vec::with_capacity(wire.header.op_count as usize);
    for _ in 0..wire.header.op_count {
        let len = reader.get_u64().unwrap();
        let off = reader.get_u64().unwrap();
        metas.push((len, off));
    }
    let data_store = store
        .lock()
        .await
        .objects
        .get(&(namespace, name))
        .cloned()
        .unwrap_or_default();

    let mut reply = Message::new(OpType::ObjectRead, 0);
    reply.id = wire.header.id;
    for (len, off) in metas {
        let off = off as usize;
        let len = len as usize;
        let mut slice = if off >= data_store.len() {
            Vec::new()
        } else {
            data_store[off..(off + len).min(data_store.len())].to_vec()
        };
        slice.resize(len, 0);
        reply.add_operation(8 + slice.len());
        reply.append_u64(slice.len() as u64);
        reply.append_n(&slice);
    }
    reply.finish()
}

async fn handle_kv_put(wire: &WireMessage, store: &Arc<Mutex<Store>>) -> WireMessage {
    let mut reader = MessageReader::new(&wire.body);
    let namespace = reader.get_string().unwrap();
    let key = reader.get_string().unwrap();
    let len = reader.get_u64().unwrap() as usize;
    let value = reader.get_n(len).unwrap().to_vec();
    store.lock().await.kv.insert((namespace, key), value);
    let mut reply = Message::new(OpType::KvPut, 4);
    reply.id = wire.header.id;
    reply.add_operation(4);
    reply.append_u32(1);
    reply.finish()
}

async fn handle_kv_get(wire: &WireMessage, store: &Arc<Mutex<Store>>) -> WireMessage {
    let mut reader = MessageReader::new(&wire.body);
    let namespace = reader.get_string().unwrap();
    let key = reader.get_string().unwrap();
    let value = store.lock().await.kv.get(&(namespace, key)).cloned();
    let mut reply = Message::new(OpType::KvGet, 8 + value.as_ref().map(|v| v.len()).unwrap_or(0));
    reply.id = wire.header.id;
    match value {
        Some(v) => {
            reply.add_operation(8 + v.len());
            reply.append_u64(v.len() as u64);
            reply.append_n(&v);
        }
        None => {
            reply.add_operation(8);
            reply.append_u64(0);
        }
    }
    reply.finish()
}

async fn handle_kv_delete(wire: &WireMessage, store: &Arc<Mutex<Store>>) -> WireMessage {
    let mut reader = MessageReader::new(&wire.body);
    let namespace = reader.get_string().unwrap();
    let key = reader.get_string().unwrap();
    let existed = store.lock().await.kv.remove(&(namespace, key)).is_some();
    let mut reply = Message::new(OpType::KvDelete, 4);
    reply.id = wire.header.id;
    reply.add_operation(4);
    reply.append_u32(if existed { 1 } else { 0 });
    reply.finish()
}

async fn handle_kv_listing(
    wire: &WireMessage,
    store: &Arc<Mutex<Store>>,
    by_prefix: bool,
) -> WireMessage {
    let mut reader = MessageReader::new(&wire.body);
    let namespace = reader.get_string().unwrap();
    let prefix = if wire.header.op_count > 0 && by_prefix {
        Some(reader.get_string().unwrap())
    } else {
        None
    };
    let entries: Vec<(String, Vec<u8>)> = store
        .lock()
        .await
        .kv
        .iter()
        .filter(|((ns, key), _)| {
            ns == &namespace
                && match &prefix {
                    Some(p) => key.starts_with(p.as_str()),
                    None => true,
                }
        })
        .map(|((_, key), value)| (key.clone(), value.clone()))
        .collect();

    let mut reply = Message::new(wire_op_type(wire), 0);
    reply.id = wire.header.id;
    for (name, value) in entries {
        reply.add_operation(name.len() + 1 + 8 + value.len());
        reply.append_string(&name);
        reply.append_u64(value.len() as u64);
        reply.append_n(&value);
    }
    reply.finish()
}

fn wire_op_type(wire: &WireMessage) -> OpType {
    OpType::from_repr(wire.header.op_type).unwrap()
}
