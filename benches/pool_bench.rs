// benches/pool_bench.rs

//! Benchmarks a `pop`/`push` cycle against the connection pool, backed by a
//! local in-process echo server that answers the `PING` handshake.

use bytes::BytesMut;
use criterion::{Criterion, criterion_group, criterion_main};
use julea_core::config::{BackendType, Configuration};
use julea_core::context::Context;
use julea_core::message::{Message, MessageReader, OpType};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio_util::codec::{Decoder, Encoder};

async fn spawn_fake_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
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
                    let mut reader = MessageReader::new(&wire.body);
                    let _program = reader.get_string();
                    let mut reply = Message::new(OpType::Ping, 0);
                    reply.id = wire.header.id;
                    reply.add_operation(8);
                    reply.append_string("memory");
                    let reply_wire = reply.finish();
                    let mut out = BytesMut::new();
                    codec.encode(reply_wire, &mut out).ok();
                    if tokio::io::AsyncWriteExt::write_all(&mut stream, &out)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });
    addr
}

fn bench_pool_pop_push(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (context, _addr) = rt.block_on(async {
        let addr = spawn_fake_server().await;
        let toml = format!(
            "[servers]\nobject = [\"{addr}\"]\n[clients]\nmax-connections = 4\n"
        );
        let config = Configuration::from_toml_str(&toml).unwrap();
        (std::sync::Arc::new(Context::new(config)), addr)
    });

    c.bench_function("pool_pop_push_cycle", |b| {
        b.to_async(&rt).iter(|| {
            let context = context.clone();
            async move {
                let conn = context.pool.pop(BackendType::Object, 0).await.unwrap();
                context.pool.push(BackendType::Object, 0, conn).await;
            }
        });
    });
}

criterion_group!(benches, bench_pool_pop_push);
criterion_main!(benches);
