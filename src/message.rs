// src/message.rs

//! The framed wire PDU (spec §2 C4, §3 "Message", §4.4, §6).
//!
//! A `Message` is a 20-byte little-endian header followed by a body of
//! concatenated, typed sub-operations, plus an out-of-band list of
//! zero-copy send buffers registered for one-sided RMA reads. The shape
//! mirrors the teacher's `RespFrame` + `RespFrameCodec` split (a plain data
//! type plus a `tokio_util::codec::{Encoder, Decoder}` pair) but the wire
//! format itself is JULEA's fixed binary header, not RESP.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::JuleaError;

/// Size in bytes of the fixed message header (spec §6).
pub const HEADER_LEN: usize = 20;

/// Minimum body capacity reserved by `Message::new` (spec §4.4).
const MIN_CAPACITY: usize = 256;

/// Size in bytes of an inline RMA descriptor (`u64 addr, u64 size, u64 key`),
/// per the literal field list in spec §6. (§3's prose calls this "16-byte";
/// resolved in favor of §6's explicit three-`u64` wire layout — see
/// DESIGN.md.)
pub const RMA_DESCRIPTOR_LEN: usize = 24;

/// The operation carried by a message (spec §6 `op_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::FromRepr)]
#[repr(u32)]
pub enum OpType {
    ObjectCreate = 0,
    ObjectDelete = 1,
    ObjectRead = 2,
    ObjectWrite = 3,
    ObjectStatus = 4,
    ObjectSync = 5,
    Ping = 6,
    KvPut = 7,
    KvGet = 8,
    KvDelete = 9,
    KvGetAll = 10,
    KvGetByPrefix = 11,
    KvIterate = 12,
}

/// A registered one-sided-read descriptor (spec §3 "RMA buffer descriptor",
/// §6). Keys are assigned monotonically per connection starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaDescriptor {
    pub addr: u64,
    pub size: u64,
    pub key: u64,
}

impl RmaDescriptor {
    pub fn encode(self) -> [u8; RMA_DESCRIPTOR_LEN] {
        let mut buf = [0u8; RMA_DESCRIPTOR_LEN];
        buf[0..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.key.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RMA_DESCRIPTOR_LEN {
            return None;
        }
        Some(Self {
            addr: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            size: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            key: u64::from_le_bytes(buf[16..24].try_into().ok()?),
        })
    }
}

/// A side-buffer queued via `add_send`: not copied into the body at
/// construction time. A placeholder is reserved in the body (its
/// `descriptor_offset`) so the connection can later register the buffer for
/// RMA and patch the real descriptor in just before the header+body go out
/// on the wire (spec §4.4 "Large side-data").
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub data: Bytes,
    pub inline_header: Option<Bytes>,
    pub descriptor_offset: usize,
}

/// A framed wire PDU (spec §3 "Message").
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u32,
    pub semantics_bits: u32,
    pub op_type: OpType,
    op_count: u32,
    body: BytesMut,
    send_list: Vec<PendingSend>,
}

impl Message {
    /// Starts construction with a capacity hint; `max(256, hint_len)` bytes
    /// are reserved up front (spec §4.4).
    pub fn new(op_type: OpType, hint_len: usize) -> Self {
        let capacity = hint_len.max(MIN_CAPACITY);
        Self {
            id: rand::thread_rng().r#gen(),
            semantics_bits: 0,
            op_type,
            op_count: 0,
            body: BytesMut::with_capacity(capacity),
            send_list: Vec::new(),
        }
    }

    /// Builds a reply with the same `id` and `op_type` as `request` (spec
    /// §3 "A reply message carries the same id and op_type as its request").
    pub fn new_reply(request: &Message, hint_len: usize) -> Self {
        let mut reply = Self::new(request.op_type, hint_len);
        reply.id = request.id;
        reply
    }

    pub fn op_count(&self) -> u32 {
        self.op_count
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    pub fn send_list(&self) -> &[PendingSend] {
        &self.send_list
    }

    /// Arithmetic growth factor from spec §3: `max(1, 10^floor(log10(op_count)))`.
    fn growth_factor(&self) -> usize {
        if self.op_count == 0 {
            1
        } else {
            10usize.pow((self.op_count as f64).log10().floor() as u32)
        }
    }

    /// Ensures `additional` more bytes fit, reallocating by the growth
    /// factor to amortize cost under many appends (spec §3, §4.4).
    fn reserve_for(&mut self, additional: usize) {
        if self.body.capacity() - self.body.len() >= additional {
            return;
        }
        let growth = self.growth_factor();
        self.body.reserve(additional * growth);
    }

    /// Marks the start of one sub-operation, reserving capacity for its
    /// fields. Each call increments `op_count` exactly once — per the
    /// invariant in spec §3, `op_count` tracks `add_operation` calls, not
    /// raw `append_*` calls.
    pub fn add_operation(&mut self, op_len: usize) {
        self.reserve_for(op_len);
        self.op_count += 1;
    }

    fn can_append(&self, n: usize) -> bool {
        self.body.len() + n <= self.body.capacity()
    }

    fn ensure_appendable(&mut self, n: usize) {
        if !self.can_append(n) {
            self.reserve_for(n);
        }
    }

    pub fn append_u8(&mut self, v: u8) {
        self.ensure_appendable(1);
        self.body.put_u8(v);
    }

    pub fn append_u32(&mut self, v: u32) {
        self.ensure_appendable(4);
        self.body.put_u32_le(v);
    }

    pub fn append_u64(&mut self, v: u64) {
        self.ensure_appendable(8);
        self.body.put_u64_le(v);
    }

    pub fn append_i64(&mut self, v: i64) {
        self.ensure_appendable(8);
        self.body.put_i64_le(v);
    }

    pub fn append_n(&mut self, data: &[u8]) {
        self.ensure_appendable(data.len());
        self.body.put_slice(data);
    }

    /// Appends a NUL-terminated string.
    pub fn append_string(&mut self, s: &str) {
        self.ensure_appendable(s.len() + 1);
        self.body.put_slice(s.as_bytes());
        self.body.put_u8(0);
    }

    fn pad_to_8(&mut self) {
        let rem = self.body.len() % 8;
        if rem != 0 {
            let pad = 8 - rem;
            self.ensure_appendable(pad);
            self.body.put_bytes(0, pad);
        }
    }

    /// Appends an 8-byte-aligned memory id (zero-padded before it, spec
    /// §4.4 "Reading primitives").
    pub fn append_memory_id(&mut self, id: RmaDescriptor) {
        self.pad_to_8();
        self.ensure_appendable(RMA_DESCRIPTOR_LEN);
        self.body.put_slice(&id.encode());
    }

    /// Queues a zero-copy side-buffer (spec §4.4 "Large side-data"). The
    /// buffer itself is never copied into the body; a placeholder for its
    /// eventual RMA descriptor is reserved and patched by the connection at
    /// send time (`patch_rma_descriptor`). Packs `header` by value if it's
    /// no larger than a pointer (8 bytes on 64-bit), else by reference — the
    /// caller keeps it alive until send completes either way since `Bytes`
    /// is refcounted.
    pub fn add_send(&mut self, data: Bytes, header: Option<Bytes>) -> usize {
        self.pad_to_8();
        if let Some(h) = &header {
            self.ensure_appendable(h.len());
            self.body.put_slice(h);
        }
        self.ensure_appendable(RMA_DESCRIPTOR_LEN);
        let descriptor_offset = self.body.len();
        self.body.put_bytes(0, RMA_DESCRIPTOR_LEN);
        self.op_count += 1;
        let idx = self.send_list.len();
        self.send_list.push(PendingSend {
            data,
            inline_header: header,
            descriptor_offset,
        });
        idx
    }

    /// Backfills the reserved placeholder for `add_send` index `idx` with
    /// the real descriptor once the connection has registered the buffer.
    pub fn patch_rma_descriptor(&mut self, idx: usize, descriptor: RmaDescriptor) {
        let offset = self.send_list[idx].descriptor_offset;
        self.body[offset..offset + RMA_DESCRIPTOR_LEN].copy_from_slice(&descriptor.encode());
    }

    pub fn into_parts(self) -> (Bytes, Vec<PendingSend>) {
        (self.body.freeze(), self.send_list)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Sequential reader over a message body (spec §4.4 "Reading primitives").
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pub pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn check(&self, n: usize) -> Result<(), JuleaError> {
        if self.pos + n > self.buf.len() {
            Err(JuleaError::Protocol("truncated message body".into()))
        } else {
            Ok(())
        }
    }

    pub fn get_u8(&mut self) -> Result<u8, JuleaError> {
        self.check(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_u32(&mut self) -> Result<u32, JuleaError> {
        self.check(4)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn get_u64(&mut self) -> Result<u64, JuleaError> {
        self.check(8)?;
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    pub fn get_i64(&mut self) -> Result<i64, JuleaError> {
        self.check(8)?;
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    pub fn get_n(&mut self, n: usize) -> Result<&'a [u8], JuleaError> {
        self.check(n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_string(&mut self) -> Result<String, JuleaError> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos] != 0 {
            self.pos += 1;
        }
        self.check(1)?; // the NUL terminator itself
        let s = String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned();
        self.pos += 1; // skip NUL
        Ok(s)
    }

    fn skip_pad_to_8(&mut self) {
        let rem = self.pos % 8;
        if rem != 0 {
            self.pos += 8 - rem;
        }
    }

    pub fn get_memory_id(&mut self) -> Result<RmaDescriptor, JuleaError> {
        self.skip_pad_to_8();
        let bytes = self.get_n(RMA_DESCRIPTOR_LEN)?;
        RmaDescriptor::decode(bytes).ok_or_else(|| JuleaError::Protocol("bad RMA descriptor".into()))
    }
}

/// The 20-byte fixed header (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u32,
    pub id: u32,
    pub semantics_bits: u32,
    pub op_type: u32,
    pub op_count: u32,
}

impl Header {
    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.semantics_bits.to_le_bytes());
        buf[12..16].copy_from_slice(&self.op_type.to_le_bytes());
        buf[16..20].copy_from_slice(&self.op_count.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            length: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            id: u32::from_le_bytes(buf[4..8].try_into().ok()?),
            semantics_bits: u32::from_le_bytes(buf[8..12].try_into().ok()?),
            op_type: u32::from_le_bytes(buf[12..16].try_into().ok()?),
            op_count: u32::from_le_bytes(buf[16..20].try_into().ok()?),
        })
    }
}

/// A fully-framed message ready to place on (or just taken off) the wire:
/// header plus the body bytes, with any pending RMA sends already patched
/// in by the connection.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub header: Header,
    pub body: Bytes,
}

impl Message {
    /// Finalizes this message into a `WireMessage`. All `add_send` slots
    /// must have been patched via `patch_rma_descriptor` first.
    ///
    /// There is no one-sided RDMA transport in this corpus for a peer to
    /// pull a registered buffer through, so each `add_send` payload is
    /// appended to the body's tail here, in registration order, right
    /// behind its already-patched descriptor placeholder. The descriptor
    /// still carries a real `size`/`key` (spec §6's literal field layout),
    /// but the bytes a reader needs are the ones inlined at the tail, not
    /// ones fetched back out through `Connection::rma_read` — see
    /// DESIGN.md, "RMA over two-sided transport".
    pub fn finish(self) -> WireMessage {
        let id = self.id;
        let op_type = self.op_type as u32;
        let op_count = self.op_count;
        let semantics_bits = self.semantics_bits;
        let mut body = self.body;
        for pending in &self.send_list {
            body.extend_from_slice(&pending.data);
        }
        let body = body.freeze();
        WireMessage {
            header: Header {
                length: body.len() as u32,
                id,
                semantics_bits,
                op_type,
                op_count,
            },
            body,
        }
    }
}

/// `tokio_util::codec::{Encoder, Decoder}` pair for `WireMessage`, mirroring
/// the teacher's `RespFrameCodec` (spec §4.4/§6: header-then-body framing).
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Encoder<WireMessage> for MessageCodec {
    type Error = JuleaError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.header.encode());
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = WireMessage;
    type Error = JuleaError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::decode(&src[..HEADER_LEN])
            .ok_or_else(|| JuleaError::Protocol("malformed header".into()))?;
        let total = HEADER_LEN + header.length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(total);
        frame.advance(HEADER_LEN);
        Ok(Some(WireMessage {
            header,
            body: frame.freeze(),
        }))
    }
}
