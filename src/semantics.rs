// src/semantics.rs

//! An immutable value over the seven semantics axes (spec §2 C2, §4.2).
//!
//! A `Semantics` value is serialized into a single bit-packed `u32` that is
//! stamped into every message header (spec §6). Each axis claims a fixed
//! sub-range of bits; an axis value that doesn't fit its enum's known
//! discriminants on decode falls back to that axis's default, matching the
//! "unspecified packed value yields the default template" rule in §4.2.

use strum_macros::{EnumIter, FromRepr};

/// Per-batch atomicity granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, FromRepr)]
#[repr(u32)]
pub enum Atomicity {
    #[default]
    Batch = 0,
    Operation = 1,
}

/// Whether overlapping operations on the same object may run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, FromRepr)]
#[repr(u32)]
pub enum Concurrency {
    #[default]
    Overlapping = 0,
    NonOverlapping = 1,
}

/// How fresh a read must be relative to a prior write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, FromRepr)]
#[repr(u32)]
pub enum Consistency {
    #[default]
    Immediate = 0,
    Eventual = 1,
}

/// Cross-connection ordering guarantee (spec §5 "Ordering guarantees").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, FromRepr)]
#[repr(u32)]
pub enum Ordering {
    #[default]
    Relaxed = 0,
    SemiRelaxed = 1,
    /// Pins every operation in a batch to one connection per object.
    Strict = 2,
}

/// When a write is considered durable enough to report success locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, FromRepr)]
#[repr(u32)]
pub enum Persistency {
    #[default]
    Immediate = 0,
    Eventual = 1,
    None = 2,
}

/// When a write RPC is acknowledged (spec §4.8 "Safety mapping").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, FromRepr)]
#[repr(u32)]
pub enum Safety {
    None = 0,
    #[default]
    Network = 1,
    Storage = 2,
}

/// Whether traffic on this batch's connections must be authenticated/secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, FromRepr)]
#[repr(u32)]
pub enum Security {
    #[default]
    None = 0,
    Strict = 1,
}

macro_rules! axis {
    ($shift:expr, $bits:expr) => {
        ($shift, (1u32 << $bits) - 1)
    };
}

// (bit_shift, value_mask) per axis, packed low-to-high with no overlap.
const ATOMICITY: (u32, u32) = axis!(0, 1);
const CONCURRENCY: (u32, u32) = axis!(1, 1);
const CONSISTENCY: (u32, u32) = axis!(2, 1);
const ORDERING: (u32, u32) = axis!(3, 2);
const PERSISTENCY: (u32, u32) = axis!(5, 2);
const SAFETY: (u32, u32) = axis!(7, 2);
const SECURITY: (u32, u32) = axis!(9, 1);

fn pack(shift_mask: (u32, u32), value: u32) -> u32 {
    (value & shift_mask.1) << shift_mask.0
}

fn unpack(shift_mask: (u32, u32), bits: u32) -> u32 {
    (bits >> shift_mask.0) & shift_mask.1
}

/// A fully-specified choice on all seven semantics axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Semantics {
    pub atomicity: Atomicity,
    pub concurrency: Concurrency,
    pub consistency: Consistency,
    pub ordering: Ordering,
    pub persistency: Persistency,
    pub safety: Safety,
    pub security: Security,
}

impl Semantics {
    /// The built-in default template: the `Default` of every axis.
    pub fn default_template() -> Self {
        Self::default()
    }

    /// Packs this value into the 32-bit wire representation (spec §4.2, §6).
    pub fn to_bits(self) -> u32 {
        pack(ATOMICITY, self.atomicity as u32)
            | pack(CONCURRENCY, self.concurrency as u32)
            | pack(CONSISTENCY, self.consistency as u32)
            | pack(ORDERING, self.ordering as u32)
            | pack(PERSISTENCY, self.persistency as u32)
            | pack(SAFETY, self.safety as u32)
            | pack(SECURITY, self.security as u32)
    }

    /// Unpacks a wire representation, falling back per-axis to the default
    /// template for any bit pattern that doesn't name a known variant.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            atomicity: Atomicity::from_repr(unpack(ATOMICITY, bits)).unwrap_or_default(),
            concurrency: Concurrency::from_repr(unpack(CONCURRENCY, bits)).unwrap_or_default(),
            consistency: Consistency::from_repr(unpack(CONSISTENCY, bits)).unwrap_or_default(),
            ordering: Ordering::from_repr(unpack(ORDERING, bits)).unwrap_or_default(),
            persistency: Persistency::from_repr(unpack(PERSISTENCY, bits)).unwrap_or_default(),
            safety: Safety::from_repr(unpack(SAFETY, bits)).unwrap_or_default(),
            security: Security::from_repr(unpack(SECURITY, bits)).unwrap_or_default(),
        }
    }
}
