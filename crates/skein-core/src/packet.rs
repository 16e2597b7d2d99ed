//! The packet (§3, §4.2): a refcounted dataflow unit with payload,
//! properties, timing, and a bit-packed flag word.

use bytes::Bytes;
use std::sync::{Arc, Mutex};

use skein_common::reservoir::Reservoir;

use crate::property::PropertyMap;

/// SAP (stream access point) type, 0–4, packed into 3 bits of the flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SapType {
    None = 0,
    Type1 = 1,
    Type2 = 2,
    Type3 = 3,
    Type4 = 4,
}

impl SapType {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => SapType::Type1,
            2 => SapType::Type2,
            3 => SapType::Type3,
            4 => SapType::Type4,
            _ => SapType::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterlacedKind {
    Progressive = 0,
    TopFieldFirst = 1,
    BottomFieldFirst = 2,
}

impl InterlacedKind {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => InterlacedKind::TopFieldFirst,
            2 => InterlacedKind::BottomFieldFirst,
            _ => InterlacedKind::Progressive,
        }
    }
}

/// What command, if any, this packet carries instead of (or alongside) data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandKind {
    None = 0,
    PidEos = 1,
    PidRemove = 2,
}

impl CommandKind {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => CommandKind::PidEos,
            2 => CommandKind::PidRemove,
            _ => CommandKind::None,
        }
    }
}

const BIT_BLOCK_START: u32 = 1 << 0;
const BIT_BLOCK_END: u32 = 1 << 1;
const BIT_CORRUPTED: u32 = 1 << 2;
const BIT_SEEK: u32 = 1 << 3;
const SAP_SHIFT: u32 = 4;
const SAP_MASK: u32 = 0b111 << SAP_SHIFT;
const INTERLACED_SHIFT: u32 = 7;
const INTERLACED_MASK: u32 = 0b11 << INTERLACED_SHIFT;
const BIT_CLOCK_REFERENCE: u32 = 1 << 9;
const BIT_ENCRYPTED: u32 = 1 << 10;
const COMMAND_SHIFT: u32 = 11;
const COMMAND_MASK: u32 = 0b11 << COMMAND_SHIFT;
const BIT_FORCE_MAIN_THREAD: u32 = 1 << 13;
const BIT_LEADING: u32 = 1 << 14;
const BIT_DEPENDS_ON: u32 = 1 << 15;
const BIT_DEPENDED_ON: u32 = 1 << 16;
const BIT_REDUNDANT: u32 = 1 << 17;

/// The packed flag word (§3): block-start/end, corruption, seek, SAP type,
/// interlaced kind, clock-reference, crypt state, command kind, main-thread
/// affinity, and the leading/depends-on/depended-on/redundant hints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u32);

impl PacketFlags {
    pub fn new() -> Self {
        Self(0)
    }

    fn set_bit(&mut self, bit: u32, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn block_start(&self) -> bool {
        self.0 & BIT_BLOCK_START != 0
    }
    pub fn set_block_start(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_BLOCK_START, v);
        self
    }
    pub fn block_end(&self) -> bool {
        self.0 & BIT_BLOCK_END != 0
    }
    pub fn set_block_end(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_BLOCK_END, v);
        self
    }
    pub fn corrupted(&self) -> bool {
        self.0 & BIT_CORRUPTED != 0
    }
    pub fn set_corrupted(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_CORRUPTED, v);
        self
    }
    pub fn seek(&self) -> bool {
        self.0 & BIT_SEEK != 0
    }
    pub fn set_seek(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_SEEK, v);
        self
    }
    pub fn sap_type(&self) -> SapType {
        SapType::from_bits((self.0 & SAP_MASK) >> SAP_SHIFT)
    }
    pub fn set_sap_type(&mut self, sap: SapType) -> &mut Self {
        self.0 = (self.0 & !SAP_MASK) | ((sap as u32) << SAP_SHIFT);
        self
    }
    pub fn interlaced_kind(&self) -> InterlacedKind {
        InterlacedKind::from_bits((self.0 & INTERLACED_MASK) >> INTERLACED_SHIFT)
    }
    pub fn set_interlaced_kind(&mut self, kind: InterlacedKind) -> &mut Self {
        self.0 = (self.0 & !INTERLACED_MASK) | ((kind as u32) << INTERLACED_SHIFT);
        self
    }
    pub fn clock_reference(&self) -> bool {
        self.0 & BIT_CLOCK_REFERENCE != 0
    }
    pub fn set_clock_reference(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_CLOCK_REFERENCE, v);
        self
    }
    pub fn encrypted(&self) -> bool {
        self.0 & BIT_ENCRYPTED != 0
    }
    pub fn set_encrypted(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_ENCRYPTED, v);
        self
    }
    pub fn command_kind(&self) -> CommandKind {
        CommandKind::from_bits((self.0 & COMMAND_MASK) >> COMMAND_SHIFT)
    }
    pub fn set_command_kind(&mut self, kind: CommandKind) -> &mut Self {
        self.0 = (self.0 & !COMMAND_MASK) | ((kind as u32) << COMMAND_SHIFT);
        self
    }
    pub fn force_main_thread(&self) -> bool {
        self.0 & BIT_FORCE_MAIN_THREAD != 0
    }
    pub fn set_force_main_thread(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_FORCE_MAIN_THREAD, v);
        self
    }
    pub fn leading(&self) -> bool {
        self.0 & BIT_LEADING != 0
    }
    pub fn set_leading(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_LEADING, v);
        self
    }
    pub fn depends_on(&self) -> bool {
        self.0 & BIT_DEPENDS_ON != 0
    }
    pub fn set_depends_on(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_DEPENDS_ON, v);
        self
    }
    pub fn depended_on(&self) -> bool {
        self.0 & BIT_DEPENDED_ON != 0
    }
    pub fn set_depended_on(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_DEPENDED_ON, v);
        self
    }
    pub fn redundant(&self) -> bool {
        self.0 & BIT_REDUNDANT != 0
    }
    pub fn set_redundant(&mut self, v: bool) -> &mut Self {
        self.set_bit(BIT_REDUNDANT, v);
        self
    }
}

/// A callback-object payload, for zero-copy frame delivery (e.g. a decoder
/// surface handle). Out-of-scope filters implement this; the engine only
/// stores and forwards the handle.
pub trait FrameInterface: Send + Sync {
    fn get_plane(&self, plane_idx: usize) -> Option<&[u8]>;
}

/// The packet payload, one of the four kinds named in §3.
pub enum Payload {
    /// Owned bytes, allocated from the producer's reservoir.
    Owned(Bytes),
    /// Borrowed from the filter's internal store; `release` runs when the
    /// last reference is dropped.
    Shared(Bytes),
    /// Shares another packet's payload and metadata timing base.
    Ref(Arc<Packet>),
    FrameInterface(Arc<dyn FrameInterface>),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Owned(b) => write!(f, "Owned({} bytes)", b.len()),
            Payload::Shared(b) => write!(f, "Shared({} bytes)", b.len()),
            Payload::Ref(_) => write!(f, "Ref(..)"),
            Payload::FrameInterface(_) => write!(f, "FrameInterface(..)"),
        }
    }
}

/// Timing and sequencing metadata carried alongside the payload (§3).
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketInfo {
    pub dts: Option<u64>,
    pub cts: Option<u64>,
    pub duration: u32,
    pub byte_offset: Option<u64>,
    pub sequence_number: u64,
    pub roll_distance: i16,
    pub carousel_version: u32,
}

/// A reference-counted dataflow unit (§3). Kept as `Arc<Packet>` so every
/// destination pid-instance's own clone IS the "packet-instance refcount"
/// described in §4.2 — the source packet is released exactly when the
/// last `Arc` (producer's plus every destination's) drops.
#[derive(Debug)]
pub struct Packet {
    pub payload: Payload,
    pub source_pid: usize,
    pub props: Arc<PropertyMap>,
    pub info: PacketInfo,
    pub flags: PacketFlags,
    /// The reservoir an `Owned` payload's buffer was drawn from, if any;
    /// `Drop` returns the buffer here instead of letting it go back to the
    /// allocator. `None` for every other payload kind and for packets built
    /// directly from caller-supplied bytes (`new_shared`).
    pool: Option<Arc<Mutex<Reservoir<Vec<u8>>>>>,
}

impl Packet {
    /// Allocates an owned, zeroed buffer of `size` bytes, drawing it from
    /// `pool` when a released buffer is available (§4.2 "pooled per filter
    /// through a reservoir to avoid malloc storms") rather than always
    /// going to the allocator.
    pub fn new_alloc(pool: &Arc<Mutex<Reservoir<Vec<u8>>>>, source_pid: usize, props: Arc<PropertyMap>, size: usize) -> Self {
        let reused = {
            let mut reservoir = pool.lock().unwrap();
            let handle = reservoir.iter().next().map(|(h, _)| h);
            handle.and_then(|h| reservoir.remove(h))
        };
        let mut buf = reused.unwrap_or_default();
        buf.clear();
        buf.resize(size, 0);
        Packet {
            payload: Payload::Owned(Bytes::from(buf)),
            source_pid,
            props,
            info: PacketInfo::default(),
            flags: PacketFlags::new(),
            pool: Some(pool.clone()),
        }
    }

    pub fn new_shared(source_pid: usize, props: Arc<PropertyMap>, bytes: Bytes) -> Self {
        Packet {
            payload: Payload::Shared(bytes),
            source_pid,
            props,
            info: PacketInfo::default(),
            flags: PacketFlags::new(),
            pool: None,
        }
    }

    /// Clones metadata while sharing the other packet's payload.
    pub fn new_ref(other: Arc<Packet>) -> Self {
        let source_pid = other.source_pid;
        let props = other.props.clone();
        let info = other.info;
        let flags = other.flags;
        Packet {
            payload: Payload::Ref(other),
            source_pid,
            props,
            info,
            flags,
            pool: None,
        }
    }

    pub fn new_frame_interface(
        source_pid: usize,
        props: Arc<PropertyMap>,
        ifce: Arc<dyn FrameInterface>,
    ) -> Self {
        Packet {
            payload: Payload::FrameInterface(ifce),
            source_pid,
            props,
            info: PacketInfo::default(),
            flags: PacketFlags::new(),
            pool: None,
        }
    }

    pub fn len(&self) -> Option<usize> {
        match &self.payload {
            Payload::Owned(b) | Payload::Shared(b) => Some(b.len()),
            Payload::Ref(p) => p.len(),
            Payload::FrameInterface(_) => None,
        }
    }
}

impl Drop for Packet {
    /// Returns an `Owned` buffer to its reservoir on last release, so the
    /// next `new_alloc` against the same pool reuses its capacity.
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else { return };
        let Payload::Owned(bytes) = std::mem::replace(&mut self.payload, Payload::Shared(Bytes::new())) else {
            return;
        };
        if let Ok(buf) = bytes.try_into_mut() {
            let _ = pool.lock().unwrap().insert(buf.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_word_roundtrips_every_field() {
        let mut flags = PacketFlags::new();
        flags
            .set_block_start(true)
            .set_corrupted(true)
            .set_sap_type(SapType::Type2)
            .set_interlaced_kind(InterlacedKind::TopFieldFirst)
            .set_command_kind(CommandKind::PidEos)
            .set_force_main_thread(true)
            .set_depends_on(true);

        assert!(flags.block_start());
        assert!(!flags.block_end());
        assert!(flags.corrupted());
        assert_eq!(flags.sap_type(), SapType::Type2);
        assert_eq!(flags.interlaced_kind(), InterlacedKind::TopFieldFirst);
        assert_eq!(flags.command_kind(), CommandKind::PidEos);
        assert!(flags.force_main_thread());
        assert!(flags.depends_on());
        assert!(!flags.redundant());
    }

    #[test]
    fn fields_are_independent_bit_ranges() {
        let mut flags = PacketFlags::new();
        flags.set_sap_type(SapType::Type4);
        flags.set_command_kind(CommandKind::PidRemove);
        // Setting one packed field must not disturb an adjacent one.
        assert_eq!(flags.sap_type(), SapType::Type4);
        assert_eq!(flags.command_kind(), CommandKind::PidRemove);
        flags.set_sap_type(SapType::None);
        assert_eq!(flags.command_kind(), CommandKind::PidRemove);
    }

    #[test]
    fn new_alloc_returns_buffer_to_pool_on_drop() {
        let pool: Arc<Mutex<Reservoir<Vec<u8>>>> = Arc::new(Mutex::new(Reservoir::new(4)));
        let props = PropertyMap::new();
        let pck = Packet::new_alloc(&pool, 0, props.clone(), 16);
        assert_eq!(pck.len(), Some(16));
        drop(pck);
        assert_eq!(pool.lock().unwrap().len(), 1, "dropping an owned packet must return its buffer to the pool");

        let reused = Packet::new_alloc(&pool, 0, props, 8);
        assert_eq!(reused.len(), Some(8));
        assert_eq!(
            pool.lock().unwrap().len(),
            0,
            "new_alloc must draw from the pool before falling back to a fresh buffer"
        );
    }

    #[test]
    fn new_shared_payload_is_not_returned_to_any_pool() {
        let pool: Arc<Mutex<Reservoir<Vec<u8>>>> = Arc::new(Mutex::new(Reservoir::new(4)));
        drop(Packet::new_alloc(&pool, 0, PropertyMap::new(), 4));
        assert_eq!(pool.lock().unwrap().len(), 1);
        // A `Shared` packet never drew from this pool, so dropping it must
        // not disturb what `new_alloc` already returned.
        drop(Packet::new_shared(0, PropertyMap::new(), Bytes::from_static(b"x")));
        assert_eq!(pool.lock().unwrap().len(), 1);
    }

    #[test]
    fn new_ref_shares_payload_and_copies_metadata() {
        let props = PropertyMap::new();
        let mut base = Packet::new_shared(0, props.clone(), Bytes::from_static(b"hello"));
        base.info.cts = Some(40);
        let base = Arc::new(base);
        let clone = Packet::new_ref(base.clone());
        assert_eq!(clone.info.cts, Some(40));
        assert_eq!(clone.len(), Some(5));
    }
}
