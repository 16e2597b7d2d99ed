//! Pids (§3, §4.3): typed channels between filters.
//!
//! An output pid fans out into one [`PidInstance`] per downstream consumer.
//! Each instance owns a single-producer/single-consumer queue, per the
//! port recommendation in §9 ("per-filter SPSC queues for packet
//! instances") — built on `crossbeam-channel`, the same crate this
//! workspace already uses for its worker-thread message queues.

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::packet::Packet;
use crate::property::PropertyMap;

/// Playout tunables for a pid instance (§4.3 "Blocking model").
#[derive(Debug, Clone, Copy)]
pub struct BufferLevels {
    /// Playout target, in microseconds.
    pub buffer_us: u64,
    /// Rebuffer trigger: once crossed after a block, must refill to this
    /// level before `would_block` clears.
    pub rbuffer_us: u64,
    /// Hard maximum; a producer that would exceed this must not enqueue.
    pub mbuffer_us: u64,
}

impl Default for BufferLevels {
    fn default() -> Self {
        // Defaults mirror common playout targets: 1s nominal, 3s hard cap.
        BufferLevels {
            buffer_us: 1_000_000,
            rbuffer_us: 500_000,
            mbuffer_us: 3_000_000,
        }
    }
}

/// One downstream consumer's queue over a producer's output pid.
pub struct PidInstance {
    pub id: usize,
    pub producer_pid: usize,
    pub consumer_filter: usize,
    sender: Sender<Arc<Packet>>,
    receiver: Receiver<Arc<Packet>>,
    /// One-slot lookahead so `peek` (`get_packet`) doesn't consume what
    /// `pop` (`drop_packet`) later removes — `crossbeam_channel` has no
    /// native non-destructive peek.
    front: Mutex<Option<Arc<Packet>>>,
    queued_duration_us: AtomicU64,
    queued_count: AtomicU64,
    would_block: AtomicBool,
    levels: BufferLevels,
    props: ArcSwap<PropertyMap>,
    props_changed: AtomicBool,
    eos: AtomicBool,
    pub requires_full_data_block: bool,
    pub requires_reorder: bool,
    /// A single-output-sparse filter is treated as always-blocked-on
    /// consumer to prevent busy loops (§3).
    pub sparse: bool,
}

impl PidInstance {
    pub fn new(id: usize, producer_pid: usize, consumer_filter: usize, levels: BufferLevels) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        PidInstance {
            id,
            producer_pid,
            consumer_filter,
            sender,
            receiver,
            front: Mutex::new(None),
            queued_duration_us: AtomicU64::new(0),
            queued_count: AtomicU64::new(0),
            would_block: AtomicBool::new(false),
            levels,
            props: ArcSwap::new(PropertyMap::new()),
            props_changed: AtomicBool::new(false),
            eos: AtomicBool::new(false),
            requires_full_data_block: false,
            requires_reorder: false,
            sparse: false,
        }
    }

    /// Enqueues a packet-instance; updates `buffer_duration` and
    /// recomputes `would_block` against the configured levels. Returns
    /// `false` without enqueuing if doing so would push the buffered
    /// duration past the hard ceiling `mbuffer_us` (§4.3 "Blocking model":
    /// a producer that would exceed this must not enqueue).
    pub fn enqueue(&self, pck: Arc<Packet>) -> bool {
        let duration = pck.info.duration as u64;
        if self.would_exceed_hard_max(duration) {
            return false;
        }
        self.queued_duration_us.fetch_add(duration, Ordering::SeqCst);
        self.queued_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(pck);
        self.recompute_would_block();
        true
    }

    /// Whether enqueuing `incoming_duration_us` more would push the
    /// buffered duration past `mbuffer_us`, the hard maximum distinct from
    /// the `buffer_us` playout trigger that `would_block` itself reacts to.
    pub fn would_exceed_hard_max(&self, incoming_duration_us: u64) -> bool {
        !self.sparse && self.buffer_duration_us() + incoming_duration_us > self.levels.mbuffer_us
    }

    /// `get_packet`: peeks the head without removing it.
    pub fn peek(&self) -> Option<Arc<Packet>> {
        let mut front = self.front.lock().unwrap();
        if front.is_none() {
            *front = self.receiver.try_recv().ok();
        }
        front.clone()
    }

    /// `drop_packet`: pops and releases the head, decrementing the queued
    /// duration and recomputing `would_block`.
    pub fn pop(&self) -> Option<Arc<Packet>> {
        let pck = {
            let mut front = self.front.lock().unwrap();
            match front.take() {
                Some(pck) => pck,
                None => self.receiver.try_recv().ok()?,
            }
        };
        self.queued_duration_us
            .fetch_sub((pck.info.duration as u64).min(self.queued_duration_us.load(Ordering::SeqCst)), Ordering::SeqCst);
        self.queued_count.fetch_sub(1, Ordering::SeqCst);
        self.recompute_would_block();
        Some(pck)
    }

    pub fn queue_len(&self) -> usize {
        self.queued_count.load(Ordering::SeqCst) as usize
    }

    pub fn buffer_duration_us(&self) -> u64 {
        self.queued_duration_us.load(Ordering::SeqCst)
    }

    fn recompute_would_block(&self) {
        let blocked = if self.sparse {
            // Single-output-sparse pids are always treated as blocked on
            // the consumer so the producer doesn't busy-loop (§3).
            true
        } else if self.would_block.load(Ordering::SeqCst) {
            // Rebuffer hysteresis (§4.3): once blocked, stay blocked until
            // the buffer refills back down to `rbuffer_us` rather than
            // merely dropping back below the `buffer_us` trigger.
            self.buffer_duration_us() >= self.levels.rbuffer_us
        } else {
            self.buffer_duration_us() >= self.levels.buffer_us
        };
        self.would_block.store(blocked, Ordering::SeqCst);
    }

    pub fn would_block(&self) -> bool {
        self.would_block.load(Ordering::SeqCst)
    }

    pub fn set_eos(&self) {
        self.eos.store(true, Ordering::SeqCst);
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::SeqCst) && self.queue_len() == 0
    }

    /// Called by the consumer's first `get_packet` after the producer
    /// published new props: fires the "props changed" transition exactly
    /// once (§4.3).
    pub fn take_props_changed(&self) -> bool {
        self.props_changed.swap(false, Ordering::SeqCst)
    }

    pub fn current_props(&self) -> Arc<PropertyMap> {
        self.props.load_full()
    }

    pub fn publish_props(&self, props: Arc<PropertyMap>) {
        self.props.store(props);
        self.props_changed.store(true, Ordering::SeqCst);
    }
}

/// The producer-side pid (§3): owned by the filter that creates it, fans
/// out into one [`PidInstance`] per destination.
pub struct OutputPid {
    pub id: usize,
    pub owner_filter: usize,
    pub name: String,
    pub timescale: u32,
    pub is_sparse: bool,
    pub requires_reorder: bool,
    next_seq: AtomicU64,
    props: ArcSwap<PropertyMap>,
    pub destinations: Vec<Arc<PidInstance>>,
    pub max_buffer_us: AtomicU64,
    eos: AtomicBool,
}

impl OutputPid {
    pub fn new(id: usize, owner_filter: usize, name: impl Into<String>, timescale: u32) -> Self {
        OutputPid {
            id,
            owner_filter,
            name: name.into(),
            timescale,
            is_sparse: false,
            requires_reorder: false,
            next_seq: AtomicU64::new(0),
            props: ArcSwap::new(PropertyMap::new()),
            destinations: Vec::new(),
            max_buffer_us: AtomicU64::new(BufferLevels::default().buffer_us),
            eos: AtomicBool::new(false),
        }
    }

    /// Publishes a new property map version and marks every destination's
    /// "props changed" flag (§4.3).
    pub fn set_property(&self, key: crate::property::PropertyKey, value: crate::property::PropertyValue) {
        let current = self.props.load();
        let next = Arc::new(current.with_set(key, value));
        self.props.store(next.clone());
        for dest in &self.destinations {
            dest.publish_props(next.clone());
        }
    }

    pub fn current_props(&self) -> Arc<PropertyMap> {
        self.props.load_full()
    }

    /// Next monotonic sequence number, unless this pid requires reorder
    /// (UDP-style source), in which case the caller supplies its own.
    pub fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn set_max_buffer(&self, us: u64) {
        self.max_buffer_us.store(us, Ordering::SeqCst);
    }

    pub fn set_eos(&self) {
        self.eos.store(true, Ordering::SeqCst);
        for dest in &self.destinations {
            dest.set_eos();
        }
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }

    /// Number of destinations currently `would_block`.
    pub fn would_block_count(&self) -> usize {
        self.destinations.iter().filter(|d| d.would_block()).count()
    }

    pub fn num_destinations(&self) -> usize {
        self.destinations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketInfo;

    fn packet_with_duration(source_pid: usize, duration: u32) -> Arc<Packet> {
        let props = PropertyMap::new();
        let mut pck = Packet::new_shared(source_pid, props, bytes::Bytes::new());
        pck.info = PacketInfo {
            duration,
            ..Default::default()
        };
        Arc::new(pck)
    }

    #[test]
    fn would_block_asserts_once_buffer_is_full() {
        let levels = BufferLevels {
            buffer_us: 100_000,
            rbuffer_us: 50_000,
            mbuffer_us: 100_000,
        };
        let inst = PidInstance::new(0, 0, 1, levels);
        assert!(!inst.would_block());
        for _ in 0..10 {
            inst.enqueue(packet_with_duration(0, 10_000));
        }
        assert!(inst.would_block(), "10 packets * 10ms should hit the 100ms buffer");
        assert_eq!(inst.queue_len(), 10);
    }

    #[test]
    fn drop_packet_requires_refill_below_rbuffer_before_clearing() {
        // buffer_us is the trigger; rbuffer_us is the lower rebuffer floor
        // the buffer must refill below before `would_block` clears again
        // (§4.3 "Blocking model" rebuffer hysteresis).
        let levels = BufferLevels {
            buffer_us: 100_000,
            rbuffer_us: 50_000,
            mbuffer_us: 200_000,
        };
        let inst = PidInstance::new(0, 0, 1, levels);
        for _ in 0..10 {
            inst.enqueue(packet_with_duration(0, 10_000));
        }
        assert!(inst.would_block(), "100us buffered hits the 100us trigger");
        inst.pop();
        assert!(
            inst.would_block(),
            "90us buffered is still above the 50us rebuffer floor, so the block must hold"
        );
        for _ in 0..4 {
            inst.pop();
        }
        assert!(!inst.would_block(), "50us buffered, now below the 50us rebuffer floor, clears the block");
    }

    #[test]
    fn enqueue_rejects_once_it_would_exceed_the_hard_max() {
        let levels = BufferLevels {
            buffer_us: 50_000,
            rbuffer_us: 25_000,
            mbuffer_us: 100_000,
        };
        let inst = PidInstance::new(0, 0, 1, levels);
        for _ in 0..10 {
            inst.enqueue(packet_with_duration(0, 10_000));
        }
        assert_eq!(inst.buffer_duration_us(), 100_000, "filled exactly to the hard max");
        assert!(
            !inst.enqueue(packet_with_duration(0, 1)),
            "a producer must not enqueue past mbuffer_us"
        );
        assert_eq!(inst.queue_len(), 10, "the rejected packet must not have been queued");
    }

    #[test]
    fn sparse_pid_instance_is_always_blocked() {
        let mut inst = PidInstance::new(0, 0, 1, BufferLevels::default());
        inst.sparse = true;
        inst.recompute_would_block();
        assert!(inst.would_block());
    }

    #[test]
    fn props_changed_fires_exactly_once() {
        let inst = PidInstance::new(0, 0, 1, BufferLevels::default());
        inst.publish_props(PropertyMap::new());
        assert!(inst.take_props_changed());
        assert!(!inst.take_props_changed());
    }

    #[test]
    fn output_pid_would_block_count_is_union_of_destinations() {
        let out = OutputPid::new(0, 0, "out", 1000);
        let levels = BufferLevels {
            buffer_us: 10_000,
            rbuffer_us: 5_000,
            mbuffer_us: 10_000,
        };
        let blocked = Arc::new(PidInstance::new(1, 0, 1, levels));
        blocked.enqueue(packet_with_duration(0, 20_000));
        let open = Arc::new(PidInstance::new(2, 0, 2, BufferLevels::default()));
        let mut out = out;
        out.destinations.push(blocked);
        out.destinations.push(open);
        assert_eq!(out.would_block_count(), 1);
    }
}
