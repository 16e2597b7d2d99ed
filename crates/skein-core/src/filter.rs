//! Filters (§3, §4.4): processing unit instances and their class
//! descriptors (registers).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quanta::Instant;
use skein_common::reservoir::Reservoir;

use crate::error::{ErrorSlots, FilterError, ProcessResult};
use crate::packet::Packet;
use crate::pid::{OutputPid, PidInstance};
use crate::property::PropertyValue;

/// Cap on a filter's own packet-buffer reservoir (§4.2 "Allocation is
/// pooled per filter through a reservoir to avoid malloc storms"). Past
/// this many spare buffers a release is simply dropped rather than kept.
const PACKET_POOL_CAPACITY: usize = 64;

/// An argument's type and update policy (§4.4 register `args[]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgUpdatePolicy {
    /// Only readable at `initialize` time.
    Fixed,
    /// May change at runtime via `update_arg`.
    Updatable,
    /// May change at runtime, and the scheduler serializes the update
    /// with in-flight `process` calls (no torn reads).
    SyncUpdatable,
    /// Propagated to the filter before `initialize` regardless of arg
    /// source ordering.
    Meta,
}

#[derive(Debug, Clone)]
pub struct ArgDesc {
    pub name: &'static str,
    pub property_type: crate::property::PropertyType,
    pub default: Option<PropertyValue>,
    pub policy: ArgUpdatePolicy,
    /// This arg also doubles as a sink/source URL alias (e.g. `src=`/`dst=`).
    pub is_url_alias: bool,
}

/// The callback interface every filter kind implements (§6, §9 "Dynamic
/// dispatch"). Built-in filters live in a static table; this port has no
/// loaded-module plugin path (out of scope per §1), so every implementor
/// is compiled in.
pub trait FilterCallbacks: Send + Sync {
    fn initialize(&self, ctx: &FilterContext) -> Result<(), FilterError>;
    fn configure_pid(&self, ctx: &FilterContext, pid_id: usize, is_remove: bool) -> Result<(), FilterError>;
    fn process(&self, ctx: &FilterContext) -> ProcessResult;
    fn process_event(&self, _ctx: &FilterContext, _event: &str) -> bool {
        false
    }
    fn update_arg(&self, _name: &str, _value: &PropertyValue) -> Result<(), FilterError> {
        Ok(())
    }
    fn probe_url(&self, _url: &str, _mime: Option<&str>) -> ProbeScore {
        ProbeScore::NotSupported
    }
    fn probe_data(&self, _bytes: &[u8]) -> Option<(String, ProbeScore)> {
        None
    }
    fn reconfigure_output(&self, _ctx: &FilterContext, _pid_id: usize) -> Result<(), FilterError> {
        Err(FilterError::NotSupported("reconfigure_output not implemented".into()))
    }
    fn finalize(&self, _ctx: &FilterContext) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbeScore {
    NotSupported,
    Maybe,
    Supported,
    ExtMatch,
    Force,
}

/// Tiny macro standing in for the `bitflags` crate's generated API so the
/// register-flags type stays a transparent `u16` without adding a new
/// dependency for eight boolean flags.
macro_rules! bitflags_like_register_flags {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $flag:ident = $val:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name($repr);

        impl $name {
            $(pub const $flag: $name = $name($val);)*

            pub const fn empty() -> Self {
                $name(0)
            }
            pub fn contains(&self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }
            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like_register_flags! {
    /// Register-level flags (§4.4).
    pub struct RegisterFlags: u16 {
        const MAIN_THREAD = 1 << 0;
        const SCRIPT = 1 << 1;
        const CUSTOM = 1 << 2;
        const EXPLICIT_ONLY = 1 << 3;
        const META = 1 << 4;
        const ACT_AS_SOURCE = 1 << 5;
        const BLOCKING = 1 << 6;
        const ALLOW_CYCLIC = 1 << 7;
    }
}

/// Immutable class descriptor for a kind of filter (§4.4).
pub struct Register {
    pub name: &'static str,
    pub args: Vec<ArgDesc>,
    pub caps: Vec<crate::resolver::CapBundle>,
    pub flags: RegisterFlags,
    pub callbacks: Box<dyn Fn() -> Box<dyn FilterCallbacks>>,
}

impl std::fmt::Debug for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Register")
            .field("name", &self.name)
            .field("caps", &self.caps.len())
            .field("flags", &self.flags)
            .finish()
    }
}

/// Lifecycle flags (§3 "Filter").
#[derive(Debug, Default)]
pub struct LifecycleFlags {
    pub removed: AtomicBool,
    pub finalized: AtomicBool,
    pub disabled: AtomicBool,
    pub sticky: AtomicBool,
    pub dynamic: AtomicBool,
    pub clonable: AtomicBool,
    pub stream_reset_pending: AtomicBool,
    pub out_pid_connection_pending: AtomicBool,
    pub caps_negotiate_pending: AtomicBool,
}

/// Health-check bookkeeping (§4.6, §7).
#[derive(Debug, Default)]
pub struct HealthState {
    pub nb_consecutive_errors: AtomicU64,
    pub nb_pck_io: AtomicU32,
    time_at_first_error: Mutex<Option<Instant>>,
}

impl HealthState {
    /// Records the outcome of one `process` call. Returns `true` if the
    /// filter should now be force-disabled (§7: "after 1 s of
    /// error-with-no-IO... filter is forcibly disabled").
    pub fn record(&self, result: &ProcessResult, now: Instant) -> bool {
        let (is_error, io_progress) = match result {
            Ok(_) => (false, self.nb_pck_io.load(Ordering::SeqCst) > 0),
            Err(e) => (e.counts_toward_health(), self.nb_pck_io.load(Ordering::SeqCst) > 0),
        };

        if !is_error || io_progress {
            self.nb_consecutive_errors.store(0, Ordering::SeqCst);
            *self.time_at_first_error.lock().unwrap() = None;
            return false;
        }

        self.nb_consecutive_errors.fetch_add(1, Ordering::SeqCst);
        let mut first = self.time_at_first_error.lock().unwrap();
        let started = *first.get_or_insert(now);
        let elapsed_over_1s = now.duration_since(started) >= std::time::Duration::from_secs(1);
        let too_many_reconnects = self.nb_consecutive_errors.load(Ordering::SeqCst) >= 100_000;
        elapsed_over_1s || too_many_reconnects
    }

    pub fn reset_io_counter(&self) {
        self.nb_pck_io.store(0, Ordering::SeqCst);
    }

    pub fn note_io(&self, count: u32) {
        self.nb_pck_io.fetch_add(count, Ordering::SeqCst);
    }
}

/// A running filter instance (§3 "Filter").
pub struct Filter {
    pub id: usize,
    pub name: String,
    pub register_name: &'static str,
    pub args: HashMap<String, PropertyValue>,
    pub input_pids: Mutex<Vec<usize>>,
    /// The consumer-side queue for each entry of `input_pids`, in the same
    /// order (§4.2 "Operations (consumer side)"): a filter's `process`
    /// reaches its own input through [`Filter::get_packet`]/[`Filter::drop_packet`]
    /// rather than walking back through the producer's output pid.
    pub input_instances: Mutex<Vec<Arc<PidInstance>>>,
    pub output_pids: Mutex<Vec<OutputPid>>,
    pub lifecycle: LifecycleFlags,
    pub health: HealthState,
    pub errors: Mutex<ErrorSlots>,
    /// Set while a thread is executing a task for this filter — enforces
    /// invariant 2 (§8): no two callbacks run concurrently on one filter.
    pub running: AtomicBool,
    /// Number of pending reasons this filter should run (§4.6): incremented
    /// on packet arrival, timed reschedule, or explicit post. A filter is
    /// "scheduled" iff this is > 0 and it sits at the head of a FIFO.
    pub process_task_queued: AtomicU64,
    /// Set by `filter_ask_rt_reschedule`; the filter should not run again
    /// before this instant.
    pub schedule_next_time: Mutex<Option<Instant>>,
    pub flags: FilterRuntimeFlags,
    pending_negotiation: Mutex<Option<PendingNegotiation>>,
    /// Backs `Packet::new_alloc` for every packet this filter originates
    /// (§4.2): a released buffer's capacity is handed to the next
    /// allocation instead of going back to the allocator.
    pub packet_pool: Arc<Mutex<Reservoir<Vec<u8>>>>,
}

/// Per-instance scheduling flags (§4.4, §4.6) distinct from the register's
/// static [`RegisterFlags`].
#[derive(Debug, Default)]
pub struct FilterRuntimeFlags {
    pub main_thread_affinity: AtomicBool,
    pub blocking_source: AtomicBool,
}

/// Handle passed to callback implementations: everything a filter may
/// touch during a callback, without exposing the scheduler's internals.
pub struct FilterContext<'a> {
    pub filter: &'a Filter,
}

/// A queued `negotiate_property` request (§4.3 "Capability negotiation"):
/// a filter whose input rejects the producer's current value for `key`
/// records one of these instead of calling back into the session
/// directly, since callbacks only ever see a [`FilterContext`]. The
/// session drains it after the next `process` call.
#[derive(Debug, Clone)]
pub struct PendingNegotiation {
    pub pid_id: usize,
    pub key: &'static str,
    pub desired: PropertyValue,
}

impl Filter {
    pub fn new(id: usize, name: String, register_name: &'static str) -> Self {
        Filter {
            id,
            name,
            register_name,
            args: HashMap::new(),
            input_pids: Mutex::new(Vec::new()),
            input_instances: Mutex::new(Vec::new()),
            output_pids: Mutex::new(Vec::new()),
            lifecycle: LifecycleFlags::default(),
            health: HealthState::default(),
            errors: Mutex::new(ErrorSlots::new()),
            running: AtomicBool::new(false),
            process_task_queued: AtomicU64::new(0),
            schedule_next_time: Mutex::new(None),
            flags: FilterRuntimeFlags::default(),
            pending_negotiation: Mutex::new(None),
            packet_pool: Arc::new(Mutex::new(Reservoir::new(PACKET_POOL_CAPACITY))),
        }
    }

    /// Records a `negotiate_property(pid, key, desired_value)` request
    /// (§4.3): called from a consumer's `process` when the current value
    /// of `key` on `pid_id` is unacceptable. The session picks this up
    /// once the callback returns and either asks the producer to
    /// reconfigure in place or has the resolver insert an adapter (§4.5).
    pub fn request_negotiation(&self, pid_id: usize, key: &'static str, desired: PropertyValue) {
        *self.pending_negotiation.lock().unwrap() = Some(PendingNegotiation { pid_id, key, desired });
        self.lifecycle.caps_negotiate_pending.store(true, Ordering::SeqCst);
    }

    pub fn take_pending_negotiation(&self) -> Option<PendingNegotiation> {
        let mut slot = self.pending_negotiation.lock().unwrap();
        if slot.is_some() {
            self.lifecycle.caps_negotiate_pending.store(false, Ordering::SeqCst);
        }
        slot.take()
    }

    pub fn notify(&self) {
        self.process_task_queued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn take_notification(&self) -> bool {
        // Treated as a saturating decrement: scheduling the filter once
        // drains however many notifications arrived since the last run,
        // since one `process` call observes all packets available so far.
        self.process_task_queued.swap(0, Ordering::SeqCst) > 0
    }

    pub fn is_scheduled(&self) -> bool {
        self.process_task_queued.load(Ordering::SeqCst) > 0
    }

    /// Enters the filter's serialized section; returns `false` if another
    /// thread is already inside (caller must re-queue the task).
    pub fn try_enter(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn exit(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// §3 "would_block + num_unconnected_outputs ≥ num_outputs" (§5).
    pub fn is_blocked(&self) -> bool {
        let outputs = self.output_pids.lock().unwrap();
        if outputs.is_empty() {
            return false;
        }
        let num_outputs = outputs.len();
        let mut would_block = 0usize;
        let mut unconnected = 0usize;
        for pid in outputs.iter() {
            if pid.num_destinations() == 0 {
                unconnected += 1;
            } else if pid.would_block_count() > 0 {
                would_block += 1;
            }
        }
        would_block + unconnected >= num_outputs
    }

    /// A filter whose every output is EOS and every input is EOS is
    /// finalized unless sticky (§3, §8 invariant 7).
    pub fn all_ports_eos(&self) -> bool {
        let outputs = self.output_pids.lock().unwrap();
        let inputs = self.input_instances.lock().unwrap();
        outputs.iter().all(|p| p.is_eos()) && inputs.iter().all(|p| p.is_eos())
    }

    pub fn should_finalize_on_disconnect(&self) -> bool {
        !self.lifecycle.sticky.load(Ordering::SeqCst)
    }

    /// `get_packet(pid)` (§4.2, §4.3 consumer side): peeks the head of the
    /// named input's queue without removing it.
    pub fn get_packet(&self, pid_id: usize) -> Option<Arc<Packet>> {
        self.input_instance(pid_id)?.peek()
    }

    /// `drop_packet(pid)`: pops and releases the head of the named input's
    /// queue. The caller must not retain a reference to the packet across
    /// this call without having taken its own `Arc` clone first (§4.2).
    pub fn drop_packet(&self, pid_id: usize) -> Option<Arc<Packet>> {
        self.input_instance(pid_id)?.pop()
    }

    /// Allocates an owned packet through this filter's reservoir (§4.2),
    /// reusing a released buffer's capacity when one is available.
    pub fn alloc_packet(&self, source_pid: usize, props: Arc<crate::property::PropertyMap>, size: usize) -> Packet {
        Packet::new_alloc(&self.packet_pool, source_pid, props, size)
    }

    fn input_instance(&self, pid_id: usize) -> Option<Arc<PidInstance>> {
        self.input_instances
            .lock()
            .unwrap()
            .iter()
            .find(|inst| inst.id == pid_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessStatus;

    #[test]
    fn serialization_guard_prevents_concurrent_entry() {
        let f = Filter::new(0, "f".into(), "test");
        assert!(f.try_enter());
        assert!(!f.try_enter(), "second entry must be rejected while running");
        f.exit();
        assert!(f.try_enter());
    }

    #[test]
    fn health_disables_after_one_second_of_errors_with_no_io() {
        let health = HealthState::default();
        let t0 = Instant::now();
        let result: ProcessResult = Err(FilterError::IoErr("x".into()));
        assert!(!health.record(&result, t0));
        let t1 = t0 + std::time::Duration::from_millis(1001);
        assert!(health.record(&result, t1));
    }

    #[test]
    fn health_resets_on_io_progress() {
        let health = HealthState::default();
        let t0 = Instant::now();
        let err: ProcessResult = Err(FilterError::IoErr("x".into()));
        health.record(&err, t0);
        health.note_io(1);
        let ok: ProcessResult = Ok(ProcessStatus::Ok);
        assert!(!health.record(&ok, t0));
        assert_eq!(health.nb_consecutive_errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn profile_not_supported_does_not_count_toward_health() {
        let health = HealthState::default();
        let t0 = Instant::now();
        let result: ProcessResult = Err(FilterError::ProfileNotSupported);
        let t1 = t0 + std::time::Duration::from_secs(2);
        assert!(!health.record(&result, t0));
        assert!(!health.record(&result, t1));
    }

    #[test]
    fn register_flags_compose() {
        let flags = RegisterFlags::MAIN_THREAD | RegisterFlags::BLOCKING;
        assert!(flags.contains(RegisterFlags::MAIN_THREAD));
        assert!(flags.contains(RegisterFlags::BLOCKING));
        assert!(!flags.contains(RegisterFlags::SCRIPT));
    }
}
