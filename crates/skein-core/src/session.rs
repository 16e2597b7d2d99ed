//! The session (§3, §4.5, §9): filter registry, instantiation, link
//! resolution, and the scheduler-host glue that lets the generic
//! [`crate::scheduler::Scheduler`] drive concrete filters without holding
//! any filter-internal lock itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quanta::Instant;
use thiserror::Error;
use tracing::{info, warn};

use skein_common::ids::{AutoNamer, GincCounters};
use skein_common::reservoir::{Handle, Reservoir};

use crate::args::{self, ParsedArgs};
use crate::config::{AbortMode, ArgSeparators, SessionConfig};
use crate::error::{ErrorSlots, FilterError, ProcessResult};
use crate::filter::{Filter, FilterCallbacks, FilterContext, ProbeScore, Register, RegisterFlags};
use crate::pid::{BufferLevels, OutputPid, PidInstance};
use crate::property::{self, PropertyValue};
use crate::resolver::{CapBundle, CapFlags, RegDescGraph};
use crate::scheduler::{Scheduler, SchedulerHost, Task};

/// Session-level failures distinct from a filter's own [`FilterError`]
/// (§4.5 "resolution failure", §6 "unknown register").
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no register named {0:?}")]
    RegisterNotFound(String),
    #[error("no capability path from {src:?} to {dst:?}")]
    ResolutionFailed { src: String, dst: String },
    #[error("connecting {src:?} to {dst:?} would close a cycle in the live filter graph")]
    WouldCloseCycle { src: String, dst: String },
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("no registered filter can source {0:?}")]
    UnsupportedUrl(String),
}

/// One instantiated filter, keyed by its stable [`Filter::id`].
struct FilterEntry {
    filter: Arc<Filter>,
    callbacks: Arc<dyn FilterCallbacks>,
    register_name: &'static str,
}

/// The registry plus the name index, behind a single lock so no caller
/// ever has to reason about lock ordering between the two (§2 "the
/// scheduler holds no filter-internal locks" extends to the session's own
/// bookkeeping structures too).
#[derive(Default)]
struct RegistryState {
    registers: Vec<Register>,
    by_name: HashMap<&'static str, usize>,
}

/// The slab of live filter instances plus the stable-id → slab-handle
/// index, also combined behind one lock for the same reason.
#[derive(Default)]
struct FilterTable {
    reservoir: Reservoir<FilterEntry>,
    id_to_handle: HashMap<usize, Handle<FilterEntry>>,
}

impl FilterTable {
    fn insert(&mut self, id: usize, entry: FilterEntry) {
        if let Some(handle) = self.reservoir.insert(entry) {
            self.id_to_handle.insert(id, handle);
        }
    }

    fn remove(&mut self, id: usize) -> Option<FilterEntry> {
        let handle = self.id_to_handle.remove(&id)?;
        self.reservoir.remove(handle)
    }

    fn ids(&self) -> Vec<usize> {
        self.id_to_handle.keys().copied().collect()
    }
}

/// The session (§3): owns the filter registry, the live filter instances,
/// and (once [`Session::run`] is called) the scheduler driving them.
pub struct Session {
    config: SessionConfig,
    registry: Mutex<RegistryState>,
    graph: Mutex<Option<RegDescGraph>>,
    filters: Mutex<FilterTable>,
    next_filter_id: AtomicU64,
    next_pid_id: AtomicU64,
    names: AutoNamer,
    ginc: GincCounters,
    errors: Mutex<ErrorSlots>,
    abort_mode: Mutex<Option<AbortMode>>,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Session {
            config,
            registry: Mutex::new(RegistryState::default()),
            graph: Mutex::new(None),
            filters: Mutex::new(FilterTable::default()),
            next_filter_id: AtomicU64::new(0),
            next_pid_id: AtomicU64::new(0),
            names: AutoNamer::new(),
            ginc: GincCounters::new(),
            errors: Mutex::new(ErrorSlots::new()),
            abort_mode: Mutex::new(None),
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Adds a filter class to the registry (§4.4). Invalidates the cached
    /// capability graph; it is rebuilt lazily on the next resolution.
    pub fn register_filter(&self, register: Register) {
        let mut state = self.registry.lock().unwrap();
        let idx = state.registers.len();
        state.by_name.insert(register.name, idx);
        state.registers.push(register);
        *self.graph.lock().unwrap() = None;
    }

    fn register_flags(&self, register_name: &str) -> RegisterFlags {
        let state = self.registry.lock().unwrap();
        state
            .by_name
            .get(register_name)
            .map(|&idx| state.registers[idx].flags)
            .unwrap_or_else(RegisterFlags::empty)
    }

    /// Splits a register's flat `caps` into owned output-bundle and
    /// input-bundle vectors (a bundle may land in both if it mixes
    /// `OUTPUT` and `INPUT` caps), since [`RegDescGraph::build`] wants the
    /// two directions as separate contiguous slices.
    fn partition_caps(caps: &[CapBundle]) -> (Vec<CapBundle>, Vec<CapBundle>) {
        let mut outputs = Vec::new();
        let mut inputs = Vec::new();
        for bundle in caps {
            let has_output = bundle.caps.iter().any(|c| c.flags.contains(CapFlags::OUTPUT));
            let has_input = bundle.caps.iter().any(|c| c.flags.contains(CapFlags::INPUT));
            if has_output {
                outputs.push(bundle.clone());
            }
            if has_input {
                inputs.push(bundle.clone());
            }
        }
        (outputs, inputs)
    }

    fn build_graph(&self) -> RegDescGraph {
        let state = self.registry.lock().unwrap();
        let split: Vec<(Vec<CapBundle>, Vec<CapBundle>)> = state
            .registers
            .iter()
            .map(|r| Self::partition_caps(&r.caps))
            .collect();
        let descriptors: Vec<(usize, &[CapBundle], &[CapBundle], i32, RegisterFlags)> = state
            .registers
            .iter()
            .enumerate()
            .map(|(idx, r)| (idx, split[idx].0.as_slice(), split[idx].1.as_slice(), 0i32, r.flags))
            .collect();
        RegDescGraph::build(&descriptors)
    }

    /// Returns the cached graph, rebuilding it first if caching is
    /// disabled or nothing has been cached yet (§4.5, §10.3
    /// `cache_capability_graph`).
    fn with_graph<R>(&self, f: impl FnOnce(&RegDescGraph) -> R) -> R {
        if !self.config.cache_capability_graph {
            return f(&self.build_graph());
        }
        let mut cache = self.graph.lock().unwrap();
        if cache.is_none() {
            *cache = Some(self.build_graph());
        }
        f(cache.as_ref().unwrap())
    }

    /// Looks up the highest-scoring register for a source URL across
    /// every registered prober, instantiating a throwaway callback object
    /// purely to call `probe_url` (§6 "capability-sink probing").
    pub fn probe_url_best_match(&self, url: &str, mime: Option<&str>) -> Option<&'static str> {
        let state = self.registry.lock().unwrap();
        state
            .registers
            .iter()
            .map(|r| (r.name, (r.callbacks)().probe_url(url, mime)))
            .filter(|(_, score)| *score != ProbeScore::NotSupported)
            .max_by_key(|(_, score)| *score)
            .map(|(name, _)| name)
    }

    /// Instantiates one filter (§4.4): parses the argument string, builds
    /// the `Filter`, and invokes `initialize`. A setup failure destroys the
    /// instance and records it on `last_connect_error` rather than failing
    /// the whole session (§7 "setup failure").
    pub fn instantiate(&self, register_name: &str, args_str: &str) -> Result<usize, SessionError> {
        let (canonical_name, arg_descs, callbacks) = {
            let state = self.registry.lock().unwrap();
            let idx = *state
                .by_name
                .get(register_name)
                .ok_or_else(|| SessionError::RegisterNotFound(register_name.to_string()))?;
            let reg = &state.registers[idx];
            (reg.name, reg.args.clone(), Arc::<dyn FilterCallbacks>::from((reg.callbacks)()))
        };

        let parsed: ParsedArgs = args::parse_args(args_str, ArgSeparators::default(), &self.ginc);
        let id = self.next_filter_id.fetch_add(1, Ordering::SeqCst) as usize;
        let name = parsed
            .sentinels
            .name
            .clone()
            .unwrap_or_else(|| self.names.next_name(register_name));

        let mut filter = Filter::new(id, name, canonical_name);
        for desc in &arg_descs {
            let raw = parsed.values.get(desc.name).or_else(|| {
                if desc.is_url_alias {
                    parsed.url.as_ref()
                } else {
                    None
                }
            });
            let Some(raw) = raw else { continue };
            match property::parse(desc.property_type, raw, None, ',') {
                Ok(value) => {
                    filter.args.insert(desc.name.to_string(), value);
                }
                Err(e) => {
                    warn!(filter = %filter.name, arg = desc.name, error = %e, "argument parse failed, skipping");
                }
            }
        }

        let filter = Arc::new(filter);
        let ctx = FilterContext { filter: filter.as_ref() };
        if let Err(e) = callbacks.initialize(&ctx) {
            self.errors.lock().unwrap().set_connect_error(e.clone());
            return Err(SessionError::Filter(e));
        }

        let mut table = self.filters.lock().unwrap();
        table.insert(
            id,
            FilterEntry {
                filter,
                callbacks,
                register_name: canonical_name,
            },
        );
        info!(filter = id, register = register_name, "filter instantiated");
        Ok(id)
    }

    fn with_filter<R>(&self, filter_id: usize, f: impl FnOnce(&Arc<Filter>, &Arc<dyn FilterCallbacks>) -> R) -> Option<R> {
        let table = self.filters.lock().unwrap();
        let handle = *table.id_to_handle.get(&filter_id)?;
        let entry = table.reservoir.get(handle)?;
        Some(f(&entry.filter, &entry.callbacks))
    }

    fn filter_register_name(&self, filter_id: usize) -> Option<&'static str> {
        let table = self.filters.lock().unwrap();
        let handle = *table.id_to_handle.get(&filter_id)?;
        table.reservoir.get(handle).map(|e| e.register_name)
    }

    /// Checks whether `src`'s and `dst`'s registers match directly, and if
    /// not, resolves an intermediate chain via the cached capability graph
    /// (§4.5). Returns the ids of any newly-instantiated intermediate
    /// filters, in link order.
    pub fn connect(&self, src_id: usize, dst_id: usize) -> Result<Vec<usize>, SessionError> {
        let src_reg = self
            .filter_register_name(src_id)
            .ok_or_else(|| SessionError::RegisterNotFound(format!("filter id {src_id}")))?;
        let dst_reg = self
            .filter_register_name(dst_id)
            .ok_or_else(|| SessionError::RegisterNotFound(format!("filter id {dst_id}")))?;

        // Cycle avoidance (§4.5): refuse up front if `dst_id` can already
        // reach `src_id` by following live connections forward, since
        // wiring src into dst would then close a loop back through dst.
        // `ALLOW_CYCLIC` on the destination's own register is the named
        // exception. Every intermediate adapter the resolver might insert
        // below is a fresh instance with no live connections of its own,
        // so this single check at the requested endpoints is exhaustive.
        if self.would_close_live_cycle(src_id, dst_id) && !self.register_flags(dst_reg).contains(RegisterFlags::ALLOW_CYCLIC) {
            return Err(SessionError::WouldCloseCycle {
                src: src_reg.to_string(),
                dst: dst_reg.to_string(),
            });
        }

        if self.bundles_compatible(src_reg, dst_reg) {
            self.wire_direct(src_id, dst_id)?;
            return Ok(vec![]);
        }

        if !self.config.implicit_linking {
            return Err(SessionError::ResolutionFailed {
                src: src_reg.to_string(),
                dst: dst_reg.to_string(),
            });
        }

        let (src_idx, dst_idx) = {
            let state = self.registry.lock().unwrap();
            let src_idx = *state
                .by_name
                .get(src_reg)
                .ok_or_else(|| SessionError::RegisterNotFound(src_reg.to_string()))?;
            let dst_idx = *state
                .by_name
                .get(dst_reg)
                .ok_or_else(|| SessionError::RegisterNotFound(dst_reg.to_string()))?;
            (src_idx, dst_idx)
        };

        // Strict capability matching first; if nothing is found, the
        // resolver gets one relaxed retry that ignores the destination's
        // `FORCED` caps (§4.5 "Runtime resolution").
        let chain = self.with_graph(|graph| {
            graph.resolve_chain_relaxed(src_idx, dst_idx, &HashSet::new(), self.config.max_chain_len)
        });
        let Some(chain) = chain.filter(|c| !c.is_empty()) else {
            return Err(SessionError::ResolutionFailed {
                src: src_reg.to_string(),
                dst: dst_reg.to_string(),
            });
        };

        // `resolve_chain` always ends the path at `dst_idx` itself (it
        // terminates the BFS the moment an edge lands on the destination
        // register), so the last entry names dst's own register rather
        // than a new intermediate. Only the entries before it are filters
        // that still need instantiating — `dst_id` is reused as-is.
        let intermediate = &chain[..chain.len() - 1];
        let register_names: Vec<&'static str> = {
            let state = self.registry.lock().unwrap();
            intermediate.iter().map(|&idx| state.registers[idx].name).collect()
        };

        let mut new_ids = Vec::new();
        let mut upstream = src_id;
        for &reg_name in &register_names {
            let mid_id = self.instantiate(reg_name, "")?;
            self.wire_direct(upstream, mid_id)?;
            new_ids.push(mid_id);
            upstream = mid_id;
        }
        self.wire_direct(upstream, dst_id)?;
        Ok(new_ids)
    }

    /// BFS forward over live connections starting at `from_id`: `true` if
    /// `target_id` is reachable, i.e. `from_id` already has a path to
    /// `target_id` through existing wiring (§4.5 "Cycle avoidance").
    fn would_close_live_cycle(&self, target_id: usize, from_id: usize) -> bool {
        let mut visited = HashSet::new();
        visited.insert(from_id);
        let mut queue = VecDeque::new();
        queue.push_back(from_id);
        while let Some(current) = queue.pop_front() {
            let next_ids = self
                .with_filter(current, |f, _| {
                    f.output_pids
                        .lock()
                        .unwrap()
                        .iter()
                        .flat_map(|out| out.destinations.iter().map(|d| d.consumer_filter))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            for next in next_ids {
                if next == target_id {
                    return true;
                }
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    fn bundles_compatible(&self, src_reg: &str, dst_reg: &str) -> bool {
        let state = self.registry.lock().unwrap();
        let (Some(&src_idx), Some(&dst_idx)) = (state.by_name.get(src_reg), state.by_name.get(dst_reg)) else {
            return false;
        };
        let (src_outputs, _) = Self::partition_caps(&state.registers[src_idx].caps);
        let (_, dst_inputs) = Self::partition_caps(&state.registers[dst_idx].caps);
        src_outputs
            .iter()
            .any(|sb| dst_inputs.iter().any(|db| crate::resolver::bundles_match(sb, db)))
    }

    /// Implicit-linking pass (§4.5 "Implicit mode"): pairs any live filter
    /// with at least one output pid carrying no destinations against any
    /// live filter whose register declares input caps but which has no
    /// input pids configured yet, resolving each pair through [`connect`].
    /// A no-op unless `implicit_linking` is enabled. This workspace has no
    /// subsession/source-id concept to score candidates by, so every
    /// unconnected output is tried against every unconnected input in
    /// filter-id order (see DESIGN.md).
    ///
    /// [`connect`]: Session::connect
    pub fn resolve_implicit_links(&self) -> Result<Vec<(usize, usize)>, SessionError> {
        if !self.config.implicit_linking {
            return Ok(vec![]);
        }

        let mut ids = {
            let table = self.filters.lock().unwrap();
            table.ids()
        };
        ids.sort_unstable();

        let has_unconnected_output = |id: usize| -> bool {
            self.with_filter(id, |f, _| {
                f.output_pids.lock().unwrap().iter().any(|out| out.destinations.is_empty())
            })
            .unwrap_or(false)
        };
        let wants_input = |id: usize| -> bool {
            let register_name = match self.filter_register_name(id) {
                Some(n) => n,
                None => return false,
            };
            let declares_input = {
                let state = self.registry.lock().unwrap();
                state
                    .by_name
                    .get(register_name)
                    .map(|&idx| Self::partition_caps(&state.registers[idx].caps).1)
                    .map(|inputs| !inputs.is_empty())
                    .unwrap_or(false)
            };
            declares_input
                && self
                    .with_filter(id, |f, _| f.input_pids.lock().unwrap().is_empty())
                    .unwrap_or(false)
        };

        let sources: Vec<usize> = ids.iter().copied().filter(|&id| has_unconnected_output(id)).collect();
        let sinks: Vec<usize> = ids.iter().copied().filter(|&id| wants_input(id)).collect();

        let mut linked = Vec::new();
        for &src_id in &sources {
            for &dst_id in &sinks {
                if src_id == dst_id || !has_unconnected_output(src_id) || !wants_input(dst_id) {
                    continue;
                }
                if self.connect(src_id, dst_id).is_ok() {
                    info!(src = src_id, dst = dst_id, "implicit link resolved");
                    linked.push((src_id, dst_id));
                    break;
                }
            }
        }
        Ok(linked)
    }

    /// Creates a new pid-instance wiring `src`'s first output pid to
    /// `dst`'s input list, and calls `dst.configure_pid` (§4.3, §4.4). A
    /// real engine posts `configure_pid` as a scheduled task; this calls it
    /// inline for simplicity, since connection setup already runs
    /// single-threaded before the scheduler starts.
    fn wire_direct(&self, src_id: usize, dst_id: usize) -> Result<(), SessionError> {
        let src_filter = self
            .with_filter(src_id, |f, _| f.clone())
            .ok_or_else(|| SessionError::RegisterNotFound(format!("filter id {src_id}")))?;
        let (dst_filter, dst_callbacks) = self
            .with_filter(dst_id, |f, c| (f.clone(), c.clone()))
            .ok_or_else(|| SessionError::RegisterNotFound(format!("filter id {dst_id}")))?;

        let output_pid_id = {
            let outputs = src_filter.output_pids.lock().unwrap();
            outputs.first().map(|p| p.id)
        };
        let Some(output_pid_id) = output_pid_id else {
            return Err(SessionError::ResolutionFailed {
                src: src_filter.register_name.to_string(),
                dst: dst_filter.register_name.to_string(),
            });
        };

        let levels = BufferLevels {
            buffer_us: self.config.buffer_us,
            rbuffer_us: self.config.rbuffer_us,
            mbuffer_us: self.config.mbuffer_us,
        };
        let pid_id = self.next_pid_id.fetch_add(1, Ordering::SeqCst) as usize;
        let instance = Arc::new(PidInstance::new(pid_id, output_pid_id, dst_id, levels));

        {
            let mut outputs = src_filter.output_pids.lock().unwrap();
            if let Some(out) = outputs.iter_mut().find(|p| p.id == output_pid_id) {
                out.destinations.push(instance.clone());
            }
        }
        dst_filter.input_pids.lock().unwrap().push(pid_id);
        dst_filter.input_instances.lock().unwrap().push(instance);

        let ctx = FilterContext { filter: dst_filter.as_ref() };
        dst_callbacks.configure_pid(&ctx, pid_id, false)?;
        Ok(())
    }

    /// Capability re-negotiation (§4.3 "Capability negotiation", §4.5
    /// "Adapter insertion", scenario S4). `input_pid_id` is the consumer's
    /// own handle on the connection whose current value of `key` it just
    /// rejected. Tries reconfiguring the producer's output in place first;
    /// if the producer can't, detaches the stale connection and lets
    /// [`Session::connect`] resolve an adapter chain into `key = desired`.
    pub fn negotiate_property(
        &self,
        consumer_id: usize,
        input_pid_id: usize,
        key: &'static str,
        desired: PropertyValue,
    ) -> Result<(), SessionError> {
        let producer_id = self.find_producer_of(input_pid_id).ok_or_else(|| SessionError::ResolutionFailed {
            src: "<unknown producer>".to_string(),
            dst: format!("filter {consumer_id}"),
        })?;

        let output_pid_id = self
            .with_filter(producer_id, |f, _| f.output_pids.lock().unwrap().first().map(|p| p.id))
            .flatten();
        let Some(output_pid_id) = output_pid_id else {
            return Err(SessionError::ResolutionFailed {
                src: format!("filter {producer_id}"),
                dst: format!("filter {consumer_id}"),
            });
        };

        let reconfigured = self
            .with_filter(producer_id, |f, c| {
                let ctx = FilterContext { filter: f.as_ref() };
                c.reconfigure_output(&ctx, output_pid_id).is_ok()
            })
            .unwrap_or(false);

        if reconfigured {
            self.with_filter(producer_id, |f, _| {
                let outputs = f.output_pids.lock().unwrap();
                if let Some(out) = outputs.iter().find(|p| p.id == output_pid_id) {
                    out.set_property(property::PropertyKey::Name(key.to_string()), desired.clone());
                }
            });
            info!(producer = producer_id, consumer = consumer_id, key, "output reconfigured in place");
            return Ok(());
        }

        // The producer can't reconfigure: detach the stale direct wiring
        // first (§4.3 "the downstream pid-instance is held off-limits"),
        // then let the resolver insert an adapter (§4.5). Since the
        // adapter is wired before any new packets reach the consumer, the
        // first packet it sees on the replacement pid-instance is already
        // the first converted one.
        self.detach(producer_id, consumer_id)?;
        let inserted = self.connect(producer_id, consumer_id)?;
        info!(producer = producer_id, consumer = consumer_id, key, ?inserted, "adapter inserted for renegotiation");
        Ok(())
    }

    /// Finds the filter owning the output pid that feeds `pid_instance_id`,
    /// by scanning every live filter's output pids for a matching
    /// destination (pid-instance ids are globally unique; output-pid ids
    /// are only unique per owning filter, so this can't be a direct
    /// lookup).
    fn find_producer_of(&self, pid_instance_id: usize) -> Option<usize> {
        let table = self.filters.lock().unwrap();
        for (_, entry) in table.reservoir.iter() {
            let outputs = entry.filter.output_pids.lock().unwrap();
            if outputs.iter().any(|out| out.destinations.iter().any(|d| d.id == pid_instance_id)) {
                return Some(entry.filter.id);
            }
        }
        None
    }

    /// Removes every pid-instance wiring `producer_id`'s outputs directly
    /// into `consumer_id`'s inputs, calling `configure_pid(.., is_remove:
    /// true)` for each (§4.3's "swap_pidinst" detach half).
    fn detach(&self, producer_id: usize, consumer_id: usize) -> Result<(), SessionError> {
        let (dst_filter, dst_callbacks) = self
            .with_filter(consumer_id, |f, c| (f.clone(), c.clone()))
            .ok_or_else(|| SessionError::RegisterNotFound(format!("filter id {consumer_id}")))?;

        let stale_ids: Vec<usize> = self
            .with_filter(producer_id, |f, _| {
                f.output_pids
                    .lock()
                    .unwrap()
                    .iter()
                    .flat_map(|out| out.destinations.iter())
                    .filter(|d| d.consumer_filter == consumer_id)
                    .map(|d| d.id)
                    .collect()
            })
            .unwrap_or_default();

        self.with_filter(producer_id, |f, _| {
            let mut outputs = f.output_pids.lock().unwrap();
            for out in outputs.iter_mut() {
                out.destinations.retain(|d| d.consumer_filter != consumer_id);
            }
        });

        dst_filter.input_pids.lock().unwrap().retain(|id| !stale_ids.contains(id));
        dst_filter.input_instances.lock().unwrap().retain(|inst| !stale_ids.contains(&inst.id));

        for pid_id in stale_ids {
            let ctx = FilterContext { filter: dst_filter.as_ref() };
            dst_callbacks.configure_pid(&ctx, pid_id, true)?;
        }
        Ok(())
    }

    pub fn last_connect_error(&self) -> Option<FilterError> {
        self.errors.lock().unwrap().take_connect_error()
    }

    pub fn last_process_error(&self) -> Option<FilterError> {
        self.errors.lock().unwrap().take_process_error()
    }

    /// Requests session-wide cancellation (§4.6 "Cancellation"). Safe to
    /// call before or after [`Session::run`].
    pub fn abort(&self, mode: AbortMode) {
        *self.abort_mode.lock().unwrap() = Some(mode);
        if let Some(scheduler) = self.scheduler.lock().unwrap().as_ref() {
            scheduler.abort(mode);
        }
    }

    /// Finalizes any filter whose ports are all EOS and which isn't sticky
    /// (§3, §8 invariant 7). Run once after the scheduler has terminated,
    /// since finalization is deferred until no task could still reference
    /// the filter.
    fn sweep_finalized(&self) {
        let ids = self.filters.lock().unwrap().ids();
        for id in ids {
            let done = self
                .with_filter(id, |f, _| f.all_ports_eos() && f.should_finalize_on_disconnect())
                .unwrap_or(false);
            if !done {
                continue;
            }
            let mut table = self.filters.lock().unwrap();
            if let Some(entry) = table.remove(id) {
                drop(table);
                let ctx = FilterContext { filter: entry.filter.as_ref() };
                entry.callbacks.finalize(&ctx);
                entry.filter.lifecycle.finalized.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Builds the scheduler, posts an initial `process` task for every
    /// live filter (so sources get their first chance to run), and drives
    /// it to termination (§4.6, §5).
    pub fn run(self: &Arc<Self>) {
        if let Err(e) = self.resolve_implicit_links() {
            warn!(error = %e, "implicit link resolution failed");
        }
        let scheduler = Arc::new(Scheduler::new(self.clone(), &self.config));
        if let Some(mode) = *self.abort_mode.lock().unwrap() {
            scheduler.abort(mode);
        }
        *self.scheduler.lock().unwrap() = Some(scheduler.clone());

        let ids = self.filters.lock().unwrap().ids();
        for id in ids {
            scheduler.post_task(Task::process(id));
        }
        scheduler.run();
        self.sweep_finalized();
    }
}

impl Session {
    /// Wakes every filter connected to one of `filter_id`'s output pids
    /// (§4.6 "packet arrival" is one of the reasons a filter becomes
    /// scheduled). Conservative: it posts a task whether or not this call
    /// actually produced anything, since `process` may be a no-op.
    fn notify_downstream(&self, filter_id: usize) {
        let consumers: Vec<usize> = self
            .with_filter(filter_id, |f, _| {
                f.output_pids
                    .lock()
                    .unwrap()
                    .iter()
                    .flat_map(|out| out.destinations.iter().map(|d| d.consumer_filter))
                    .collect()
            })
            .unwrap_or_default();
        if consumers.is_empty() {
            return;
        }
        if let Some(scheduler) = self.scheduler.lock().unwrap().as_ref() {
            for consumer in consumers {
                scheduler.post_task(Task::process(consumer));
            }
        }
    }

    /// Drains any `negotiate_property` request the filter queued during
    /// the `process` call that just returned (§4.3).
    fn handle_pending_negotiation(&self, filter_id: usize) {
        let pending = self.with_filter(filter_id, |f, _| f.take_pending_negotiation()).flatten();
        let Some(req) = pending else { return };
        if let Err(e) = self.negotiate_property(filter_id, req.pid_id, req.key, req.desired) {
            warn!(filter = filter_id, error = %e, "capability renegotiation failed");
        } else if let Some(scheduler) = self.scheduler.lock().unwrap().as_ref() {
            scheduler.post_task(Task::process(filter_id));
        }
    }
}

impl SchedulerHost for Session {
    fn run_process(&self, filter_id: usize) -> ProcessResult {
        let result = self
            .with_filter(filter_id, |f, c| {
                let ctx = FilterContext { filter: f.as_ref() };
                c.process(&ctx)
            })
            .unwrap_or(Ok(crate::error::ProcessStatus::Eos));
        self.notify_downstream(filter_id);
        self.handle_pending_negotiation(filter_id);
        result
    }

    fn try_enter(&self, filter_id: usize) -> bool {
        self.with_filter(filter_id, |f, _| f.try_enter()).unwrap_or(false)
    }

    fn exit(&self, filter_id: usize) {
        self.with_filter(filter_id, |f, _| f.exit());
    }

    fn notify(&self, filter_id: usize) -> bool {
        self.with_filter(filter_id, |f, _| {
            let was_idle = !f.is_scheduled();
            f.notify();
            was_idle
        })
        .unwrap_or(false)
    }

    fn take_notification(&self, filter_id: usize) -> bool {
        self.with_filter(filter_id, |f, _| f.take_notification()).unwrap_or(false)
    }

    fn is_scheduled(&self, filter_id: usize) -> bool {
        self.with_filter(filter_id, |f, _| f.is_scheduled()).unwrap_or(false)
    }

    fn main_thread_affinity(&self, filter_id: usize) -> bool {
        let instance_flag = self
            .with_filter(filter_id, |f, _| f.flags.main_thread_affinity.load(Ordering::SeqCst))
            .unwrap_or(false);
        if instance_flag {
            return true;
        }
        self.filter_register_name(filter_id)
            .map(|name| self.register_flags(name).contains(RegisterFlags::MAIN_THREAD))
            .unwrap_or(false)
    }

    fn is_blocking_source(&self, filter_id: usize) -> bool {
        let instance_flag = self
            .with_filter(filter_id, |f, _| f.flags.blocking_source.load(Ordering::SeqCst))
            .unwrap_or(false);
        if instance_flag {
            return true;
        }
        self.filter_register_name(filter_id)
            .map(|name| self.register_flags(name).contains(RegisterFlags::BLOCKING))
            .unwrap_or(false)
    }

    fn scheduled_time(&self, filter_id: usize) -> Option<Instant> {
        self.with_filter(filter_id, |f, _| *f.schedule_next_time.lock().unwrap())
            .flatten()
    }

    fn clear_scheduled_time(&self, filter_id: usize) {
        self.with_filter(filter_id, |f, _| *f.schedule_next_time.lock().unwrap() = None);
    }

    fn record_health(&self, filter_id: usize, result: &ProcessResult, now: Instant) -> bool {
        if let Err(e) = result {
            self.errors.lock().unwrap().set_process_error(e.clone());
        }
        self.with_filter(filter_id, |f, _| f.health.record(result, now)).unwrap_or(false)
    }

    fn disable_and_eos(&self, filter_id: usize) {
        self.with_filter(filter_id, |f, _| {
            f.lifecycle.disabled.store(true, Ordering::SeqCst);
            let outputs = f.output_pids.lock().unwrap();
            for out in outputs.iter() {
                out.set_eos();
            }
        });
    }

    fn is_disabled(&self, filter_id: usize) -> bool {
        self.with_filter(filter_id, |f, _| f.lifecycle.disabled.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    fn is_blocked(&self, filter_id: usize) -> bool {
        self.with_filter(filter_id, |f, _| f.is_blocked()).unwrap_or(false)
    }

    fn is_source(&self, filter_id: usize) -> bool {
        self.filter_register_name(filter_id)
            .map(|name| self.register_flags(name).contains(RegisterFlags::ACT_AS_SOURCE))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessStatus;
    use crate::packet::Packet;
    use crate::property::PropertyMap;
    use crate::resolver::Cap;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex as StdMutex;

    fn raw_cap(dir: CapFlags, codec: &'static str) -> Cap {
        Cap {
            key: "codec_id",
            value: PropertyValue::String(codec.to_string()),
            flags: dir,
            priority: 0,
        }
    }

    /// Emits a fixed number of packets with rising `cts` then EOS (scenario
    /// S1: plain pass-through).
    struct ScriptedSource {
        remaining: StdMutex<u32>,
    }

    impl FilterCallbacks for ScriptedSource {
        fn initialize(&self, ctx: &FilterContext) -> Result<(), FilterError> {
            ctx.filter
                .output_pids
                .lock()
                .unwrap()
                .push(OutputPid::new(0, ctx.filter.id, "out", 1000));
            Ok(())
        }
        fn configure_pid(&self, _ctx: &FilterContext, _pid_id: usize, _is_remove: bool) -> Result<(), FilterError> {
            Ok(())
        }
        fn process(&self, ctx: &FilterContext) -> ProcessResult {
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining == 0 {
                let outputs = ctx.filter.output_pids.lock().unwrap();
                outputs[0].set_eos();
                return Ok(ProcessStatus::Eos);
            }
            let outputs = ctx.filter.output_pids.lock().unwrap();
            let out = &outputs[0];
            let props = PropertyMap::new();
            let mut pck = Packet::new_shared(out.id, props, bytes::Bytes::new());
            pck.info.cts = Some((40u64) * (3 - *remaining as u64));
            let pck = Arc::new(pck);
            for dest in &out.destinations {
                dest.enqueue(pck.clone());
            }
            *remaining -= 1;
            // A source has no upstream packet to react to, so it has to
            // ask to run again itself; otherwise nothing else would ever
            // re-notify it and it would produce exactly one packet.
            ctx.filter.notify();
            Ok(ProcessStatus::Ok)
        }
    }

    /// Counts every packet it drains from its one input pid (scenario S1).
    /// Holds its tallies behind `Arc`s so a test can keep its own clone and
    /// observe what the sink saw after the scheduler drives it.
    struct CountingSink {
        count: Arc<AtomicUsize>,
        seen_cts: Arc<StdMutex<Vec<u64>>>,
    }

    impl FilterCallbacks for CountingSink {
        fn initialize(&self, _ctx: &FilterContext) -> Result<(), FilterError> {
            Ok(())
        }
        fn configure_pid(&self, _ctx: &FilterContext, _pid_id: usize, _is_remove: bool) -> Result<(), FilterError> {
            Ok(())
        }
        fn process(&self, ctx: &FilterContext) -> ProcessResult {
            let input_ids = ctx.filter.input_pids.lock().unwrap().clone();
            let Some(&pid_id) = input_ids.first() else {
                return Ok(ProcessStatus::Ok);
            };
            while let Some(pck) = ctx.filter.get_packet(pid_id) {
                if let Some(cts) = pck.info.cts {
                    self.seen_cts.lock().unwrap().push(cts);
                }
                self.count.fetch_add(1, Ordering::SeqCst);
                ctx.filter.drop_packet(pid_id);
            }
            Ok(ProcessStatus::Ok)
        }
    }

    fn source_register() -> Register {
        Register {
            name: "scripted_source",
            args: vec![],
            caps: vec![CapBundle::new().with_cap(raw_cap(CapFlags::OUTPUT, "RAW"))],
            flags: RegisterFlags::ACT_AS_SOURCE,
            callbacks: Box::new(|| {
                Box::new(ScriptedSource {
                    remaining: StdMutex::new(3),
                })
            }),
        }
    }

    fn sink_register() -> Register {
        Register {
            name: "counting_sink",
            args: vec![],
            caps: vec![CapBundle::new().with_cap(raw_cap(CapFlags::INPUT, "RAW"))],
            flags: RegisterFlags::empty(),
            callbacks: Box::new(|| {
                Box::new(CountingSink {
                    count: Arc::new(AtomicUsize::new(0)),
                    seen_cts: Arc::new(StdMutex::new(Vec::new())),
                })
            }),
        }
    }

    /// Accepts and re-emits RAW packets unchanged; stands in for a
    /// transform filter when a test needs a node with both an input and
    /// an output pid, e.g. to build a live chain that could cycle back.
    fn relay_register() -> Register {
        Register {
            name: "relay",
            args: vec![],
            caps: vec![
                CapBundle::new().with_cap(raw_cap(CapFlags::INPUT, "RAW")),
                CapBundle::new().with_cap(raw_cap(CapFlags::OUTPUT, "RAW")),
            ],
            flags: RegisterFlags::empty(),
            callbacks: Box::new(|| Box::new(PassThroughConverter)),
        }
    }

    /// Same shape as [`relay_register`], but opts its own register into
    /// `ALLOW_CYCLIC` so a test can exercise the named exception to
    /// live-graph cycle avoidance.
    fn cyclic_relay_register() -> Register {
        Register {
            name: "relay_cyclic",
            args: vec![],
            caps: vec![
                CapBundle::new().with_cap(raw_cap(CapFlags::INPUT, "RAW")),
                CapBundle::new().with_cap(raw_cap(CapFlags::OUTPUT, "RAW")),
            ],
            flags: RegisterFlags::ALLOW_CYCLIC,
            callbacks: Box::new(|| Box::new(PassThroughConverter)),
        }
    }

    /// Like [`sink_register`], but every instance shares `count`/`seen_cts`
    /// with the caller so a test can inspect what the sink drained.
    fn tracked_sink_register(count: Arc<AtomicUsize>, seen_cts: Arc<StdMutex<Vec<u64>>>) -> Register {
        Register {
            name: "counting_sink",
            args: vec![],
            caps: vec![CapBundle::new().with_cap(raw_cap(CapFlags::INPUT, "RAW"))],
            flags: RegisterFlags::empty(),
            callbacks: Box::new(move || {
                Box::new(CountingSink {
                    count: count.clone(),
                    seen_cts: seen_cts.clone(),
                })
            }),
        }
    }

    #[test]
    fn registers_are_listed_by_name() {
        let session = Session::new(SessionConfig::default());
        session.register_filter(source_register());
        session.register_filter(sink_register());
        assert_eq!(session.registry.lock().unwrap().registers.len(), 2);
    }

    #[test]
    fn unknown_register_is_rejected() {
        let session = Session::new(SessionConfig::default());
        let err = session.instantiate("nope", "").unwrap_err();
        assert!(matches!(err, SessionError::RegisterNotFound(_)));
    }

    #[test]
    fn scenario_s1_direct_connect_wires_a_pid_instance() {
        let session = Session::new(SessionConfig::default());
        session.register_filter(source_register());
        session.register_filter(sink_register());
        let src = session.instantiate("scripted_source", "").unwrap();
        let dst = session.instantiate("counting_sink", "").unwrap();
        let new_ids = session.connect(src, dst).unwrap();
        assert!(new_ids.is_empty(), "direct caps match needs no resolver hop");

        let queued = session
            .with_filter(src, |f, _| f.output_pids.lock().unwrap()[0].num_destinations())
            .unwrap();
        assert_eq!(queued, 1);
    }

    #[test]
    fn scenario_s1_source_drains_to_eos_through_the_scheduler() {
        let session = Session::new(SessionConfig::builder().threads(0).build());
        session.register_filter(source_register());
        let count = Arc::new(AtomicUsize::new(0));
        let seen_cts = Arc::new(StdMutex::new(Vec::new()));
        session.register_filter(tracked_sink_register(count.clone(), seen_cts.clone()));
        let src = session.instantiate("scripted_source", "").unwrap();
        let dst = session.instantiate("counting_sink", "").unwrap();
        session.connect(src, dst).unwrap();

        session.run();

        // S1: sink observes exactly 3 packets with CTS 0, 40, 80, then EOS.
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(*seen_cts.lock().unwrap(), vec![0, 40, 80]);
        assert!(session
            .with_filter(src, |f, _| f.output_pids.lock().unwrap()[0].is_eos())
            .unwrap());
        let drained = session
            .with_filter(src, |f, _| f.output_pids.lock().unwrap()[0].destinations[0].queue_len())
            .unwrap();
        assert_eq!(drained, 0, "every delivered packet must have been popped by the sink");
    }

    #[test]
    fn scenario_s6_abort_none_stops_processing_before_run() {
        let session = Session::new(SessionConfig::builder().threads(0).build());
        session.register_filter(source_register());
        session.register_filter(sink_register());
        let src = session.instantiate("scripted_source", "").unwrap();
        let dst = session.instantiate("counting_sink", "").unwrap();
        session.connect(src, dst).unwrap();

        session.abort(AbortMode::None);
        session.run();

        let delivered = session
            .with_filter(src, |f, _| {
                let outputs = f.output_pids.lock().unwrap();
                outputs[0].destinations[0].queue_len()
            })
            .unwrap();
        assert_eq!(delivered, 0, "abort(None) must suppress every process call");
    }

    #[test]
    fn implicit_mode_auto_wires_unconnected_source_and_sink() {
        let session = Session::new(SessionConfig::builder().threads(0).build());
        session.register_filter(source_register());
        let count = Arc::new(AtomicUsize::new(0));
        let seen_cts = Arc::new(StdMutex::new(Vec::new()));
        session.register_filter(tracked_sink_register(count.clone(), seen_cts.clone()));
        let src = session.instantiate("scripted_source", "").unwrap();
        let dst = session.instantiate("counting_sink", "").unwrap();

        // Neither `connect` nor `wire_direct` is called: implicit mode must
        // find this pair on its own once `run` kicks it off.
        session.run();

        assert_eq!(count.load(Ordering::SeqCst), 3, "implicit linking must wire src to dst before running");
        assert_eq!(*seen_cts.lock().unwrap(), vec![0, 40, 80]);
    }

    #[test]
    fn implicit_linking_disabled_leaves_filters_unconnected() {
        let session = Session::new(SessionConfig::builder().threads(0).implicit_linking(false).build());
        session.register_filter(source_register());
        let count = Arc::new(AtomicUsize::new(0));
        let seen_cts = Arc::new(StdMutex::new(Vec::new()));
        session.register_filter(tracked_sink_register(count.clone(), seen_cts.clone()));
        session.instantiate("scripted_source", "").unwrap();
        session.instantiate("counting_sink", "").unwrap();

        let linked = session.resolve_implicit_links().unwrap();
        assert!(linked.is_empty(), "implicit_linking(false) must disable auto-pairing");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn connect_refuses_to_close_a_cycle_in_the_live_graph() {
        let session = Session::new(SessionConfig::builder().threads(0).build());
        session.register_filter(relay_register());
        let a = session.instantiate("relay", "").unwrap();
        let b = session.instantiate("relay", "").unwrap();
        session.connect(a, b).unwrap();

        let err = session.connect(b, a).unwrap_err();
        assert!(matches!(err, SessionError::WouldCloseCycle { .. }));

        let queued = session
            .with_filter(b, |f, _| f.output_pids.lock().unwrap()[0].num_destinations())
            .unwrap();
        assert_eq!(queued, 0, "the rejected connect must not have wired anything");
    }

    #[test]
    fn connect_allows_a_cycle_when_the_destination_register_opts_in() {
        let session = Session::new(SessionConfig::builder().threads(0).build());
        session.register_filter(cyclic_relay_register());
        session.register_filter(relay_register());
        let a = session.instantiate("relay_cyclic", "").unwrap();
        let b = session.instantiate("relay", "").unwrap();
        session.connect(a, b).unwrap();

        let new_ids = session.connect(b, a).unwrap();
        assert!(new_ids.is_empty(), "direct caps match needs no resolver hop");

        let queued = session
            .with_filter(b, |f, _| f.output_pids.lock().unwrap()[0].num_destinations())
            .unwrap();
        assert_eq!(queued, 1, "ALLOW_CYCLIC on the destination register must let the loop close");
    }

    /// Emits two packets tagged `pixfmt=YUV420` then EOS.
    struct PixfmtSource {
        remaining: StdMutex<u32>,
    }

    impl FilterCallbacks for PixfmtSource {
        fn initialize(&self, ctx: &FilterContext) -> Result<(), FilterError> {
            ctx.filter
                .output_pids
                .lock()
                .unwrap()
                .push(OutputPid::new(0, ctx.filter.id, "out", 1000));
            Ok(())
        }
        fn configure_pid(&self, _ctx: &FilterContext, _pid_id: usize, _is_remove: bool) -> Result<(), FilterError> {
            Ok(())
        }
        fn process(&self, ctx: &FilterContext) -> ProcessResult {
            let mut remaining = self.remaining.lock().unwrap();
            let outputs = ctx.filter.output_pids.lock().unwrap();
            let out = &outputs[0];
            if *remaining == 0 {
                out.set_eos();
                return Ok(ProcessStatus::Eos);
            }
            let pck = Arc::new(Packet::new_shared(out.id, PropertyMap::new(), bytes::Bytes::new()));
            for dest in &out.destinations {
                dest.enqueue(pck.clone());
            }
            *remaining -= 1;
            ctx.filter.notify();
            Ok(ProcessStatus::Ok)
        }
    }

    fn pixfmt_source_register() -> Register {
        Register {
            name: "pixfmt_source",
            args: vec![],
            caps: vec![CapBundle::new().with_cap(Cap {
                key: "pixfmt",
                value: PropertyValue::String("YUV420".into()),
                flags: CapFlags::OUTPUT,
                priority: 0,
            })],
            flags: RegisterFlags::ACT_AS_SOURCE,
            callbacks: Box::new(|| Box::new(PixfmtSource { remaining: StdMutex::new(2) })),
        }
    }

    fn yuv_to_rgb_register() -> Register {
        Register {
            name: "yuv_to_rgb",
            args: vec![],
            caps: vec![
                CapBundle::new().with_cap(Cap {
                    key: "pixfmt",
                    value: PropertyValue::String("YUV420".into()),
                    flags: CapFlags::INPUT,
                    priority: 0,
                }),
                CapBundle::new().with_cap(Cap {
                    key: "pixfmt",
                    value: PropertyValue::String("RGB".into()),
                    flags: CapFlags::OUTPUT,
                    priority: 0,
                }),
            ],
            flags: RegisterFlags::empty(),
            callbacks: Box::new(|| Box::new(PassThroughConverter)),
        }
    }

    /// A single-in/single-out filter that simply re-enqueues every packet
    /// it drains, used to stand in for a real pixel-format converter.
    struct PassThroughConverter;

    impl FilterCallbacks for PassThroughConverter {
        fn initialize(&self, ctx: &FilterContext) -> Result<(), FilterError> {
            ctx.filter
                .output_pids
                .lock()
                .unwrap()
                .push(OutputPid::new(0, ctx.filter.id, "out", 1000));
            Ok(())
        }
        fn configure_pid(&self, _ctx: &FilterContext, _pid_id: usize, _is_remove: bool) -> Result<(), FilterError> {
            Ok(())
        }
        fn process(&self, ctx: &FilterContext) -> ProcessResult {
            let input_ids = ctx.filter.input_pids.lock().unwrap().clone();
            let Some(&pid_id) = input_ids.first() else {
                return Ok(ProcessStatus::Ok);
            };
            let outputs = ctx.filter.output_pids.lock().unwrap();
            while let Some(pck) = ctx.filter.get_packet(pid_id) {
                if let Some(out) = outputs.first() {
                    for dest in &out.destinations {
                        dest.enqueue(pck.clone());
                    }
                }
                ctx.filter.drop_packet(pid_id);
            }
            Ok(ProcessStatus::Ok)
        }
    }

    /// Rejects the first packet it sees unless `pixfmt=RGB` is already
    /// published on its input, requesting renegotiation exactly once.
    struct PixfmtSink {
        negotiated: AtomicBool,
        accepted: Arc<AtomicUsize>,
    }

    impl FilterCallbacks for PixfmtSink {
        fn initialize(&self, _ctx: &FilterContext) -> Result<(), FilterError> {
            Ok(())
        }
        fn configure_pid(&self, _ctx: &FilterContext, _pid_id: usize, _is_remove: bool) -> Result<(), FilterError> {
            Ok(())
        }
        fn process(&self, ctx: &FilterContext) -> ProcessResult {
            let input_ids = ctx.filter.input_pids.lock().unwrap().clone();
            let Some(&pid_id) = input_ids.first() else {
                return Ok(ProcessStatus::Ok);
            };
            if !self.negotiated.load(Ordering::SeqCst) {
                if ctx.filter.get_packet(pid_id).is_some() {
                    self.negotiated.store(true, Ordering::SeqCst);
                    ctx.filter
                        .request_negotiation(pid_id, "pixfmt", PropertyValue::String("RGB".into()));
                }
                return Ok(ProcessStatus::Ok);
            }
            while let Some(_pck) = ctx.filter.get_packet(pid_id) {
                self.accepted.fetch_add(1, Ordering::SeqCst);
                ctx.filter.drop_packet(pid_id);
            }
            Ok(ProcessStatus::Ok)
        }
    }

    fn pixfmt_sink_register(accepted: Arc<AtomicUsize>) -> Register {
        Register {
            name: "pixfmt_sink",
            args: vec![],
            caps: vec![CapBundle::new().with_cap(Cap {
                key: "pixfmt",
                value: PropertyValue::String("RGB".into()),
                flags: CapFlags::INPUT,
                priority: 0,
            })],
            flags: RegisterFlags::empty(),
            callbacks: Box::new(move || {
                Box::new(PixfmtSink {
                    negotiated: AtomicBool::new(false),
                    accepted: accepted.clone(),
                })
            }),
        }
    }

    #[test]
    fn scenario_s4_capability_renegotiation_inserts_an_adapter() {
        let session = Session::new(SessionConfig::default());
        session.register_filter(pixfmt_source_register());
        session.register_filter(yuv_to_rgb_register());
        let accepted = Arc::new(AtomicUsize::new(0));
        session.register_filter(pixfmt_sink_register(accepted.clone()));

        let src = session.instantiate("pixfmt_source", "").unwrap();
        let dst = session.instantiate("pixfmt_sink", "").unwrap();
        // Wire source straight to sink, as if an earlier negotiation had
        // settled on a format the sink no longer accepts — bypasses
        // `connect`'s own implicit resolution so the mismatch survives
        // long enough for the sink to reject it and renegotiate.
        session.wire_direct(src, dst).unwrap();
        let stale_pid_id = session.with_filter(dst, |f, _| f.input_pids.lock().unwrap()[0]).unwrap();

        // Drive both filters by hand once, rather than through the
        // scheduler, so the rejection/renegotiation sequencing is
        // deterministic instead of racing against the source's own
        // self-reschedule (§4.6's burst loop would otherwise run the
        // source to completion before the sink ever saw packet one).
        session
            .with_filter(src, |f, c| c.process(&FilterContext { filter: f.as_ref() }))
            .unwrap()
            .unwrap();
        session
            .with_filter(dst, |f, c| c.process(&FilterContext { filter: f.as_ref() }))
            .unwrap()
            .unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 0, "first packet is rejected, not counted");

        session.handle_pending_negotiation(dst);

        // The stale direct wiring is gone, and the sink's pid-instance now
        // comes from the newly-inserted `yuv_to_rgb` adapter rather than
        // directly from the source.
        let new_pid_id = session.with_filter(dst, |f, _| f.input_pids.lock().unwrap()[0]).unwrap();
        assert_ne!(new_pid_id, stale_pid_id, "sink's pid-instance must be swapped, not reused");
        assert_ne!(
            session.find_producer_of(new_pid_id),
            Some(src),
            "the sink's new producer must be the adapter, not the original source"
        );
        let direct_wiring_gone = session
            .with_filter(src, |f, _| f.output_pids.lock().unwrap()[0].destinations.iter().all(|d| d.consumer_filter != dst))
            .unwrap();
        assert!(direct_wiring_gone, "producer must no longer feed the sink directly");

        // Feeding the adapter now reaches the sink as a converted packet.
        let adapter_id = session.find_producer_of(new_pid_id).unwrap();
        session
            .with_filter(src, |f, c| c.process(&FilterContext { filter: f.as_ref() }))
            .unwrap()
            .unwrap();
        session
            .with_filter(adapter_id, |f, c| c.process(&FilterContext { filter: f.as_ref() }))
            .unwrap()
            .unwrap();
        session
            .with_filter(dst, |f, c| c.process(&FilterContext { filter: f.as_ref() }))
            .unwrap()
            .unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1, "second packet arrives converted and is accepted");
    }

    #[test]
    fn resolution_fails_cleanly_when_no_path_exists() {
        let session = Session::new(SessionConfig::default());
        session.register_filter(source_register());
        let lone_sink = Register {
            name: "incompatible_sink",
            args: vec![],
            caps: vec![CapBundle::new().with_cap(raw_cap(CapFlags::INPUT, "OTHER"))],
            flags: RegisterFlags::empty(),
            callbacks: Box::new(|| {
                Box::new(CountingSink {
                    count: Arc::new(AtomicUsize::new(0)),
                    seen_cts: Arc::new(StdMutex::new(Vec::new())),
                })
            }),
        };
        session.register_filter(lone_sink);
        let src = session.instantiate("scripted_source", "").unwrap();
        let dst = session.instantiate("incompatible_sink", "").unwrap();
        let err = session.connect(src, dst).unwrap_err();
        assert!(matches!(err, SessionError::ResolutionFailed { .. }));
    }
}
