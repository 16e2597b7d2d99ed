//! The task scheduler (§4.6): per-filter serialization, main-thread
//! affinity, blocking-source handling, timed reschedule, and termination
//! detection.
//!
//! Grounded on this workspace's existing worker-thread shape (a
//! background thread fed by a bounded/unbounded `crossbeam_channel`,
//! shut down by sending a sentinel and joining): the scheduler here
//! keeps that same "channel of work, dedicated worker threads" idiom,
//! generalized to per-filter serialization and multi-queue routing
//! across many concurrently-runnable filters.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use quanta::Instant;
use tracing::{debug, warn};

use crate::config::{AbortMode, SessionConfig};
use crate::error::{ProcessResult, ProcessStatus};

/// Per-task scheduling hints (§3 "Task").
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFlags {
    /// Placed on a session queue rather than run inline.
    pub notified: bool,
    /// May be reordered within the filter's private queue.
    pub can_swap: bool,
    /// Must run on thread 0.
    pub force_main: bool,
}

/// Identifies what kind of cleanup a cancelled task needs (§4.6
/// "Cancellation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    Process,
    Configure,
    Destroy,
    Event,
    PostInit,
}

/// One unit of scheduled work against a filter.
#[derive(Debug, Clone)]
pub struct Task {
    pub filter_id: usize,
    pub pid_id: Option<usize>,
    pub opaque: Option<String>,
    pub scheduled_time: Option<Instant>,
    pub flags: TaskFlags,
    pub class: TaskClass,
}

impl Task {
    pub fn process(filter_id: usize) -> Self {
        Task {
            filter_id,
            pid_id: None,
            opaque: None,
            scheduled_time: None,
            flags: TaskFlags::default(),
            class: TaskClass::Process,
        }
    }

    pub fn with_flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// The scheduler's view of a filter: everything it needs without
/// touching filter-internal state directly (the scheduler itself "holds
/// no filter-internal locks", §2). Implemented by the session, which
/// owns the actual `Filter`/`FilterCallbacks` pairing.
pub trait SchedulerHost: Send + Sync {
    /// Invokes the filter's `process` callback once.
    fn run_process(&self, filter_id: usize) -> ProcessResult;
    /// Enters the filter's serialized section; `false` if already running.
    fn try_enter(&self, filter_id: usize) -> bool;
    fn exit(&self, filter_id: usize);
    /// Increments the pending-work counter; returns `true` if this
    /// transitioned the filter from idle to scheduled (i.e. a dispatch
    /// ticket must be posted).
    fn notify(&self, filter_id: usize) -> bool;
    /// Consumes one pending-work unit; `false` if there was none.
    fn take_notification(&self, filter_id: usize) -> bool;
    fn is_scheduled(&self, filter_id: usize) -> bool;
    fn main_thread_affinity(&self, filter_id: usize) -> bool;
    fn is_blocking_source(&self, filter_id: usize) -> bool;
    fn scheduled_time(&self, filter_id: usize) -> Option<Instant>;
    fn clear_scheduled_time(&self, filter_id: usize);
    /// Records the outcome against the filter's health state; `true` if
    /// the filter must now be force-disabled (§4.6, §7).
    fn record_health(&self, filter_id: usize, result: &ProcessResult, now: Instant) -> bool;
    fn disable_and_eos(&self, filter_id: usize);
    fn is_disabled(&self, filter_id: usize) -> bool;
    /// `would_block + num_unconnected_outputs >= num_outputs` (§3, §5,
    /// invariant 3): `process` must not be invoked while this holds.
    fn is_blocked(&self, filter_id: usize) -> bool;
    /// Register declares `ACT_AS_SOURCE` (§4.6 "Cancellation", `Fast`
    /// flush policy: new production stops, already in-flight packets are
    /// left to drain downstream rather than being dropped outright).
    fn is_source(&self, filter_id: usize) -> bool;
}

/// Multi-queue cooperative scheduler (§4.6).
pub struct Scheduler {
    host: Arc<dyn SchedulerHost>,
    main_tasks: (Sender<Task>, Receiver<Task>),
    general_tasks: (Sender<Task>, Receiver<Task>),
    /// Per-filter private FIFO (§4.6): the session-global queues only
    /// ever carry one "dispatch ticket" per scheduled filter; the actual
    /// queued tasks live here.
    filter_queues: Mutex<HashMap<usize, VecDeque<Task>>>,
    num_workers: usize,
    max_burst: usize,
    max_sleep: Duration,
    /// Acts as the "semaphore" woken by any `post_task` (§4.6 "Timed
    /// tasks"): a capacity-1 channel collapses redundant wakeups.
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    eot: Vec<AtomicBool>,
    aborted: AtomicBool,
    abort_mode: Mutex<Option<AbortMode>>,
    terminated: AtomicBool,
}

impl Scheduler {
    pub fn new(host: Arc<dyn SchedulerHost>, config: &SessionConfig) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        // Slot 0 is always the main thread; slots 1..=threads are workers.
        let eot = (0..=config.threads).map(|_| AtomicBool::new(false)).collect();
        Scheduler {
            host,
            main_tasks: unbounded(),
            general_tasks: unbounded(),
            filter_queues: Mutex::new(HashMap::new()),
            num_workers: config.threads,
            max_burst: config.max_tasks_per_filter_burst,
            max_sleep: Duration::from_millis(config.max_sleep_ms),
            wake_tx,
            wake_rx,
            eot,
            aborted: AtomicBool::new(false),
            abort_mode: Mutex::new(None),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Posts a task against a filter (§4.6). If the filter was idle, a
    /// dispatch ticket is routed to the appropriate session FIFO.
    pub fn post_task(&self, task: Task) {
        if self.host.is_disabled(task.filter_id) {
            return;
        }
        let filter_id = task.filter_id;
        let flags = task.flags;
        {
            let mut queues = self.filter_queues.lock().unwrap();
            queues.entry(filter_id).or_default().push_back(task);
        }
        let was_idle = self.host.notify(filter_id);
        if was_idle {
            self.dispatch(filter_id, flags);
        }
        let _ = self.wake_tx.try_send(());
    }

    fn dispatch(&self, filter_id: usize, flags: TaskFlags) {
        let ticket = Task {
            filter_id,
            pid_id: None,
            opaque: None,
            scheduled_time: None,
            flags,
            class: TaskClass::Process,
        };
        if self.host.is_blocking_source(filter_id) {
            // §4.6 "Blocking sources": a producer task from a blocking
            // source never runs on the main thread, the same way a
            // main-thread-affine filter is always routed to it.
            let _ = self.general_tasks.0.send(ticket);
        } else if flags.force_main || self.host.main_thread_affinity(filter_id) {
            let _ = self.main_tasks.0.send(ticket);
        } else {
            let _ = self.general_tasks.0.send(ticket);
        }
        let _ = self.wake_tx.try_send(());
    }

    pub fn abort(&self, mode: AbortMode) {
        self.aborted.store(true, Ordering::SeqCst);
        *self.abort_mode.lock().unwrap() = Some(mode);
        debug!(?mode, "scheduler abort requested");
    }

    fn abort_mode(&self) -> Option<AbortMode> {
        *self.abort_mode.lock().unwrap()
    }

    /// Runs the scheduler: spawns `num_workers` background threads and
    /// runs the main-thread loop on the calling thread until termination
    /// is detected. `threads=0` degenerates to running everything,
    /// including tasks routed to the general queue, on the caller (§5
    /// "Single-threaded mode... is a first-class configuration").
    pub fn run(self: &Arc<Self>) {
        let mut handles = Vec::new();
        for idx in 1..=self.num_workers {
            let sched = Arc::clone(self);
            handles.push(
                thread::Builder::new()
                    .name(format!("skein-worker-{idx}"))
                    .spawn(move || sched.worker_loop(idx, false))
                    .expect("failed to spawn scheduler worker"),
            );
        }
        self.worker_loop(0, true);
        for h in handles {
            let _ = h.join();
        }
    }

    /// Runs one cooperative pass over both queues without blocking;
    /// returns `true` if any work was done. Used directly by tests and
    /// by single-threaded (`threads=0`) callers that want to drive the
    /// scheduler without spawning a thread.
    pub fn step_once(&self) -> bool {
        if let Some(ticket) = self.next_ticket(true) {
            self.handle_ticket(true, ticket);
            true
        } else {
            false
        }
    }

    /// Drives the scheduler to completion on the calling thread
    /// (`threads=0` mode), returning once termination is detected.
    pub fn run_single_threaded(&self) {
        self.worker_loop(0, true);
    }

    fn next_ticket(&self, is_main: bool) -> Option<Task> {
        if is_main {
            if let Ok(t) = self.main_tasks.1.try_recv() {
                return Some(t);
            }
        }
        self.general_tasks.1.try_recv().ok()
    }

    fn worker_loop(&self, worker_idx: usize, is_main: bool) {
        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return;
            }
            match self.next_ticket(is_main) {
                Some(ticket) => {
                    self.eot[worker_idx].store(false, Ordering::SeqCst);
                    self.handle_ticket(is_main, ticket);
                }
                None => {
                    self.eot[worker_idx].store(true, Ordering::SeqCst);
                    if self.all_eot() {
                        self.terminated.store(true, Ordering::SeqCst);
                        for _ in 0..self.eot.len() {
                            let _ = self.wake_tx.try_send(());
                        }
                        return;
                    }
                    let _ = self.wake_rx.recv_timeout(self.compute_sleep());
                }
            }
        }
    }

    fn all_eot(&self) -> bool {
        self.eot.iter().all(|f| f.load(Ordering::SeqCst))
    }

    /// §4.6 "Timed tasks": single-threaded mode clips the sleep to 5ms
    /// once the general FIFO has backed up, so a ready task isn't stuck
    /// behind a long nap.
    fn compute_sleep(&self) -> Duration {
        if self.num_workers == 0 && self.general_tasks.1.len() >= 2 {
            Duration::from_millis(5).min(self.max_sleep)
        } else {
            self.max_sleep
        }
    }

    fn handle_ticket(&self, is_main: bool, ticket: Task) {
        let filter_id = ticket.filter_id;

        // §4.6 "Blocking sources": never run on the main thread. Queried
        // from the host rather than a task flag, since whether a filter is
        // a blocking source doesn't change task to task. Only enforced when
        // a worker thread actually exists to pick the ticket back up —
        // in `threads=0` mode the main loop is the only thread there is,
        // so bouncing the ticket would spin forever.
        if self.host.is_blocking_source(filter_id) && is_main && self.num_workers > 0 {
            let _ = self.general_tasks.0.send(ticket);
            return;
        }
        // §4.6 "Main-thread affinity": re-post if picked up elsewhere.
        if self.host.main_thread_affinity(filter_id) && !is_main {
            let _ = self.main_tasks.0.send(ticket);
            return;
        }

        if !self.host.try_enter(filter_id) {
            // Another worker is already inside this filter's serialized
            // section (§8 invariant 2); re-queue rather than wait.
            self.dispatch(filter_id, ticket.flags);
            return;
        }

        if self.aborted.load(Ordering::SeqCst) {
            let mode = self.abort_mode();
            // `None`: drop everything immediately. `Fast`: stop sources
            // from producing further packets but let already-queued work
            // on non-source filters keep draining toward EOS (§4.6
            // "Cancellation"). `Full` runs every filter to its natural
            // EOS, so it needs no special casing here.
            let must_stop = mode == Some(AbortMode::None) || (mode == Some(AbortMode::Fast) && self.host.is_source(filter_id));
            if must_stop {
                self.host.exit(filter_id);
                return;
            }
        }

        let mut burst = 0usize;
        loop {
            if !self.host.take_notification(filter_id) {
                break;
            }
            if let Some(due) = self.host.scheduled_time(filter_id) {
                if due > Instant::now() {
                    // Not due yet: restore the pending notification and
                    // stop this burst without running `process`.
                    self.host.notify(filter_id);
                    break;
                }
                self.host.clear_scheduled_time(filter_id);
            }

            if self.host.is_blocked(filter_id) {
                // §8 invariant 3: restore the pending notification and stop
                // without calling `process`; a downstream drop (or another
                // producer waking this filter) is what lifts the block.
                self.host.notify(filter_id);
                break;
            }

            let now = Instant::now();
            let result = self.host.run_process(filter_id);
            if self.host.record_health(filter_id, &result, now) {
                warn!(filter_id, "filter force-disabled by health check");
                self.host.disable_and_eos(filter_id);
                self.host.exit(filter_id);
                return;
            }
            if matches!(result, Ok(ProcessStatus::Eos)) {
                break;
            }

            burst += 1;
            if burst >= self.max_burst {
                // Amortizes context switches (§4.6) but must not starve
                // the rest of the session FIFO indefinitely.
                self.host.notify(filter_id);
                break;
            }
        }

        self.host.exit(filter_id);
        if self.host.is_scheduled(filter_id) {
            self.dispatch(filter_id, ticket.flags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::AtomicUsize;

    /// A host driving a fixed, per-filter sequence of `process` outcomes.
    struct MockHost {
        scripts: Mutex<HashMap<usize, VecDeque<ProcessResult>>>,
        running: Mutex<std::collections::HashSet<usize>>,
        pending: HashMap<usize, AtomicU64>,
        disabled: Mutex<std::collections::HashSet<usize>>,
        blocked: Mutex<std::collections::HashSet<usize>>,
        sources: Mutex<std::collections::HashSet<usize>>,
        blocking_sources: Mutex<std::collections::HashSet<usize>>,
        run_count: AtomicUsize,
        concurrent_violation: AtomicBool,
    }

    impl MockHost {
        fn new(scripts: HashMap<usize, VecDeque<ProcessResult>>) -> Self {
            let pending = scripts.keys().map(|&id| (id, AtomicU64::new(0))).collect();
            MockHost {
                scripts: Mutex::new(scripts),
                running: Mutex::new(std::collections::HashSet::new()),
                pending,
                disabled: Mutex::new(std::collections::HashSet::new()),
                blocked: Mutex::new(std::collections::HashSet::new()),
                sources: Mutex::new(std::collections::HashSet::new()),
                blocking_sources: Mutex::new(std::collections::HashSet::new()),
                run_count: AtomicUsize::new(0),
                concurrent_violation: AtomicBool::new(false),
            }
        }
    }

    impl SchedulerHost for MockHost {
        fn run_process(&self, filter_id: usize) -> ProcessResult {
            self.run_count.fetch_add(1, Ordering::SeqCst);
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .get_mut(&filter_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(Ok(ProcessStatus::Eos))
        }
        fn try_enter(&self, filter_id: usize) -> bool {
            let mut running = self.running.lock().unwrap();
            if running.contains(&filter_id) {
                self.concurrent_violation.store(true, Ordering::SeqCst);
                false
            } else {
                running.insert(filter_id);
                true
            }
        }
        fn exit(&self, filter_id: usize) {
            self.running.lock().unwrap().remove(&filter_id);
        }
        fn notify(&self, filter_id: usize) -> bool {
            self.pending[&filter_id].fetch_add(1, Ordering::SeqCst) == 0
        }
        fn take_notification(&self, filter_id: usize) -> bool {
            self.pending[&filter_id].swap(0, Ordering::SeqCst) > 0
        }
        fn is_scheduled(&self, filter_id: usize) -> bool {
            self.pending[&filter_id].load(Ordering::SeqCst) > 0
        }
        fn main_thread_affinity(&self, _filter_id: usize) -> bool {
            false
        }
        fn is_blocking_source(&self, filter_id: usize) -> bool {
            self.blocking_sources.lock().unwrap().contains(&filter_id)
        }
        fn scheduled_time(&self, _filter_id: usize) -> Option<Instant> {
            None
        }
        fn clear_scheduled_time(&self, _filter_id: usize) {}
        fn record_health(&self, _filter_id: usize, result: &ProcessResult, now: Instant) -> bool {
            match result {
                Ok(_) => false,
                Err(e) => {
                    let _ = now;
                    e.counts_toward_health()
                }
            }
        }
        fn disable_and_eos(&self, filter_id: usize) {
            self.disabled.lock().unwrap().insert(filter_id);
        }
        fn is_disabled(&self, filter_id: usize) -> bool {
            self.disabled.lock().unwrap().contains(&filter_id)
        }
        fn is_blocked(&self, filter_id: usize) -> bool {
            self.blocked.lock().unwrap().contains(&filter_id)
        }
        fn is_source(&self, filter_id: usize) -> bool {
            self.sources.lock().unwrap().contains(&filter_id)
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            threads: 0,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn runs_until_eos_and_terminates() {
        let mut script = VecDeque::new();
        script.push_back(Ok(ProcessStatus::Ok));
        script.push_back(Ok(ProcessStatus::Ok));
        script.push_back(Ok(ProcessStatus::Eos));
        let mut scripts = HashMap::new();
        scripts.insert(0usize, script);
        let host = Arc::new(MockHost::new(scripts));
        let sched = Scheduler::new(host.clone(), &test_config());
        sched.post_task(Task::process(0));
        sched.run_single_threaded();
        assert!(sched.is_terminated());
        assert_eq!(host.run_count.load(Ordering::SeqCst), 3);
        assert!(!host.concurrent_violation.load(Ordering::SeqCst));
    }

    #[test]
    fn health_failure_disables_filter() {
        let mut script = VecDeque::new();
        for _ in 0..5 {
            script.push_back(Err(FilterError::IoErr("boom".into())));
        }
        let mut scripts = HashMap::new();
        scripts.insert(0usize, script);
        let host = Arc::new(MockHost::new(scripts));
        let sched = Scheduler::new(host.clone(), &test_config());
        sched.post_task(Task::process(0));
        // record_health here always flags health as exceeded after the
        // first error since MockHost has no time-window logic; verifies
        // the scheduler correctly reacts to `true` regardless of cause.
        sched.run_single_threaded();
        assert!(host.disabled.lock().unwrap().contains(&0));
    }

    #[test]
    fn two_filters_both_drain_independently() {
        let mut s0 = VecDeque::new();
        s0.push_back(Ok(ProcessStatus::Ok));
        s0.push_back(Ok(ProcessStatus::Eos));
        let mut s1 = VecDeque::new();
        s1.push_back(Ok(ProcessStatus::Eos));
        let mut scripts = HashMap::new();
        scripts.insert(0usize, s0);
        scripts.insert(1usize, s1);
        let host = Arc::new(MockHost::new(scripts));
        let sched = Scheduler::new(host.clone(), &test_config());
        sched.post_task(Task::process(0));
        sched.post_task(Task::process(1));
        sched.run_single_threaded();
        assert!(sched.is_terminated());
    }

    #[test]
    fn scenario_s3_blocked_filter_is_not_run_until_unblocked() {
        let mut script = VecDeque::new();
        for _ in 0..5 {
            script.push_back(Ok(ProcessStatus::Ok));
        }
        let mut scripts = HashMap::new();
        scripts.insert(0usize, script);
        let host = Arc::new(MockHost::new(scripts));
        host.blocked.lock().unwrap().insert(0);
        let sched = Scheduler::new(host.clone(), &test_config());
        sched.post_task(Task::process(0));

        for _ in 0..3 {
            assert!(sched.step_once(), "a blocked filter still consumes its dispatch ticket");
        }
        assert_eq!(host.run_count.load(Ordering::SeqCst), 0, "process must not run while blocked");
        assert!(host.is_scheduled(0), "the filter stays scheduled so it retries once unblocked");

        host.blocked.lock().unwrap().remove(&0);
        assert!(sched.step_once());
        assert_eq!(host.run_count.load(Ordering::SeqCst), 1, "process runs as soon as the block lifts");
    }

    #[test]
    fn fast_abort_stops_sources_but_lets_others_drain() {
        let mut source_script = VecDeque::new();
        for _ in 0..5 {
            source_script.push_back(Ok(ProcessStatus::Ok));
        }
        let mut sink_script = VecDeque::new();
        sink_script.push_back(Ok(ProcessStatus::Ok));
        sink_script.push_back(Ok(ProcessStatus::Ok));
        sink_script.push_back(Ok(ProcessStatus::Eos));
        let mut scripts = HashMap::new();
        scripts.insert(0usize, source_script);
        scripts.insert(1usize, sink_script);
        let host = Arc::new(MockHost::new(scripts));
        host.sources.lock().unwrap().insert(0);
        let sched = Scheduler::new(host.clone(), &test_config());
        sched.abort(AbortMode::Fast);
        sched.post_task(Task::process(0));
        sched.post_task(Task::process(1));
        sched.run_single_threaded();

        assert!(sched.is_terminated());
        assert_eq!(host.run_count.load(Ordering::SeqCst), 3, "only the non-source filter's 3 scripted calls ran");
    }

    #[test]
    fn blocking_source_ticket_bounces_off_the_main_thread() {
        let mut script = VecDeque::new();
        script.push_back(Ok(ProcessStatus::Ok));
        let mut scripts = HashMap::new();
        scripts.insert(0usize, script);
        let host = Arc::new(MockHost::new(scripts));
        host.blocking_sources.lock().unwrap().insert(0);
        let config = SessionConfig {
            threads: 1,
            ..SessionConfig::default()
        };
        let sched = Scheduler::new(host.clone(), &config);

        sched.post_task(Task::process(0));
        let ticket = sched.next_ticket(true).expect("dispatch posted a ticket");

        sched.handle_ticket(true, ticket.clone());
        assert_eq!(host.run_count.load(Ordering::SeqCst), 0, "must not run on the main thread");
        assert!(
            sched.next_ticket(false).is_some(),
            "handle_ticket re-posts a blocking source's ticket to the general queue rather than running it"
        );

        sched.handle_ticket(false, ticket);
        assert_eq!(host.run_count.load(Ordering::SeqCst), 1, "runs fine off the main thread");
    }

    #[test]
    fn abort_none_suppresses_further_process_calls() {
        let mut script = VecDeque::new();
        script.push_back(Ok(ProcessStatus::Ok));
        script.push_back(Ok(ProcessStatus::Ok));
        let mut scripts = HashMap::new();
        scripts.insert(0usize, script);
        let host = Arc::new(MockHost::new(scripts));
        let sched = Scheduler::new(host.clone(), &test_config());
        sched.abort(AbortMode::None);
        sched.post_task(Task::process(0));
        sched.run_single_threaded();
        assert_eq!(host.run_count.load(Ordering::SeqCst), 0);
    }
}
