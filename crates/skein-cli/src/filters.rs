//! Two minimal built-in filters the CLI registers so a pipeline has
//! something to run against. The engine itself ships no concrete filters
//! (demuxers, decoders, encoders are explicitly out of scope per the
//! core crate's own scope) — these are intentionally toy, generalizing
//! the `ScriptedSource`/`CountingSink` test harness in `skein-core` into
//! arg-configurable, loggable filters rather than a hardcoded script.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use skein_core::error::{FilterError, ProcessResult, ProcessStatus};
use skein_core::filter::{ArgDesc, ArgUpdatePolicy, FilterCallbacks, FilterContext, Register, RegisterFlags};
use skein_core::pid::OutputPid;
use skein_core::property::{PropertyMap, PropertyType, PropertyValue};
use skein_core::resolver::{Cap, CapBundle};

fn u32_arg(ctx: &FilterContext, name: &str, default: u32) -> u32 {
    match ctx.filter.args.get(name) {
        Some(PropertyValue::Uint(v)) => *v,
        _ => default,
    }
}

/// Emits `count` packets on a single RAW output, `interval_ts` timescale
/// units apart, then EOS (§4.6 "a source has no upstream packet to react
/// to and must ask to run again itself").
struct PatternSource {
    remaining: AtomicU64,
    interval_ts: AtomicU64,
    emitted: AtomicU64,
}

impl FilterCallbacks for PatternSource {
    fn initialize(&self, ctx: &FilterContext) -> Result<(), FilterError> {
        let count = u32_arg(ctx, "count", 10);
        let interval = u32_arg(ctx, "interval", 1000);
        self.remaining.store(count as u64, Ordering::SeqCst);
        self.interval_ts.store(interval as u64, Ordering::SeqCst);
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
        if self.remaining.load(Ordering::SeqCst) == 0 {
            let outputs = ctx.filter.output_pids.lock().unwrap();
            if let Some(out) = outputs.first() {
                out.set_eos();
            }
            return Ok(ProcessStatus::Eos);
        }

        let outputs = ctx.filter.output_pids.lock().unwrap();
        let Some(out) = outputs.first() else {
            return Ok(ProcessStatus::Ok);
        };
        let cts = self.emitted.fetch_add(1, Ordering::SeqCst) * self.interval_ts.load(Ordering::SeqCst);
        let props = PropertyMap::new();
        let mut pck = skein_core::packet::Packet::new_shared(out.id, props, bytes::Bytes::new());
        pck.info.cts = Some(cts);
        let pck = Arc::new(pck);
        for dest in &out.destinations {
            dest.enqueue(pck.clone());
        }
        self.remaining.fetch_sub(1, Ordering::SeqCst);
        ctx.filter.notify();
        Ok(ProcessStatus::Ok)
    }
}

pub fn pattern_source_register() -> Register {
    Register {
        name: "pattern_source",
        args: vec![
            ArgDesc {
                name: "count",
                property_type: PropertyType::Uint,
                default: Some(PropertyValue::Uint(10)),
                policy: ArgUpdatePolicy::Fixed,
                is_url_alias: false,
            },
            ArgDesc {
                name: "interval",
                property_type: PropertyType::Uint,
                default: Some(PropertyValue::Uint(1000)),
                policy: ArgUpdatePolicy::Fixed,
                is_url_alias: false,
            },
        ],
        caps: vec![CapBundle::new().with_cap(Cap::output("codec_id", PropertyValue::String("RAW".into())))],
        flags: RegisterFlags::ACT_AS_SOURCE,
        callbacks: Box::new(|| {
            Box::new(PatternSource {
                remaining: AtomicU64::new(0),
                interval_ts: AtomicU64::new(1000),
                emitted: AtomicU64::new(0),
            })
        }),
    }
}

/// Drains every packet from its one input and logs it at `info` level,
/// reporting the total drained at finalize.
struct LogSink {
    count: AtomicU64,
}

impl FilterCallbacks for LogSink {
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
            info!(filter = %ctx.filter.name, cts = ?pck.info.cts, size = ?pck.len(), "packet");
            self.count.fetch_add(1, Ordering::SeqCst);
            ctx.filter.drop_packet(pid_id);
        }
        Ok(ProcessStatus::Ok)
    }

    fn finalize(&self, ctx: &FilterContext) {
        info!(filter = %ctx.filter.name, total = self.count.load(Ordering::SeqCst), "drained");
    }
}

pub fn log_sink_register() -> Register {
    Register {
        name: "log_sink",
        args: vec![],
        caps: vec![CapBundle::new().with_cap(Cap::input("codec_id", PropertyValue::String("RAW".into())))],
        flags: RegisterFlags::empty(),
        callbacks: Box::new(|| Box::new(LogSink { count: AtomicU64::new(0) })),
    }
}
