//! The error taxonomy a filter callback can surface, and how it propagates.
//!
//! `FilterError` is deliberately not a generic `anyhow::Error`: the
//! scheduler's health checks and the resolver's retry logic both inspect
//! *which* kind of error came back (§7), so the kind has to be a closed
//! enum the caller can match on, not an opaque cause chain.

use thiserror::Error;

/// One of the documented error kinds a filter callback may return.
///
/// `Ok`/`Eos` are not represented here — callbacks return
/// `Result<ProcessStatus, FilterError>`, so the success path already
/// distinguishes "keep going" from "drained".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("bad parameter: {0}")]
    BadParam(String),

    #[error("I/O error: {0}")]
    IoErr(String),

    #[error("invalid URL: {0}")]
    UrlError(String),

    #[error("service error: {0}")]
    ServiceError(String),

    #[error("filter not found: {0}")]
    FilterNotFound(String),

    #[error("out of memory")]
    OutOfMem,

    /// Resolver should retry with this register blacklisted upstream.
    #[error("filter profile not supported, resolver retry requested")]
    ProfileNotSupported,

    /// The packet must be re-queued at the front of the postponed queue
    /// rather than treated as consumed.
    #[error("packet processing pending, requeue at front")]
    PendingPacket,
}

impl FilterError {
    /// Whether this error kind counts against the filter's health-check
    /// error budget (§4.6, §7). `ProfileNotSupported` and `PendingPacket`
    /// are control-flow signals, not faults, so they are excluded.
    pub fn counts_toward_health(&self) -> bool {
        !matches!(self, FilterError::ProfileNotSupported | FilterError::PendingPacket)
    }
}

/// The non-error outcomes of a `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Normal progress was made (or none was available, but nothing went wrong).
    Ok,
    /// The filter is fully drained and will produce no further packets.
    Eos,
    /// A source found no data this call; normalized to `Ok` for health
    /// accounting purposes at the scheduler boundary (§7).
    NetworkEmpty,
}

pub type ProcessResult = Result<ProcessStatus, FilterError>;

/// Read-and-clear failure slots surfaced on the session (§7 "User-visible
/// failure").
#[derive(Debug, Default)]
pub struct ErrorSlots {
    connect: Option<FilterError>,
    process: Option<FilterError>,
}

impl ErrorSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connect_error(&mut self, err: FilterError) {
        self.connect = Some(err);
    }

    pub fn set_process_error(&mut self, err: FilterError) {
        self.process = Some(err);
    }

    /// Reads and clears the last connection error, if any.
    pub fn take_connect_error(&mut self) -> Option<FilterError> {
        self.connect.take()
    }

    /// Reads and clears the last process error, if any.
    pub fn take_process_error(&mut self) -> Option<FilterError> {
        self.process.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_not_supported_excluded_from_health() {
        assert!(!FilterError::ProfileNotSupported.counts_toward_health());
        assert!(!FilterError::PendingPacket.counts_toward_health());
        assert!(FilterError::IoErr("x".into()).counts_toward_health());
    }

    #[test]
    fn error_slots_are_read_and_clear() {
        let mut slots = ErrorSlots::new();
        slots.set_process_error(FilterError::OutOfMem);
        assert_eq!(slots.take_process_error(), Some(FilterError::OutOfMem));
        assert_eq!(slots.take_process_error(), None);
    }
}
