//! Error taxonomy (spec §7): parse/validation, load/link, dependency,
//! lifecycle, reliability and shutdown errors each get their own enum so
//! callers can match on the bucket that actually applies to them.

use thiserror::Error;

/// Malformed version / version-range / manifest input. Fatal to the single
/// operation that produced it; never mutates state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid version format: {0}")]
    InvalidVersion(String),
    #[error("invalid version range format: {0}")]
    InvalidRange(String),
    #[error("invalid range: minimum > maximum")]
    RangeOutOfOrder,
    #[error("invalid range: empty range")]
    EmptyRange,
    #[error("manifest field '{0}' is required")]
    MissingField(&'static str),
}

/// Lifecycle, load/link and dependency errors surfaced from module
/// operations (spec §7 buckets 2–4).
#[derive(Debug, Error)]
pub enum ModuleException {
    #[error("failed to load library at {path}: {source}")]
    LibraryLoad {
        path: String,
        #[source]
        source: libloading::Error,
    },
    #[error("symbol '{symbol}' not found in {path}")]
    MissingSymbol { path: String, symbol: String },
    #[error("activator factory returned a null pointer")]
    NullActivator,
    #[error("module {0} not found")]
    NotFound(String),
    #[error("module {symbolic_name} is in state {actual:?}, expected {expected:?}")]
    WrongState {
        symbolic_name: String,
        actual: crate::module::ModuleState,
        expected: crate::module::ModuleState,
    },
    #[error("activator start() failed for module {symbolic_name}: {reason}")]
    StartFailed { symbolic_name: String, reason: String },
    #[error("circular dependency detected: {0}")]
    CyclicDependency(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result kinds for the IPC reliability stack (spec §6: `ReliabilityError`).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityError {
    #[error("no error")]
    None,
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("maximum retry attempts exceeded")]
    MaxRetriesExceeded,
    #[error("operation timed out")]
    Timeout,
    #[error("invalid configuration")]
    InvalidConfig,
    #[error("operation cancelled")]
    Cancelled,
    #[error("connection acquire timed out")]
    AcquireTimeout,
    #[error("connection pool is exhausted")]
    PoolExhausted,
    #[error("endpoint is unhealthy")]
    Unhealthy,
}

/// Error surfaced while stopping the host or a subsystem (spec §7 bucket 6).
/// Always logged; shutdown continues regardless; the first one raised wins.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("subsystem '{subsystem}' failed to stop cleanly: {reason}")]
    SubsystemStopFailed { subsystem: String, reason: String },
    #[error("timed out waiting for {0} module(s) to stop")]
    ModuleStopTimeout(usize),
}
