//! # SCV Core
//!
//! The scheduling core of the SCV work-distribution server: streams (units
//! of simulation work) are grouped into targets, queued by priority, and
//! leased to workers under opaque tokens.
//!
//! This crate owns only in-memory structure. Durable records and frame
//! bytes live in `scv-store`; request orchestration lives in `scv-session`.
//!
//! ## Architecture
//!
//! ```text
//! TargetManager            ← registry of targets, owns the shared TokenTable
//!     │
//! Target                   ← one lock: inactive PriorityQueue + active map
//!     │
//! ActiveStream             ← one lease: token, session lock, released guard
//!     │
//! TokenTable               ← token → (target, stream, session), own lock
//! ```
//!
//! Lock discipline: a target lock is only held for structural changes and
//! never across I/O, no code path holds two target locks at once, and the
//! token table lock is a leaf that is never held while taking another lock.

pub mod error;
pub mod manager;
pub mod queue;
pub mod stream;
pub mod target;
pub mod token;

pub use error::CoreError;
pub use manager::TargetManager;
pub use queue::{PriorityQueue, QueueEntry};
pub use stream::{
    ActiveStream, CommitPlan, FailureOutcome, SessionSnapshot, SessionState, Stream,
    StreamCounters, StreamStatus,
};
pub use target::{Lease, LeaseObserver, Release, Target, TargetConfig};
pub use token::{TokenEntry, TokenTable};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default lease lifetime before a silent worker loses its stream.
pub const DEFAULT_EXPIRATION_SECONDS: u64 = 600;

/// Default number of failed stops after which a stream is disabled.
pub const DEFAULT_MAX_STREAM_FAILS: u32 = 10;

// A panic while holding one of these locks never leaves the guarded
// structure half-updated, so poisoned guards are recovered.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
