#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
//! Chain synchronization core.
//!
//! The [`Syncer`] is the top-level controller: it accepts head announcements,
//! picks the heaviest worthwhile target, drives a [`SyncJob`] backward through
//! the [`TipsetLoader`] until the chain links up with known history, then
//! replays the new segment forward through an [`InterpreterJob`], caching the
//! results, and finally announces the confirmed head.
//!
//! Everything runs on one event loop task: commands from the
//! [`SyncerHandle`], loader completions and interpreter steps are queued
//! events processed one at a time. Long replays stay responsive because the
//! interpreter posts itself one step per queue round.

pub mod loader;
pub use loader::{LoadedTipsets, LoaderConfig, TipsetLoader};

pub mod job;
pub use job::{SyncJob, SyncStatus, SyncStatusCode};

pub mod interpreter;
pub use interpreter::{InterpretedHead, InterpreterJob, StepOutcome};

pub mod syncer;
pub use syncer::{Syncer, SyncerCommand, SyncerHandle};

use cedar_interfaces::RequestError;
use cedar_primitives::TipsetHash;

/// Events posted to the sync event loop.
#[derive(Debug)]
pub enum SyncEvent {
    /// A tipset request finished, successfully or not.
    TipsetLoaded {
        /// Hash the request was keyed by.
        hash: TipsetHash,
        /// The verified tipsets, or the per-request failure.
        result: Result<LoadedTipsets, RequestError>,
    },
    /// The interpreter job scheduled its next step.
    InterpreterTick {
        /// Job generation the tick belongs to; stale ticks are dropped.
        generation: u64,
    },
}
