#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
//! Traits and error taxonomy shared across the cedar crates.
//!
//! The sync core depends on its environment only through the seams defined
//! here: the [`ChainSyncClient`](client::ChainSyncClient) request/response
//! interface to the p2p host, the [`Interpreter`](interpreter::Interpreter)
//! state-transition function, and the content-addressed
//! [`Blockstore`](fvm_ipld_blockstore::Blockstore).
//!
//! ## Feature Flags
//!
//! - `test-utils`: scripted client, counting interpreter and data generators.

pub mod error;
pub use error::{
    InvariantError, NotFoundError, PreconditionError, RequestError, RequestResult, StoreError,
    SyncError, SyncResult, ValidationError,
};

pub mod client;
pub use client::ChainSyncClient;

pub mod interpreter;
pub use interpreter::Interpreter;

pub use fvm_ipld_blockstore::{Blockstore, MemoryBlockstore};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
