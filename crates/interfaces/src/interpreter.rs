//! The state-transition seam.

use crate::error::SyncError;
use cedar_primitives::{InterpreterResult, Tipset};
use fvm_ipld_blockstore::Blockstore;

/// Deterministic state transition over one tipset.
///
/// Treated as a pure function of the parent state (reachable through the
/// blockstore) and the tipset: same inputs, same
/// [`InterpreterResult`]. The sync core calls it once per tipset during
/// forward replay and caches the result by tipset hash.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait Interpreter<B: Blockstore>: Send + Sync {
    /// Applies the tipset on top of its parent state, returning the new state
    /// root and the receipts root.
    fn interpret(&self, store: &B, tipset: &Tipset) -> Result<InterpreterResult, SyncError>;
}
