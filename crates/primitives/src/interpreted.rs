use cid::Cid;
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

/// Cached outcome of interpreting one tipset.
///
/// Keyed by tipset hash in the result cache; forks share results for shared
/// prefixes automatically. Write-once: a stored result is never overwritten.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct InterpreterResult {
    /// Root of the state tree after applying the tipset.
    pub state_root: Cid,
    /// Root of the message receipts produced by the tipset.
    pub receipts_root: Cid,
}
