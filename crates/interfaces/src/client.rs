//! Client-side seam to the p2p host's chainsync protocol.

use crate::error::RequestResult;
use cedar_primitives::{FullTipset, PeerId, TipsetKey};
use std::future::Future;

/// Sends chainsync requests to a chosen peer.
///
/// Implemented by the embedding node on top of its transport; the sync core
/// only sees futures. A request names the head tipset key and how many
/// ancestor tipsets the peer may include in the same response (`depth`); the
/// response chain is ordered from the requested tipset downward.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait ChainSyncClient: Send + Sync {
    /// The response future type.
    type Output: Future<Output = RequestResult<Vec<FullTipset>>> + Send + Unpin;

    /// Requests `key` and up to `depth - 1` of its ancestors from `peer`.
    fn fetch_tipsets(&self, peer: PeerId, key: TipsetKey, depth: u64) -> Self::Output;

    /// Reports that `peer` answered with an unusable response so its quality
    /// score can be demoted.
    fn report_bad_response(&self, peer: PeerId);
}
