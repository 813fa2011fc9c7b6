use crate::{
    client::ChainSyncClient,
    error::{RequestError, RequestResult, SyncError, ValidationError},
    interpreter::Interpreter,
};
use cedar_primitives::{
    BlockMessages, FullTipset, Height, InterpreterResult, PeerId, Tipset, TipsetHash, TipsetKey,
};
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use futures::future::{self, Ready};
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::DAG_CBOR;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// How the scripted client answers a request for a given tipset hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Serve the registered chain.
    Respond,
    /// Fail the request as timed out.
    Timeout,
    /// Answer with a tipset that does not hash to the requested key.
    WrongTipset,
}

#[derive(Default)]
struct ClientInner {
    tipsets: HashMap<TipsetHash, FullTipset>,
    behaviors: HashMap<TipsetHash, Behavior>,
    requests: Vec<(PeerId, TipsetHash, u64)>,
    bad_reports: Vec<PeerId>,
}

/// Scripted [`ChainSyncClient`] serving registered tipsets from memory.
///
/// Requests resolve immediately; a request for an unregistered hash fails as
/// [`RequestError::PeerUnreachable`]. Depth is honored by following parent
/// links through the registered set.
#[derive(Clone, Default)]
pub struct TestChainSyncClient {
    inner: Arc<Mutex<ClientInner>>,
}

impl TestChainSyncClient {
    /// Creates an empty client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every tipset of `chain` so requests can be served, messages
    /// included.
    pub fn with_chain(self, chain: &[Tipset]) -> Self {
        {
            let mut inner = self.inner.lock();
            for tipset in chain {
                let messages = vec![BlockMessages::default(); tipset.blocks().len()];
                let full = FullTipset::new(tipset.clone(), Some(messages))
                    .expect("message list covers every block");
                inner.tipsets.insert(tipset.key().hash(), full);
            }
        }
        self
    }

    /// Overrides the behavior for requests of `hash`.
    pub fn with_behavior(self, hash: TipsetHash, behavior: Behavior) -> Self {
        self.inner.lock().behaviors.insert(hash, behavior);
        self
    }

    /// All requests observed so far, in order.
    pub fn requests(&self) -> Vec<(PeerId, TipsetHash, u64)> {
        self.inner.lock().requests.clone()
    }

    /// Peers reported for bad responses.
    pub fn bad_reports(&self) -> Vec<PeerId> {
        self.inner.lock().bad_reports.clone()
    }
}

impl ChainSyncClient for TestChainSyncClient {
    type Output = Ready<RequestResult<Vec<FullTipset>>>;

    fn fetch_tipsets(&self, peer: PeerId, key: TipsetKey, depth: u64) -> Self::Output {
        let mut inner = self.inner.lock();
        let hash = key.hash();
        inner.requests.push((peer, hash, depth));

        match inner.behaviors.get(&hash).copied().unwrap_or(Behavior::Respond) {
            Behavior::Timeout => future::ready(Err(RequestError::RequestTimeout)),
            Behavior::WrongTipset => {
                // any registered tipset other than the requested one
                let other = inner.tipsets.values().find(|t| t.tipset().key().hash() != hash);
                match other {
                    Some(full) => future::ready(Ok(vec![full.clone()])),
                    None => future::ready(Err(RequestError::PeerUnreachable)),
                }
            }
            Behavior::Respond => {
                let mut chain = Vec::new();
                let mut next = Some(hash);
                while let (Some(h), true) = (next, (chain.len() as u64) < depth.max(1)) {
                    match inner.tipsets.get(&h) {
                        Some(full) => {
                            next = Some(full.tipset().parents().hash());
                            chain.push(full.clone());
                        }
                        None => break,
                    }
                }
                if chain.is_empty() {
                    future::ready(Err(RequestError::PeerUnreachable))
                } else {
                    future::ready(Ok(chain))
                }
            }
        }
    }

    fn report_bad_response(&self, peer: PeerId) {
        self.inner.lock().bad_reports.push(peer);
    }
}

/// Deterministic interpreter result for a tipset: both roots are derived from
/// the tipset hash, so repeated runs agree.
pub fn result_for(tipset: &Tipset) -> InterpreterResult {
    let hash = tipset.key().hash();
    let mut state = b"state:".to_vec();
    state.extend_from_slice(hash.as_bytes());
    let mut receipts = b"receipts:".to_vec();
    receipts.extend_from_slice(hash.as_bytes());
    InterpreterResult {
        state_root: Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&state)),
        receipts_root: Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&receipts)),
    }
}

/// [`Interpreter`] that records every application and can be scripted to fail
/// at one height.
#[derive(Clone, Default)]
pub struct CountingInterpreter {
    applied: Arc<Mutex<Vec<TipsetHash>>>,
    fail_at: Option<Height>,
}

impl CountingInterpreter {
    /// Creates an interpreter that succeeds everywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes interpretation fail at the given height.
    pub fn failing_at(height: Height) -> Self {
        Self { applied: Default::default(), fail_at: Some(height) }
    }

    /// Hashes of every successfully applied tipset, in application order.
    pub fn applied(&self) -> Vec<TipsetHash> {
        self.applied.lock().clone()
    }
}

impl<B: Blockstore> Interpreter<B> for CountingInterpreter {
    fn interpret(&self, _store: &B, tipset: &Tipset) -> Result<InterpreterResult, SyncError> {
        if self.fail_at == Some(tipset.height()) {
            return Err(ValidationError::BadBlocks(format!(
                "scripted failure at height {}",
                tipset.height()
            ))
            .into());
        }
        self.applied.lock().push(tipset.key().hash());
        Ok(result_for(tipset))
    }
}
