//! Asynchronous tipset fetching with request de-duplication.

use crate::SyncEvent;
use cedar_interfaces::{ChainSyncClient, RequestError, SyncResult};
use cedar_primitives::{FullTipset, PeerId, SyncState, Tipset, TipsetHash, TipsetKey};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Tuning knobs of the loader.
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Upper bound on the ancestor depth requested in one round.
    pub max_depth: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30), max_depth: 64 }
    }
}

/// A verified response: the requested tipset plus any deeper ancestors the
/// peer included in the same round.
#[derive(Debug)]
pub struct LoadedTipsets {
    /// The requested tipset.
    pub tipset: Arc<Tipset>,
    /// Sync progress the response supports (`Complete` when messages came
    /// along).
    pub state: SyncState,
    /// Verified ancestors below the requested tipset, in descending order.
    pub ancestors: Vec<(Arc<Tipset>, SyncState)>,
}

/// Fetches tipsets by hash from a chosen peer.
///
/// Concurrent requests for the same hash share one network round: the second
/// caller just attaches as a waiter. Responses are verified before they are
/// emitted; a peer answering with blocks that do not hash to the requested
/// key is reported. Completion events reach the sync loop in arrival order.
#[derive(Debug)]
pub struct TipsetLoader<C> {
    client: Arc<C>,
    events: mpsc::UnboundedSender<SyncEvent>,
    in_flight: HashSet<TipsetHash>,
    prefetched: HashMap<TipsetHash, (Arc<Tipset>, SyncState)>,
    config: LoaderConfig,
}

impl<C: ChainSyncClient + 'static> TipsetLoader<C> {
    /// Creates a loader emitting completions into `events`.
    pub fn new(
        client: Arc<C>,
        events: mpsc::UnboundedSender<SyncEvent>,
        config: LoaderConfig,
    ) -> Self {
        Self { client, events, in_flight: HashSet::new(), prefetched: HashMap::new(), config }
    }

    /// Requests `key` from `peer`, with `depth_hint` sizing the backfill
    /// batch. Returns immediately; the result arrives as a
    /// [`SyncEvent::TipsetLoaded`].
    pub fn load(&mut self, key: TipsetKey, peer: PeerId, depth_hint: u64) -> SyncResult<()> {
        let hash = key.hash();
        if self.in_flight.contains(&hash) {
            // already waiting; one network round resolves all waiters
            return Ok(());
        }
        if let Some((tipset, state)) = self.prefetched.remove(&hash) {
            trace!(target: "sync::loader", %hash, "served from prefetched ancestors");
            let _ = self.events.send(SyncEvent::TipsetLoaded {
                hash,
                result: Ok(LoadedTipsets { tipset, state, ancestors: Vec::new() }),
            });
            return Ok(());
        }

        self.in_flight.insert(hash);
        let client = self.client.clone();
        let events = self.events.clone();
        let timeout = self.config.request_timeout;
        let depth = depth_hint.clamp(1, self.config.max_depth);
        debug!(target: "sync::loader", %hash, %peer, depth, "requesting tipset");

        tokio::spawn(async move {
            let response =
                tokio::time::timeout(timeout, client.fetch_tipsets(peer, key.clone(), depth))
                    .await;
            let result = match response {
                Err(_) => {
                    warn!(target: "sync::loader", %hash, %peer, "tipset request timed out");
                    client.report_bad_response(peer);
                    Err(RequestError::RequestTimeout)
                }
                Ok(Err(err)) => Err(err),
                Ok(Ok(chain)) => match verify_chain(&key, chain) {
                    Ok(loaded) => Ok(loaded),
                    Err(err) => {
                        warn!(target: "sync::loader", %hash, %peer, %err, "bad chainsync response");
                        client.report_bad_response(peer);
                        Err(err)
                    }
                },
            };
            let _ = events.send(SyncEvent::TipsetLoaded { hash, result });
        });
        Ok(())
    }

    /// Records a finished request: clears the slot so retries may pick a
    /// different peer and keeps verified ancestors for the next backward
    /// steps.
    pub fn on_loaded(&mut self, hash: &TipsetHash, result: &mut Result<LoadedTipsets, RequestError>) {
        self.in_flight.remove(hash);
        if let Ok(loaded) = result {
            for (tipset, state) in loaded.ancestors.drain(..) {
                self.prefetched.insert(tipset.key().hash(), (tipset, state));
            }
        }
    }

    /// Whether a request for `hash` is currently in flight.
    pub fn is_in_flight(&self, hash: &TipsetHash) -> bool {
        self.in_flight.contains(hash)
    }
}

/// Checks a response chain against the request: the first tipset must hash to
/// the requested key and every further one must be the previous one's parent.
fn verify_chain(
    key: &TipsetKey,
    chain: Vec<FullTipset>,
) -> Result<LoadedTipsets, RequestError> {
    let mut iter = chain.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| RequestError::BadResponse("empty response chain".into()))?;
    if first.tipset().key() != key {
        return Err(RequestError::BadResponse(format!(
            "response does not hash to the requested tipset {}",
            key.hash()
        )));
    }
    let state = sync_state_of(&first);
    let mut expected_parent = first.tipset().parents().hash();
    let tipset = first.into_tipset();

    let mut ancestors = Vec::new();
    for full in iter {
        if full.tipset().key().hash() != expected_parent {
            return Err(RequestError::BadResponse(
                "response chain does not follow parent links".into(),
            ));
        }
        let state = sync_state_of(&full);
        expected_parent = full.tipset().parents().hash();
        ancestors.push((full.into_tipset(), state));
    }
    Ok(LoadedTipsets { tipset, state, ancestors })
}

fn sync_state_of(full: &FullTipset) -> SyncState {
    if full.has_messages() {
        SyncState::Complete
    } else {
        SyncState::HeaderOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cedar_interfaces::test_utils::{
        genesis_tipset, random_linear_chain, random_peer_id, rng, Behavior, TestChainSyncClient,
    };

    fn setup(
        client: TestChainSyncClient,
    ) -> (TipsetLoader<TestChainSyncClient>, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TipsetLoader::new(Arc::new(client), tx, LoaderConfig::default()), rx)
    }

    async fn next_loaded(
        rx: &mut mpsc::UnboundedReceiver<SyncEvent>,
    ) -> (TipsetHash, Result<LoadedTipsets, RequestError>) {
        match rx.recv().await.expect("event") {
            SyncEvent::TipsetLoaded { hash, result } => (hash, result),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn loads_and_verifies_a_tipset() {
        let mut generator = rng();
        let chain = random_linear_chain(&mut generator, &genesis_tipset(), 3);
        let client = TestChainSyncClient::new().with_chain(&chain);
        let (mut loader, mut rx) = setup(client.clone());

        let head = chain.last().unwrap();
        loader.load(head.key().clone(), random_peer_id(&mut generator), 1).unwrap();
        let (hash, mut result) = next_loaded(&mut rx).await;
        loader.on_loaded(&hash, &mut result);

        assert_eq!(hash, head.key().hash());
        let loaded = result.unwrap();
        assert_eq!(loaded.tipset.key(), head.key());
        assert_eq!(loaded.state, SyncState::Complete);
        assert!(!loader.is_in_flight(&hash));
    }

    #[tokio::test]
    async fn deep_responses_prefetch_ancestors() {
        let mut generator = rng();
        let chain = random_linear_chain(&mut generator, &genesis_tipset(), 4);
        let client = TestChainSyncClient::new().with_chain(&chain);
        let (mut loader, mut rx) = setup(client.clone());
        let peer = random_peer_id(&mut generator);

        let head = chain.last().unwrap();
        loader.load(head.key().clone(), peer, 3).unwrap();
        let (hash, mut result) = next_loaded(&mut rx).await;
        loader.on_loaded(&hash, &mut result);

        // the two deeper tipsets now resolve without another request
        loader.load(chain[2].key().clone(), peer, 1).unwrap();
        let (hash, mut result) = next_loaded(&mut rx).await;
        loader.on_loaded(&hash, &mut result);
        assert_eq!(hash, chain[2].key().hash());
        assert!(result.is_ok());
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_requests_share_one_round() {
        let mut generator = rng();
        let chain = random_linear_chain(&mut generator, &genesis_tipset(), 2);
        let client = TestChainSyncClient::new().with_chain(&chain);
        let (mut loader, mut rx) = setup(client.clone());
        let peer = random_peer_id(&mut generator);

        let head = chain.last().unwrap();
        loader.load(head.key().clone(), peer, 1).unwrap();
        loader.load(head.key().clone(), peer, 1).unwrap();

        let (hash, mut result) = next_loaded(&mut rx).await;
        loader.on_loaded(&hash, &mut result);
        assert_eq!(client.requests().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hash_mismatch_is_a_bad_response_and_reports_the_peer() {
        let mut generator = rng();
        let chain = random_linear_chain(&mut generator, &genesis_tipset(), 2);
        let head = chain.last().unwrap();
        let client = TestChainSyncClient::new()
            .with_chain(&chain)
            .with_behavior(head.key().hash(), Behavior::WrongTipset);
        let (mut loader, mut rx) = setup(client.clone());
        let peer = random_peer_id(&mut generator);

        loader.load(head.key().clone(), peer, 1).unwrap();
        let (hash, mut result) = next_loaded(&mut rx).await;
        loader.on_loaded(&hash, &mut result);

        assert!(matches!(result, Err(RequestError::BadResponse(_))));
        assert_eq!(client.bad_reports(), vec![peer]);
        // the slot is free again for a retry
        assert!(!loader.is_in_flight(&hash));
    }

    #[tokio::test]
    async fn transport_errors_fail_only_the_request() {
        let mut generator = rng();
        let chain = random_linear_chain(&mut generator, &genesis_tipset(), 2);
        let head = chain.last().unwrap();
        let client = TestChainSyncClient::new()
            .with_chain(&chain)
            .with_behavior(head.key().hash(), Behavior::Timeout);
        let (mut loader, mut rx) = setup(client);
        let peer = random_peer_id(&mut generator);

        loader.load(head.key().clone(), peer, 1).unwrap();
        let (hash, mut result) = next_loaded(&mut rx).await;
        loader.on_loaded(&hash, &mut result);
        assert!(matches!(result, Err(RequestError::RequestTimeout)));
    }
}
