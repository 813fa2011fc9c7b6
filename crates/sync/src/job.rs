//! A single backward-walk synchronization job.

use crate::loader::{LoadedTipsets, TipsetLoader};
use cedar_index::ChainDb;
use cedar_interfaces::{Blockstore, ChainSyncClient, InvariantError, RequestError, SyncError};
use cedar_primitives::{PeerId, Tipset, TipsetHash, TipsetKey};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a job currently stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncStatusCode {
    /// Not started.
    #[default]
    Idle,
    /// Walking backward, one tipset in flight.
    InProgress,
    /// Reached a known tipset or genesis; the segment is fully linked.
    SyncedToGenesis,
    /// Cancelled by the controller.
    Interrupted,
    /// Validation refused loaded blocks.
    BadBlocks,
    /// Any other failure.
    InternalError,
}

impl SyncStatusCode {
    /// Whether the code ends the job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatusCode::Idle | SyncStatusCode::InProgress)
    }
}

/// Status snapshot of a [`SyncJob`], delivered once on termination.
#[derive(Clone, Debug, Default)]
pub struct SyncStatus {
    /// Current state machine position.
    pub code: SyncStatusCode,
    /// Error that ended the job, if one did.
    pub error: Option<SyncError>,
    /// Peer the job is syncing from.
    pub peer: Option<PeerId>,
    /// Head tipset the job is walking down from.
    pub head: Option<TipsetKey>,
    /// Hash of the last tipset stored.
    pub last_loaded: Option<TipsetHash>,
    /// Hash the job expects next; anything else is ignored.
    pub next: Option<TipsetHash>,
    /// Tipsets stored by this job.
    pub total: u64,
}

/// Drives one backward walk: load the head, store it, chase the deepest
/// unsynced bottom until the chain links to known history or genesis.
///
/// Only one tipset is ever in flight; deliveries that do not match
/// `status.next` are ignored, so late responses from abandoned requests are
/// harmless.
#[derive(Debug, Default)]
pub struct SyncJob {
    active: bool,
    status: SyncStatus,
}

impl SyncJob {
    /// Creates an idle job.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the job is running.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The job's status so far.
    pub fn status(&self) -> &SyncStatus {
        &self.status
    }

    /// Starts a walk from `head` claimed by `peer`. Returns the terminal
    /// status immediately when there is nothing to load.
    pub fn start<B: Blockstore, C: ChainSyncClient + 'static>(
        &mut self,
        chain_db: &mut ChainDb<B>,
        loader: &mut TipsetLoader<C>,
        peer: PeerId,
        head: TipsetKey,
        probable_depth: u64,
    ) -> Option<SyncStatus> {
        if self.active {
            warn!(target: "sync::job", "job already active, ignoring start");
            return None;
        }
        self.active = true;
        self.status = SyncStatus {
            peer: Some(peer),
            head: Some(head.clone()),
            ..Default::default()
        };

        let stored = match chain_db.tipset_is_stored(&head.hash()) {
            Ok(stored) => stored,
            Err(err) => return Some(self.fail(err)),
        };
        if !stored {
            if let Err(err) = loader.load(head.clone(), peer, probable_depth) {
                return Some(self.fail(err));
            }
            self.status.next = Some(head.hash());
            self.status.code = SyncStatusCode::InProgress;
            return None;
        }

        match chain_db.get_unsynced_bottom(&head.hash()) {
            Ok(bottom) => self.next_target(loader, bottom),
            Err(err) => Some(self.fail(err)),
        }
    }

    /// Feeds a loader completion into the job. Returns the terminal status
    /// once the job ends; deliveries for other hashes are dropped.
    pub fn on_tipset_loaded<B: Blockstore, C: ChainSyncClient + 'static>(
        &mut self,
        chain_db: &mut ChainDb<B>,
        loader: &mut TipsetLoader<C>,
        hash: TipsetHash,
        result: Result<LoadedTipsets, RequestError>,
    ) -> Option<SyncStatus> {
        if self.status.code != SyncStatusCode::InProgress
            || self.status.next != Some(hash)
        {
            // not the tipset this job is waiting for
            return None;
        }

        let loaded = match result {
            Ok(loaded) => loaded,
            Err(err) => return Some(self.fail(err)),
        };

        let outcome = match chain_db.store_tipset(
            &loaded.tipset,
            loaded.tipset.parents(),
            loaded.state,
        ) {
            Ok(outcome) => outcome,
            Err(err) => return Some(self.fail(err)),
        };
        self.status.total += 1;
        self.next_target(loader, outcome.unsynced_bottom)
    }

    /// Cancels the job, returning the `Interrupted` status.
    pub fn cancel(&mut self) -> SyncStatus {
        let mut status = std::mem::take(&mut self.status);
        status.code = SyncStatusCode::Interrupted;
        self.active = false;
        status
    }

    fn next_target<C: ChainSyncClient + 'static>(
        &mut self,
        loader: &mut TipsetLoader<C>,
        last_loaded: Option<Arc<Tipset>>,
    ) -> Option<SyncStatus> {
        let Some(bottom) = last_loaded else {
            self.status.next = None;
            self.status.code = SyncStatusCode::SyncedToGenesis;
            self.active = false;
            debug!(target: "sync::job", total = self.status.total, "synced to genesis");
            return Some(std::mem::take(&mut self.status));
        };

        let next_key = bottom.parents().clone();
        self.status.last_loaded = Some(bottom.key().hash());
        self.status.next = Some(next_key.hash());
        self.status.code = SyncStatusCode::InProgress;

        let Some(peer) = self.status.peer else {
            return Some(self.fail(InvariantError::DataIntegrity("job lost its peer".into())));
        };
        let depth = bottom.height().saturating_sub(1).max(1);
        if let Err(err) = loader.load(next_key, peer, depth) {
            return Some(self.fail(err));
        }
        None
    }

    fn fail(&mut self, err: impl Into<SyncError>) -> SyncStatus {
        let err = err.into();
        let code = match &err {
            SyncError::Validation(_) => SyncStatusCode::BadBlocks,
            _ => SyncStatusCode::InternalError,
        };
        warn!(target: "sync::job", %err, ?code, "sync job failed");
        let mut status = std::mem::take(&mut self.status);
        status.code = code;
        status.error = Some(err);
        self.active = false;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{loader::LoaderConfig, SyncEvent};
    use cedar_index::{ChainDb, IndexStore};
    use cedar_interfaces::test_utils::{
        genesis_tipset, random_linear_chain, random_peer_id, rng, Behavior, TestChainSyncClient,
    };
    use cedar_interfaces::MemoryBlockstore;
    use tokio::sync::mpsc;

    struct Fixture {
        chain_db: ChainDb<MemoryBlockstore>,
        loader: TipsetLoader<TestChainSyncClient>,
        events: mpsc::UnboundedReceiver<SyncEvent>,
        chain: Vec<Tipset>,
        peer: PeerId,
    }

    fn fixture(len: usize) -> Fixture {
        let mut generator = rng();
        let genesis = genesis_tipset();
        let ipld = MemoryBlockstore::default();
        let cid = genesis.key().cids()[0];
        let bytes = fvm_ipld_encoding::to_vec(&genesis.blocks()[0]).unwrap();
        use cedar_interfaces::Blockstore as _;
        ipld.put_keyed(&cid, &bytes).unwrap();
        let chain_db = ChainDb::open(ipld, IndexStore::open_in_memory().unwrap(), &cid).unwrap();

        let chain = random_linear_chain(&mut generator, &genesis, len);
        let client = TestChainSyncClient::new().with_chain(&chain);
        let (tx, events) = mpsc::unbounded_channel();
        let loader = TipsetLoader::new(std::sync::Arc::new(client), tx, LoaderConfig::default());
        Fixture { chain_db, loader, events, chain, peer: random_peer_id(&mut generator) }
    }

    async fn drive(fixture: &mut Fixture, job: &mut SyncJob) -> SyncStatus {
        loop {
            let event = fixture.events.recv().await.expect("loader event");
            let SyncEvent::TipsetLoaded { hash, mut result } = event else {
                continue;
            };
            fixture.loader.on_loaded(&hash, &mut result);
            if let Some(status) =
                job.on_tipset_loaded(&mut fixture.chain_db, &mut fixture.loader, hash, result)
            {
                return status;
            }
        }
    }

    #[tokio::test]
    async fn walks_backward_to_genesis() {
        let mut fixture = fixture(5);
        let mut job = SyncJob::new();
        let head = fixture.chain.last().unwrap().key().clone();

        let immediate = job.start(
            &mut fixture.chain_db,
            &mut fixture.loader,
            fixture.peer,
            head.clone(),
            5,
        );
        assert!(immediate.is_none());
        assert!(job.is_active());

        let status = drive(&mut fixture, &mut job).await;
        assert_eq!(status.code, SyncStatusCode::SyncedToGenesis);
        assert_eq!(status.total, 5);
        assert!(!job.is_active());
        assert!(fixture.chain_db.tipset_is_stored(&head.hash()).unwrap());
        assert!(fixture.chain_db.get_unsynced_bottom(&head.hash()).unwrap().is_none());
    }

    #[tokio::test]
    async fn known_head_finishes_immediately() {
        let mut fixture = fixture(3);
        for tipset in fixture.chain.clone() {
            fixture
                .chain_db
                .store_tipset(&tipset, tipset.parents(), cedar_primitives::SyncState::Complete)
                .unwrap();
        }
        let mut job = SyncJob::new();
        let head = fixture.chain.last().unwrap().key().clone();

        let status = job
            .start(&mut fixture.chain_db, &mut fixture.loader, fixture.peer, head, 3)
            .expect("terminal right away");
        assert_eq!(status.code, SyncStatusCode::SyncedToGenesis);
        assert_eq!(status.total, 0);
    }

    #[tokio::test]
    async fn bad_response_ends_with_internal_error() {
        let mut fixture = fixture(3);
        let head = fixture.chain.last().unwrap();
        let client = TestChainSyncClient::new()
            .with_chain(&fixture.chain)
            .with_behavior(head.key().hash(), Behavior::WrongTipset);
        let (tx, events) = mpsc::unbounded_channel();
        fixture.loader =
            TipsetLoader::new(std::sync::Arc::new(client), tx, LoaderConfig::default());
        fixture.events = events;

        let mut job = SyncJob::new();
        let head_key = head.key().clone();
        assert!(job
            .start(&mut fixture.chain_db, &mut fixture.loader, fixture.peer, head_key, 3)
            .is_none());
        let status = drive(&mut fixture, &mut job).await;
        assert_eq!(status.code, SyncStatusCode::InternalError);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn mismatched_deliveries_are_ignored() {
        let mut fixture = fixture(3);
        let mut job = SyncJob::new();
        let head = fixture.chain.last().unwrap().key().clone();
        job.start(&mut fixture.chain_db, &mut fixture.loader, fixture.peer, head, 3);

        let stray = fixture.chain[0].key().hash();
        let outcome = job.on_tipset_loaded(
            &mut fixture.chain_db,
            &mut fixture.loader,
            stray,
            Err(RequestError::PeerUnreachable),
        );
        assert!(outcome.is_none());
        assert!(job.is_active());
    }

    #[tokio::test]
    async fn cancel_interrupts_the_walk() {
        let mut fixture = fixture(3);
        let mut job = SyncJob::new();
        let head = fixture.chain.last().unwrap().key().clone();
        job.start(&mut fixture.chain_db, &mut fixture.loader, fixture.peer, head, 3);

        let status = job.cancel();
        assert_eq!(status.code, SyncStatusCode::Interrupted);
        assert!(!job.is_active());
    }
}
