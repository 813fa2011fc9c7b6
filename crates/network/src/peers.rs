//! Directory of known peers and what they can do for sync.

use crate::messages::HelloMessage;
use cedar_primitives::{Height, PeerId, TipsetKey, Weight};
use cid::Cid;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::{debug, trace};

const STATUS_CHANNEL_SIZE: usize = 256;

/// Head a peer claimed in its latest hello.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimedHead {
    /// Key of the claimed heaviest tipset.
    pub key: TipsetKey,
    /// Claimed aggregated weight.
    pub weight: Weight,
    /// Claimed height.
    pub height: Height,
}

/// Observable status of one peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerStatus {
    /// Whether a connection is currently up.
    pub connected: bool,
    /// Whether the peer supports every required protocol.
    pub supports_protocols: bool,
    /// Whether the peer agreed on the genesis CID.
    pub in_network: bool,
}

/// Broadcast on every peer status transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerUpdate {
    /// The peer whose status changed.
    pub peer: PeerId,
    /// Its status after the change.
    pub status: PeerStatus,
}

/// Filter for peer queries.
#[derive(Clone, Debug, Default)]
pub struct GetPeerOptions {
    /// Only peers with a live connection.
    pub must_be_connected: bool,
    /// Only peers that agreed on genesis.
    pub must_be_network_node: bool,
    /// Only peers supporting all of these protocol ids.
    pub must_handle_protocols: Vec<String>,
}

#[derive(Debug, Default)]
struct PeerRecord {
    status: PeerStatus,
    protocols: HashSet<String>,
    claimed_head: Option<ClaimedHead>,
}

/// Tracks which peers support the required protocols, belong to the network
/// and what heads they claim.
///
/// Pure bookkeeping fed by the host's transport events; it never dials or
/// disconnects anything itself. Status transitions are broadcast so the
/// embedding node can react (e.g. feed fresh head claims to the syncer).
#[derive(Debug)]
pub struct PeerDirectory {
    genesis: Cid,
    required_protocols: Vec<String>,
    peers: HashMap<PeerId, PeerRecord>,
    updates: broadcast::Sender<PeerUpdate>,
}

impl PeerDirectory {
    /// Creates a directory for the network identified by `genesis`,
    /// requiring peers to support `required_protocols`.
    pub fn new(genesis: Cid, required_protocols: Vec<String>) -> Self {
        let (updates, _) = broadcast::channel(STATUS_CHANNEL_SIZE);
        Self { genesis, required_protocols, peers: HashMap::new(), updates }
    }

    /// Subscribes to status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerUpdate> {
        self.updates.subscribe()
    }

    /// Records a new connection.
    pub fn on_connected(&mut self, peer: PeerId) {
        self.transition(peer, |record| record.status.connected = true);
    }

    /// Records a closed connection.
    pub fn on_disconnected(&mut self, peer: PeerId) {
        self.transition(peer, |record| record.status.connected = false);
    }

    /// Records the protocol list learned from identify.
    pub fn on_identify(&mut self, peer: PeerId, protocols: impl IntoIterator<Item = String>) {
        let protocols: HashSet<String> = protocols.into_iter().collect();
        let required = &self.required_protocols;
        let supported = required.iter().all(|p| protocols.contains(p));
        self.transition(peer, |record| {
            record.protocols = protocols;
            record.status.supports_protocols = supported;
        });
    }

    /// Records a hello greeting: genesis agreement decides network
    /// membership and the claimed head is remembered.
    pub fn on_hello(&mut self, peer: PeerId, genesis: &Cid, hello: &HelloMessage) {
        let in_network = *genesis == self.genesis;
        let head = in_network.then(|| ClaimedHead {
            key: TipsetKey::new(hello.heaviest_tipset.clone()),
            weight: hello.heaviest_tipset_weight.clone(),
            height: hello.heaviest_tipset_height,
        });
        trace!(target: "network::peers", %peer, in_network, "hello received");
        self.transition(peer, |record| {
            record.status.in_network = in_network;
            if head.is_some() {
                record.claimed_head = head;
            }
        });
    }

    /// Marks a peer offline without touching the connection; used when a
    /// request to it failed while the transport still believes it is up.
    pub fn report_offline_peer(&mut self, peer: PeerId) {
        debug!(target: "network::peers", %peer, "peer reported offline");
        self.transition(peer, |record| record.status.connected = false);
    }

    /// The peer's status, if it is known at all.
    pub fn status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.peers.get(peer).map(|record| record.status)
    }

    /// The head the peer last claimed.
    pub fn claimed_head(&self, peer: &PeerId) -> Option<&ClaimedHead> {
        self.peers.get(peer).and_then(|record| record.claimed_head.as_ref())
    }

    /// The peer's status if it matches `options`.
    pub fn get_peer_info(&self, peer: &PeerId, options: &GetPeerOptions) -> Option<PeerStatus> {
        let record = self.peers.get(peer)?;
        self.matches(record, options).then_some(record.status)
    }

    /// All known peers matching `options`.
    pub fn matching_peers(&self, options: &GetPeerOptions) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, record)| self.matches(record, options))
            .map(|(&peer, _)| peer)
            .collect();
        peers.sort_unstable();
        peers
    }

    fn matches(&self, record: &PeerRecord, options: &GetPeerOptions) -> bool {
        if options.must_be_connected && !record.status.connected {
            return false;
        }
        if options.must_be_network_node && !record.status.in_network {
            return false;
        }
        options.must_handle_protocols.iter().all(|p| record.protocols.contains(p))
    }

    fn transition(&mut self, peer: PeerId, apply: impl FnOnce(&mut PeerRecord)) {
        let record = self.peers.entry(peer).or_default();
        let before = record.status;
        apply(record);
        if record.status != before {
            let _ = self.updates.send(PeerUpdate { peer, status: record.status });
        }
    }
}
