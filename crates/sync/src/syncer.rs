//! Top-level synchronization controller.

use crate::{
    interpreter::{InterpretedHead, InterpreterJob, StepOutcome},
    job::{SyncJob, SyncStatus, SyncStatusCode},
    loader::TipsetLoader,
    SyncEvent,
};
use cedar_index::{ChainDb, ResultCache};
use cedar_interfaces::{Blockstore, ChainSyncClient, Interpreter, SyncResult};
use cedar_primitives::{HeadChange, Height, PeerId, Tipset, TipsetKey, Weight};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// A head claim waiting to be synced.
#[derive(Clone, Debug)]
struct Target {
    head: TipsetKey,
    weight: Weight,
    height: Height,
}

/// Commands accepted by the [`Syncer`] event loop.
#[derive(Debug)]
pub enum SyncerCommand {
    /// Begin processing targets.
    Start,
    /// A peer announced a head.
    NewTarget {
        /// Announcing peer; `None` falls back to the last good peer.
        peer: Option<PeerId>,
        /// Claimed head tipset.
        head: TipsetKey,
        /// Claimed weight.
        weight: Weight,
        /// Claimed height.
        height: Height,
    },
    /// Forget pending work from this peer.
    ExcludePeer(PeerId),
    /// Update the node's best confirmed weight and height.
    SetCurrentWeightAndHeight(Weight, Height),
    /// Ask whether a sync job is running.
    IsActive(oneshot::Sender<bool>),
    /// Ask for the heaviest stored tipset.
    HeaviestTipset(oneshot::Sender<Option<Arc<Tipset>>>),
}

/// Cloneable handle to a running [`Syncer`].
#[derive(Clone, Debug)]
pub struct SyncerHandle {
    commands: mpsc::UnboundedSender<SyncerCommand>,
}

impl SyncerHandle {
    fn send(&self, cmd: SyncerCommand) {
        let _ = self.commands.send(cmd);
    }

    /// Begins processing targets.
    pub fn start(&self) {
        self.send(SyncerCommand::Start);
    }

    /// Announces a head claimed by `peer`.
    pub fn new_target(
        &self,
        peer: Option<PeerId>,
        head: TipsetKey,
        weight: Weight,
        height: Height,
    ) {
        self.send(SyncerCommand::NewTarget { peer, head, weight, height });
    }

    /// Forgets pending work from `peer`.
    pub fn exclude_peer(&self, peer: PeerId) {
        self.send(SyncerCommand::ExcludePeer(peer));
    }

    /// Updates the node's best confirmed weight and height.
    pub fn set_current_weight_and_height(&self, weight: Weight, height: Height) {
        self.send(SyncerCommand::SetCurrentWeightAndHeight(weight, height));
    }

    /// Whether a sync job is currently running.
    pub async fn is_active(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.send(SyncerCommand::IsActive(tx));
        rx.await.unwrap_or(false)
    }

    /// The heaviest stored tipset, read through the scheduler.
    pub async fn heaviest_tipset(&self) -> Option<Arc<Tipset>> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncerCommand::HeaviestTipset(tx));
        rx.await.ok().flatten()
    }
}

/// The sync controller: accepts head announcements, picks the next target,
/// sequences the backward [`SyncJob`] and the forward [`InterpreterJob`], and
/// publishes confirmed heads.
///
/// Owns every mutable part of the core — chain database, loader, both jobs —
/// and mutates them only from its own event loop, one queued event at a
/// time. At most one target is pending per peer (newer replaces older) and
/// at most one sync job runs at a time.
pub struct Syncer<B, C, I> {
    chain_db: ChainDb<B>,
    loader: TipsetLoader<C>,
    interpreter: I,
    interpreter_job: InterpreterJob,
    job: SyncJob,
    commands: mpsc::UnboundedReceiver<SyncerCommand>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    pending_targets: HashMap<PeerId, Target>,
    current_weight: Weight,
    current_height: Height,
    probable_height: Height,
    last_good_peer: Option<PeerId>,
    started: bool,
}

impl<B, C, I> Syncer<B, C, I>
where
    B: Blockstore + Send + 'static,
    C: ChainSyncClient + 'static,
    I: Interpreter<B>,
{
    /// Wires a syncer from its parts. The returned handle is the host-facing
    /// API; run the returned syncer with [`Syncer::run`].
    pub fn new(
        chain_db: ChainDb<B>,
        client: Arc<C>,
        interpreter: I,
        result_cache: ResultCache,
        loader_config: crate::loader::LoaderConfig,
    ) -> (Self, SyncerHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let loader = TipsetLoader::new(client, event_tx.clone(), loader_config);
        let syncer = Self {
            chain_db,
            loader,
            interpreter,
            interpreter_job: InterpreterJob::new(result_cache),
            job: SyncJob::new(),
            commands,
            events,
            event_tx,
            pending_targets: HashMap::new(),
            current_weight: Weight::default(),
            current_height: 0,
            probable_height: 0,
            last_good_peer: None,
            started: false,
        };
        (syncer, SyncerHandle { commands: command_tx })
    }

    /// Subscribes to confirmed head changes; see
    /// [`ChainDb::subscribe_head_changes`].
    pub fn subscribe_head_changes(
        &self,
    ) -> SyncResult<(HeadChange, broadcast::Receiver<HeadChange>)> {
        self.chain_db.subscribe_head_changes()
    }

    /// Runs the event loop until every handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command),
                        None => break,
                    }
                }
                event = self.events.recv() => {
                    if let Some(event) = event {
                        self.on_event(event);
                    }
                }
            }
        }
        debug!(target: "sync::syncer", "all handles dropped, stopping");
    }

    fn on_command(&mut self, command: SyncerCommand) {
        match command {
            SyncerCommand::Start => {
                self.started = true;
                self.try_next_target();
            }
            SyncerCommand::NewTarget { peer, head, weight, height } => {
                self.on_new_target(peer, head, weight, height);
            }
            SyncerCommand::ExcludePeer(peer) => {
                self.pending_targets.remove(&peer);
            }
            SyncerCommand::SetCurrentWeightAndHeight(weight, height) => {
                self.current_weight = weight;
                self.current_height = height;
                self.prune_pending();
            }
            SyncerCommand::IsActive(reply) => {
                let _ = reply.send(self.started && self.job.is_active());
            }
            SyncerCommand::HeaviestTipset(reply) => {
                let _ = reply.send(self.chain_db.heaviest_tipset().ok());
            }
        }
    }

    fn on_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::TipsetLoaded { hash, mut result } => {
                self.loader.on_loaded(&hash, &mut result);
                if let Ok(loaded) = &result {
                    self.probable_height = loaded.tipset.height();
                }
                if self.job.is_active() {
                    if let Some(status) = self.job.on_tipset_loaded(
                        &mut self.chain_db,
                        &mut self.loader,
                        hash,
                        result,
                    ) {
                        self.on_job_finished(status);
                    }
                }
            }
            SyncEvent::InterpreterTick { generation } => {
                if !self.interpreter_job.is_active()
                    || generation != self.interpreter_job.generation()
                {
                    // a cancelled run left this tick behind
                    return;
                }
                match self.interpreter_job.step(&mut self.chain_db, &self.interpreter) {
                    Ok(StepOutcome::Continue) => self.schedule_interpreter_step(),
                    Ok(StepOutcome::Done(done)) => self.on_interpreted(done),
                    Err(err) => {
                        warn!(target: "sync::syncer", %err, "interpreter step failed");
                        self.try_next_target();
                    }
                }
            }
        }
    }

    fn on_new_target(
        &mut self,
        peer: Option<PeerId>,
        head: TipsetKey,
        weight: Weight,
        height: Height,
    ) {
        if weight <= self.current_weight && height <= self.current_height {
            // nothing this target could add
            return;
        }
        let Some(peer) = peer.or(self.last_good_peer) else {
            debug!(target: "sync::syncer", "target without a peer and no known good peer");
            return;
        };
        debug!(target: "sync::syncer", %peer, height, "new sync target");
        if self.started && !self.job.is_active() {
            self.start_job(peer, head, height);
        } else {
            self.pending_targets.insert(peer, Target { head, weight, height });
        }
    }

    fn try_next_target(&mut self) {
        if !self.started || self.job.is_active() {
            return;
        }
        let Some(peer) = self.choose_next_target() else {
            return;
        };
        if let Some(target) = self.pending_targets.remove(&peer) {
            self.start_job(peer, target.head, target.height);
        }
    }

    /// Picks the pending target with the strictly greatest weight, ties
    /// broken by height. Clears the map when nothing beats the current
    /// state.
    fn choose_next_target(&mut self) -> Option<PeerId> {
        if self.pending_targets.is_empty() {
            return None;
        }
        let mut best: Option<(PeerId, &Target)> = None;
        for (&peer, target) in &self.pending_targets {
            if target.weight <= self.current_weight && target.height <= self.current_height {
                continue;
            }
            let better = match &best {
                None => true,
                Some((_, current_best)) => {
                    target.weight > current_best.weight
                        || (target.weight == current_best.weight
                            && target.height > current_best.height)
                }
            };
            if better {
                best = Some((peer, target));
            }
        }
        match best {
            Some((peer, _)) => Some(peer),
            None => {
                // everything pending is obsolete
                self.pending_targets.clear();
                None
            }
        }
    }

    fn start_job(&mut self, peer: PeerId, head: TipsetKey, height: Height) {
        let probable_depth = height.saturating_sub(self.probable_height).max(1);
        if let Some(status) = self.job.start(
            &mut self.chain_db,
            &mut self.loader,
            peer,
            head,
            probable_depth,
        ) {
            self.on_job_finished(status);
        }
    }

    fn on_job_finished(&mut self, status: SyncStatus) {
        match status.code {
            SyncStatusCode::SyncedToGenesis => {
                self.last_good_peer = status.peer;
                let Some(head) = status.head else {
                    warn!(target: "sync::syncer", "finished job lost its head key");
                    self.try_next_target();
                    return;
                };
                match self.interpreter_job.start(&mut self.chain_db, &head) {
                    Ok(Some(done)) => self.on_interpreted(done),
                    Ok(None) => self.schedule_interpreter_step(),
                    Err(err) => {
                        warn!(target: "sync::syncer", %err, "cannot start interpreter");
                        self.try_next_target();
                    }
                }
            }
            code => {
                warn!(
                    target: "sync::syncer",
                    ?code,
                    error = ?status.error,
                    "sync job did not complete"
                );
                // the peer that served the bad target carries no more pending
                // work; its quality score is the peer directory's business
                if let Some(peer) = status.peer {
                    self.pending_targets.remove(&peer);
                }
                self.try_next_target();
            }
        }
    }

    fn on_interpreted(&mut self, done: InterpretedHead) {
        match done.result {
            Ok(_) => {
                let weight = done.head.weight();
                let height = done.head.height();
                if weight <= self.current_weight {
                    // a weaker head is not announced
                    debug!(target: "sync::syncer", height, "interpreted head is not heavier");
                    self.try_next_target();
                    return;
                }
                self.current_weight = weight;
                self.current_height = height;
                let hash = done.head.key().hash();
                if let Err(err) = self.chain_db.publish_head(&hash) {
                    warn!(target: "sync::syncer", %err, "cannot publish head");
                }
                info!(
                    target: "sync::syncer",
                    height,
                    head = %hash,
                    "chain advanced"
                );
                self.prune_pending();
                self.try_next_target();
            }
            Err(err) => {
                warn!(target: "sync::syncer", %err, "interpretation failed");
                self.try_next_target();
            }
        }
    }

    fn schedule_interpreter_step(&mut self) {
        let _ = self.event_tx.send(SyncEvent::InterpreterTick {
            generation: self.interpreter_job.generation(),
        });
    }

    fn prune_pending(&mut self) {
        let weight = self.current_weight.clone();
        let height = self.current_height;
        self.pending_targets.retain(|_, t| t.weight > weight || t.height > height);
    }
}

impl<B, C, I> std::fmt::Debug for Syncer<B, C, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("started", &self.started)
            .field("current_height", &self.current_height)
            .field("pending_targets", &self.pending_targets.len())
            .finish_non_exhaustive()
    }
}
