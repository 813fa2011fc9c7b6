//! Forward replay of synced tipsets through the VM.

use cedar_index::{CachedOutcome, ChainDb, ResultCache};
use cedar_interfaces::{
    Blockstore, Interpreter, InvariantError, SyncError, SyncResult, ValidationError,
};
use cedar_primitives::{Height, InterpreterResult, Tipset, TipsetKey};
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, error, info};

/// Upper bound on tipsets buffered ahead of interpretation.
const LOOKAHEAD: usize = 100;

/// Final outcome of one interpreter run.
#[derive(Clone, Debug)]
pub struct InterpretedHead {
    /// The head the run was started for.
    pub head: Arc<Tipset>,
    /// Its interpretation result, or what ended the replay.
    pub result: Result<InterpreterResult, SyncError>,
}

/// What one interpreter step produced.
#[derive(Debug)]
pub enum StepOutcome {
    /// More tipsets remain; schedule another step.
    Continue,
    /// The run finished, successfully or not.
    Done(InterpretedHead),
}

/// Replays tipsets forward through the VM, recording results write-once per
/// tipset hash.
///
/// The job never runs more than one `interpret` call per step; the
/// controller posts each next step onto the event queue, so long replays do
/// not starve other work. A generation counter ties queued steps to the run
/// that scheduled them: cancelling bumps the generation and stale steps are
/// dropped on arrival.
#[derive(Debug)]
pub struct InterpreterJob {
    cache: ResultCache,
    active: bool,
    generation: u64,
    current_height: Height,
    target_height: Height,
    head: Option<Arc<Tipset>>,
    buffer: VecDeque<Arc<Tipset>>,
}

impl InterpreterJob {
    /// Creates an inactive job over the given result cache.
    pub fn new(cache: ResultCache) -> Self {
        Self {
            cache,
            active: false,
            generation: 0,
            current_height: 0,
            target_height: 0,
            head: None,
            buffer: VecDeque::new(),
        }
    }

    /// Whether a run is in progress.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Generation of the current run; steps carry it so stale ones can be
    /// recognized.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Progress of the current run as `(current, target)` heights.
    pub fn status(&self) -> (Height, Height) {
        (self.current_height, self.target_height)
    }

    /// Read access to the result cache.
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Starts a run toward `head`.
    ///
    /// A head with a recorded outcome short-circuits: the result is returned
    /// for the controller to deliver through the queue. Otherwise the run is
    /// positioned at the highest ancestor with a cached result and `Ok(None)`
    /// asks the controller to schedule the first step.
    pub fn start<B: Blockstore>(
        &mut self,
        chain_db: &mut ChainDb<B>,
        head: &TipsetKey,
    ) -> SyncResult<Option<InterpretedHead>> {
        if self.active {
            info!(
                target: "sync::interpreter",
                current = self.current_height,
                target = self.target_height,
                "a replay is still active, cancelling it"
            );
            self.cancel();
        }

        let head_tipset = chain_db.get_tipset_by_key(head)?;
        let hash = head.hash();
        match self.cache.get(&hash)? {
            Some(CachedOutcome::Interpreted(result)) => {
                return Ok(Some(InterpretedHead { head: head_tipset, result: Ok(result) }));
            }
            Some(CachedOutcome::Bad) => {
                return Ok(Some(InterpretedHead {
                    head: head_tipset,
                    result: Err(ValidationError::TipsetMarkedBad.into()),
                }));
            }
            None => {}
        }

        // project the chain so the forward walk can follow it
        chain_db.set_current_head(&hash)?;

        // locate the highest ancestor with a cached result
        let mut found: Option<Height> = None;
        let mut bad_ancestor = false;
        let cache = self.cache.clone();
        chain_db.walk_backward(&hash, 0, |tipset| match cache.get(&tipset.key().hash()) {
            Ok(Some(CachedOutcome::Interpreted(_))) => {
                found = Some(tipset.height());
                false
            }
            Ok(Some(CachedOutcome::Bad)) => {
                bad_ancestor = true;
                false
            }
            Ok(None) => true,
            Err(_) => false,
        })?;
        if bad_ancestor {
            self.cache.mark_bad(&hash)?;
            return Ok(Some(InterpretedHead {
                head: head_tipset,
                result: Err(ValidationError::TipsetMarkedBad.into()),
            }));
        }

        self.buffer.clear();
        match found {
            Some(height) => self.current_height = height,
            None => {
                // nothing interpreted yet, start from genesis itself
                self.current_height = 0;
                self.buffer.push_back(chain_db.genesis().clone());
            }
        }
        self.target_height = head_tipset.height();
        self.head = Some(head_tipset);
        self.active = true;
        self.generation += 1;
        info!(
            target: "sync::interpreter",
            from = self.current_height,
            to = self.target_height,
            "starting replay"
        );
        Ok(None)
    }

    /// Runs one step: interpret the next buffered tipset, refilling the
    /// lookahead buffer from the projected chain when it runs dry.
    pub fn step<B: Blockstore, I: Interpreter<B>>(
        &mut self,
        chain_db: &mut ChainDb<B>,
        interpreter: &I,
    ) -> SyncResult<StepOutcome> {
        if !self.active {
            return Err(InvariantError::DataIntegrity("step on an inactive replay".into()).into());
        }

        if self.buffer.is_empty() {
            if let Err(err) = self.fill_buffer(chain_db) {
                return Ok(self.finish(Err(err)));
            }
        }
        let Some(tipset) = self.buffer.pop_front() else {
            // nothing left below the target: the head result must be cached
            let head_hash = match &self.head {
                Some(head) => head.key().hash(),
                None => {
                    return Err(
                        InvariantError::DataIntegrity("replay without a head".into()).into()
                    )
                }
            };
            let result = match self.cache.get(&head_hash)? {
                Some(CachedOutcome::Interpreted(result)) => Ok(result),
                Some(CachedOutcome::Bad) => Err(ValidationError::TipsetMarkedBad.into()),
                None => Err(InvariantError::DataIntegrity(
                    "replay ran dry before reaching its head".into(),
                )
                .into()),
            };
            return Ok(self.finish(result));
        };

        self.current_height = tipset.height();
        debug!(
            target: "sync::interpreter",
            height = self.current_height,
            target = self.target_height,
            "interpreting tipset"
        );

        match interpreter.interpret(chain_db.blockstore(), &tipset) {
            Ok(result) => {
                self.cache.put(&tipset.key().hash(), &result)?;
                if self.current_height >= self.target_height {
                    return Ok(self.finish(Ok(result)));
                }
                Ok(StepOutcome::Continue)
            }
            Err(err) => {
                error!(
                    target: "sync::interpreter",
                    height = self.current_height,
                    %err,
                    "replay stopped"
                );
                self.cache.mark_bad(&tipset.key().hash())?;
                if let Some(head) = &self.head {
                    let head_hash = head.key().hash();
                    if head_hash != tipset.key().hash() {
                        self.cache.mark_bad(&head_hash)?;
                    }
                }
                Ok(self.finish(Err(err)))
            }
        }
    }

    /// Cancels the run; queued steps of the old generation become inert. Any
    /// in-flight `interpret` call belongs to the caller's stack and its
    /// result is discarded with the run.
    pub fn cancel(&mut self) -> (Height, Height) {
        self.active = false;
        self.generation += 1;
        self.buffer.clear();
        self.head = None;
        (self.current_height, self.target_height)
    }

    fn finish(&mut self, result: Result<InterpreterResult, SyncError>) -> StepOutcome {
        let head = self.head.take();
        self.active = false;
        self.generation += 1;
        self.buffer.clear();
        match head {
            Some(head) => StepOutcome::Done(InterpretedHead { head, result }),
            // cancelled mid-step; nothing to deliver
            None => StepOutcome::Continue,
        }
    }

    fn fill_buffer<B: Blockstore>(&mut self, chain_db: &mut ChainDb<B>) -> SyncResult<()> {
        if self.current_height >= self.target_height {
            return Ok(());
        }
        let from = self.current_height + 1;
        let to = self.target_height.min(self.current_height + LOOKAHEAD as Height - 1);
        let buffer = &mut self.buffer;
        let target = self.target_height;
        chain_db.walk_forward(from, to, |tipset| {
            if tipset.height() <= target {
                buffer.push_back(tipset);
            }
            true
        })?;
        debug!(
            target: "sync::interpreter",
            scheduled = self.buffer.len(),
            from,
            "filled replay buffer"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cedar_index::IndexStore;
    use cedar_interfaces::test_utils::{
        genesis_tipset, random_linear_chain, result_for, rng, CountingInterpreter,
    };
    use cedar_interfaces::MemoryBlockstore;
    use cedar_primitives::SyncState;

    fn chain_db_with(len: usize) -> (ChainDb<MemoryBlockstore>, Vec<Tipset>) {
        let genesis = genesis_tipset();
        let ipld = MemoryBlockstore::default();
        let cid = genesis.key().cids()[0];
        let bytes = fvm_ipld_encoding::to_vec(&genesis.blocks()[0]).unwrap();
        use cedar_interfaces::Blockstore as _;
        ipld.put_keyed(&cid, &bytes).unwrap();
        let mut chain_db =
            ChainDb::open(ipld, IndexStore::open_in_memory().unwrap(), &cid).unwrap();
        let chain = random_linear_chain(&mut rng(), &genesis, len);
        for tipset in &chain {
            chain_db.store_tipset(tipset, tipset.parents(), SyncState::Complete).unwrap();
        }
        (chain_db, chain)
    }

    fn run_to_completion(
        job: &mut InterpreterJob,
        chain_db: &mut ChainDb<MemoryBlockstore>,
        interpreter: &CountingInterpreter,
        head: &TipsetKey,
    ) -> InterpretedHead {
        if let Some(done) = job.start(chain_db, head).unwrap() {
            return done;
        }
        loop {
            match job.step(chain_db, interpreter).unwrap() {
                StepOutcome::Continue => continue,
                StepOutcome::Done(done) => return done,
            }
        }
    }

    #[test]
    fn replays_forward_and_caches_results() {
        let (mut chain_db, chain) = chain_db_with(5);
        let mut job = InterpreterJob::new(ResultCache::temporary().unwrap());
        let interpreter = CountingInterpreter::new();
        let head = chain.last().unwrap().key().clone();

        let done = run_to_completion(&mut job, &mut chain_db, &interpreter, &head);
        assert_eq!(done.head.key(), &head);
        assert_eq!(done.result.unwrap(), result_for(chain.last().unwrap()));

        // genesis plus all five tipsets, strictly ascending
        let applied = interpreter.applied();
        assert_eq!(applied.len(), 6);
        assert_eq!(applied[0], genesis_tipset().key().hash());
        for (tipset, hash) in chain.iter().zip(&applied[1..]) {
            assert_eq!(*hash, tipset.key().hash());
        }

        // every tipset result is cached
        for tipset in &chain {
            assert!(matches!(
                job.cache().get(&tipset.key().hash()).unwrap(),
                Some(CachedOutcome::Interpreted(_))
            ));
        }
    }

    #[test]
    fn cached_head_short_circuits() {
        let (mut chain_db, chain) = chain_db_with(3);
        let mut job = InterpreterJob::new(ResultCache::temporary().unwrap());
        let interpreter = CountingInterpreter::new();
        let head = chain.last().unwrap().key().clone();

        run_to_completion(&mut job, &mut chain_db, &interpreter, &head);
        let calls = interpreter.applied().len();

        let immediate = job.start(&mut chain_db, &head).unwrap().expect("cached");
        assert_eq!(immediate.result.unwrap(), result_for(chain.last().unwrap()));
        assert_eq!(interpreter.applied().len(), calls);
    }

    #[test]
    fn resumes_from_highest_cached_ancestor() {
        let (mut chain_db, chain) = chain_db_with(6);
        let mut job = InterpreterJob::new(ResultCache::temporary().unwrap());
        let interpreter = CountingInterpreter::new();

        run_to_completion(&mut job, &mut chain_db, &interpreter, chain[2].key());
        let after_prefix = interpreter.applied().len();
        assert_eq!(after_prefix, 4);

        run_to_completion(&mut job, &mut chain_db, &interpreter, chain[5].key());
        // only the three new tipsets were interpreted
        assert_eq!(interpreter.applied().len(), after_prefix + 3);
    }

    #[test]
    fn failure_marks_the_head_bad_and_short_circuits() {
        let (mut chain_db, chain) = chain_db_with(5);
        let mut job = InterpreterJob::new(ResultCache::temporary().unwrap());
        let interpreter = CountingInterpreter::failing_at(3);
        let head = chain.last().unwrap().key().clone();

        let done = run_to_completion(&mut job, &mut chain_db, &interpreter, &head);
        assert!(matches!(
            done.result,
            Err(SyncError::Validation(ValidationError::BadBlocks(_)))
        ));
        assert_eq!(
            job.cache().get(&chain[2].key().hash()).unwrap(),
            Some(CachedOutcome::Bad)
        );
        assert_eq!(job.cache().get(&head.hash()).unwrap(), Some(CachedOutcome::Bad));

        // retrying the same head fails without touching the interpreter
        let calls = interpreter.applied().len();
        let retry = job.start(&mut chain_db, &head).unwrap().expect("short-circuit");
        assert!(matches!(
            retry.result,
            Err(SyncError::Validation(ValidationError::TipsetMarkedBad))
        ));
        assert_eq!(interpreter.applied().len(), calls);
    }

    #[test]
    fn determinism_is_independent_of_chunking() {
        let (mut chain_db, chain) = chain_db_with(4);
        let head = chain.last().unwrap().key().clone();

        let first = {
            let mut job = InterpreterJob::new(ResultCache::temporary().unwrap());
            let interpreter = CountingInterpreter::new();
            run_to_completion(&mut job, &mut chain_db, &interpreter, &head)
                .result
                .unwrap()
        };
        // a second run over a fresh cache interprets in two chunks: prefix
        // first, then the rest
        let second = {
            let mut job = InterpreterJob::new(ResultCache::temporary().unwrap());
            let interpreter = CountingInterpreter::new();
            run_to_completion(&mut job, &mut chain_db, &interpreter, chain[1].key());
            run_to_completion(&mut job, &mut chain_db, &interpreter, &head)
                .result
                .unwrap()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn cancel_neutralizes_queued_steps() {
        let (mut chain_db, chain) = chain_db_with(4);
        let mut job = InterpreterJob::new(ResultCache::temporary().unwrap());
        let head = chain.last().unwrap().key().clone();

        assert!(job.start(&mut chain_db, &head).unwrap().is_none());
        let generation = job.generation();
        let (_, target) = job.status();
        assert_eq!(target, chain.last().unwrap().height());

        let progress = job.cancel();
        assert_eq!(progress.1, target);
        assert!(!job.is_active());
        // a step queued under the old generation no longer matches
        assert_ne!(job.generation(), generation);
    }
}
