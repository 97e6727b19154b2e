//! The primary object handling and driving block synchronization. It owns
//! the bootstrap/tip state machine, reacts to block announces and
//! handshakes, and imports every assembled block through the runtime and
//! the external import handler.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slog::{debug, error, info, trace, warn, Logger};

use metrics::{BLOCKS_SYNCED_TOTAL, SYNCER_IS_SYNCED, SYNC_BLOCK_SIZE};
use spindle_core::block::{Block, Header, Justification};
use spindle_core::types::Hash;

use crate::config::SyncConfig;
use crate::p2p::methods::{
    BlockAnnounce, BlockAnnounceHandshake, BlockData, BlockRequest, MAX_BLOCKS_IN_RESPONSE,
};
use crate::p2p::PeerId;
use crate::sync::assembler::ChainAssembler;
use crate::sync::disjoint::DisjointBlockSet;
use crate::sync::interfaces::{
    BabeVerifier, BlockImportHandler, BlockState, FinalityGadget, Network, RequestMaker,
    StorageState, TransactionState,
};
use crate::sync::peer_view::PeerViewSet;
use crate::sync::planner;
use crate::sync::worker_pool::WorkerPool;
use crate::{SyncError, SyncErrorKind};

/// Hard deadline for `stop` to drain every sync task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// The two operating modes of the sync service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// The local head is far behind the network target; blocks are pulled
    /// in large ascending batches.
    Bootstrap,
    /// The local head is near the target; block announces drive
    /// incremental catch-up.
    Tip,
}

// Single-word cell so every task observes mode flips atomically.
struct ModeCell(AtomicU8);

impl ModeCell {
    fn new(mode: SyncMode) -> Self {
        ModeCell(AtomicU8::new(Self::encode(mode)))
    }

    fn encode(mode: SyncMode) -> u8 {
        match mode {
            SyncMode::Bootstrap => 0,
            SyncMode::Tip => 1,
        }
    }

    fn get(&self) -> SyncMode {
        match self.0.load(Ordering::SeqCst) {
            0 => SyncMode::Bootstrap,
            _ => SyncMode::Tip,
        }
    }

    fn swap(&self, mode: SyncMode) -> SyncMode {
        match self.0.swap(Self::encode(mode), Ordering::SeqCst) {
            0 => SyncMode::Bootstrap,
            _ => SyncMode::Tip,
        }
    }
}

/// Where a block entered the node from; initial-sync blocks skip
/// production verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockOrigin {
    NetworkInitialSync,
    NetworkBroadcast,
}

/// The collaborators the sync service is constructed over.
pub struct SyncServices {
    pub block_state: Arc<dyn BlockState>,
    pub storage_state: Arc<dyn StorageState>,
    pub transaction_state: Arc<dyn TransactionState>,
    pub network: Arc<dyn Network>,
    pub request_maker: Arc<dyn RequestMaker>,
    pub babe_verifier: Arc<dyn BabeVerifier>,
    pub finality_gadget: Arc<dyn FinalityGadget>,
    pub block_import: Arc<dyn BlockImportHandler>,
}

pub struct SyncManager {
    cfg: SyncConfig,
    mode: ModeCell,
    peer_view: PeerViewSet,
    pending: Arc<DisjointBlockSet>,
    pool: Arc<WorkerPool>,
    assembler: ChainAssembler,

    block_state: Arc<dyn BlockState>,
    storage_state: Arc<dyn StorageState>,
    transaction_state: Arc<dyn TransactionState>,
    network: Arc<dyn Network>,
    babe_verifier: Arc<dyn BabeVerifier>,
    finality_gadget: Arc<dyn FinalityGadget>,
    block_import: Arc<dyn BlockImportHandler>,

    stop: Arc<AtomicBool>,
    /// Serializes assembler cycles; the bootstrap loop and the announce
    /// path never run one concurrently.
    cycle_lock: Mutex<()>,
    tasks: AtomicUsize,
    done_tx: Mutex<Sender<()>>,
    done_rx: Mutex<Receiver<()>>,
    log: Logger,
}

/// Creates a `SyncManager` and spawns its long-running tasks: the
/// pending-set housekeeper and the sync loop.
pub fn spawn(cfg: SyncConfig, services: SyncServices, log: Logger) -> Arc<SyncManager> {
    let manager = Arc::new(SyncManager::new(cfg, services, log));
    debug!(manager.log, "Sync manager started");

    // optimistically synced until a handshake proves otherwise
    SYNCER_IS_SYNCED.set(1);

    {
        let m = Arc::clone(&manager);
        manager.spawn_task(move || {
            let finalized_rx = m.block_state.finalised_notifier();
            let ttl = m.cfg.pending_ttl;
            let stop = Arc::clone(&m.stop);
            m.pending.run(finalized_rx, ttl, stop);
        });
    }
    {
        let m = Arc::clone(&manager);
        manager.spawn_task(move || m.sync_loop());
    }

    manager
}

impl SyncManager {
    pub fn new(cfg: SyncConfig, services: SyncServices, log: Logger) -> SyncManager {
        let stop = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&services.request_maker),
            Arc::clone(&services.network),
            cfg.max_peers,
            cfg.ignore_cooldown,
            log.clone(),
        ));
        let assembler = ChainAssembler::new(
            Arc::clone(&pool),
            cfg.bad_blocks.clone(),
            Arc::clone(&stop),
            log.clone(),
        );
        let (done_tx, done_rx) = mpsc::channel();

        SyncManager {
            cfg,
            mode: ModeCell::new(SyncMode::Tip),
            peer_view: PeerViewSet::new(),
            pending: Arc::new(DisjointBlockSet::new(log.clone())),
            pool,
            assembler,
            block_state: services.block_state,
            storage_state: services.storage_state,
            transaction_state: services.transaction_state,
            network: services.network,
            babe_verifier: services.babe_verifier,
            finality_gadget: services.finality_gadget,
            block_import: services.block_import,
            stop,
            cycle_lock: Mutex::new(()),
            tasks: AtomicUsize::new(0),
            done_tx: Mutex::new(done_tx),
            done_rx: Mutex::new(done_rx),
            log,
        }
    }

    fn spawn_task<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.tasks.fetch_add(1, Ordering::SeqCst);
        let done_tx = self.done_tx.lock().clone();
        thread::spawn(move || {
            task();
            let _ = done_tx.send(());
        });
    }

    pub fn mode(&self) -> SyncMode {
        self.mode.get()
    }

    pub fn peer_view(&self) -> &PeerViewSet {
        &self.peer_view
    }

    pub fn pending_blocks(&self) -> &DisjointBlockSet {
        &self.pending
    }

    fn set_mode(&self, next: SyncMode) {
        let previous = self.mode.swap(next);
        if previous != next {
            info!(self.log, "Sync mode changed";
                "old_mode" => format!("{:?}", previous),
                "new_mode" => format!("{:?}", next));
            SYNCER_IS_SYNCED.set(match next {
                SyncMode::Bootstrap => 0,
                SyncMode::Tip => 1,
            });
        }
    }

    /// Re-derives the mode from the local best and the network target.
    /// Called only at decision points, never mid-batch.
    fn evaluate_mode(&self) {
        let target = self.peer_view.target();
        let best = match self.block_state.best_block_header() {
            Ok(header) => header.number,
            Err(err) => {
                warn!(self.log, "Failed to read best header"; "error" => format!("{}", err));
                return;
            }
        };
        let next = if best + (MAX_BLOCKS_IN_RESPONSE as u64) < target {
            SyncMode::Bootstrap
        } else {
            SyncMode::Tip
        };
        self.set_mode(next);
    }

    /* Input handling */

    /// A peer's view of its own chain arrived over the block-announce
    /// handshake.
    pub fn on_block_announce_handshake(&self, peer: PeerId, handshake: BlockAnnounceHandshake) {
        trace!(self.log, "Block announce handshake";
            "peer" => format!("{}", peer), "handshake" => format!("{}", handshake));
        self.peer_view
            .update(peer.clone(), handshake.best_hash, handshake.best_number);
        self.pool.from_block_announce(peer);

        // a handshake may reveal we are far behind; the reverse flip is
        // the bootstrap loop's own decision
        if self.mode() == SyncMode::Tip {
            self.evaluate_mode();
        }
    }

    /// A peer has disconnected; its view and worker slot die with it.
    pub fn on_peer_disconnected(&self, peer: &PeerId) {
        debug!(self.log, "Peer disconnected"; "peer" => format!("{}", peer));
        self.peer_view.remove(peer);
        self.pool.peer_disconnected(peer);
    }

    /// Handles a gossiped block announce.
    pub fn on_block_announce(&self, peer: PeerId, announce: BlockAnnounce) -> Result<(), SyncError> {
        let header = announce.header;
        let hash = header.hash();
        let number = header.number;
        trace!(self.log, "Block announce"; "peer" => format!("{}", peer),
            "number" => number, "hash" => format!("{}", hash));

        self.pool.from_block_announce(peer.clone());
        if announce.best_block {
            self.peer_view.update(peer.clone(), hash, number);
        }

        if self.pending.has_block(&hash) {
            return Err(SyncErrorKind::AlreadyInSet
                .reason(format!("block {} was already announced", hash)));
        }
        if self
            .block_state
            .has_header(&hash)
            .map_err(|e| SyncErrorKind::State.cause(e))?
        {
            trace!(self.log, "Announced block already known"; "hash" => format!("{}", hash));
            return Ok(());
        }

        self.pending.add_header(header)?;

        if self.mode() == SyncMode::Bootstrap {
            // the bootstrap loop will walk past this block anyway
            return Ok(());
        }

        let best = self
            .block_state
            .best_block_header()
            .map_err(|e| SyncErrorKind::State.cause(e))?;
        let finalized = self
            .block_state
            .get_highest_finalised_header()
            .map_err(|e| SyncErrorKind::State.cause(e))?;

        if number <= finalized.number {
            // nothing below the finalised head can be imported; the
            // housekeeper will drop the pending entry
            debug!(self.log, "Ignoring stale block announce";
                "number" => number, "finalized" => finalized.number);
            return Ok(());
        }

        if number < best.number {
            // a fork below our head: walk down from the announced block
            // until the chains join, bounded by the finalised root
            let gap = number - finalized.number;
            let request = planner::descending_block_request(
                hash,
                gap.min(MAX_BLOCKS_IN_RESPONSE as u64) as u32,
            );
            debug!(self.log, "Fork announce, requesting side chain";
                "peer" => format!("{}", peer), "number" => number, "gap" => gap);
            self.run_announce_request(request, number)?;
        } else {
            let gap = number - best.number;
            let request =
                planner::descending_block_request(hash, gap.min(MAX_BLOCKS_IN_RESPONSE as u64) as u32);
            debug!(self.log, "Chain announce, requesting gap";
                "peer" => format!("{}", peer), "number" => number, "gap" => gap);
            self.run_announce_request(request, number)?;
        }

        self.request_pending_blocks(&finalized)
    }

    /// Runs one request through the worker pool and imports the resulting
    /// blocks. `tip_number` is the number of the request's anchor block.
    fn run_announce_request(&self, request: BlockRequest, tip_number: u64) -> Result<(), SyncError> {
        if self.block_state.is_paused() {
            return Err(SyncErrorKind::Paused.reason("block state is paused"));
        }

        let expected = request.max as usize;
        let start_at = tip_number + 1 - request.max as u64;

        let _cycle = self.cycle_lock.lock();
        let (result_tx, result_rx) = self.pool.submit_requests(vec![request]);
        let blocks = self
            .assembler
            .handle_workers_results(&result_tx, &result_rx, start_at, expected)?;
        for block in blocks {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.process_block_data(block, BlockOrigin::NetworkBroadcast)?;
        }
        Ok(())
    }

    /// Sweeps the pending set: imports blocks whose parents arrived and
    /// fills in the rest with descending requests.
    fn request_pending_blocks(&self, finalized: &Header) -> Result<(), SyncError> {
        for pending in self.pending.get_blocks() {
            let number = match pending.number() {
                Some(number) => number,
                None => continue,
            };
            if number <= finalized.number {
                continue;
            }

            if let Some(header) = pending.header.clone() {
                let parent_known = self
                    .block_state
                    .has_header(&header.parent_hash)
                    .map_err(|e| SyncErrorKind::State.cause(e))?;
                if parent_known && pending.is_ready() {
                    let block_data = BlockData {
                        hash: pending.hash,
                        header: Some(header),
                        body: pending.body.clone(),
                        justification: pending.justification.clone(),
                    };
                    self.process_block_data(block_data, BlockOrigin::NetworkBroadcast)?;
                    continue;
                }
            }

            let gap = (number - finalized.number).min(MAX_BLOCKS_IN_RESPONSE as u64) as u32;
            let request = planner::descending_block_request(pending.hash, gap);
            debug!(self.log, "Filling pending block"; "number" => number,
                "hash" => format!("{}", pending.hash), "gap" => gap);
            self.run_announce_request(request, number)?;
        }
        Ok(())
    }

    /* The sync loop */

    fn sync_loop(&self) {
        self.wait_workers_and_target();
        while !self.stop.load(Ordering::SeqCst) {
            match self.mode() {
                SyncMode::Bootstrap => {
                    if let Err(err) = self.bootstrap_cycle() {
                        warn!(self.log, "Bootstrap cycle failed";
                            "error" => format!("{}", err));
                        thread::sleep(self.cfg.wait_peers_duration);
                    }
                }
                SyncMode::Tip => {
                    self.evaluate_mode();
                    if self.mode() == SyncMode::Tip {
                        thread::sleep(self.cfg.wait_peers_duration);
                    }
                }
            }
        }
    }

    /// Blocks until enough workers are available and a sync target is
    /// known, broadcasting our handshake on every tick.
    fn wait_workers_and_target(&self) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            self.pool.use_connected_peers();
            let workers = self.pool.total_workers();
            let target = self.peer_view.target();
            if workers >= self.cfg.min_peers && target > 0 {
                info!(self.log, "Sync ready"; "workers" => workers, "target" => target);
                return;
            }
            debug!(self.log, "Waiting for sync peers and target";
                "workers" => workers, "min_peers" => self.cfg.min_peers, "target" => target);

            match self.block_state.best_block_header() {
                Ok(best) => {
                    if let Err(err) = self.network.block_announce_handshake(&best) {
                        debug!(self.log, "Handshake broadcast failed";
                            "error" => format!("{}", err));
                    }
                }
                Err(err) => {
                    warn!(self.log, "Failed to read best header"; "error" => format!("{}", err))
                }
            }
            thread::sleep(self.cfg.wait_peers_duration);
        }
    }

    /// One bootstrap iteration: plan ascending batches from the local
    /// best to the target, drive them through the assembler and import
    /// everything in order.
    fn bootstrap_cycle(&self) -> Result<(), SyncError> {
        if self.block_state.is_paused() {
            return Err(SyncErrorKind::Paused.reason("block state is paused"));
        }
        let best = self
            .block_state
            .best_block_header()
            .map_err(|e| SyncErrorKind::State.cause(e))?;
        let target = self.peer_view.target();
        if best.number + MAX_BLOCKS_IN_RESPONSE as u64 >= target {
            self.set_mode(SyncMode::Tip);
            return Ok(());
        }

        let start = best.number + 1;
        let requests = planner::ascending_block_requests(start, target);
        let expected = planner::planned_count(&requests);
        info!(self.log, "Bootstrap cycle"; "start" => start, "target" => target,
            "batches" => requests.len());

        let _cycle = self.cycle_lock.lock();
        let (result_tx, result_rx) = self.pool.submit_requests(requests);
        let blocks = self
            .assembler
            .handle_workers_results(&result_tx, &result_rx, start, expected)?;
        for block in blocks {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.process_block_data(block, BlockOrigin::NetworkInitialSync)?;
        }
        drop(_cycle);

        self.evaluate_mode();
        Ok(())
    }

    /* Block import */

    /// Routes one piece of block data: full blocks are imported, known
    /// blocks may pick up a late justification, partial data is stored.
    pub fn process_block_data(
        &self,
        block_data: BlockData,
        origin: BlockOrigin,
    ) -> Result<(), SyncError> {
        let hash = block_data.block_hash();
        if self
            .block_state
            .has_header(&hash)
            .map_err(|e| SyncErrorKind::State.cause(e))?
        {
            if let Some(justification) = block_data.justification {
                self.finality_gadget
                    .verify_block_justification(&hash, &justification)
                    .map_err(|e| SyncErrorKind::Verification.cause(e))?;
                self.block_state
                    .set_justification(&hash, justification)
                    .map_err(|e| SyncErrorKind::State.cause(e))?;
            }
            self.pending.remove_block(&hash);
            return Ok(());
        }

        match (block_data.header.clone(), block_data.body.clone()) {
            (Some(header), Some(body)) => {
                self.import_block(Block::new(header, body), block_data.justification, origin)
            }
            _ => {
                self.block_state
                    .compare_and_set_block_data(&block_data)
                    .map_err(|e| SyncErrorKind::State.cause(e))
            }
        }
    }

    /// Verifies, executes and commits a single block.
    fn import_block(
        &self,
        block: Block,
        justification: Option<Justification>,
        origin: BlockOrigin,
    ) -> Result<(), SyncError> {
        let hash = block.hash();

        if origin != BlockOrigin::NetworkInitialSync {
            self.babe_verifier
                .verify_block(&block.header)
                .map_err(|e| SyncErrorKind::Verification.cause(e))?;
        }

        let parent = self
            .block_state
            .get_header(&block.header.parent_hash)
            .map_err(|e| SyncErrorKind::State.cause(e))?
            .ok_or_else(|| {
                SyncErrorKind::FailedToGetParent.reason(format!(
                    "parent {} of block {} not found",
                    block.header.parent_hash, hash
                ))
            })?;

        self.storage_state.lock();
        let result = self.execute_and_commit(&hash, &block, &parent, justification);
        self.storage_state.unlock();
        result?;

        self.pending.remove_block(&hash);
        for extrinsic in &block.body {
            self.transaction_state.remove_extrinsic(extrinsic);
        }

        BLOCKS_SYNCED_TOTAL.inc();
        SYNC_BLOCK_SIZE.set(block.body_size() as i64);
        info!(self.log, "Block imported"; "number" => block.number(),
            "hash" => format!("{}", hash), "origin" => format!("{:?}", origin));
        Ok(())
    }

    // Runs with the storage lock held.
    fn execute_and_commit(
        &self,
        hash: &Hash,
        block: &Block,
        parent: &Header,
        justification: Option<Justification>,
    ) -> Result<(), SyncError> {
        let trie_state = self
            .storage_state
            .trie_state(&parent.state_root)
            .map_err(|e| SyncErrorKind::State.cause(e))?;
        if trie_state.root() != parent.state_root {
            // the snapshot disagreeing with the parent header means the
            // local database is corrupted
            error!(self.log, "State snapshot root does not match parent header";
                "snapshot_root" => format!("{:?}", trie_state.root()),
                "parent_state_root" => format!("{:?}", parent.state_root));
            panic!(
                "state snapshot root {:?} does not match parent state root {:?}",
                trie_state.root(),
                parent.state_root
            );
        }

        let runtime = self
            .block_state
            .get_runtime(&parent.hash())
            .map_err(|e| SyncErrorKind::State.cause(e))?;
        runtime.set_context_storage(Arc::clone(&trie_state));
        runtime
            .execute_block(block)
            .map_err(|e| SyncErrorKind::Execution.cause(e))?;

        if let Some(justification) = justification {
            self.finality_gadget
                .verify_block_justification(hash, &justification)
                .map_err(|e| SyncErrorKind::Verification.cause(e))?;
            self.block_state
                .set_justification(hash, justification)
                .map_err(|e| SyncErrorKind::State.cause(e))?;
        }

        let announce = self.mode() == SyncMode::Tip;
        self.block_import
            .handle_block_import(block, trie_state, announce)
            .map_err(|e| SyncErrorKind::State.cause(e))
    }

    /* Shutdown */

    /// Stops every sync task and the worker pool, waiting up to the
    /// shutdown deadline for them to drain.
    pub fn stop(&self) -> Result<(), SyncError> {
        if self.stop.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(self.log, "Sync manager stopping");
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;

        let pool_result = self.pool.stop();

        let count = self.tasks.load(Ordering::SeqCst);
        let done_rx = self.done_rx.lock();
        for _ in 0..count {
            let now = Instant::now();
            if now >= deadline {
                return Err(SyncErrorKind::StopTimeout
                    .reason("sync tasks did not drain within the shutdown deadline"));
            }
            if done_rx.recv_timeout(deadline - now).is_err() {
                return Err(SyncErrorKind::StopTimeout
                    .reason("sync tasks did not drain within the shutdown deadline"));
            }
        }
        pool_result
    }
}
