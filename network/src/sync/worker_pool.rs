//! The pool of per-peer sync workers.
//!
//! Every known peer owns one slot and one worker thread. A worker performs
//! a single blocking block-request at a time; results are delivered on the
//! sink channel of the task in whatever order the workers finish. Retry
//! policy does not live here, the caller resubmits failed requests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use parking_lot::Mutex;
use rand::prelude::*;
use slog::{debug, trace, warn, Logger};

use crate::p2p::methods::{BlockRequest, BlockResponse};
use crate::p2p::PeerId;
use crate::sync::interfaces::{Network, RequestMaker};
use crate::{SyncError, SyncErrorKind};

/// How long `stop` waits for workers to drain.
pub const POOL_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Ready for a request.
    Idle,
    /// A request is in flight.
    Busy,
    /// Temporarily out of selection, e.g. after serving a bad block.
    Ignored,
    /// Permanently out of selection for protocol-level misbehaviour.
    Punished,
}

/// One unit of work handed to a worker.
pub struct SyncTask {
    pub request: BlockRequest,
    pub result_tx: Sender<SyncTaskResult>,
}

/// The outcome of one task. On error the original request is carried so
/// the caller can resubmit it against a different peer.
#[derive(Debug)]
pub struct SyncTaskResult {
    pub peer: PeerId,
    pub request: BlockRequest,
    pub result: Result<BlockResponse, SyncError>,
}

struct WorkerSlot {
    status: WorkerStatus,
    status_since: Instant,
    task_tx: Sender<SyncTask>,
}

struct PoolShared {
    // Lock order: slots before queued.
    slots: Mutex<FnvHashMap<PeerId, WorkerSlot>>,
    queued: Mutex<VecDeque<SyncTask>>,
    live: AtomicUsize,
    stopping: AtomicBool,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    request_maker: Arc<dyn RequestMaker>,
    network: Arc<dyn Network>,
    max_peers: usize,
    ignore_cooldown: Duration,
    log: Logger,
}

impl WorkerPool {
    pub fn new(
        request_maker: Arc<dyn RequestMaker>,
        network: Arc<dyn Network>,
        max_peers: usize,
        ignore_cooldown: Duration,
        log: Logger,
    ) -> Self {
        WorkerPool {
            shared: Arc::new(PoolShared {
                slots: Mutex::new(FnvHashMap::default()),
                queued: Mutex::new(VecDeque::new()),
                live: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
            }),
            request_maker,
            network,
            max_peers,
            ignore_cooldown,
            log,
        }
    }

    /// Records that a peer announced a block and is therefore alive and
    /// eligible as a worker.
    pub fn from_block_announce(&self, peer: PeerId) {
        self.add_peer(peer);
    }

    /// Re-seeds the pool from the transport's current peer list and lifts
    /// ignores that have cooled down.
    pub fn use_connected_peers(&self) {
        for peer in self.network.peers() {
            self.add_peer(peer);
        }

        {
            let mut slots = self.shared.slots.lock();
            for slot in slots.values_mut() {
                if slot.status == WorkerStatus::Ignored
                    && slot.status_since.elapsed() >= self.ignore_cooldown
                {
                    slot.status = WorkerStatus::Idle;
                    slot.status_since = Instant::now();
                }
            }
        }

        self.flush_queue();
    }

    fn add_peer(&self, peer: PeerId) {
        let mut slots = self.shared.slots.lock();
        if self.shared.stopping.load(Ordering::SeqCst) || slots.contains_key(&peer) {
            return;
        }
        if slots.len() >= self.max_peers {
            return;
        }

        let (task_tx, task_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let request_maker = Arc::clone(&self.request_maker);
        let worker_peer = peer.clone();
        let log = self.log.clone();
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || worker_loop(worker_peer, task_rx, shared, request_maker, log));

        debug!(self.log, "Worker added to pool"; "peer" => format!("{}", peer));
        slots.insert(
            peer,
            WorkerSlot {
                status: WorkerStatus::Idle,
                status_since: Instant::now(),
                task_tx,
            },
        );
    }

    /// Schedules one request. A preferred peer is used when it is idle;
    /// otherwise any idle, non-ignored peer takes it; with no such peer
    /// the task queues until a worker frees up.
    pub fn submit_request(
        &self,
        request: BlockRequest,
        preferred: Option<&PeerId>,
        result_tx: &Sender<SyncTaskResult>,
    ) {
        let task = SyncTask {
            request,
            result_tx: result_tx.clone(),
        };

        let mut slots = self.shared.slots.lock();
        let chosen = Self::pick_idle_peer(&slots, preferred);
        match chosen {
            Some(peer) => {
                let slot = slots.get_mut(&peer).expect("chosen from the slot map");
                slot.status = WorkerStatus::Busy;
                slot.status_since = Instant::now();
                trace!(self.log, "Dispatching request"; "peer" => format!("{}", peer),
                    "request" => format!("{}", task.request));
                let _ = slot.task_tx.send(task);
            }
            None => {
                trace!(self.log, "No idle worker, queueing request";
                    "request" => format!("{}", task.request));
                self.shared.queued.lock().push_back(task);
            }
        }
    }

    /// Batched submission. All results arrive unordered on the returned
    /// channel; the sender half is also handed back so the caller can
    /// route resubmissions into the same cycle.
    pub fn submit_requests(
        &self,
        requests: Vec<BlockRequest>,
    ) -> (Sender<SyncTaskResult>, Receiver<SyncTaskResult>) {
        let (result_tx, result_rx) = mpsc::channel();
        for request in requests {
            self.submit_request(request, None, &result_tx);
        }
        (result_tx, result_rx)
    }

    fn pick_idle_peer(
        slots: &FnvHashMap<PeerId, WorkerSlot>,
        preferred: Option<&PeerId>,
    ) -> Option<PeerId> {
        if let Some(peer) = preferred {
            if let Some(slot) = slots.get(peer) {
                if slot.status == WorkerStatus::Idle {
                    return Some(peer.clone());
                }
            }
        }

        // randomize for load balancing
        let mut rng = rand::thread_rng();
        let mut idle: Vec<&PeerId> = slots
            .iter()
            .filter(|(_, slot)| slot.status == WorkerStatus::Idle)
            .map(|(peer, _)| peer)
            .collect();
        idle.shuffle(&mut rng);
        idle.first().map(|peer| (*peer).clone())
    }

    fn flush_queue(&self) {
        loop {
            let mut slots = self.shared.slots.lock();
            let mut queued = self.shared.queued.lock();
            if queued.is_empty() {
                return;
            }
            let peer = match Self::pick_idle_peer(&slots, None) {
                Some(peer) => peer,
                None => return,
            };
            let task = queued.pop_front().expect("queue checked non-empty");
            let slot = slots.get_mut(&peer).expect("chosen from the slot map");
            slot.status = WorkerStatus::Busy;
            slot.status_since = Instant::now();
            let _ = slot.task_tx.send(task);
        }
    }

    /// Removes a disconnected peer's slot. Its worker thread drains any
    /// in-flight request and exits.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.shared.slots.lock().remove(peer);
    }

    /// Soft-bans a peer from worker selection until the cooldown expires.
    pub fn ignore_peer_as_worker(&self, peer: &PeerId) {
        let mut slots = self.shared.slots.lock();
        if let Some(slot) = slots.get_mut(peer) {
            if slot.status != WorkerStatus::Punished {
                debug!(self.log, "Ignoring peer as worker"; "peer" => format!("{}", peer));
                slot.status = WorkerStatus::Ignored;
                slot.status_since = Instant::now();
            }
        }
    }

    /// Parks a peer permanently for protocol-level misbehaviour.
    pub fn punish_peer(&self, peer: &PeerId) {
        let mut slots = self.shared.slots.lock();
        if let Some(slot) = slots.get_mut(peer) {
            warn!(self.log, "Punishing peer"; "peer" => format!("{}", peer));
            slot.status = WorkerStatus::Punished;
            slot.status_since = Instant::now();
        }
    }

    /// Forwards a reputation delta to the peer-set collaborator.
    pub fn report_peer(&self, change: crate::p2p::methods::ReputationChange, peer: &PeerId) {
        self.network.report_peer(change, peer);
    }

    pub fn total_workers(&self) -> usize {
        self.shared.slots.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn worker_status(&self, peer: &PeerId) -> Option<WorkerStatus> {
        self.shared.slots.lock().get(peer).map(|slot| slot.status)
    }

    /// Shuts the pool down: closes every worker's task channel, drops
    /// queued work and waits for the worker threads to drain.
    pub fn stop(&self) -> Result<(), SyncError> {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.slots.lock().clear();
        self.shared.queued.lock().clear();

        let deadline = Instant::now() + POOL_STOP_TIMEOUT;
        while self.shared.live.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return Err(SyncErrorKind::StopTimeout
                    .reason("sync worker pool did not drain within its deadline"));
            }
            thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }
}

fn worker_loop(
    peer: PeerId,
    task_rx: Receiver<SyncTask>,
    shared: Arc<PoolShared>,
    request_maker: Arc<dyn RequestMaker>,
    log: Logger,
) {
    let mut next: Option<SyncTask> = None;
    loop {
        let task = match next.take() {
            Some(task) => task,
            None => match task_rx.recv() {
                Ok(task) => task,
                // pool dropped our sender: shutting down or slot removed
                Err(_) => break,
            },
        };
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        let result = request_maker.block_request(&peer, &task.request);
        if let Err(ref err) = result {
            trace!(log, "Block request failed"; "peer" => format!("{}", peer),
                "error" => format!("{}", err));
        }
        let _ = task.result_tx.send(SyncTaskResult {
            peer: peer.clone(),
            request: task.request,
            result,
        });

        // take queued work if this slot is still in rotation, otherwise
        // hand the slot back as idle
        let mut slots = shared.slots.lock();
        let mut queued = shared.queued.lock();
        match slots.get_mut(&peer) {
            Some(slot) if slot.status == WorkerStatus::Busy => {
                if let Some(task) = queued.pop_front() {
                    next = Some(task);
                } else {
                    slot.status = WorkerStatus::Idle;
                    slot.status_since = Instant::now();
                }
            }
            _ => {}
        }
    }
    shared.live.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::p2p::methods::{Direction, FromBlock, BOOTSTRAP_REQUESTED_DATA};
    use crate::sync::test_utils::{test_logger, MockChain, MockNetwork, ScriptedRequestMaker};

    fn request(start: u64, max: u32) -> BlockRequest {
        BlockRequest {
            start: FromBlock::Number(start),
            direction: Direction::Ascending,
            max,
            requested_data: BOOTSTRAP_REQUESTED_DATA,
        }
    }

    fn pool_with(
        chain: &MockChain,
        network: Arc<MockNetwork>,
        cooldown: Duration,
    ) -> (WorkerPool, Arc<ScriptedRequestMaker>) {
        let maker = Arc::new(ScriptedRequestMaker::new(chain.clone()));
        let pool = WorkerPool::new(
            Arc::clone(&maker) as Arc<dyn RequestMaker>,
            network as Arc<dyn Network>,
            50,
            cooldown,
            test_logger(),
        );
        (pool, maker)
    }

    #[test]
    fn test_dispatch_to_preferred_peer() {
        let chain = MockChain::generate(10);
        let network = Arc::new(MockNetwork::default());
        let (pool, _) = pool_with(&chain, Arc::clone(&network), Duration::from_secs(30));
        pool.from_block_announce(PeerId::from("a"));
        pool.from_block_announce(PeerId::from("b"));
        assert_eq!(pool.total_workers(), 2);

        let (tx, rx) = mpsc::channel();
        pool.submit_request(request(1, 5), Some(&PeerId::from("b")), &tx);
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.peer, PeerId::from("b"));
        assert_eq!(result.result.unwrap().blocks.len(), 5);

        pool.stop().unwrap();
    }

    #[test]
    fn test_single_worker_serializes_requests() {
        let chain = MockChain::generate(20);
        let network = Arc::new(MockNetwork::default());
        let (pool, _) = pool_with(&chain, Arc::clone(&network), Duration::from_secs(30));
        pool.from_block_announce(PeerId::from("a"));

        let (tx, rx) = mpsc::channel();
        pool.submit_request(request(1, 5), None, &tx);
        pool.submit_request(request(6, 5), None, &tx);

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(first.result.is_ok());
        assert!(second.result.is_ok());
        assert_eq!(first.peer, second.peer);

        pool.stop().unwrap();
    }

    #[test]
    fn test_ignored_peer_is_skipped_until_cooldown() {
        let chain = MockChain::generate(10);
        let network = Arc::new(MockNetwork::default());
        let (pool, _) = pool_with(&chain, Arc::clone(&network), Duration::from_millis(0));
        let peer = PeerId::from("a");
        pool.from_block_announce(peer.clone());
        pool.ignore_peer_as_worker(&peer);
        assert_eq!(pool.worker_status(&peer), Some(WorkerStatus::Ignored));

        // the only worker is ignored, the task must queue
        let (tx, rx) = mpsc::channel();
        pool.submit_request(request(1, 2), None, &tx);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // cooldown of zero: re-seeding lifts the ignore and flushes the queue
        pool.use_connected_peers();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.result.is_ok());

        pool.stop().unwrap();
    }

    #[test]
    fn test_punished_peer_stays_parked() {
        let chain = MockChain::generate(10);
        let network = Arc::new(MockNetwork::default());
        let (pool, _) = pool_with(&chain, Arc::clone(&network), Duration::from_millis(0));
        let peer = PeerId::from("a");
        pool.from_block_announce(peer.clone());
        pool.punish_peer(&peer);

        pool.use_connected_peers();
        assert_eq!(pool.worker_status(&peer), Some(WorkerStatus::Punished));

        pool.stop().unwrap();
    }

    #[test]
    fn test_use_connected_peers_seeds_from_network() {
        let chain = MockChain::generate(10);
        let network = Arc::new(MockNetwork::default());
        network.connect(PeerId::from("a"));
        network.connect(PeerId::from("b"));
        network.connect(PeerId::from("c"));

        let (pool, _) = pool_with(&chain, Arc::clone(&network), Duration::from_secs(30));
        assert_eq!(pool.total_workers(), 0);
        pool.use_connected_peers();
        assert_eq!(pool.total_workers(), 3);

        pool.stop().unwrap();
    }

    #[test]
    fn test_transport_error_carries_request() {
        let chain = MockChain::generate(10);
        let network = Arc::new(MockNetwork::default());
        let (pool, maker) = pool_with(&chain, Arc::clone(&network), Duration::from_secs(30));
        let peer = PeerId::from("a");
        maker.fail_transport(&peer);
        pool.from_block_announce(peer.clone());

        let (tx, rx) = mpsc::channel();
        let original = request(3, 4);
        pool.submit_request(original.clone(), None, &tx);
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.request, original);
        assert_eq!(
            *result.result.unwrap_err().kind(),
            SyncErrorKind::Transport
        );

        pool.stop().unwrap();
    }

    #[test]
    fn test_stop_drains_workers() {
        let chain = MockChain::generate(10);
        let network = Arc::new(MockNetwork::default());
        let (pool, _) = pool_with(&chain, Arc::clone(&network), Duration::from_secs(30));
        for name in &["a", "b", "c"] {
            pool.from_block_announce(PeerId::from(*name));
        }
        pool.stop().unwrap();
        assert_eq!(pool.total_workers(), 0);
    }
}
