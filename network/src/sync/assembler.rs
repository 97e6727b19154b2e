//! Reassembly of a contiguous chain slice from out-of-order worker
//! results.
//!
//! One assembler cycle owns a fixed window `[start_at, start_at+expected)`
//! of block numbers and keeps requesting until every slot is filled.
//! Responses may arrive from any peer in any order; gaps, short responses
//! and invalid responses are re-requested within the cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, trace, warn, Logger};

use spindle_core::types::Hash;

use crate::p2p::methods::{self, BlockData, BlockRequest, Direction, FromBlock};
use crate::sync::worker_pool::{SyncTaskResult, WorkerPool};
use crate::{SyncError, SyncErrorKind};

/// How long a cycle tolerates receiving nothing before re-seeding the
/// worker pool from the transport's peer list.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// Granularity at which the result loop re-checks the stop flag.
const RECV_TICK: Duration = Duration::from_millis(250);

pub struct ChainAssembler {
    pool: Arc<WorkerPool>,
    bad_blocks: Vec<Hash>,
    stop: Arc<AtomicBool>,
    log: Logger,
}

impl ChainAssembler {
    pub fn new(
        pool: Arc<WorkerPool>,
        bad_blocks: Vec<Hash>,
        stop: Arc<AtomicBool>,
        log: Logger,
    ) -> Self {
        ChainAssembler {
            pool,
            bad_blocks,
            stop,
            log,
        }
    }

    /// Collects worker results until the window starting at
    /// `start_at_block` holds `expected_count` contiguous blocks, then
    /// returns them in ascending order. Returns an empty vector on a
    /// clean stop.
    pub fn handle_workers_results(
        &self,
        result_tx: &Sender<SyncTaskResult>,
        result_rx: &Receiver<SyncTaskResult>,
        start_at_block: u64,
        expected_count: usize,
    ) -> Result<Vec<BlockData>, SyncError> {
        let mut slice: Vec<Option<BlockData>> = vec![None; expected_count];
        let mut waiting = expected_count;
        let mut last_result = Instant::now();

        while waiting > 0 {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }

            let result = match result_rx.recv_timeout(RECV_TICK) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    if last_result.elapsed() >= IDLE_TIMEOUT {
                        debug!(self.log, "No sync results for a while, re-seeding workers";
                            "waiting" => waiting);
                        self.pool.use_connected_peers();
                        last_result = Instant::now();
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SyncErrorKind::State
                        .reason("sync result channel closed with blocks still missing"));
                }
            };
            last_result = Instant::now();

            let placed = self.process_result(result, result_tx, start_at_block, &mut slice);
            waiting = waiting.saturating_sub(placed);
        }

        Ok(slice.into_iter().flatten().collect())
    }

    /// Handles one worker result. Returns how many new slots it filled;
    /// invalid results fill none and are resubmitted.
    fn process_result(
        &self,
        task_result: SyncTaskResult,
        result_tx: &Sender<SyncTaskResult>,
        start_at_block: u64,
        slice: &mut Vec<Option<BlockData>>,
    ) -> usize {
        let SyncTaskResult {
            peer,
            request,
            result,
        } = task_result;

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(self.log, "Sync request errored, resubmitting";
                    "peer" => format!("{}", peer), "error" => format!("{}", err));
                if *err.kind() == SyncErrorKind::BadProtocol {
                    self.pool.report_peer(methods::BAD_PROTOCOL, &peer);
                    self.pool.punish_peer(&peer);
                }
                self.pool.submit_request(request, None, result_tx);
                return 0;
            }
        };

        // orient the blocks ascending regardless of how they were served
        if request.direction == Direction::Descending {
            response.blocks.reverse();
        }

        if let Err(err) = validate_response_fields(&request, &response.blocks) {
            warn!(self.log, "Response missing requested fields, resubmitting";
                "peer" => format!("{}", peer), "error" => format!("{}", err));
            if *err.kind() == SyncErrorKind::IncompleteHeader {
                self.pool.report_peer(methods::INCOMPLETE_HEADER, &peer);
            }
            self.pool.submit_request(request, None, result_tx);
            return 0;
        }

        if !is_response_a_chain(&response.blocks) {
            warn!(self.log, "Response blocks do not form a chain, resubmitting";
                "peer" => format!("{}", peer));
            self.pool.submit_request(request, None, result_tx);
            return 0;
        }

        if !grows_assembled_chain(&response.blocks, slice, start_at_block) {
            warn!(self.log, "Response does not grow the assembled chain, resubmitting";
                "peer" => format!("{}", peer));
            self.pool.submit_request(request, None, result_tx);
            return 0;
        }

        if let Some(bad) = self.first_bad_block(&response.blocks) {
            warn!(self.log, "Peer served a blacklisted block";
                "peer" => format!("{}", peer), "hash" => format!("{}", bad));
            self.pool.report_peer(methods::BAD_BLOCK_ANNOUNCEMENT, &peer);
            self.pool.ignore_peer_as_worker(&peer);
            self.pool.submit_request(request, None, result_tx);
            return 0;
        }

        let received = response.blocks.len();
        let last_number = response.blocks.last().and_then(|b| b.number());

        let mut placed = 0;
        for block in response.blocks.drain(..) {
            let number = match block.number() {
                Some(number) => number,
                None => continue,
            };
            if number < start_at_block {
                continue;
            }
            let index = (number - start_at_block) as usize;
            if index >= slice.len() {
                continue;
            }
            if slice[index].is_none() {
                slice[index] = Some(block);
                placed += 1;
            }
        }
        trace!(self.log, "Response placed into window"; "peer" => format!("{}", peer),
            "received" => received, "placed" => placed);

        // a short response leaves a known suffix missing; chase it now
        if (received as u32) < request.max {
            if let Some(follow_up) = short_response_follow_up(&request, received, last_number) {
                debug!(self.log, "Short response, requesting remainder";
                    "peer" => format!("{}", peer), "received" => received,
                    "requested" => request.max, "follow_up" => format!("{}", follow_up));
                self.pool.submit_request(follow_up, None, result_tx);
            }
        }

        placed
    }

    fn first_bad_block(&self, blocks: &[BlockData]) -> Option<Hash> {
        blocks
            .iter()
            .map(|b| b.block_hash())
            .find(|hash| self.bad_blocks.contains(hash))
    }
}

/// Checks that every block carries the fields its request asked for.
pub(crate) fn validate_response_fields(
    request: &BlockRequest,
    blocks: &[BlockData],
) -> Result<(), SyncError> {
    for block in blocks {
        if request.wants_header() && block.header.is_none() {
            return Err(SyncErrorKind::IncompleteHeader
                .reason(format!("block {} has no header", block.hash)));
        }
        if request.wants_body() && block.body.is_none() {
            return Err(SyncErrorKind::IncompleteBlockData
                .reason(format!("block {} has no body", block.hash)));
        }
    }
    Ok(())
}

/// Checks intra-response contiguity: each block must be the parent of the
/// next. Expects ascending orientation.
pub(crate) fn is_response_a_chain(blocks: &[BlockData]) -> bool {
    blocks.windows(2).all(|pair| {
        match (&pair[0].header, &pair[1].header) {
            (Some(parent), Some(child)) => child.parent_hash == parent.hash(),
            // field presence is validated separately
            _ => true,
        }
    })
}

/// Checks chain growth at the join points between a response and the
/// already assembled window.
pub(crate) fn grows_assembled_chain(
    blocks: &[BlockData],
    slice: &[Option<BlockData>],
    start_at_block: u64,
) -> bool {
    let first = match blocks.first() {
        Some(first) => first,
        None => return true,
    };
    let first_number = match first.number() {
        Some(number) => number,
        None => return true,
    };

    if first_number >= start_at_block {
        let index = (first_number - start_at_block) as usize;
        if index > 0 && index <= slice.len() {
            if let Some(Some(previous)) = slice.get(index - 1) {
                let parent_ok = first
                    .header
                    .as_ref()
                    .map(|h| h.parent_hash == previous.block_hash())
                    .unwrap_or(true);
                if !parent_ok {
                    return false;
                }
            }
        }

        let after = index + blocks.len();
        if after < slice.len() {
            if let Some(next) = &slice[after] {
                let last = blocks.last().expect("blocks checked non-empty");
                let child_ok = next
                    .header
                    .as_ref()
                    .map(|h| h.parent_hash == last.block_hash())
                    .unwrap_or(true);
                if !child_ok {
                    return false;
                }
            }
        }
    }

    true
}

/// Builds the request completing a short response. An empty response
/// re-requests the original range in full; any other short response is
/// treated as a prefix of the requested range, and the remainder is
/// chased ascending from the last block received.
pub(crate) fn short_response_follow_up(
    request: &BlockRequest,
    received: usize,
    last_number: Option<u64>,
) -> Option<BlockRequest> {
    let missing = request.max.checked_sub(received as u32)?;
    if missing == 0 {
        return None;
    }
    if received == 0 {
        return Some(request.clone());
    }

    let last = last_number?;
    Some(BlockRequest {
        start: FromBlock::Number(last + 1),
        direction: Direction::Ascending,
        max: missing,
        requested_data: request.requested_data,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::p2p::methods::{BlockResponse, BOOTSTRAP_REQUESTED_DATA, REQUESTED_DATA_HEADER};
    use crate::p2p::PeerId;
    use crate::sync::interfaces::{Network, RequestMaker};
    use crate::sync::planner;
    use crate::sync::test_utils::{test_logger, MockChain, MockNetwork, ScriptedRequestMaker};

    fn ascending_request(start: u64, max: u32) -> BlockRequest {
        BlockRequest {
            start: FromBlock::Number(start),
            direction: Direction::Ascending,
            max,
            requested_data: BOOTSTRAP_REQUESTED_DATA,
        }
    }

    struct Fixture {
        pool: Arc<WorkerPool>,
        maker: Arc<ScriptedRequestMaker>,
        network: Arc<MockNetwork>,
        assembler: ChainAssembler,
    }

    fn fixture(chain: &MockChain, bad_blocks: Vec<Hash>) -> Fixture {
        let network = Arc::new(MockNetwork::default());
        let maker = Arc::new(ScriptedRequestMaker::new(chain.clone()));
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&maker) as Arc<dyn RequestMaker>,
            Arc::clone(&network) as Arc<dyn Network>,
            50,
            Duration::from_secs(30),
            test_logger(),
        ));
        let assembler = ChainAssembler::new(
            Arc::clone(&pool),
            bad_blocks,
            Arc::new(AtomicBool::new(false)),
            test_logger(),
        );
        Fixture {
            pool,
            maker,
            network,
            assembler,
        }
    }

    #[test]
    fn test_happy_single_batch() {
        let chain = MockChain::generate(40);
        let f = fixture(&chain, vec![]);
        f.pool.from_block_announce(PeerId::from("a"));

        let (tx, rx) = f.pool.submit_requests(vec![ascending_request(1, 30)]);
        let blocks = f
            .assembler
            .handle_workers_results(&tx, &rx, 1, 30)
            .unwrap();
        assert_eq!(blocks.len(), 30);
        for (offset, block) in blocks.iter().enumerate() {
            assert_eq!(block.number(), Some(1 + offset as u64));
        }
        f.pool.stop().unwrap();
    }

    #[test]
    fn test_out_of_order_batches_assemble_ascending() {
        let chain = MockChain::generate(64);
        let f = fixture(&chain, vec![]);
        f.pool.from_block_announce(PeerId::from("a"));
        f.pool.from_block_announce(PeerId::from("b"));

        let (tx, rx) = f
            .pool
            .submit_requests(vec![ascending_request(1, 32), ascending_request(33, 32)]);
        let blocks = f
            .assembler
            .handle_workers_results(&tx, &rx, 1, 64)
            .unwrap();
        assert_eq!(blocks.len(), 64);
        for pair in blocks.windows(2) {
            assert_eq!(
                pair[1].header.as_ref().unwrap().parent_hash,
                pair[0].block_hash()
            );
        }
        f.pool.stop().unwrap();
    }

    #[test]
    fn test_short_response_triggers_follow_up() {
        let chain = MockChain::generate(240);
        let f = fixture(&chain, vec![]);
        let peer = PeerId::from("a");
        // the peer only ever serves 80 blocks per response
        f.maker.truncate_responses(&peer, 80);
        f.pool.from_block_announce(peer);

        // serving 80-block slices, the cycle must chase the remainder
        let (tx, rx) = f.pool.submit_requests(vec![ascending_request(100, 128)]);
        let blocks = f
            .assembler
            .handle_workers_results(&tx, &rx, 100, 128)
            .unwrap();
        assert_eq!(blocks.len(), 128);
        assert_eq!(blocks[0].number(), Some(100));
        assert_eq!(blocks[127].number(), Some(227));
        f.pool.stop().unwrap();
    }

    #[test]
    fn test_bad_block_delivery_ignores_peer_and_resubmits() {
        // the bad peer serves a chain containing the blacklisted block;
        // the good peer is on a clean fork of the same numbers
        let poisoned = MockChain::generate(40);
        let clean = MockChain::generate_fork(40, 7);
        let bad_hash = poisoned.headers[6].hash();

        let f = fixture(&poisoned, vec![bad_hash]);
        let bad_peer = PeerId::from("bad");
        let good_peer = PeerId::from("good");
        f.pool.from_block_announce(bad_peer.clone());
        f.pool.from_block_announce(good_peer.clone());
        f.maker.serve_chain(&good_peer, clean);

        let (tx, rx) = mpsc::channel();
        f.pool
            .submit_request(ascending_request(5, 4), Some(&bad_peer), &tx);
        let blocks = f.assembler.handle_workers_results(&tx, &rx, 5, 4).unwrap();

        // the window filled from the clean fork only
        assert_eq!(blocks.len(), 4);
        assert!(blocks.iter().all(|b| b.block_hash() != bad_hash));
        let reported = f.network.reported();
        assert!(reported
            .iter()
            .any(|(change, peer)| *change == methods::BAD_BLOCK_ANNOUNCEMENT
                && *peer == bad_peer));
        assert_eq!(
            f.pool.worker_status(&bad_peer),
            Some(crate::sync::worker_pool::WorkerStatus::Ignored)
        );
        f.pool.stop().unwrap();
    }

    #[test]
    fn test_transport_error_resubmits_on_other_peer() {
        let chain = MockChain::generate(20);
        let f = fixture(&chain, vec![]);
        let flaky = PeerId::from("flaky");
        let solid = PeerId::from("solid");
        f.maker.fail_transport(&flaky);
        f.pool.from_block_announce(flaky.clone());
        f.pool.from_block_announce(solid);

        let (tx, rx) = mpsc::channel();
        f.pool
            .submit_request(ascending_request(1, 10), Some(&flaky), &tx);
        let blocks = f.assembler.handle_workers_results(&tx, &rx, 1, 10).unwrap();
        assert_eq!(blocks.len(), 10);
        f.pool.stop().unwrap();
    }

    #[test]
    fn test_bad_protocol_error_is_reported() {
        let chain = MockChain::generate(20);
        let f = fixture(&chain, vec![]);
        let wrong = PeerId::from("wrong");
        let solid = PeerId::from("solid");
        f.maker.fail_protocol(&wrong);
        f.pool.from_block_announce(wrong.clone());
        f.pool.from_block_announce(solid);

        let (tx, rx) = mpsc::channel();
        f.pool
            .submit_request(ascending_request(1, 5), Some(&wrong), &tx);
        let blocks = f.assembler.handle_workers_results(&tx, &rx, 1, 5).unwrap();
        assert_eq!(blocks.len(), 5);
        assert!(f
            .network
            .reported()
            .iter()
            .any(|(change, peer)| *change == methods::BAD_PROTOCOL && *peer == wrong));
        // protocol-level misbehaviour parks the slot for good
        assert_eq!(
            f.pool.worker_status(&wrong),
            Some(crate::sync::worker_pool::WorkerStatus::Punished)
        );
        f.pool.stop().unwrap();
    }

    #[test]
    fn test_descending_response_is_reversed() {
        let chain = MockChain::generate(30);
        let f = fixture(&chain, vec![]);
        f.pool.from_block_announce(PeerId::from("a"));

        let anchor = chain.headers[20].hash();
        let request = planner::descending_block_request(anchor, 5);
        let (tx, rx) = f.pool.submit_requests(vec![request]);
        let blocks = f.assembler.handle_workers_results(&tx, &rx, 16, 5).unwrap();
        assert_eq!(blocks.len(), 5);
        assert_eq!(blocks[0].number(), Some(16));
        assert_eq!(blocks[4].number(), Some(20));
        f.pool.stop().unwrap();
    }

    #[test]
    fn test_stop_returns_clean() {
        let chain = MockChain::generate(5);
        let network = Arc::new(MockNetwork::default());
        let maker = Arc::new(ScriptedRequestMaker::new(chain.clone()));
        let pool = Arc::new(WorkerPool::new(
            maker as Arc<dyn RequestMaker>,
            network as Arc<dyn Network>,
            50,
            Duration::from_secs(30),
            test_logger(),
        ));
        let stop = Arc::new(AtomicBool::new(true));
        let assembler = ChainAssembler::new(Arc::clone(&pool), vec![], stop, test_logger());

        let (tx, rx) = mpsc::channel();
        let blocks = assembler.handle_workers_results(&tx, &rx, 1, 10).unwrap();
        assert!(blocks.is_empty());
        pool.stop().unwrap();
    }

    #[test]
    fn test_validate_response_fields() {
        let chain = MockChain::generate(3);
        let full = ascending_request(1, 2);
        let mut blocks = chain.block_data(1, 2, BOOTSTRAP_REQUESTED_DATA);
        assert!(validate_response_fields(&full, &blocks).is_ok());

        blocks[1].body = None;
        let err = validate_response_fields(&full, &blocks).unwrap_err();
        assert_eq!(*err.kind(), SyncErrorKind::IncompleteBlockData);

        blocks[0].header = None;
        let headers_only = BlockRequest {
            requested_data: REQUESTED_DATA_HEADER,
            ..full
        };
        let err = validate_response_fields(&headers_only, &blocks).unwrap_err();
        assert_eq!(*err.kind(), SyncErrorKind::IncompleteHeader);
    }

    #[test]
    fn test_is_response_a_chain() {
        let chain = MockChain::generate(6);
        let blocks = chain.block_data(1, 5, BOOTSTRAP_REQUESTED_DATA);
        assert!(is_response_a_chain(&blocks));

        let mut broken = blocks.clone();
        broken.swap(1, 3);
        assert!(!is_response_a_chain(&broken));
    }

    #[test]
    fn test_grows_assembled_chain_rejects_mismatched_join() {
        let chain = MockChain::generate(10);
        let mut slice: Vec<Option<BlockData>> = vec![None; 6];
        // window covers numbers 1..=6, seed slot 0 with block #1
        slice[0] = chain.block_data(1, 1, BOOTSTRAP_REQUESTED_DATA).pop();

        let good = chain.block_data(2, 2, BOOTSTRAP_REQUESTED_DATA);
        assert!(grows_assembled_chain(&good, &slice, 1));

        let fork = MockChain::generate_fork(10, 3);
        let wrong = fork.block_data(2, 2, BOOTSTRAP_REQUESTED_DATA);
        assert!(!grows_assembled_chain(&wrong, &slice, 1));
    }

    #[test]
    fn test_short_follow_up_requests() {
        let request = ascending_request(100, 128);

        // 80 of 128 received: chase 48 from #180
        let follow = short_response_follow_up(&request, 80, Some(179)).unwrap();
        assert_eq!(follow.start, FromBlock::Number(180));
        assert_eq!(follow.max, 48);
        assert_eq!(follow.direction, Direction::Ascending);

        // empty response: re-request in full
        let retry = short_response_follow_up(&request, 0, None).unwrap();
        assert_eq!(retry, request);

        // complete response: nothing to chase
        assert!(short_response_follow_up(&request, 128, Some(227)).is_none());
    }

    #[test]
    fn test_short_descending_follow_up_is_ascending() {
        let request = BlockRequest {
            start: FromBlock::Hash(Hash::from_u64(99)),
            direction: Direction::Descending,
            max: 10,
            requested_data: BOOTSTRAP_REQUESTED_DATA,
        };

        // 4 of 10 received, reversed to ascending with #20 last: the
        // response counts as a prefix and the remainder is chased upward
        let follow = short_response_follow_up(&request, 4, Some(20)).unwrap();
        assert_eq!(follow.direction, Direction::Ascending);
        assert_eq!(follow.start, FromBlock::Number(21));
        assert_eq!(follow.max, 6);
        assert_eq!(follow.requested_data, request.requested_data);
    }

    #[test]
    fn test_join_mismatch_checked_before_bad_block_scan() {
        let chain = MockChain::generate(10);
        let fork = MockChain::generate_fork(10, 5);
        let bad_hash = fork.headers[2].hash();
        let f = fixture(&chain, vec![bad_hash]);
        let peer = PeerId::from("a");
        f.pool.from_block_announce(peer.clone());

        // window covers numbers 1..=3, slot 0 already holds block #1
        let mut slice: Vec<Option<BlockData>> = vec![None; 3];
        slice[0] = chain.block_data(1, 1, BOOTSTRAP_REQUESTED_DATA).pop();

        // the response both breaks the join against slot 0 and carries a
        // blacklisted block; the join failure must win
        let response = BlockResponse {
            blocks: fork.block_data(2, 2, BOOTSTRAP_REQUESTED_DATA),
        };
        let (tx, rx) = mpsc::channel();
        let result = SyncTaskResult {
            peer: peer.clone(),
            request: ascending_request(2, 2),
            result: Ok(response),
        };
        let placed = f.assembler.process_result(result, &tx, 1, &mut slice);

        assert_eq!(placed, 0);
        // plain resubmission, no reputation action and no ban
        assert!(f.network.reported().is_empty());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        let status = f.pool.worker_status(&peer);
        assert_ne!(status, Some(crate::sync::worker_pool::WorkerStatus::Ignored));
        assert_ne!(status, Some(crate::sync::worker_pool::WorkerStatus::Punished));
        f.pool.stop().unwrap();
    }
}
