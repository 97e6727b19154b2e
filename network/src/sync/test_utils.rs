//! In-memory collaborators and a deterministic chain generator shared by
//! the sync tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;
use slog::o;

use errors::{Error, ErrorKind};
use spindle_core::block::{Block, Extrinsic, Header, Justification};
use spindle_core::types::Hash;

use crate::p2p::methods::{
    BlockData, BlockRequest, BlockResponse, Direction, FromBlock, ReputationChange,
    REQUESTED_DATA_BODY, REQUESTED_DATA_HEADER, REQUESTED_DATA_JUSTIFICATION,
};
use crate::p2p::PeerId;
use crate::sync::interfaces::{
    BabeVerifier, BlockImportHandler, BlockState, FinalityGadget, Network, RequestMaker,
    RuntimeInstance, StorageState, TransactionState, TrieState,
};
use crate::sync::manager::SyncServices;
use crate::{SyncError, SyncErrorKind};

pub(crate) fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}

/// Builds a linked chain of headers `#0..=#n`. Different tags produce
/// disjoint chains with distinct hashes at every number.
pub(crate) fn build_headers_with_tag(n: u64, tag: u64) -> Vec<Header> {
    let mut headers = Vec::with_capacity(n as usize + 1);
    let genesis = Header {
        parent_hash: Hash::default(),
        number: 0,
        state_root: Hash::from_u64(0),
        extrinsics_root: Hash::from_u64(tag),
        digest: vec![],
    };
    headers.push(genesis);
    for number in 1..=n {
        let parent_hash = headers[number as usize - 1].hash();
        headers.push(Header {
            parent_hash,
            number,
            state_root: Hash::from_u64(number),
            extrinsics_root: Hash::from_u64(tag),
            digest: vec![],
        });
    }
    headers
}

pub(crate) fn build_headers(n: u64) -> Vec<Header> {
    build_headers_with_tag(n, 0)
}

fn body_for(header: &Header) -> Vec<Extrinsic> {
    vec![Extrinsic(header.hash().as_bytes()[..8].to_vec())]
}

/// A canonical chain, optional side chains and justifications, as a peer
/// would hold them.
#[derive(Clone)]
pub(crate) struct MockChain {
    /// Canonical headers indexed by number.
    pub headers: Vec<Header>,
    /// Every known header (canonical and forks) by hash.
    pub by_hash: HashMap<Hash, Header>,
    justifications: HashMap<Hash, Justification>,
}

impl MockChain {
    pub fn generate(n: u64) -> Self {
        Self::generate_fork(n, 0)
    }

    pub fn generate_fork(n: u64, tag: u64) -> Self {
        let headers = build_headers_with_tag(n, tag);
        let by_hash = headers.iter().map(|h| (h.hash(), h.clone())).collect();
        MockChain {
            headers,
            by_hash,
            justifications: HashMap::new(),
        }
    }

    /// Grows a side chain off the canonical block at `number` and records
    /// it in the hash index. Returns the side headers, lowest first.
    pub fn fork_from(&mut self, number: u64, len: u64, tag: u64) -> Vec<Header> {
        let mut side = Vec::with_capacity(len as usize);
        let mut parent_hash = self.headers[number as usize].hash();
        for offset in 1..=len {
            let header = Header {
                parent_hash,
                number: number + offset,
                state_root: Hash::from_u64(number + offset),
                extrinsics_root: Hash::from_u64(tag),
                digest: vec![],
            };
            parent_hash = header.hash();
            self.by_hash.insert(header.hash(), header.clone());
            side.push(header);
        }
        side
    }

    pub fn set_justification(&mut self, hash: Hash, justification: Justification) {
        self.justifications.insert(hash, justification);
    }

    fn data_for(&self, header: &Header, requested_data: u8) -> BlockData {
        let hash = header.hash();
        BlockData {
            hash,
            header: if requested_data & REQUESTED_DATA_HEADER != 0 {
                Some(header.clone())
            } else {
                None
            },
            body: if requested_data & REQUESTED_DATA_BODY != 0 {
                Some(body_for(header))
            } else {
                None
            },
            justification: if requested_data & REQUESTED_DATA_JUSTIFICATION != 0 {
                self.justifications.get(&hash).cloned()
            } else {
                None
            },
        }
    }

    /// Canonical blocks `start..start+count` as response data.
    pub fn block_data(&self, start: u64, count: usize, requested_data: u8) -> Vec<BlockData> {
        (start..start + count as u64)
            .filter_map(|number| self.headers.get(number as usize))
            .map(|header| self.data_for(header, requested_data))
            .collect()
    }
}

enum PeerBehavior {
    Truncate(usize),
    FailTransport,
    FailProtocol,
    ServeChain(MockChain),
}

/// Serves block requests from an in-memory chain, with per-peer scripted
/// misbehaviour.
pub(crate) struct ScriptedRequestMaker {
    chain: MockChain,
    behaviors: Mutex<HashMap<PeerId, PeerBehavior>>,
    calls: Mutex<Vec<(PeerId, BlockRequest)>>,
}

impl ScriptedRequestMaker {
    pub fn new(chain: MockChain) -> Self {
        ScriptedRequestMaker {
            chain,
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn truncate_responses(&self, peer: &PeerId, len: usize) {
        self.behaviors
            .lock()
            .insert(peer.clone(), PeerBehavior::Truncate(len));
    }

    pub fn fail_transport(&self, peer: &PeerId) {
        self.behaviors
            .lock()
            .insert(peer.clone(), PeerBehavior::FailTransport);
    }

    pub fn fail_protocol(&self, peer: &PeerId) {
        self.behaviors
            .lock()
            .insert(peer.clone(), PeerBehavior::FailProtocol);
    }

    pub fn serve_chain(&self, peer: &PeerId, chain: MockChain) {
        self.behaviors
            .lock()
            .insert(peer.clone(), PeerBehavior::ServeChain(chain));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn resolve(chain: &MockChain, request: &BlockRequest, limit: usize) -> Vec<BlockData> {
        let max = (request.max as usize).min(limit);
        let mut headers: Vec<Header> = Vec::with_capacity(max);
        match (&request.start, request.direction) {
            (FromBlock::Number(start), Direction::Ascending) => {
                for number in *start..start + max as u64 {
                    match chain.headers.get(number as usize) {
                        Some(header) => headers.push(header.clone()),
                        None => break,
                    }
                }
            }
            (FromBlock::Number(start), Direction::Descending) => {
                if let Some(header) = chain.headers.get(*start as usize) {
                    let mut cursor = Some(header.clone());
                    while let Some(header) = cursor {
                        let parent = chain.by_hash.get(&header.parent_hash).cloned();
                        headers.push(header);
                        if headers.len() >= max {
                            break;
                        }
                        cursor = parent;
                    }
                }
            }
            (FromBlock::Hash(start), Direction::Ascending) => {
                if let Some(anchor) = chain.by_hash.get(start) {
                    for number in anchor.number..anchor.number + max as u64 {
                        match chain.headers.get(number as usize) {
                            Some(header) => headers.push(header.clone()),
                            None => break,
                        }
                    }
                }
            }
            (FromBlock::Hash(start), Direction::Descending) => {
                let mut cursor = chain.by_hash.get(start).cloned();
                while let Some(header) = cursor {
                    let parent = chain.by_hash.get(&header.parent_hash).cloned();
                    headers.push(header);
                    if headers.len() >= max {
                        break;
                    }
                    cursor = parent;
                }
            }
        }

        headers
            .iter()
            .map(|header| chain.data_for(header, request.requested_data))
            .collect()
    }
}

impl RequestMaker for ScriptedRequestMaker {
    fn block_request(
        &self,
        peer: &PeerId,
        request: &BlockRequest,
    ) -> Result<BlockResponse, SyncError> {
        self.calls.lock().push((peer.clone(), request.clone()));

        let behaviors = self.behaviors.lock();
        let (chain, limit) = match behaviors.get(peer) {
            Some(PeerBehavior::FailTransport) => {
                return Err(SyncErrorKind::Transport.reason("connection reset by peer"));
            }
            Some(PeerBehavior::FailProtocol) => {
                return Err(SyncErrorKind::BadProtocol.reason("no supported protocol"));
            }
            Some(PeerBehavior::Truncate(len)) => (&self.chain, *len),
            Some(PeerBehavior::ServeChain(other)) => (other, usize::MAX),
            None => (&self.chain, usize::MAX),
        };

        Ok(BlockResponse {
            blocks: Self::resolve(chain, request, limit),
        })
    }
}

struct ChainDb {
    headers: HashMap<Hash, Header>,
    best: Header,
    finalized: Header,
    justifications: HashMap<Hash, Justification>,
    partials: Vec<BlockData>,
}

/// An in-memory `BlockState`.
pub(crate) struct MockBlockState {
    inner: Mutex<ChainDb>,
    runtime: Arc<MockRuntime>,
    paused: AtomicBool,
    finalized_senders: Mutex<Vec<Sender<Header>>>,
}

impl MockBlockState {
    pub fn with_genesis(genesis: Header) -> Arc<Self> {
        let mut headers = HashMap::new();
        headers.insert(genesis.hash(), genesis.clone());
        Arc::new(MockBlockState {
            inner: Mutex::new(ChainDb {
                headers,
                best: genesis.clone(),
                finalized: genesis,
                justifications: HashMap::new(),
                partials: Vec::new(),
            }),
            runtime: Arc::new(MockRuntime::default()),
            paused: AtomicBool::new(false),
            finalized_senders: Mutex::new(Vec::new()),
        })
    }

    pub fn insert_header(&self, header: Header) {
        let mut inner = self.inner.lock();
        if header.number > inner.best.number {
            inner.best = header.clone();
        }
        inner.headers.insert(header.hash(), header);
    }

    pub fn insert_chain(&self, headers: &[Header]) {
        for header in headers {
            self.insert_header(header.clone());
        }
    }

    pub fn set_finalized(&self, header: Header) {
        self.inner.lock().finalized = header.clone();
        for sender in self.finalized_senders.lock().iter() {
            let _ = sender.send(header.clone());
        }
    }

    pub fn best_number(&self) -> u64 {
        self.inner.lock().best.number
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn justification_for(&self, hash: &Hash) -> Option<Justification> {
        self.inner.lock().justifications.get(hash).cloned()
    }

    pub fn partial_count(&self) -> usize {
        self.inner.lock().partials.len()
    }

    pub fn runtime(&self) -> Arc<MockRuntime> {
        Arc::clone(&self.runtime)
    }
}

impl BlockState for MockBlockState {
    fn best_block_header(&self) -> Result<Header, Error> {
        Ok(self.inner.lock().best.clone())
    }

    fn get_highest_finalised_header(&self) -> Result<Header, Error> {
        Ok(self.inner.lock().finalized.clone())
    }

    fn has_header(&self, hash: &Hash) -> Result<bool, Error> {
        Ok(self.inner.lock().headers.contains_key(hash))
    }

    fn get_header(&self, hash: &Hash) -> Result<Option<Header>, Error> {
        Ok(self.inner.lock().headers.get(hash).cloned())
    }

    fn get_runtime(&self, _hash: &Hash) -> Result<Arc<dyn RuntimeInstance>, Error> {
        Ok(Arc::clone(&self.runtime) as Arc<dyn RuntimeInstance>)
    }

    fn compare_and_set_block_data(&self, block_data: &BlockData) -> Result<(), Error> {
        self.inner.lock().partials.push(block_data.clone());
        Ok(())
    }

    fn set_justification(&self, hash: &Hash, justification: Justification) -> Result<(), Error> {
        self.inner
            .lock()
            .justifications
            .insert(*hash, justification);
        Ok(())
    }

    fn finalised_notifier(&self) -> Receiver<Header> {
        let (tx, rx) = mpsc::channel();
        self.finalized_senders.lock().push(tx);
        rx
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct MockRuntime {
    executed: Mutex<Vec<Hash>>,
    context_root: Mutex<Option<Hash>>,
    fail_on: Mutex<Option<Hash>>,
}

impl MockRuntime {
    pub fn executed(&self) -> Vec<Hash> {
        self.executed.lock().clone()
    }

    pub fn fail_on(&self, hash: Hash) {
        *self.fail_on.lock() = Some(hash);
    }
}

impl RuntimeInstance for MockRuntime {
    fn set_context_storage(&self, trie_state: Arc<dyn TrieState>) {
        *self.context_root.lock() = Some(trie_state.root());
    }

    fn execute_block(&self, block: &Block) -> Result<(), Error> {
        let hash = block.hash();
        if self.fail_on.lock().as_ref() == Some(&hash) {
            return Err(ErrorKind::Execution.reason("scripted execution failure"));
        }
        self.executed.lock().push(hash);
        Ok(())
    }
}

struct MockTrieState {
    root: Hash,
}

impl TrieState for MockTrieState {
    fn root(&self) -> Hash {
        self.root
    }
}

/// Storage backend handing out snapshots at any requested root.
#[derive(Default)]
pub(crate) struct MockStorage {
    lock_balance: AtomicUsize,
}

impl MockStorage {
    /// Outstanding locks; zero once every import released its lock.
    pub fn lock_balance(&self) -> usize {
        self.lock_balance.load(Ordering::SeqCst)
    }
}

impl StorageState for MockStorage {
    fn trie_state(&self, root: &Hash) -> Result<Arc<dyn TrieState>, Error> {
        Ok(Arc::new(MockTrieState { root: *root }))
    }

    fn lock(&self) {
        self.lock_balance.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.lock_balance.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MockTransactionState {
    removed: Mutex<Vec<Extrinsic>>,
}

impl MockTransactionState {
    pub fn removed_count(&self) -> usize {
        self.removed.lock().len()
    }
}

impl TransactionState for MockTransactionState {
    fn remove_extrinsic(&self, extrinsic: &Extrinsic) {
        self.removed.lock().push(extrinsic.clone());
    }
}

#[derive(Default)]
pub(crate) struct MockNetwork {
    peers: Mutex<Vec<PeerId>>,
    reported: Mutex<Vec<(ReputationChange, PeerId)>>,
    handshakes: AtomicUsize,
}

impl MockNetwork {
    pub fn connect(&self, peer: PeerId) {
        self.peers.lock().push(peer);
    }

    pub fn reported(&self) -> Vec<(ReputationChange, PeerId)> {
        self.reported.lock().clone()
    }

    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

impl Network for MockNetwork {
    fn block_announce_handshake(&self, _best: &Header) -> Result<(), Error> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().clone()
    }

    fn report_peer(&self, change: ReputationChange, peer: &PeerId) {
        self.reported.lock().push((change, peer.clone()));
    }
}

#[derive(Default)]
pub(crate) struct NoopBabe {
    verified: AtomicUsize,
}

impl NoopBabe {
    pub fn verified_count(&self) -> usize {
        self.verified.load(Ordering::SeqCst)
    }
}

impl BabeVerifier for NoopBabe {
    fn verify_block(&self, _header: &Header) -> Result<(), Error> {
        self.verified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingFinality {
    verified: Mutex<Vec<(Hash, Justification)>>,
}

impl RecordingFinality {
    pub fn verified(&self) -> Vec<(Hash, Justification)> {
        self.verified.lock().clone()
    }
}

impl FinalityGadget for RecordingFinality {
    fn verify_block_justification(&self, hash: &Hash, justification: &[u8]) -> Result<(), Error> {
        self.verified.lock().push((*hash, justification.to_vec()));
        Ok(())
    }
}

/// Import handler committing into the mock block state.
pub(crate) struct MockImportHandler {
    state: Arc<MockBlockState>,
    imported: Mutex<Vec<(u64, Hash, bool)>>,
}

impl MockImportHandler {
    pub fn new(state: Arc<MockBlockState>) -> Self {
        MockImportHandler {
            state,
            imported: Mutex::new(Vec::new()),
        }
    }

    pub fn imported(&self) -> Vec<(u64, Hash, bool)> {
        self.imported.lock().clone()
    }

    pub fn imported_count(&self) -> usize {
        self.imported.lock().len()
    }
}

impl BlockImportHandler for MockImportHandler {
    fn handle_block_import(
        &self,
        block: &Block,
        _trie_state: Arc<dyn TrieState>,
        announce: bool,
    ) -> Result<(), Error> {
        self.state.insert_header(block.header.clone());
        self.imported
            .lock()
            .push((block.number(), block.hash(), announce));
        Ok(())
    }
}

/// The full collaborator set around one scripted chain.
pub(crate) struct TestContext {
    pub block_state: Arc<MockBlockState>,
    pub storage: Arc<MockStorage>,
    pub txs: Arc<MockTransactionState>,
    pub network: Arc<MockNetwork>,
    pub maker: Arc<ScriptedRequestMaker>,
    pub babe: Arc<NoopBabe>,
    pub finality: Arc<RecordingFinality>,
    pub importer: Arc<MockImportHandler>,
}

impl TestContext {
    /// Local state starts at the chain's genesis; peers serve the whole
    /// chain.
    pub fn new(chain: &MockChain) -> TestContext {
        let block_state = MockBlockState::with_genesis(chain.headers[0].clone());
        TestContext {
            storage: Arc::new(MockStorage::default()),
            txs: Arc::new(MockTransactionState::default()),
            network: Arc::new(MockNetwork::default()),
            maker: Arc::new(ScriptedRequestMaker::new(chain.clone())),
            babe: Arc::new(NoopBabe::default()),
            finality: Arc::new(RecordingFinality::default()),
            importer: Arc::new(MockImportHandler::new(Arc::clone(&block_state))),
            block_state,
        }
    }

    pub fn services(&self) -> SyncServices {
        SyncServices {
            block_state: Arc::clone(&self.block_state) as Arc<dyn BlockState>,
            storage_state: Arc::clone(&self.storage) as Arc<dyn StorageState>,
            transaction_state: Arc::clone(&self.txs) as Arc<dyn TransactionState>,
            network: Arc::clone(&self.network) as Arc<dyn Network>,
            request_maker: Arc::clone(&self.maker) as Arc<dyn RequestMaker>,
            babe_verifier: Arc::clone(&self.babe) as Arc<dyn BabeVerifier>,
            finality_gadget: Arc::clone(&self.finality) as Arc<dyn FinalityGadget>,
            block_import: Arc::clone(&self.importer) as Arc<dyn BlockImportHandler>,
        }
    }
}
