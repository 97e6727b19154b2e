//! The set of announced blocks that cannot be imported yet, either because
//! their parent is unknown or because their body has not arrived.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slog::{debug, trace, Logger};

use spindle_core::block::{Block, Extrinsic, Header, Justification};
use spindle_core::types::Hash;

use crate::p2p::methods::MAX_BLOCKS_IN_RESPONSE;
use crate::{SyncError, SyncErrorKind};

/// Capacity of the pending set. When full, the oldest entry makes room.
pub const PENDING_BLOCKS_LIMIT: usize = MAX_BLOCKS_IN_RESPONSE as usize * 32;

/// A block known only partially. At minimum the hash is known.
#[derive(Clone, Debug)]
pub struct PendingBlock {
    pub hash: Hash,
    pub number: Option<u64>,
    pub header: Option<Header>,
    pub body: Option<Vec<Extrinsic>>,
    pub justification: Option<Justification>,
    pub received_at: Instant,
}

impl PendingBlock {
    fn new(hash: Hash) -> Self {
        PendingBlock {
            hash,
            number: None,
            header: None,
            body: None,
            justification: None,
            received_at: Instant::now(),
        }
    }

    /// The block number, from the explicit field or the header.
    pub fn number(&self) -> Option<u64> {
        self.number.or_else(|| self.header.as_ref().map(|h| h.number))
    }

    /// True once header and body are both present, so the block can be
    /// imported as soon as its parent is known.
    pub fn is_ready(&self) -> bool {
        self.header.is_some() && self.body.is_some()
    }
}

struct Inner {
    blocks: HashMap<Hash, PendingBlock>,
    /// Arrival order, oldest first. Entries may be stale after a removal;
    /// the eviction path skips them by comparing timestamps.
    arrival: VecDeque<(Hash, Instant)>,
}

/// Bounded store of announced-but-unready blocks.
pub struct DisjointBlockSet {
    inner: Mutex<Inner>,
    limit: usize,
    log: Logger,
}

impl DisjointBlockSet {
    pub fn new(log: Logger) -> Self {
        Self::with_limit(PENDING_BLOCKS_LIMIT, log)
    }

    pub fn with_limit(limit: usize, log: Logger) -> Self {
        DisjointBlockSet {
            inner: Mutex::new(Inner {
                blocks: HashMap::new(),
                arrival: VecDeque::new(),
            }),
            limit,
            log,
        }
    }

    pub fn has_block(&self, hash: &Hash) -> bool {
        self.inner.lock().blocks.contains_key(hash)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Tracks a block by hash and number only, typically from an announce
    /// of a block whose header we have not seen.
    pub fn add_hash_and_number(&self, hash: Hash, number: u64) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.blocks.get_mut(&hash) {
            existing.number = Some(number);
            return;
        }
        let mut pending = PendingBlock::new(hash);
        pending.number = Some(number);
        Self::insert(&mut inner, self.limit, pending, &self.log);
    }

    /// Adds a header, merging into an existing partial record. Fails when
    /// the set already holds this header.
    pub fn add_header(&self, header: Header) -> Result<(), SyncError> {
        let hash = header.hash();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.blocks.get_mut(&hash) {
            if existing.header.is_some() {
                return Err(SyncErrorKind::AlreadyInSet
                    .reason(format!("block {} already has a header", hash)));
            }
            existing.number = Some(header.number);
            existing.header = Some(header);
            return Ok(());
        }

        let mut pending = PendingBlock::new(hash);
        pending.number = Some(header.number);
        pending.header = Some(header);
        Self::insert(&mut inner, self.limit, pending, &self.log);
        Ok(())
    }

    /// Records a complete block, merging into any partial record.
    pub fn add_block(&self, block: Block, justification: Option<Justification>) {
        let hash = block.header.hash();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.blocks.get_mut(&hash) {
            existing.number = Some(block.header.number);
            existing.header = Some(block.header);
            existing.body = Some(block.body);
            if justification.is_some() {
                existing.justification = justification;
            }
            return;
        }

        let mut pending = PendingBlock::new(hash);
        pending.number = Some(block.header.number);
        pending.header = Some(block.header);
        pending.body = Some(block.body);
        pending.justification = justification;
        Self::insert(&mut inner, self.limit, pending, &self.log);
    }

    fn insert(inner: &mut Inner, limit: usize, pending: PendingBlock, log: &Logger) {
        while inner.blocks.len() >= limit {
            match inner.arrival.pop_front() {
                Some((hash, stamp)) => {
                    // skip stale queue entries left behind by removals
                    let live = inner
                        .blocks
                        .get(&hash)
                        .map(|p| p.received_at == stamp)
                        .unwrap_or(false);
                    if live {
                        trace!(log, "Evicting oldest pending block"; "hash" => format!("{}", hash));
                        inner.blocks.remove(&hash);
                    }
                }
                None => break,
            }
        }
        inner.arrival.push_back((pending.hash, pending.received_at));
        inner.blocks.insert(pending.hash, pending);
    }

    pub fn get_block(&self, hash: &Hash) -> Option<PendingBlock> {
        self.inner.lock().blocks.get(hash).cloned()
    }

    pub fn get_blocks(&self) -> Vec<PendingBlock> {
        self.inner.lock().blocks.values().cloned().collect()
    }

    pub fn remove_block(&self, hash: &Hash) {
        self.inner.lock().blocks.remove(hash);
    }

    /// Drops every entry at or below the given block number. Called on
    /// finalisation; nothing at or below the finalised head can still be
    /// imported.
    pub fn remove_lower_blocks(&self, number: u64) {
        let mut inner = self.inner.lock();
        inner
            .blocks
            .retain(|_, pending| pending.number().map(|n| n > number).unwrap_or(true));
    }

    fn clear_stale(&self, ttl: Duration) {
        let mut inner = self.inner.lock();
        let before = inner.blocks.len();
        inner
            .blocks
            .retain(|_, pending| pending.received_at.elapsed() < ttl);
        let dropped = before - inner.blocks.len();
        if dropped > 0 {
            debug!(self.log, "Dropped stale pending blocks"; "count" => dropped);
        }
    }

    /// Housekeeping loop. Prunes on every finalisation notification and
    /// on a periodic tick; returns on `stop` or when the notifier closes.
    pub fn run(&self, finalized_rx: Receiver<Header>, ttl: Duration, stop: Arc<AtomicBool>) {
        let tick = (ttl / 4).min(Duration::from_secs(1));
        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            match finalized_rx.recv_timeout(tick) {
                Ok(finalized) => {
                    trace!(self.log, "Pruning pending set on finalisation";
                        "finalized_number" => finalized.number);
                    self.remove_lower_blocks(finalized.number);
                }
                Err(RecvTimeoutError::Timeout) => self.clear_stale(ttl),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}
