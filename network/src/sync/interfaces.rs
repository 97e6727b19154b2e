//! Capability interfaces of the sync service's collaborators.
//!
//! The service owns no global state; every handle below is taken at
//! construction and shared as `Arc<dyn …>`.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use errors::Error;

use spindle_core::block::{Block, Extrinsic, Header, Justification};
use spindle_core::types::Hash;

use crate::p2p::methods::{BlockData, BlockRequest, BlockResponse, ReputationChange};
use crate::p2p::PeerId;
use crate::SyncError;

/// A read-only snapshot of the state trie at one root.
pub trait TrieState: Send + Sync {
    /// The root this snapshot was opened at.
    fn root(&self) -> Hash;
}

/// Access to the locally stored chain of blocks.
pub trait BlockState: Send + Sync {
    fn best_block_header(&self) -> Result<Header, Error>;

    fn get_highest_finalised_header(&self) -> Result<Header, Error>;

    fn has_header(&self, hash: &Hash) -> Result<bool, Error>;

    /// Looks a header up by hash. `Ok(None)` is an ordinary miss, `Err` a
    /// storage failure.
    fn get_header(&self, hash: &Hash) -> Result<Option<Header>, Error>;

    /// The runtime instance valid as of the given block. Instances are not
    /// concurrency-safe; the caller serializes use.
    fn get_runtime(&self, hash: &Hash) -> Result<Arc<dyn RuntimeInstance>, Error>;

    /// Stores whatever fields of a partially known block are present.
    fn compare_and_set_block_data(&self, block_data: &BlockData) -> Result<(), Error>;

    fn set_justification(&self, hash: &Hash, justification: Justification) -> Result<(), Error>;

    /// A channel of newly finalised headers, consumed by the pending-set
    /// housekeeper.
    fn finalised_notifier(&self) -> Receiver<Header>;

    /// True while block import is suspended (e.g. during a state
    /// snapshot); sync requests are rejected at submission time.
    fn is_paused(&self) -> bool;
}

/// Access to the backing state storage.
pub trait StorageState: Send + Sync {
    /// Opens a trie snapshot rooted at `root`.
    fn trie_state(&self, root: &Hash) -> Result<Arc<dyn TrieState>, Error>;

    /// Exclusive access across one execute-and-commit sequence.
    fn lock(&self);
    fn unlock(&self);
}

/// The node's transaction queue.
pub trait TransactionState: Send + Sync {
    fn remove_extrinsic(&self, extrinsic: &Extrinsic);
}

/// The connection-level network service.
pub trait Network: Send + Sync {
    /// Broadcasts our block-announce handshake, advertising `best`.
    fn block_announce_handshake(&self, best: &Header) -> Result<(), Error>;

    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerId>;

    /// Forwards a reputation delta to the peer-set.
    fn report_peer(&self, change: ReputationChange, peer: &PeerId);
}

/// Performs the wire-level block-request RPC against one peer.
pub trait RequestMaker: Send + Sync {
    fn block_request(&self, peer: &PeerId, request: &BlockRequest)
        -> Result<BlockResponse, SyncError>;
}

/// Verifies block production (slot author, VRF, equivocation).
pub trait BabeVerifier: Send + Sync {
    fn verify_block(&self, header: &Header) -> Result<(), Error>;
}

/// Verifies finality justifications.
pub trait FinalityGadget: Send + Sync {
    fn verify_block_justification(&self, hash: &Hash, justification: &[u8]) -> Result<(), Error>;
}

/// Commits an executed block and its post-state to the database.
pub trait BlockImportHandler: Send + Sync {
    fn handle_block_import(
        &self,
        block: &Block,
        trie_state: Arc<dyn TrieState>,
        announce: bool,
    ) -> Result<(), Error>;
}

/// A sandboxed WebAssembly runtime bound to one code version.
pub trait RuntimeInstance: Send + Sync {
    /// Points the runtime's host storage at the given snapshot.
    fn set_context_storage(&self, trie_state: Arc<dyn TrieState>);

    /// Executes the block's state transition against the context storage.
    fn execute_block(&self, block: &Block) -> Result<(), Error>;
}
