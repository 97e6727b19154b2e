//! Available P2P method types for block synchronization.

use serde::{Deserialize, Serialize};

use spindle_core::block::{Extrinsic, Header, Justification};
use spindle_core::types::Hash;

/* Request/Response data structures for P2P methods */

pub type RequestId = usize;

/// The protocol-level cap on the number of blocks a single response may
/// carry. Requests must not ask for more.
pub const MAX_BLOCKS_IN_RESPONSE: u32 = 128;

/// Requested-data bit flags. The encoding is fixed by the protocol.
pub const REQUESTED_DATA_HEADER: u8 = 1;
pub const REQUESTED_DATA_BODY: u8 = 2;
pub const REQUESTED_DATA_JUSTIFICATION: u8 = 4;

/// The full bundle requested while catching up: header, body and
/// justification of every block.
pub const BOOTSTRAP_REQUESTED_DATA: u8 =
    REQUESTED_DATA_HEADER | REQUESTED_DATA_BODY | REQUESTED_DATA_JUSTIFICATION;

/// Direction in which a block request walks the chain, starting from
/// `BlockRequest::start`.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// From the start block towards higher numbers.
    Ascending,
    /// From the start block towards lower numbers.
    Descending,
}

impl Direction {
    /// The protocol encoding of the direction.
    pub fn as_u8(&self) -> u8 {
        match self {
            Direction::Ascending => 0,
            Direction::Descending => 1,
        }
    }
}

impl From<u8> for Direction {
    fn from(encoded: u8) -> Direction {
        match encoded {
            1 => Direction::Descending,
            _ => Direction::Ascending,
        }
    }
}

/// The block a request is anchored at, either by hash or by number.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum FromBlock {
    Hash(Hash),
    Number(u64),
}

/// Request a batch of blocks from a peer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlockRequest {
    /// The first block of the batch.
    pub start: FromBlock,

    /// Whether the batch walks up or down the chain from `start`.
    pub direction: Direction,

    /// The number of blocks requested, at most `MAX_BLOCKS_IN_RESPONSE`.
    pub max: u32,

    /// Bitmask of `REQUESTED_DATA_*` flags selecting the fields each
    /// returned block must carry.
    pub requested_data: u8,
}

impl BlockRequest {
    pub fn wants_header(&self) -> bool {
        self.requested_data & REQUESTED_DATA_HEADER != 0
    }

    pub fn wants_body(&self) -> bool {
        self.requested_data & REQUESTED_DATA_BODY != 0
    }

    pub fn wants_justification(&self) -> bool {
        self.requested_data & REQUESTED_DATA_JUSTIFICATION != 0
    }
}

/// A single block of a response. Fields are present according to the
/// request's data bitmask and what the serving peer actually had.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlockData {
    pub hash: Hash,
    pub header: Option<Header>,
    pub body: Option<Vec<Extrinsic>>,
    pub justification: Option<Justification>,
}

impl BlockData {
    /// The block number, when a header is present.
    pub fn number(&self) -> Option<u64> {
        self.header.as_ref().map(|h| h.number)
    }

    /// The block hash, recomputed from the header when one is present.
    pub fn block_hash(&self) -> Hash {
        self.header.as_ref().map(|h| h.hash()).unwrap_or(self.hash)
    }
}

/// The ordered blocks answering one `BlockRequest`, oriented per the
/// request's direction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlockResponse {
    pub blocks: Vec<BlockData>,
}

/// Gossip notification of a newly produced or newly learned block.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlockAnnounce {
    pub header: Header,

    /// Whether the sender considers this its best block.
    pub best_block: bool,
}

/// The handshake exchanged when the block-announce substream opens,
/// carrying the remote's view of its own chain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlockAnnounceHandshake {
    /// The role bitmap of the sender.
    pub roles: u8,

    /// Best block number of the sender.
    pub best_number: u64,

    /// Best block hash of the sender.
    pub best_hash: Hash,

    /// Genesis hash of the sender's chain.
    pub genesis_hash: Hash,
}

impl std::fmt::Display for BlockAnnounceHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Handshake: Roles: {}, Best number: {}, Best hash: {}, Genesis hash: {}",
            self.roles, self.best_number, self.best_hash, self.genesis_hash
        )
    }
}

impl std::fmt::Display for BlockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let start = match &self.start {
            FromBlock::Hash(h) => format!("{}", h),
            FromBlock::Number(n) => format!("#{}", n),
        };
        write!(
            f,
            "Start: {}, Direction: {:?}, Max: {}, Data: {:#04b}",
            start, self.direction, self.max, self.requested_data
        )
    }
}

/* Peer reputation */

/// A change to a peer's reputation score, forwarded verbatim to the
/// peer-set collaborator which owns the scoring scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReputationChange {
    pub value: i32,
    pub reason: &'static str,
}

impl ReputationChange {
    pub const fn new(value: i32, reason: &'static str) -> Self {
        ReputationChange { value, reason }
    }
}

/// Peer negotiated an unsupported protocol.
pub const BAD_PROTOCOL: ReputationChange = ReputationChange::new(-(1 << 12), "Unsupported protocol");

/// Peer sent a response missing a header the request asked for.
pub const INCOMPLETE_HEADER: ReputationChange =
    ReputationChange::new(-(1 << 8), "Incomplete header");

/// Peer delivered a block on the configured blacklist.
pub const BAD_BLOCK_ANNOUNCEMENT: ReputationChange =
    ReputationChange::new(-(1 << 16), "Bad block announcement");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_encoding() {
        assert_eq!(Direction::Ascending.as_u8(), 0);
        assert_eq!(Direction::Descending.as_u8(), 1);
        assert_eq!(Direction::from(0), Direction::Ascending);
        assert_eq!(Direction::from(1), Direction::Descending);
    }

    #[test]
    fn test_requested_data_bits() {
        assert_eq!(REQUESTED_DATA_HEADER, 1);
        assert_eq!(REQUESTED_DATA_BODY, 2);
        assert_eq!(REQUESTED_DATA_JUSTIFICATION, 4);
        assert_eq!(BOOTSTRAP_REQUESTED_DATA, 7);

        let request = BlockRequest {
            start: FromBlock::Number(1),
            direction: Direction::Ascending,
            max: MAX_BLOCKS_IN_RESPONSE,
            requested_data: REQUESTED_DATA_HEADER | REQUESTED_DATA_JUSTIFICATION,
        };
        assert!(request.wants_header());
        assert!(!request.wants_body());
        assert!(request.wants_justification());
    }

    #[test]
    fn test_request_round_trip() {
        let request = BlockRequest {
            start: FromBlock::Hash(Hash::make_hash(b"anchor")),
            direction: Direction::Descending,
            max: 5,
            requested_data: BOOTSTRAP_REQUESTED_DATA,
        };
        let encoded = bincode::serialize(&request).unwrap();
        let decoded: BlockRequest = bincode::deserialize(&encoded).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn test_block_data_number() {
        let bd = BlockData {
            hash: Hash::default(),
            header: None,
            body: None,
            justification: None,
        };
        assert_eq!(bd.number(), None);
        assert_eq!(bd.block_hash(), Hash::default());
    }
}
