// Copyright 2026 Spindle Authors.
// This file is part of Spindle.

// Spindle is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Spindle is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Spindle.  If not, see <http://www.gnu.org/licenses/>.

use serde::{Deserialize, Serialize};

use super::types::Hash;

/// A single entry of a header's consensus digest. The content is opaque to
/// the sync layer; it is produced and consumed by the consensus engines.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DigestItem(pub Vec<u8>);

/// Block header
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Header {
    pub parent_hash: Hash,
    pub number: u64,
    pub state_root: Hash,
    pub extrinsics_root: Hash,
    pub digest: Vec<DigestItem>,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            parent_hash: Hash([0; 32]),
            number: 0,
            state_root: Hash([0; 32]),
            extrinsics_root: Hash([0; 32]),
            digest: Vec::new(),
        }
    }
}

impl Header {
    pub fn hash(&self) -> Hash {
        let encoded: Vec<u8> = bincode::serialize(&self).unwrap();
        Hash(hash::blake2b_256(encoded))
    }
}

/// An opaque, encoded transaction carried in a block body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Extrinsic(pub Vec<u8>);

impl Extrinsic {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// The ordered extrinsics of one block.
pub type Body = Vec<Extrinsic>;

/// Opaque finality proof bytes, checked by the finality gadget.
pub type Justification = Vec<u8>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub body: Body,
}

impl Default for Block {
    fn default() -> Self {
        Block {
            header: Default::default(),
            body: Vec::new(),
        }
    }
}

impl Block {
    pub fn new(header: Header, body: Body) -> Self {
        Block { header, body }
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Encoded size of the body in bytes.
    pub fn body_size(&self) -> usize {
        bincode::serialize(&self.body).map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_hash_changes_with_fields() {
        let base: Header = Default::default();
        let mut child = base.clone();
        child.number = 1;
        child.parent_hash = base.hash();
        assert_ne!(base.hash(), child.hash());
        assert_eq!(child.parent_hash, base.hash());
    }

    #[test]
    fn test_header_hash_is_stable() {
        let header = Header {
            number: 42,
            ..Default::default()
        };
        assert_eq!(header.hash(), header.hash());
    }

    #[test]
    fn test_body_size_of_empty_block() {
        let block = Block::default();
        // bincode encodes an empty vec as its length prefix
        assert!(block.body_size() > 0);
    }

    #[test]
    fn test_block_round_trip() {
        let block = Block::new(
            Header {
                number: 7,
                ..Default::default()
            },
            vec![Extrinsic(vec![1, 2, 3])],
        );
        let encoded = bincode::serialize(&block).unwrap();
        let decoded: Block = bincode::deserialize(&encoded).unwrap();
        assert_eq!(block, decoded);
    }
}
