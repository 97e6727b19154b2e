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

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use hex::FromHexError as HexError;

/// 32-byte blake2b block/state digest.
#[derive(Default, Copy, Clone, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Builds a digest from up to 32 bytes, right-aligned: shorter input
    /// is zero-padded on the left, longer input keeps its trailing 32
    /// bytes.
    pub fn from_bytes(src: &[u8]) -> Self {
        let mut out = [0u8; 32];
        let take = src.len().min(32);
        out[32 - take..].copy_from_slice(&src[src.len() - take..]);
        Hash(out)
    }

    pub fn from_hex(text: &str) -> Result<Self, HexError> {
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        hex::decode(digits).map(|bytes| Self::from_bytes(&bytes))
    }

    pub fn make_hash(data: &[u8]) -> Self {
        Hash(hash::blake2b_256(data))
    }

    pub fn from_u64(val: u64) -> Self {
        Self::from_bytes(&val.to_be_bytes())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // abbreviated form for logs
        write!(f, "0x{}", hex::encode(&self.0[..4]))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Hash {
    fn from(src: &[u8]) -> Self {
        Hash::from_bytes(src)
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&format_args!("0x{}", hex::encode(self.0)))
    }
}

impl<'a> Deserialize<'a> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'a>,
    {
        let text = String::deserialize(deserializer)?;
        Hash::from_hex(&text).map_err(serde::de::Error::custom)
    }
}
