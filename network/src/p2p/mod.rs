//! The wire-visible surface of the block-sync protocol.
//!
//! The codec and transport live behind the `RequestMaker` and `Network`
//! collaborators; this module only defines the method types exchanged with
//! peers and the identity under which a peer is tracked.

use std::fmt;

use serde::{Deserialize, Serialize};

pub use methods::{
    BlockAnnounce, BlockAnnounceHandshake, BlockData, BlockRequest, BlockResponse, Direction,
    FromBlock, RequestId,
};

pub mod methods;

/// Opaque identity of a connected peer, assigned by the transport layer.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}
