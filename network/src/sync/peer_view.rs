use std::collections::HashMap;

use parking_lot::RwLock;

use spindle_core::types::Hash;

use crate::p2p::PeerId;

/// The last-announced best block of one peer.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerView {
    pub peer: PeerId,
    pub best_hash: Hash,
    pub best_number: u64,
}

struct Entry {
    view: PeerView,
    /// Update sequence, used to break target ties in favour of the most
    /// recently updated peer.
    seq: u64,
}

/// Tracks each connected peer's announced best block and derives the
/// network sync target from them.
pub struct PeerViewSet {
    views: RwLock<HashMap<PeerId, Entry>>,
    next_seq: RwLock<u64>,
}

impl PeerViewSet {
    pub fn new() -> Self {
        PeerViewSet {
            views: RwLock::new(HashMap::new()),
            next_seq: RwLock::new(0),
        }
    }

    /// Records the best block a peer has shown us. Peers occasionally
    /// announce a block below one they already announced; the highest
    /// number seen from each peer is kept.
    pub fn update(&self, peer: PeerId, best_hash: Hash, best_number: u64) {
        let seq = {
            let mut next = self.next_seq.write();
            *next += 1;
            *next
        };

        let mut views = self.views.write();
        match views.get_mut(&peer) {
            Some(entry) => {
                if best_number < entry.view.best_number {
                    return;
                }
                entry.view.best_hash = best_hash;
                entry.view.best_number = best_number;
                entry.seq = seq;
            }
            None => {
                views.insert(
                    peer.clone(),
                    Entry {
                        view: PeerView {
                            peer,
                            best_hash,
                            best_number,
                        },
                        seq,
                    },
                );
            }
        }
    }

    /// Drops the view of a disconnected peer.
    pub fn remove(&self, peer: &PeerId) {
        self.views.write().remove(peer);
    }

    /// The highest best-block number any connected peer has announced, or
    /// 0 when no peer has reported yet.
    pub fn target(&self) -> u64 {
        self.best_view().map(|v| v.best_number).unwrap_or(0)
    }

    /// The view holding the target, ties broken by last update.
    pub fn best_view(&self) -> Option<PeerView> {
        let views = self.views.read();
        views
            .values()
            .max_by_key(|e| (e.view.best_number, e.seq))
            .map(|e| e.view.clone())
    }

    pub fn size(&self) -> usize {
        self.views.read().len()
    }

    pub fn values(&self) -> Vec<PeerView> {
        self.views.read().values().map(|e| e.view.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_set() -> PeerViewSet {
        PeerViewSet::new()
    }

    #[test]
    fn test_target_of_empty_set() {
        assert_eq!(view_set().target(), 0);
        assert_eq!(view_set().size(), 0);
    }

    #[test]
    fn test_target_is_max_over_peers() {
        let set = view_set();
        set.update(PeerId::from("a"), Hash::from_u64(10), 10);
        set.update(PeerId::from("b"), Hash::from_u64(500), 500);
        set.update(PeerId::from("c"), Hash::from_u64(77), 77);
        assert_eq!(set.target(), 500);
        assert_eq!(set.size(), 3);
        assert_eq!(set.values().len(), 3);
    }

    #[test]
    fn test_per_peer_best_is_monotone() {
        let set = view_set();
        let peer = PeerId::from("a");
        set.update(peer.clone(), Hash::from_u64(100), 100);
        // a stale re-announcement must not lower the tracked best
        set.update(peer.clone(), Hash::from_u64(90), 90);
        assert_eq!(set.target(), 100);

        set.update(peer.clone(), Hash::from_u64(101), 101);
        assert_eq!(set.target(), 101);
    }

    #[test]
    fn test_tie_broken_by_last_update() {
        let set = view_set();
        set.update(PeerId::from("a"), Hash::from_u64(1), 200);
        set.update(PeerId::from("b"), Hash::from_u64(2), 200);
        let best = set.best_view().unwrap();
        assert_eq!(best.peer, PeerId::from("b"));
        assert_eq!(best.best_hash, Hash::from_u64(2));
    }

    #[test]
    fn test_remove_can_lower_target() {
        let set = view_set();
        set.update(PeerId::from("a"), Hash::from_u64(300), 300);
        set.update(PeerId::from("b"), Hash::from_u64(200), 200);
        assert_eq!(set.target(), 300);
        set.remove(&PeerId::from("a"));
        assert_eq!(set.target(), 200);
    }
}
