use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use service::TrackerStorage;

use codec::{address::PeerAddress, crypto::PublicKey, data::Data, id::Id160};

/// Entries one location/domain pair will hold at most.
const MAX_ENTRIES: usize = 1000;

/// In-memory tracker storage.
///
/// One list of peers per location/domain pair, newest entry per peer wins.
/// Insertion policies beyond the size cap and TTL expiry belong to a real
/// storage backend.
pub struct MemoryTracker {
    entries: Mutex<HashMap<(Id160, Id160), Vec<(PeerAddress, Data)>>>,
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl TrackerStorage for MemoryTracker {
    fn put(
        &self,
        location: &Id160,
        domain: &Id160,
        peer: &PeerAddress,
        _public_key: Option<&PublicKey>,
        data: &Data,
    ) -> bool {
        let mut entries = self.entries.lock();
        let list = entries.entry((*location, *domain)).or_default();

        if let Some(existing) = list.iter_mut().find(|(it, _)| it.id == peer.id) {
            *existing = (peer.clone(), data.clone());
            return true;
        }

        if list.len() >= MAX_ENTRIES {
            return false;
        }

        list.push((peer.clone(), data.clone()));
        true
    }

    fn get(&self, location: &Id160, domain: &Id160) -> Option<Vec<(PeerAddress, Data)>> {
        self.entries.lock().get(&(*location, *domain)).cloned()
    }

    fn size(&self, location: &Id160, domain: &Id160) -> usize {
        self.entries
            .lock()
            .get(&(*location, *domain))
            .map(|list| list.len())
            .unwrap_or(0)
    }

    fn max_size(&self) -> usize {
        MAX_ENTRIES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    fn peer(id: u32) -> PeerAddress {
        PeerAddress::new(
            Id160::from_words([0, 0, 0, 0, id]),
            "10.0.0.1".parse().unwrap(),
            1000,
            1001,
        )
    }

    #[test]
    fn newest_entry_per_peer_wins() {
        let tracker = MemoryTracker::default();
        let location = Id160::from_words([1, 0, 0, 0, 0]);
        let domain = Id160::ZERO;

        assert!(tracker.put(
            &location,
            &domain,
            &peer(1),
            None,
            &Data::new(Bytes::from_static(b"old")),
        ));
        assert!(tracker.put(
            &location,
            &domain,
            &peer(1),
            None,
            &Data::new(Bytes::from_static(b"new")),
        ));

        assert_eq!(tracker.size(&location, &domain), 1);

        let entries = tracker.get(&location, &domain).unwrap();
        assert_eq!(entries[0].1.value().as_ref(), b"new");
    }

    #[test]
    fn missing_pairs_read_back_empty() {
        let tracker = MemoryTracker::default();
        assert!(tracker.get(&Id160::ZERO, &Id160::MAX).is_none());
        assert_eq!(tracker.size(&Id160::ZERO, &Id160::MAX), 0);
    }
}
