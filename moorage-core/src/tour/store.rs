use std::collections::HashMap;

use slab::Slab;
use thiserror::Error;
use tracing::trace;

use super::{Tour, TourId, TourKey};
use crate::rudder::RudderId;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("no tour available")]
    NoTourAvailable,
    #[error("tour key {0} is already leased")]
    KeyInUse(TourKey),
}

/// Per-agent pool of tours, leased by `(ship id, request key)`.
///
/// Never leases more than its capacity at once; a rent beyond it fails instead of
/// growing the pool.
pub struct TourStore {
    active: Slab<Tour>,
    index: HashMap<TourKey, usize>,
    pool: Vec<Tour>,
    capacity: usize,
    buffer_size: u64,
}

impl TourStore {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            active: Slab::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            pool: (0..capacity).map(|_| Tour::new()).collect(),
            capacity,
            buffer_size: buffer_size as u64,
        }
    }

    pub fn rent(&mut self, key: TourKey, inbound: RudderId) -> Result<TourId, StoreError> {
        if self.index.contains_key(&key) {
            return Err(StoreError::KeyInUse(key));
        }
        if self.active.len() >= self.capacity {
            return Err(StoreError::NoTourAvailable);
        }
        let mut tour = self.pool.pop().unwrap_or_default();
        let id = tour.init(key, inbound, self.buffer_size);
        let slot = self.active.insert(tour);
        self.index.insert(key, slot);
        trace!(tour = %key, %id, "tour rented");
        Ok(id)
    }

    pub fn get(&self, key: TourKey) -> Option<&Tour> {
        self.index.get(&key).and_then(|slot| self.active.get(*slot))
    }

    pub fn get_mut(&mut self, key: TourKey) -> Option<&mut Tour> {
        self.index.get(&key).and_then(|slot| self.active.get_mut(*slot))
    }

    /// Looks a tour up for a holder of lease `check`. A tour that is gone yields
    /// None; one leased again under the same key is a broken invariant.
    #[track_caller]
    pub fn checked_mut(&mut self, key: TourKey, check: TourId) -> Option<&mut Tour> {
        let tour = self.get_mut(key)?;
        tour.check_tour_id(check);
        Some(tour)
    }

    /// Non-fatal lease test for deferred work that may legitimately outlive a tour.
    pub fn is_live(&self, key: TourKey, check: TourId) -> bool {
        self.get(key).map(|t| t.id() == check).unwrap_or(false)
    }

    pub fn return_tour(&mut self, key: TourKey) -> bool {
        let Some(slot) = self.index.remove(&key) else {
            return false;
        };
        let mut tour = self.active.remove(slot);
        trace!(tour = %key, id = %tour.id(), state = ?tour.state(), "tour returned");
        tour.reset();
        self.pool.push(tour);
        true
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{post::Posts, ship::ShipId};

    fn key(n: u32) -> TourKey {
        TourKey::new(ShipId(7), n)
    }

    #[test]
    fn never_leases_beyond_capacity() {
        let mut store = TourStore::new(2, 1024);
        store.rent(key(1), RudderId(1)).unwrap();
        store.rent(key(2), RudderId(1)).unwrap();
        assert_eq!(
            store.rent(key(3), RudderId(1)),
            Err(StoreError::NoTourAvailable)
        );
        assert_eq!(store.active(), 2);

        assert!(store.return_tour(key(1)));
        assert!(!store.return_tour(key(1)));
        store.rent(key(3), RudderId(1)).unwrap();
        assert_eq!(store.active(), 2);
    }

    #[test]
    fn duplicate_key_is_refused() {
        let mut store = TourStore::new(4, 1024);
        store.rent(key(1), RudderId(1)).unwrap();
        assert_eq!(
            store.rent(key(1), RudderId(1)),
            Err(StoreError::KeyInUse(key(1)))
        );
    }

    #[test]
    fn returned_tour_is_reset_and_reused() {
        let mut store = TourStore::new(1, 1024);
        let first = store.rent(key(1), RudderId(1)).unwrap();
        store.return_tour(key(1));
        let second = store.rent(key(2), RudderId(2)).unwrap();
        assert_ne!(first, second);
        assert!(!store.is_live(key(1), first));
        assert!(store.is_live(key(2), second));
        assert_eq!(store.get(key(2)).unwrap().inbound(), Some(RudderId(2)));
    }

    #[test]
    #[should_panic(expected = "stale tour id")]
    fn stale_lease_after_return_is_fatal() {
        let mut store = TourStore::new(1, 1024);
        let first = store.rent(key(1), RudderId(1)).unwrap();
        store.return_tour(key(1));
        store.rent(key(1), RudderId(1)).unwrap();
        let mut posts = Posts::new();
        store.get_mut(key(1)).unwrap().go(first, &mut posts);
    }
}
