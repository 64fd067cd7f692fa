//! Lifecycle buckets.
//!
//! An [`InstanceList`] holds the instances in one lifecycle state
//! (starting, available, or stopping) as a circular doubly linked ring
//! stored in an arena. Slot 0 is the sentinel root, so the ring is empty
//! exactly when `root.next == root`. Freed slots are recycled.
//!
//! Each instance records which bucket holds it and its slot, which makes
//! removal O(1); duplicate checks and image lookups are linear scans.
//! All operations take the bucket's single lock.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use spore_core::InstanceId;

use crate::error::{PoolError, PoolResult};
use crate::instance::{Instance, Location};

const ROOT: usize = 0;

#[derive(Debug)]
struct Node {
    instance: Option<Arc<Instance>>,
    prev: usize,
    next: usize,
}

#[derive(Debug, Default)]
struct Ring {
    nodes: Vec<Node>,
    free: Vec<usize>,
    len: usize,
}

impl Ring {
    fn lazy_init(&mut self) {
        if self.nodes.is_empty() {
            self.nodes.push(Node {
                instance: None,
                prev: ROOT,
                next: ROOT,
            });
        }
    }

    /// Occupied slots in ring order.
    fn slots(&self) -> Slots<'_> {
        Slots { ring: self, at: ROOT }
    }

    fn instance_at(&self, slot: usize) -> Option<&Arc<Instance>> {
        self.nodes.get(slot).and_then(|n| n.instance.as_ref())
    }

    /// Link `instance` in just before the root, i.e. at the tail.
    fn insert_tail(&mut self, instance: Arc<Instance>) -> usize {
        self.lazy_init();
        let tail = self.nodes[ROOT].prev;
        let node = Node {
            instance: Some(instance),
            prev: tail,
            next: ROOT,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.nodes[tail].next = slot;
        self.nodes[ROOT].prev = slot;
        self.len += 1;
        slot
    }

    fn unlink(&mut self, slot: usize) -> Option<Arc<Instance>> {
        let node = &mut self.nodes[slot];
        let instance = node.instance.take()?;
        let (prev, next) = (node.prev, node.next);
        node.prev = slot;
        node.next = slot;
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.free.push(slot);
        self.len -= 1;
        Some(instance)
    }
}

struct Slots<'a> {
    ring: &'a Ring,
    at: usize,
}

impl Iterator for Slots<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let next = self.ring.nodes.get(self.at)?.next;
        if next == ROOT {
            return None;
        }
        self.at = next;
        Some(next)
    }
}

/// A lock-protected collection of instances sharing one lifecycle state.
#[derive(Debug)]
pub struct InstanceList {
    location: Location,
    ring: Mutex<Ring>,
}

impl InstanceList {
    /// An empty bucket. The ring is initialized on first insert.
    pub fn new(location: Location) -> Self {
        Self {
            location,
            ring: Mutex::new(Ring::default()),
        }
    }

    /// The location this bucket stands for.
    pub fn location(&self) -> Location {
        self.location
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert at the tail.
    ///
    /// Returns `Ok(false)` without changes if an instance with the same
    /// id is already in this bucket. Fails if the instance is still a
    /// member of another collection.
    pub fn push(&self, instance: Arc<Instance>) -> PoolResult<bool> {
        let mut ring = self.lock();
        if ring
            .slots()
            .filter_map(|slot| ring.instance_at(slot))
            .any(|held| held.id() == instance.id())
        {
            return Ok(false);
        }

        let (current, _) = instance.membership();
        if current != Location::None {
            return Err(PoolError::Membership {
                instance_id: instance.id().to_string(),
                expected: Location::None,
                actual: current,
            });
        }

        let slot = ring.insert_tail(instance.clone());
        instance.set_membership(self.location, Some(slot));
        trace!(instance_id = %instance.id(), bucket = ?self.location, slot, "pushed");
        Ok(true)
    }

    /// Unlink `instance`, which must be a member of this bucket.
    pub fn remove(&self, instance: &Arc<Instance>) -> PoolResult<Arc<Instance>> {
        let mut ring = self.lock();
        let (current, slot) = instance.membership();
        let held = slot.filter(|&slot| {
            current == self.location
                && ring
                    .instance_at(slot)
                    .is_some_and(|held| Arc::ptr_eq(held, instance))
        });
        let Some(slot) = held else {
            return Err(PoolError::Membership {
                instance_id: instance.id().to_string(),
                expected: self.location,
                actual: current,
            });
        };

        let removed = ring.unlink(slot).unwrap_or_else(|| instance.clone());
        removed.set_membership(Location::None, None);
        trace!(instance_id = %removed.id(), bucket = ?self.location, "removed");
        Ok(removed)
    }

    /// Remove and return the first instance built from `image_id`.
    ///
    /// Lookup and removal happen under one lock acquisition, so a match is
    /// handed to exactly one caller.
    pub fn find(&self, image_id: &str) -> Option<Arc<Instance>> {
        let mut ring = self.lock();
        let slot = ring.slots().find(|&slot| {
            ring.instance_at(slot)
                .is_some_and(|held| held.matches_image(image_id))
        })?;
        let found = ring.unlink(slot)?;
        found.set_membership(Location::None, None);
        trace!(instance_id = %found.id(), %image_id, bucket = ?self.location, "found");
        Some(found)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        let ring = self.lock();
        ring.slots()
            .filter_map(|slot| ring.instance_at(slot))
            .any(|held| held.id() == instance_id)
    }

    /// Ids in ring order, head first.
    pub fn ids(&self) -> Vec<InstanceId> {
        let ring = self.lock();
        ring.slots()
            .filter_map(|slot| ring.instance_at(slot))
            .map(|held| held.id().to_string())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check `next.prev == node` and `prev.next == node` around the ring,
    /// back-references, and the population count.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let ring = self.lock();
        if ring.nodes.is_empty() {
            assert_eq!(ring.len, 0);
            return;
        }
        let mut count = 0;
        for slot in ring.slots() {
            let node = &ring.nodes[slot];
            assert_eq!(ring.nodes[node.next].prev, slot, "next.prev broken at {slot}");
            assert_eq!(ring.nodes[node.prev].next, slot, "prev.next broken at {slot}");
            let held = node.instance.as_ref().expect("linked slot without instance");
            assert_eq!(held.membership(), (self.location, Some(slot)));
            count += 1;
        }
        assert_eq!(count, ring.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spore_core::{InstanceAttributes, InstanceStatus};

    fn instance(id: &str, image: &str) -> Arc<Instance> {
        Arc::new(Instance::new(InstanceAttributes::new(
            id,
            InstanceStatus::Running,
            image,
        )))
    }

    #[test]
    fn fresh_bucket_is_empty() {
        let bucket = InstanceList::new(Location::Available);
        assert_eq!(bucket.len(), 0);
        assert!(bucket.is_empty());
        assert!(bucket.ids().is_empty());
        assert!(bucket.find("img-1").is_none());
        bucket.assert_consistent();
    }

    #[test]
    fn push_appends_in_order() {
        let bucket = InstanceList::new(Location::Available);
        for (id, image) in [("a", "img-1"), ("b", "img-2"), ("c", "img-3")] {
            assert!(bucket.push(instance(id, image)).unwrap());
        }
        assert_eq!(bucket.ids(), ["a", "b", "c"]);
        assert_eq!(bucket.len(), 3);
        bucket.assert_consistent();
    }

    #[test]
    fn push_rejects_duplicate_id() {
        let bucket = InstanceList::new(Location::Starting);
        let a = instance("a", "img-1");
        assert!(bucket.push(a.clone()).unwrap());

        // Same record again, and a distinct record carrying the same id.
        assert!(!bucket.push(a.clone()).unwrap());
        assert!(!bucket.push(instance("a", "img-9")).unwrap());

        assert_eq!(bucket.len(), 1);
        assert_eq!(a.location(), Location::Starting);
        bucket.assert_consistent();
    }

    #[test]
    fn push_rejects_member_of_other_bucket() {
        let starting = InstanceList::new(Location::Starting);
        let available = InstanceList::new(Location::Available);
        let a = instance("a", "img-1");
        starting.push(a.clone()).unwrap();

        let err = available.push(a.clone()).unwrap_err();
        assert!(matches!(err, PoolError::Membership { actual: Location::Starting, .. }));
        assert_eq!(available.len(), 0);
        assert_eq!(a.location(), Location::Starting);
    }

    #[test]
    fn find_pops_first_match() {
        let bucket = InstanceList::new(Location::Available);
        let a = instance("a", "img-1");
        let b = instance("b", "img-2");
        let c = instance("c", "img-3");
        for i in [&a, &b, &c] {
            bucket.push(i.clone()).unwrap();
        }

        let found = bucket.find("img-2").unwrap();
        assert!(Arc::ptr_eq(&found, &b));
        assert_eq!(found.location(), Location::None);
        assert_eq!(bucket.ids(), ["a", "c"]);
        assert_eq!(bucket.len(), 2);
        bucket.assert_consistent();

        assert!(bucket.find("img-2").is_none());
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn find_prefers_head() {
        let bucket = InstanceList::new(Location::Available);
        bucket.push(instance("a", "img-1")).unwrap();
        bucket.push(instance("b", "img-1")).unwrap();

        assert_eq!(bucket.find("img-1").unwrap().id(), "a");
        assert_eq!(bucket.find("img-1").unwrap().id(), "b");
        assert!(bucket.is_empty());
        bucket.assert_consistent();
    }

    #[test]
    fn remove_unlinks_and_clears_membership() {
        let bucket = InstanceList::new(Location::Stopping);
        let a = instance("a", "img-1");
        let b = instance("b", "img-1");
        let c = instance("c", "img-1");
        for i in [&a, &b, &c] {
            bucket.push(i.clone()).unwrap();
        }

        let removed = bucket.remove(&b).unwrap();
        assert!(Arc::ptr_eq(&removed, &b));
        assert_eq!(b.membership(), (Location::None, None));
        assert_eq!(bucket.ids(), ["a", "c"]);

        bucket.remove(&a).unwrap();
        bucket.remove(&c).unwrap();
        assert!(bucket.is_empty());
        bucket.assert_consistent();
    }

    #[test]
    fn remove_rejects_non_member() {
        let bucket = InstanceList::new(Location::Available);
        let other = InstanceList::new(Location::Starting);
        let a = instance("a", "img-1");
        let b = instance("b", "img-1");
        bucket.push(a.clone()).unwrap();
        other.push(b.clone()).unwrap();

        assert!(matches!(
            bucket.remove(&b),
            Err(PoolError::Membership { expected: Location::Available, actual: Location::Starting, .. })
        ));
        assert!(bucket.remove(&instance("x", "img-1")).is_err());
        assert_eq!(bucket.len(), 1);
        assert_eq!(other.len(), 1);
        bucket.assert_consistent();
        other.assert_consistent();
    }

    #[test]
    fn remove_rejects_same_id_different_record() {
        let bucket = InstanceList::new(Location::Available);
        bucket.push(instance("a", "img-1")).unwrap();

        // A look-alike that claims the slot must not unlink the real member.
        let impostor = instance("a", "img-1");
        impostor.set_membership(Location::Available, Some(1));
        assert!(bucket.remove(&impostor).is_err());
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn slots_are_recycled() {
        let bucket = InstanceList::new(Location::Available);
        for round in 0..10 {
            let a = instance(&format!("a{round}"), "img-1");
            let b = instance(&format!("b{round}"), "img-2");
            bucket.push(a.clone()).unwrap();
            bucket.push(b.clone()).unwrap();
            bucket.remove(&a).unwrap();
            assert!(bucket.find("img-2").is_some());
        }
        assert!(bucket.is_empty());
        assert!(bucket.lock().nodes.len() <= 3);
        bucket.assert_consistent();
    }

    #[test]
    fn concurrent_push_and_find() {
        let bucket = Arc::new(InstanceList::new(Location::Available));
        let pushers: Vec<_> = (0..4)
            .map(|t| {
                let bucket = bucket.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        bucket.push(instance(&format!("t{t}-{i}"), "img-1")).unwrap();
                    }
                })
            })
            .collect();
        for handle in pushers {
            handle.join().unwrap();
        }
        assert_eq!(bucket.len(), 200);

        let finders: Vec<_> = (0..4)
            .map(|_| {
                let bucket = bucket.clone();
                std::thread::spawn(move || {
                    let mut found = Vec::new();
                    while let Some(i) = bucket.find("img-1") {
                        found.push(i.id().to_string());
                    }
                    found
                })
            })
            .collect();
        let mut all: Vec<String> = finders
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert!(bucket.is_empty());
        bucket.assert_consistent();
    }
}
