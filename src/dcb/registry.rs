use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

use super::Dcb;

/// Key into the global registry. Stands in for the reference
/// implementation's `next` pointer; a DCB may be looked up by id without
/// holding a raw pointer to it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DcbId(pub(crate) usize);

impl From<DcbId> for usize {
    fn from(id: DcbId) -> usize {
        id.0
    }
}

impl From<usize> for DcbId {
    fn from(raw: usize) -> DcbId {
        DcbId(raw)
    }
}

/// Global, unordered list of every live DCB. Insertion order is not
/// observable; the only operations are allocate, unlink, and enumerate.
pub struct Registry {
    slab: Mutex<Slab<Arc<Dcb>>>,
    max: usize,
}

impl Registry {
    /// `max` bounds the number of DCBs this registry will ever hand out
    /// at once; `allocate_with` returns `None` once it is reached,
    /// standing in for the reference taxonomy's allocation failure.
    pub fn new(max: usize) -> Registry {
        Registry {
            slab: Mutex::new(Slab::new()),
            max,
        }
    }

    /// Reserve a slot and construct the DCB that will occupy it in one
    /// critical section, so the id handed to `build` is never raced by a
    /// concurrent allocation. Returns `None`, without constructing the
    /// DCB, if the registry is already at capacity.
    pub(crate) fn allocate_with<F>(&self, build: F) -> Option<Arc<Dcb>>
    where
        F: FnOnce(DcbId) -> Dcb,
    {
        let mut slab = self.slab.lock();
        if slab.len() >= self.max {
            tracing::warn!(max = self.max, "registry at capacity, allocation failed");
            return None;
        }
        let entry = slab.vacant_entry();
        let id = DcbId(entry.key());
        let dcb = Arc::new(build(id));
        entry.insert(dcb.clone());
        Some(dcb)
    }

    pub fn get(&self, id: DcbId) -> Option<Arc<Dcb>> {
        self.slab.lock().get(id.0).cloned()
    }

    pub fn unlink(&self, id: DcbId) {
        let mut slab = self.slab.lock();
        if slab.contains(id.0) {
            slab.remove(id.0);
        }
    }

    pub fn len(&self) -> usize {
        self.slab.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk the registry under the registry lock. The visitor must not
    /// mutate the registry.
    pub fn enumerate<F: FnMut(&Arc<Dcb>)>(&self, mut visitor: F) {
        let slab = self.slab.lock();
        for (_, dcb) in slab.iter() {
            visitor(dcb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcb::Role;

    #[test]
    fn allocate_then_unlink_updates_len() {
        let registry = Registry::new(8);
        let dcb = registry
            .allocate_with(|id| Dcb::new(id, Role::RequestHandler, -1))
            .unwrap();
        assert_eq!(registry.len(), 1);

        registry.unlink(dcb.id);
        assert_eq!(registry.len(), 0);
        assert!(registry.get(dcb.id).is_none());
    }

    #[test]
    fn enumerate_visits_every_live_dcb_once() {
        let registry = Registry::new(8);
        let a = registry
            .allocate_with(|id| Dcb::new(id, Role::RequestHandler, -1))
            .unwrap();
        let b = registry
            .allocate_with(|id| Dcb::new(id, Role::RequestHandler, -1))
            .unwrap();

        let mut seen = Vec::new();
        registry.enumerate(|dcb| seen.push(dcb.id));

        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&a.id));
        assert!(seen.contains(&b.id));
    }

    #[test]
    fn allocate_fails_once_capacity_is_reached() {
        let registry = Registry::new(1);
        let first = registry.allocate_with(|id| Dcb::new(id, Role::RequestHandler, -1));
        assert!(first.is_some());

        let second = registry.allocate_with(|id| Dcb::new(id, Role::RequestHandler, -1));
        assert!(second.is_none());
        assert_eq!(registry.len(), 1);
    }
}
