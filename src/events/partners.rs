//! Registry of paired descriptors.
//!
//! Some wakeup primitives are a pair of fds on some OSes. Whoever removes
//! one fd from the event base must also remove its partner; this table is
//! the lookup that makes that possible. Pure bookkeeping, no I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::net::socket::Fd;

#[derive(Default)]
pub struct Partners {
    base: Mutex<HashMap<Fd, Fd>>,
}

impl Partners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs both directions of the association.
    pub fn merge(&self, first: Fd, second: Fd) -> bool {
        if first == second {
            return false;
        }
        let mut base = self.lock();
        base.insert(first, second);
        base.insert(second, first);
        true
    }

    pub fn has(&self, fd: Fd) -> bool {
        self.lock().contains_key(&fd)
    }

    /// The partner of `fd`, if any.
    pub fn partner(&self, fd: Fd) -> Option<Fd> {
        self.lock().get(&fd).copied()
    }

    /// Removes `fd` and the reverse mapping held by its partner.
    pub fn del(&self, fd: Fd) {
        let mut base = self.lock();
        if let Some(partner) = base.remove(&fd) {
            base.remove(&partner);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fd, Fd>> {
        self.base.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_symmetric() {
        let partners = Partners::new();
        assert!(partners.merge(3, 4));
        assert!(partners.has(3));
        assert!(partners.has(4));
        assert_eq!(partners.partner(3), Some(4));
        assert_eq!(partners.partner(4), Some(3));
    }

    #[test]
    fn deleting_one_side_removes_both() {
        let partners = Partners::new();
        partners.merge(10, 11);
        partners.del(11);
        assert!(!partners.has(10));
        assert!(!partners.has(11));
    }

    #[test]
    fn self_pairs_are_rejected() {
        let partners = Partners::new();
        assert!(!partners.merge(5, 5));
        assert!(!partners.has(5));
    }
}
