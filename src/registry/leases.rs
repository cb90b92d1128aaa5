// src/registry/leases.rs

//! Open-reference tracking for package bytes
//!
//! Readers (download streams, transfers, rollback) hold a [`LeaseGuard`]
//! while they touch a package's bytes. Cleanup claims a package with
//! [`PackageLeases::try_claim`] before deleting it; the claim fails while any
//! lease is held, and new leases are refused while a claim is held.

use dashmap::DashMap;
use std::sync::Arc;

/// Sentinel count marking a package claimed for deletion
const CLAIMED: i64 = -1;

#[derive(Debug, Clone, Default)]
pub struct PackageLeases {
    counts: Arc<DashMap<i64, i64>>,
}

impl PackageLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a read lease; `None` if the package is being deleted
    pub fn acquire(&self, package_id: i64) -> Option<LeaseGuard> {
        let mut entry = self.counts.entry(package_id).or_insert(0);
        if *entry == CLAIMED {
            return None;
        }
        *entry += 1;
        drop(entry);

        Some(LeaseGuard {
            counts: Arc::clone(&self.counts),
            package_id,
            claim: false,
        })
    }

    /// Claim a package for deletion; `None` if it has open readers
    pub fn try_claim(&self, package_id: i64) -> Option<LeaseGuard> {
        let mut entry = self.counts.entry(package_id).or_insert(0);
        if *entry != 0 {
            return None;
        }
        *entry = CLAIMED;
        drop(entry);

        Some(LeaseGuard {
            counts: Arc::clone(&self.counts),
            package_id,
            claim: true,
        })
    }

    /// Whether any reader currently holds the package
    pub fn is_leased(&self, package_id: i64) -> bool {
        self.counts
            .get(&package_id)
            .map(|count| *count > 0)
            .unwrap_or(false)
    }

    /// Number of packages with open readers
    pub fn active(&self) -> usize {
        self.counts.iter().filter(|entry| *entry.value() > 0).count()
    }
}

/// RAII handle released on drop
#[derive(Debug)]
pub struct LeaseGuard {
    counts: Arc<DashMap<i64, i64>>,
    package_id: i64,
    claim: bool,
}

impl LeaseGuard {
    pub fn package_id(&self) -> i64 {
        self.package_id
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let package_id = self.package_id;
        let claim = self.claim;
        self.counts.remove_if_mut(&package_id, |_, count| {
            if claim {
                *count = 0;
            } else if *count > 0 {
                *count -= 1;
            }
            *count == 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_counts() {
        let leases = PackageLeases::new();
        let a = leases.acquire(7).unwrap();
        let b = leases.acquire(7).unwrap();
        assert!(leases.is_leased(7));
        assert_eq!(leases.active(), 1);

        drop(a);
        assert!(leases.is_leased(7));
        drop(b);
        assert!(!leases.is_leased(7));
    }

    #[test]
    fn test_claim_blocked_by_reader() {
        let leases = PackageLeases::new();
        let reader = leases.acquire(1).unwrap();
        assert!(leases.try_claim(1).is_none());
        drop(reader);
        assert!(leases.try_claim(1).is_some());
    }

    #[test]
    fn test_reader_blocked_by_claim() {
        let leases = PackageLeases::new();
        let claim = leases.try_claim(3).unwrap();
        assert!(leases.acquire(3).is_none());
        drop(claim);
        assert!(leases.acquire(3).is_some());
    }
}
