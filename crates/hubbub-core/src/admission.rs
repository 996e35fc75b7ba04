//! Per-address connection admission.
//!
//! Bounds how many streaming connections a single originating address may
//! hold open at once. Many upgrade attempts race on the table before any task
//! owns a connection, so the check and the increment are performed under the
//! same map-entry lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Default ceiling on concurrent connections per address.
pub const DEFAULT_MAX_CONNECTIONS_PER_ADDRESS: usize = 6;

/// Admission errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The address already holds the maximum number of connections.
    #[error("Too many connections from {address} (limit {limit})")]
    TooManyConnections {
        /// Rejected address.
        address: String,
        /// Configured ceiling.
        limit: usize,
    },
}

/// Tracks active connections per originating address.
#[derive(Debug)]
pub struct IpAdmission {
    counts: DashMap<String, usize>,
    limit: usize,
}

impl IpAdmission {
    /// Create a tracker with the default ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_CONNECTIONS_PER_ADDRESS)
    }

    /// Create a tracker with a custom ceiling.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            counts: DashMap::new(),
            limit,
        }
    }

    /// The configured ceiling.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Admit one more connection from `address`.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::TooManyConnections`] when the address is at
    /// the ceiling; the table is left untouched in that case.
    pub fn admit(&self, address: &str) -> Result<(), AdmissionError> {
        let rejected = || AdmissionError::TooManyConnections {
            address: address.to_string(),
            limit: self.limit,
        };

        match self.counts.entry(address.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() >= self.limit {
                    warn!(address = %address, limit = self.limit, "Admission rejected");
                    return Err(rejected());
                }
                *entry.get_mut() += 1;
                debug!(address = %address, active = *entry.get(), "Connection admitted");
            }
            Entry::Vacant(entry) => {
                if self.limit == 0 {
                    return Err(rejected());
                }
                entry.insert(1);
                debug!(address = %address, active = 1, "Connection admitted");
            }
        }

        Ok(())
    }

    /// Give back one connection slot for `address`.
    ///
    /// The entry is removed once its count reaches zero. Releasing an address
    /// with no entry is a no-op.
    pub fn release(&self, address: &str) {
        if let Entry::Occupied(mut entry) = self.counts.entry(address.to_string()) {
            if *entry.get() <= 1 {
                entry.remove();
                debug!(address = %address, active = 0, "Connection released");
            } else {
                *entry.get_mut() -= 1;
                debug!(address = %address, active = *entry.get(), "Connection released");
            }
        }
    }

    /// Admit a connection and tie its release to the returned permit.
    ///
    /// # Errors
    ///
    /// Same as [`IpAdmission::admit`].
    pub fn permit(self: &Arc<Self>, address: impl Into<String>) -> Result<AdmissionPermit, AdmissionError> {
        let address = address.into();
        self.admit(&address)?;
        Ok(AdmissionPermit {
            tracker: Arc::clone(self),
            address,
        })
    }

    /// Active connections for `address`.
    #[must_use]
    pub fn active(&self, address: &str) -> usize {
        self.counts.get(address).map(|c| *c).unwrap_or(0)
    }

    /// Number of addresses with at least one active connection.
    #[must_use]
    pub fn tracked_addresses(&self) -> usize {
        self.counts.len()
    }
}

impl Default for IpAdmission {
    fn default() -> Self {
        Self::new()
    }
}

/// An admitted connection slot, released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    tracker: Arc<IpAdmission>,
    address: String,
}

impl AdmissionPermit {
    /// The address this permit was granted to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.tracker.release(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn test_admit_up_to_limit() {
        let tracker = IpAdmission::new();
        for _ in 0..DEFAULT_MAX_CONNECTIONS_PER_ADDRESS {
            tracker.admit("10.0.0.1").unwrap();
        }
        assert_eq!(tracker.active("10.0.0.1"), 6);

        assert!(matches!(
            tracker.admit("10.0.0.1"),
            Err(AdmissionError::TooManyConnections { limit: 6, .. })
        ));
        // Rejection leaves the count alone
        assert_eq!(tracker.active("10.0.0.1"), 6);

        // Other addresses are unaffected
        assert!(tracker.admit("10.0.0.2").is_ok());
    }

    #[test]
    fn test_release_removes_empty_entries() {
        let tracker = IpAdmission::new();
        tracker.admit("10.0.0.1").unwrap();
        tracker.admit("10.0.0.1").unwrap();
        assert_eq!(tracker.tracked_addresses(), 1);

        tracker.release("10.0.0.1");
        assert_eq!(tracker.active("10.0.0.1"), 1);
        tracker.release("10.0.0.1");
        assert_eq!(tracker.tracked_addresses(), 0);

        // Releasing an unknown address
        tracker.release("10.0.0.1");
        assert_eq!(tracker.tracked_addresses(), 0);
    }

    #[test]
    fn test_release_frees_a_slot() {
        let tracker = IpAdmission::with_limit(1);
        tracker.admit("a").unwrap();
        assert!(tracker.admit("a").is_err());
        tracker.release("a");
        assert!(tracker.admit("a").is_ok());
    }

    #[test]
    fn test_zero_limit_rejects_without_entry() {
        let tracker = IpAdmission::with_limit(0);
        assert!(tracker.admit("a").is_err());
        assert_eq!(tracker.tracked_addresses(), 0);
    }

    #[test]
    fn test_permit_releases_on_drop() {
        let tracker = Arc::new(IpAdmission::with_limit(2));
        let p1 = tracker.permit("a").unwrap();
        let _p2 = tracker.permit("a").unwrap();
        assert!(tracker.permit("a").is_err());
        assert_eq!(p1.address(), "a");

        drop(p1);
        assert_eq!(tracker.active("a"), 1);
        assert!(tracker.permit("a").is_ok());
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        const THREADS: usize = 32;

        for _ in 0..20 {
            let tracker = IpAdmission::new();
            let admitted = AtomicUsize::new(0);
            let barrier = Barrier::new(THREADS);

            std::thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|| {
                        barrier.wait();
                        if tracker.admit("203.0.113.7").is_ok() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            });

            assert_eq!(admitted.load(Ordering::SeqCst), DEFAULT_MAX_CONNECTIONS_PER_ADDRESS);
            assert_eq!(tracker.active("203.0.113.7"), DEFAULT_MAX_CONNECTIONS_PER_ADDRESS);
        }
    }

    #[test]
    fn test_concurrent_admit_release_balances() {
        let tracker = IpAdmission::with_limit(4);

        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    for _ in 0..200 {
                        if tracker.admit("198.51.100.1").is_ok() {
                            assert!(tracker.active("198.51.100.1") <= 4);
                            tracker.release("198.51.100.1");
                        }
                    }
                });
            }
        });

        assert_eq!(tracker.tracked_addresses(), 0);
    }
}
