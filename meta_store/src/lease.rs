//! Leader-local advisory leases.
//!
//! Leases never go through the replicated log: a leader change silently
//! voids them all, which is why holders must only use them to serialize
//! idempotent duties.

use std::collections::HashMap;

use chrono::Utc;
use meta_types::{Lease, DEFAULT_LEASE_DURATION};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("another node has the lease")]
pub struct LeaseContested {
    /// Node currently holding the lease.
    pub owner: u64,
}

#[derive(Debug)]
pub struct Leases {
    leases: Mutex<HashMap<String, Lease>>,
    duration: chrono::Duration,
}

impl Default for Leases {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_DURATION)
    }
}

impl Leases {
    pub fn new(duration: std::time::Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            duration: chrono::Duration::from_std(duration).expect("lease duration in range"),
        }
    }

    /// Grant or renew `name` for `owner`. The current holder renews freely;
    /// anyone else must wait for expiry.
    pub fn acquire(&self, name: &str, owner: u64) -> Result<Lease, LeaseContested> {
        let now = Utc::now();
        let mut leases = self.leases.lock();

        if let Some(lease) = leases.get_mut(name) {
            if lease.owner == owner {
                lease.expiration = now + self.duration;
                return Ok(lease.clone());
            }
            if !lease.expired(now) {
                return Err(LeaseContested { owner: lease.owner });
            }
        }

        let lease = Lease {
            name: name.to_string(),
            expiration: now + self.duration,
            owner,
        };
        leases.insert(name.to_string(), lease.clone());
        Ok(lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn owner_renews_contender_waits() {
        let leases = Leases::default();

        let granted = leases.acquire("continuous-queries", 1).unwrap();
        assert_eq!(granted.owner, 1);

        // renewal extends the expiry
        let renewed = leases.acquire("continuous-queries", 1).unwrap();
        assert!(renewed.expiration >= granted.expiration);

        let err = leases.acquire("continuous-queries", 2).unwrap_err();
        assert_eq!(err.owner, 1);

        // an unrelated name is free
        leases.acquire("backups", 2).unwrap();
    }

    #[test]
    fn expired_leases_can_be_taken_over() {
        let leases = Leases::new(Duration::ZERO);
        leases.acquire("continuous-queries", 1).unwrap();
        let taken = leases.acquire("continuous-queries", 2).unwrap();
        assert_eq!(taken.owner, 2);
    }
}
