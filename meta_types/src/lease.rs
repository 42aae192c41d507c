use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named advisory token issued by the leader to at most one node at a time.
///
/// Leases are not replicated through the log: they reset on leader change,
/// so holders must re-acquire and treat expiry as loss of exclusivity. Only
/// idempotent duties should be serialized with one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub expiration: DateTime<Utc>,
    pub owner: u64,
}

impl Lease {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_json_round_trip() {
        let lease = Lease {
            name: "continuous-queries".to_string(),
            expiration: "2024-01-01T00:01:00Z".parse().unwrap(),
            owner: 4,
        };
        let json = serde_json::to_string(&lease).unwrap();
        let decoded: Lease = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, lease);
        assert!(lease.expired("2024-01-01T00:01:00Z".parse().unwrap()));
        assert!(!lease.expired("2024-01-01T00:00:59Z".parse().unwrap()));
    }
}
