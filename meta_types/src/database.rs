//! Schema-side entities: databases, retention policies, shard groups, shards,
//! continuous queries, subscriptions, and users.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A node participating in the cluster, in either the meta or the data role.
///
/// A host that carries both roles shares a single ID between them (the ID is
/// reused when the TCP address matches an existing meta node).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub id: u64,
    /// HTTP bind address.
    pub host: String,
    /// Raft/TCP bind address.
    pub tcp_host: String,
    /// Shard IDs queued for ownership hand-off to this node, in arrival
    /// order. Only meaningful on meta nodes.
    #[serde(default)]
    pub pending_shard_owners: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatabaseInfo {
    pub name: String,
    pub default_retention_policy: String,
    pub retention_policies: Vec<RetentionPolicyInfo>,
    pub continuous_queries: Vec<ContinuousQueryInfo>,
}

impl DatabaseInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn retention_policy(&self, name: &str) -> Option<&RetentionPolicyInfo> {
        self.retention_policies.iter().find(|rp| rp.name == name)
    }

    pub(crate) fn retention_policy_mut(&mut self, name: &str) -> Option<&mut RetentionPolicyInfo> {
        self.retention_policies
            .iter_mut()
            .find(|rp| rp.name == name)
    }

    pub fn continuous_query(&self, name: &str) -> Option<&ContinuousQueryInfo> {
        self.continuous_queries.iter().find(|cq| cq.name == name)
    }
}

/// A named durability/replication/window triple attached to a database.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicyInfo {
    pub name: String,
    pub replica_n: usize,
    /// How long data is kept; zero means forever.
    pub duration: Duration,
    /// Width of the time window covered by each shard group.
    pub shard_group_duration: Duration,
    pub shard_groups: Vec<ShardGroupInfo>,
    pub subscriptions: Vec<SubscriptionInfo>,
}

impl RetentionPolicyInfo {
    /// A policy with default replication (1) and an infinite duration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replica_n: 1,
            duration: Duration::ZERO,
            shard_group_duration: Duration::ZERO,
            shard_groups: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// The non-deleted shard group whose time window covers `timestamp`.
    pub fn shard_group_by_timestamp(&self, timestamp: DateTime<Utc>) -> Option<&ShardGroupInfo> {
        self.shard_groups
            .iter()
            .find(|sg| !sg.deleted() && sg.contains(timestamp))
    }

    pub fn subscription(&self, name: &str) -> Option<&SubscriptionInfo> {
        self.subscriptions.iter().find(|s| s.name == name)
    }
}

/// An update to an existing retention policy. `None` fields are left
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicyUpdate {
    pub name: Option<String>,
    pub duration: Option<Duration>,
    pub replica_n: Option<usize>,
}

/// Derive a shard group window width from a retention duration: long-lived
/// (or infinite) policies get weekly groups, short-lived ones get daily or
/// hourly groups.
pub fn normalised_shard_group_duration(duration: Duration) -> Duration {
    const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);
    const DAY: Duration = Duration::from_secs(24 * 3600);

    if duration == Duration::ZERO || duration >= Duration::from_secs(180 * 24 * 3600) {
        WEEK
    } else if duration >= Duration::from_secs(2 * 24 * 3600) {
        DAY
    } else {
        Duration::from_secs(3600)
    }
}

/// A time-windowed set of shards. Writes with timestamps in
/// `[start_time, end_time)` land in this group.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardGroupInfo {
    pub id: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Deleted groups are filtered from reads but kept in the model so that
    /// their shard IDs stay reserved.
    pub deleted_at: Option<DateTime<Utc>>,
    pub shards: Vec<ShardInfo>,
}

impl ShardGroupInfo {
    pub fn deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start_time <= timestamp && timestamp < self.end_time
    }

    /// Whether the group's window intersects `[min, max]`.
    pub fn overlaps(&self, min: DateTime<Utc>, max: DateTime<Utc>) -> bool {
        self.start_time <= max && self.end_time > min
    }

    pub fn shard(&self, id: u64) -> Option<&ShardInfo> {
        self.shards.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShardInfo {
    pub id: u64,
    pub owners: Vec<ShardOwner>,
}

impl ShardInfo {
    pub fn owned_by(&self, node_id: u64) -> bool {
        self.owners.iter().any(|o| o.node_id == node_id)
    }

    /// Drop a node from the owner list, returning whether it was an owner.
    /// Invariant checks (never orphan a live shard) are the caller's job.
    pub fn prune_owner(&mut self, node_id: u64) -> bool {
        let before = self.owners.len();
        self.owners.retain(|o| o.node_id != node_id);
        self.owners.len() != before
    }
}

/// A data node holding one replica of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ShardOwner {
    pub node_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuousQueryInfo {
    pub name: String,
    pub query: String,
}

/// Subscription write-mirroring mode.
pub const SUBSCRIPTION_MODE_ANY: &str = "ANY";
pub const SUBSCRIPTION_MODE_ALL: &str = "ALL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub name: String,
    pub mode: String,
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    /// bcrypt hash of the password.
    pub hash: String,
    pub admin: bool,
    pub privileges: BTreeMap<String, Privilege>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum Privilege {
    NoPrivileges = 0,
    Read = 1,
    Write = 2,
    All = 3,
}

impl Privilege {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Read,
            2 => Self::Write,
            3 => Self::All,
            _ => Self::NoPrivileges,
        }
    }
}

/// Convert a wall-clock instant to the nanosecond representation used on the
/// wire and in shard-group window arithmetic.
pub(crate) fn to_nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt()
        .expect("timestamp representable as nanoseconds")
}

pub(crate) fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

pub(crate) fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).expect("duration representable as nanoseconds")
}

pub(crate) fn duration_from_nanos(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}
