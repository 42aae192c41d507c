//! In-memory data model for the cluster metadata service.
//!
//! Everything lives under a single [`ClusterData`] root that is wholly
//! copy-on-write: the state machine clones the root, edits the clone, and
//! atomically installs it, so readers always observe a consistent value.
//! This crate is pure data; it knows nothing about Raft or HTTP.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::time::Duration;

mod data;
mod database;
mod error;
mod lease;
mod serialize;

pub use data::ClusterData;
pub use database::{
    normalised_shard_group_duration, ContinuousQueryInfo, DatabaseInfo, NodeInfo, Privilege,
    RetentionPolicyInfo, RetentionPolicyUpdate, ShardGroupInfo, ShardInfo, ShardOwner,
    SubscriptionInfo, UserInfo, SUBSCRIPTION_MODE_ALL, SUBSCRIPTION_MODE_ANY,
};
pub use error::{MetaError, Result};
pub use lease::Lease;

/// Name given to retention policies synthesized on database creation.
pub const DEFAULT_RETENTION_POLICY_NAME: &str = "autogen";

/// Shortest duration a retention policy may keep data for, other than the
/// "keep forever" zero.
pub const MIN_RETENTION_POLICY_DURATION: Duration = Duration::from_secs(3600);

/// Replication cap for auto-created retention policies; clusters larger than
/// this do not get every write fanned out to every node.
pub const MAX_AUTO_CREATED_RETENTION_POLICY_REPLICA_N: usize = 3;

/// How long a lease is valid for once granted or renewed.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
