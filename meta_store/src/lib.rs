//! Raft-backed store for the cluster metadata service.
//!
//! The [`Fsm`] applies committed commands to a copy-on-write
//! [`meta_types::ClusterData`] root; the [`Store`] wraps it together with a
//! consensus node behind the [`RaftNode`] seam and exposes the leader-aware
//! `propose` entry point plus the wait-for-index snapshot read that the HTTP
//! layer long-polls on.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod fsm;
mod lease;
mod raft;
mod store;
pub mod test_utils;

pub use fsm::{Fsm, FsmConfig, FsmSnapshot, LogEntry, SnapshotSink};
pub use lease::{LeaseContested, Leases};
pub use raft::{LocalRaft, Membership, MembershipError, RaftError, RaftNode};
pub use store::{Store, StoreConfig, StoreError};
