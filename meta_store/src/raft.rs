//! The seam between the store and the consensus transport.
//!
//! The transport itself (leader election, log replication, snapshot
//! shipping) is an external collaborator; this module defines the interface
//! the store drives it through, plus [`LocalRaft`], the deterministic
//! single-voter implementation used for single-node deployments and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use meta_proto::Response;
use parking_lot::Mutex;
use thiserror::Error;

use crate::fsm::{Fsm, LogEntry};

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("node is not the leader")]
    NotLeader { leader_http: Option<String> },

    #[error("no leader available")]
    NoLeader,

    #[error("proposal timed out")]
    Timeout,

    #[error("raft error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("node is not the leader")]
    NotLeader,

    #[error("{0}")]
    Internal(String),
}

/// Consensus-configuration changes. Split from [`RaftNode`] because the
/// state machine needs it as a callback while applying `DeleteMetaNode`.
pub trait Membership: Send + Sync {
    /// Remove a server from the voter set. Idempotent; followers answer
    /// [`MembershipError::NotLeader`].
    fn remove_server(&self, tcp_host: &str) -> Result<(), MembershipError>;
}

/// What the store needs from the consensus layer.
#[async_trait]
pub trait RaftNode: Membership + std::fmt::Debug + Send + Sync {
    /// Submit a command to the replicated log, wait for it to commit and be
    /// applied locally, and return the state machine's response for it.
    /// Leader only.
    async fn propose(&self, data: Bytes, timeout: Duration) -> Result<Response, RaftError>;

    fn is_leader(&self) -> bool;

    /// HTTP base address of the current leader, when one is known.
    fn leader_http(&self) -> Option<String>;

    /// Add a voter to the consensus configuration. Leader only.
    fn add_voter(&self, tcp_host: &str) -> Result<(), RaftError>;
}

/// A single-voter consensus group: this node is always the leader and every
/// proposal commits immediately at the next index.
#[derive(Debug)]
pub struct LocalRaft {
    fsm: Arc<Fsm>,
    http_addr: String,
    // serializes index assignment with application order
    position: Mutex<LogPosition>,
}

#[derive(Debug, Clone, Copy)]
struct LogPosition {
    index: u64,
    term: u64,
}

impl LocalRaft {
    pub fn new(fsm: Arc<Fsm>, http_addr: impl Into<String>) -> Arc<Self> {
        let index = fsm.data().index;
        let term = fsm.data().term.max(1);
        Arc::new(Self {
            fsm,
            http_addr: http_addr.into(),
            position: Mutex::new(LogPosition { index, term }),
        })
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }
}

#[async_trait]
impl RaftNode for LocalRaft {
    async fn propose(&self, data: Bytes, _timeout: Duration) -> Result<Response, RaftError> {
        let mut position = self.position.lock();
        position.index += 1;
        let entry = LogEntry {
            index: position.index,
            term: position.term,
            data,
        };
        Ok(self.fsm.apply(&entry))
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader_http(&self) -> Option<String> {
        Some(self.http_addr.clone())
    }

    fn add_voter(&self, _tcp_host: &str) -> Result<(), RaftError> {
        // a second voter needs a real transport; the join is recorded in the
        // metadata by the caller's CreateMetaNode command
        Ok(())
    }
}

impl Membership for LocalRaft {
    fn remove_server(&self, _tcp_host: &str) -> Result<(), MembershipError> {
        Ok(())
    }
}
