//! The store: hosts the state machine, embeds the consensus node, and is
//! the leader-aware entry point for proposing commands and reading data.

use std::sync::Arc;
use std::time::Duration;

use meta_proto::{Command, Response};
use meta_types::{ClusterData, NodeInfo};
use observability_deps::tracing::{debug, info};
use thiserror::Error;

use crate::fsm::{Fsm, FsmConfig};
use crate::raft::{LocalRaft, Membership, MembershipError, RaftError, RaftNode};

#[derive(Debug, Error)]
pub enum StoreError {
    /// No leader is known; the caller should retry elsewhere or later.
    #[error("meta service unavailable")]
    Unavailable,

    /// This node is a follower; the leader is at `location`. Consumed by the
    /// HTTP layer (307) and the client's retry loop, never surfaced to
    /// callers.
    #[error("redirect to leader at {location}")]
    Redirect { location: String },

    /// A leadership-requiring call hit a follower that knows no better
    /// address.
    #[error("node is not the leader")]
    NotLeader,

    #[error("raft: {0}")]
    Raft(String),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Synthesize a default retention policy on database creation.
    pub retention_auto_create: bool,
    /// How long a proposal may wait for commit before failing.
    pub propose_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_auto_create: true,
            propose_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub struct Store {
    fsm: Arc<Fsm>,
    raft: Arc<dyn RaftNode>,
    config: StoreConfig,
    http_addr: String,
}

impl Store {
    /// Wire a store over an existing state machine and consensus node.
    pub fn new<R: RaftNode + 'static>(
        fsm: Arc<Fsm>,
        raft: Arc<R>,
        config: StoreConfig,
        http_addr: impl Into<String>,
    ) -> Self {
        let membership: Arc<dyn Membership> = Arc::clone(&raft) as _;
        fsm.set_membership(Arc::downgrade(&membership));

        Self {
            fsm,
            raft,
            config,
            http_addr: http_addr.into(),
        }
    }

    /// A store backed by a single-voter consensus group, for single-node
    /// deployments and tests.
    pub fn single_node(config: StoreConfig, http_addr: impl Into<String>) -> Self {
        let http_addr = http_addr.into();
        let fsm = Arc::new(Fsm::new(FsmConfig {
            retention_auto_create: config.retention_auto_create,
        }));
        let raft = LocalRaft::new(Arc::clone(&fsm), http_addr.clone());
        Self::new(fsm, raft, config, http_addr)
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn leader_http(&self) -> Option<String> {
        self.raft.leader_http()
    }

    pub fn http_addr(&self) -> &str {
        &self.http_addr
    }

    /// Current data root; never blocks.
    pub fn data(&self) -> Arc<ClusterData> {
        self.fsm.data()
    }

    /// Propose a command. On the leader this blocks until the command
    /// commits and applies locally; on a follower it fails with a redirect
    /// to the leader when one is known.
    pub async fn propose(&self, cmd: &Command) -> Result<Response, StoreError> {
        if !self.raft.is_leader() {
            return Err(match self.raft.leader_http() {
                Some(location) => StoreError::Redirect { location },
                None => StoreError::Unavailable,
            });
        }

        let bytes = meta_proto::encode(cmd);
        match self.raft.propose(bytes, self.config.propose_timeout).await {
            Ok(response) => {
                debug!(index = response.index, "proposal applied");
                Ok(response)
            }
            Err(RaftError::NotLeader {
                leader_http: Some(location),
            }) => Err(StoreError::Redirect { location }),
            Err(RaftError::NotLeader { leader_http: None }) | Err(RaftError::NoLeader) => {
                Err(StoreError::Unavailable)
            }
            Err(e) => Err(StoreError::Raft(e.to_string())),
        }
    }

    /// Return the data once its index exceeds `after_index`, or the current
    /// data when `max_wait` elapses first.
    pub async fn snapshot_after(&self, after_index: u64, max_wait: Duration) -> Arc<ClusterData> {
        let mut changed = self.fsm.subscribe();
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let data = self.fsm.data();
            if data.index > after_index {
                return data;
            }
            match tokio::time::timeout_at(deadline, changed.changed()).await {
                Ok(Ok(())) => continue,
                // wait cap elapsed (or the store is shutting down): serve
                // what we have
                _ => return self.fsm.data(),
            }
        }
    }

    /// Add a voter to the consensus configuration. Leader only; the metadata
    /// entry for the node is created separately by its own command.
    pub fn join(&self, host: &str, tcp_host: &str) -> Result<NodeInfo, StoreError> {
        if !self.raft.is_leader() {
            return Err(match self.raft.leader_http() {
                Some(location) => StoreError::Redirect { location },
                None => StoreError::Unavailable,
            });
        }

        self.raft.add_voter(tcp_host).map_err(|e| match e {
            RaftError::NotLeader {
                leader_http: Some(location),
            } => StoreError::Redirect { location },
            RaftError::NotLeader { leader_http: None } => StoreError::NotLeader,
            e => StoreError::Raft(e.to_string()),
        })?;
        info!(%host, %tcp_host, "added voter");

        let data = self.fsm.data();
        Ok(data
            .meta_nodes
            .iter()
            .find(|n| n.tcp_host == tcp_host)
            .cloned()
            .unwrap_or_else(|| NodeInfo {
                id: 0,
                host: host.to_string(),
                tcp_host: tcp_host.to_string(),
                pending_shard_owners: Vec::new(),
            }))
    }

    /// Remove a server from the consensus configuration. Idempotent.
    pub fn leave(&self, tcp_host: &str) -> Result<(), StoreError> {
        self.raft.remove_server(tcp_host).map_err(|e| match e {
            MembershipError::NotLeader => StoreError::NotLeader,
            MembershipError::Internal(e) => StoreError::Raft(e),
        })
    }
}
