//! Consensus-node doubles for exercising follower behavior without a real
//! multi-node transport.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use meta_proto::Response;

use crate::raft::{Membership, MembershipError, RaftError, RaftNode};

/// A node that is never the leader. When `leader` is set, calls redirect
/// there; otherwise the cluster is leaderless.
#[derive(Debug, Default)]
pub struct FollowerRaft {
    pub leader: Option<String>,
}

#[async_trait]
impl RaftNode for FollowerRaft {
    async fn propose(&self, _data: Bytes, _timeout: Duration) -> Result<Response, RaftError> {
        Err(RaftError::NotLeader {
            leader_http: self.leader.clone(),
        })
    }

    fn is_leader(&self) -> bool {
        false
    }

    fn leader_http(&self) -> Option<String> {
        self.leader.clone()
    }

    fn add_voter(&self, _tcp_host: &str) -> Result<(), RaftError> {
        Err(RaftError::NotLeader {
            leader_http: self.leader.clone(),
        })
    }
}

impl Membership for FollowerRaft {
    fn remove_server(&self, _tcp_host: &str) -> Result<(), MembershipError> {
        Err(MembershipError::NotLeader)
    }
}
