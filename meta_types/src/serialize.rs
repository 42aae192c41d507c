//! Conversions between the in-memory model and the protobuf wire types.
//!
//! The outer snapshot envelope nests the schema tree as an encoded blob so
//! that node lists and the schema can evolve independently; see
//! [`meta_proto::ClusterData`].

use std::collections::BTreeMap;

use bytes::Bytes;
use prost::Message;

use crate::database::{duration_from_nanos, duration_nanos, from_nanos, to_nanos};
use crate::{
    ClusterData, ContinuousQueryInfo, DatabaseInfo, NodeInfo, Privilege, RetentionPolicyInfo,
    ShardGroupInfo, ShardInfo, ShardOwner, SubscriptionInfo, UserInfo,
};

impl NodeInfo {
    fn marshal(&self) -> meta_proto::NodeInfo {
        meta_proto::NodeInfo {
            id: self.id,
            host: self.host.clone(),
            tcp_host: self.tcp_host.clone(),
            pending_shard_owners: self.pending_shard_owners.clone(),
        }
    }

    fn unmarshal(pb: meta_proto::NodeInfo) -> Self {
        Self {
            id: pb.id,
            host: pb.host,
            tcp_host: pb.tcp_host,
            pending_shard_owners: pb.pending_shard_owners,
        }
    }
}

impl DatabaseInfo {
    fn marshal(&self) -> meta_proto::DatabaseInfo {
        meta_proto::DatabaseInfo {
            name: self.name.clone(),
            default_retention_policy: self.default_retention_policy.clone(),
            retention_policies: self.retention_policies.iter().map(|rp| rp.marshal()).collect(),
            continuous_queries: self
                .continuous_queries
                .iter()
                .map(|cq| meta_proto::ContinuousQueryInfo {
                    name: cq.name.clone(),
                    query: cq.query.clone(),
                })
                .collect(),
        }
    }

    fn unmarshal(pb: meta_proto::DatabaseInfo) -> Self {
        Self {
            name: pb.name,
            default_retention_policy: pb.default_retention_policy,
            retention_policies: pb
                .retention_policies
                .into_iter()
                .map(RetentionPolicyInfo::unmarshal)
                .collect(),
            continuous_queries: pb
                .continuous_queries
                .into_iter()
                .map(|cq| ContinuousQueryInfo {
                    name: cq.name,
                    query: cq.query,
                })
                .collect(),
        }
    }
}

impl RetentionPolicyInfo {
    fn marshal(&self) -> meta_proto::RetentionPolicyInfo {
        meta_proto::RetentionPolicyInfo {
            name: self.name.clone(),
            duration: duration_nanos(self.duration),
            shard_group_duration: duration_nanos(self.shard_group_duration),
            replica_n: self.replica_n as u32,
            shard_groups: self.shard_groups.iter().map(|sg| sg.marshal()).collect(),
            subscriptions: self
                .subscriptions
                .iter()
                .map(|s| meta_proto::SubscriptionInfo {
                    name: s.name.clone(),
                    mode: s.mode.clone(),
                    destinations: s.destinations.clone(),
                })
                .collect(),
        }
    }

    fn unmarshal(pb: meta_proto::RetentionPolicyInfo) -> Self {
        Self {
            name: pb.name,
            duration: duration_from_nanos(pb.duration),
            shard_group_duration: duration_from_nanos(pb.shard_group_duration),
            replica_n: pb.replica_n as usize,
            shard_groups: pb.shard_groups.into_iter().map(ShardGroupInfo::unmarshal).collect(),
            subscriptions: pb
                .subscriptions
                .into_iter()
                .map(|s| SubscriptionInfo {
                    name: s.name,
                    mode: s.mode,
                    destinations: s.destinations,
                })
                .collect(),
        }
    }

    /// Serialize just this policy, for embedding in a create-database
    /// command.
    pub fn marshal_binary(&self) -> Bytes {
        meta_proto::encode(&self.marshal())
    }

    pub fn unmarshal_binary(buf: &[u8]) -> Result<Self, prost::DecodeError> {
        Ok(Self::unmarshal(meta_proto::RetentionPolicyInfo::decode(buf)?))
    }
}

impl ShardGroupInfo {
    fn marshal(&self) -> meta_proto::ShardGroupInfo {
        meta_proto::ShardGroupInfo {
            id: self.id,
            start_time: to_nanos(self.start_time),
            end_time: to_nanos(self.end_time),
            deleted_at: self.deleted_at.map(to_nanos).unwrap_or(0),
            shards: self
                .shards
                .iter()
                .map(|s| meta_proto::ShardInfo {
                    id: s.id,
                    owners: s
                        .owners
                        .iter()
                        .map(|o| meta_proto::ShardOwner { node_id: o.node_id })
                        .collect(),
                })
                .collect(),
        }
    }

    fn unmarshal(pb: meta_proto::ShardGroupInfo) -> Self {
        Self {
            id: pb.id,
            start_time: from_nanos(pb.start_time),
            end_time: from_nanos(pb.end_time),
            deleted_at: (pb.deleted_at != 0).then(|| from_nanos(pb.deleted_at)),
            shards: pb
                .shards
                .into_iter()
                .map(|s| ShardInfo {
                    id: s.id,
                    owners: s
                        .owners
                        .into_iter()
                        .map(|o| ShardOwner { node_id: o.node_id })
                        .collect(),
                })
                .collect(),
        }
    }
}

impl UserInfo {
    fn marshal(&self) -> meta_proto::UserInfo {
        meta_proto::UserInfo {
            name: self.name.clone(),
            hash: self.hash.clone(),
            admin: self.admin,
            privileges: self
                .privileges
                .iter()
                .map(|(database, privilege)| meta_proto::UserPrivilege {
                    database: database.clone(),
                    privilege: *privilege as i32,
                })
                .collect(),
        }
    }

    fn unmarshal(pb: meta_proto::UserInfo) -> Self {
        Self {
            name: pb.name,
            hash: pb.hash,
            admin: pb.admin,
            privileges: pb
                .privileges
                .into_iter()
                .map(|p| (p.database, Privilege::from_i32(p.privilege)))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

impl ClusterData {
    /// Serialize the whole tree to the stable wire format.
    pub fn marshal_binary(&self) -> Bytes {
        let inner = meta_proto::Data {
            term: self.term,
            index: self.index,
            cluster_id: self.cluster_id,
            max_node_id: self.max_node_id,
            max_shard_group_id: self.max_shard_group_id,
            max_shard_id: self.max_shard_id,
            databases: self.databases.iter().map(|db| db.marshal()).collect(),
            users: self.users.iter().map(|u| u.marshal()).collect(),
        };

        meta_proto::encode(&meta_proto::ClusterData {
            data: meta_proto::encode(&inner),
            meta_nodes: self.meta_nodes.iter().map(|n| n.marshal()).collect(),
            data_nodes: self.data_nodes.iter().map(|n| n.marshal()).collect(),
            users: Vec::new(),
        })
    }

    pub fn unmarshal_binary(buf: &[u8]) -> Result<Self, prost::DecodeError> {
        let pb = meta_proto::ClusterData::decode(buf)?;
        let inner = meta_proto::Data::decode(pb.data)?;

        Ok(Self {
            term: inner.term,
            index: inner.index,
            cluster_id: inner.cluster_id,
            max_node_id: inner.max_node_id,
            max_shard_group_id: inner.max_shard_group_id,
            max_shard_id: inner.max_shard_id,
            meta_nodes: pb.meta_nodes.into_iter().map(NodeInfo::unmarshal).collect(),
            data_nodes: pb.data_nodes.into_iter().map(NodeInfo::unmarshal).collect(),
            databases: inner.databases.into_iter().map(DatabaseInfo::unmarshal).collect(),
            users: inner.users.into_iter().map(UserInfo::unmarshal).collect(),
        })
    }
}
