//! The copy-on-write root of all cluster metadata.
//!
//! [`ClusterData`] is a plain value: the state machine clones it, edits the
//! clone through the mutators below, and atomically installs the result.
//! Nothing here locks; concurrency is the state machine's problem.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::database::{from_nanos, to_nanos};
use crate::{
    DatabaseInfo, MetaError, NodeInfo, Privilege, Result, RetentionPolicyInfo,
    RetentionPolicyUpdate, ShardGroupInfo, ShardInfo, ShardOwner, SubscriptionInfo, UserInfo,
    MIN_RETENTION_POLICY_DURATION,
};

/// Top-level collection of all metadata, stamped with the Raft coordinates of
/// the last command applied to it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterData {
    /// Raft term of the last applied command.
    pub term: u64,
    /// Raft log index of the last applied command.
    pub index: u64,
    /// Random nonce adopted from the first meta-node command; zero only
    /// before any meta node exists.
    pub cluster_id: u64,
    pub max_node_id: u64,
    pub max_shard_group_id: u64,
    pub max_shard_id: u64,
    /// Sorted by ID.
    pub meta_nodes: Vec<NodeInfo>,
    /// Sorted by ID.
    pub data_nodes: Vec<NodeInfo>,
    pub databases: Vec<DatabaseInfo>,
    pub users: Vec<UserInfo>,
}

impl ClusterData {
    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn meta_node(&self, id: u64) -> Option<&NodeInfo> {
        self.meta_nodes.iter().find(|n| n.id == id)
    }

    pub fn data_node(&self, id: u64) -> Option<&NodeInfo> {
        self.data_nodes.iter().find(|n| n.id == id)
    }

    pub fn data_node_by_tcp_host(&self, tcp_host: &str) -> Option<&NodeInfo> {
        self.data_nodes.iter().find(|n| n.tcp_host == tcp_host)
    }

    pub fn data_node_by_http_host(&self, host: &str) -> Option<&NodeInfo> {
        self.data_nodes.iter().find(|n| n.host == host)
    }

    pub fn meta_node_by_host(&self, host: &str) -> Option<&NodeInfo> {
        self.meta_nodes.iter().find(|n| n.host == host)
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|db| db.name == name)
    }

    fn database_mut(&mut self, name: &str) -> Option<&mut DatabaseInfo> {
        self.databases.iter_mut().find(|db| db.name == name)
    }

    /// Look up a retention policy. A missing database is an error, a missing
    /// policy is `Ok(None)`.
    pub fn retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<&RetentionPolicyInfo>> {
        let db = self.database(database).ok_or(MetaError::DatabaseNotFound)?;
        Ok(db.retention_policy(name))
    }

    fn must_retention_policy(&self, database: &str, name: &str) -> Result<&RetentionPolicyInfo> {
        self.retention_policy(database, name)?
            .ok_or(MetaError::RetentionPolicyNotFound)
    }

    fn must_retention_policy_mut(
        &mut self,
        database: &str,
        name: &str,
    ) -> Result<&mut RetentionPolicyInfo> {
        self.database_mut(database)
            .ok_or(MetaError::DatabaseNotFound)?
            .retention_policy_mut(name)
            .ok_or(MetaError::RetentionPolicyNotFound)
    }

    pub fn user(&self, name: &str) -> Option<&UserInfo> {
        self.users.iter().find(|u| u.name == name)
    }

    pub fn user_privileges(&self, username: &str) -> Result<&BTreeMap<String, Privilege>> {
        let user = self.user(username).ok_or(MetaError::UserNotFound)?;
        Ok(&user.privileges)
    }

    pub fn user_privilege(&self, username: &str, database: &str) -> Result<Privilege> {
        let user = self.user(username).ok_or(MetaError::UserNotFound)?;
        if user.admin {
            return Ok(Privilege::All);
        }
        Ok(user
            .privileges
            .get(database)
            .copied()
            .unwrap_or(Privilege::NoPrivileges))
    }

    /// Every shard ID in the cluster, ascending.
    pub fn shard_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .databases
            .iter()
            .flat_map(|db| &db.retention_policies)
            .flat_map(|rp| &rp.shard_groups)
            .flat_map(|sg| &sg.shards)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Locate a shard: the owning database, policy, group, and the shard
    /// itself.
    pub fn shard_location(
        &self,
        shard_id: u64,
    ) -> Option<(
        &DatabaseInfo,
        &RetentionPolicyInfo,
        &ShardGroupInfo,
        &ShardInfo,
    )> {
        for db in &self.databases {
            for rp in &db.retention_policies {
                for sg in &rp.shard_groups {
                    if let Some(shard) = sg.shard(shard_id) {
                        return Some((db, rp, sg, shard));
                    }
                }
            }
        }
        None
    }

    fn shard_mut(&mut self, shard_id: u64) -> Option<&mut ShardInfo> {
        self.databases
            .iter_mut()
            .flat_map(|db| &mut db.retention_policies)
            .flat_map(|rp| &mut rp.shard_groups)
            .flat_map(|sg| &mut sg.shards)
            .find(|s| s.id == shard_id)
    }

    // -----------------------------------------------------------------------
    // Node mutators
    // -----------------------------------------------------------------------

    /// Allocate a node ID: a host already registered as a meta node keeps its
    /// ID for the second role, otherwise the next ID is minted.
    fn allocate_node_id(&mut self, tcp_host: &str) -> u64 {
        if let Some(existing) = self.meta_nodes.iter().find(|n| n.tcp_host == tcp_host) {
            return existing.id;
        }
        self.max_node_id += 1;
        self.max_node_id
    }

    pub fn create_meta_node(&mut self, host: &str, tcp_host: &str) -> Result<()> {
        if self.data_nodes.iter().any(|n| n.tcp_host == tcp_host) {
            return Err(MetaError::NodeExists);
        }

        let id = self.allocate_node_id(tcp_host);
        if self.meta_nodes.iter().any(|n| n.id == id) {
            return Err(MetaError::NodeExists);
        }

        self.meta_nodes.push(NodeInfo {
            id,
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
            pending_shard_owners: Vec::new(),
        });
        self.meta_nodes.sort_by_key(|n| n.id);
        Ok(())
    }

    /// Add a meta node with a caller-chosen ID (single-node bootstrap).
    pub fn set_meta_node(&mut self, id: u64, host: &str, tcp_host: &str) -> Result<()> {
        if self.meta_nodes.iter().any(|n| n.host == host) {
            return Err(MetaError::NodeExists);
        }

        self.meta_nodes.push(NodeInfo {
            id,
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
            pending_shard_owners: Vec::new(),
        });
        self.meta_nodes.sort_by_key(|n| n.id);
        self.max_node_id = self.max_node_id.max(id);
        Ok(())
    }

    pub fn delete_meta_node(&mut self, id: u64) -> Result<()> {
        let before = self.meta_nodes.len();
        self.meta_nodes.retain(|n| n.id != id);
        if self.meta_nodes.len() == before {
            return Err(MetaError::NodeNotFound);
        }
        Ok(())
    }

    pub fn create_data_node(&mut self, host: &str, tcp_host: &str) -> Result<()> {
        if self.data_nodes.iter().any(|n| n.tcp_host == tcp_host) {
            return Err(MetaError::NodeExists);
        }

        let id = self.allocate_node_id(tcp_host);
        self.data_nodes.push(NodeInfo {
            id,
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
            pending_shard_owners: Vec::new(),
        });
        self.data_nodes.sort_by_key(|n| n.id);
        Ok(())
    }

    pub fn update_data_node(&mut self, id: u64, host: &str, tcp_host: &str) -> Result<()> {
        let node = self
            .data_nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(MetaError::NodeNotFound)?;
        node.host = host.to_string();
        node.tcp_host = tcp_host.to_string();
        Ok(())
    }

    /// Remove a data node, dropping it from every shard's owner list.
    ///
    /// Shards that would end up ownerless are reassigned to the surviving
    /// node owning the fewest shards in the same group (lowest ID wins a
    /// tie). A group whose shards are all orphaned is marked deleted.
    pub fn delete_data_node(&mut self, id: u64) -> Result<()> {
        let before = self.data_nodes.len();
        self.data_nodes.retain(|n| n.id != id);
        if self.data_nodes.len() == before {
            return Err(MetaError::NodeNotFound);
        }

        let now = Utc::now();
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                for sg in &mut rp.shard_groups {
                    // Ownership counts per node within this group, taken
                    // before the removal so reassignment balances against
                    // the surviving load.
                    let mut owner_freqs: BTreeMap<u64, usize> = BTreeMap::new();
                    let mut orphaned = Vec::new();

                    for shard in &mut sg.shards {
                        for owner in &shard.owners {
                            *owner_freqs.entry(owner.node_id).or_insert(0) += 1;
                        }
                        shard.prune_owner(id);
                        if shard.owners.is_empty() {
                            orphaned.push(shard.id);
                        }
                    }

                    if sg.shards.is_empty() || orphaned.len() == sg.shards.len() {
                        sg.deleted_at = Some(now);
                        continue;
                    }

                    owner_freqs.remove(&id);
                    for shard_id in orphaned {
                        let node_id = next_shard_owner(&mut owner_freqs)?;
                        if let Some(shard) = sg.shards.iter_mut().find(|s| s.id == shard_id) {
                            shard.owners.push(ShardOwner { node_id });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Database / retention policy mutators
    // -----------------------------------------------------------------------

    /// Create a database. Creating an existing database is a no-op.
    pub fn create_database(&mut self, name: &str) -> Result<()> {
        if self.database(name).is_none() {
            self.databases.push(DatabaseInfo::new(name));
        }
        Ok(())
    }

    pub fn drop_database(&mut self, name: &str) -> Result<()> {
        let before = self.databases.len();
        self.databases.retain(|db| db.name != name);
        if self.databases.len() == before {
            return Err(MetaError::DatabaseNotFound);
        }
        Ok(())
    }

    /// Add a retention policy to a database. Re-creating a policy with
    /// identical parameters is a no-op; differing parameters are an error.
    ///
    /// The database's first policy becomes its default.
    pub fn create_retention_policy(
        &mut self,
        database: &str,
        mut rpi: RetentionPolicyInfo,
    ) -> Result<()> {
        if rpi.replica_n < 1 {
            rpi.replica_n = 1;
        }
        if rpi.shard_group_duration == Duration::ZERO {
            rpi.shard_group_duration = crate::normalised_shard_group_duration(rpi.duration);
        }

        let db = self
            .database_mut(database)
            .ok_or(MetaError::DatabaseNotFound)?;

        if let Some(existing) = db.retention_policy(&rpi.name) {
            if existing.replica_n == rpi.replica_n
                && existing.duration == rpi.duration
                && existing.shard_group_duration == rpi.shard_group_duration
            {
                return Ok(());
            }
            return Err(MetaError::RetentionPolicyExists);
        }

        if db.default_retention_policy.is_empty() {
            db.default_retention_policy = rpi.name.clone();
        }
        db.retention_policies.push(rpi);
        Ok(())
    }

    pub fn drop_retention_policy(&mut self, database: &str, name: &str) -> Result<()> {
        let db = self
            .database_mut(database)
            .ok_or(MetaError::DatabaseNotFound)?;
        let before = db.retention_policies.len();
        db.retention_policies.retain(|rp| rp.name != name);
        if db.retention_policies.len() == before {
            return Err(MetaError::RetentionPolicyNotFound);
        }
        if db.default_retention_policy == name {
            db.default_retention_policy.clear();
        }
        Ok(())
    }

    pub fn set_default_retention_policy(&mut self, database: &str, name: &str) -> Result<()> {
        let db = self
            .database_mut(database)
            .ok_or(MetaError::DatabaseNotFound)?;
        if db.retention_policy(name).is_none() {
            return Err(MetaError::RetentionPolicyNotFound);
        }
        db.default_retention_policy = name.to_string();
        Ok(())
    }

    pub fn update_retention_policy(
        &mut self,
        database: &str,
        name: &str,
        update: RetentionPolicyUpdate,
    ) -> Result<()> {
        if let Some(duration) = update.duration {
            if duration != Duration::ZERO && duration < MIN_RETENTION_POLICY_DURATION {
                return Err(MetaError::RetentionPolicyDurationTooLow);
            }
        }

        let db = self
            .database_mut(database)
            .ok_or(MetaError::DatabaseNotFound)?;
        if db.retention_policy(name).is_none() {
            return Err(MetaError::RetentionPolicyNotFound);
        }

        // An empty rename means "leave the name unchanged".
        let new_name = update.name.filter(|n| !n.is_empty() && n.as_str() != name);
        if let Some(new_name) = &new_name {
            if db.retention_policy(new_name).is_some() {
                return Err(MetaError::RetentionPolicyExists);
            }
        }

        let was_default = db.default_retention_policy == name;
        let renamed = {
            let rp = db
                .retention_policy_mut(name)
                .ok_or(MetaError::RetentionPolicyNotFound)?;
            if let Some(new_name) = new_name {
                rp.name = new_name;
            }
            if let Some(duration) = update.duration {
                rp.duration = duration;
            }
            if let Some(replica_n) = update.replica_n {
                rp.replica_n = replica_n.max(1);
            }
            rp.name.clone()
        };
        if was_default {
            db.default_retention_policy = renamed;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shard group mutators
    // -----------------------------------------------------------------------

    /// Create the shard group covering `timestamp` for a policy.
    ///
    /// A cluster without data nodes, or a policy that already covers the
    /// timestamp, makes this a no-op. Owners are assigned round-robin over
    /// the data nodes starting at `index % len(data_nodes)`, which is the
    /// same on every replica because `index` is part of the replicated state.
    pub fn create_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if self.data_nodes.is_empty() {
            return Ok(());
        }

        let (replica_n, group_duration) = {
            let rp = self.must_retention_policy(database, policy)?;
            if rp.shard_group_by_timestamp(timestamp).is_some() {
                return Ok(());
            }
            let replica_n = rp.replica_n.clamp(1, self.data_nodes.len());
            let group_duration = if rp.shard_group_duration == Duration::ZERO {
                crate::normalised_shard_group_duration(rp.duration)
            } else {
                rp.shard_group_duration
            };
            (replica_n, group_duration)
        };

        // Shard count scales inversely with the replication factor so that
        // every node ends up owning one replica's worth of the group.
        let shard_n = self.data_nodes.len() / replica_n;

        let window = crate::database::duration_nanos(group_duration);
        let ts = to_nanos(timestamp);
        let start = ts - ts.rem_euclid(window);

        self.max_shard_group_id += 1;
        let mut group = ShardGroupInfo {
            id: self.max_shard_group_id,
            start_time: from_nanos(start),
            end_time: from_nanos(start + window),
            deleted_at: None,
            shards: Vec::with_capacity(shard_n),
        };
        for _ in 0..shard_n {
            self.max_shard_id += 1;
            group.shards.push(ShardInfo {
                id: self.max_shard_id,
                owners: Vec::with_capacity(replica_n),
            });
        }

        let node_ids: Vec<u64> = self.data_nodes.iter().map(|n| n.id).collect();
        let mut node_index = (self.index % node_ids.len() as u64) as usize;
        for shard in &mut group.shards {
            for _ in 0..replica_n {
                shard.owners.push(ShardOwner {
                    node_id: node_ids[node_index % node_ids.len()],
                });
                node_index += 1;
            }
        }

        let rp = self.must_retention_policy_mut(database, policy)?;
        rp.shard_groups.push(group);
        rp.shard_groups.sort_by_key(|sg| sg.start_time);
        Ok(())
    }

    /// Mark a shard group deleted. Reads skip it from then on; the entry is
    /// retained so its IDs stay reserved.
    pub fn delete_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        shard_group_id: u64,
    ) -> Result<()> {
        let rp = self.must_retention_policy_mut(database, policy)?;
        let group = rp
            .shard_groups
            .iter_mut()
            .find(|sg| sg.id == shard_group_id)
            .ok_or(MetaError::ShardGroupNotFound)?;
        group.deleted_at = Some(Utc::now());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shard owner mutators
    // -----------------------------------------------------------------------

    /// Add a data node to a shard's owner list. Already-owning nodes make
    /// this a no-op; the node must exist.
    pub fn add_shard_owner(&mut self, shard_id: u64, node_id: u64) -> Result<()> {
        if self.data_node(node_id).is_none() {
            return Err(MetaError::NodeNotFound);
        }
        let shard = self.shard_mut(shard_id).ok_or(MetaError::ShardNotFound)?;
        if shard.owned_by(node_id) {
            return Ok(());
        }
        shard.owners.push(ShardOwner { node_id });
        shard.owners.sort();
        Ok(())
    }

    /// Remove a data node from a shard's owner list. Refuses to orphan the
    /// shard.
    pub fn remove_shard_owner(&mut self, shard_id: u64, node_id: u64) -> Result<()> {
        let shard = self.shard_mut(shard_id).ok_or(MetaError::ShardNotFound)?;
        if !shard.owned_by(node_id) {
            return Err(MetaError::ShardOwnerNotFound);
        }
        if shard.owners.len() == 1 {
            return Err(MetaError::ShardLastOwner);
        }
        shard.prune_owner(node_id);
        Ok(())
    }

    fn meta_node_mut(&mut self, id: u64) -> Option<&mut NodeInfo> {
        self.meta_nodes.iter_mut().find(|n| n.id == id)
    }

    /// Queue a shard for ownership hand-off on a meta node.
    pub fn add_pending_shard_owner(&mut self, shard_id: u64, node_id: u64) -> Result<()> {
        let node = self
            .meta_node_mut(node_id)
            .ok_or(MetaError::NodeNotFound)?;
        node.pending_shard_owners.push(shard_id);
        Ok(())
    }

    /// Drop every queued hand-off of a shard on a meta node.
    pub fn remove_pending_shard_owner(&mut self, shard_id: u64, node_id: u64) -> Result<()> {
        let node = self
            .meta_node_mut(node_id)
            .ok_or(MetaError::NodeNotFound)?;
        node.pending_shard_owners.retain(|&id| id != shard_id);
        Ok(())
    }

    /// Complete a hand-off: the node becomes a shard owner and the pending
    /// entry is cleared in the same apply.
    pub fn commit_pending_shard_owner(&mut self, shard_id: u64, node_id: u64) -> Result<()> {
        self.add_shard_owner(shard_id, node_id)?;
        // The host may not carry the meta role; then there is no pending
        // entry to clear.
        if let Some(node) = self.meta_node_mut(node_id) {
            node.pending_shard_owners.retain(|&id| id != shard_id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Continuous query / subscription mutators
    // -----------------------------------------------------------------------

    /// Store a continuous query definition. Re-creating an identical query is
    /// a no-op.
    pub fn create_continuous_query(
        &mut self,
        database: &str,
        name: &str,
        query: &str,
    ) -> Result<()> {
        let db = self
            .database_mut(database)
            .ok_or(MetaError::DatabaseNotFound)?;
        if let Some(cq) = db.continuous_query(name) {
            if cq.query == query {
                return Ok(());
            }
            return Err(MetaError::ContinuousQueryExists);
        }
        db.continuous_queries.push(crate::ContinuousQueryInfo {
            name: name.to_string(),
            query: query.to_string(),
        });
        db.continuous_queries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    pub fn drop_continuous_query(&mut self, database: &str, name: &str) -> Result<()> {
        let db = self
            .database_mut(database)
            .ok_or(MetaError::DatabaseNotFound)?;
        let before = db.continuous_queries.len();
        db.continuous_queries.retain(|cq| cq.name != name);
        if db.continuous_queries.len() == before {
            return Err(MetaError::ContinuousQueryNotFound);
        }
        Ok(())
    }

    pub fn create_subscription(
        &mut self,
        database: &str,
        policy: &str,
        name: &str,
        mode: &str,
        destinations: Vec<String>,
    ) -> Result<()> {
        let rp = self.must_retention_policy_mut(database, policy)?;
        if rp.subscription(name).is_some() {
            return Err(MetaError::SubscriptionExists);
        }
        rp.subscriptions.push(SubscriptionInfo {
            name: name.to_string(),
            mode: mode.to_string(),
            destinations,
        });
        Ok(())
    }

    pub fn drop_subscription(&mut self, database: &str, policy: &str, name: &str) -> Result<()> {
        let rp = self.must_retention_policy_mut(database, policy)?;
        let before = rp.subscriptions.len();
        rp.subscriptions.retain(|s| s.name != name);
        if rp.subscriptions.len() == before {
            return Err(MetaError::SubscriptionNotFound);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // User mutators
    // -----------------------------------------------------------------------

    pub fn create_user(&mut self, name: &str, hash: &str, admin: bool) -> Result<()> {
        if self.user(name).is_some() {
            return Err(MetaError::UserExists);
        }
        self.users.push(UserInfo {
            name: name.to_string(),
            hash: hash.to_string(),
            admin,
            privileges: BTreeMap::new(),
        });
        Ok(())
    }

    pub fn drop_user(&mut self, name: &str) -> Result<()> {
        let before = self.users.len();
        self.users.retain(|u| u.name != name);
        if self.users.len() == before {
            return Err(MetaError::UserNotFound);
        }
        Ok(())
    }

    pub fn update_user(&mut self, name: &str, hash: &str) -> Result<()> {
        let user = self
            .users
            .iter_mut()
            .find(|u| u.name == name)
            .ok_or(MetaError::UserNotFound)?;
        user.hash = hash.to_string();
        Ok(())
    }

    pub fn set_privilege(
        &mut self,
        username: &str,
        database: &str,
        privilege: Privilege,
    ) -> Result<()> {
        let user = self
            .users
            .iter_mut()
            .find(|u| u.name == username)
            .ok_or(MetaError::UserNotFound)?;
        if privilege == Privilege::NoPrivileges {
            user.privileges.remove(database);
        } else {
            user.privileges.insert(database.to_string(), privilege);
        }
        Ok(())
    }

    pub fn set_admin_privilege(&mut self, username: &str, admin: bool) -> Result<()> {
        let user = self
            .users
            .iter_mut()
            .find(|u| u.name == username)
            .ok_or(MetaError::UserNotFound)?;
        user.admin = admin;
        Ok(())
    }
}

/// Pick the reassignment target for an orphaned shard: the candidate owning
/// the fewest shards in the group, lowest node ID breaking ties. The chosen
/// node's count is bumped so successive orphans spread out.
fn next_shard_owner(owner_freqs: &mut BTreeMap<u64, usize>) -> Result<u64> {
    let (&node_id, _) = owner_freqs
        .iter()
        .min_by_key(|&(&id, &freq)| (freq, id))
        .ok_or(MetaError::NodeNotFound)?;
    *owner_freqs.entry(node_id).or_insert(0) += 1;
    Ok(node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn data_with_nodes(n: usize) -> ClusterData {
        let mut data = ClusterData::default();
        for i in 0..n {
            data.create_data_node(&format!("d{}:8086", i + 1), &format!("d{}:8088", i + 1))
                .unwrap();
        }
        data
    }

    fn policy(replica_n: usize, group_duration: Duration) -> RetentionPolicyInfo {
        RetentionPolicyInfo {
            replica_n,
            shard_group_duration: group_duration,
            ..RetentionPolicyInfo::new("rp1")
        }
    }

    #[test]
    fn node_ids_are_monotonic_and_reused_across_roles() {
        let mut data = ClusterData::default();
        data.create_meta_node("m1:8091", "m1:8088").unwrap();
        data.create_meta_node("m2:8091", "m2:8088").unwrap();
        assert_eq!(data.meta_node(1).unwrap().host, "m1:8091");
        assert_eq!(data.max_node_id, 2);

        // Same TCP host as meta node 2: the data role shares the ID.
        data.create_data_node("m2:8086", "m2:8088").unwrap();
        assert_eq!(data.data_node(2).unwrap().host, "m2:8086");
        assert_eq!(data.max_node_id, 2);

        data.create_data_node("d3:8086", "d3:8088").unwrap();
        assert_eq!(data.data_node(3).unwrap().tcp_host, "d3:8088");
        assert_eq!(data.max_node_id, 3);
    }

    #[test]
    fn duplicate_tcp_host_rejected_within_role() {
        let mut data = data_with_nodes(1);
        assert_eq!(
            data.create_data_node("other:8086", "d1:8088"),
            Err(MetaError::NodeExists)
        );
    }

    #[test]
    fn create_database_is_idempotent() {
        let mut data = ClusterData::default();
        data.create_database("mydb").unwrap();
        data.create_database("mydb").unwrap();
        assert_eq!(data.databases.len(), 1);
        assert!(data.database("mydb").unwrap().retention_policies.is_empty());
    }

    #[test]
    fn first_retention_policy_becomes_default() {
        let mut data = ClusterData::default();
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", RetentionPolicyInfo::new("rp1"))
            .unwrap();
        assert_eq!(data.database("mydb").unwrap().default_retention_policy, "rp1");

        // identical re-create is a no-op, differing parameters are rejected
        let mut same = RetentionPolicyInfo::new("rp1");
        same.shard_group_duration = Duration::from_secs(7 * 24 * 3600);
        data.create_retention_policy("mydb", same).unwrap();
        let mut different = RetentionPolicyInfo::new("rp1");
        different.replica_n = 2;
        assert_eq!(
            data.create_retention_policy("mydb", different),
            Err(MetaError::RetentionPolicyExists)
        );
    }

    #[test]
    fn update_retention_policy_validates_duration() {
        let mut data = ClusterData::default();
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", RetentionPolicyInfo::new("rp1"))
            .unwrap();

        let update = RetentionPolicyUpdate {
            duration: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        assert_eq!(
            data.update_retention_policy("mydb", "rp1", update),
            Err(MetaError::RetentionPolicyDurationTooLow)
        );

        // zero duration means "keep forever" and is always allowed
        let update = RetentionPolicyUpdate {
            duration: Some(Duration::ZERO),
            ..Default::default()
        };
        data.update_retention_policy("mydb", "rp1", update).unwrap();
    }

    #[test]
    fn update_retention_policy_rename_follows_default() {
        let mut data = ClusterData::default();
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", RetentionPolicyInfo::new("rp1"))
            .unwrap();

        let update = RetentionPolicyUpdate {
            name: Some("weekly".to_string()),
            ..Default::default()
        };
        data.update_retention_policy("mydb", "rp1", update).unwrap();
        let db = data.database("mydb").unwrap();
        assert_eq!(db.default_retention_policy, "weekly");
        assert!(db.retention_policy("weekly").is_some());

        // empty new name leaves the name untouched
        let update = RetentionPolicyUpdate {
            name: Some(String::new()),
            replica_n: Some(2),
            ..Default::default()
        };
        data.update_retention_policy("mydb", "weekly", update)
            .unwrap();
        assert_eq!(
            data.database("mydb")
                .unwrap()
                .retention_policy("weekly")
                .unwrap()
                .replica_n,
            2
        );
    }

    #[test]
    fn create_shard_group_without_data_nodes_is_a_noop() {
        let mut data = ClusterData::default();
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", RetentionPolicyInfo::new("rp1"))
            .unwrap();

        data.create_shard_group("mydb", "rp1", t("2024-01-01T00:30:00Z"))
            .unwrap();
        assert!(data
            .retention_policy("mydb", "rp1")
            .unwrap()
            .unwrap()
            .shard_groups
            .is_empty());
    }

    #[test]
    fn create_shard_group_places_owners_round_robin_from_index() {
        let mut data = data_with_nodes(3);
        data.index = 7; // start offset = 7 % 3 = 1
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", policy(2, Duration::from_secs(3600)))
            .unwrap();

        data.create_shard_group("mydb", "rp1", t("2024-01-01T00:30:00Z"))
            .unwrap();

        let rp = data.retention_policy("mydb", "rp1").unwrap().unwrap();
        assert_eq!(rp.shard_groups.len(), 1);
        let sg = &rp.shard_groups[0];
        assert_eq!(sg.start_time, t("2024-01-01T00:00:00Z"));
        assert_eq!(sg.end_time, t("2024-01-01T01:00:00Z"));

        // 3 nodes / replica 2 -> one shard, owned by nodes 2 and 3
        assert_eq!(sg.shards.len(), 1);
        let owners: Vec<u64> = sg.shards[0].owners.iter().map(|o| o.node_id).collect();
        assert_eq!(owners, vec![2, 3]);
    }

    #[test]
    fn create_shard_group_is_idempotent_per_window() {
        let mut data = data_with_nodes(2);
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", policy(1, Duration::from_secs(3600)))
            .unwrap();

        data.create_shard_group("mydb", "rp1", t("2024-01-01T00:10:00Z"))
            .unwrap();
        data.create_shard_group("mydb", "rp1", t("2024-01-01T00:50:00Z"))
            .unwrap();

        let rp = data.retention_policy("mydb", "rp1").unwrap().unwrap();
        assert_eq!(rp.shard_groups.len(), 1);
    }

    #[test]
    fn shard_groups_stay_sorted_and_non_overlapping() {
        let mut data = data_with_nodes(1);
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", policy(1, Duration::from_secs(3600)))
            .unwrap();

        data.create_shard_group("mydb", "rp1", t("2024-01-01T05:30:00Z"))
            .unwrap();
        data.create_shard_group("mydb", "rp1", t("2024-01-01T02:30:00Z"))
            .unwrap();
        data.create_shard_group("mydb", "rp1", t("2024-01-01T04:30:00Z"))
            .unwrap();

        let rp = data.retention_policy("mydb", "rp1").unwrap().unwrap();
        let starts: Vec<_> = rp.shard_groups.iter().map(|sg| sg.start_time).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
        for pair in rp.shard_groups.windows(2) {
            assert!(pair[0].end_time <= pair[1].start_time);
        }
    }

    #[test]
    fn replica_n_is_clamped_to_node_count() {
        let mut data = data_with_nodes(2);
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", policy(5, Duration::from_secs(3600)))
            .unwrap();

        data.create_shard_group("mydb", "rp1", t("2024-01-01T00:00:00Z"))
            .unwrap();
        let rp = data.retention_policy("mydb", "rp1").unwrap().unwrap();
        assert_eq!(rp.shard_groups[0].shards.len(), 1);
        assert_eq!(rp.shard_groups[0].shards[0].owners.len(), 2);
    }

    #[test]
    fn delete_data_node_reassigns_orphaned_shards() {
        let mut data = data_with_nodes(3);
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", policy(1, Duration::from_secs(3600)))
            .unwrap();

        // 3 nodes / replica 1 -> 3 shards, one owner each (nodes 1, 2, 3)
        data.create_shard_group("mydb", "rp1", t("2024-01-01T00:00:00Z"))
            .unwrap();

        data.delete_data_node(2).unwrap();

        let rp = data.retention_policy("mydb", "rp1").unwrap().unwrap();
        let sg = &rp.shard_groups[0];
        assert!(!sg.deleted());
        for shard in &sg.shards {
            assert!(!shard.owners.is_empty());
            assert!(!shard.owned_by(2));
            for owner in &shard.owners {
                assert!(data.data_node(owner.node_id).is_some());
            }
        }
        // The orphan moved to the group member with the fewest shards;
        // both survivors owned one, so the lowest ID (1) wins.
        let orphan_owner: Vec<u64> = sg
            .shards
            .iter()
            .filter(|s| s.owners.len() == 1)
            .flat_map(|s| s.owners.iter().map(|o| o.node_id))
            .collect();
        assert!(orphan_owner.contains(&1));
    }

    #[test]
    fn delete_data_node_marks_fully_orphaned_groups_deleted() {
        let mut data = data_with_nodes(1);
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", policy(1, Duration::from_secs(3600)))
            .unwrap();
        data.create_shard_group("mydb", "rp1", t("2024-01-01T00:00:00Z"))
            .unwrap();

        data.delete_data_node(1).unwrap();
        let rp = data.retention_policy("mydb", "rp1").unwrap().unwrap();
        assert!(rp.shard_groups[0].deleted());

        assert_eq!(data.delete_data_node(1), Err(MetaError::NodeNotFound));
    }

    #[test]
    fn shard_owner_mutations_respect_invariants() {
        let mut data = data_with_nodes(2);
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", policy(2, Duration::from_secs(3600)))
            .unwrap();
        data.create_shard_group("mydb", "rp1", t("2024-01-01T00:00:00Z"))
            .unwrap();
        let shard_id = data.shard_ids()[0];

        // both nodes own the shard; removing one is fine, removing the last
        // is refused
        data.remove_shard_owner(shard_id, 1).unwrap();
        assert_eq!(
            data.remove_shard_owner(shard_id, 2),
            Err(MetaError::ShardLastOwner)
        );

        // unknown node cannot become an owner
        assert_eq!(
            data.add_shard_owner(shard_id, 42),
            Err(MetaError::NodeNotFound)
        );
        data.add_shard_owner(shard_id, 1).unwrap();
        data.add_shard_owner(shard_id, 1).unwrap(); // idempotent
        let (_, _, _, shard) = data.shard_location(shard_id).unwrap();
        assert_eq!(shard.owners.len(), 2);
    }

    #[test]
    fn pending_shard_owner_lifecycle() {
        let mut data = ClusterData::default();
        data.create_meta_node("m1:8091", "m1:8088").unwrap();
        data.create_data_node("d:8086", "m1:8088").unwrap(); // same host, same ID
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", RetentionPolicyInfo::new("rp1"))
            .unwrap();
        data.create_shard_group("mydb", "rp1", t("2024-01-01T00:00:00Z"))
            .unwrap();
        let shard_id = data.shard_ids()[0];

        data.add_pending_shard_owner(shard_id, 1).unwrap();
        assert_eq!(data.meta_node(1).unwrap().pending_shard_owners, vec![shard_id]);

        data.commit_pending_shard_owner(shard_id, 1).unwrap();
        assert!(data.meta_node(1).unwrap().pending_shard_owners.is_empty());
        let (_, _, _, shard) = data.shard_location(shard_id).unwrap();
        assert!(shard.owned_by(1));
    }

    #[test]
    fn user_lifecycle_and_privileges() {
        let mut data = ClusterData::default();
        data.create_user("alice", "$2a$10$hash", true).unwrap();
        assert_eq!(
            data.create_user("alice", "$2a$10$other", false),
            Err(MetaError::UserExists)
        );

        data.create_user("bob", "$2a$10$hash2", false).unwrap();
        data.set_privilege("bob", "mydb", Privilege::Read).unwrap();
        assert_eq!(data.user_privilege("bob", "mydb").unwrap(), Privilege::Read);
        assert_eq!(
            data.user_privilege("bob", "otherdb").unwrap(),
            Privilege::NoPrivileges
        );
        // admins hold all privileges everywhere
        assert_eq!(data.user_privilege("alice", "any").unwrap(), Privilege::All);

        data.set_admin_privilege("bob", true).unwrap();
        assert!(data.user("bob").unwrap().admin);

        data.drop_user("bob").unwrap();
        assert_eq!(data.drop_user("bob"), Err(MetaError::UserNotFound));
    }

    #[test]
    fn continuous_query_create_is_idempotent_for_same_text() {
        let mut data = ClusterData::default();
        data.create_database("mydb").unwrap();
        data.create_continuous_query("mydb", "cq1", "SELECT mean(v) INTO x FROM y")
            .unwrap();
        data.create_continuous_query("mydb", "cq1", "SELECT mean(v) INTO x FROM y")
            .unwrap();
        assert_eq!(
            data.create_continuous_query("mydb", "cq1", "SELECT max(v) INTO x FROM y"),
            Err(MetaError::ContinuousQueryExists)
        );
        assert_eq!(data.database("mydb").unwrap().continuous_queries.len(), 1);
    }

    #[test]
    fn subscriptions_are_scoped_to_policy() {
        let mut data = ClusterData::default();
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", RetentionPolicyInfo::new("rp1"))
            .unwrap();

        data.create_subscription(
            "mydb",
            "rp1",
            "sub0",
            crate::SUBSCRIPTION_MODE_ALL,
            vec!["http://mirror:9092".to_string()],
        )
        .unwrap();
        assert_eq!(
            data.create_subscription("mydb", "rp1", "sub0", crate::SUBSCRIPTION_MODE_ANY, vec![]),
            Err(MetaError::SubscriptionExists)
        );

        data.drop_subscription("mydb", "rp1", "sub0").unwrap();
        assert_eq!(
            data.drop_subscription("mydb", "rp1", "sub0"),
            Err(MetaError::SubscriptionNotFound)
        );
    }

    #[test]
    fn max_ids_cover_all_live_ids() {
        let mut data = data_with_nodes(3);
        data.create_database("mydb").unwrap();
        data.create_retention_policy("mydb", policy(1, Duration::from_secs(3600)))
            .unwrap();
        data.create_shard_group("mydb", "rp1", t("2024-01-01T00:00:00Z"))
            .unwrap();
        data.create_shard_group("mydb", "rp1", t("2024-01-01T01:00:00Z"))
            .unwrap();

        let max_node = data.data_nodes.iter().map(|n| n.id).max().unwrap();
        assert!(data.max_node_id >= max_node);
        let max_shard = data.shard_ids().into_iter().max().unwrap();
        assert!(data.max_shard_id >= max_shard);
        assert!(data.max_shard_group_id >= 2);
    }
}
