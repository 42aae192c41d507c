//! The consensus state machine: applies committed commands to the metadata
//! root, produces snapshots, and restores from them.

use std::io;
use std::io::{Read, Write};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use observability_deps::tracing::{debug, error};
use parking_lot::RwLock;
use prost::Message;
use tokio::sync::watch;

use chrono::{TimeZone, Utc};
use meta_proto::{Command, CommandType, Response};
use meta_types::{
    ClusterData, MetaError, RetentionPolicyInfo, RetentionPolicyUpdate,
    DEFAULT_RETENTION_POLICY_NAME, MAX_AUTO_CREATED_RETENTION_POLICY_REPLICA_N,
};

use crate::raft::{Membership, MembershipError};

/// A committed entry handed to the state machine by the consensus layer.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct FsmConfig {
    /// Synthesize a default retention policy when a database is created
    /// without one.
    pub retention_auto_create: bool,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            retention_auto_create: true,
        }
    }
}

/// Write sink for a snapshot being persisted. Implementations must discard
/// everything written so far when `cancel` is called.
pub trait SnapshotSink: Write + Send {
    fn cancel(&mut self);
}

/// Errors internal to a single apply. These become the `error` string of the
/// response envelope; they are never surfaced to the consensus layer, which
/// requires apply to succeed.
#[derive(Debug, thiserror::Error)]
enum ApplyError {
    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error("removing meta node from consensus: {0}")]
    Membership(String),
}

/// The finite state machine. Holds the current [`ClusterData`] behind a
/// single write lock; every apply installs a fresh copy and signals the
/// change watchers with the new index.
#[derive(Debug)]
pub struct Fsm {
    data: RwLock<Arc<ClusterData>>,
    changed: watch::Sender<u64>,
    config: FsmConfig,
    /// Callback into the consensus layer for `DeleteMetaNode`, set once the
    /// surrounding store is wired up. Weak: the raft node owns the FSM.
    membership: RwLock<Option<Weak<dyn Membership>>>,
}

impl Fsm {
    pub fn new(config: FsmConfig) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            data: RwLock::new(Arc::new(ClusterData::default())),
            changed,
            config,
            membership: RwLock::new(None),
        }
    }

    /// Current data root. Never blocks on appliers for longer than the
    /// pointer swap.
    pub fn data(&self) -> Arc<ClusterData> {
        Arc::clone(&self.data.read())
    }

    /// Watch applied indexes. The receiver immediately observes the latest
    /// value; every waiter present before an apply completes is woken by it.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    pub fn set_membership(&self, membership: Weak<dyn Membership>) {
        *self.membership.write() = Some(membership);
    }

    /// Apply a committed entry.
    ///
    /// Command failures are deterministic rejections and are reported in the
    /// returned envelope, not to the consensus layer. An entry that cannot
    /// be decoded, or carries an unknown command type, aborts the process:
    /// skipping it would silently diverge this replica.
    pub fn apply(&self, entry: &LogEntry) -> Response {
        let cmd = match Command::decode(entry.data.clone()) {
            Ok(cmd) => cmd,
            Err(e) => panic!(
                "cannot decode committed command at index {}: {e}",
                entry.index
            ),
        };
        let cmd_type = cmd.r#type();

        let mut data = self.data.write();
        let current = Arc::clone(&data);

        let (next, error) = match self.apply_command(&current, cmd_type, &cmd) {
            Ok(next) => (next, String::new()),
            Err(e) => {
                debug!(%e, ?cmd_type, index = entry.index, "command rejected");
                // discard any partial mutation; only the log coordinates move
                (ClusterData::clone(&current), e.to_string())
            }
        };

        let mut next = next;
        next.index = entry.index;
        next.term = entry.term;
        *data = Arc::new(next);
        drop(data);

        // Edge-triggered broadcast: wakes every long-poller exactly once per
        // applied command.
        self.changed.send_replace(entry.index);

        Response {
            index: entry.index,
            error,
        }
    }

    fn apply_command(
        &self,
        data: &ClusterData,
        cmd_type: CommandType,
        cmd: &Command,
    ) -> Result<ClusterData, ApplyError> {
        match cmd_type {
            CommandType::CreateDatabase => self.apply_create_database(data, decode(cmd)),
            CommandType::DropDatabase => {
                let v: meta_proto::DropDatabaseCommand = decode(cmd);
                mutate(data, |d| d.drop_database(&v.name))
            }
            CommandType::CreateRetentionPolicy => {
                let v: meta_proto::CreateRetentionPolicyCommand = decode(cmd);
                let rpi = decode_retention_policy(&v.retention_policy);
                mutate(data, |d| d.create_retention_policy(&v.database, rpi))
            }
            CommandType::DropRetentionPolicy => {
                let v: meta_proto::DropRetentionPolicyCommand = decode(cmd);
                mutate(data, |d| d.drop_retention_policy(&v.database, &v.name))
            }
            CommandType::SetDefaultRetentionPolicy => {
                let v: meta_proto::SetDefaultRetentionPolicyCommand = decode(cmd);
                mutate(data, |d| d.set_default_retention_policy(&v.database, &v.name))
            }
            CommandType::UpdateRetentionPolicy => {
                let v: meta_proto::UpdateRetentionPolicyCommand = decode(cmd);
                let update = RetentionPolicyUpdate {
                    name: v.new_name,
                    duration: v.duration.map(|n| std::time::Duration::from_nanos(n.max(0) as u64)),
                    replica_n: v.replica_n.map(|n| n as usize),
                };
                mutate(data, |d| d.update_retention_policy(&v.database, &v.name, update))
            }
            CommandType::CreateShardGroup => {
                let v: meta_proto::CreateShardGroupCommand = decode(cmd);
                let timestamp = Utc.timestamp_nanos(v.timestamp);
                mutate(data, |d| d.create_shard_group(&v.database, &v.policy, timestamp))
            }
            CommandType::DeleteShardGroup => {
                let v: meta_proto::DeleteShardGroupCommand = decode(cmd);
                mutate(data, |d| {
                    d.delete_shard_group(&v.database, &v.policy, v.shard_group_id)
                })
            }
            CommandType::CreateContinuousQuery => {
                let v: meta_proto::CreateContinuousQueryCommand = decode(cmd);
                mutate(data, |d| {
                    d.create_continuous_query(&v.database, &v.name, &v.query)
                })
            }
            CommandType::DropContinuousQuery => {
                let v: meta_proto::DropContinuousQueryCommand = decode(cmd);
                mutate(data, |d| d.drop_continuous_query(&v.database, &v.name))
            }
            CommandType::CreateSubscription => {
                let v: meta_proto::CreateSubscriptionCommand = decode(cmd);
                mutate(data, |d| {
                    d.create_subscription(
                        &v.database,
                        &v.retention_policy,
                        &v.name,
                        &v.mode,
                        v.destinations.clone(),
                    )
                })
            }
            CommandType::DropSubscription => {
                let v: meta_proto::DropSubscriptionCommand = decode(cmd);
                mutate(data, |d| {
                    d.drop_subscription(&v.database, &v.retention_policy, &v.name)
                })
            }
            CommandType::CreateUser => {
                let v: meta_proto::CreateUserCommand = decode(cmd);
                mutate(data, |d| d.create_user(&v.name, &v.hash, v.admin))
            }
            CommandType::DropUser => {
                let v: meta_proto::DropUserCommand = decode(cmd);
                mutate(data, |d| d.drop_user(&v.name))
            }
            CommandType::UpdateUser => {
                let v: meta_proto::UpdateUserCommand = decode(cmd);
                mutate(data, |d| d.update_user(&v.name, &v.hash))
            }
            CommandType::SetPrivilege => {
                let v: meta_proto::SetPrivilegeCommand = decode(cmd);
                let privilege = meta_types::Privilege::from_i32(v.privilege);
                mutate(data, |d| d.set_privilege(&v.username, &v.database, privilege))
            }
            CommandType::SetAdminPrivilege => {
                let v: meta_proto::SetAdminPrivilegeCommand = decode(cmd);
                mutate(data, |d| d.set_admin_privilege(&v.username, v.admin))
            }
            CommandType::SetData => {
                let v: meta_proto::SetDataCommand = decode(cmd);
                // wholesale overwrite, used for bulk restore
                match ClusterData::unmarshal_binary(&v.data) {
                    Ok(other) => Ok(other),
                    Err(e) => panic!("cannot decode committed SetData payload: {e}"),
                }
            }
            CommandType::CreateMetaNode => {
                let v: meta_proto::CreateMetaNodeCommand = decode(cmd);
                let mut other = ClusterData::clone(data);
                other.create_meta_node(&v.http_addr, &v.tcp_addr)?;
                if other.cluster_id == 0 {
                    other.cluster_id = v.rand;
                }
                Ok(other)
            }
            CommandType::SetMetaNode => {
                let v: meta_proto::SetMetaNodeCommand = decode(cmd);
                let mut other = ClusterData::clone(data);
                if other.cluster_id == 0 {
                    other.cluster_id = v.rand;
                }
                let id = other.max_node_id + 1;
                other.set_meta_node(id, &v.http_addr, &v.tcp_addr)?;
                Ok(other)
            }
            CommandType::DeleteMetaNode => self.apply_delete_meta_node(data, decode(cmd)),
            CommandType::CreateDataNode => {
                let v: meta_proto::CreateDataNodeCommand = decode(cmd);
                mutate(data, |d| d.create_data_node(&v.http_addr, &v.tcp_addr))
            }
            CommandType::UpdateDataNode => {
                let v: meta_proto::UpdateDataNodeCommand = decode(cmd);
                mutate(data, |d| d.update_data_node(v.id, &v.host, &v.tcp_host))
            }
            CommandType::DeleteDataNode => {
                let v: meta_proto::DeleteDataNodeCommand = decode(cmd);
                mutate(data, |d| d.delete_data_node(v.id))
            }
            CommandType::AddShardOwner => {
                let v: meta_proto::AddShardOwnerCommand = decode(cmd);
                mutate(data, |d| d.add_shard_owner(v.id, v.node_id))
            }
            CommandType::RemoveShardOwner => {
                let v: meta_proto::RemoveShardOwnerCommand = decode(cmd);
                mutate(data, |d| d.remove_shard_owner(v.id, v.node_id))
            }
            CommandType::AddPendingShardOwner => {
                let v: meta_proto::AddPendingShardOwnerCommand = decode(cmd);
                mutate(data, |d| d.add_pending_shard_owner(v.id, v.node_id))
            }
            CommandType::RemovePendingShardOwner => {
                let v: meta_proto::RemovePendingShardOwnerCommand = decode(cmd);
                mutate(data, |d| d.remove_pending_shard_owner(v.id, v.node_id))
            }
            CommandType::CommitPendingShardOwner => {
                let v: meta_proto::CommitPendingShardOwnerCommand = decode(cmd);
                mutate(data, |d| d.commit_pending_shard_owner(v.id, v.node_id))
            }
            CommandType::Unknown => {
                panic!("cannot apply command: unknown command type")
            }
        }
    }

    fn apply_create_database(
        &self,
        data: &ClusterData,
        v: meta_proto::CreateDatabaseCommand,
    ) -> Result<ClusterData, ApplyError> {
        let mut other = ClusterData::clone(data);
        other.create_database(&v.name)?;

        if !v.retention_policy.is_empty() {
            let rpi = decode_retention_policy(&v.retention_policy);
            match other.create_retention_policy(&v.name, rpi) {
                // the embedded policy clashing with an existing one is a
                // conflict, not a bare "exists"
                Err(MetaError::RetentionPolicyExists) => {
                    return Err(MetaError::RetentionPolicyConflict.into())
                }
                other => other?,
            }
        } else if self.config.retention_auto_create {
            let mut rpi = RetentionPolicyInfo::new(DEFAULT_RETENTION_POLICY_NAME);
            rpi.replica_n = other
                .data_nodes
                .len()
                .clamp(1, MAX_AUTO_CREATED_RETENTION_POLICY_REPLICA_N);
            other.create_retention_policy(&v.name, rpi)?;
        }

        Ok(other)
    }

    fn apply_delete_meta_node(
        &self,
        data: &ClusterData,
        v: meta_proto::DeleteMetaNodeCommand,
    ) -> Result<ClusterData, ApplyError> {
        let mut other = ClusterData::clone(data);
        let tcp_host = other
            .meta_node(v.id)
            .map(|n| n.tcp_host.clone())
            .ok_or(MetaError::NodeNotFound)?;

        // Ask the consensus layer to drop the node first; only the leader
        // can, and that is fine: every replica applies this entry but only
        // one membership change is needed.
        let membership = self.membership.read().clone();
        if let Some(membership) = membership.and_then(|m| m.upgrade()) {
            match membership.remove_server(&tcp_host) {
                Ok(()) | Err(MembershipError::NotLeader) => {}
                Err(MembershipError::Internal(e)) => return Err(ApplyError::Membership(e)),
            }
        }

        other.delete_meta_node(v.id)?;
        Ok(other)
    }

    /// Take a snapshot of the current data. Cheap: the data is immutable
    /// once installed, so the handle just pins the current root.
    pub fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot { data: self.data() }
    }

    /// Replace the current data with a serialized snapshot. The consensus
    /// layer guarantees no concurrent apply.
    pub fn restore(&self, reader: &mut dyn Read) -> io::Result<()> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;

        let data = ClusterData::unmarshal_binary(&buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let index = data.index;

        *self.data.write() = Arc::new(data);
        self.changed.send_replace(index);
        Ok(())
    }
}

/// A pinned, immutable view of the data at snapshot time.
#[derive(Debug)]
pub struct FsmSnapshot {
    data: Arc<ClusterData>,
}

impl FsmSnapshot {
    pub fn data(&self) -> &ClusterData {
        &self.data
    }

    /// Serialize the snapshot into `sink`; the sink is cancelled on any
    /// failure so a partial snapshot is never left behind.
    pub fn persist(&self, sink: &mut dyn SnapshotSink) -> io::Result<()> {
        let result = sink
            .write_all(&self.data.marshal_binary())
            .and_then(|()| sink.flush());
        if let Err(e) = result {
            error!(%e, "snapshot persist failed, cancelling sink");
            sink.cancel();
            return Err(e);
        }
        Ok(())
    }
}

fn decode<M: Message + Default>(cmd: &Command) -> M {
    match M::decode(cmd.payload.clone()) {
        Ok(v) => v,
        Err(e) => panic!("cannot decode committed command payload: {e}"),
    }
}

fn decode_retention_policy(buf: &[u8]) -> RetentionPolicyInfo {
    match RetentionPolicyInfo::unmarshal_binary(buf) {
        Ok(rpi) => rpi,
        Err(e) => panic!("cannot decode committed retention policy payload: {e}"),
    }
}

/// Clone-mutate-install helper for the common case where a command maps to a
/// single data-model mutator.
fn mutate(
    data: &ClusterData,
    f: impl FnOnce(&mut ClusterData) -> Result<(), MetaError>,
) -> Result<ClusterData, ApplyError> {
    let mut other = ClusterData::clone(data);
    f(&mut other)?;
    Ok(other)
}
