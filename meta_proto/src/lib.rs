//! Protobuf wire types for the cluster metadata service.
//!
//! These are maintained by hand rather than generated: the schema is small,
//! has exactly one consumer, and changes in lockstep with the data model.
//! The field tags are the contract; do not renumber them. New fields must use
//! fresh tags so that old peers skip them (prost ignores unknown fields on
//! decode, which is what allows rolling upgrades of meta nodes).

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::use_self, clippy::clone_on_ref_ptr)]

use bytes::{Bytes, BytesMut};
use prost::Message;

/// The tagged union of every mutation the state machine understands.
///
/// `payload` holds the encoded kind-specific message for `r#type`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(enumeration = "CommandType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CommandType {
    Unknown = 0,
    CreateDatabase = 1,
    DropDatabase = 2,
    CreateRetentionPolicy = 3,
    DropRetentionPolicy = 4,
    SetDefaultRetentionPolicy = 5,
    UpdateRetentionPolicy = 6,
    CreateShardGroup = 7,
    DeleteShardGroup = 8,
    CreateContinuousQuery = 9,
    DropContinuousQuery = 10,
    CreateSubscription = 11,
    DropSubscription = 12,
    CreateUser = 13,
    DropUser = 14,
    UpdateUser = 15,
    SetPrivilege = 16,
    SetAdminPrivilege = 17,
    SetData = 18,
    CreateMetaNode = 19,
    DeleteMetaNode = 20,
    SetMetaNode = 21,
    CreateDataNode = 22,
    UpdateDataNode = 23,
    DeleteDataNode = 24,
    AddShardOwner = 25,
    RemoveShardOwner = 26,
    AddPendingShardOwner = 27,
    RemovePendingShardOwner = 28,
    CommitPendingShardOwner = 29,
}

/// Response envelope for an applied command. An empty `error` means success,
/// in which case `index` is the log index the command was applied at.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(string, tag = "2")]
    pub error: String,
}

// ---------------------------------------------------------------------------
// Command payloads
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateDatabaseCommand {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Optional embedded [`RetentionPolicyInfo`]; empty means "no policy"
    /// (the state machine may then synthesize one).
    #[prost(bytes = "bytes", tag = "2")]
    pub retention_policy: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DropDatabaseCommand {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateRetentionPolicyCommand {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub retention_policy: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DropRetentionPolicyCommand {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetDefaultRetentionPolicyCommand {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateRetentionPolicyCommand {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, tag = "2")]
    pub name: String,
    /// Absent or empty means "leave the name unchanged".
    #[prost(string, optional, tag = "3")]
    pub new_name: Option<String>,
    /// Nanoseconds; absent means "leave unchanged".
    #[prost(int64, optional, tag = "4")]
    pub duration: Option<i64>,
    #[prost(uint32, optional, tag = "5")]
    pub replica_n: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateShardGroupCommand {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, tag = "2")]
    pub policy: String,
    /// Nanoseconds since the epoch; the only wall-clock input to the FSM.
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteShardGroupCommand {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, tag = "2")]
    pub policy: String,
    #[prost(uint64, tag = "3")]
    pub shard_group_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateContinuousQueryCommand {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub query: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DropContinuousQueryCommand {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateSubscriptionCommand {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, tag = "2")]
    pub retention_policy: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub mode: String,
    #[prost(string, repeated, tag = "5")]
    pub destinations: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DropSubscriptionCommand {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, tag = "2")]
    pub retention_policy: String,
    #[prost(string, tag = "3")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateUserCommand {
    #[prost(string, tag = "1")]
    pub name: String,
    /// bcrypt hash, never the cleartext password.
    #[prost(string, tag = "2")]
    pub hash: String,
    #[prost(bool, tag = "3")]
    pub admin: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DropUserCommand {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateUserCommand {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub hash: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetPrivilegeCommand {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub database: String,
    #[prost(int32, tag = "3")]
    pub privilege: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetAdminPrivilegeCommand {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(bool, tag = "2")]
    pub admin: bool,
}

/// Bulk restore: the payload replaces the entire data root.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetDataCommand {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateMetaNodeCommand {
    #[prost(string, tag = "1")]
    pub http_addr: String,
    #[prost(string, tag = "2")]
    pub tcp_addr: String,
    /// Random nonce adopted as the cluster ID while it is still zero.
    #[prost(uint64, tag = "3")]
    pub rand: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteMetaNodeCommand {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetMetaNodeCommand {
    #[prost(string, tag = "1")]
    pub http_addr: String,
    #[prost(string, tag = "2")]
    pub tcp_addr: String,
    #[prost(uint64, tag = "3")]
    pub rand: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateDataNodeCommand {
    #[prost(string, tag = "1")]
    pub http_addr: String,
    #[prost(string, tag = "2")]
    pub tcp_addr: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateDataNodeCommand {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub host: String,
    #[prost(string, tag = "3")]
    pub tcp_host: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteDataNodeCommand {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddShardOwnerCommand {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveShardOwnerCommand {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddPendingShardOwnerCommand {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemovePendingShardOwnerCommand {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitPendingShardOwnerCommand {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub node_id: u64,
}

// ---------------------------------------------------------------------------
// Cluster data
// ---------------------------------------------------------------------------

/// Outer snapshot envelope. `data` is the encoded [`Data`] blob so that the
/// node and user lists can evolve independently of the schema tree.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterData {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
    #[prost(message, repeated, tag = "2")]
    pub meta_nodes: Vec<NodeInfo>,
    #[prost(message, repeated, tag = "3")]
    pub data_nodes: Vec<NodeInfo>,
    #[prost(message, repeated, tag = "4")]
    pub users: Vec<UserInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(uint64, tag = "3")]
    pub cluster_id: u64,
    #[prost(uint64, tag = "4")]
    pub max_node_id: u64,
    #[prost(uint64, tag = "5")]
    pub max_shard_group_id: u64,
    #[prost(uint64, tag = "6")]
    pub max_shard_id: u64,
    #[prost(message, repeated, tag = "7")]
    pub databases: Vec<DatabaseInfo>,
    #[prost(message, repeated, tag = "8")]
    pub users: Vec<UserInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub host: String,
    #[prost(string, tag = "3")]
    pub tcp_host: String,
    #[prost(uint64, repeated, tag = "4")]
    pub pending_shard_owners: Vec<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DatabaseInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub default_retention_policy: String,
    #[prost(message, repeated, tag = "3")]
    pub retention_policies: Vec<RetentionPolicyInfo>,
    #[prost(message, repeated, tag = "4")]
    pub continuous_queries: Vec<ContinuousQueryInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetentionPolicyInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Nanoseconds; zero means "keep forever".
    #[prost(int64, tag = "2")]
    pub duration: i64,
    #[prost(int64, tag = "3")]
    pub shard_group_duration: i64,
    #[prost(uint32, tag = "4")]
    pub replica_n: u32,
    #[prost(message, repeated, tag = "5")]
    pub shard_groups: Vec<ShardGroupInfo>,
    #[prost(message, repeated, tag = "6")]
    pub subscriptions: Vec<SubscriptionInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardGroupInfo {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Nanoseconds since the epoch.
    #[prost(int64, tag = "2")]
    pub start_time: i64,
    #[prost(int64, tag = "3")]
    pub end_time: i64,
    /// Zero means "not deleted".
    #[prost(int64, tag = "4")]
    pub deleted_at: i64,
    #[prost(message, repeated, tag = "5")]
    pub shards: Vec<ShardInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardInfo {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(message, repeated, tag = "2")]
    pub owners: Vec<ShardOwner>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardOwner {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContinuousQueryInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub query: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub mode: String,
    #[prost(string, repeated, tag = "3")]
    pub destinations: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub hash: String,
    #[prost(bool, tag = "3")]
    pub admin: bool,
    #[prost(message, repeated, tag = "4")]
    pub privileges: Vec<UserPrivilege>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserPrivilege {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(int32, tag = "2")]
    pub privilege: i32,
}

/// Encode `message` to a freshly allocated buffer.
pub fn encode<M: Message>(message: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(message.encoded_len());
    message
        .encode(&mut buf)
        .expect("BytesMut grows on demand, encoding is infallible");
    buf.freeze()
}

/// Build a [`Command`] envelope around an encoded payload.
pub fn command<M: Message>(r#type: CommandType, payload: &M) -> Command {
    Command {
        r#type: r#type as i32,
        payload: encode(payload),
    }
}
