//! Client library for the cluster metadata service.
//!
//! A [`MetaClient`] keeps a local copy of the latest [`ClusterData`] and
//! drives every mutation through the meta servers' `/execute` endpoint,
//! following leader redirects and retrying transport failures. A background
//! task long-polls `/snapshot` so the local copy tracks the replicated
//! state; after a successful write the client waits until its own copy has
//! caught up with the write's index, so reads through the same client are
//! never older than its writes.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod auth;
mod persist;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::RwLock;
use prost::Message;
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use meta_proto::CommandType;
use meta_types::{
    ClusterData, DatabaseInfo, Lease, MetaError, NodeInfo, Privilege, RetentionPolicyInfo,
    RetentionPolicyUpdate, ShardGroupInfo, ShardInfo, UserInfo,
    MAX_AUTO_CREATED_RETENTION_POLICY_REPLICA_N, MIN_RETENTION_POLICY_DURATION,
};

use crate::auth::{hash_with_salt, salted_hash, AuthUser};

/// Time to sleep after failing on every meta server before another pass.
const ERR_SLEEP: Duration = Duration::from_secs(1);

/// Maximum number of non-redirect failures before giving up on a command.
const MAX_RETRIES: usize = 10;

/// Deadline for a single `/execute` round-trip.
const EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a single `/snapshot` long-poll; must exceed the server's
/// wait cap.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum Error {
    /// The service is unreachable, leaderless, or this client was closed.
    #[error("meta service unavailable")]
    ServiceUnavailable,

    /// Generic upstream failure after exhausting retries.
    #[error("meta service error: {0}")]
    Service(String),

    /// A typed semantic rejection, either from the state machine or from a
    /// local validation.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// A semantic rejection whose text we do not recognize.
    #[error("{0}")]
    Command(String),

    /// The leader refused the lease: another node holds it.
    #[error("another node owns the lease")]
    LeaseContested,

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What a fresh client needs to know.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Initial meta server HTTP addresses (`host:port`).
    pub meta_servers: Vec<String>,
    /// Directory holding the persisted server list (`meta.db`); `None`
    /// disables persistence.
    pub dir: Option<PathBuf>,
    /// This node's own HTTP bind address, dropped from the persisted list on
    /// `leave`.
    pub bind_address: Option<String>,
    /// Use HTTPS when talking to the meta servers.
    pub tls: bool,
}

#[derive(Debug)]
struct ClientState {
    cache: Arc<ClusterData>,
    servers: Vec<String>,
    auth_cache: HashMap<String, AuthUser>,
}

/// A connected consumer of the meta service.
#[derive(Debug)]
pub struct MetaClient {
    state: RwLock<ClientState>,
    changed: watch::Sender<u64>,
    closing: CancellationToken,
    http: reqwest::Client,
    config: ClientConfig,
    node_id: AtomicU64,
}

impl MetaClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        // Redirects carry leadership information; the retry loop follows
        // them itself.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("default reqwest client builds");

        Arc::new(Self {
            state: RwLock::new(ClientState {
                cache: Arc::new(ClusterData::default()),
                servers: config.meta_servers.clone(),
                auth_cache: HashMap::new(),
            }),
            changed,
            closing: CancellationToken::new(),
            http,
            config,
            node_id: AtomicU64::new(0),
        })
    }

    /// Load the persisted server list, fetch an initial snapshot, and start
    /// the background poll loop.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        if self.closed() {
            return Err(Error::ServiceUnavailable);
        }

        if let Some(dir) = &self.config.dir {
            if let Some(servers) = persist::load_meta_servers(dir)? {
                info!(?servers, "loaded persisted meta servers");
                self.state.write().servers = servers;
            }
        }

        if self.meta_servers().is_empty() {
            return Err(Error::ServiceUnavailable);
        }

        let data = self
            .retry_until_snapshot(0)
            .await
            .ok_or(Error::ServiceUnavailable)?;
        {
            let mut state = self.state.write();
            let index = data.index;
            state.cache = Arc::new(data);
            self.changed.send_replace(index);
        }
        self.save_meta_servers()?;

        let client = Arc::clone(self);
        tokio::spawn(async move { client.poll_for_updates().await });

        Ok(())
    }

    /// Signal shutdown: the poll loop and any in-flight retry loops return
    /// at their next iteration.
    pub fn close(&self) {
        self.closing.cancel();
    }

    fn closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    fn scheme(&self) -> &'static str {
        if self.config.tls {
            "https"
        } else {
            "http"
        }
    }

    // -----------------------------------------------------------------------
    // Cached data access
    // -----------------------------------------------------------------------

    /// The latest locally cached data.
    pub fn data(&self) -> Arc<ClusterData> {
        Arc::clone(&self.state.read().cache)
    }

    fn index(&self) -> u64 {
        self.data().index
    }

    pub fn meta_servers(&self) -> Vec<String> {
        self.state.read().servers.clone()
    }

    pub fn set_meta_servers(&self, servers: Vec<String>) {
        self.state.write().servers = servers;
    }

    /// Resolves when the cached data next changes.
    pub async fn wait_for_data_changed(&self) {
        let mut rx = self.changed.subscribe();
        let _ = rx.changed().await;
    }

    /// Block until the local cache has caught up with `index`.
    pub async fn wait_for_index(&self, index: u64) {
        let mut rx = self.changed.subscribe();
        loop {
            if self.index() >= index {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn cluster_id(&self) -> u64 {
        self.data().cluster_id
    }

    /// This node's ID, recorded when it registered itself.
    pub fn node_id(&self) -> u64 {
        self.node_id.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    pub fn database(&self, name: &str) -> Option<DatabaseInfo> {
        self.data().database(name).cloned()
    }

    pub fn databases(&self) -> Vec<DatabaseInfo> {
        self.data().databases.clone()
    }

    pub fn retention_policy(&self, database: &str, name: &str) -> Result<Option<RetentionPolicyInfo>> {
        Ok(self.data().retention_policy(database, name)?.cloned())
    }

    pub fn data_nodes(&self) -> Vec<NodeInfo> {
        self.data().data_nodes.clone()
    }

    pub fn meta_nodes(&self) -> Vec<NodeInfo> {
        self.data().meta_nodes.clone()
    }

    pub fn data_node(&self, id: u64) -> Result<NodeInfo> {
        self.data()
            .data_node(id)
            .cloned()
            .ok_or(MetaError::NodeNotFound.into())
    }

    pub fn data_node_by_tcp_host(&self, tcp_host: &str) -> Result<NodeInfo> {
        self.data()
            .data_node_by_tcp_host(tcp_host)
            .cloned()
            .ok_or(MetaError::NodeNotFound.into())
    }

    pub fn data_node_by_http_host(&self, host: &str) -> Result<NodeInfo> {
        self.data()
            .data_node_by_http_host(host)
            .cloned()
            .ok_or(MetaError::NodeNotFound.into())
    }

    pub fn meta_node_by_addr(&self, addr: &str) -> Option<NodeInfo> {
        self.data().meta_node_by_host(addr).cloned()
    }

    pub fn user(&self, name: &str) -> Result<UserInfo> {
        self.data()
            .user(name)
            .cloned()
            .ok_or(MetaError::UserNotFound.into())
    }

    pub fn users(&self) -> Vec<UserInfo> {
        self.data().users.clone()
    }

    pub fn user_count(&self) -> usize {
        self.data().users.len()
    }

    pub fn admin_user_exists(&self) -> bool {
        self.data().users.iter().any(|u| u.admin)
    }

    pub fn user_privileges(&self, username: &str) -> Result<HashMap<String, Privilege>> {
        let data = self.data();
        let privileges = data.user_privileges(username)?;
        Ok(privileges
            .iter()
            .map(|(db, p)| (db.clone(), *p))
            .collect())
    }

    pub fn user_privilege(&self, username: &str, database: &str) -> Result<Privilege> {
        Ok(self.data().user_privilege(username, database)?)
    }

    pub fn shard_ids(&self) -> Vec<u64> {
        self.data().shard_ids()
    }

    /// Shard IDs queued for hand-off to this node.
    pub fn shard_pending_owners(&self) -> Vec<u64> {
        let node_id = self.node_id();
        self.data()
            .meta_nodes
            .iter()
            .find(|n| n.id == node_id)
            .map(|n| n.pending_shard_owners.clone())
            .unwrap_or_default()
    }

    /// The owning database, policy, and group of a shard.
    pub fn shard_owner(&self, shard_id: u64) -> Option<(String, String, ShardGroupInfo)> {
        let data = self.data();
        for db in &data.databases {
            for rp in &db.retention_policies {
                for sg in &rp.shard_groups {
                    if sg.deleted() {
                        continue;
                    }
                    if sg.shard(shard_id).is_some() {
                        return Some((db.name.clone(), rp.name.clone(), sg.clone()));
                    }
                }
            }
        }
        None
    }

    /// Non-deleted shard groups of a policy that may hold data in
    /// `[min, max]`, sorted by start time.
    pub fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<ShardGroupInfo>> {
        let data = self.data();
        let rp = data
            .retention_policy(database, policy)?
            .ok_or(MetaError::RetentionPolicyNotFound)?;
        Ok(rp
            .shard_groups
            .iter()
            .filter(|sg| !sg.deleted() && sg.overlaps(min, max))
            .cloned()
            .collect())
    }

    /// Distinct shards of the given database/policy pairs that may hold data
    /// in the time range.
    pub fn shards_by_time_range(
        &self,
        sources: &[(&str, &str)],
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<ShardInfo>> {
        let mut seen = HashSet::new();
        let mut shards = Vec::new();
        for (database, policy) in sources {
            for group in self.shard_groups_by_time_range(database, policy, min, max)? {
                for shard in group.shards {
                    if seen.insert(shard.id) {
                        shards.push(shard);
                    }
                }
            }
        }
        Ok(shards)
    }

    // -----------------------------------------------------------------------
    // Mutators
    // -----------------------------------------------------------------------

    /// Create a database, or return it as-is when it already exists.
    /// Whether it gets a default retention policy is the server's call
    /// (`retention_auto_create`).
    pub async fn create_database(&self, name: &str) -> Result<DatabaseInfo> {
        if let Some(db) = self.database(name) {
            return Ok(db);
        }

        self.retry_until_exec(
            CommandType::CreateDatabase,
            &meta_proto::CreateDatabaseCommand {
                name: name.to_string(),
                retention_policy: Bytes::new(),
            },
        )
        .await?;

        self.database(name).ok_or(MetaError::DatabaseNotFound.into())
    }

    /// Create a database with the given retention policy embedded in the
    /// same command.
    pub async fn create_database_with_retention_policy(
        &self,
        name: &str,
        rpi: RetentionPolicyInfo,
    ) -> Result<DatabaseInfo> {
        if rpi.duration != Duration::ZERO && rpi.duration < MIN_RETENTION_POLICY_DURATION {
            return Err(MetaError::RetentionPolicyDurationTooLow.into());
        }

        self.retry_until_exec(
            CommandType::CreateDatabase,
            &meta_proto::CreateDatabaseCommand {
                name: name.to_string(),
                retention_policy: rpi.marshal_binary(),
            },
        )
        .await?;

        self.database(name).ok_or(MetaError::DatabaseNotFound.into())
    }

    pub async fn drop_database(&self, name: &str) -> Result<()> {
        self.retry_until_exec(
            CommandType::DropDatabase,
            &meta_proto::DropDatabaseCommand {
                name: name.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// A retention policy sized for the current cluster: fully replicated up
    /// to the auto-replication cap.
    pub fn default_retention_policy_info(&self, name: &str, duration: Duration) -> RetentionPolicyInfo {
        let mut rpi = RetentionPolicyInfo::new(name);
        rpi.duration = duration;
        rpi.replica_n = self
            .data()
            .data_nodes
            .len()
            .clamp(1, MAX_AUTO_CREATED_RETENTION_POLICY_REPLICA_N);
        rpi
    }

    pub async fn create_retention_policy(
        &self,
        database: &str,
        rpi: RetentionPolicyInfo,
    ) -> Result<RetentionPolicyInfo> {
        if let Ok(Some(rp)) = self.retention_policy(database, &rpi.name) {
            return Ok(rp);
        }
        if rpi.duration != Duration::ZERO && rpi.duration < MIN_RETENTION_POLICY_DURATION {
            return Err(MetaError::RetentionPolicyDurationTooLow.into());
        }

        let name = rpi.name.clone();
        self.retry_until_exec(
            CommandType::CreateRetentionPolicy,
            &meta_proto::CreateRetentionPolicyCommand {
                database: database.to_string(),
                retention_policy: rpi.marshal_binary(),
            },
        )
        .await?;

        self.retention_policy(database, &name)?
            .ok_or(MetaError::RetentionPolicyNotFound.into())
    }

    pub async fn drop_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        self.retry_until_exec(
            CommandType::DropRetentionPolicy,
            &meta_proto::DropRetentionPolicyCommand {
                database: database.to_string(),
                name: name.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn set_default_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        self.retry_until_exec(
            CommandType::SetDefaultRetentionPolicy,
            &meta_proto::SetDefaultRetentionPolicyCommand {
                database: database.to_string(),
                name: name.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        update: RetentionPolicyUpdate,
    ) -> Result<()> {
        self.retry_until_exec(
            CommandType::UpdateRetentionPolicy,
            &meta_proto::UpdateRetentionPolicyCommand {
                database: database.to_string(),
                name: name.to_string(),
                new_name: update.name,
                duration: update
                    .duration
                    .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)),
                replica_n: update.replica_n.map(|n| n as u32),
            },
        )
        .await?;
        Ok(())
    }

    /// Create the shard group covering `timestamp`, or return the existing
    /// one.
    pub async fn create_shard_group(
        &self,
        database: &str,
        policy: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ShardGroupInfo>> {
        // the local cache may be stale; a miss here just means we pay the
        // consensus round-trip
        if let Ok(Some(rp)) = self.data().retention_policy(database, policy) {
            if let Some(sg) = rp.shard_group_by_timestamp(timestamp) {
                return Ok(Some(sg.clone()));
            }
        }

        self.retry_until_exec(
            CommandType::CreateShardGroup,
            &meta_proto::CreateShardGroupCommand {
                database: database.to_string(),
                policy: policy.to_string(),
                timestamp: timestamp
                    .timestamp_nanos_opt()
                    .expect("timestamp representable as nanoseconds"),
            },
        )
        .await?;

        let data = self.data();
        let rp = data
            .retention_policy(database, policy)?
            .ok_or(MetaError::RetentionPolicyNotFound)?;
        Ok(rp.shard_group_by_timestamp(timestamp).cloned())
    }

    pub async fn delete_shard_group(&self, database: &str, policy: &str, id: u64) -> Result<()> {
        self.retry_until_exec(
            CommandType::DeleteShardGroup,
            &meta_proto::DeleteShardGroupCommand {
                database: database.to_string(),
                policy: policy.to_string(),
                shard_group_id: id,
            },
        )
        .await?;
        Ok(())
    }

    /// Create successor shard groups for policies whose newest group ends
    /// inside `(from, to)`, so write-time never has to pay the consensus
    /// round-trip.
    pub async fn precreate_shard_groups(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<()> {
        let data = self.data();
        for db in &data.databases {
            for rp in &db.retention_policies {
                let Some(group) = rp.shard_groups.last() else {
                    // no data was ever written to this policy
                    continue;
                };
                if group.deleted() || group.end_time >= to || group.end_time <= from {
                    continue;
                }

                let next_timestamp = group.end_time + chrono::Duration::nanoseconds(1);
                match self.create_shard_group(&db.name, &rp.name, next_timestamp).await {
                    Ok(Some(new_group)) => {
                        info!(
                            group = new_group.id,
                            database = %db.name,
                            policy = %rp.name,
                            "precreated successor shard group"
                        );
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            group = group.id,
                            %e,
                            "failed to precreate successor shard group"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn create_continuous_query(&self, database: &str, name: &str, query: &str) -> Result<()> {
        self.retry_until_exec(
            CommandType::CreateContinuousQuery,
            &meta_proto::CreateContinuousQueryCommand {
                database: database.to_string(),
                name: name.to_string(),
                query: query.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn drop_continuous_query(&self, database: &str, name: &str) -> Result<()> {
        self.retry_until_exec(
            CommandType::DropContinuousQuery,
            &meta_proto::DropContinuousQueryCommand {
                database: database.to_string(),
                name: name.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn create_subscription(
        &self,
        database: &str,
        policy: &str,
        name: &str,
        mode: &str,
        destinations: Vec<String>,
    ) -> Result<()> {
        self.retry_until_exec(
            CommandType::CreateSubscription,
            &meta_proto::CreateSubscriptionCommand {
                database: database.to_string(),
                retention_policy: policy.to_string(),
                name: name.to_string(),
                mode: mode.to_string(),
                destinations,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn drop_subscription(&self, database: &str, policy: &str, name: &str) -> Result<()> {
        self.retry_until_exec(
            CommandType::DropSubscription,
            &meta_proto::DropSubscriptionCommand {
                database: database.to_string(),
                retention_policy: policy.to_string(),
                name: name.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Create a user, hashing the password with bcrypt before it leaves this
    /// process. Returns the existing user when name, password, and admin
    /// flag all match.
    pub async fn create_user(&self, name: &str, password: &str, admin: bool) -> Result<UserInfo> {
        if let Some(user) = self.data().user(name).cloned() {
            if bcrypt::verify(password, &user.hash).unwrap_or(false) && user.admin == admin {
                return Ok(user);
            }
            return Err(MetaError::UserExists.into());
        }

        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| Error::Service(e.to_string()))?;

        self.retry_until_exec(
            CommandType::CreateUser,
            &meta_proto::CreateUserCommand {
                name: name.to_string(),
                hash,
                admin,
            },
        )
        .await?;

        self.user(name)
    }

    pub async fn update_user(&self, name: &str, password: &str) -> Result<()> {
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| Error::Service(e.to_string()))?;

        self.retry_until_exec(
            CommandType::UpdateUser,
            &meta_proto::UpdateUserCommand {
                name: name.to_string(),
                hash,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn drop_user(&self, name: &str) -> Result<()> {
        self.retry_until_exec(
            CommandType::DropUser,
            &meta_proto::DropUserCommand {
                name: name.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn set_privilege(
        &self,
        username: &str,
        database: &str,
        privilege: Privilege,
    ) -> Result<()> {
        self.retry_until_exec(
            CommandType::SetPrivilege,
            &meta_proto::SetPrivilegeCommand {
                username: username.to_string(),
                database: database.to_string(),
                privilege: privilege as i32,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn set_admin_privilege(&self, username: &str, admin: bool) -> Result<()> {
        self.retry_until_exec(
            CommandType::SetAdminPrivilege,
            &meta_proto::SetAdminPrivilegeCommand {
                username: username.to_string(),
                admin,
            },
        )
        .await?;
        Ok(())
    }

    /// Authenticate a user: the salted-digest cache first, bcrypt on a miss.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<UserInfo> {
        let mut state = self.state.write();

        let user = state
            .cache
            .user(username)
            .cloned()
            .ok_or(MetaError::UserNotFound)?;

        if let Some(cached) = state.auth_cache.get(username) {
            if hash_with_salt(&cached.salt, password) == cached.hash {
                return Ok(user);
            }
            // wrong or rotated password: fall through to the full check
        }

        if !bcrypt::verify(password, &user.hash).unwrap_or(false) {
            return Err(MetaError::AuthenticationFailed.into());
        }

        let (salt, hash) = salted_hash(password);
        state.auth_cache.insert(
            username.to_string(),
            AuthUser {
                salt,
                hash,
                bhash: user.hash.clone(),
            },
        );

        Ok(user)
    }

    /// Register a data node, remembering its ID as this client's node ID.
    pub async fn create_data_node(&self, http_addr: &str, tcp_addr: &str) -> Result<NodeInfo> {
        self.retry_until_exec(
            CommandType::CreateDataNode,
            &meta_proto::CreateDataNodeCommand {
                http_addr: http_addr.to_string(),
                tcp_addr: tcp_addr.to_string(),
            },
        )
        .await?;

        let node = self.data_node_by_tcp_host(tcp_addr)?;
        self.node_id.store(node.id, Ordering::Relaxed);
        Ok(node)
    }

    pub async fn update_data_node(&self, id: u64, host: &str, tcp_host: &str) -> Result<NodeInfo> {
        self.retry_until_exec(
            CommandType::UpdateDataNode,
            &meta_proto::UpdateDataNodeCommand {
                id,
                host: host.to_string(),
                tcp_host: tcp_host.to_string(),
            },
        )
        .await?;

        self.data_node_by_tcp_host(tcp_host)
    }

    pub async fn delete_data_node(&self, id: u64) -> Result<()> {
        self.retry_until_exec(
            CommandType::DeleteDataNode,
            &meta_proto::DeleteDataNodeCommand { id },
        )
        .await?;
        Ok(())
    }

    /// Register a meta node. The random nonce seeds the cluster ID on the
    /// very first registration.
    pub async fn create_meta_node(&self, http_addr: &str, tcp_addr: &str) -> Result<NodeInfo> {
        self.retry_until_exec(
            CommandType::CreateMetaNode,
            &meta_proto::CreateMetaNodeCommand {
                http_addr: http_addr.to_string(),
                tcp_addr: tcp_addr.to_string(),
                rand: rand::thread_rng().gen(),
            },
        )
        .await?;

        let node = self
            .meta_node_by_addr(http_addr)
            .ok_or(MetaError::NodeNotFound)?;
        self.node_id.store(node.id, Ordering::Relaxed);
        Ok(node)
    }

    pub async fn delete_meta_node(&self, id: u64) -> Result<()> {
        self.retry_until_exec(
            CommandType::DeleteMetaNode,
            &meta_proto::DeleteMetaNodeCommand { id },
        )
        .await?;
        Ok(())
    }

    pub async fn add_shard_owner(&self, shard_id: u64, node_id: u64) -> Result<()> {
        self.retry_until_exec(
            CommandType::AddShardOwner,
            &meta_proto::AddShardOwnerCommand {
                id: shard_id,
                node_id,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn remove_shard_owner(&self, shard_id: u64, node_id: u64) -> Result<()> {
        self.retry_until_exec(
            CommandType::RemoveShardOwner,
            &meta_proto::RemoveShardOwnerCommand {
                id: shard_id,
                node_id,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn add_pending_shard_owner(&self, shard_id: u64, node_id: u64) -> Result<()> {
        self.retry_until_exec(
            CommandType::AddPendingShardOwner,
            &meta_proto::AddPendingShardOwnerCommand {
                id: shard_id,
                node_id,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn remove_pending_shard_owner(&self, shard_id: u64, node_id: u64) -> Result<()> {
        self.retry_until_exec(
            CommandType::RemovePendingShardOwner,
            &meta_proto::RemovePendingShardOwnerCommand {
                id: shard_id,
                node_id,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn commit_pending_shard_owner(&self, shard_id: u64, node_id: u64) -> Result<()> {
        self.retry_until_exec(
            CommandType::CommitPendingShardOwner,
            &meta_proto::CommitPendingShardOwnerCommand {
                id: shard_id,
                node_id,
            },
        )
        .await?;
        Ok(())
    }

    /// Replace the entire remote data root (bulk restore).
    pub async fn set_data(&self, data: &ClusterData) -> Result<()> {
        self.retry_until_exec(
            CommandType::SetData,
            &meta_proto::SetDataCommand {
                data: data.marshal_binary(),
            },
        )
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cluster membership and liveness
    // -----------------------------------------------------------------------

    /// Add this node to the consensus peers. Loops over the known servers,
    /// following redirects, until a leader accepts.
    pub async fn join_meta_server(&self, http_addr: &str, tcp_addr: &str) -> Result<NodeInfo> {
        let body = serde_json::to_vec(&serde_json::json!({
            "host": http_addr,
            "tcp_host": tcp_addr,
        }))?;

        let mut current_server = 0;
        let mut redirect_server: Option<String> = None;

        loop {
            if self.closed() {
                return Err(Error::ServiceUnavailable);
            }

            let url = match redirect_server.take() {
                Some(url) => url,
                None => {
                    let servers = self.meta_servers();
                    if servers.is_empty() {
                        tokio::time::sleep(ERR_SLEEP).await;
                        continue;
                    }
                    if current_server >= servers.len() {
                        // tried every server; wait before the next pass
                        tokio::time::sleep(ERR_SLEEP).await;
                        current_server = 0;
                    }
                    format!("{}://{}/join", self.scheme(), &servers[current_server])
                }
            };

            let response = self
                .http
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .timeout(EXEC_TIMEOUT)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(_) => {
                    current_server += 1;
                    continue;
                }
            };

            match response.status() {
                reqwest::StatusCode::OK => {
                    let node: NodeInfo = response.json().await.map_err(|e| Error::Service(e.to_string()))?;
                    return Ok(node);
                }
                reqwest::StatusCode::TEMPORARY_REDIRECT => {
                    redirect_server = response
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|l| l.to_str().ok())
                        .map(ToString::to_string);
                }
                _ => {
                    current_server += 1;
                }
            }
        }
    }

    /// Acquire a named advisory lease, backing off exponentially while the
    /// service is unavailable.
    pub async fn acquire_lease(&self, name: &str) -> Result<Lease> {
        for n in 1..=10u32 {
            match self.try_acquire_lease(name).await {
                Err(Error::ServiceUnavailable) | Err(Error::Service(_)) => {
                    let backoff = Duration::from_millis(10u64.pow(n));
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
        Err(Error::ServiceUnavailable)
    }

    async fn try_acquire_lease(&self, name: &str) -> Result<Lease> {
        for server in self.meta_servers() {
            let url = format!(
                "{}://{}/lease?name={}&nodeid={}",
                self.scheme(),
                server,
                name,
                self.node_id()
            );

            let response = match self.http.get(&url).timeout(EXEC_TIMEOUT).send().await {
                Ok(response) => response,
                Err(_) => continue,
            };

            match response.status() {
                reqwest::StatusCode::OK => {
                    return response
                        .json::<Lease>()
                        .await
                        .map_err(|e| Error::Service(e.to_string()));
                }
                reqwest::StatusCode::CONFLICT => return Err(Error::LeaseContested),
                reqwest::StatusCode::SERVICE_UNAVAILABLE => continue,
                reqwest::StatusCode::BAD_REQUEST => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(Error::Service(format!("meta service: {text}")));
                }
                _ => return Err(Error::Service("unrecognized meta service error".to_string())),
            }
        }
        Err(Error::ServiceUnavailable)
    }

    /// Liveness check against the first meta server; with `check_all` the
    /// server verifies every peer.
    pub async fn ping(&self, check_all: bool) -> Result<()> {
        let server = self
            .meta_servers()
            .first()
            .cloned()
            .ok_or(Error::ServiceUnavailable)?;
        let mut url = format!("{}://{}/ping", self.scheme(), server);
        if check_all {
            url.push_str("?all=true");
        }

        let response = self
            .http
            .get(&url)
            .timeout(EXEC_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Service(e.to_string()))?;

        if response.status() == reqwest::StatusCode::OK {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(Error::Service(text))
    }

    /// Drop this node's own address from the persisted server list.
    pub fn leave(&self) -> Result<()> {
        if let Some(bind_address) = &self.config.bind_address {
            let mut state = self.state.write();
            state.servers.retain(|s| s != bind_address);
            if let Some(dir) = &self.config.dir {
                persist::save_meta_servers(dir, &state.servers)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // The retry loops
    // -----------------------------------------------------------------------

    /// Propose a command, retrying across servers and following leader
    /// redirects, then wait until the local cache reflects the write.
    async fn retry_until_exec<M: Message>(&self, r#type: CommandType, payload: &M) -> Result<u64> {
        let cmd = meta_proto::command(r#type, payload);
        let cmd_bytes = meta_proto::encode(&cmd);

        let mut tries = 0;
        let mut current_server = 0;
        let mut redirect_server: Option<String> = None;

        loop {
            if self.closed() {
                return Err(Error::ServiceUnavailable);
            }

            let url = match redirect_server.take() {
                Some(url) => url,
                None => {
                    let servers = self.meta_servers();
                    if servers.is_empty() {
                        return Err(Error::ServiceUnavailable);
                    }
                    let server = &servers[current_server % servers.len()];
                    format!("{}://{}/execute", self.scheme(), server)
                }
            };

            match self.exec(&url, cmd_bytes.clone()).await {
                Ok(index) => {
                    self.wait_for_index(index).await;
                    return Ok(index);
                }
                // redirects carry progress, they are not failures
                Err(ExecError::Redirect(location)) => {
                    debug!(%location, "following leader redirect");
                    redirect_server = Some(location);
                }
                Err(ExecError::Command(message)) => {
                    return Err(match MetaError::parse(&message) {
                        Some(e) => Error::Meta(e),
                        None => Error::Command(message),
                    });
                }
                Err(ExecError::Transport(e)) => {
                    tries += 1;
                    current_server += 1;
                    if tries > MAX_RETRIES {
                        return Err(Error::Service(e));
                    }
                    warn!(%e, tries, "meta command failed, retrying");
                    tokio::select! {
                        _ = self.closing.cancelled() => return Err(Error::ServiceUnavailable),
                        _ = tokio::time::sleep(ERR_SLEEP) => {}
                    }
                }
            }
        }
    }

    async fn exec(&self, url: &str, cmd: Bytes) -> Result<u64, ExecError> {
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(cmd)
            .timeout(EXEC_TIMEOUT)
            .send()
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::TEMPORARY_REDIRECT => {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|l| l.to_str().ok())
                    .map(ToString::to_string)
                    .ok_or_else(|| ExecError::Transport("redirect without location".to_string()))?;
                Err(ExecError::Redirect(location))
            }
            reqwest::StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| ExecError::Transport(e.to_string()))?;
                let envelope = meta_proto::Response::decode(body)
                    .map_err(|e| ExecError::Transport(e.to_string()))?;
                if !envelope.error.is_empty() {
                    return Err(ExecError::Command(envelope.error));
                }
                Ok(envelope.index)
            }
            status => Err(ExecError::Transport(format!(
                "meta service returned {status}"
            ))),
        }
    }

    /// Background loop: long-poll `/snapshot` forever, installing each newer
    /// data root and waking `changed` watchers.
    async fn poll_for_updates(self: Arc<Self>) {
        loop {
            let index = self.index();
            let Some(data) = self.retry_until_snapshot(index).await else {
                // only happens when the client is closed
                return;
            };

            let new_index = data.index;
            let mut state = self.state.write();
            let old_index = state.cache.index;
            state.cache = Arc::new(data);
            Self::update_auth_cache(&mut state);
            drop(state);

            if old_index < new_index {
                self.changed.send_replace(new_index);
            }
        }
    }

    async fn retry_until_snapshot(&self, index: u64) -> Option<ClusterData> {
        let mut current_server = 0;
        loop {
            if self.closed() {
                return None;
            }

            let servers = self.meta_servers();
            if servers.is_empty() {
                tokio::select! {
                    _ = self.closing.cancelled() => return None,
                    _ = tokio::time::sleep(ERR_SLEEP) => continue,
                }
            }
            let server = servers[current_server % servers.len()].clone();

            match self.get_snapshot(&server, index).await {
                Ok(data) => return Some(data),
                Err(e) => {
                    warn!(%server, %e, "failure getting snapshot");
                    current_server += 1;
                    tokio::select! {
                        _ = self.closing.cancelled() => return None,
                        _ = tokio::time::sleep(ERR_SLEEP) => {}
                    }
                }
            }
        }
    }

    async fn get_snapshot(&self, server: &str, index: u64) -> Result<ClusterData> {
        let url = format!("{}://{}/snapshot?index={}", self.scheme(), server, index);
        let response = self
            .http
            .get(&url)
            .timeout(SNAPSHOT_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Service(e.to_string()))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::Service(format!(
                "meta server returned non-200: {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Service(e.to_string()))?;
        ClusterData::unmarshal_binary(&body).map_err(|e| Error::Service(e.to_string()))
    }

    /// Keep cached credentials only for users that still exist with an
    /// unchanged bcrypt hash.
    fn update_auth_cache(state: &mut ClientState) {
        let mut fresh = HashMap::with_capacity(state.auth_cache.len());
        for user in &state.cache.users {
            if let Some(cached) = state.auth_cache.get(&user.name) {
                if cached.bhash == user.hash {
                    fresh.insert(user.name.clone(), cached.clone());
                }
            }
        }
        state.auth_cache = fresh;
    }

    fn save_meta_servers(&self) -> Result<()> {
        if let Some(dir) = &self.config.dir {
            let servers = self.meta_servers();
            persist::save_meta_servers(dir, &servers)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
enum ExecError {
    Redirect(String),
    Command(String),
    Transport(String),
}
