//! End-to-end tests: a real hyper meta server over a single-voter store,
//! driven through the client library.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use meta_client::{ClientConfig, Error, MetaClient};
use meta_server::{serve, HttpApi, MetaServer};
use meta_store::test_utils::FollowerRaft;
use meta_store::{Store, StoreConfig};
use meta_types::{MetaError, Privilege, RetentionPolicyInfo, RetentionPolicyUpdate};

static NEXT_PORT: AtomicU16 = AtomicU16::new(28091);

fn get_free_port() -> SocketAddr {
    let ip = std::net::Ipv4Addr::new(127, 0, 0, 1);

    loop {
        let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
        let addr = SocketAddrV4::new(ip, port);

        if std::net::TcpListener::bind(addr).is_ok() {
            return addr.into();
        }
    }
}

struct TestServer {
    addr: SocketAddr,
    store: Arc<Store>,
    shutdown: CancellationToken,
}

impl TestServer {
    fn host(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_leader_with(config: StoreConfig) -> TestServer {
    let addr = get_free_port();
    let store = Arc::new(Store::single_node(config, addr.to_string()));
    spawn_with_store(addr, Arc::clone(&store)).await
}

async fn spawn_leader() -> TestServer {
    spawn_leader_with(StoreConfig::default()).await
}

/// A follower replicating the leader's state machine: proposals are refused
/// with a redirect, reads observe whatever the leader has applied.
async fn spawn_follower(leader: &TestServer) -> TestServer {
    let addr = get_free_port();
    let raft = Arc::new(FollowerRaft {
        leader: Some(leader.host()),
    });
    let store = Arc::new(Store::new(
        Arc::clone(leader.store.fsm()),
        raft,
        StoreConfig::default(),
        addr.to_string(),
    ));
    spawn_with_store(addr, Arc::clone(&store)).await
}

async fn spawn_with_store(addr: SocketAddr, store: Arc<Store>) -> TestServer {
    // a short snapshot wait keeps fresh-cluster opens fast
    let api = HttpApi::new(Arc::clone(&store), false)
        .with_snapshot_wait(Duration::from_millis(250));
    let server = MetaServer::from_parts(addr, api);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { serve(server, token).await });

    for _ in 0..50 {
        if std::net::TcpStream::connect(addr).is_ok() {
            return TestServer {
                addr,
                store,
                shutdown,
            };
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("meta server did not start on {addr}");
}

async fn open_client(servers: Vec<String>) -> Arc<MetaClient> {
    let client = MetaClient::new(ClientConfig {
        meta_servers: servers,
        ..Default::default()
    });
    client.open().await.expect("client opens");
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_single_meta_node_and_database() {
    let server = spawn_leader_with(StoreConfig {
        retention_auto_create: false,
        ..Default::default()
    })
    .await;
    let client = open_client(vec![server.host()]).await;

    let meta = client.create_meta_node("m1:8091", "m1:8088").await.unwrap();
    assert_eq!(meta.id, 1);
    assert_eq!(client.node_id(), 1);
    assert_ne!(client.cluster_id(), 0);

    let data_node = client.create_data_node("d1:8086", "d1:8088").await.unwrap();
    assert_eq!(data_node.id, 2);

    let db = client.create_database("mydb").await.unwrap();
    assert_eq!(db.name, "mydb");
    assert!(db.retention_policies.is_empty());

    // idempotent: a second create returns the same database
    let again = client.create_database("mydb").await.unwrap();
    assert_eq!(again.name, "mydb");

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shard_groups_are_placed_round_robin() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;

    for i in 1..=3 {
        client
            .create_data_node(&format!("d{i}:8086"), &format!("d{i}:8088"))
            .await
            .unwrap();
    }

    let mut rp = RetentionPolicyInfo::new("rp1");
    rp.replica_n = 2;
    rp.shard_group_duration = Duration::from_secs(3600);
    client
        .create_database_with_retention_policy("mydb", rp)
        .await
        .unwrap();

    let timestamp = "2024-01-01T00:30:00Z".parse().unwrap();
    let group = client
        .create_shard_group("mydb", "rp1", timestamp)
        .await
        .unwrap()
        .expect("group created");

    assert_eq!(
        group.start_time,
        "2024-01-01T00:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap()
    );
    assert_eq!(
        group.end_time,
        "2024-01-01T01:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap()
    );
    // 3 nodes / replica 2 -> one shard with two owners
    assert_eq!(group.shards.len(), 1);
    assert_eq!(group.shards[0].owners.len(), 2);

    // same window: no second group
    let again = client
        .create_shard_group("mydb", "rp1", "2024-01-01T00:45:00Z".parse().unwrap())
        .await
        .unwrap()
        .expect("existing group returned");
    assert_eq!(again.id, group.id);

    let groups = client
        .shard_groups_by_time_range(
            "mydb",
            "rp1",
            "2024-01-01T00:00:00Z".parse().unwrap(),
            "2024-01-01T02:00:00Z".parse().unwrap(),
        )
        .unwrap();
    assert_eq!(groups.len(), 1);

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_data_node_reassigns_its_shards() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;

    for i in 1..=3 {
        client
            .create_data_node(&format!("d{i}:8086"), &format!("d{i}:8088"))
            .await
            .unwrap();
    }
    let mut rp = RetentionPolicyInfo::new("rp1");
    rp.replica_n = 2;
    rp.shard_group_duration = Duration::from_secs(3600);
    client
        .create_database_with_retention_policy("mydb", rp)
        .await
        .unwrap();
    let group = client
        .create_shard_group("mydb", "rp1", "2024-01-01T00:30:00Z".parse().unwrap())
        .await
        .unwrap()
        .unwrap();

    let first_owner = group.shards[0].owners[0].node_id;
    client.delete_data_node(first_owner).await.unwrap();

    let (_, _, group) = client.shard_owner(group.shards[0].id).expect("group still live");
    let shard = &group.shards[0];
    assert!(!shard.owners.is_empty());
    assert!(shard.owners.iter().all(|o| o.node_id != first_owner));

    // deleting again: the node is gone
    let err = client.delete_data_node(first_owner).await.unwrap_err();
    assert!(matches!(err, Error::Meta(MetaError::NodeNotFound)));

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_through_a_follower_redirect_to_the_leader() {
    let leader = spawn_leader().await;
    let follower = spawn_follower(&leader).await;

    // the client only knows the follower
    let client = open_client(vec![follower.host()]).await;

    let user = client.create_user("alice", "secret", true).await.unwrap();
    assert_eq!(user.name, "alice");
    assert!(user.admin);

    // the write landed on the leader and, after wait-for-index, is visible
    // through this client's own cache
    assert!(leader.store.data().user("alice").is_some());
    assert_eq!(client.user("alice").unwrap().name, "alice");

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn authentication_uses_the_cache_on_the_second_call() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;

    client.create_user("bob", "pw", false).await.unwrap();

    let start = Instant::now();
    let user = client.authenticate("bob", "pw").unwrap();
    let bcrypt_path = start.elapsed();
    assert_eq!(user.name, "bob");

    let start = Instant::now();
    let user = client.authenticate("bob", "pw").unwrap();
    let cache_path = start.elapsed();
    assert_eq!(user.name, "bob");

    // first call pays for bcrypt, second is a salted SHA-512 compare
    assert!(bcrypt_path >= Duration::from_millis(50), "{bcrypt_path:?}");
    assert!(cache_path < Duration::from_millis(20), "{cache_path:?}");

    let err = client.authenticate("bob", "wrong").unwrap_err();
    assert!(matches!(err, Error::Meta(MetaError::AuthenticationFailed)));
    let err = client.authenticate("nobody", "pw").unwrap_err();
    assert!(matches!(err, Error::Meta(MetaError::UserNotFound)));

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn password_change_invalidates_the_auth_cache() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;

    client.create_user("carol", "first", false).await.unwrap();
    client.authenticate("carol", "first").unwrap();

    client.update_user("carol", "second").await.unwrap();

    // wait for a poll tick to refresh the cache with the new bcrypt hash
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if client.authenticate("carol", "second").is_ok() {
            break;
        }
        assert!(Instant::now() < deadline, "new password never became valid");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let err = client.authenticate("carol", "first").unwrap_err();
    assert!(matches!(err, Error::Meta(MetaError::AuthenticationFailed)));

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_data_replaces_the_root_and_wakes_waiters() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;

    client.create_database("old").await.unwrap();

    let mut foreign = meta_types::ClusterData::default();
    foreign.cluster_id = 4242;
    foreign.create_database("imported").unwrap();

    let waiter = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.wait_for_data_changed().await })
    };
    // let the waiter subscribe before the change lands
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.set_data(&foreign).await.unwrap();

    // set_data waited for the local cache to catch up, so the view is fresh
    let data = client.data();
    assert_eq!(data.cluster_id, 4242);
    assert!(data.database("imported").is_some());
    assert!(data.database("old").is_none());

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter woke")
        .unwrap();

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retention_policy_lifecycle() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;
    client.create_data_node("d1:8086", "d1:8088").await.unwrap();
    client.create_database("mydb").await.unwrap();

    let mut rp = RetentionPolicyInfo::new("two_weeks");
    rp.duration = Duration::from_secs(14 * 24 * 3600);
    let created = client.create_retention_policy("mydb", rp).await.unwrap();
    assert_eq!(created.name, "two_weeks");

    // a too-short duration is rejected before any command is sent
    let mut bad = RetentionPolicyInfo::new("short");
    bad.duration = Duration::from_secs(60);
    let err = client.create_retention_policy("mydb", bad).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Meta(MetaError::RetentionPolicyDurationTooLow)
    ));

    client
        .update_retention_policy(
            "mydb",
            "two_weeks",
            RetentionPolicyUpdate {
                name: Some("one_month".to_string()),
                duration: Some(Duration::from_secs(30 * 24 * 3600)),
                replica_n: None,
            },
        )
        .await
        .unwrap();
    assert!(client.retention_policy("mydb", "one_month").unwrap().is_some());

    client
        .set_default_retention_policy("mydb", "one_month")
        .await
        .unwrap();
    assert_eq!(
        client.database("mydb").unwrap().default_retention_policy,
        "one_month"
    );

    client.drop_retention_policy("mydb", "one_month").await.unwrap();
    assert!(client.retention_policy("mydb", "one_month").unwrap().is_none());

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn continuous_queries_subscriptions_and_privileges() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;
    client.create_data_node("d1:8086", "d1:8088").await.unwrap();
    client.create_database("mydb").await.unwrap();

    client
        .create_continuous_query("mydb", "cq1", "SELECT mean(v) INTO x FROM y")
        .await
        .unwrap();
    assert_eq!(client.database("mydb").unwrap().continuous_queries.len(), 1);
    client.drop_continuous_query("mydb", "cq1").await.unwrap();

    client
        .create_subscription(
            "mydb",
            "autogen",
            "sub0",
            meta_types::SUBSCRIPTION_MODE_ANY,
            vec!["udp://mirror:9999".to_string()],
        )
        .await
        .unwrap();
    let rp = client.retention_policy("mydb", "autogen").unwrap().unwrap();
    assert_eq!(rp.subscriptions.len(), 1);
    client.drop_subscription("mydb", "autogen", "sub0").await.unwrap();

    client.create_user("dave", "pw", false).await.unwrap();
    client
        .set_privilege("dave", "mydb", Privilege::Write)
        .await
        .unwrap();
    assert_eq!(
        client.user_privilege("dave", "mydb").unwrap(),
        Privilege::Write
    );
    client.set_admin_privilege("dave", true).await.unwrap();
    assert!(client.admin_user_exists());

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leases_are_exclusive_per_name() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;

    let lease = client.acquire_lease("continuous-queries").await.unwrap();
    assert_eq!(lease.name, "continuous-queries");
    assert_eq!(lease.owner, 0);

    // same node renews freely
    client.acquire_lease("continuous-queries").await.unwrap();

    // a different node is refused
    client.create_data_node("d1:8086", "d1:8088").await.unwrap();
    assert_eq!(client.node_id(), 1);
    let err = client.acquire_lease("continuous-queries").await.unwrap_err();
    assert!(matches!(err, Error::LeaseContested));

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_reports_liveness() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;

    client.ping(false).await.unwrap();
    client.ping(true).await.unwrap();

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn meta_server_list_is_persisted_and_reloaded() {
    let server = spawn_leader().await;
    let dir = test_helpers::tmp_dir().unwrap();

    let client = MetaClient::new(ClientConfig {
        meta_servers: vec![server.host()],
        dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    });
    client.open().await.unwrap();
    client.close();

    // a fresh client with no seed list picks up the persisted servers
    let reloaded = MetaClient::new(ClientConfig {
        meta_servers: vec![],
        dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    });
    reloaded.open().await.unwrap();
    assert_eq!(reloaded.meta_servers(), vec![server.host()]);

    reloaded.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_meta_server_goes_through_the_leader() {
    let leader = spawn_leader().await;
    let follower = spawn_follower(&leader).await;

    let client = open_client(vec![follower.host()]).await;
    let node = client.join_meta_server("m2:8091", "m2:8088").await.unwrap();
    assert_eq!(node.tcp_host, "m2:8088");

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn precreate_makes_successor_groups_only_for_expiring_windows() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;

    client.create_data_node("d1:8086", "d1:8088").await.unwrap();
    let mut rp = RetentionPolicyInfo::new("rp1");
    rp.shard_group_duration = Duration::from_secs(3600);
    client
        .create_database_with_retention_policy("mydb", rp)
        .await
        .unwrap();
    client
        .create_shard_group("mydb", "rp1", "2024-01-01T00:30:00Z".parse().unwrap())
        .await
        .unwrap()
        .unwrap();

    // window [00:00, 01:00): a horizon ending before the group does creates
    // nothing
    client
        .precreate_shard_groups(
            "2024-01-01T00:00:00Z".parse().unwrap(),
            "2024-01-01T00:45:00Z".parse().unwrap(),
        )
        .await
        .unwrap();
    let rp = client.retention_policy("mydb", "rp1").unwrap().unwrap();
    assert_eq!(rp.shard_groups.len(), 1);

    // the group expires inside (from, to): its successor is created
    client
        .precreate_shard_groups(
            "2024-01-01T00:45:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap(),
            "2024-01-01T01:30:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap(),
        )
        .await
        .unwrap();
    let rp = client.retention_policy("mydb", "rp1").unwrap().unwrap();
    assert_eq!(rp.shard_groups.len(), 2);
    assert_eq!(
        rp.shard_groups[1].start_time,
        "2024-01-01T01:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap()
    );

    // a deleted newest group is never continued
    client
        .delete_shard_group("mydb", "rp1", rp.shard_groups[1].id)
        .await
        .unwrap();
    client
        .precreate_shard_groups(
            "2024-01-01T01:45:00Z".parse().unwrap(),
            "2024-01-01T02:30:00Z".parse().unwrap(),
        )
        .await
        .unwrap();
    let rp = client.retention_policy("mydb", "rp1").unwrap().unwrap();
    assert_eq!(rp.shard_groups.len(), 2);

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_errors_are_not_retried() {
    let server = spawn_leader().await;
    let client = open_client(vec![server.host()]).await;

    let start = Instant::now();
    let err = client.drop_database("missing").await.unwrap_err();
    assert!(matches!(err, Error::Meta(MetaError::DatabaseNotFound)));
    // a retried command would sleep at least once (1s per attempt)
    assert!(start.elapsed() < Duration::from_millis(900));

    client.close();
}
