mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{TestCluster, CLUSTER};
use s3_cluster::flight_client::FlightClient;
use s3_cluster::protocol::NextTaskRequest;
use s3_cluster::pull_channel::{FlightTaskPuller, NextTaskSource};
use s3_cluster::ClusterError;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn client(cluster: &TestCluster, secret: &str) -> FlightClient {
    FlightClient::connect(&cluster.endpoint(0), secret, TIMEOUT)
        .await
        .unwrap()
}

async fn pull(client: &mut FlightClient, query_id: &str) -> s3_cluster::Result<Option<String>> {
    let request = NextTaskRequest {
        query_id: query_id.to_string(),
    };
    Ok(client.next_task(&request, TIMEOUT, TIMEOUT).await?.into_key())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_returns_identity_hash() {
    let cluster = TestCluster::start(2).await;
    let mut client = client(&cluster, "").await;

    let hash = client.handshake(CLUSTER).await.unwrap();
    assert_eq!(hash, cluster.initiator().self_hash(CLUSTER).unwrap());
    assert_ne!(hash, cluster.nodes[1].self_hash(CLUSTER).unwrap());

    let err = client.handshake("nowhere").await.unwrap_err();
    assert!(matches!(err, ClusterError::Transport(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pulls_never_share_a_key() {
    let cluster = TestCluster::start(1).await;
    let keys: Vec<String> = (0..200).map(|i| format!("s3://lake/k{i:03}")).collect();
    let _registration = cluster
        .initiator()
        .registry()
        .register("q-concurrent", keys.clone())
        .unwrap();

    let mut workers = Vec::new();
    for _ in 0..8 {
        let mut client = client(&cluster, "").await;
        workers.push(tokio::spawn(async move {
            let mut taken = Vec::new();
            while let Some(key) = pull(&mut client, "q-concurrent").await.unwrap() {
                taken.push(key);
            }
            taken
        }));
    }

    let mut seen = HashSet::new();
    for worker in workers {
        for key in worker.await.unwrap() {
            assert!(seen.insert(key.clone()), "{key} was handed out twice");
        }
    }
    assert_eq!(seen, keys.into_iter().collect::<HashSet<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhaustion_is_stable() {
    let cluster = TestCluster::start(1).await;
    let _registration = cluster
        .initiator()
        .registry()
        .register("q-one", vec!["s3://lake/only.csv".to_string()])
        .unwrap();
    let mut client = client(&cluster, "").await;

    assert_eq!(pull(&mut client, "q-one").await.unwrap().as_deref(), Some("s3://lake/only.csv"));
    for _ in 0..3 {
        assert_eq!(pull(&mut client, "q-one").await.unwrap(), None);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_query_is_an_error() {
    let cluster = TestCluster::start(1).await;
    let mut client = client(&cluster, "").await;

    let err = pull(&mut client, "never-registered").await.unwrap_err();
    assert!(err.to_string().contains("never-registered"), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_query_stops_serving_keys() {
    let cluster = TestCluster::start(1).await;
    let registration = cluster
        .initiator()
        .registry()
        .register("q-done", vec!["s3://lake/a.csv".to_string()])
        .unwrap();
    drop(registration);

    let mut client = client(&cluster, "").await;
    assert!(pull(&mut client, "q-done").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_secret_is_refused() {
    let cluster = TestCluster::start_with_secret(1, "s3cr3t").await;
    let _registration = cluster
        .initiator()
        .registry()
        .register("q-secret", vec!["s3://lake/a.csv".to_string()])
        .unwrap();

    let mut intruder = client(&cluster, "guess").await;
    let err = pull(&mut intruder, "q-secret").await.unwrap_err();
    assert!(err.to_string().contains("cluster secret mismatch"), "{err}");
    assert!(intruder.handshake(CLUSTER).await.is_err());

    let mut member = client(&cluster, &cluster.secret).await;
    assert_eq!(
        pull(&mut member, "q-secret").await.unwrap().as_deref(),
        Some("s3://lake/a.csv")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pooled_puller_reuses_connections() {
    let cluster = TestCluster::start(1).await;
    let keys: Vec<String> = (0..10).map(|i| format!("s3://lake/p{i}.csv")).collect();
    let _registration = cluster
        .initiator()
        .registry()
        .register("q-pool", keys.clone())
        .unwrap();

    let initiator = cluster.initiator().topology().require(CLUSTER).unwrap()[0].clone();
    let puller = FlightTaskPuller::new(&initiator, cluster.initiator().settings());

    let mut taken = Vec::new();
    while let Some(key) = puller.next_task("q-pool").await.unwrap() {
        taken.push(key);
    }
    assert_eq!(taken, keys);
    assert_eq!(puller.pool().idle_connections(), 1);
}
