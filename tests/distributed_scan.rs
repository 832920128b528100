mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use arrow::array::{Array, Int64Array, RecordBatch, StringArray};
use common::{TestCluster, CLUSTER, STRUCTURE};
use s3_cluster::{ClusterAddress, ClusterNode, ClusterTopology, ScanSettings};

const NAMES: [&str; 5] = ["a", "b", "c", "d", "e"];

fn total_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(|b| b.num_rows()).sum()
}

fn strings(batches: &[RecordBatch], column: &str) -> Vec<String> {
    batches
        .iter()
        .flat_map(|b| {
            let array = b
                .column_by_name(column)
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .clone();
            (0..array.len()).map(move |i| array.value(i).to_string())
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_key_is_read_exactly_once() {
    let cluster = TestCluster::start(3).await;
    cluster.put_objects(&NAMES, 4);

    let batches = cluster
        .initiator()
        .sql(&cluster.scan_sql("id, _file"))
        .await
        .unwrap();

    assert_eq!(total_rows(&batches), NAMES.len() * 4);

    let mut opened = cluster.store.opened_keys();
    opened.sort();
    let expected: Vec<String> = NAMES.iter().map(|n| format!("s3://lake/data/{n}.csv")).collect();
    assert_eq!(opened, expected, "each key must be opened once");

    let files: BTreeSet<String> = strings(&batches, "_file").into_iter().collect();
    let expected_files: BTreeSet<String> = NAMES.iter().map(|n| format!("{n}.csv")).collect();
    assert_eq!(files, expected_files);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn virtual_path_column_carries_bucket_and_key() {
    let cluster = TestCluster::start(2).await;
    cluster.put_objects(&["only"], 2);

    let batches = cluster
        .initiator()
        .sql(&cluster.scan_sql("_path, name"))
        .await
        .unwrap();

    assert_eq!(strings(&batches, "_path"), vec!["lake/data/only.csv"; 2]);
    let mut names = strings(&batches, "name");
    names.sort();
    assert_eq!(names, vec!["only-0", "only-1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn count_star_sums_rows_from_all_workers() {
    let cluster = TestCluster::start(3).await;
    cluster.put_objects(&NAMES, 3);

    let batches = cluster
        .initiator()
        .sql(&cluster.scan_sql("COUNT(*) AS n"))
        .await
        .unwrap();

    let counts = batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(counts.value(0), 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn filters_apply_on_top_of_the_distributed_scan() {
    let cluster = TestCluster::start(3).await;
    cluster.put_objects(&NAMES, 4);

    let sql = format!("{} WHERE id >= 200 AND id < 300", cluster.scan_sql("name"));
    let batches = cluster.initiator().sql(&sql).await.unwrap();

    let mut names = strings(&batches, "name");
    names.sort();
    assert_eq!(names, vec!["c-0", "c-1", "c-2", "c-3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_matching_keys_yields_no_rows() {
    let cluster = TestCluster::start(3).await;
    cluster.store.put("s3://lake/other/x.json", "{}").unwrap();

    let batches = cluster
        .initiator()
        .sql(&cluster.scan_sql("id"))
        .await
        .unwrap();

    assert_eq!(total_rows(&batches), 0);
    assert!(cluster.store.opened_keys().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_cluster_reads_everything_itself() {
    let cluster = TestCluster::start(1).await;
    cluster.put_objects(&NAMES, 2);

    let batches = cluster
        .initiator()
        .sql(&cluster.scan_sql("id"))
        .await
        .unwrap();

    assert_eq!(total_rows(&batches), 10);
    assert_eq!(cluster.store.opened_keys().len(), NAMES.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn any_node_can_initiate() {
    let cluster = TestCluster::start(3).await;
    cluster.put_objects(&NAMES, 1);

    let batches = cluster.nodes[2]
        .sql(&cluster.scan_sql("id"))
        .await
        .unwrap();

    assert_eq!(total_rows(&batches), NAMES.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_missing_from_its_cluster_fails_before_listing() {
    let cluster = TestCluster::start(2).await;
    cluster.put_objects(&NAMES, 1);

    // Same topology, but this node listens on a port nobody lists.
    let mut topology = ClusterTopology::new();
    topology.insert(
        CLUSTER,
        (0..2)
            .map(|i| {
                ClusterAddress::new("127.0.0.1", cluster.nodes[i].local_port(), "default", "", CLUSTER, "", true)
            })
            .collect(),
    );
    let stray = ClusterNode::new(
        topology,
        1,
        ScanSettings::default(),
        Arc::new(cluster.store.clone()),
        Arc::new(cluster.store.clone()),
    );

    let err = stray.sql(&cluster.scan_sql("id")).await.unwrap_err();
    assert!(
        err.to_string().contains("could not find the local node"),
        "unexpected error: {err}"
    );
    assert!(stray.registry().active_queries().is_empty());
    assert!(cluster.store.opened_keys().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_cluster_is_rejected() {
    let cluster = TestCluster::start(1).await;
    let sql = format!(
        "SELECT id FROM s3_cluster('nowhere', 's3://lake/data/*.csv', 'CSV', '{STRUCTURE}')"
    );

    let err = cluster.initiator().sql(&sql).await.unwrap_err();
    assert!(err.to_string().contains("nowhere"), "unexpected error: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_object_fails_the_query() {
    let cluster = TestCluster::start(2).await;
    cluster.put_objects(&["a"], 1);
    // Listed but unreadable: the in-memory store rejects compressed objects.
    cluster.store.put("s3://lake/data/z.csv.gz", "1,z-0\n").unwrap();
    let sql = format!(
        "SELECT id FROM s3_cluster('{CLUSTER}', 's3://lake/data/*', 'CSV', '{STRUCTURE}')"
    );

    let err = cluster.initiator().sql(&sql).await.unwrap_err();
    assert!(err.to_string().contains("z.csv.gz"), "unexpected error: {err}");
}
