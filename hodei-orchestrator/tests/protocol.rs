use crate::common::{start_cluster, TestWorker};
use assert2::check;
use futures::{SinkExt, StreamExt};
use hodei_common::model::WorkerStatus;
use hodei_orchestrator::comms::WorkerChannel;
use hodei_wire::message::{worker_message, StatusUpdate, WorkerMessage};
use std::collections::HashMap;
use std::time::Duration;
use test_r::test;

#[test]
async fn the_first_message_must_be_a_registration() {
    let cluster = start_cluster(|_| {}).await;
    let mut stream = TestWorker::raw_connect(cluster.addr).await;

    stream
        .send(WorkerMessage::heartbeat("w1"))
        .await
        .unwrap();

    // the orchestrator closes the stream without an ack
    let outcome = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
    check!(matches!(outcome, Ok(None)));
    check!(cluster.services.worker_manager.connected_workers().is_empty());
}

#[test]
async fn registration_without_capabilities_is_rejected() {
    let cluster = start_cluster(|_| {}).await;
    let mut stream = TestWorker::raw_connect(cluster.addr).await;

    stream
        .send(WorkerMessage {
            payload: Some(worker_message::Payload::Register(
                hodei_wire::message::RegisterRequest {
                    worker_id: "w1".to_string(),
                    pool_id: "p1".to_string(),
                    capabilities: None,
                },
            )),
        })
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
    check!(matches!(outcome, Ok(None)));
}

#[test]
async fn traffic_for_an_unheld_execution_closes_the_session() {
    let cluster = start_cluster(|_| {}).await;
    let pool = cluster.add_active_pool("p1", 4.0, 1024 * 1024 * 1024).await;
    let mut worker = TestWorker::connect(cluster.addr, "w1", &pool.id).await;
    cluster.wait_for_idle_worker("w1").await;

    worker
        .send_raw(WorkerMessage {
            payload: Some(worker_message::Payload::StatusUpdate(StatusUpdate {
                execution_id: "not-mine".to_string(),
                event: 0,
                message: "sneaky".to_string(),
                metadata: HashMap::new(),
            })),
        })
        .await;

    assert!(worker.closed(Duration::from_secs(5)).await);
    // a protocol violation marks the worker itself as broken
    assert!(
        cluster
            .wait_worker_status("w1", WorkerStatus::Error, Duration::from_secs(5))
            .await
    );
    check!(cluster.services.worker_manager.connected_workers().is_empty());
}

#[test]
async fn duplicate_worker_ids_cannot_take_over_a_session() {
    let cluster = start_cluster(|_| {}).await;
    let pool = cluster.add_active_pool("p1", 4.0, 1024 * 1024 * 1024).await;
    let _first = TestWorker::connect(cluster.addr, "w1", &pool.id).await;
    cluster.wait_for_idle_worker("w1").await;

    // a second stream claiming the same worker id is closed without an ack
    let mut impostor = TestWorker::raw_connect(cluster.addr).await;
    impostor
        .send(WorkerMessage::register(
            "w1",
            pool.id.to_string(),
            hodei_wire::message::Capabilities::default(),
        ))
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), impostor.next()).await;
    check!(matches!(outcome, Ok(None)));

    // the original session is untouched
    check!(cluster.services.worker_manager.connected_workers().len() == 1);
}

#[test]
async fn a_second_registration_on_the_same_stream_is_a_protocol_error() {
    let cluster = start_cluster(|_| {}).await;
    let pool = cluster.add_active_pool("p1", 4.0, 1024 * 1024 * 1024).await;
    let mut worker = TestWorker::connect(cluster.addr, "w1", &pool.id).await;
    cluster.wait_for_idle_worker("w1").await;

    worker
        .send_raw(WorkerMessage::register(
            "w1",
            pool.id.to_string(),
            hodei_wire::message::Capabilities::default(),
        ))
        .await;

    assert!(worker.closed(Duration::from_secs(5)).await);
    assert!(cluster.wait_no_sessions(Duration::from_secs(5)).await);
}
