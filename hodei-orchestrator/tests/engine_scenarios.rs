use crate::common::{start_cluster, TestWorker, GIB};
use assert2::check;
use futures::StreamExt;
use hodei_common::model::{
    ExecutionDefinition, ExecutionStatus, Job, JobStatus, LogStream, QuotaLimits,
    ResourceRequirements, WorkerStatus,
};
use hodei_orchestrator::engine::{CancellationState, ExecutionError};
use hodei_orchestrator::scheduler::SchedulingError;
use hodei_wire::message::EventKind;
use std::time::Duration;
use test_r::test;

#[test]
async fn single_worker_runs_a_job_to_completion() {
    let cluster = start_cluster(|_| {}).await;
    let pool = cluster.add_active_pool("p1", 4.0, 8 * GIB).await;
    cluster
        .services
        .quota
        .set_limits(
            &pool.id,
            QuotaLimits {
                max_cpu_cores: 4.0,
                max_memory_bytes: 8 * GIB,
                max_concurrent_jobs: 4,
                max_disk_bytes: u64::MAX,
            },
            None,
        )
        .await;

    let mut worker = TestWorker::connect(cluster.addr, "w1", &pool.id).await;
    cluster.wait_for_idle_worker("w1").await;

    let mut logs = cluster.services.engine.logs();
    let (job, submitted) = cluster.submit_shell_job("hello", 1.0, GIB, 0, None).await;
    let execution_id = submitted.unwrap();

    let assignment = worker.expect_assignment(Duration::from_secs(5)).await;
    check!(assignment.execution_id == execution_id.to_string());
    check!(assignment.job_id == job.id.to_string());
    check!(assignment.definition.is_some());

    worker
        .send_status(&assignment.execution_id, EventKind::StepStarted, "running echo")
        .await;
    worker.send_stdout(&assignment.execution_id, "hello\n").await;
    worker
        .send_result(&assignment.execution_id, true, 0, "done")
        .await;

    assert!(
        cluster
            .wait_job_status(&job.id, JobStatus::Completed, Duration::from_secs(5))
            .await,
        "job never completed"
    );

    // the worker went busy and came back idle
    assert!(
        cluster
            .wait_worker_status("w1", WorkerStatus::Idle, Duration::from_secs(5))
            .await
    );

    // quota usage returned to zero after exactly one allocate/deallocate pair
    assert!(cluster.wait_quota_zero(&pool.id, Duration::from_secs(5)).await);

    // live subscribers saw the chunk, and the context retained it in order
    let chunk = tokio::time::timeout(Duration::from_secs(5), logs.next())
        .await
        .expect("no log chunk observed")
        .unwrap();
    check!(chunk.execution_id == execution_id);
    check!(chunk.stream == LogStream::Stdout);
    check!(chunk.payload.as_ref() == b"hello\n");

    let context = cluster
        .services
        .engine
        .execution_context(&execution_id)
        .expect("terminal context still retained");
    check!(context.execution.status == ExecutionStatus::Completed);
    check!(context.execution.exit_code == Some(0));
    check!(context.logs.len() == 1);
    check!(!context.events.is_empty());
}

#[test]
async fn no_pool_has_capacity_for_the_job() {
    let cluster = start_cluster(|_| {}).await;
    let p1 = cluster.add_active_pool("p1", 2.0, 8 * GIB).await;
    let p2 = cluster.add_active_pool("p2", 2.0, 8 * GIB).await;
    cluster.seed_busy_worker(&p1.id, "busy-1", 1.9, GIB).await;
    cluster.seed_busy_worker(&p2.id, "busy-2", 1.9, GIB).await;

    let (job, submitted) = cluster.submit_shell_job("too-big", 2.0, GIB, 0, None).await;
    match submitted {
        Err(ExecutionError::Scheduling(SchedulingError::NoEligiblePool)) => {}
        other => panic!("expected no eligible pool, got {other:?}"),
    }

    check!(cluster.job_status(&job.id).await == JobStatus::Failed);
    check!(cluster.services.quota.usage(&p1.id).await.is_zero());
    check!(cluster.services.quota.usage(&p2.id).await.is_zero());
}

#[test]
async fn explicit_pool_without_room_never_falls_back() {
    let cluster = start_cluster(|_| {}).await;
    let p1 = cluster.add_active_pool("p1", 1.0, 8 * GIB).await;
    let p2 = cluster.add_active_pool("p2", 4.0, 8 * GIB).await;
    cluster.seed_busy_worker(&p1.id, "busy-1", 1.0, GIB).await;

    let (job, submitted) = cluster
        .submit_shell_job("pinned", 1.0, GIB, 0, Some(p1.id.clone()))
        .await;
    match submitted {
        Err(ExecutionError::Scheduling(SchedulingError::RequestedPoolInsufficient(pool_id))) => {
            check!(pool_id == p1.id);
        }
        other => panic!("expected the pinned pool to be rejected, got {other:?}"),
    }

    check!(cluster.job_status(&job.id).await == JobStatus::Failed);
    // the empty pool was not used as a silent fallback
    check!(cluster.services.quota.usage(&p2.id).await.is_zero());
}

#[test]
async fn blocked_quota_fails_admission_without_allocating() {
    let cluster = start_cluster(|_| {}).await;
    let pool = cluster.add_active_pool("p1", 8.0, 16 * GIB).await;
    cluster
        .services
        .quota
        .set_limits(
            &pool.id,
            QuotaLimits {
                max_cpu_cores: 1.0,
                max_memory_bytes: GIB,
                max_concurrent_jobs: 1,
                max_disk_bytes: u64::MAX,
            },
            None,
        )
        .await;

    let (job, submitted) = cluster.submit_shell_job("greedy", 2.0, GIB, 0, None).await;
    match submitted {
        Err(ExecutionError::QuotaExceeded { pool_id, violations }) => {
            check!(pool_id == pool.id);
            check!(!violations.is_empty());
        }
        other => panic!("expected a quota rejection, got {other:?}"),
    }
    check!(cluster.job_status(&job.id).await == JobStatus::Failed);
    check!(cluster.services.quota.usage(&pool.id).await.is_zero());
}

#[test]
async fn lost_worker_fails_the_execution_and_the_retry_lands_elsewhere() {
    let cluster = start_cluster(|config| {
        config.worker.lost_timeout = Duration::from_millis(1200);
    })
    .await;
    let pool = cluster.add_active_pool("p1", 8.0, 16 * GIB).await;

    let mut first = TestWorker::connect(cluster.addr, "w1", &pool.id).await;
    cluster.wait_for_idle_worker("w1").await;

    let (job, submitted) = cluster.submit_shell_job("fragile", 1.0, GIB, 1, None).await;
    let first_execution = submitted.unwrap();
    let assignment = first.expect_assignment(Duration::from_secs(5)).await;
    check!(assignment.execution_id == first_execution.to_string());

    // a second worker joins and keeps heartbeating; the first goes silent
    let mut second = TestWorker::connect(cluster.addr, "w2", &pool.id).await;
    cluster.wait_for_idle_worker("w2").await;

    let retry_assignment = second
        .expect_assignment_with_heartbeats(Duration::from_secs(15), Duration::from_millis(200))
        .await;
    check!(retry_assignment.execution_id != first_execution.to_string());
    second
        .send_result(&retry_assignment.execution_id, true, 0, "done")
        .await;

    assert!(
        cluster
            .wait_job_status(&job.id, JobStatus::Completed, Duration::from_secs(5))
            .await,
        "retried job never completed"
    );

    let retried = cluster
        .services
        .job_repo
        .find_by_id(&job.id)
        .await
        .unwrap()
        .unwrap();
    check!(retried.retry_count == 1);
    check!(retried.latest_execution_id != Some(first_execution.clone()));

    // the silent worker was flagged, its execution reclaimed
    check!(cluster.worker_status("w1").await == Some(WorkerStatus::Error));
    let failed_context = cluster
        .services
        .engine
        .execution_context(&first_execution)
        .expect("first execution context retained");
    check!(failed_context.execution.status == ExecutionStatus::Failed);
    check!(failed_context
        .execution
        .failure
        .as_deref()
        .unwrap_or("")
        .contains("worker lost"));
    assert!(cluster.wait_quota_zero(&pool.id, Duration::from_secs(5)).await);
}

#[test]
async fn cancellation_with_grace_lets_the_worker_finish_cleanly() {
    let cluster = start_cluster(|_| {}).await;
    let pool = cluster.add_active_pool("p1", 4.0, 8 * GIB).await;
    let mut worker = TestWorker::connect(cluster.addr, "w1", &pool.id).await;
    cluster.wait_for_idle_worker("w1").await;

    let (job, submitted) = cluster.submit_shell_job("long", 1.0, GIB, 3, None).await;
    let execution_id = submitted.unwrap();
    let assignment = worker.expect_assignment(Duration::from_secs(5)).await;

    let state = cluster
        .services
        .engine
        .cancel(&execution_id, "user requested", false)
        .await
        .unwrap();
    check!(state == CancellationState::Pending);

    let signal = match worker.next_payload(Duration::from_secs(5)).await {
        Some(hodei_wire::message::orchestrator_message::Payload::CancelSignal(signal)) => signal,
        other => panic!("expected a cancel signal, got {other:?}"),
    };
    check!(signal.execution_id == assignment.execution_id);
    check!(signal.grace_ms == 1000);

    worker
        .send_result(&assignment.execution_id, false, 130, "cancelled")
        .await;

    assert!(
        cluster
            .wait_job_status(&job.id, JobStatus::Cancelled, Duration::from_secs(5))
            .await
    );
    // a cancelled job is terminal; the retry budget does not resurrect it
    tokio::time::sleep(Duration::from_millis(400)).await;
    check!(cluster.job_status(&job.id).await == JobStatus::Cancelled);
    check!(cluster.worker_status("w1").await == Some(WorkerStatus::Idle));
    check!(cluster.services.quota.usage(&pool.id).await.is_zero());

    let context = cluster
        .services
        .engine
        .execution_context(&execution_id)
        .unwrap();
    check!(context.execution.status == ExecutionStatus::Cancelled);
}

#[test]
async fn expired_cancellation_grace_forces_the_teardown() {
    let cluster = start_cluster(|config| {
        config.execution.cancel_grace = Duration::from_millis(500);
    })
    .await;
    let pool = cluster.add_active_pool("p1", 4.0, 8 * GIB).await;
    let mut worker = TestWorker::connect(cluster.addr, "w1", &pool.id).await;
    cluster.wait_for_idle_worker("w1").await;

    let (job, submitted) = cluster.submit_shell_job("stubborn", 1.0, GIB, 0, None).await;
    let execution_id = submitted.unwrap();
    worker.expect_assignment(Duration::from_secs(5)).await;

    let state = cluster
        .services
        .engine
        .cancel(&execution_id, "user requested", false)
        .await
        .unwrap();
    check!(state == CancellationState::Pending);
    // the worker ignores the signal and the grace period runs out

    assert!(
        cluster
            .wait_job_status(&job.id, JobStatus::Cancelled, Duration::from_secs(5))
            .await
    );
    assert!(
        cluster
            .wait_worker_status("w1", WorkerStatus::Terminated, Duration::from_secs(5))
            .await,
        "stubborn worker was not torn down"
    );
    assert!(worker.closed(Duration::from_secs(5)).await);
    check!(cluster.services.quota.usage(&pool.id).await.is_zero());

    let context = cluster
        .services
        .engine
        .execution_context(&execution_id)
        .unwrap();
    check!(context.execution.status == ExecutionStatus::Cancelled);
}

#[test]
async fn all_strategies_agree_on_the_reference_pools() {
    let cluster = start_cluster(|_| {}).await;
    // a is memory-heavy (0.1/0.9), b is balanced (0.5/0.5), c is cpu-heavy (0.9/0.1)
    let a = cluster.add_active_pool("a", 10.0, 10_000).await;
    let b = cluster.add_active_pool("b", 10.0, 10_000).await;
    let c = cluster.add_active_pool("c", 10.0, 10_000).await;
    cluster.seed_busy_worker(&a.id, "load-a", 1.0, 9_000).await;
    cluster.seed_busy_worker(&b.id, "load-b", 5.0, 5_000).await;
    cluster.seed_busy_worker(&c.id, "load-c", 9.0, 1_000).await;

    let mut job = Job::new("probe", "default", ExecutionDefinition::shell(["true"]), "tests");
    job.resource_requirements = ResourceRequirements::new(0.5, 500);

    let scheduler = &cluster.services.scheduler;
    check!(scheduler.select_pool(&job, Some("greedy")).await.unwrap().id == b.id);
    check!(scheduler.select_pool(&job, Some("leastloaded")).await.unwrap().id == b.id);
    check!(scheduler.select_pool(&job, Some("binpacking")).await.unwrap().id == b.id);

    let mut rotation = Vec::new();
    for _ in 0..4 {
        rotation.push(
            scheduler
                .select_pool(&job, Some("roundrobin"))
                .await
                .unwrap()
                .id
                .to_string(),
        );
    }
    check!(rotation == vec!["a", "b", "c", "a"]);

    // repeating any strategy on unchanged inputs lands on the same pool
    check!(scheduler.select_pool(&job, Some("greedy")).await.unwrap().id == b.id);
}

#[test]
async fn events_carry_server_side_timestamps_in_order() {
    let cluster = start_cluster(|_| {}).await;
    let pool = cluster.add_active_pool("p1", 4.0, 8 * GIB).await;
    let mut worker = TestWorker::connect(cluster.addr, "w1", &pool.id).await;
    cluster.wait_for_idle_worker("w1").await;

    let mut events = cluster.services.engine.events().await;
    let (_, submitted) = cluster.submit_shell_job("observed", 1.0, GIB, 0, None).await;
    let execution_id = submitted.unwrap();

    let assignment = worker.expect_assignment(Duration::from_secs(5)).await;
    worker
        .send_status(&assignment.execution_id, EventKind::StageStarted, "stage one")
        .await;
    worker
        .send_status(&assignment.execution_id, EventKind::StageCompleted, "stage one")
        .await;
    worker.send_result(&assignment.execution_id, true, 0, "").await;

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while seen.len() < 4 && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(1), events.next()).await {
            Ok(Some(event)) if event.execution_id == execution_id => seen.push(event),
            Ok(Some(_)) => {}
            _ => break,
        }
    }

    // per-subscriber timestamps are monotonic in delivery order
    assert!(seen.len() >= 4, "expected at least four events, saw {}", seen.len());
    for window in seen.windows(2) {
        check!(window[0].timestamp <= window[1].timestamp);
    }
}
