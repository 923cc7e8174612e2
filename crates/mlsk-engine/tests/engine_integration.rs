#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests for the engine boundary: submit, cancel and the admin
//! snapshot.

use std::time::Duration;

use serde_json::Value;

use mlsk_core::EngineConfig;
use mlsk_engine::pool::ProcessState;
use mlsk_engine::{ComputeEngine, EngineError, PoolError, RequestKind, SubmitOutcome};

fn engine(worker_count: usize) -> ComputeEngine {
    let engine = ComputeEngine::new(&EngineConfig {
        worker_count,
        task_queue_capacity: 4,
        restart_settle_millis: 0,
        ..EngineConfig::default()
    });
    engine.start().unwrap();
    engine
}

async fn wait_for_request(engine: &ComputeEngine, id: i64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !engine.registry().contains(id).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("request never registered");
}

async fn slow_forecast(args: Vec<Value>) -> anyhow::Result<Value> {
    tokio::time::sleep(Duration::from_millis(800)).await;
    Ok(Value::from(args.len()))
}

// Holds its thread without ever yielding
async fn blocking_forecast(_args: Vec<Value>) -> anyhow::Result<Value> {
    std::thread::sleep(Duration::from_secs(3));
    Ok(Value::from("late"))
}

async fn exploding_classifier(_args: Vec<Value>) -> anyhow::Result<Value> {
    panic!("classifier crashed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_during_computation_returns_dropped() {
    let engine = engine(2);
    let submitter = engine.clone();
    let submitted = tokio::spawn(async move {
        submitter
            .submit(42, RequestKind::TimeSeries, slow_forecast, vec![Value::from(1)])
            .await
    });

    wait_for_request(&engine, 42).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.cancel(42).await);

    let outcome = submitted.await.unwrap().unwrap();
    assert!(matches!(outcome, SubmitOutcome::Dropped { id: 42 }));
    assert_eq!(outcome.to_string(), "42 request dropped");
    assert!(!engine.registry().contains(42).await);

    // The computation is not interrupted: its worker stays BUSY until it returns
    assert!(engine.pool().states().contains(&ProcessState::Busy));
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.pool().states().contains(&ProcessState::Busy) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker never returned to IDLE");
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_during_blocking_computation_returns_dropped_promptly() {
    let engine = ComputeEngine::new(&EngineConfig {
        worker_count: 1,
        task_queue_capacity: 1,
        restart_settle_millis: 0,
        terminate_grace_millis: 100,
        ..EngineConfig::default()
    });
    engine.start().unwrap();
    let submitter = engine.clone();
    let submitted = tokio::spawn(async move {
        submitter
            .submit(43, RequestKind::TimeSeries, blocking_forecast, Vec::new())
            .await
    });

    wait_for_request(&engine, 43).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.cancel(43).await);

    let outcome = tokio::time::timeout(Duration::from_secs(1), submitted)
        .await
        .expect("blocking computation starved the cancel listener")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Dropped { id: 43 }));
    assert!(!engine.registry().contains(43).await);

    // The monitor and the admin view stay responsive meanwhile
    let snapshot = tokio::time::timeout(Duration::from_secs(1), engine.admin_snapshot())
        .await
        .unwrap();
    assert!(snapshot.requests.is_empty());
    assert_eq!(snapshot.workers[0].state, ProcessState::Busy);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_request_can_no_longer_be_released() {
    let engine = engine(1);
    let (finish_tx, finish_rx) = std::sync::mpsc::channel::<()>();
    let submitter = engine.clone();
    let submitted = tokio::spawn(async move {
        submitter
            .submit(
                44,
                RequestKind::Classifier,
                move |_| async move {
                    let _ = finish_rx.recv();
                    anyhow::Ok(Value::from("label"))
                },
                Vec::new(),
            )
            .await
    });
    wait_for_request(&engine, 44).await;

    finish_tx.send(()).unwrap();
    let outcome = submitted.await.unwrap().unwrap();
    assert!(!engine.cancel(44).await);
    assert_eq!(
        outcome.into_task_result().unwrap().get().unwrap(),
        Value::from("label")
    );
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_after_completion_is_a_noop() {
    let engine = engine(1);
    let outcome = engine
        .submit(
            7,
            RequestKind::Classifier,
            |_| async { anyhow::Ok(Value::from("label")) },
            Vec::new(),
        )
        .await
        .unwrap();

    let result = outcome.into_task_result().unwrap();
    assert_eq!(result.get().unwrap(), Value::from("label"));
    assert!(!engine.cancel(7).await);

    // The cancel listener was woken, so the worker is free again
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.pool().states()[0] != ProcessState::Idle {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker never returned to IDLE");
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_id_can_be_reused_after_completion() {
    let engine = engine(1);
    for _ in 0..3 {
        let outcome = engine
            .submit(
                1,
                RequestKind::TimeSeries,
                |_| async { anyhow::Ok(Value::Null) },
                Vec::new(),
            )
            .await
            .unwrap();
        assert!(!outcome.is_dropped());
        // Listener exits on IGNORE before the next submit claims the worker
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.pool().states()[0] != ProcessState::Idle {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_body_is_reported_as_failed_result() {
    let engine = engine(1);
    let outcome = engine
        .submit(3, RequestKind::Classifier, exploding_classifier, Vec::new())
        .await
        .unwrap();

    let result = outcome.into_task_result().unwrap();
    assert!(result.failed());
    let message = result.error().unwrap().to_string();
    assert!(message.contains("classifier crashed"), "got {message}");
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_pool_rejects_submit_and_deregisters() {
    let engine = engine(1);
    let submitter = engine.clone();
    let busy = tokio::spawn(async move {
        submitter
            .submit(10, RequestKind::TimeSeries, slow_forecast, Vec::new())
            .await
    });
    wait_for_request(&engine, 10).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.pool().states()[0] != ProcessState::Busy {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let err = engine
        .submit(11, RequestKind::Classifier, slow_forecast, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Pool(PoolError::PoolExhausted { workers: 1 })
    ));
    assert!(!engine.registry().contains(11).await);

    let outcome = busy.await.unwrap().unwrap();
    assert!(!outcome.is_dropped());
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admin_snapshot_shows_in_flight_work() {
    let engine = engine(2);
    let submitter = engine.clone();
    let submitted = tokio::spawn(async move {
        submitter
            .submit(5, RequestKind::TimeSeries, slow_forecast, Vec::new())
            .await
    });
    wait_for_request(&engine, 5).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !engine.pool().states().contains(&ProcessState::Busy) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let snapshot = engine.admin_snapshot().await;
    assert_eq!(snapshot.workers.len(), 2);
    assert_eq!(snapshot.requests.len(), 1);
    assert_eq!(snapshot.requests[0].id, 5);
    assert_eq!(snapshot.requests[0].kind, RequestKind::TimeSeries);
    assert!(
        snapshot
            .workers
            .iter()
            .any(|w| w.state == ProcessState::Busy && w.transition_count == 1)
    );

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["requests"][0]["kind"], "TIME_SERIES");
    assert!(json["workers"][0].get("transitionCount").is_some());
    assert!(json["workers"][0].get("startedAtMs").is_some());

    submitted.await.unwrap().unwrap();
    assert!(engine.admin_snapshot().await.requests.is_empty());
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_all_drops_every_in_flight_request() {
    let engine = engine(1);
    let submitter = engine.clone();
    let submitted = tokio::spawn(async move {
        submitter
            .submit(77, RequestKind::Classifier, slow_forecast, Vec::new())
            .await
    });
    wait_for_request(&engine, 77).await;

    assert_eq!(engine.release_all().await, 1);
    let outcome = submitted.await.unwrap().unwrap();
    assert!(outcome.is_dropped());
    engine.shutdown().await;
}
