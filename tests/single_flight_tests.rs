//! Integration tests for single-flight deduplication

mod common;

use common::{init_tracing, test_timeout_guard};
use cosync::{Error, SingleFlightGroup};
use std::cell::Cell;
use std::collections::HashSet;
use std::error::Error as _;
use std::rc::Rc;
use std::time::Duration;

/// Executor result that identifies which execution produced it
fn next_marker(counter: &Cell<u64>) -> u64 {
    let marker = counter.get() + 1;
    counter.set(marker);
    marker
}

#[compio::test]
async fn test_concurrent_calls_share_one_execution() {
    init_tracing();
    let _guard = test_timeout_guard(Duration::from_secs(30));
    let group: Rc<SingleFlightGroup<u64>> = Rc::new(SingleFlightGroup::new());
    let executions = Rc::new(Cell::new(0u64));

    let mut handles = Vec::new();
    for _ in 0..10_000 {
        let group = group.clone();
        let executions = executions.clone();
        handles.push(compio::runtime::spawn(async move {
            group
                .run(
                    "report",
                    move || async move {
                        let marker = next_marker(&executions);
                        compio::time::sleep(Duration::from_millis(50)).await;
                        Ok(marker)
                    },
                    None,
                )
                .await
        }));
    }

    let mut results = HashSet::new();
    for handle in handles {
        results.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(results.len(), 1);
    assert_eq!(executions.get(), 1);
    assert!(group.is_empty());
}

#[compio::test]
async fn test_failure_is_shared_with_every_caller() {
    init_tracing();
    let _guard = test_timeout_guard(Duration::from_secs(10));
    let group: Rc<SingleFlightGroup<u64>> = Rc::new(SingleFlightGroup::new());

    let mut handles = Vec::new();
    for _ in 0..100 {
        let group = group.clone();
        handles.push(compio::runtime::spawn(async move {
            group
                .run(
                    "broken",
                    || async {
                        compio::time::sleep(Duration::from_millis(20)).await;
                        Err(anyhow::anyhow!("backend unavailable"))
                    },
                    None,
                )
                .await
        }));
    }

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::SharedExecution { ref key, .. } if key == "broken"));
        let cause = err.source().unwrap();
        assert_eq!(cause.to_string(), "backend unavailable");
    }
    assert!(group.is_empty());
}

#[compio::test]
async fn test_follower_timeout_does_not_affect_leader() {
    init_tracing();
    let _guard = test_timeout_guard(Duration::from_secs(10));
    let group: Rc<SingleFlightGroup<u64>> = Rc::new(SingleFlightGroup::new());

    let leader = group.clone();
    let leader = compio::runtime::spawn(async move {
        leader
            .run(
                "slow",
                || async {
                    compio::time::sleep(Duration::from_millis(150)).await;
                    Ok(7)
                },
                Some(Duration::from_millis(10)),
            )
            .await
    });
    compio::time::sleep(Duration::from_millis(5)).await;

    let mut followers = Vec::new();
    for _ in 0..50 {
        let group = group.clone();
        followers.push(compio::runtime::spawn(async move {
            group
                .run("slow", || async { Ok(0) }, Some(Duration::from_millis(30)))
                .await
        }));
    }

    for follower in followers {
        let err = follower.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert!(err
            .to_string()
            .starts_with("Exceeded maximum waiting time for result on slow"));
    }
    assert_eq!(group.len(), 1);

    assert_eq!(leader.await.unwrap().unwrap(), 7);
    assert!(group.is_empty());
}

#[compio::test]
async fn test_each_forget_starts_a_new_execution() {
    init_tracing();
    let _guard = test_timeout_guard(Duration::from_secs(10));
    let group: Rc<SingleFlightGroup<u64>> = Rc::new(SingleFlightGroup::new());
    let executions = Rc::new(Cell::new(0u64));
    let forgets = 5;

    let mut handles = Vec::new();
    for _ in 0..1_000 {
        let group = group.clone();
        let executions = executions.clone();
        handles.push(compio::runtime::spawn(async move {
            group
                .run(
                    "feed",
                    move || async move {
                        let marker = next_marker(&executions);
                        compio::time::sleep(Duration::from_millis(100)).await;
                        Ok(marker)
                    },
                    None,
                )
                .await
        }));
    }

    for _ in 0..forgets {
        compio::time::sleep(Duration::from_millis(10)).await;
        group.forget("feed");
    }

    let mut results = HashSet::new();
    for handle in handles {
        results.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(results.len(), forgets + 1);
    assert_eq!(executions.get(), forgets as u64 + 1);
    assert!(group.is_empty());
}

#[compio::test]
async fn test_forget_without_waiters_is_harmless() {
    init_tracing();
    let group: SingleFlightGroup<u64> = SingleFlightGroup::new();
    group.forget("idle");

    let first = group.run("idle", || async { Ok(1) }, None).await.unwrap();
    group.forget("idle");
    let second = group.run("idle", || async { Ok(2) }, None).await.unwrap();

    assert_eq!((first, second), (1, 2));
    assert!(group.is_empty());
}
