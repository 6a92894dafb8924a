//! Integration tests for weighted semaphores and the keyed registry

mod common;

use common::{init_tracing, test_timeout_guard};
use cosync::{SemaphoreRegistry, WeightedSemaphore};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

#[compio::test]
async fn test_tokens_in_use_never_exceed_capacity() {
    init_tracing();
    let _guard = test_timeout_guard(Duration::from_secs(20));
    let registry = Rc::new(SemaphoreRegistry::new());
    let capacity = 7;
    let in_use = Rc::new(Cell::new(0usize));
    let peak = Rc::new(Cell::new(0usize));

    let mut handles = Vec::new();
    for i in 0..200usize {
        let registry = registry.clone();
        let in_use = in_use.clone();
        let peak = peak.clone();
        let weight = i * 31 % capacity + 1;
        handles.push(compio::runtime::spawn(async move {
            registry
                .call("db", capacity, weight, None, move || async move {
                    in_use.set(in_use.get() + weight);
                    peak.set(peak.get().max(in_use.get()));
                    compio::time::sleep(Duration::from_millis(1)).await;
                    in_use.set(in_use.get() - weight);
                })
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert!(peak.get() <= capacity);
    assert!(peak.get() > 1);
    assert_eq!(in_use.get(), 0);
    assert!(registry.is_empty());
}

#[compio::test]
async fn test_weighted_waiters_are_served_in_arrival_order() {
    init_tracing();
    let _guard = test_timeout_guard(Duration::from_secs(10));
    let semaphore = WeightedSemaphore::new(3).unwrap();
    let blocker = semaphore.acquire_permit(3, None).await.unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut handles = Vec::new();
    for (i, weight) in [3usize, 1, 3, 1].into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let order = order.clone();
        handles.push(compio::runtime::spawn(async move {
            let _permit = semaphore.acquire_permit(weight, None).await.unwrap();
            order.borrow_mut().push(i);
            compio::time::sleep(Duration::from_millis(5)).await;
        }));
        compio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(semaphore.waiters(), 4);

    drop(blocker);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    assert_eq!(semaphore.available(), 3);
}

#[compio::test]
async fn test_timed_out_call_does_not_run_and_releases_entry() {
    init_tracing();
    let _guard = test_timeout_guard(Duration::from_secs(10));
    let registry = Rc::new(SemaphoreRegistry::new());

    let holder = registry.clone();
    let holder = compio::runtime::spawn(async move {
        holder
            .call("slow", 2, 2, None, || async {
                compio::time::sleep(Duration::from_millis(100)).await;
            })
            .await
    });
    compio::time::sleep(Duration::from_millis(10)).await;

    let ran = Rc::new(Cell::new(false));
    let flag = ran.clone();
    let err = registry
        .call("slow", 2, 1, Some(Duration::from_millis(20)), move || async move {
            flag.set(true);
        })
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(!ran.get());
    assert_eq!(registry.refs("slow", 2), 1);

    holder.await.unwrap().unwrap();
    assert!(registry.is_empty());
}

#[compio::test]
async fn test_distinct_sizes_are_distinct_semaphores() {
    init_tracing();
    let registry = SemaphoreRegistry::new();
    let small = registry.get_sema("k", 1).unwrap();
    let large = registry.get_sema("k", 4).unwrap();

    assert!(small.try_acquire(1).unwrap());
    assert!(large.try_acquire(4).unwrap());
    assert_eq!(registry.len(), 2);

    small.release(1).unwrap();
    large.release(4).unwrap();
    assert!(registry.release("k", 1));
    assert!(registry.release("k", 4));
    assert!(registry.is_empty());
}
