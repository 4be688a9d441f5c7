//! Confirms the single-flight contract holds under real concurrent access:
//! many tasks racing `get_or_create` for the same key must see exactly one
//! of them own the creation, and every task observes the value it produces.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use coro_core::cache::{Cache, EntryState};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_task_creates_the_entry_under_concurrent_access() {
    let cache = Arc::new(Cache::<&'static str, u32>::new(16, 4));
    let creators = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let cache = Arc::clone(&cache);
        let creators = Arc::clone(&creators);
        tasks.push(tokio::spawn(async move {
            let (handle, created) = cache.get_or_create(&"shared-key");
            if created {
                creators.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                handle.emplace_value(99);
                return 99;
            }
            handle.wait().await.unwrap();
            handle.value().unwrap()
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), 99);
    }
    assert_eq!(creators.load(Ordering::SeqCst), 1, "exactly one task should have won the race to create");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_failed_creation_is_observed_by_every_waiter() {
    let cache = Arc::new(Cache::<&'static str, u32>::new(16, 4));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move {
            let (handle, created) = cache.get_or_create(&"doomed-key");
            if created {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                handle.set_failed();
                return EntryState::Failed;
            }
            handle.wait().await.unwrap()
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), EntryState::Failed);
    }
}
