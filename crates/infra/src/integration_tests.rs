//! Scenario tests across the lock, the write transaction and the store.
//!
//! Verifies:
//! - At most one holder per resource, with contending workers on separate tasks
//! - Lock timeouts are bounded and the A/B hand-over works
//! - Commits are all-or-nothing and upserts are idempotent
//! - List trimming keeps exactly the requested window

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;
    use tokio::time::{Instant, sleep};

    use jobstore_core::JobId;

    use crate::config::StorageOptions;
    use crate::lock::{LockError, LockPolicy};
    use crate::storage::JobStorage;
    use crate::store::{InMemoryStore, JobState, Mutation, StoreSession};

    fn storage(store: &InMemoryStore, policy: LockPolicy) -> JobStorage<InMemoryStore> {
        JobStorage::new(
            store.clone(),
            StorageOptions::default().with_lock_policy(policy),
        )
        .unwrap()
    }

    async fn exclusive_holders(policy: LockPolicy) {
        let store = InMemoryStore::new();
        let storage = Arc::new(storage(&store, policy));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..5 {
            let storage = storage.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            let completed = completed.clone();
            workers.push(tokio::spawn(async move {
                let mut lock = storage
                    .acquire_distributed_lock_with_timeout("queue:default", Duration::from_secs(60))
                    .await
                    .unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(1500)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                lock.release().await.unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 5);
        assert!(store.snapshot().await.locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transactional_insert_is_mutually_exclusive() {
        exclusive_holders(LockPolicy::TransactionalInsert).await;
    }

    #[tokio::test(start_paused = true)]
    async fn insert_then_claim_is_mutually_exclusive() {
        exclusive_holders(LockPolicy::InsertThenClaim).await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_bounded() {
        let store = InMemoryStore::new();
        let storage = storage(&store, LockPolicy::TransactionalInsert);
        let mut held = storage.acquire_distributed_lock("stats").await.unwrap();

        for timeout_ms in [1, 300, 1000, 2700] {
            let timeout = Duration::from_millis(timeout_ms);
            let started = Instant::now();
            let err = storage
                .acquire_distributed_lock_with_timeout("stats", timeout)
                .await
                .unwrap_err();
            let waited = started.elapsed();

            assert!(matches!(err, LockError::Timeout { .. }));
            assert!(waited >= timeout, "{waited:?} < {timeout:?}");
            assert!(waited < timeout + Duration::from_secs(1), "{waited:?}");
        }

        held.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn second_worker_gets_the_lock_after_release() {
        let store = InMemoryStore::new();
        let storage = Arc::new(storage(&store, LockPolicy::TransactionalInsert));

        let mut a = storage
            .acquire_distributed_lock_with_timeout("queue:default", Duration::from_secs(5))
            .await
            .unwrap();

        let started = Instant::now();
        let err = storage
            .acquire_distributed_lock_with_timeout("queue:default", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Could not place a lock on the resource 'queue:default': Lock timeout."
        );
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));

        let waiter = {
            let storage = storage.clone();
            tokio::spawn(async move {
                storage
                    .acquire_distributed_lock_with_timeout("queue:default", Duration::from_secs(5))
                    .await
            })
        };
        sleep(Duration::from_millis(2500)).await;
        a.release().await.unwrap();

        let mut b = waiter.await.unwrap().unwrap();
        assert_eq!(b.resource(), "queue:default");
        b.release().await.unwrap();
        assert!(store.snapshot().await.lock("queue:default").is_none());
    }

    #[tokio::test]
    async fn failure_at_any_operation_leaves_the_store_unchanged() {
        let store = InMemoryStore::new();
        let storage = storage(&store, LockPolicy::default());
        let job = store.create_job().await;

        let mut seed = storage.write_transaction();
        seed.insert_to_list("history", "seed").add_to_set("tags", "seed");
        seed.commit().await.unwrap();
        let before = store.snapshot().await;

        let kinds = [
            "set_job_state",
            "insert_counter",
            "upsert_set_member",
            "enqueue_job",
            "trim_list",
        ];
        for (k, failing) in kinds.iter().enumerate() {
            let failing = *failing;
            store.clear_faults();
            store.fail_when(move |m| m.kind() == failing);

            let mut tx = storage.write_transaction();
            tx.set_job_state(job, JobState::new("Enqueued"))
                .increment_counter("stats:enqueued")
                .add_to_set("tags", "fresh")
                .add_to_queue("default", job)
                .trim_list("history", 0, 0);

            let err = tx.commit().await.unwrap_err();
            assert!(err.to_string().contains(&format!("#{k}")), "{err}");
            assert_eq!(store.snapshot().await, before, "failure at {failing}");
        }
        store.clear_faults();
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let store = InMemoryStore::new();
        let storage = storage(&store, LockPolicy::default());

        for _ in 0..2 {
            let mut tx = storage.write_transaction();
            tx.add_to_set_with_score("schedule", "job:1", 10.0)
                .set_range_in_hash("recurring-job:nightly", [("Cron", "0 0 * * *")]);
            tx.commit().await.unwrap();
        }

        let snapshot = store.snapshot().await;
        let members = snapshot.set_members("schedule");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].score, 10.0);
        assert_eq!(snapshot.hashes.len(), 1);

        let mut tx = storage.write_transaction();
        tx.add_to_set_with_score("schedule", "job:1", 20.0)
            .set_range_in_hash("recurring-job:nightly", [("Cron", "*/5 * * * *")]);
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.set_members("schedule")[0].score, 20.0);
        assert_eq!(
            snapshot.hash("recurring-job:nightly").get("Cron"),
            Some(&"*/5 * * * *")
        );
    }

    #[tokio::test]
    async fn trim_keeps_the_inclusive_window() {
        let store = InMemoryStore::new();
        let storage = storage(&store, LockPolicy::default());

        let mut tx = storage.write_transaction();
        for value in ["e0", "e1", "e2", "e3", "e4", "e5"] {
            tx.insert_to_list("succeeded", value);
        }
        tx.insert_to_list("failed", "untouched");
        tx.trim_list("succeeded", 2, 4);
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.list_values("succeeded"), vec!["e2", "e3", "e4"]);
        assert_eq!(snapshot.list_values("failed"), vec!["untouched"]);

        let mut tx = storage.write_transaction();
        tx.trim_list("succeeded", 0, usize::MAX);
        tx.commit().await.unwrap();
        assert_eq!(
            store.snapshot().await.list_values("succeeded"),
            vec!["e2", "e3", "e4"]
        );
    }

    #[tokio::test]
    async fn counters_aggregate_deltas() {
        let store = InMemoryStore::new();
        let storage = storage(&store, LockPolicy::default());

        let mut tx = storage.write_transaction();
        tx.increment_counter("stats:succeeded")
            .increment_counter("stats:succeeded")
            .increment_counter_with_expiry("stats:succeeded", Duration::from_secs(86_400))
            .decrement_counter("stats:succeeded")
            .decrement_counter_with_expiry("stats:failed", Duration::from_secs(60));
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.counter_value("stats:succeeded"), 2);
        assert_eq!(snapshot.counter_value("stats:failed"), -1);
        assert_eq!(snapshot.counters.len(), 5);
        assert_eq!(
            snapshot.counters.iter().filter(|c| c.expire_at.is_some()).count(),
            2
        );
    }

    #[tokio::test]
    async fn queued_jobs_keep_commit_order() {
        let store = InMemoryStore::new();
        let storage = storage(&store, LockPolicy::default());

        let mut tx = storage.write_transaction();
        for id in [3, 1, 2] {
            tx.add_to_queue("default", JobId::new(id));
        }
        tx.commit().await.unwrap();

        assert_eq!(
            store.snapshot().await.queued_jobs("default"),
            vec![JobId::new(3), JobId::new(1), JobId::new(2)]
        );
    }

    #[tokio::test]
    async fn lock_holder_can_write_through_the_same_session() {
        let store = InMemoryStore::new();
        let storage = storage(&store, LockPolicy::default());

        let mut lock = storage.acquire_distributed_lock("recurring-jobs").await.unwrap();
        lock.session()
            .execute(&Mutation::InsertListValue {
                key: "log".to_string(),
                value: "scheduled".to_string(),
            })
            .await
            .unwrap();
        lock.release().await.unwrap();

        assert_eq!(store.snapshot().await.list_values("log"), vec!["scheduled"]);
    }

    proptest! {
        #[test]
        fn trim_window_matches_slice(len in 0usize..10, start in 0usize..12, end in 0usize..12) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let kept = runtime.block_on(async {
                let store = InMemoryStore::new();
                let storage = storage(&store, LockPolicy::default());
                let mut tx = storage.write_transaction();
                for i in 0..len {
                    tx.insert_to_list("l", format!("v{i}"));
                }
                tx.trim_list("l", start, end);
                tx.commit().await.unwrap();
                store
                    .snapshot()
                    .await
                    .list_values("l")
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            });

            let expected: Vec<String> = (0..len)
                .filter(|rank| *rank >= start && *rank <= end)
                .map(|i| format!("v{i}"))
                .collect();
            prop_assert_eq!(kept, expected);
        }
    }
}
