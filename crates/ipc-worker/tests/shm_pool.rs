mod common;

use bytes::Bytes;
use common::*;
use core::time::Duration;
use ipc_worker::{Error, PoolConfig, ShmPool, WorkerInfo, WorkerState};
use std::sync::Arc;

async fn started<W: ipc_worker::Worker>(
    config: PoolConfig,
    factory: impl Fn(&WorkerInfo) -> W + Send + Sync + 'static,
) -> ShmPool {
    let mut pool = ShmPool::new(config, factory).unwrap();
    within(pool.start()).await.unwrap();
    pool
}

async fn shutdown(pool: &ShmPool) {
    pool.terminate();
    within(pool.join()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_with_two_workers() {
    let pool = started(config("shm_echo", 2), |_| Echo).await;
    assert_echo(&pool).await;
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streamed_reply_arrives_in_order() {
    let pool = started(config("shm_stream", 1), |_| Spell).await;
    assert_stream_in_order(&pool).await;
    assert_stream_by_seq(&pool).await;
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_streams_are_not_mixed() {
    let pool = started(config("shm_interleave", 3), |_| Spell).await;
    assert_interleaved_streams(&pool).await;
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_get_their_own_replies() {
    let pool = Arc::new(started(config("shm_concurrent", 4), |_| Echo).await);

    let callers: Vec<_> = (0..32)
        .map(|i| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let payload = Bytes::from(format!("req-{i}"));
                let id = pool.put(payload.clone()).await.unwrap();
                let reply = within(pool.get(id, None)).await.unwrap();
                assert_eq!(reply, payload);
            })
        })
        .collect();
    for caller in callers {
        caller.await.unwrap();
    }
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_callers_across_workers_all_complete() {
    let pool = Arc::new(started(config("shm_stress", 4), |_| Spell).await);

    let callers: Vec<_> = (0..64)
        .map(|i| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                for round in 0..8 {
                    let word = format!("{i}-{round}");
                    let id = pool.put(Bytes::from(word.clone())).await.unwrap();
                    let mut got = Vec::new();
                    while let Some(item) = pool.get(id, None).await {
                        got.extend_from_slice(&item);
                    }
                    assert_eq!(got, word.as_bytes());
                }
            })
        })
        .collect();
    within(async {
        for caller in callers {
            caller.await.unwrap();
        }
    })
    .await;
    assert_eq!(pool.correlator().pending_requests(), 0);
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streamed_elements_arrive_as_they_are_produced() {
    let pool = started(config("shm_stall", 1), |_| Stalling).await;
    assert_stream_not_held_back(&pool).await;
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_stream_is_not_left_pending() {
    let pool = started(config("shm_empty", 1), |_| Spell).await;
    assert_empty_stream_completes(&pool).await;
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_workers_are_never_dispatched_to() {
    let pool = started(config("shm_busy", 2), |_| Slow).await;
    let long = Pool::put(&pool, "300").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The second worker answers while the first is still sleeping.
    let short = Pool::put(&pool, "1").await;
    assert_eq!(Pool::get(&pool, short, None).await.unwrap(), "1");
    assert!(pool.correlator().is_pending(long));
    assert_eq!(Pool::get(&pool, long, None).await.unwrap(), "300");
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_payload_is_rejected() {
    let config = PoolConfig::builder()
        .group_name("shm_small")
        .shm_size(4)
        .build()
        .unwrap();
    let pool = started(config, |_| Echo).await;
    assert_eq!(pool.segment_capacity(), 4);

    let err = pool.put(&b"12345"[..]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::PayloadTooLarge {
            size: 5,
            capacity: 4
        }
    ));
    let id = Pool::put(&pool, "1234").await;
    assert_eq!(Pool::get(&pool, id, None).await.unwrap(), "1234");
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_hook_does_not_stop_the_worker() {
    let pool = started(config("shm_hook", 1), |_| Faulty).await;
    let failed = Pool::put(&pool, "boom").await;
    let ok = Pool::put(&pool, "fine").await;
    assert_eq!(Pool::get(&pool, ok, None).await.unwrap(), "fine");
    assert!(pool.correlator().is_pending(failed));
    assert_ne!(pool.worker_states()[0], WorkerState::Stopped);
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_worker_leaves_the_rest_serving() {
    let pool = started(config("shm_crash", 2), |_| Faulty).await;
    Pool::put(&pool, "panic").await;

    within(async {
        while !pool.workers().iter().any(|w| w.is_finished()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    let states = pool.worker_states();
    assert_eq!(states.iter().filter(|s| **s == WorkerState::Stopped).count(), 1);

    for payload in ["a", "b", "c"] {
        let id = Pool::put(&pool, payload).await;
        assert_eq!(Pool::get(&pool, id, None).await.unwrap(), payload);
    }
    shutdown(&pool).await;
    assert!(pool.workers().iter().all(|w| w.is_finished()));
    assert!(pool.managers().iter().all(|m| m.is_finished()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminate_releases_blocked_getters() {
    let pool = Arc::new(started(config("shm_terminate", 1), |_| Faulty).await);
    let id = Pool::put(&*pool, "boom").await;

    let getter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get(id, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!getter.is_finished());

    shutdown(&pool).await;
    assert_eq!(within(getter).await.unwrap(), None);
    assert!(matches!(
        pool.put(&b"late"[..]).await.unwrap_err(),
        Error::ServiceShutdown
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn roles_and_segments_are_named_after_the_group() {
    let config = PoolConfig::builder()
        .group_name("named")
        .worker_num(2)
        .manager_num(2)
        .build()
        .unwrap();
    let mut pool = ShmPool::new(config, |_: &WorkerInfo| Echo).unwrap();
    pool.start().await.unwrap();
    assert!(matches!(pool.start().await, Err(Error::AlreadyStarted)));

    let workers: Vec<_> = pool.workers().iter().map(|w| w.name()).collect();
    let managers: Vec<_> = pool.managers().iter().map(|m| m.name()).collect();
    assert_eq!(workers, ["named_worker_0", "named_worker_1"]);
    assert_eq!(managers, ["named_manager_0", "named_manager_1"]);
    assert_eq!(pool.segment_names(), ["named_jid_0", "named_jid_1"]);
    shutdown(&pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn daemon_pool_terminates_when_dropped() {
    let config = PoolConfig::builder()
        .group_name("shm_daemon")
        .daemon(true)
        .build()
        .unwrap();
    let quit = config.quit.clone();
    let pool = started(config, |_| Echo).await;
    drop(pool);
    assert!(quit.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plain_pool_outlives_its_handle() {
    let config = PoolConfig::builder()
        .group_name("shm_plain")
        .build()
        .unwrap();
    let quit = config.quit.clone();
    let pool = started(config, |_| Echo).await;
    drop(pool);
    assert!(!quit.is_cancelled());
    quit.cancel();
}
