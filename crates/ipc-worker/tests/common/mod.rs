#![allow(dead_code)]

use bytes::Bytes;
use core::time::Duration;
use ipc_worker::{HookResult, PoolConfig, Reply, RequestId, Seq, Worker, WorkerInfo};
use std::{future::Future, time::Instant};

/// Replies with the request payload.
pub struct Echo;

impl Worker for Echo {
    fn on_request(&mut self, payload: Bytes) -> HookResult<Reply> {
        Ok(Reply::Single(payload))
    }
}

/// Streams the payload back one byte per fragment.
pub struct Spell;

impl Worker for Spell {
    fn on_request(&mut self, payload: Bytes) -> HookResult<Reply> {
        let items: Vec<Bytes> = (0..payload.len()).map(|i| payload.slice(i..=i)).collect();
        Ok(Reply::stream(items))
    }
}

/// Echoes, except `boom` fails the hook and `panic` kills the worker.
pub struct Faulty;

impl Worker for Faulty {
    fn on_request(&mut self, payload: Bytes) -> HookResult<Reply> {
        match payload.as_ref() {
            b"boom" => Err("boom".into()),
            b"panic" => panic!("worker fault"),
            _ => Ok(Reply::Single(payload)),
        }
    }
}

/// Sleeps for the number of milliseconds in the payload, then echoes it.
pub struct Slow;

impl Worker for Slow {
    fn on_request(&mut self, payload: Bytes) -> HookResult<Reply> {
        let millis: u64 = std::str::from_utf8(&payload)?.parse()?;
        std::thread::sleep(Duration::from_millis(millis));
        Ok(Reply::Single(payload))
    }
}

/// How long [`Stalling`] blocks between its two stream elements.
pub const STALL: Duration = Duration::from_secs(2);

/// Streams `first`, then blocks for [`STALL`] before producing `second`.
pub struct Stalling;

impl Worker for Stalling {
    fn on_request(&mut self, _: Bytes) -> HookResult<Reply> {
        let items = [Bytes::from_static(b"first"), Bytes::from_static(b"second")]
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                if i > 0 {
                    std::thread::sleep(STALL);
                }
                item
            });
        Ok(Reply::stream(items))
    }
}

/// Tags each reply with the worker that produced it.
pub struct Tagged {
    pub name: String,
}

impl Tagged {
    pub fn new(info: &WorkerInfo) -> Self {
        Self {
            name: info.name.clone(),
        }
    }
}

impl Worker for Tagged {
    fn on_request(&mut self, _: Bytes) -> HookResult<Reply> {
        Ok(Reply::from(self.name.clone().into_bytes()))
    }
}

/// Test pools terminate when dropped, so a failed assertion unwinds into a
/// clean shutdown instead of leaving worker threads behind.
pub fn config(group: &str, workers: usize) -> PoolConfig {
    PoolConfig::builder()
        .group_name(group)
        .worker_num(workers)
        .daemon(true)
        .build()
        .unwrap()
}

/// Bounds a pool call so a lost reply fails the test instead of hanging it.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}

/// Abstracts the two pools so tests can share assertions.
pub trait Pool {
    fn put(&self, payload: &'static str) -> impl Future<Output = RequestId>;
    fn get(&self, id: RequestId, seq: Option<Seq>) -> impl Future<Output = Option<Bytes>>;
}

impl Pool for ipc_worker::ShmPool {
    async fn put(&self, payload: &'static str) -> RequestId {
        within(ipc_worker::ShmPool::put(self, payload)).await.unwrap()
    }

    async fn get(&self, id: RequestId, seq: Option<Seq>) -> Option<Bytes> {
        within(ipc_worker::ShmPool::get(self, id, seq)).await
    }
}

impl Pool for ipc_worker::ZmqPool {
    async fn put(&self, payload: &'static str) -> RequestId {
        within(ipc_worker::ZmqPool::put(self, payload)).await.unwrap()
    }

    async fn get(&self, id: RequestId, seq: Option<Seq>) -> Option<Bytes> {
        within(ipc_worker::ZmqPool::get(self, id, seq)).await
    }
}

pub async fn assert_echo(pool: &impl Pool) {
    let x = pool.put("x").await;
    let y = pool.put("y").await;
    assert!(y > x);

    assert_eq!(pool.get(y, None).await.unwrap(), "y");
    assert_eq!(pool.get(x, None).await.unwrap(), "x");
    // Fully consumed ids are unknown from then on.
    assert_eq!(pool.get(x, None).await, None);
}

pub async fn assert_stream_in_order(pool: &impl Pool) {
    let id = pool.put("abc").await;
    for expected in ["a", "b", "c"] {
        assert_eq!(pool.get(id, None).await.unwrap(), expected);
    }
    assert_eq!(pool.get(id, None).await, None);
}

pub async fn assert_stream_by_seq(pool: &impl Pool) {
    let id = pool.put("abc").await;
    assert_eq!(pool.get(id, Some(2)).await.unwrap(), "c");
    assert_eq!(pool.get(id, Some(0)).await.unwrap(), "a");
    assert_eq!(pool.get(id, Some(1)).await.unwrap(), "b");
    assert_eq!(pool.get(id, None).await, None);
}

pub async fn assert_interleaved_streams(pool: &impl Pool) {
    let words = ["one", "two", "three", "four", "five", "six"];
    let mut ids = Vec::new();
    for word in words {
        ids.push(pool.put(word).await);
    }
    // Drain in reverse submission order so fragments pile up in the buffers.
    for (id, word) in ids.into_iter().zip(words).rev() {
        let mut got = Vec::new();
        for _ in 0..word.len() {
            got.extend_from_slice(&pool.get(id, None).await.unwrap());
        }
        assert_eq!(got, word.as_bytes());
    }
}

pub async fn assert_stream_not_held_back(pool: &impl Pool) {
    let id = pool.put("").await;
    let started = Instant::now();
    assert_eq!(pool.get(id, None).await.unwrap(), "first");
    let waited = started.elapsed();
    assert!(waited < STALL / 2, "first element arrived after {waited:?}");

    assert_eq!(pool.get(id, None).await.unwrap(), "second");
    assert_eq!(pool.get(id, None).await, None);
}

pub async fn assert_empty_stream_completes(pool: &impl Pool) {
    let id = pool.put("").await;
    assert_eq!(pool.get(id, None).await, None);
}
