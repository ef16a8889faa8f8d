use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use crate::error::{ProxyError, Result};

/// 有界的阻塞任务池
///
/// 任务在 tokio 的 blocking 线程上执行，并发数由信号量限制，
/// 不会占用事件循环。`destroy` 之后所有等待中和后续的调用都返回
/// `ProxyError::MatcherDestroyed`。
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    destroyed: AtomicBool,
    size: usize,
}

/// 运行中任务计数，随任务结束自动归还
struct InFlight {
    counter: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl InFlight {
    fn new(counter: Arc<AtomicUsize>, idle: Arc<Notify>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter, idle }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_one();
        }
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            destroyed: AtomicBool::new(false),
            size,
        }
    }

    /// 按 CPU 核心数自适应：每核 2 个 worker
    pub fn with_cpu_scaling() -> Self {
        Self::new(num_cpus::get() * 2)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub async fn exec<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_destroyed() {
            return Err(ProxyError::MatcherDestroyed);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::MatcherDestroyed)?;

        let guard = InFlight::new(self.in_flight.clone(), self.idle.clone());
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _guard = guard;
            job()
        });

        handle.await.map_err(|e| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("worker task failed: {}", e),
            ))
        })
    }

    /// 关闭任务池：拒绝新任务，最多等待 `wait` 让运行中的任务结束
    pub async fn destroy(&self, wait: Duration) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();

        let drained = tokio::time::timeout(wait, async {
            while self.in_flight() > 0 {
                self.idle.notified().await;
            }
        })
        .await;

        match drained {
            Ok(()) => debug!("worker pool 已关闭"),
            Err(_) => warn!(
                "worker pool 关闭超时，仍有 {} 个任务在运行",
                self.in_flight()
            ),
        }
    }
}
