use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, timeout, Instant};

use crate::metrics::Metrics;
use crate::once::ErrorReporter;

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
    /// 两端都正常结束
    Closed,
    /// 空闲超时，两端一起关闭
    IdleTimeout,
    /// 任一端出错，另一端随之关闭
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub outcome: PipeOutcome,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn reader_side(self) -> &'static str {
        match self {
            Direction::Up => "client",
            Direction::Down => "socket",
        }
    }

    fn writer_side(self) -> &'static str {
        match self {
            Direction::Up => "socket",
            Direction::Down => "client",
        }
    }
}

/// 最近一次成功写出的时间，两个方向共用
struct Activity(Mutex<Instant>);

impl Activity {
    fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Pump<'a> {
    idle: Duration,
    activity: &'a Activity,
    metrics: &'a Metrics,
    reporter: &'a ErrorReporter,
}

impl Pump<'_> {
    /// 单方向转发，读到 EOF 后关闭对端写方向并返回
    async fn run<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        direction: Direction,
        counter: &AtomicU64,
    ) -> std::result::Result<(), PipeOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("{} socket ended", direction.reader_side());
                    match timeout(self.idle, writer.shutdown()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("关闭{}写方向失败: {}", direction.writer_side(), e),
                        Err(_) => debug!("关闭{}写方向超时", direction.writer_side()),
                    }
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => {
                    self.reporter
                        .report(format!("{} error: '{}'", direction.reader_side(), e));
                    return Err(PipeOutcome::Error);
                }
            };

            if let Err(e) = writer.write_all(&buf[..n]).await {
                self.reporter
                    .report(format!("{} error: '{}'", direction.writer_side(), e));
                return Err(PipeOutcome::Error);
            }

            counter.fetch_add(n as u64, Ordering::Relaxed);
            match direction {
                Direction::Up => self.metrics.add_bytes_up(n as u64),
                Direction::Down => self.metrics.add_bytes_down(n as u64),
            }
            self.activity.touch();
        }
    }

    /// 超过 `idle` 没有任何一个方向写出数据时返回
    async fn watchdog(&self) {
        loop {
            let deadline = self.activity.last() + self.idle;
            if Instant::now() >= deadline {
                return;
            }
            sleep_until(deadline).await;
        }
    }
}

/// 双向转发
///
/// 两个方向并发进行，一个方向写阻塞不影响另一个方向读取。
/// 一端读到 EOF 时只关闭另一端的写方向，另一方向继续转发直到也结束。
/// 任一端出错立即结束，两端随返回一起被 drop。
/// 超过 `idle` 没有任何数据写出时结束，包括对端停止读取导致写阻塞的情况。
pub async fn pipe<C, U>(
    client: C,
    upstream: U,
    idle: Duration,
    metrics: &Metrics,
    reporter: &ErrorReporter,
) -> PipeStats
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (client_read, client_write) = split(client);
    let (upstream_read, upstream_write) = split(upstream);

    let activity = Activity::new();
    let pump = Pump {
        idle,
        activity: &activity,
        metrics,
        reporter,
    };
    let bytes_up = AtomicU64::new(0);
    let bytes_down = AtomicU64::new(0);

    let transfer = async {
        tokio::try_join!(
            pump.run(client_read, upstream_write, Direction::Up, &bytes_up),
            pump.run(upstream_read, client_write, Direction::Down, &bytes_down),
        )
    };

    let outcome = tokio::select! {
        res = transfer => match res {
            Ok(_) => PipeOutcome::Closed,
            Err(outcome) => outcome,
        },
        _ = pump.watchdog() => {
            debug!("隧道空闲超过 {:?}，关闭", idle);
            PipeOutcome::IdleTimeout
        }
    };

    PipeStats {
        bytes_up: bytes_up.load(Ordering::Relaxed),
        bytes_down: bytes_down.load(Ordering::Relaxed),
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::duplex;

    fn reporter() -> (ErrorReporter, Arc<AtomicUsize>) {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let reporter = ErrorReporter::new("tunnel test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (reporter, errors)
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, mut upstream_far) = duplex(1024);
        let metrics = Metrics::new();
        let (reporter, errors) = reporter();

        let task = {
            let metrics = metrics.clone();
            let reporter = reporter.clone();
            tokio::spawn(async move {
                pipe(
                    client_near,
                    upstream_near,
                    Duration::from_secs(5),
                    &metrics,
                    &reporter,
                )
                .await
            })
        };

        client_far.write_all(b"hello").await.unwrap();
        client_far.shutdown().await.unwrap();

        let mut received = Vec::new();
        upstream_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");

        // 客户端已半关闭，上游仍可回写
        upstream_far.write_all(b"world!").await.unwrap();
        upstream_far.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client_far.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"world!");

        let stats = task.await.unwrap();
        assert_eq!(stats.outcome, PipeOutcome::Closed);
        assert_eq!(stats.bytes_up, 5);
        assert_eq!(stats.bytes_down, 6);
        assert_eq!(metrics.snapshot().bytes_up, 5);
        assert_eq!(metrics.snapshot().bytes_down, 6);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (client_near, _client_far) = duplex(1024);
        let (upstream_near, _upstream_far) = duplex(1024);
        let (reporter, _) = reporter();

        let stats = pipe(
            client_near,
            upstream_near,
            Duration::from_millis(50),
            &Metrics::new(),
            &reporter,
        )
        .await;
        assert_eq!(stats.outcome, PipeOutcome::IdleTimeout);
    }

    #[tokio::test]
    async fn test_write_error_reported_once() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);
        drop(upstream_far);
        let (reporter, errors) = reporter();

        client_far.write_all(b"data").await.unwrap();
        let stats = pipe(
            client_near,
            upstream_near,
            Duration::from_secs(5),
            &Metrics::new(),
            &reporter,
        )
        .await;

        assert_eq!(stats.outcome, PipeOutcome::Error);
        // 同一连接的后续上报不再计数
        reporter.report("second failure");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(reporter.has_reported());
    }

    #[tokio::test]
    async fn test_stalled_peers_end_within_idle() {
        let (client_near, mut client_far) = duplex(4096);
        let (upstream_near, mut upstream_far) = duplex(4096);
        let (reporter, _) = reporter();
        let payload = vec![7u8; 256 * 1024];

        // 两端都先写后读，缓冲区写满后双方都不再前进
        let client_payload = payload.clone();
        let client_task = tokio::spawn(async move {
            let _ = client_far.write_all(&client_payload).await;
            let mut sink = Vec::new();
            let _ = client_far.read_to_end(&mut sink).await;
        });
        let upstream_task = tokio::spawn(async move {
            let _ = upstream_far.write_all(&payload).await;
            let mut sink = Vec::new();
            let _ = upstream_far.read_to_end(&mut sink).await;
        });

        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            pipe(
                client_near,
                upstream_near,
                Duration::from_millis(300),
                &Metrics::new(),
                &reporter,
            ),
        )
        .await
        .expect("pipe must end once no data moves for the idle period");

        assert_eq!(stats.outcome, PipeOutcome::IdleTimeout);
        assert!(stats.bytes_up > 0);
        assert!(stats.bytes_down > 0);

        client_task.await.unwrap();
        upstream_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_both_directions_flow_concurrently() {
        let (client_near, client_far) = duplex(4096);
        let (upstream_near, upstream_far) = duplex(4096);
        let (reporter, errors) = reporter();

        let task = tokio::spawn(async move {
            pipe(
                client_near,
                upstream_near,
                Duration::from_secs(5),
                &Metrics::new(),
                &reporter,
            )
            .await
        });

        // 两端同时写入远大于缓冲区的数据，同时读取对方的数据
        let size = 128 * 1024;
        let client_side = tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(client_far);
            let writer = async {
                w.write_all(&vec![1u8; size]).await.unwrap();
                w.shutdown().await.unwrap();
            };
            let reader = async {
                let mut got = Vec::new();
                r.read_to_end(&mut got).await.unwrap();
                got
            };
            let (_, got) = tokio::join!(writer, reader);
            got
        });
        let upstream_side = tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(upstream_far);
            let writer = async {
                w.write_all(&vec![2u8; size]).await.unwrap();
                w.shutdown().await.unwrap();
            };
            let reader = async {
                let mut got = Vec::new();
                r.read_to_end(&mut got).await.unwrap();
                got
            };
            let (_, got) = tokio::join!(writer, reader);
            got
        });

        let from_upstream = client_side.await.unwrap();
        let from_client = upstream_side.await.unwrap();
        assert_eq!(from_upstream, vec![2u8; size]);
        assert_eq!(from_client, vec![1u8; size]);

        let stats = task.await.unwrap();
        assert_eq!(stats.outcome, PipeOutcome::Closed);
        assert_eq!(stats.bytes_up, size as u64);
        assert_eq!(stats.bytes_down, size as u64);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }
}
