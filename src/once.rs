use log::{debug, error};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 单次触发守卫
///
/// `first` 至多执行一次（第一次调用时），`always` 每次都执行并返回结果。
#[derive(Debug, Default)]
pub struct RunOnce {
    fired: AtomicBool,
}

impl RunOnce {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    pub fn call<R>(&self, first: impl FnOnce(), always: impl FnOnce() -> R) -> R {
        if !self.fired.swap(true, Ordering::AcqRel) {
            first();
        }
        always()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// 连接级错误上报
///
/// 同一个连接的客户端侧和上游侧可能因为同一个事件各报一次错，
/// 这里保证每个连接最多一条 error 日志和一次错误计数，其余降级为 debug。
#[derive(Clone)]
pub struct ErrorReporter {
    once: Arc<RunOnce>,
    context: Arc<str>,
    on_first: Arc<dyn Fn() + Send + Sync>,
}

impl ErrorReporter {
    pub fn new(context: impl Into<String>, on_first: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            once: Arc::new(RunOnce::new()),
            context: Arc::from(context.into()),
            on_first: Arc::new(on_first),
        }
    }

    /// 上报错误，返回是否是本连接的第一次上报
    pub fn report(&self, message: impl Display) -> bool {
        let mut first = false;
        self.once.call(
            || {
                first = true;
                error!("{}: {}", self.context, message);
                (self.on_first)();
            },
            || (),
        );
        if !first {
            debug!("{} (重复错误): {}", self.context, message);
        }
        first
    }

    pub fn has_reported(&self) -> bool {
        self.once.has_fired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_run_once_first_only() {
        let once = RunOnce::new();
        let mut first_calls = 0;
        let mut always_calls = 0;

        for i in 0..3 {
            let r = once.call(|| first_calls += 1, || {
                always_calls += 1;
                i * 2
            });
            assert_eq!(r, i * 2);
        }

        assert_eq!(first_calls, 1);
        assert_eq!(always_calls, 3);
        assert!(once.has_fired());
    }

    #[test]
    fn test_error_reporter_dedup() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let reporter = ErrorReporter::new("connect example.com:443", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let other_side = reporter.clone();

        assert!(!reporter.has_reported());
        assert!(reporter.report("client reset"));
        assert!(!other_side.report("upstream reset"));
        assert!(!reporter.report("again"));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(other_side.has_reported());
    }
}
