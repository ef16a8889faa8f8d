use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DIRECT_CHECK_TOTAL: &str = "direct_check_total";
const REQUEST_TOTAL: &str = "request_total";
const CONNECT_TOTAL: &str = "connect_total";
const DNS_QUERY_TOTAL: &str = "dns_query_total";

/// 带标签的计数器：(指标名, hostname, 布尔标签名, 布尔标签值)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct LabelKey {
    name: &'static str,
    hostname: String,
    flag: &'static str,
    value: bool,
}

/// 代理服务器的监控指标
///
/// 只负责计数，不负责暴露方式；`render` 输出 Prometheus 文本格式，
/// 由服务器在管理路径上返回。
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 带标签的计数器
    labeled: Mutex<BTreeMap<LabelKey, u64>>,

    // DNS 统计
    dns_query_time_us_total: AtomicU64,
    dns_query_timeout_total: AtomicU64,
    // 方向判定中除超时外的解析失败
    dns_query_error_total: AtomicU64,

    // IP 判定次数（NetMatcher 缓存未命中）
    ip_determine_total: AtomicU64,

    // 客户端统计
    clients: Mutex<HashSet<IpAddr>>,
    client_total: AtomicU64,

    // 连接与流量
    active_connections: AtomicUsize,
    bytes_up_total: AtomicU64,
    bytes_down_total: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                labeled: Mutex::new(BTreeMap::new()),
                dns_query_time_us_total: AtomicU64::new(0),
                dns_query_timeout_total: AtomicU64::new(0),
                dns_query_error_total: AtomicU64::new(0),
                ip_determine_total: AtomicU64::new(0),
                clients: Mutex::new(HashSet::new()),
                client_total: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                bytes_up_total: AtomicU64::new(0),
                bytes_down_total: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    fn inc_labeled(&self, name: &'static str, hostname: &str, flag: &'static str, value: bool) {
        let key = LabelKey {
            name,
            hostname: hostname.to_string(),
            flag,
            value,
        };
        let mut labeled = self
            .inner
            .labeled
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *labeled.entry(key).or_insert(0) += 1;
    }

    fn labeled_value(&self, name: &'static str, hostname: &str, value: bool) -> u64 {
        let labeled = self
            .inner
            .labeled
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        labeled
            .iter()
            .filter(|(k, _)| k.name == name && k.hostname == hostname && k.value == value)
            .map(|(_, v)| *v)
            .sum()
    }

    // 方向判定
    pub fn inc_direct_check(&self, hostname: &str, cached: bool) {
        self.inc_labeled(DIRECT_CHECK_TOTAL, hostname, "cached", cached);
    }

    pub fn get_direct_check(&self, hostname: &str, cached: bool) -> u64 {
        self.labeled_value(DIRECT_CHECK_TOTAL, hostname, cached)
    }

    // 请求统计
    pub fn inc_request(&self, hostname: &str, error: bool) {
        self.inc_labeled(REQUEST_TOTAL, hostname, "error", error);
    }

    pub fn get_request(&self, hostname: &str, error: bool) -> u64 {
        self.labeled_value(REQUEST_TOTAL, hostname, error)
    }

    pub fn inc_connect(&self, hostname: &str, error: bool) {
        self.inc_labeled(CONNECT_TOTAL, hostname, "error", error);
    }

    pub fn get_connect(&self, hostname: &str, error: bool) -> u64 {
        self.labeled_value(CONNECT_TOTAL, hostname, error)
    }

    // DNS 统计
    pub fn inc_dns_query(&self, hostname: &str, cached: bool) {
        self.inc_labeled(DNS_QUERY_TOTAL, hostname, "cached", cached);
    }

    pub fn get_dns_query(&self, hostname: &str, cached: bool) -> u64 {
        self.labeled_value(DNS_QUERY_TOTAL, hostname, cached)
    }

    pub fn add_dns_query_time(&self, elapsed: Duration) {
        self.inner
            .dns_query_time_us_total
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn inc_dns_query_timeout(&self) {
        self.inner.dns_query_timeout_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_dns_query_timeout(&self) -> u64 {
        self.inner.dns_query_timeout_total.load(Ordering::Relaxed)
    }

    pub fn inc_dns_query_error(&self) {
        self.inner.dns_query_error_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_dns_query_error(&self) -> u64 {
        self.inner.dns_query_error_total.load(Ordering::Relaxed)
    }

    pub fn inc_ip_determine(&self) {
        self.inner.ip_determine_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_ip_determine(&self) -> u64 {
        self.inner.ip_determine_total.load(Ordering::Relaxed)
    }

    /// 记录客户端地址，首次出现时返回 true
    pub fn add_client(&self, addr: IpAddr) -> bool {
        let mut clients = self
            .inner
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if clients.insert(addr) {
            self.inner.client_total.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn get_client_total(&self) -> u64 {
        self.inner.client_total.load(Ordering::Relaxed)
    }

    // 连接与流量
    pub fn inc_active_connections(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_connections(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.inner.bytes_up_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.inner.bytes_down_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (direct_checks, requests, connects, dns_queries) = {
            let labeled = self
                .inner
                .labeled
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let sum = |name: &str| -> u64 {
                labeled
                    .iter()
                    .filter(|(k, _)| k.name == name)
                    .map(|(_, v)| *v)
                    .sum()
            };
            (
                sum(DIRECT_CHECK_TOTAL),
                sum(REQUEST_TOTAL),
                sum(CONNECT_TOTAL),
                sum(DNS_QUERY_TOTAL),
            )
        };

        MetricsSnapshot {
            direct_checks,
            requests,
            connects,
            dns_queries,
            dns_query_timeouts: self.get_dns_query_timeout(),
            dns_query_errors: self.get_dns_query_error(),
            ip_determines: self.get_ip_determine(),
            clients: self.get_client_total(),
            active_connections: self.get_active_connections(),
            bytes_up: self.inner.bytes_up_total.load(Ordering::Relaxed),
            bytes_down: self.inner.bytes_down_total.load(Ordering::Relaxed),
            uptime: self.inner.start_time.elapsed(),
        }
    }

    /// Prometheus 文本格式
    pub fn render(&self) -> String {
        let mut out = String::new();

        {
            let labeled = self
                .inner
                .labeled
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for (name, help) in [
                (DIRECT_CHECK_TOTAL, "direct check counter"),
                (REQUEST_TOTAL, "http request counter"),
                (CONNECT_TOTAL, "http connect counter"),
                (DNS_QUERY_TOTAL, "dns query counter"),
            ] {
                let _ = writeln!(out, "# HELP {} {}", name, help);
                let _ = writeln!(out, "# TYPE {} counter", name);
                for (key, value) in labeled.iter().filter(|(k, _)| k.name == name) {
                    let _ = writeln!(
                        out,
                        "{}{{hostname=\"{}\",{}=\"{}\"}} {}",
                        name,
                        escape_label(&key.hostname),
                        key.flag,
                        key.value,
                        value
                    );
                }
            }
        }

        let dns_ms =
            self.inner.dns_query_time_us_total.load(Ordering::Relaxed) as f64 / 1000.0;
        let plain: [(&str, &str, &str, String); 8] = [
            (
                "dns_query_time_ms_total",
                "dns query time (ms)",
                "counter",
                format!("{}", dns_ms),
            ),
            (
                "dns_query_timeout_total",
                "dns query timeout counter",
                "counter",
                self.get_dns_query_timeout().to_string(),
            ),
            (
                "dns_query_error_total",
                "dns query error counter",
                "counter",
                self.get_dns_query_error().to_string(),
            ),
            (
                "ip_determine_total",
                "ip determine counter",
                "counter",
                self.get_ip_determine().to_string(),
            ),
            (
                "client_total",
                "client counter",
                "counter",
                self.get_client_total().to_string(),
            ),
            (
                "active_connections",
                "active connections",
                "gauge",
                self.get_active_connections().to_string(),
            ),
            (
                "bytes_up_total",
                "bytes from clients to upstream",
                "counter",
                self.inner.bytes_up_total.load(Ordering::Relaxed).to_string(),
            ),
            (
                "bytes_down_total",
                "bytes from upstream to clients",
                "counter",
                self.inner.bytes_down_total.load(Ordering::Relaxed).to_string(),
            ),
        ];
        for (name, help, kind, value) in plain {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, value);
        }

        out
    }

    /// 打印监控指标
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        log::info!("=== 性能监控指标 ===");
        log::info!("运行时间: {:?}", snapshot.uptime);
        log::info!("活跃连接: {}", snapshot.active_connections);
        log::info!("客户端数: {}", snapshot.clients);
        log::info!("HTTP 请求: {} | CONNECT: {}", snapshot.requests, snapshot.connects);
        log::info!("方向判定: {} | IP 判定: {}", snapshot.direct_checks, snapshot.ip_determines);
        log::info!(
            "DNS 查询: {} | DNS 超时: {} | DNS 失败: {}",
            snapshot.dns_queries,
            snapshot.dns_query_timeouts,
            snapshot.dns_query_errors
        );
        log::info!("上行流量: {} MB", snapshot.bytes_up / 1024 / 1024);
        log::info!("下行流量: {} MB", snapshot.bytes_down / 1024 / 1024);
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// 监控指标快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub direct_checks: u64,
    pub requests: u64,
    pub connects: u64,
    pub dns_queries: u64,
    pub dns_query_timeouts: u64,
    pub dns_query_errors: u64,
    pub ip_determines: u64,
    pub clients: u64,
    pub active_connections: usize,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub uptime: Duration,
}

/// RAII 风格的连接计数器
pub struct ConnectionGuard {
    metrics: Metrics,
}

impl ConnectionGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inc_active_connections();
        log::debug!("📊 新连接建立 | 活跃连接: {}", metrics.get_active_connections());
        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.dec_active_connections();
        log::debug!("📊 连接关闭 | 活跃连接: {}", self.metrics.get_active_connections());
    }
}
