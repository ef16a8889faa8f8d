use futures::future::try_join_all;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::dns::DnsCache;
use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use crate::worker_pool::WorkerPool;

/// 内网网段
pub const PRIVATE_NETWORKS: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// 销毁时等待运行中任务的上限
const DESTROY_WAIT: Duration = Duration::from_secs(1);

lazy_static! {
    static ref INTERNAL_NET_MATCHERS: Mutex<HashMap<String, Arc<NetMatcher>>> =
        Mutex::new(HashMap::new());
}

/// CIDR 网段（加载后不可变）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetBlock {
    V4 { network: u32, mask: u32, prefix_len: u8 },
    V6 { network: u128, mask: u128, prefix_len: u8 },
}

impl NetBlock {
    pub fn prefix_len(&self) -> u8 {
        match self {
            NetBlock::V4 { prefix_len, .. } | NetBlock::V6 { prefix_len, .. } => *prefix_len,
        }
    }

    #[inline]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (NetBlock::V4 { network, mask, .. }, IpAddr::V4(v4)) => u32::from(v4) & mask == *network,
            (NetBlock::V6 { network, mask, .. }, IpAddr::V6(v6)) => {
                u128::from(v6) & mask == *network
            }
            _ => false,
        }
    }
}

impl FromStr for NetBlock {
    type Err = ProxyError;

    /// 解析 `a.b.c.d/len`；不带前缀长度时视为单个主机
    fn from_str(cidr: &str) -> Result<Self> {
        let cidr = cidr.trim();
        let (ip_str, prefix_str) = match cidr.split_once('/') {
            Some((ip, prefix)) => (ip.trim(), Some(prefix.trim())),
            None => (cidr, None),
        };

        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| ProxyError::InvalidAddress(cidr.to_string()))?;

        let max = if ip.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix_str {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|len| *len <= max)
                .ok_or_else(|| ProxyError::InvalidAddress(cidr.to_string()))?,
            None => max,
        };

        Ok(match ip {
            IpAddr::V4(v4) => {
                let mask = if prefix_len == 0 { 0 } else { !0u32 << (32 - prefix_len) };
                NetBlock::V4 {
                    network: u32::from(v4) & mask,
                    mask,
                    prefix_len,
                }
            }
            IpAddr::V6(v6) => {
                let mask = if prefix_len == 0 { 0 } else { !0u128 << (128 - prefix_len) };
                NetBlock::V6 {
                    network: u128::from(v6) & mask,
                    mask,
                    prefix_len,
                }
            }
        })
    }
}

impl fmt::Display for NetBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetBlock::V4 { network, prefix_len, .. } => {
                write!(f, "{}/{}", Ipv4Addr::from(*network), prefix_len)
            }
            NetBlock::V6 { network, prefix_len, .. } => {
                write!(f, "{}/{}", Ipv6Addr::from(*network), prefix_len)
            }
        }
    }
}

/// 严格解析一组 CIDR，任何一条无效都返回错误
pub fn parse_net_blocks<S: AsRef<str>>(cidrs: &[S]) -> Result<Vec<NetBlock>> {
    cidrs.iter().map(|c| c.as_ref().parse()).collect()
}

/// 从文件加载 CIDR 列表，每行一条；空行和 `#` 注释跳过，无效行告警后跳过
pub fn load_net_blocks<P: AsRef<Path>>(path: P) -> Result<Vec<NetBlock>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let mut blocks = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<NetBlock>() {
            Ok(block) => blocks.push(block),
            Err(_) => warn!("无效的 CIDR: {}", line),
        }
    }
    info!("从 {} 加载了 {} 个网段", path.as_ref().display(), blocks.len());
    Ok(blocks)
}

/// IP 网段匹配器
///
/// 包含判断在 worker pool 上执行，结果按 IP 字符串精确缓存，永不淘汰
/// （一个 IP 是否属于某个网段在进程生命周期内不会变化）。
pub struct NetMatcher {
    name: String,
    blocks: Arc<Vec<NetBlock>>,
    cache: RwLock<HashMap<String, bool>>,
    pool: WorkerPool,
    dns: Arc<DnsCache>,
    metrics: Metrics,
    evaluations: AtomicU64,
}

impl NetMatcher {
    pub fn new(
        name: impl Into<String>,
        blocks: Vec<NetBlock>,
        dns: Arc<DnsCache>,
        metrics: Metrics,
    ) -> Self {
        Self::with_pool(name, blocks, dns, metrics, WorkerPool::with_cpu_scaling())
    }

    pub fn with_pool(
        name: impl Into<String>,
        blocks: Vec<NetBlock>,
        dns: Arc<DnsCache>,
        metrics: Metrics,
        pool: WorkerPool,
    ) -> Self {
        let name = name.into();
        debug!("NetMatcher[{}]: {} 个网段, {} 个 worker", name, blocks.len(), pool.size());
        Self {
            name,
            blocks: Arc::new(blocks),
            cache: RwLock::new(HashMap::new()),
            pool,
            dns,
            metrics,
            evaluations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blocks(&self) -> &[NetBlock] {
        &self.blocks
    }

    /// worker 上实际执行过的包含判断次数
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.pool.is_destroyed()
    }

    /// 在 worker pool 上判断 IP 是否属于任一网段（不走缓存）
    pub async fn contains_ip(&self, ip: &str) -> Result<bool> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| ProxyError::InvalidAddress(ip.to_string()))?;
        let blocks = Arc::clone(&self.blocks);

        let contained = self
            .pool
            .exec(move || blocks.iter().any(|b| b.contains(addr)))
            .await?;
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        Ok(contained)
    }

    /// 先查缓存，未命中时调用 `contains_ip` 并写入缓存
    pub async fn cached_contains_ip(&self, ip: &str) -> Result<bool> {
        if self.is_destroyed() {
            return Err(ProxyError::MatcherDestroyed);
        }

        let cached = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ip)
            .copied();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        self.metrics.inc_ip_determine();
        let contained = self.contains_ip(ip).await?;
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ip.to_string(), contained);
        Ok(contained)
    }

    /// 域名解析后判断：任一地址落在网段内即为 true
    ///
    /// 字面 IP 直接判断，不走 DNS。DNS 失败和超时原样向上返回，
    /// 由调用方决定如何降级。
    pub async fn resolve_and_check(&self, hostname: &str) -> Result<bool> {
        if self.is_destroyed() {
            return Err(ProxyError::MatcherDestroyed);
        }

        let literal = hostname.trim_start_matches('[').trim_end_matches(']');
        if literal.parse::<IpAddr>().is_ok() {
            return self.cached_contains_ip(literal).await;
        }

        let ips = self.dns.resolve(hostname).await?;
        let results = try_join_all(ips.iter().map(|ip| {
            let ip = ip.to_string();
            async move { self.cached_contains_ip(&ip).await }
        }))
        .await?;

        Ok(results.into_iter().any(|hit| hit))
    }

    /// 释放 worker pool，之后所有调用都返回 `MatcherDestroyed`
    pub async fn destroy(&self) {
        self.pool.destroy(DESTROY_WAIT).await;
        info!("NetMatcher[{}] 已销毁", self.name);
    }
}

impl fmt::Debug for NetMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetMatcher")
            .field("name", &self.name)
            .field("blocks", &self.blocks.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// 内网匹配器（10/8, 172.16/12, 192.168/16）
pub fn create_internal_net_matcher(dns: Arc<DnsCache>, metrics: Metrics) -> NetMatcher {
    let blocks = PRIVATE_NETWORKS
        .iter()
        .filter_map(|c| c.parse().ok())
        .collect();
    NetMatcher::new("internal", blocks, dns, metrics)
}

/// 区域网段匹配器
pub fn create_regional_net_matcher(
    blocks: Vec<NetBlock>,
    dns: Arc<DnsCache>,
    metrics: Metrics,
) -> NetMatcher {
    NetMatcher::new("regional", blocks, dns, metrics)
}

/// 按 key 共享的内网匹配器
///
/// 同一个 key 总是返回同一个实例；不同 key 的实例缓存互相独立。
/// `dns` 和 `metrics` 只在第一次创建该 key 时使用。
pub fn get_internal_net_matcher(key: &str, dns: &Arc<DnsCache>, metrics: &Metrics) -> Arc<NetMatcher> {
    let mut registry = INTERNAL_NET_MATCHERS
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    registry
        .entry(key.to_string())
        .or_insert_with(|| {
            debug!("创建内网匹配器: {}", key);
            Arc::new(create_internal_net_matcher(Arc::clone(dns), metrics.clone()))
        })
        .clone()
}
