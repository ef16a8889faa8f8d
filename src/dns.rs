use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::TokioResolver;
use log::debug;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;

/// DNS 查询超时（超时后放弃本次查询，不写缓存）
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// 域名到 IPv4 地址的解析器
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve4(&self, hostname: &str) -> Result<Vec<Ipv4Addr>>;
}

/// 基于 hickory 的解析器，启动时指定 DNS 服务器，运行期间不再修改
#[derive(Clone)]
pub struct HickoryResolver {
    inner: Arc<TokioResolver>,
    servers: Vec<SocketAddr>,
}

impl HickoryResolver {
    pub fn new(servers: Vec<SocketAddr>) -> Result<Self> {
        if servers.is_empty() {
            return Err(ProxyError::Config("DNS 服务器列表不能为空".to_string()));
        }

        let name_servers: Vec<NameServerConfig> = servers
            .iter()
            .map(|addr| NameServerConfig::new(*addr, Protocol::Udp))
            .collect();
        let group = NameServerConfigGroup::from(name_servers);
        let config = ResolverConfig::from_parts(None, vec![], group);

        let resolver =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build();

        Ok(Self {
            inner: Arc::new(resolver),
            servers,
        })
    }

    /// 使用系统 DNS 配置
    pub fn system() -> Result<Self> {
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| ProxyError::Config(format!("读取系统 DNS 配置失败: {}", e)))?
            .build();

        Ok(Self {
            inner: Arc::new(resolver),
            servers: Vec::new(),
        })
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve4(&self, hostname: &str) -> Result<Vec<Ipv4Addr>> {
        let lookup = self
            .inner
            .ipv4_lookup(hostname)
            .await
            .map_err(|e| ProxyError::DnsResolve {
                hostname: hostname.to_string(),
                message: e.to_string(),
            })?;

        Ok(lookup.iter().map(|a| a.0).collect())
    }
}

impl std::fmt::Debug for HickoryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryResolver")
            .field("servers", &self.servers)
            .finish()
    }
}

/// 带缓存的 DNS 解析
///
/// 命中的结果永久缓存，不做过期和淘汰：这里的结果只用于路由规则匹配，
/// 服务商的机房地址不会在进程生命周期内迁移。
/// 未命中时只做一次有超时的查询，失败或超时不写缓存，下次调用会重试。
/// 并发的未命中调用各自查询，后写入的覆盖先写入的。
pub struct DnsCache {
    resolver: Arc<dyn Resolver>,
    cache: RwLock<HashMap<String, Vec<Ipv4Addr>>>,
    timeout: Duration,
    metrics: Metrics,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn Resolver>, metrics: Metrics) -> Self {
        Self::with_timeout(resolver, metrics, DEFAULT_DNS_TIMEOUT)
    }

    pub fn with_timeout(resolver: Arc<dyn Resolver>, metrics: Metrics, timeout: Duration) -> Self {
        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
            timeout,
            metrics,
        }
    }

    pub fn cached(&self, hostname: &str) -> Option<Vec<Ipv4Addr>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(hostname)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn resolve(&self, hostname: &str) -> Result<Vec<Ipv4Addr>> {
        if let Some(ips) = self.cached(hostname) {
            debug!("DNS 缓存命中: {} -> {:?}", hostname, ips);
            self.metrics.inc_dns_query(hostname, true);
            return Ok(ips);
        }

        self.metrics.inc_dns_query(hostname, false);

        let start = Instant::now();
        let ips = match timeout(self.timeout, self.resolver.resolve4(hostname)).await {
            Ok(Ok(ips)) => ips,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                self.metrics.inc_dns_query_timeout();
                return Err(ProxyError::DnsTimeout {
                    hostname: hostname.to_string(),
                });
            }
        };
        let elapsed = start.elapsed();
        self.metrics.add_dns_query_time(elapsed);
        debug!("dns-query: {} - {:?}", hostname, elapsed);

        if ips.is_empty() {
            return Err(ProxyError::DnsResolve {
                hostname: hostname.to_string(),
                message: "no A records".to_string(),
            });
        }

        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hostname.to_string(), ips.clone());
        debug!("DNS 缓存写入: {} -> {:?}", hostname, ips);

        Ok(ips)
    }
}
