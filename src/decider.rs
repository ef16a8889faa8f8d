use log::{error, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{ProxyError, Result};
use crate::filter::FilterMatcher;
use crate::metrics::Metrics;
use crate::net_matcher::NetMatcher;

/// 某个域名的直连/代理判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionVerdict {
    pub hostname: String,
    pub direct: bool,
}

/// 直连判定
///
/// 按顺序短路：内网 → 直连；命中黑名单 → 代理；不在区域网段内 → 代理；否则直连。
/// DNS 失败时直连（可用性优先），并记录错误。
/// 结果按域名（忽略路径和查询）永久缓存，规则或网络变化后也不会重新计算。
pub struct DirectAccessDecider {
    internal: Arc<NetMatcher>,
    filter: Arc<dyn FilterMatcher>,
    regional: Arc<NetMatcher>,
    verdicts: RwLock<HashMap<String, bool>>,
    metrics: Metrics,
}

impl DirectAccessDecider {
    pub fn new(
        internal: Arc<NetMatcher>,
        filter: Arc<dyn FilterMatcher>,
        regional: Arc<NetMatcher>,
        metrics: Metrics,
    ) -> Self {
        Self {
            internal,
            filter,
            regional,
            verdicts: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn internal_matcher(&self) -> &Arc<NetMatcher> {
        &self.internal
    }

    pub fn regional_matcher(&self) -> &Arc<NetMatcher> {
        &self.regional
    }

    pub async fn is_direct_access(&self, url_or_hostname: &str) -> bool {
        self.verdict(url_or_hostname).await.direct
    }

    pub async fn verdict(&self, url_or_hostname: &str) -> DirectionVerdict {
        let (url, hostname) = match normalize(url_or_hostname) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("match rule for '{}' failed: {}", url_or_hostname, e);
                return DirectionVerdict {
                    hostname: url_or_hostname.to_string(),
                    direct: true,
                };
            }
        };

        let cached = self
            .verdicts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&hostname)
            .copied();
        if let Some(direct) = cached {
            self.metrics.inc_direct_check(&hostname, true);
            return DirectionVerdict { hostname, direct };
        }

        let direct = match self.decide(&url, &hostname).await {
            Ok(direct) => direct,
            Err(e) if e.is_dns() => {
                error!("dns-lookup '{}' failed: {}", hostname, e);
                // 超时已由 DnsCache 计数
                if !e.is_timeout() {
                    self.metrics.inc_dns_query_error();
                }
                true
            }
            Err(e) => {
                error!("match rule for '{}' failed: {}", url_or_hostname, e);
                true
            }
        };

        self.verdicts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hostname.clone(), direct);
        self.metrics.inc_direct_check(&hostname, false);

        DirectionVerdict { hostname, direct }
    }

    async fn decide(&self, url: &str, hostname: &str) -> Result<bool> {
        if self.internal.resolve_and_check(hostname).await? {
            info!("ip matched (internal): {}, direct", url);
            return Ok(true);
        }

        if self.filter.matches(url) {
            info!("gfw matched: {}, proxy", url);
            return Ok(false);
        }

        if !self.regional.resolve_and_check(hostname).await? {
            info!("ip matched: {}, proxy", url);
            return Ok(false);
        }

        info!("not matched: {}, direct", url);
        Ok(true)
    }

    pub fn cached_verdicts(&self) -> usize {
        self.verdicts.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// 补全协议后解析出 (url, hostname)
///
/// 黑名单规则需要带协议的完整地址，缺省补 `https://`。
/// 只认 `://` 作为协议分隔，`httpbin.org:443` 这类以 http 开头的主机名仍需补全。
fn normalize(url_or_hostname: &str) -> Result<(String, String)> {
    let url = if url_or_hostname.contains("://") {
        url_or_hostname.to_string()
    } else {
        format!("https://{}", url_or_hostname)
    };

    let parsed =
        url::Url::parse(&url).map_err(|e| ProxyError::InvalidAddress(format!("{}: {}", url, e)))?;
    let hostname = parsed
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::InvalidAddress(url.clone()))?;

    Ok((url, hostname))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::FakeResolver;
    use crate::dns::DnsCache;
    use crate::net_matcher::{parse_net_blocks, NetMatcher, PRIVATE_NETWORKS};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFilter {
        domains: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl CountingFilter {
        fn new(domains: Vec<&'static str>) -> Self {
            Self {
                domains,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FilterMatcher for CountingFilter {
        fn matches(&self, uri: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.domains.iter().any(|d| uri.contains(d))
        }
    }

    struct Fixture {
        resolver: Arc<FakeResolver>,
        metrics: Metrics,
        filter: Arc<CountingFilter>,
        decider: DirectAccessDecider,
    }

    fn fixture(hosts: &[(&str, &str)], denied: Vec<&'static str>, regional: &[&str]) -> Fixture {
        let resolver = Arc::new(FakeResolver::new(hosts));
        let metrics = Metrics::new();
        let dns = Arc::new(DnsCache::new(resolver.clone(), metrics.clone()));
        let internal = Arc::new(NetMatcher::new(
            "internal",
            parse_net_blocks(&PRIVATE_NETWORKS).unwrap(),
            dns.clone(),
            metrics.clone(),
        ));
        let regional = Arc::new(NetMatcher::new(
            "regional",
            parse_net_blocks(regional).unwrap(),
            dns,
            metrics.clone(),
        ));
        let filter = Arc::new(CountingFilter::new(denied));
        let decider =
            DirectAccessDecider::new(internal, filter.clone(), regional, metrics.clone());
        Fixture {
            resolver,
            metrics,
            filter,
            decider,
        }
    }

    #[tokio::test]
    async fn test_internal_is_direct_even_if_denied() {
        let f = fixture(
            &[("intranet.corp", "10.1.2.3")],
            vec!["intranet.corp"],
            &[],
        );
        assert!(f.decider.is_direct_access("intranet.corp").await);
        assert_eq!(f.filter.calls(), 0);
    }

    #[tokio::test]
    async fn test_denied_goes_to_proxy() {
        let f = fixture(
            &[("blocked.example", "1.2.3.4")],
            vec!["blocked.example"],
            &["1.2.3.0/24"],
        );
        assert!(!f.decider.is_direct_access("https://blocked.example/path").await);
    }

    #[tokio::test]
    async fn test_regional_ranges() {
        let f = fixture(
            &[("local.example", "36.1.1.1"), ("remote.example", "8.8.8.8")],
            vec![],
            &["36.0.0.0/8"],
        );
        assert!(f.decider.is_direct_access("local.example").await);
        assert!(!f.decider.is_direct_access("remote.example").await);
    }

    #[tokio::test]
    async fn test_verdict_is_memoized_per_hostname() {
        let f = fixture(&[("remote.example", "8.8.8.8")], vec![], &["36.0.0.0/8"]);

        let first = f.decider.verdict("http://remote.example/a?b=1").await;
        let second = f.decider.verdict("remote.example:443").await;

        assert_eq!(first, second);
        assert_eq!(first.hostname, "remote.example");
        assert!(!first.direct);
        assert_eq!(f.resolver.calls(), 1);
        assert_eq!(f.filter.calls(), 1);
        assert_eq!(f.decider.cached_verdicts(), 1);
    }

    #[tokio::test]
    async fn test_dns_failure_fails_open() {
        let f = fixture(&[], vec![], &[]);

        assert!(f.decider.is_direct_access("unresolvable.example").await);
        // 降级结果同样被缓存
        assert!(f.decider.is_direct_access("unresolvable.example").await);
        assert_eq!(f.resolver.calls(), 1);
        assert_eq!(f.metrics.get_dns_query_error(), 1);
        assert_eq!(f.metrics.get_dns_query_timeout(), 0);
    }

    #[tokio::test]
    async fn test_http_prefixed_hostname_is_routed() {
        let f = fixture(
            &[("httpbin.org", "8.8.8.8"), ("httpwatch.com", "36.1.1.1")],
            vec!["httpbin.org"],
            &["36.0.0.0/8"],
        );

        let denied = f.decider.verdict("httpbin.org:443").await;
        assert_eq!(denied.hostname, "httpbin.org");
        assert!(!denied.direct);
        assert_eq!(f.filter.calls(), 1);

        assert!(f.decider.is_direct_access("httpwatch.com:443").await);
        assert_eq!(f.resolver.calls(), 2);
        assert_eq!(f.decider.cached_verdicts(), 2);
    }

    #[tokio::test]
    async fn test_destroyed_matcher_fails_open() {
        let f = fixture(&[("remote.example", "8.8.8.8")], vec![], &[]);
        f.decider.internal_matcher().destroy().await;

        assert!(f.decider.is_direct_access("remote.example").await);
    }

    #[tokio::test]
    async fn test_literal_ip_target() {
        let f = fixture(&[], vec![], &["127.0.0.0/8"]);
        assert!(f.decider.is_direct_access("127.0.0.1:8080").await);
        assert!(!f.decider.is_direct_access("8.8.8.8:53").await);
        assert_eq!(f.resolver.calls(), 0);
    }

    #[test]
    fn test_normalize() {
        let (url, host) = normalize("example.com:443").unwrap();
        assert_eq!(url, "https://example.com:443");
        assert_eq!(host, "example.com");

        let (url, host) = normalize("http://Example.COM/path?q=1").unwrap();
        assert_eq!(url, "http://Example.COM/path?q=1");
        assert_eq!(host, "example.com");

        let (url, host) = normalize("httpbin.org:443").unwrap();
        assert_eq!(url, "https://httpbin.org:443");
        assert_eq!(host, "httpbin.org");

        let (_, host) = normalize("[::1]:443").unwrap();
        assert_eq!(host, "::1");

        assert!(normalize("https://").is_err());
    }
}
