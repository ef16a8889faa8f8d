//! HTTP 到 SOCKS5 的代理网关
//!
//! 按目标主机判定直连还是经上游 SOCKS5 转发，支持普通 HTTP 代理请求和 CONNECT 隧道。

pub mod agent_cache;
pub mod config;
pub mod decider;
pub mod dns;
pub mod error;
pub mod filter;
pub mod logger;
pub mod metrics;
pub mod net_matcher;
pub mod once;
pub mod server;
pub mod socks5;
pub mod tunnel;
pub mod worker_pool;

pub use config::{
    get_proxy_object, parse_dns_servers, parse_proxy_line, FileConfig, ProxyConfiguration,
    ProxyList, ServerOptions,
};
pub use decider::{DirectAccessDecider, DirectionVerdict};
pub use dns::{DnsCache, HickoryResolver, Resolver};
pub use error::{ProxyError, Result};
pub use filter::{DomainListFilter, FilterMatcher, NoopFilter};
pub use metrics::Metrics;
pub use net_matcher::{get_internal_net_matcher, NetBlock, NetMatcher};
pub use server::{ProxyServer, METRIC_PATH};
