use thiserror::Error;

/// 代理核心的错误分类
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 配置错误（启动期致命）
    #[error("configuration error: {0}")]
    Config(String),

    /// DNS 查询超时
    #[error("dns query timeout: {hostname}")]
    DnsTimeout { hostname: String },

    /// DNS 查询失败
    #[error("dns lookup '{hostname}' failed: {message}")]
    DnsResolve { hostname: String, message: String },

    /// 无法解析的 IP 地址或 CIDR
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// NetMatcher 已经被销毁，不能再调用
    #[error("this NetMatcher instance has been destroyed")]
    MatcherDestroyed,

    /// 上游连接失败（SOCKS 握手、目标不可达、直连失败）
    #[error("upstream connect error: {0}")]
    Upstream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] hyper::Error),
}

impl ProxyError {
    /// 是否属于 DNS 错误（解析失败或超时）
    pub fn is_dns(&self) -> bool {
        matches!(
            self,
            ProxyError::DnsTimeout { .. } | ProxyError::DnsResolve { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::DnsTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_error_kind() {
        let timeout = ProxyError::DnsTimeout {
            hostname: "example.com".to_string(),
        };
        let failed = ProxyError::DnsResolve {
            hostname: "example.com".to_string(),
            message: "NXDOMAIN".to_string(),
        };

        assert!(timeout.is_dns());
        assert!(timeout.is_timeout());
        assert!(failed.is_dns());
        assert!(!failed.is_timeout());
        assert!(!ProxyError::MatcherDestroyed.is_dns());
        assert!(!ProxyError::Config("bad".to_string()).is_dns());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ProxyError::MatcherDestroyed.to_string(),
            "this NetMatcher instance has been destroyed"
        );
        assert_eq!(
            ProxyError::DnsResolve {
                hostname: "a.com".to_string(),
                message: "refused".to_string()
            }
            .to_string(),
            "dns lookup 'a.com' failed: refused"
        );
    }
}
