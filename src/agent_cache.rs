use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;

use crate::config::ProxyConfiguration;
use crate::error::Result;
use crate::socks5::connect_via_socks5;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AgentKey {
    proxy: ProxyConfiguration,
    host: String,
    port: u16,
}

/// 绑定了上游代理和目标地址的 SOCKS 客户端
#[derive(Debug)]
pub struct SocksAgent {
    proxy: ProxyConfiguration,
    host: String,
    port: u16,
    uses: AtomicU64,
}

impl SocksAgent {
    pub fn proxy(&self) -> &ProxyConfiguration {
        &self.proxy
    }

    pub fn target(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    pub fn uses(&self) -> u64 {
        self.uses.load(Ordering::Relaxed)
    }

    pub async fn connect(&self, wait: Duration) -> Result<TcpStream> {
        self.uses.fetch_add(1, Ordering::Relaxed);
        connect_via_socks5(&self.host, self.port, &self.proxy, wait).await
    }
}

/// 按 (代理, 目标) 复用 SocksAgent，不淘汰
#[derive(Debug, Default)]
pub struct AgentCache {
    agents: Mutex<HashMap<AgentKey, Arc<SocksAgent>>>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_agent(&self, proxy: &ProxyConfiguration, host: &str, port: u16) -> Arc<SocksAgent> {
        let key = AgentKey {
            proxy: proxy.clone(),
            host: host.to_string(),
            port,
        };
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        agents
            .entry(key)
            .or_insert_with(|| {
                Arc::new(SocksAgent {
                    proxy: proxy.clone(),
                    host: host.to_string(),
                    port,
                    uses: AtomicU64::new(0),
                })
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.agents.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
