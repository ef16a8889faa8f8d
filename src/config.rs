use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{ProxyError, Result};

pub const DEFAULT_SOCKS: &str = "127.0.0.1:1080";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DNS: &str = "8.8.8.8,114.114.114.114";
/// 连接上游和隧道空闲的超时（秒）
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProxyAuthentication {
    pub username: String,
    pub password: String,
}

/// 上游 SOCKS 服务器配置，解析后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyConfiguration {
    pub ipaddress: String,
    pub port: u16,
    /// SOCKS 版本，目前固定为 5
    pub socks_type: u8,
    pub authentication: ProxyAuthentication,
}

impl ProxyConfiguration {
    pub fn has_auth(&self) -> bool {
        !self.authentication.username.is_empty()
    }
}

impl fmt::Display for ProxyConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ipaddress.contains(':') {
            write!(f, "[{}]:{}", self.ipaddress, self.port)
        } else {
            write!(f, "{}:{}", self.ipaddress, self.port)
        }
    }
}

/// 构造一个 SOCKS5 配置，凭据缺省为空字符串
pub fn get_proxy_object(
    ipaddress: &str,
    port: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<ProxyConfiguration> {
    if ipaddress.is_empty() {
        return Err(ProxyError::Config("代理地址为空".to_string()));
    }
    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|_| ProxyError::Config(format!("无效的代理端口: {}", port)))?;

    Ok(ProxyConfiguration {
        ipaddress: ipaddress.to_string(),
        port,
        socks_type: 5,
        authentication: ProxyAuthentication {
            username: username.unwrap_or("").to_string(),
            password: password.unwrap_or("").to_string(),
        },
    })
}

/// 解析 `host:port` 或 `host:port:username:password`
pub fn parse_proxy_line(line: &str) -> Result<ProxyConfiguration> {
    let fields: Vec<&str> = line.trim().split(':').collect();
    match fields.as_slice() {
        [host, port] => get_proxy_object(host, port, None, None),
        [host, port, username, password] => {
            get_proxy_object(host, port, Some(username), Some(password))
        }
        _ => Err(ProxyError::Config(format!("无效的代理配置: {}", line))),
    }
}

/// 解析 `socks5://[user:pass@]host:port` 形式
pub fn parse_proxy_url(value: &str) -> Result<ProxyConfiguration> {
    let url = url::Url::parse(value)
        .map_err(|e| ProxyError::Config(format!("无效的代理地址 {}: {}", value, e)))?;

    match url.scheme() {
        "socks" | "socks5" | "socks5h" => {}
        other => {
            return Err(ProxyError::Config(format!("不支持的代理协议: {}", other)));
        }
    }

    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| ProxyError::Config(format!("代理地址缺少主机: {}", value)))?;
    let port = url.port().unwrap_or(1080).to_string();
    let username = (!url.username().is_empty()).then(|| url.username());

    get_proxy_object(host, &port, username, url.password())
}

/// `--socks` 接受两种写法：连接串或 URL
pub fn parse_socks_option(value: &str) -> Result<ProxyConfiguration> {
    if value.contains("://") {
        parse_proxy_url(value)
    } else {
        parse_proxy_line(value)
    }
}

/// 上游代理列表
///
/// 每个连接随机挑选一个，文件重新加载时整体替换。
#[derive(Debug, Default)]
pub struct ProxyList {
    entries: RwLock<Arc<Vec<ProxyConfiguration>>>,
}

impl ProxyList {
    pub fn new(entries: Vec<ProxyConfiguration>) -> Self {
        Self {
            entries: RwLock::new(Arc::new(entries)),
        }
    }

    pub fn single(proxy: ProxyConfiguration) -> Self {
        Self::new(vec![proxy])
    }

    /// 读取代理列表文件：空行和 `#` 开头的行跳过，无效行记录后跳过
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<ProxyConfiguration>> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut entries = Vec::new();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_socks_option(line) {
                Ok(proxy) => entries.push(proxy),
                Err(e) => warn!("代理列表第 {} 行无效，已跳过: {}", lineno + 1, e),
            }
        }

        Ok(entries)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let entries = Self::parse_file(path.as_ref())?;
        info!(
            "从 {} 加载了 {} 个上游代理",
            path.as_ref().display(),
            entries.len()
        );
        Ok(Self::new(entries))
    }

    /// 重新加载；读取失败时保留旧列表
    pub fn reload<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let entries = match Self::parse_file(path.as_ref()) {
            Ok(entries) => entries,
            Err(e) => {
                error!("重新加载代理列表 {} 失败: {}", path.as_ref().display(), e);
                return Err(e);
            }
        };
        let count = entries.len();
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(entries);
        debug!("代理列表已重新加载: {} 个", count);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Arc<Vec<ProxyConfiguration>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn pick(&self) -> Result<ProxyConfiguration> {
        let entries = self.snapshot();
        entries
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| ProxyError::Upstream("没有可用的上游代理".to_string()))
    }

    /// 定时重新加载，`shutdown` 变为 true 后退出
    pub fn spawn_reload(
        self: &Arc<Self>,
        path: PathBuf,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let list = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = list.reload(&path);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// 解析逗号分隔的 DNS 服务器列表，每项为 `ip` 或 `ip:port`（默认 53）
pub fn parse_dns_servers(list: &str) -> Result<Vec<SocketAddr>> {
    let mut servers = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ProxyError::Config(format!("DNS 服务器列表含空项: '{}'", list)));
        }
        let addr = if let Ok(ip) = entry.parse::<IpAddr>() {
            SocketAddr::new(ip, 53)
        } else {
            entry
                .parse::<SocketAddr>()
                .map_err(|_| ProxyError::Config(format!("无效的 DNS 服务器: {}", entry)))?
        };
        servers.push(addr);
    }
    Ok(servers)
}

/// JSON 配置文件，键与命令行参数同名，未知键忽略
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
    pub socks: Option<String>,
    #[serde(alias = "socks_list")]
    pub socks_list: Option<PathBuf>,
    #[serde(alias = "proxy_list_reload")]
    pub proxy_list_reload: Option<u64>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub level: Option<String>,
    pub dns: Option<String>,
    pub timeout: Option<u64>,
    #[serde(alias = "deny_list")]
    pub deny_list: Option<PathBuf>,
    #[serde(alias = "regional_nets")]
    pub regional_nets: Option<PathBuf>,
    #[serde(alias = "log_file")]
    pub log_file: Option<PathBuf>,
}

impl FileConfig {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| ProxyError::Config(format!("invalid json content: {}", e)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }
}

/// 交给 ProxyServer 的最终配置
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub proxies: Arc<ProxyList>,
    pub dns_servers: Vec<SocketAddr>,
    pub socket_timeout: Duration,
    pub max_connections: usize,
}

impl ServerOptions {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ProxyError::Config(format!("无效的监听地址: {}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// 内网匹配器按 DNS 配置共享
    pub fn dns_key(&self) -> String {
        self.dns_servers
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            proxies: Arc::new(ProxyList::new(Vec::new())),
            dns_servers: Vec::new(),
            socket_timeout: Duration::from_secs(DEFAULT_SOCKET_TIMEOUT_SECS),
            max_connections: default_max_connections(),
        }
    }
}

/// 按 CPU 核心数估算最大并发连接数
pub fn default_max_connections() -> usize {
    let cpus = num_cpus::get();
    std::cmp::min(10000, cpus * 500)
}
