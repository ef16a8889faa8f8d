use bytes::Bytes;
use futures::FutureExt;
use http::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;

use crate::agent_cache::AgentCache;
use crate::config::{ProxyList, ServerOptions};
use crate::decider::DirectAccessDecider;
use crate::dns::{DnsCache, HickoryResolver, Resolver};
use crate::error::{ProxyError, Result};
use crate::filter::FilterMatcher;
use crate::metrics::{ConnectionGuard, Metrics};
use crate::net_matcher::{
    create_internal_net_matcher, create_regional_net_matcher, get_internal_net_matcher, NetBlock,
    NetMatcher,
};
use crate::once::ErrorReporter;
use crate::socks5::connect_direct;
use crate::tunnel::pipe;

/// 代理自身提供的指标地址
pub const METRIC_PATH: &str = "/http-socks/__/metric";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// 每个连接共享的状态
struct Shared {
    decider: DirectAccessDecider,
    agents: AgentCache,
    proxies: Arc<ProxyList>,
    socket_timeout: Duration,
    metrics: Metrics,
}

/// HTTP 代理服务器
///
/// 对每个请求先判定直连还是走上游 SOCKS5，再建立对应的上游连接。
pub struct ProxyServer {
    options: ServerOptions,
    shared: Arc<Shared>,
    /// 由本实例创建、关闭时需要销毁的匹配器
    owned_matchers: Vec<Arc<NetMatcher>>,
    shutdown_grace: Duration,
}

impl ProxyServer {
    /// 使用配置中的 DNS 服务器创建
    ///
    /// 内网匹配器按 DNS 配置在进程内共享，不随本实例销毁。
    pub fn new(
        options: ServerOptions,
        filter: Arc<dyn FilterMatcher>,
        regional_blocks: Vec<NetBlock>,
    ) -> Result<Self> {
        info!("DNS servers: {}", options.dns_key());
        let resolver: Arc<dyn Resolver> = Arc::new(HickoryResolver::new(options.dns_servers.clone())?);
        let metrics = Metrics::new();
        let dns = Arc::new(DnsCache::new(resolver, metrics.clone()));

        let internal = get_internal_net_matcher(&options.dns_key(), &dns, &metrics);
        let regional = Arc::new(create_regional_net_matcher(
            regional_blocks,
            dns,
            metrics.clone(),
        ));

        Ok(Self::assemble(
            options,
            internal,
            filter,
            regional.clone(),
            metrics,
            vec![regional],
        ))
    }

    /// 注入解析器创建，两个匹配器都归本实例所有
    pub fn with_components(
        options: ServerOptions,
        resolver: Arc<dyn Resolver>,
        filter: Arc<dyn FilterMatcher>,
        regional_blocks: Vec<NetBlock>,
        metrics: Metrics,
    ) -> Self {
        let dns = Arc::new(DnsCache::new(resolver, metrics.clone()));
        let internal = Arc::new(create_internal_net_matcher(dns.clone(), metrics.clone()));
        let regional = Arc::new(create_regional_net_matcher(
            regional_blocks,
            dns,
            metrics.clone(),
        ));

        Self::assemble(
            options,
            internal.clone(),
            filter,
            regional.clone(),
            metrics,
            vec![internal, regional],
        )
    }

    fn assemble(
        options: ServerOptions,
        internal: Arc<NetMatcher>,
        filter: Arc<dyn FilterMatcher>,
        regional: Arc<NetMatcher>,
        metrics: Metrics,
        owned_matchers: Vec<Arc<NetMatcher>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            decider: DirectAccessDecider::new(internal, filter, regional, metrics.clone()),
            agents: AgentCache::new(),
            proxies: options.proxies.clone(),
            socket_timeout: options.socket_timeout,
            metrics,
        });

        Self {
            options,
            shared,
            owned_matchers,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    /// 设置关闭时等待活跃连接的最长时间
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    pub fn decider(&self) -> &DirectAccessDecider {
        &self.shared.decider
    }

    pub async fn is_direct_access(&self, url_or_hostname: &str) -> bool {
        self.shared.decider.is_direct_access(url_or_hostname).await
    }

    /// 创建监听 socket（SO_REUSEADDR / SO_REUSEPORT，backlog 4096）
    pub fn bind(&self) -> Result<TcpListener> {
        use socket2::{Domain, Protocol, Socket, Type};

        let addr = self.options.listen_addr()?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            use std::os::unix::io::AsRawFd;
            let reuse_port: libc::c_int = 1;
            unsafe {
                let _ = libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_REUSEPORT,
                    &reuse_port as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&reuse_port) as libc::socklen_t,
                );
            }
        }

        socket.bind(&addr.into())?;
        socket.listen(4096)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener)?)
    }

    pub async fn run(&self) -> Result<()> {
        self.run_with_shutdown(None).await
    }

    pub async fn run_with_shutdown(&self, shutdown_rx: Option<watch::Receiver<bool>>) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, shutdown_rx).await
    }

    /// 在已绑定的 listener 上处理连接，直到收到关闭信号
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_rx: Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let local = listener.local_addr()?;
        info!("HTTP 代理启动在 {}", local);
        info!("最大并发连接数: {}", self.options.max_connections);
        info!("上游 SOCKS5 代理: {} 个", self.shared.proxies.len());

        let semaphore = Arc::new(Semaphore::new(self.options.max_connections.max(1)));

        let metrics = self.shared.metrics.clone();
        let summary = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SUMMARY_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                metrics.print_summary();
            }
        });

        loop {
            let accepted = match shutdown_rx.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() || *rx.borrow() {
                                info!("🛑 收到关闭信号，停止接受新连接");
                                break;
                            }
                            continue;
                        }
                        accepted = listener.accept() => accepted,
                    }
                }
                None => listener.accept().await,
            };

            match accepted {
                Ok((stream, peer)) => self.handle_new_connection(stream, peer, &semaphore).await,
                Err(e) => {
                    error!("接受连接失败: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        drop(listener);
        summary.abort();
        self.wait_for_connections().await;
        self.destroy().await;

        info!("📊 最终统计:");
        self.shared.metrics.print_summary();
        Ok(())
    }

    async fn wait_for_connections(&self) {
        info!("⏳ 等待活跃连接完成...");
        let start = Instant::now();
        while start.elapsed() < self.shutdown_grace {
            let active = self.shared.metrics.get_active_connections();
            if active == 0 {
                info!("✅ 所有连接已关闭");
                return;
            }
            debug!("⏳ 等待 {} 个活跃连接关闭...", active);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let remaining = self.shared.metrics.get_active_connections();
        if remaining > 0 {
            warn!("⚠️  超时：仍有 {} 个连接未关闭", remaining);
        }
    }

    /// 销毁本实例拥有的匹配器
    pub async fn destroy(&self) {
        for matcher in &self.owned_matchers {
            matcher.destroy().await;
        }
    }

    async fn handle_new_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        semaphore: &Arc<Semaphore>,
    ) {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(e) => {
                error!("获取连接许可失败: {}", e);
                return;
            }
        };

        debug!("接受来自 {} 的新连接", peer);
        let _ = stream.set_nodelay(true);
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let _permit = permit;
            let _guard = ConnectionGuard::new(shared.metrics.clone());

            let service_shared = Arc::clone(&shared);
            let service = service_fn(move |req| handle(req, Arc::clone(&service_shared), peer));
            let conn = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();

            match std::panic::AssertUnwindSafe(conn).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("连接 {} 结束: {}", peer, e),
                Err(panic) => error!("❌ 连接处理任务 panic ({}): {:?}", peer, panic),
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    shared: Arc<Shared>,
    peer: SocketAddr,
) -> std::result::Result<Response<ProxyBody>, hyper::Error> {
    if shared.metrics.add_client(peer.ip()) {
        debug!("新客户端: {}", peer.ip());
    }

    if req.method() == Method::CONNECT {
        Ok(on_connect(req, shared).await)
    } else {
        Ok(on_request(req, shared).await)
    }
}

/// 普通 HTTP 代理请求
async fn on_request(req: Request<Incoming>, shared: Arc<Shared>) -> Response<ProxyBody> {
    if req.uri().authority().is_none() && req.uri().path() == METRIC_PATH {
        return metric_response(&shared.metrics);
    }

    // 代理不应该收到同源请求
    if req.uri().to_string().starts_with('/') {
        return status_response(StatusCode::NOT_FOUND, empty());
    }

    let target = req.uri().to_string();
    let host = match req.uri().host() {
        Some(h) => h.to_string(),
        None => {
            warn!("HTTP request missing host: {}", target);
            return status_response(StatusCode::BAD_REQUEST, full("HTTP request missing host\n"));
        }
    };
    let port = req.uri().port_u16().unwrap_or(80);

    shared.metrics.inc_request(&host, false);
    let reporter = {
        let metrics = shared.metrics.clone();
        let host = host.clone();
        ErrorReporter::new(format!("request {}", target), move || {
            metrics.inc_request(&host, true)
        })
    };

    let direct = shared.decider.is_direct_access(&target).await;
    let upstream = if direct {
        debug!("direct-request: {}", target);
        connect_direct(&host, port, shared.socket_timeout).await
    } else {
        debug!("proxy-request: {}", target);
        connect_proxy(&shared, &host, port).await
    };

    let stream = match upstream {
        Ok(stream) => stream,
        Err(e) => {
            reporter.report(format!("{} on proxy {}:{}", e, host, port));
            return connection_error();
        }
    };

    match forward(req, stream, shared.socket_timeout).await {
        Ok(resp) => resp,
        Err(e) => {
            reporter.report(format!("{} on proxy {}:{}", e, host, port));
            connection_error()
        }
    }
}

/// 以 origin-form 把请求转发到已建立的上游连接
async fn forward(
    req: Request<Incoming>,
    stream: TcpStream,
    wait: Duration,
) -> Result<Response<ProxyBody>> {
    let (mut parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    parts.uri = path
        .parse::<Uri>()
        .map_err(|e| ProxyError::Upstream(format!("invalid request path {}: {}", path, e)))?;
    parts.headers.remove("proxy-connection");
    let req = Request::from_parts(parts, body);

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("upstream connection error: {}", e);
        }
    });

    let resp = match timeout(wait, sender.send_request(req)).await {
        Ok(resp) => resp?,
        Err(_) => {
            return Err(ProxyError::Upstream(format!(
                "upstream response timeout after {:?}",
                wait
            )))
        }
    };

    Ok(resp.map(|b| b.boxed()))
}

/// CONNECT 隧道
///
/// 先建立上游连接，成功后回复 200 并在升级后开始双向转发；
/// 失败时回复 500 并关闭连接，不进入转发。
async fn on_connect(req: Request<Incoming>, shared: Arc<Shared>) -> Response<ProxyBody> {
    let (host, port) = match req.uri().authority() {
        Some(auth) => (
            auth.host()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            auth.port_u16().unwrap_or(443),
        ),
        None => {
            warn!("CONNECT host is not socket addr: {:?}", req.uri());
            return status_response(StatusCode::BAD_REQUEST, full("CONNECT must be to a socket address\n"));
        }
    };
    let target = req.uri().to_string();

    shared.metrics.inc_connect(&host, false);
    let reporter = {
        let metrics = shared.metrics.clone();
        let host = host.clone();
        ErrorReporter::new(format!("connect {}", target), move || {
            metrics.inc_connect(&host, true)
        })
    };

    let direct = shared.decider.is_direct_access(&target).await;
    let upstream = if direct {
        debug!("direct-connect: {}", target);
        connect_direct(&host, port, shared.socket_timeout).await
    } else {
        debug!("proxy-connect: {}", target);
        connect_proxy(&shared, &host, port).await
    };

    let upstream = match upstream {
        Ok(stream) => stream,
        Err(e) => {
            reporter.report(format!("{} connection creating for {}", e, target));
            let mut resp = status_response(StatusCode::INTERNAL_SERVER_ERROR, empty());
            resp.extensions_mut()
                .insert(ReasonPhrase::from_static(b"Connection error"));
            resp.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
            return resp;
        }
    };

    let metrics = shared.metrics.clone();
    let idle = shared.socket_timeout;
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let _guard = ConnectionGuard::new(metrics.clone());
                let stats = pipe(TokioIo::new(upgraded), upstream, idle, &metrics, &reporter).await;
                debug!(
                    "tunnel {} closed: {:?}, up {} bytes, down {} bytes",
                    target, stats.outcome, stats.bytes_up, stats.bytes_down
                );
            }
            Err(e) => {
                reporter.report(format!("upgrade error: {}", e));
            }
        }
    });

    let mut resp = Response::new(empty());
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    resp
}

async fn connect_proxy(shared: &Shared, host: &str, port: u16) -> Result<TcpStream> {
    let proxy = shared.proxies.pick()?;
    shared
        .agents
        .get_agent(&proxy, host, port)
        .connect(shared.socket_timeout)
        .await
}

fn metric_response(metrics: &Metrics) -> Response<ProxyBody> {
    let mut resp = Response::new(full(metrics.render()));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    resp
}

fn connection_error() -> Response<ProxyBody> {
    status_response(StatusCode::INTERNAL_SERVER_ERROR, full("Connection error\n"))
}

fn status_response(status: StatusCode, body: ProxyBody) -> Response<ProxyBody> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
