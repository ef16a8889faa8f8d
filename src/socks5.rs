use async_socks5::{AddrKind, Auth};
use log::{debug, info};
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::ProxyConfiguration;
use crate::error::{ProxyError, Result};

/// 通过 SOCKS5 上游连接目标
///
/// 域名直接交给 SOCKS5 服务器解析，避免本地重复查询。
/// 连接和握手共用同一个超时。
///
/// # 参数
/// * `target_host` - 目标主机名或 IP
/// * `target_port` - 目标端口
/// * `proxy` - 上游 SOCKS5 配置
/// * `wait` - 超时时间
pub async fn connect_via_socks5(
    target_host: &str,
    target_port: u16,
    proxy: &ProxyConfiguration,
    wait: Duration,
) -> Result<TcpStream> {
    info!("通过 SOCKS5 {} 连接到 {}:{}", proxy, target_host, target_port);

    let upstream = (proxy.ipaddress.as_str(), proxy.port);
    let mut stream = match timeout(wait, TcpStream::connect(upstream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(ProxyError::Upstream(format!(
                "无法连接到 SOCKS5 服务器 {}: {}",
                proxy, e
            )));
        }
        Err(_) => {
            return Err(ProxyError::Upstream(format!(
                "连接到 SOCKS5 服务器 {} 超时",
                proxy
            )));
        }
    };

    tune_socket(&stream);
    debug!("已连接到 SOCKS5 服务器: {}", proxy);

    let target = target_addr(target_host, target_port);
    let auth = proxy
        .has_auth()
        .then(|| Auth::new(&proxy.authentication.username, &proxy.authentication.password));

    match timeout(wait, async_socks5::connect(&mut stream, target, auth)).await {
        Ok(Ok(bound)) => {
            debug!("SOCKS5 握手完成，绑定地址: {:?}", bound);
        }
        Ok(Err(e)) => {
            return Err(ProxyError::Upstream(format!(
                "SOCKS5 握手失败 {}:{}: {}",
                target_host, target_port, e
            )));
        }
        Err(_) => {
            return Err(ProxyError::Upstream(format!(
                "SOCKS5 握手超时 {}:{}",
                target_host, target_port
            )));
        }
    }

    Ok(stream)
}

/// 直连目标，和 SOCKS5 路径使用同一个超时
pub async fn connect_direct(target_host: &str, target_port: u16, wait: Duration) -> Result<TcpStream> {
    let host = target_host.trim_start_matches('[').trim_end_matches(']');
    match timeout(wait, TcpStream::connect((host, target_port))).await {
        Ok(Ok(stream)) => {
            tune_socket(&stream);
            Ok(stream)
        }
        Ok(Err(e)) => Err(ProxyError::Upstream(format!(
            "连接到目标服务器 {}:{} 失败: {}",
            target_host, target_port, e
        ))),
        Err(_) => Err(ProxyError::Upstream(format!(
            "连接到目标服务器 {}:{} 超时",
            target_host, target_port
        ))),
    }
}

fn target_addr(host: &str, port: u16) -> AddrKind {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(ip) => AddrKind::Ip((ip, port).into()),
        Err(_) => AddrKind::Domain(bare.to_string(), port),
    }
}

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);

    // TCP_QUICKACK（Linux）- 快速 ACK
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let quickack: libc::c_int = 1;
        unsafe {
            let _ = libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_QUICKACK,
                &quickack as *const _ as *const libc::c_void,
                std::mem::size_of_val(&quickack) as libc::socklen_t,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_proxy_line;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_target_addr() {
        assert!(matches!(
            target_addr("example.com", 443),
            AddrKind::Domain(ref h, 443) if h == "example.com"
        ));
        assert!(matches!(target_addr("1.2.3.4", 80), AddrKind::Ip(_)));
        assert!(matches!(target_addr("[::1]", 80), AddrKind::Ip(_)));
    }

    #[tokio::test]
    async fn test_dead_upstream_is_upstream_error() {
        // 绑定后立即释放，得到一个没人监听的端口
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let proxy = parse_proxy_line(&format!("127.0.0.1:{}", port)).unwrap();
        let e = connect_via_socks5("example.com", 443, &proxy, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(e, ProxyError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_handshake_through_minimal_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // 只实现无认证 + CONNECT 域名的最小服务端，随后回显
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 2];
            s.read_exact(&mut greeting).await.unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            s.read_exact(&mut methods).await.unwrap();
            s.write_all(&[5, 0]).await.unwrap();

            let mut head = [0u8; 4];
            s.read_exact(&mut head).await.unwrap();
            assert_eq!(head[1], 1);
            assert_eq!(head[3], 3);
            let mut len = [0u8; 1];
            s.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            s.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..len[0] as usize], b"example.com");

            s.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0]).await.unwrap();

            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let proxy = parse_proxy_line(&addr.to_string()).unwrap();
        let mut stream = connect_via_socks5("example.com", 443, &proxy, Duration::from_secs(2))
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_direct() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(connect_direct("127.0.0.1", port, Duration::from_secs(2)).await.is_ok());
        drop(listener);
    }
}
