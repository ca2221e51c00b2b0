/// End-to-end integration tests: register tunnels over loopback TLS and
/// drive traffic through the edge
mod common;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use nat_tunnel::config::{ClientConfig, ServerConfig, TunnelConfig};
use nat_tunnel::pool::BufferPool;
use nat_tunnel::protocol::TunnelType;
use nat_tunnel::{client, server, tls};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn server_config(control_port: u16, http_port: u16, cert: &std::path::Path, key: &std::path::Path) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1".to_string(),
        control_port,
        http_port,
        domain: "tunnel.localhost".to_string(),
        auth_token: "integration-secret".to_string(),
        cert_path: Some(cert.to_path_buf()),
        key_path: Some(key.to_path_buf()),
        // 边缘走明文 HTTP，便于测试直连
        behind_proxy: true,
        tcp_port_min: 21000,
        tcp_port_max: 21999,
        rate_limit: None,
    }
}

fn client_config(control_port: u16) -> ClientConfig {
    ClientConfig {
        server_addr: "127.0.0.1".to_string(),
        server_port: control_port,
        auth_token: "integration-secret".to_string(),
        skip_verify: true,
        ca_cert_path: None,
    }
}

fn http_tunnel(subdomain: &str, local_port: u16) -> TunnelConfig {
    TunnelConfig {
        tunnel_type: TunnelType::Http,
        subdomain: Some(subdomain.to_string()),
        local_host: "127.0.0.1".to_string(),
        local_port,
        connections: 1,
    }
}

async fn start_server(control_port: u16, http_port: u16) -> common::TestCleanup {
    let (cert_path, key_path) = common::generate_test_certs();
    let cleanup = common::TestCleanup::new(cert_path.clone(), key_path.clone());

    let config = server_config(control_port, http_port, &cert_path, &key_path);
    let tls_config = tls::load_server_config(&cert_path, &key_path).expect("server TLS config");
    let acceptor = TlsAcceptor::from(tls_config);

    tokio::spawn(async move {
        server::run_server(config, acceptor).await.ok();
    });
    sleep(Duration::from_millis(300)).await;

    cleanup
}

fn test_connector() -> TlsConnector {
    TlsConnector::from(tls::load_client_config(None, true).expect("client TLS config"))
}

/// 启动一条客户端隧道会话，返回注册响应
async fn start_tunnel_session(
    control_port: u16,
    tunnel: TunnelConfig,
) -> nat_tunnel::protocol::RegisterResponse {
    let client_cfg = client_config(control_port);
    let connector = test_connector();
    let pool = BufferPool::new();
    let (reg_tx, reg_rx) = oneshot::channel();

    tokio::spawn(async move {
        client::connect_and_serve(&client_cfg, &tunnel, &connector, &pool, None, Some(reg_tx))
            .await
            .ok();
    });

    tokio::time::timeout(Duration::from_secs(5), reg_rx)
        .await
        .expect("registration timed out")
        .expect("registration channel closed")
}

#[tokio::test]
async fn test_http_tunnel_end_to_end() {
    let control_port = common::get_available_port();
    let http_port = common::get_available_port();
    let echo_port = common::get_available_port();

    let _cleanup = start_server(control_port, http_port).await;
    let (_echo, seen_headers) = common::start_http_echo_server(echo_port).await;
    sleep(Duration::from_millis(100)).await;

    let response = start_tunnel_session(control_port, http_tunnel("foo", echo_port)).await;
    assert_eq!(response.subdomain, "foo");
    sleep(Duration::from_millis(100)).await;

    // 经边缘发起请求：Host 指向子域名
    let stream = TcpStream::connect(("127.0.0.1", http_port))
        .await
        .expect("connect edge");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("edge handshake");
    tokio::spawn(conn);

    let request = hyper::Request::builder()
        .method("GET")
        .uri("/hello")
        .header("host", "foo.tunnel.localhost")
        .body(Empty::<Bytes>::new())
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(10), sender.send_request(request))
        .await
        .expect("edge request timed out")
        .expect("edge request failed");

    assert_eq!(response.status(), 200);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello");

    // 本地服务应看到转发头
    let seen = seen_headers.lock().unwrap();
    let last = seen.last().expect("echo server saw no request");
    let forwarded_host = last
        .iter()
        .find(|(name, _)| name == "x-forwarded-host")
        .map(|(_, value)| value.clone())
        .expect("x-forwarded-host not seen by local service");
    assert_eq!(forwarded_host, "foo.tunnel.localhost");
    let forwarded_proto = last
        .iter()
        .find(|(name, _)| name == "x-forwarded-proto")
        .map(|(_, value)| value.clone())
        .expect("x-forwarded-proto not seen by local service");
    assert_eq!(forwarded_proto, "https");
}

#[tokio::test]
async fn test_unknown_subdomain_gets_404() {
    let control_port = common::get_available_port();
    let http_port = common::get_available_port();

    let _cleanup = start_server(control_port, http_port).await;

    let stream = TcpStream::connect(("127.0.0.1", http_port))
        .await
        .expect("connect edge");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("edge handshake");
    tokio::spawn(conn);

    let request = hyper::Request::builder()
        .method("GET")
        .uri("/")
        .header("host", "missing.tunnel.localhost")
        .body(Empty::<Bytes>::new())
        .unwrap();

    let response = sender.send_request(request).await.expect("edge request");
    assert_eq!(response.status(), 404);
    assert_eq!(
        response
            .headers()
            .get("x-tunnel-error")
            .and_then(|v| v.to_str().ok()),
        Some("TUNNEL_NOT_FOUND")
    );
}

#[tokio::test]
async fn test_tcp_tunnel_end_to_end() {
    let control_port = common::get_available_port();
    let http_port = common::get_available_port();
    let echo_port = common::get_available_port();

    let _cleanup = start_server(control_port, http_port).await;
    let _echo = common::start_echo_server(echo_port).await;
    sleep(Duration::from_millis(100)).await;

    let tunnel = TunnelConfig {
        tunnel_type: TunnelType::Tcp,
        subdomain: None,
        local_host: "127.0.0.1".to_string(),
        local_port: echo_port,
        connections: 1,
    };
    let response = start_tunnel_session(control_port, tunnel).await;
    let tcp_port = response.tcp_port.expect("TCP tunnel must get a port");
    assert!((21000..=21999).contains(&tcp_port));
    sleep(Duration::from_millis(200)).await;

    // 连接分配的端口，数据应经隧道回显
    let mut conn = TcpStream::connect(("127.0.0.1", tcp_port))
        .await
        .expect("connect tunnel port");

    conn.write_all(b"ping through tunnel").await.unwrap();

    let mut buf = vec![0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(10), conn.read(&mut buf))
        .await
        .expect("echo read timed out")
        .expect("echo read failed");
    assert_eq!(&buf[..n], b"ping through tunnel");
}

#[tokio::test]
async fn test_registration_with_bad_token_rejected() {
    let control_port = common::get_available_port();
    let http_port = common::get_available_port();

    let _cleanup = start_server(control_port, http_port).await;

    let mut bad_client = client_config(control_port);
    bad_client.auth_token = "wrong-token".to_string();
    let connector = test_connector();
    let pool = BufferPool::new();
    let tunnel = http_tunnel("bar", 9999);

    let err = client::connect_and_serve(&bad_client, &tunnel, &connector, &pool, None, None)
        .await
        .expect_err("registration must fail with wrong token");
    assert!(err.to_string().contains("AUTH_FAILED"));
}

#[tokio::test]
async fn test_subdomain_conflict_rejected() {
    let control_port = common::get_available_port();
    let http_port = common::get_available_port();
    let echo_port = common::get_available_port();

    let _cleanup = start_server(control_port, http_port).await;
    let (_echo, _seen) = common::start_http_echo_server(echo_port).await;

    let _first = start_tunnel_session(control_port, http_tunnel("taken", echo_port)).await;

    let client_cfg = client_config(control_port);
    let connector = test_connector();
    let pool = BufferPool::new();
    let err = client::connect_and_serve(
        &client_cfg,
        &http_tunnel("taken", echo_port),
        &connector,
        &pool,
        None,
        None,
    )
    .await
    .expect_err("second registration with same subdomain must fail");
    assert!(err.to_string().contains("already taken"));
}
