/// TCP 流与 WebSocket 升级流处理
///
/// TCP 隧道：每个流拨号本地服务后做双向字节泵，本地读出的字节
/// 封为 response 帧回传。WebSocket：原样写出重组的升级请求，读取
/// 本地响应头转发为 http_head，之后与 TCP 流同路径
use super::session::SessionContext;
use crate::error::{Result, TunnelError};
use crate::http_util;
use crate::pool::SIZE_MEDIUM;
use crate::protocol::{
    encode_response_head, DataType, HttpRequestHead, HttpResponseHead, TunnelType,
};
use bytes::Bytes;
use http::HeaderMap;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// 升级响应头读取上限
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// 处理一个 TCP 隧道流
pub async fn handle_tcp_stream(
    session: Arc<SessionContext>,
    stream_id: String,
    request_id: String,
    data_rx: mpsc::Receiver<Bytes>,
    done: CancellationToken,
) {
    let addr = format!(
        "{}:{}",
        session.tunnel.local_host, session.tunnel.local_port
    );

    let conn = match tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            debug!(stream_id = %stream_id, error = %e, "Dial local failed");
            session.send_stream_close(&stream_id, &request_id).await;
            session.remove_stream(&stream_id);
            return;
        }
        Err(_) => {
            debug!(stream_id = %stream_id, "Dial local timed out");
            session.send_stream_close(&stream_id, &request_id).await;
            session.remove_stream(&stream_id);
            return;
        }
    };
    let _ = conn.set_nodelay(true);

    pump(&session, conn, &stream_id, &request_id, data_rx, done).await;
    session.remove_stream(&stream_id);
}

/// 处理一个 WebSocket 升级流
pub async fn handle_upgrade_stream(
    session: Arc<SessionContext>,
    head: HttpRequestHead,
    headers: HeaderMap,
    request_id: String,
    data_rx: mpsc::Receiver<Bytes>,
    done: CancellationToken,
) {
    let result = if session.tunnel.tunnel_type == TunnelType::Https {
        upgrade_over_local(&session, head, headers, &request_id, data_rx, done, true).await
    } else {
        upgrade_over_local(&session, head, headers, &request_id, data_rx, done, false).await
    };

    if let Err(e) = result {
        debug!(request_id = %request_id, error = %e, "WebSocket upgrade failed");
        session.send_stream_close(&request_id, &request_id).await;
    }
    session.remove_stream(&request_id);
}

async fn upgrade_over_local(
    session: &Arc<SessionContext>,
    head: HttpRequestHead,
    headers: HeaderMap,
    request_id: &str,
    data_rx: mpsc::Receiver<Bytes>,
    done: CancellationToken,
    use_tls: bool,
) -> Result<()> {
    let tunnel = &session.tunnel;
    let addr = format!("{}:{}", tunnel.local_host, tunnel.local_port);

    let tcp = tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| TunnelError::timeout(LOCAL_DIAL_TIMEOUT))?
        .map_err(|e| TunnelError::connection_failed(addr.clone(), e))?;
    let _ = tcp.set_nodelay(true);

    if use_tls {
        let connector = TlsConnector::from(crate::tls::insecure_local_config());
        let server_name = ServerName::try_from(tunnel.local_host.clone())
            .map_err(|_| TunnelError::ConfigError(format!("invalid local host: {}", tunnel.local_host)))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TunnelError::connection_failed(addr, e))?;
        run_upgrade(session, tls, head, headers, request_id, data_rx, done).await
    } else {
        run_upgrade(session, tcp, head, headers, request_id, data_rx, done).await
    }
}

async fn run_upgrade<S>(
    session: &Arc<SessionContext>,
    mut conn: S,
    head: HttpRequestHead,
    mut headers: HeaderMap,
    request_id: &str,
    data_rx: mpsc::Receiver<Bytes>,
    done: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tunnel = &session.tunnel;

    // Host 重写为本地目标；升级相关头原样保留
    let target_host = if tunnel.local_port == 80 || tunnel.local_port == 443 {
        tunnel.local_host.clone()
    } else {
        format!("{}:{}", tunnel.local_host, tunnel.local_port)
    };
    if let Ok(value) = http::header::HeaderValue::from_str(&target_host) {
        headers.insert(http::header::HOST, value);
    }

    // 重组升级请求并原样写出
    let mut request = format!("{} {} HTTP/1.1\r\n", head.method, head.url);
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            request.push_str(name.as_str());
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
    }
    request.push_str("\r\n");
    conn.write_all(request.as_bytes()).await?;
    conn.flush().await?;

    // 读取本地响应头
    let mut buf = Vec::with_capacity(4096);
    let head_end = loop {
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(TunnelError::protocol("upgrade response head too large"));
        }
        let mut chunk = [0u8; 4096];
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::protocol("local closed during upgrade"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
    };

    let (status, response_headers) = parse_response_head(&buf[..head_end])?;

    // 转发响应头；101 之后双方进入字节泵
    let hpack_headers = session
        .hpack_encoder
        .encode(&http_util::header_map_to_pairs(&response_headers))?;
    let response_head = HttpResponseHead {
        status_code: status,
        status: String::new(),
        hpack_headers,
        content_length: -1,
    };
    session
        .send_data_frame(
            DataType::HttpHead,
            true,
            request_id,
            request_id,
            &encode_response_head(&response_head)?,
            &done,
        )
        .await?;

    if status != 101 {
        return Ok(());
    }

    // 头部之后的剩余字节属于流
    if buf.len() > head_end {
        session
            .send_data_frame(
                DataType::Response,
                false,
                request_id,
                request_id,
                &buf[head_end..],
                &done,
            )
            .await?;
    }

    pump(session, conn, request_id, request_id, data_rx, done).await;
    Ok(())
}

/// 双向字节泵：本地读出 → response 帧；入站字节 → 本地写入
async fn pump<S>(
    session: &Arc<SessionContext>,
    conn: S,
    stream_id: &str,
    request_id: &str,
    mut data_rx: mpsc::Receiver<Bytes>,
    done: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(conn);

    // 入站 → 本地
    let write_done = done.clone();
    let write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_done.cancelled() => break,
                maybe = data_rx.recv() => match maybe {
                    Some(data) => {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = write_half.shutdown().await;
    });

    // 本地 → 隧道
    let mut buf = session.pool.get(SIZE_MEDIUM);
    buf.resize(SIZE_MEDIUM, 0);
    loop {
        let n = tokio::select! {
            _ = done.cancelled() => break,
            result = read_half.read(buf.as_mut_slice()) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };

        if session
            .send_data_frame(
                DataType::Response,
                false,
                stream_id,
                request_id,
                &buf.as_slice()[..n],
                &done,
            )
            .await
            .is_err()
        {
            break;
        }
    }

    session.send_stream_close(stream_id, request_id).await;
    done.cancel();
    let _ = write_task.await;
}

/// 查找头部结束位置（\r\n\r\n 之后）
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// 解析升级响应头
fn parse_response_head(data: &[u8]) -> Result<(u16, HeaderMap)> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut header_storage);
    match response.parse(data) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(TunnelError::protocol("incomplete upgrade response head"));
        }
        Err(e) => {
            return Err(TunnelError::protocol(format!(
                "parse upgrade response: {}",
                e
            )));
        }
    }

    let status = response
        .code
        .ok_or_else(|| TunnelError::protocol("upgrade response missing status"))?;

    let mut headers = HeaderMap::new();
    for header in response.headers.iter() {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(header.name.as_bytes()),
            http::header::HeaderValue::from_bytes(header.value),
        ) {
            headers.append(name, value);
        }
    }

    Ok((status, headers))
}
