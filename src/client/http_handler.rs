/// 本地 HTTP 服务转发
///
/// 收到的请求头 + 包体流转发给本地服务，响应按 http_head +
/// http_body_chunk 流式回传。HTTPS 隧道对本地服务重发起 TLS
/// （本地目标多为自签名，不校验证书）。本地不可达时合成 502
use super::session::SessionContext;
use crate::constants::REQUEST_TIMEOUT;
use crate::error::{Result, TunnelError};
use crate::http_util;
use crate::protocol::{
    encode_http_response, encode_response_head, DataType, HttpRequest, HttpRequestHead,
    HttpResponse, HttpResponseHead, TunnelType,
};
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ReqBody = http_body_util::combinators::BoxBody<Bytes, io::Error>;

const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// 处理一个流式请求
pub async fn handle_request(
    session: Arc<SessionContext>,
    head: HttpRequestHead,
    headers: HeaderMap,
    body_rx: Option<mpsc::Receiver<Bytes>>,
    request_id: String,
    done: CancellationToken,
) {
    if let Err(e) = forward(&session, head, headers, body_rx, &request_id, &done).await {
        debug!(request_id = %request_id, error = %e, "Local forward failed");
        send_error_response(&session, &request_id, &done).await;
    }
    session.remove_stream(&request_id);
}

async fn forward(
    session: &Arc<SessionContext>,
    head: HttpRequestHead,
    mut headers: HeaderMap,
    body_rx: Option<mpsc::Receiver<Bytes>>,
    request_id: &str,
    done: &CancellationToken,
) -> Result<()> {
    let tunnel = &session.tunnel;

    http_util::clean_hop_by_hop_headers(&mut headers);
    headers.remove(http::header::ACCEPT_ENCODING);

    // Host 重写为本地目标
    let target_host = if tunnel.local_port == 80 || tunnel.local_port == 443 {
        tunnel.local_host.clone()
    } else {
        format!("{}:{}", tunnel.local_host, tunnel.local_port)
    };
    if let Ok(value) = http::header::HeaderValue::from_str(&target_host) {
        headers.insert(http::header::HOST, value);
    }

    let method = Method::from_bytes(head.method.as_bytes())
        .map_err(|_| TunnelError::protocol(format!("invalid method '{}'", head.method)))?;

    let body: ReqBody = match body_rx {
        Some(rx) => BodyExt::boxed(StreamBody::new(
            ReceiverStream::new(rx)
                .map(|chunk| Ok::<_, io::Error>(hyper::body::Frame::data(chunk))),
        )),
        None => BodyExt::boxed(Empty::<Bytes>::new().map_err(|never| match never {})),
    };

    let mut builder = Request::builder().method(method).uri(head.url.as_str());
    if let Some(request_headers) = builder.headers_mut() {
        *request_headers = headers;
    }
    let request = builder
        .body(body)
        .map_err(|e| TunnelError::protocol(format!("build local request: {}", e)))?;

    // 连接本地服务
    let addr = format!("{}:{}", tunnel.local_host, tunnel.local_port);
    let tcp = tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| TunnelError::timeout(LOCAL_DIAL_TIMEOUT))?
        .map_err(|e| TunnelError::connection_failed(addr.clone(), e))?;
    let _ = tcp.set_nodelay(true);

    let response = if tunnel.tunnel_type == TunnelType::Https {
        let connector = TlsConnector::from(crate::tls::insecure_local_config());
        let server_name = ServerName::try_from(tunnel.local_host.clone())
            .map_err(|_| TunnelError::ConfigError(format!("invalid local host: {}", tunnel.local_host)))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TunnelError::connection_failed(addr, e))?;
        exchange(tls, request).await?
    } else {
        exchange(tcp, request).await?
    };

    // 回传响应头
    let status = response.status();
    let mut response_headers = response.headers().clone();
    let content_length = http_util::content_length_of(&response_headers);
    http_util::clean_hop_by_hop_headers(&mut response_headers);

    let hpack_headers = session
        .hpack_encoder
        .encode(&http_util::header_map_to_pairs(&response_headers))?;
    let response_head = HttpResponseHead {
        status_code: status.as_u16(),
        status: status.canonical_reason().unwrap_or("").to_string(),
        hpack_headers,
        content_length,
    };

    let head_is_last = content_length == 0;
    session
        .send_data_frame(
            DataType::HttpHead,
            head_is_last,
            request_id,
            request_id,
            &encode_response_head(&response_head)?,
            done,
        )
        .await?;

    if head_is_last {
        return Ok(());
    }

    // 回传响应包体
    let mut body = response.into_body();
    loop {
        let maybe_frame = tokio::select! {
            _ = done.cancelled() => return Ok(()),
            frame = body.frame() => frame,
        };

        match maybe_frame {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if data.is_empty() {
                    continue;
                }
                session
                    .send_data_frame(
                        DataType::HttpBodyChunk,
                        false,
                        request_id,
                        request_id,
                        &data,
                        done,
                    )
                    .await?;
            }
            Some(Err(e)) => {
                debug!(request_id = %request_id, error = %e, "Local response body read failed");
                session.send_stream_close(request_id, request_id).await;
                return Ok(());
            }
            None => break,
        }
    }

    session
        .send_data_frame(DataType::HttpBodyChunk, true, request_id, request_id, &[], done)
        .await?;
    Ok(())
}

/// 单次 HTTP/1.1 交换
async fn exchange<T>(io: T, request: Request<ReqBody>) -> Result<http::Response<Incoming>>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| TunnelError::protocol(format!("local handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Local connection task ended");
        }
    });

    tokio::time::timeout(REQUEST_TIMEOUT, sender.send_request(request))
        .await
        .map_err(|_| TunnelError::timeout(REQUEST_TIMEOUT))?
        .map_err(|e| TunnelError::protocol(format!("local request failed: {}", e)))
}

/// 完整请求信封（非流式兼容路径）：缓冲转发，单帧应答
pub async fn handle_full_request(
    session: Arc<SessionContext>,
    request: HttpRequest,
    request_id: String,
) {
    let done = CancellationToken::new();
    let response = match forward_full(&session, request).await {
        Ok(response) => response,
        Err(e) => {
            debug!(request_id = %request_id, error = %e, "Local forward failed");
            let mut headers = HashMap::new();
            headers.insert(
                "content-type".to_string(),
                vec!["text/plain; charset=utf-8".to_string()],
            );
            HttpResponse {
                status_code: 502,
                status: "Bad Gateway".to_string(),
                headers,
                body: b"Local service unavailable".to_vec(),
            }
        }
    };

    match encode_http_response(&response) {
        Ok(payload) => {
            let _ = session
                .send_data_frame(
                    DataType::HttpResponse,
                    true,
                    &request_id,
                    &request_id,
                    &payload,
                    &done,
                )
                .await;
        }
        Err(e) => {
            debug!(request_id = %request_id, error = %e, "Failed to encode response envelope");
            session.send_stream_close(&request_id, &request_id).await;
        }
    }
}

async fn forward_full(
    session: &Arc<SessionContext>,
    request: HttpRequest,
) -> Result<HttpResponse> {
    let tunnel = &session.tunnel;

    let mut headers = HeaderMap::new();
    for (name, values) in &request.headers {
        for value in values {
            if let (Ok(n), Ok(v)) = (
                http::header::HeaderName::from_bytes(name.as_bytes()),
                http::header::HeaderValue::from_str(value),
            ) {
                headers.append(n, v);
            }
        }
    }
    http_util::clean_hop_by_hop_headers(&mut headers);
    headers.remove(http::header::ACCEPT_ENCODING);

    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| TunnelError::protocol(format!("invalid method '{}'", request.method)))?;

    let body: ReqBody = Full::new(Bytes::from(request.body))
        .map_err(|never| match never {})
        .boxed();

    let mut builder = Request::builder().method(method).uri(request.url.as_str());
    if let Some(request_headers) = builder.headers_mut() {
        *request_headers = headers;
    }
    let hyper_request = builder
        .body(body)
        .map_err(|e| TunnelError::protocol(format!("build local request: {}", e)))?;

    let addr = format!("{}:{}", tunnel.local_host, tunnel.local_port);
    let tcp = tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| TunnelError::timeout(LOCAL_DIAL_TIMEOUT))?
        .map_err(|e| TunnelError::connection_failed(addr.clone(), e))?;

    let response = if tunnel.tunnel_type == TunnelType::Https {
        let connector = TlsConnector::from(crate::tls::insecure_local_config());
        let server_name = ServerName::try_from(tunnel.local_host.clone())
            .map_err(|_| TunnelError::ConfigError(format!("invalid local host: {}", tunnel.local_host)))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TunnelError::connection_failed(addr, e))?;
        exchange(tls, hyper_request).await?
    } else {
        exchange(tcp, hyper_request).await?
    };

    let status = response.status();
    let mut response_headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            response_headers
                .entry(name.as_str().to_string())
                .or_insert_with(Vec::new)
                .push(value.to_string());
        }
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| TunnelError::protocol(format!("read local response body: {}", e)))?
        .to_bytes();

    Ok(HttpResponse {
        status_code: status.as_u16(),
        status: status.canonical_reason().unwrap_or("").to_string(),
        headers: response_headers,
        body: body.to_vec(),
    })
}

/// 合成 502 响应（本地服务不可达）
async fn send_error_response(
    session: &Arc<SessionContext>,
    request_id: &str,
    done: &CancellationToken,
) {
    let message = b"Local service unavailable";
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    let Ok(hpack_headers) = session
        .hpack_encoder
        .encode(&http_util::header_map_to_pairs(&headers))
    else {
        session.send_stream_close(request_id, request_id).await;
        return;
    };

    let head = HttpResponseHead {
        status_code: StatusCode::BAD_GATEWAY.as_u16(),
        status: "Bad Gateway".to_string(),
        hpack_headers,
        content_length: message.len() as i64,
    };

    let Ok(payload) = encode_response_head(&head) else {
        return;
    };
    if session
        .send_data_frame(DataType::HttpHead, false, request_id, request_id, &payload, done)
        .await
        .is_err()
    {
        return;
    }
    let _ = session
        .send_data_frame(
            DataType::HttpBodyChunk,
            true,
            request_id,
            request_id,
            message,
            done,
        )
        .await;
}
