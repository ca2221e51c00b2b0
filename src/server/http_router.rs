/// 边缘 HTTP 路由
///
/// 将入站请求按最左子域名标签路由到所属隧道组：请求头与包体
/// 封为 http_head / http_body_chunk 帧经帧写入器送往客户端，
/// 响应帧流式写回原连接。WebSocket 升级在观察到 101 后切换为
/// 双向字节泵（与 TCP 流同路径）
use super::group::{GroupManager, TunnelConn};
use crate::constants::{self, REQUEST_TIMEOUT};
use crate::error::Result;
use crate::http_util;
use crate::pool::BufferPool;
use crate::protocol::{
    decode_response_head, encode_data_payload_pooled, encode_request_head, DataHeader, DataType,
    Frame, FrameKind, HttpRequestHead, HttpResponse, HttpResponseHead,
};
use crate::recovery::Supervisor;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 边缘响应体类型
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, io::Error>;

fn empty_body() -> BoxBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// 生成请求 ID
fn generate_request_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// 客户端回传的响应头（经调度器解码后交给路由）
struct ResponseHead {
    status: u16,
    headers: HeaderMap,
    body_rx: Option<mpsc::Receiver<io::Result<Bytes>>>,
}

struct PendingEntry {
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::Sender<io::Result<Bytes>>>,
    cancel: CancellationToken,
}

/// 路由与响应调度共享状态
pub struct HttpRouter {
    manager: Arc<GroupManager>,
    domain: String,
    pool: BufferPool,
    /// requestID → 等待中的响应槽
    pending: Mutex<HashMap<String, PendingEntry>>,
    /// 升级后的双向流：requestID → 外部连接写入端
    upgraded: Mutex<HashMap<String, mpsc::Sender<Bytes>>>,
}

impl HttpRouter {
    pub fn new(manager: Arc<GroupManager>, domain: String, pool: BufferPool) -> Arc<Self> {
        Arc::new(Self {
            manager,
            domain,
            pool,
            pending: Mutex::new(HashMap::new()),
            upgraded: Mutex::new(HashMap::new()),
        })
    }

    /// 处理一个入站边缘请求
    pub async fn handle(self: Arc<Self>, mut req: Request<Incoming>) -> Response<BoxBody> {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let Some(subdomain) = http_util::extract_subdomain(&host, &self.domain) else {
            return synthetic_error(
                StatusCode::NOT_FOUND,
                constants::ERR_CODE_TUNNEL_NOT_FOUND,
                "no tunnel for this host",
            );
        };

        let Some(group) = self.manager.lookup_subdomain(subdomain) else {
            return synthetic_error(
                StatusCode::NOT_FOUND,
                constants::ERR_CODE_TUNNEL_NOT_FOUND,
                "tunnel not found",
            );
        };

        if !group.tunnel_type.is_http() {
            return synthetic_error(
                StatusCode::NOT_FOUND,
                constants::ERR_CODE_TUNNEL_NOT_FOUND,
                "tunnel is not an HTTP tunnel",
            );
        }

        let Some(conn) = group.pick_connection() else {
            return synthetic_error(
                StatusCode::BAD_GATEWAY,
                constants::ERR_CODE_CONNECTION_FAILED,
                "no healthy tunnel connection",
            );
        };

        group.touch();

        let request_id = generate_request_id();
        let is_websocket = http_util::is_websocket_upgrade(req.headers());
        let upgrade = if is_websocket {
            Some(hyper::upgrade::on(&mut req))
        } else {
            None
        };

        let (parts, body) = req.into_parts();

        // 头部处理：WebSocket 原样透传，普通请求剥离逐跳头
        let mut headers = parts.headers.clone();
        if !is_websocket {
            http_util::clean_hop_by_hop_headers(&mut headers);
        }
        http_util::inject_forwarded_headers(&mut headers, &host);

        let content_length = http_util::content_length_of(&parts.headers);
        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let hpack_headers = match conn
            .hpack_encoder
            .encode(&http_util::header_map_to_pairs(&headers))
        {
            Ok(block) => block,
            Err(e) => {
                error!(error = %e, "Failed to encode request headers");
                return synthetic_error(
                    StatusCode::BAD_GATEWAY,
                    constants::ERR_CODE_CONNECTION_FAILED,
                    "header encoding failed",
                );
            }
        };

        let head = HttpRequestHead {
            method: parts.method.as_str().to_string(),
            url,
            hpack_headers,
            content_length,
        };

        // 无包体的请求在头帧上直接终结
        let head_is_last = is_websocket || content_length == 0;

        // 响应槽必须先于头帧就位，避免极快的响应落空
        let cancel = CancellationToken::new();
        let head_rx = self.register_pending(&request_id, cancel.clone());

        if let Err(e) = self
            .send_head_frame(&conn, &request_id, &head, head_is_last)
            .await
        {
            self.remove_pending(&request_id);
            debug!(error = %e, "Failed to send request head");
            return synthetic_error(
                StatusCode::BAD_GATEWAY,
                constants::ERR_CODE_CONNECTION_FAILED,
                "tunnel connection failed",
            );
        }

        if !head_is_last {
            self.spawn_body_pump(Arc::clone(&conn), request_id.clone(), body, cancel.clone());
        }

        let response_head = match tokio::time::timeout(REQUEST_TIMEOUT, head_rx).await {
            Ok(Ok(head)) => head,
            Ok(Err(_)) => {
                self.remove_pending(&request_id);
                cancel.cancel();
                return synthetic_error(
                    StatusCode::BAD_GATEWAY,
                    constants::ERR_CODE_CONNECTION_FAILED,
                    "tunnel connection closed",
                );
            }
            Err(_) => {
                self.remove_pending(&request_id);
                cancel.cancel();
                self.send_close_frame(&conn, &request_id).await;
                return synthetic_error(
                    StatusCode::BAD_GATEWAY,
                    constants::ERR_CODE_TIMEOUT,
                    "tunnel request timed out",
                );
            }
        };

        // WebSocket：收到 101 后切换为双向字节泵
        if let Some(upgrade) = upgrade {
            if response_head.status == StatusCode::SWITCHING_PROTOCOLS.as_u16() {
                self.spawn_upgrade_pump(Arc::clone(&conn), request_id.clone(), upgrade, cancel);
                return build_response(response_head.status, &response_head.headers, empty_body());
            }
        }

        let body = match response_head.body_rx {
            Some(rx) => BodyExt::boxed(StreamBody::new(
                ReceiverStream::new(rx).map(|chunk| chunk.map(hyper::body::Frame::data)),
            )),
            None => empty_body(),
        };

        build_response(response_head.status, &response_head.headers, body)
    }

    fn register_pending(
        &self,
        request_id: &str,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<ResponseHead> {
        let (head_tx, head_rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.insert(
            request_id.to_string(),
            PendingEntry {
                head_tx: Some(head_tx),
                body_tx: None,
                cancel,
            },
        );
        head_rx
    }

    fn remove_pending(&self, request_id: &str) -> Option<PendingEntry> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.remove(request_id)
    }

    async fn send_head_frame(
        &self,
        conn: &Arc<TunnelConn>,
        request_id: &str,
        head: &HttpRequestHead,
        is_last: bool,
    ) -> Result<()> {
        let envelope = encode_request_head(head)?;
        let header = DataHeader::new(DataType::HttpHead, is_last, request_id, request_id);
        let payload = encode_data_payload_pooled(&header, &envelope, &self.pool);
        conn.writer
            .write_frame(Frame::new_pooled(FrameKind::Data, payload))
            .await
    }

    async fn send_close_frame(&self, conn: &Arc<TunnelConn>, request_id: &str) {
        let header = DataHeader::new(DataType::Close, true, request_id, request_id);
        let payload = encode_data_payload_pooled(&header, &[], &self.pool);
        let _ = conn
            .writer
            .write_control(Frame::new_pooled(FrameKind::Data, payload))
            .await;
    }

    /// 请求包体泵：边读边封 http_body_chunk 帧
    fn spawn_body_pump(
        &self,
        conn: Arc<TunnelConn>,
        request_id: String,
        mut body: Incoming,
        cancel: CancellationToken,
    ) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            loop {
                let maybe_frame = tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = body.frame() => frame,
                };

                match maybe_frame {
                    Some(Ok(frame)) => {
                        let Ok(data) = frame.into_data() else {
                            // trailer 帧直接忽略
                            continue;
                        };
                        if data.is_empty() {
                            continue;
                        }
                        let header =
                            DataHeader::new(DataType::HttpBodyChunk, false, &request_id, &request_id);
                        let payload = encode_data_payload_pooled(&header, &data, &pool);
                        let frame = Frame::new_pooled(FrameKind::Data, payload);
                        if conn.writer.write_frame_with_cancel(frame, &cancel).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(request_id = %request_id, error = %e, "Request body read failed");
                        let header =
                            DataHeader::new(DataType::Close, true, &request_id, &request_id);
                        let payload = encode_data_payload_pooled(&header, &[], &pool);
                        let _ = conn
                            .writer
                            .write_frame(Frame::new_pooled(FrameKind::Data, payload))
                            .await;
                        return;
                    }
                    None => break,
                }
            }

            // 包体结束：空 chunk 携带 is_last
            let header = DataHeader::new(DataType::HttpBodyChunk, true, &request_id, &request_id);
            let payload = encode_data_payload_pooled(&header, &[], &pool);
            let _ = conn
                .writer
                .write_frame(Frame::new_pooled(FrameKind::Data, payload))
                .await;
        });
    }

    /// 升级成功后的双向泵：外部连接 ↔ data 帧
    fn spawn_upgrade_pump(
        self: &Arc<Self>,
        conn: Arc<TunnelConn>,
        request_id: String,
        upgrade: hyper::upgrade::OnUpgrade,
        cancel: CancellationToken,
    ) {
        let router = Arc::clone(self);
        let pool = self.pool.clone();

        // 写入端先于 101 响应就位：升级完成前到达的帧在通道里排队
        let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(32);
        {
            let mut upgraded_map = self.upgraded.lock().expect("upgraded lock poisoned");
            upgraded_map.insert(request_id.clone(), write_tx);
        }

        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Edge upgrade failed");
                    router.send_close_frame(&conn, &request_id).await;
                    let mut upgraded_map =
                        router.upgraded.lock().expect("upgraded lock poisoned");
                    upgraded_map.remove(&request_id);
                    return;
                }
            };

            let io = TokioIo::new(upgraded);
            let (mut read_half, mut write_half) = tokio::io::split(io);

            // 隧道 → 外部
            let write_cancel = cancel.clone();
            let write_task = tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                loop {
                    tokio::select! {
                        _ = write_cancel.cancelled() => break,
                        maybe = write_rx.recv() => match maybe {
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

            // 外部 → 隧道
            use tokio::io::AsyncReadExt;
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = read_half.read(&mut buf) => match result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    },
                };

                let header = DataHeader::new(DataType::Data, false, &request_id, &request_id);
                let payload = encode_data_payload_pooled(&header, &buf[..n], &pool);
                let frame = Frame::new_pooled(FrameKind::Data, payload);
                if conn.writer.write_frame_with_cancel(frame, &cancel).await.is_err() {
                    break;
                }
            }

            router.send_close_frame(&conn, &request_id).await;
            cancel.cancel();
            let _ = write_task.await;

            let mut upgraded_map = router.upgraded.lock().expect("upgraded lock poisoned");
            upgraded_map.remove(&request_id);
        });
    }

    /// 调度客户端回传的 HTTP 帧（由会话读循环调用）
    pub async fn dispatch(
        self: &Arc<Self>,
        conn: &Arc<TunnelConn>,
        header: &DataHeader,
        data: &[u8],
    ) -> Result<()> {
        match header.data_type {
            DataType::HttpHead => self.on_response_head(conn, header, data).await,
            DataType::HttpBodyChunk => self.on_body_chunk(header, data).await,
            DataType::HttpResponse => self.on_full_response(header, data).await,
            DataType::Close => {
                self.on_stream_close(&header.request_id);
                Ok(())
            }
            DataType::Data | DataType::Response => {
                self.on_upgraded_data(&header.request_id, data).await;
                Ok(())
            }
            DataType::HttpRequest => {
                // 角色不匹配的类型码：按流错误处理
                warn!(
                    request_id = %header.request_id,
                    "Rejecting http_request frame on server role"
                );
                self.send_close_frame(conn, &header.request_id).await;
                Ok(())
            }
        }
    }

    async fn on_response_head(
        &self,
        conn: &Arc<TunnelConn>,
        header: &DataHeader,
        data: &[u8],
    ) -> Result<()> {
        let head: HttpResponseHead = decode_response_head(data)?;
        let pairs = conn.hpack_decoder.decode(&head.hpack_headers)?;
        let headers = http_util::pairs_to_header_map(&pairs);

        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let Some(entry) = pending.get_mut(&header.request_id) else {
            debug!(request_id = %header.request_id, "Response head for unknown request, dropping");
            return Ok(());
        };

        let Some(head_tx) = entry.head_tx.take() else {
            return Ok(());
        };

        let body_rx = if header.is_last {
            None
        } else {
            let (tx, rx) = mpsc::channel(32);
            entry.body_tx = Some(tx);
            Some(rx)
        };

        let _ = head_tx.send(ResponseHead {
            status: head.status_code,
            headers,
            body_rx,
        });

        if header.is_last {
            pending.remove(&header.request_id);
        }
        Ok(())
    }

    async fn on_body_chunk(&self, header: &DataHeader, data: &[u8]) -> Result<()> {
        let (body_tx, cancel) = {
            let pending = self.pending.lock().expect("pending lock poisoned");
            match pending.get(&header.request_id) {
                Some(entry) => (entry.body_tx.clone(), entry.cancel.clone()),
                None => return Ok(()),
            }
        };

        if let Some(body_tx) = body_tx {
            if !data.is_empty() {
                let chunk = Bytes::copy_from_slice(data);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = body_tx.send(Ok(chunk)) => {}
                }
            }
        }

        if header.is_last {
            self.remove_pending(&header.request_id);
        }
        Ok(())
    }

    /// 完整响应信封（非流式兼容路径）：头 + 单块包体
    async fn on_full_response(&self, header: &DataHeader, data: &[u8]) -> Result<()> {
        let resp: HttpResponse = crate::protocol::decode_http_response(data)?;

        let mut headers = HeaderMap::new();
        for (name, values) in &resp.headers {
            for value in values {
                if let (Ok(n), Ok(v)) = (
                    http::header::HeaderName::from_bytes(name.as_bytes()),
                    http::header::HeaderValue::from_str(value),
                ) {
                    headers.append(n, v);
                }
            }
        }

        let Some(mut entry) = self.remove_pending(&header.request_id) else {
            return Ok(());
        };
        let Some(head_tx) = entry.head_tx.take() else {
            return Ok(());
        };

        let body_rx = if resp.body.is_empty() {
            None
        } else {
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(Ok(Bytes::from(resp.body)));
            Some(rx)
        };

        let _ = head_tx.send(ResponseHead {
            status: resp.status_code,
            headers,
            body_rx,
        });
        Ok(())
    }

    /// close 帧：未发头 → 502；流式中 → 截断错误
    fn on_stream_close(&self, request_id: &str) {
        if let Some(entry) = self.remove_pending(request_id) {
            if let Some(body_tx) = entry.body_tx {
                let _ = body_tx.try_send(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "tunnel stream closed before body completed",
                )));
            }
            entry.cancel.cancel();
            // head_tx 随 entry 丢弃，等待方收到 RecvError
            return;
        }

        let sender = {
            let mut upgraded = self.upgraded.lock().expect("upgraded lock poisoned");
            upgraded.remove(request_id)
        };
        drop(sender);
    }

    async fn on_upgraded_data(&self, request_id: &str, data: &[u8]) {
        let sender = {
            let upgraded = self.upgraded.lock().expect("upgraded lock poisoned");
            upgraded.get(request_id).cloned()
        };

        if let Some(sender) = sender {
            let _ = sender.send(Bytes::copy_from_slice(data)).await;
        }
    }

    /// 等待中的请求数（测试用）
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

fn build_response(status: u16, headers: &HeaderMap, body: BoxBody) -> Response<BoxBody> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));

    let mut cleaned = headers.clone();
    http_util::clean_hop_by_hop_headers(&mut cleaned);
    if let Some(response_headers) = builder.headers_mut() {
        *response_headers = cleaned;
    }

    builder.body(body).unwrap_or_else(|_| {
        synthetic_error(
            StatusCode::BAD_GATEWAY,
            constants::ERR_CODE_CONNECTION_FAILED,
            "invalid upstream response",
        )
    })
}

/// 合成错误响应：状态码 + 错误码头 + 文本体
fn synthetic_error(status: StatusCode, code: &str, message: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .header("x-tunnel-error", code)
        .body(full_body(format!("{}: {}", code, message)))
        .expect("static error response")
}

/// 边缘监听循环：behind_proxy 时明文 HTTP，否则 TLS
pub async fn run_edge_listener(
    router: Arc<HttpRouter>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    supervisor: Supervisor,
    stop: CancellationToken,
) {
    info!(
        tls = tls.is_some(),
        "Edge HTTP listener started"
    );

    loop {
        let (conn, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            result = listener.accept() => match result {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Edge accept failed");
                    continue;
                }
            },
        };

        let _ = conn.set_nodelay(true);
        let router = Arc::clone(&router);
        let tls = tls.clone();

        supervisor.spawn(format!("edge-conn-{}", peer), async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let router = Arc::clone(&router);
                async move { Ok::<_, std::convert::Infallible>(router.handle(req).await) }
            });

            let result = match tls {
                Some(acceptor) => {
                    let tls_conn = match tokio::time::timeout(
                        constants::HANDSHAKE_TIMEOUT,
                        acceptor.accept(conn),
                    )
                    .await
                    {
                        Ok(Ok(tls_conn)) => tls_conn,
                        Ok(Err(e)) => {
                            debug!(peer = %peer, error = %e, "Edge TLS handshake failed");
                            return;
                        }
                        Err(_) => {
                            debug!(peer = %peer, "Edge TLS handshake timed out");
                            return;
                        }
                    };
                    hyper::server::conn::http1::Builder::new()
                        .preserve_header_case(true)
                        .serve_connection(TokioIo::new(tls_conn), service)
                        .with_upgrades()
                        .await
                }
                None => {
                    hyper::server::conn::http1::Builder::new()
                        .preserve_header_case(true)
                        .serve_connection(TokioIo::new(conn), service)
                        .with_upgrades()
                        .await
                }
            };

            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Edge connection ended with error");
            }
        });
    }

    info!("Edge HTTP listener stopped");
}
