/// 客户端会话
///
/// 一条 TLS 连接对应一个会话：注册、心跳、帧调度。本端为请求
/// 接收角色：http_head / http_body_chunk 进，响应帧出；TCP 隧道
/// 的 data 帧按 streamID 建流。6 秒内未收到任何帧视为对端失联
use super::{http_handler, tcp_handler};
use crate::config::{ClientConfig, TunnelConfig};
use crate::constants::{
    HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, MAX_FRAME_PAYLOAD,
};
use crate::error::{Result, TunnelError};
use crate::hpack;
use crate::http_util;
use crate::pool::BufferPool;
use crate::protocol::{
    self, decode_data_payload, decode_register_response, encode_data_payload_pooled,
    encode_register_request, DataHeader, DataType, Frame, FrameKind, FrameWriter,
    RegisterRequest, RegisterResponse, TunnelType,
};
use bytes::Bytes;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct StreamEntry {
    /// HTTP 请求包体通道
    body_tx: Option<mpsc::Sender<Bytes>>,
    /// TCP / WebSocket 字节通道
    data_tx: Option<mpsc::Sender<Bytes>>,
    done: CancellationToken,
}

/// 会话共享上下文（流处理任务共用）
pub struct SessionContext {
    pub writer: Arc<FrameWriter>,
    pub tunnel: TunnelConfig,
    pub pool: BufferPool,
    /// 收到的请求头解码器
    pub hpack_decoder: hpack::Decoder,
    /// 发出的响应头编码器
    pub hpack_encoder: hpack::Encoder,
    pub done: CancellationToken,
    streams: Mutex<HashMap<String, StreamEntry>>,
}

impl SessionContext {
    /// 发送一个 Data 帧（流处理任务的统一出口）
    pub async fn send_data_frame(
        &self,
        data_type: DataType,
        is_last: bool,
        stream_id: &str,
        request_id: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let header = DataHeader::new(data_type, is_last, stream_id, request_id);
        let payload = encode_data_payload_pooled(&header, data, &self.pool);
        self.writer
            .write_frame_with_cancel(Frame::new_pooled(FrameKind::Data, payload), cancel)
            .await
    }

    /// 发送流关闭帧
    pub async fn send_stream_close(&self, stream_id: &str, request_id: &str) {
        let header = DataHeader::new(DataType::Close, true, stream_id, request_id);
        let payload = encode_data_payload_pooled(&header, &[], &self.pool);
        let _ = self
            .writer
            .write_frame(Frame::new_pooled(FrameKind::Data, payload))
            .await;
    }

    /// 摘除流表条目
    pub fn remove_stream(&self, stream_id: &str) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.remove(stream_id);
        }
    }

    fn insert_stream(&self, stream_id: String, entry: StreamEntry) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.insert(stream_id, entry);
        }
    }

    fn close_all_streams(&self) {
        let entries: Vec<StreamEntry> = match self.streams.lock() {
            Ok(mut streams) => streams.drain().map(|(_, e)| e).collect(),
            Err(_) => return,
        };
        for entry in entries {
            entry.done.cancel();
        }
    }
}

/// 建立一条隧道连接并运行到会话结束
///
/// `join_tunnel_id` 非空时作为附加数据连接加入既有组；
/// 注册成功后通过 `on_registered` 通知调用方
pub async fn connect_and_serve(
    client: &ClientConfig,
    tunnel: &TunnelConfig,
    connector: &TlsConnector,
    pool: &BufferPool,
    join_tunnel_id: Option<String>,
    on_registered: Option<oneshot::Sender<RegisterResponse>>,
) -> Result<()> {
    let addr = format!("{}:{}", client.server_addr, client.server_port);

    let tcp = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(&addr))
        .await
        .map_err(|_| TunnelError::timeout(Duration::from_secs(10)))?
        .map_err(|e| TunnelError::connection_failed(addr.clone(), e))?;
    tune_socket(&tcp);

    let server_name = ServerName::try_from(client.server_addr.clone())
        .map_err(|_| TunnelError::ConfigError(format!("invalid server name: {}", client.server_addr)))?;

    let mut tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| TunnelError::timeout(HANDSHAKE_TIMEOUT))?
        .map_err(|e| TunnelError::connection_failed(addr.clone(), e))?;

    debug!(server = %addr, "TLS connection established");

    // 注册
    let request = RegisterRequest {
        token: client.auth_token.clone(),
        tunnel_type: tunnel.tunnel_type,
        subdomain: if join_tunnel_id.is_some() {
            None
        } else {
            tunnel.subdomain.clone()
        },
        tunnel_id: join_tunnel_id,
    };
    let frame = Frame::new(FrameKind::Register, encode_register_request(&request)?);
    protocol::write_frame(&mut tls, &frame).await?;

    let response_frame = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        protocol::read_frame(&mut tls, MAX_FRAME_PAYLOAD, pool),
    )
    .await
    .map_err(|_| TunnelError::timeout(HANDSHAKE_TIMEOUT))??;

    let response = match response_frame.kind() {
        FrameKind::Register => decode_register_response(response_frame.payload())?,
        FrameKind::Error => {
            let envelope = protocol::decode_error(response_frame.payload())?;
            return Err(TunnelError::protocol(format!(
                "registration rejected: {} ({})",
                envelope.message, envelope.code
            )));
        }
        other => {
            return Err(TunnelError::protocol(format!(
                "unexpected frame kind during registration: {}",
                other.as_str()
            )));
        }
    };

    info!(
        subdomain = %response.subdomain,
        url = %response.url,
        tunnel_id = %response.tunnel_id,
        "Tunnel registered"
    );
    if let Some(tx) = on_registered {
        let _ = tx.send(response.clone());
    }

    // 会话就绪：建立帧写入器与心跳
    let (mut read_half, write_half) = tokio::io::split(tls);
    let writer = FrameWriter::new(write_half);
    writer.enable_heartbeat(HEARTBEAT_INTERVAL, || Some(Frame::empty(FrameKind::Ping)));

    let session = Arc::new(SessionContext {
        writer: Arc::clone(&writer),
        tunnel: tunnel.clone(),
        pool: pool.clone(),
        hpack_decoder: hpack::Decoder::new(0),
        hpack_encoder: hpack::Encoder::new(0),
        done: CancellationToken::new(),
        streams: Mutex::new(HashMap::new()),
    });

    let session_done = session.done.clone();
    writer.set_write_error_handler(move |msg| {
        debug!(error = %msg, "Session write error");
        session_done.cancel();
    });

    // 帧调度循环：HEARTBEAT_TIMEOUT 内无任何帧视为失联
    let result = loop {
        let frame = tokio::select! {
            _ = session.done.cancelled() => break Ok(()),
            frame = tokio::time::timeout(
                HEARTBEAT_TIMEOUT,
                protocol::read_frame(&mut read_half, MAX_FRAME_PAYLOAD, pool),
            ) => match frame {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => break Err(e),
                Err(_) => break Err(TunnelError::timeout(HEARTBEAT_TIMEOUT)),
            },
        };

        match frame.kind() {
            FrameKind::Ping => {
                if let Err(e) = writer.write_control(Frame::empty(FrameKind::Pong)).await {
                    break Err(e);
                }
            }
            FrameKind::Pong => {}
            FrameKind::Data => {
                if let Err(e) = dispatch_data(&session, &frame).await {
                    break Err(e);
                }
            }
            FrameKind::Close => {
                info!("Server closed session");
                break Ok(());
            }
            FrameKind::Error => {
                if let Ok(envelope) = protocol::decode_error(frame.payload()) {
                    warn!(code = %envelope.code, message = %envelope.message, "Server reported error");
                }
                break Err(TunnelError::protocol("server error frame"));
            }
            FrameKind::Register => {
                break Err(TunnelError::protocol("unexpected register frame mid-session"));
            }
        }
    };

    // 收尾
    session.done.cancel();
    session.close_all_streams();
    writer.disable_heartbeat();
    writer.close().await;

    result
}

/// 调度一个 Data 帧
async fn dispatch_data(session: &Arc<SessionContext>, frame: &Frame) -> Result<()> {
    let (header, data) = decode_data_payload(frame.payload())?;

    match header.data_type {
        DataType::HttpHead => on_request_head(session, &header, data),
        DataType::HttpBodyChunk => on_body_chunk(session, &header, data).await,
        DataType::HttpRequest => on_full_request(session, &header, data),
        DataType::Data | DataType::Response => on_stream_data(session, &header, data).await,
        DataType::Close => {
            if let Ok(mut streams) = session.streams.lock() {
                if let Some(entry) = streams.remove(&header.stream_id) {
                    entry.done.cancel();
                }
            }
            Ok(())
        }
        DataType::HttpResponse => {
            // 响应类型码不应出现在请求方向：按流错误处理
            warn!(
                request_id = %header.request_id,
                "Rejecting http_response frame on client role"
            );
            session
                .send_stream_close(&header.stream_id, &header.request_id)
                .await;
            Ok(())
        }
    }
}

/// 流式请求头：建流并启动 HTTP / WebSocket 处理任务
fn on_request_head(session: &Arc<SessionContext>, header: &DataHeader, data: &[u8]) -> Result<()> {
    let head = protocol::decode_request_head(data)?;
    let pairs = session.hpack_decoder.decode(&head.hpack_headers)?;
    let headers = http_util::pairs_to_header_map(&pairs);

    let done = CancellationToken::new();
    let request_id = header.request_id.clone();

    if http_util::is_websocket_upgrade(&headers) {
        // WebSocket：原样透传升级请求，之后按字节泵处理
        let (data_tx, data_rx) = mpsc::channel(32);
        session.insert_stream(
            request_id.clone(),
            StreamEntry {
                body_tx: None,
                data_tx: Some(data_tx),
                done: done.clone(),
            },
        );
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tcp_handler::handle_upgrade_stream(session, head, headers, request_id, data_rx, done)
                .await;
        });
        return Ok(());
    }

    let body_rx = if header.is_last {
        session.insert_stream(
            request_id.clone(),
            StreamEntry {
                body_tx: None,
                data_tx: None,
                done: done.clone(),
            },
        );
        None
    } else {
        let (body_tx, body_rx) = mpsc::channel(32);
        session.insert_stream(
            request_id.clone(),
            StreamEntry {
                body_tx: Some(body_tx),
                data_tx: None,
                done: done.clone(),
            },
        );
        Some(body_rx)
    };

    let session = Arc::clone(session);
    tokio::spawn(async move {
        http_handler::handle_request(session, head, headers, body_rx, request_id, done).await;
    });
    Ok(())
}

/// 请求包体分块
async fn on_body_chunk(
    session: &Arc<SessionContext>,
    header: &DataHeader,
    data: &[u8],
) -> Result<()> {
    let (body_tx, done) = {
        let streams = session
            .streams
            .lock()
            .map_err(|_| TunnelError::protocol("stream table lock poisoned"))?;
        match streams.get(&header.request_id) {
            Some(entry) => (entry.body_tx.clone(), entry.done.clone()),
            None => return Ok(()),
        }
    };

    if let Some(body_tx) = body_tx {
        if !data.is_empty() {
            let chunk = Bytes::copy_from_slice(data);
            tokio::select! {
                _ = done.cancelled() => {}
                _ = body_tx.send(chunk) => {}
            }
        }
    }

    if header.is_last {
        // 丢弃发送端使处理任务看到 EOF
        if let Ok(mut streams) = session.streams.lock() {
            if let Some(entry) = streams.get_mut(&header.request_id) {
                entry.body_tx = None;
            }
        }
    }
    Ok(())
}

/// 完整请求信封（非流式兼容路径）
fn on_full_request(session: &Arc<SessionContext>, header: &DataHeader, data: &[u8]) -> Result<()> {
    let request = protocol::decode_http_request(data)?;
    let request_id = header.request_id.clone();
    let session = Arc::clone(session);
    tokio::spawn(async move {
        http_handler::handle_full_request(session, request, request_id).await;
    });
    Ok(())
}

/// TCP 隧道 / 升级流的字节数据；未知 streamID 在 TCP 隧道下建新流
async fn on_stream_data(
    session: &Arc<SessionContext>,
    header: &DataHeader,
    data: &[u8],
) -> Result<()> {
    let existing = {
        let streams = session
            .streams
            .lock()
            .map_err(|_| TunnelError::protocol("stream table lock poisoned"))?;
        streams
            .get(&header.stream_id)
            .map(|entry| (entry.data_tx.clone(), entry.done.clone()))
    };

    if let Some((data_tx, done)) = existing {
        if let Some(data_tx) = data_tx {
            if !data.is_empty() {
                let chunk = Bytes::copy_from_slice(data);
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = data_tx.send(chunk) => {}
                }
            }
        }
        return Ok(());
    }

    // 新流只在 TCP 隧道上建立；HTTP 隧道收到未知流的数据帧直接丢弃
    if session.tunnel.tunnel_type != TunnelType::Tcp {
        return Ok(());
    }

    let (data_tx, data_rx) = mpsc::channel(32);
    let done = CancellationToken::new();
    if !data.is_empty() {
        let _ = data_tx.try_send(Bytes::copy_from_slice(data));
    }
    session.insert_stream(
        header.stream_id.clone(),
        StreamEntry {
            body_tx: None,
            data_tx: Some(data_tx),
            done: done.clone(),
        },
    );

    let session = Arc::clone(session);
    let stream_id = header.stream_id.clone();
    let request_id = header.request_id.clone();
    tokio::spawn(async move {
        tcp_handler::handle_tcp_stream(session, stream_id, request_id, data_rx, done).await;
    });
    Ok(())
}

/// 套接字调优（与服务端一致）
fn tune_socket(conn: &TcpStream) {
    let _ = conn.set_nodelay(true);
    let sock = SockRef::from(conn);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock.set_tcp_keepalive(&keepalive);
    let _ = sock.set_recv_buffer_size(256 * 1024);
    let _ = sock.set_send_buffer_size(256 * 1024);
}
