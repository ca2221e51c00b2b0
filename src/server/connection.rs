/// 隧道会话处理
///
/// 握手后的第一帧必须是 Register：校验令牌与限流、分配子域名
/// （TCP 隧道另行分配端口）、建组或凭 tunnel_id 加入既有组，
/// 之后进入帧调度循环。协议违例与解码错误对会话致命
use super::group::{generate_tunnel_id, ConnectionGroup, TunnelConn};
use super::tcp_proxy::TunnelProxy;
use super::ServerState;
use crate::config::is_valid_subdomain;
use crate::constants::{self, HANDSHAKE_TIMEOUT, MAX_FRAME_PAYLOAD};
use crate::error::{Result, TunnelError};
use crate::protocol::{
    self, decode_data_payload, decode_register_request, encode_register_response, DataType, Frame,
    FrameKind, RegisterRequest, RegisterResponse, TunnelType,
};
use rand::Rng;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// 处理一条已完成 TLS 握手的隧道连接
pub async fn handle_session<S>(stream: S, remote_addr: String, state: Arc<ServerState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    // 第一帧必须在握手窗口内到达且为 Register
    let first = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        protocol::read_frame(&mut read_half, MAX_FRAME_PAYLOAD, &state.pool),
    )
    .await
    .map_err(|_| TunnelError::protocol("registration frame timed out"))??;

    if first.kind() != FrameKind::Register {
        send_error_direct(
            &mut write_half,
            constants::ERR_CODE_INVALID_REQUEST,
            "expected register frame",
        )
        .await;
        return Err(TunnelError::protocol("expected register frame"));
    }

    let request = match decode_register_request(first.payload()) {
        Ok(request) => request,
        Err(e) => {
            send_error_direct(
                &mut write_half,
                constants::ERR_CODE_INVALID_REQUEST,
                "failed to parse registration request",
            )
            .await;
            return Err(e);
        }
    };

    // 注册限流
    if state.rate_limiter.check().is_err() {
        send_error_direct(
            &mut write_half,
            constants::ERR_CODE_RATE_LIMITED,
            "registration rate limited",
        )
        .await;
        return Err(TunnelError::RateLimited);
    }

    // 静态令牌认证
    if request.token != state.config.auth_token {
        warn!(remote_addr = %remote_addr, "Authentication failed: invalid token");
        send_error_direct(
            &mut write_half,
            constants::ERR_CODE_AUTH_FAILED,
            "invalid authentication token",
        )
        .await;
        return Err(TunnelError::auth_failed("invalid token"));
    }

    let writer = protocol::FrameWriter::new(write_half);
    let conn = TunnelConn::new(remote_addr.clone(), Arc::clone(&writer));

    // 写错误：标记连接不健康并终止会话
    let conn_done = conn.done.clone();
    let conn_for_errors = Arc::clone(&conn);
    writer.set_write_error_handler(move |msg| {
        debug!(error = %msg, "Session write error, tearing down connection");
        conn_for_errors.mark_unhealthy();
        conn_done.cancel();
    });

    // 建组或加入既有组
    let group = match register(&state, &request, Arc::clone(&conn)).await {
        Ok(group) => group,
        Err(e) => {
            let _ = writer
                .write_control(error_frame(e.wire_code(), &e.to_string())?)
                .await;
            writer.flush();
            // 给错误帧一个写出窗口再收尾
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            writer.close().await;
            return Err(e);
        }
    };

    let response = RegisterResponse {
        subdomain: group.subdomain.clone(),
        url: public_url(&state, &group),
        tunnel_id: group.tunnel_id.clone(),
        tcp_port: group.tcp_port,
    };
    info!(
        remote_addr = %remote_addr,
        subdomain = %group.subdomain,
        tunnel_type = %group.tunnel_type,
        tunnel_id = %group.tunnel_id,
        "Tunnel connection registered"
    );

    // 响应注册并进入帧调度循环；任何失败都走统一收尾
    let result = match encode_register_response(&response) {
        Ok(payload) => {
            match writer
                .write_control(Frame::new(FrameKind::Register, payload))
                .await
            {
                Ok(()) => read_loop(&mut read_half, &state, &group, &conn).await,
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };

    // 收尾：摘除连接，组空则整组移除
    let remaining = group.remove_connection(conn.id);
    conn.done.cancel();
    writer.close().await;

    if remaining == 0 {
        if let Some(removed) = state.manager.remove_group(&group.tunnel_id).await {
            if let Some(port) = removed.tcp_port {
                state.port_alloc.release(port);
            }
        }
        info!(subdomain = %group.subdomain, "Last connection left, tunnel torn down");
    }

    result
}

/// 会话帧调度循环
async fn read_loop<R>(
    read_half: &mut R,
    state: &Arc<ServerState>,
    group: &Arc<ConnectionGroup>,
    conn: &Arc<TunnelConn>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = conn.done.cancelled() => return Ok(()),
            frame = protocol::read_frame(read_half, MAX_FRAME_PAYLOAD, &state.pool) => frame?,
        };

        group.touch();

        match frame.kind() {
            FrameKind::Ping => {
                conn.writer.write_control(Frame::empty(FrameKind::Pong)).await?;
            }
            FrameKind::Pong => {}
            FrameKind::Data => {
                dispatch_data(state, group, conn, &frame).await?;
            }
            FrameKind::Close => {
                debug!(remote_addr = %conn.remote_addr, "Client closed session");
                return Ok(());
            }
            FrameKind::Error => {
                if let Ok(envelope) = protocol::decode_error(frame.payload()) {
                    warn!(code = %envelope.code, message = %envelope.message, "Client reported error");
                }
            }
            FrameKind::Register => {
                return Err(TunnelError::protocol("unexpected register frame mid-session"));
            }
        }
    }
}

/// 按组类型调度 Data 帧
async fn dispatch_data(
    state: &Arc<ServerState>,
    group: &Arc<ConnectionGroup>,
    conn: &Arc<TunnelConn>,
    frame: &Frame,
) -> Result<()> {
    let (header, data) = decode_data_payload(frame.payload())?;

    if group.tunnel_type == TunnelType::Tcp {
        let Some(proxy) = group.tcp_proxy() else {
            return Ok(());
        };
        match header.data_type {
            DataType::Data | DataType::Response => {
                proxy.handle_response(&header.stream_id, data).await;
            }
            DataType::Close => {
                proxy.close_stream(&header.stream_id);
            }
            other => {
                // TCP 组不应出现 HTTP 类型码：按流错误关闭该流
                warn!(
                    stream_id = %header.stream_id,
                    data_type = other.as_str(),
                    "Unexpected data type on TCP tunnel"
                );
                proxy.close_stream(&header.stream_id);
            }
        }
        return Ok(());
    }

    state.router.dispatch(conn, &header, data).await
}

/// 处理注册请求：加入既有组或新建组
async fn register(
    state: &Arc<ServerState>,
    request: &RegisterRequest,
    conn: Arc<TunnelConn>,
) -> Result<Arc<ConnectionGroup>> {
    // 附加数据连接：凭 tunnel_id 加入
    if let Some(tunnel_id) = &request.tunnel_id {
        let group = state
            .manager
            .get_group(tunnel_id)
            .ok_or_else(|| TunnelError::TunnelNotFound(tunnel_id.clone()))?;
        if group.token != request.token {
            return Err(TunnelError::auth_failed("token mismatch for tunnel group"));
        }
        if group.tunnel_type != request.tunnel_type {
            return Err(TunnelError::protocol("tunnel type mismatch for tunnel group"));
        }
        group.add_connection(conn);
        return Ok(group);
    }

    // 新隧道：确定子域名
    let subdomain = match &request.subdomain {
        Some(requested) => {
            if !is_valid_subdomain(requested) {
                return Err(TunnelError::protocol(format!(
                    "invalid subdomain '{}'",
                    requested
                )));
            }
            if state.manager.subdomain_taken(requested) {
                return Err(TunnelError::protocol(format!(
                    "subdomain '{}' already taken",
                    requested
                )));
            }
            requested.clone()
        }
        None => loop {
            let candidate = random_subdomain();
            if !state.manager.subdomain_taken(&candidate) {
                break candidate;
            }
        },
    };

    // TCP 隧道：先占端口
    let tcp_port = if request.tunnel_type == TunnelType::Tcp {
        Some(state.port_alloc.allocate().ok_or(TunnelError::PortExhausted)?)
    } else {
        None
    };

    let group = ConnectionGroup::new(
        generate_tunnel_id(),
        subdomain,
        request.token.clone(),
        request.tunnel_type,
        tcp_port,
        conn,
    );

    if let Some(port) = tcp_port {
        let proxy = TunnelProxy::new(
            port,
            group.subdomain.clone(),
            Arc::downgrade(&group),
            state.pool.clone(),
        );
        if let Err(e) = proxy.start(&state.supervisor).await {
            state.port_alloc.release(port);
            return Err(e);
        }
        group.set_tcp_proxy(proxy);
    }

    state.manager.insert_group(Arc::clone(&group));
    Ok(group)
}

/// 随机 8 字符子域名
fn random_subdomain() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// 组的对外访问地址
fn public_url(state: &Arc<ServerState>, group: &ConnectionGroup) -> String {
    match group.tunnel_type {
        TunnelType::Tcp => format!(
            "tcp://{}:{}",
            state.config.domain,
            group.tcp_port.unwrap_or(0)
        ),
        _ => {
            let scheme = if state.config.behind_proxy { "http" } else { "https" };
            match (state.config.behind_proxy, state.config.http_port) {
                (_, 443) if !state.config.behind_proxy => {
                    format!("{}://{}.{}/", scheme, group.subdomain, state.config.domain)
                }
                (_, 80) if state.config.behind_proxy => {
                    format!("{}://{}.{}/", scheme, group.subdomain, state.config.domain)
                }
                (_, port) => format!(
                    "{}://{}.{}:{}/",
                    scheme, group.subdomain, state.config.domain, port
                ),
            }
        }
    }
}

/// 构造 Error 帧
fn error_frame(code: &str, message: &str) -> Result<Frame> {
    let payload = protocol::encode_error(code, message)?;
    Ok(Frame::new(FrameKind::Error, payload))
}

/// 写入器尚未建立时直接写出 Error 帧
async fn send_error_direct<W>(write_half: &mut W, code: &str, message: &str)
where
    W: AsyncWrite + Unpin,
{
    if let Ok(frame) = error_frame(code, message) {
        let _ = protocol::write_frame(write_half, &frame).await;
    }
}
