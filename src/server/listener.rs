/// 隧道控制监听
///
/// TLS 1.3 接受循环：10 秒握手期限、套接字调优、有界工作池分发。
/// 工作池队列满时回退为直接 spawn，接受循环永不因此停顿；每个
/// 处理任务都带 panic 监督
use super::connection::handle_session;
use super::ServerState;
use crate::constants::HANDSHAKE_TIMEOUT;
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const SOCKET_BUFFER_SIZE: usize = 256 * 1024;
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// 控制监听接受循环
pub async fn run_control_listener(
    state: Arc<ServerState>,
    acceptor: TlsAcceptor,
    listener: TcpListener,
) {
    info!("Control listener started (TLS 1.3)");

    loop {
        let (conn, peer) = tokio::select! {
            _ = state.stop.cancelled() => break,
            result = listener.accept() => match result {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        tune_socket(&conn);

        let peer_addr = peer.to_string();
        let task: crate::pool::Job = Box::pin(state.supervisor.wrap(
            format!("session-{}", peer_addr),
            handshake_and_handle(conn, peer_addr, acceptor.clone(), Arc::clone(&state)),
        ));

        // 工作池满时任务被退回，直接 spawn，接受循环不等待
        if let Err(task) = state.worker_pool.try_submit(task) {
            tokio::spawn(task);
        }
    }

    info!("Control listener stopped");
}

/// TLS 握手（限时）+ 会话处理 + 错误分级日志
async fn handshake_and_handle(
    conn: TcpStream,
    peer: String,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
) {
    let tls_conn = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(conn)).await {
        Ok(Ok(tls_conn)) => tls_conn,
        Ok(Err(e)) => {
            warn!(remote_addr = %peer, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(remote_addr = %peer, "TLS handshake timed out");
            return;
        }
    };

    // 配置已固定 TLS 1.3；此处再做一次协商结果校验
    let (_, session) = tls_conn.get_ref();
    if session.protocol_version() != Some(tokio_rustls::rustls::ProtocolVersion::TLSv1_3) {
        warn!(remote_addr = %peer, "Connection negotiated below TLS 1.3, rejecting");
        return;
    }

    debug!(remote_addr = %peer, "New tunnel connection");

    if let Err(e) = handle_session(tls_conn, peer.clone(), state).await {
        if e.is_expected_disconnect() {
            debug!(remote_addr = %peer, error = %e, "Client disconnected");
        } else if matches!(
            e,
            crate::error::TunnelError::ProtocolError(_)
                | crate::error::TunnelError::PayloadTooLarge { .. }
        ) {
            // 协议违例（无效客户端、扫描器）属预期范围
            warn!(remote_addr = %peer, error = %e, "Protocol validation failed");
        } else {
            error!(remote_addr = %peer, error = %e, "Connection handling failed");
        }
    }
}

/// 套接字调优：nodelay、keepalive、读写缓冲
fn tune_socket(conn: &TcpStream) {
    let _ = conn.set_nodelay(true);

    let sock = SockRef::from(conn);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_PERIOD)
        .with_interval(Duration::from_secs(10));
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "Failed to set TCP keepalive");
    }
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "Failed to set receive buffer size");
    }
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "Failed to set send buffer size");
    }
}
