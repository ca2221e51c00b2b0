mod http_handler;
mod session;
mod tcp_handler;

pub use session::{connect_and_serve, SessionContext};

use crate::config::{ClientFullConfig, TunnelConfig};
use crate::constants::{MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY};
use crate::pool::BufferPool;
use anyhow::Result;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 运行客户端：每条隧道独立维护会话与重连
pub async fn run_client(config: ClientFullConfig, connector: TlsConnector) -> Result<()> {
    let pool = BufferPool::new();
    let mut tasks = tokio::task::JoinSet::new();

    for tunnel in config.tunnels.clone() {
        let client = config.client.clone();
        let connector = connector.clone();
        let pool = pool.clone();
        tasks.spawn(async move {
            tunnel_loop(client, tunnel, connector, pool).await;
        });
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        _ = &mut shutdown => {
            info!("Received shutdown signal, stopping client...");
            tasks.abort_all();
        }
        _ = async {
            while tasks.join_next().await.is_some() {}
        } => {}
    }

    info!("Client stopped");
    Ok(())
}

/// 单条隧道的会话循环：断线后指数退避 + 满抖动重连，默认不限次数
async fn tunnel_loop(
    client: crate::config::ClientConfig,
    tunnel: TunnelConfig,
    connector: TlsConnector,
    pool: BufferPool,
) {
    let mut attempt: u32 = 0;

    loop {
        let registered = Arc::new(AtomicBool::new(false));
        let scope = CancellationToken::new();

        // 注册成功后：记录地址并按需拉起附加数据连接
        let (reg_tx, reg_rx) = oneshot::channel::<crate::protocol::RegisterResponse>();
        let watcher_registered = Arc::clone(&registered);
        let watcher_scope = scope.clone();
        let watcher_client = client.clone();
        let watcher_tunnel = tunnel.clone();
        let watcher_connector = connector.clone();
        let watcher_pool = pool.clone();
        let watcher = tokio::spawn(async move {
            let Ok(response) = reg_rx.await else {
                return;
            };
            watcher_registered.store(true, Ordering::Release);
            info!(url = %response.url, "Tunnel is up");

            for i in 1..watcher_tunnel.connections {
                let client = watcher_client.clone();
                let tunnel = watcher_tunnel.clone();
                let connector = watcher_connector.clone();
                let pool = watcher_pool.clone();
                let tunnel_id = response.tunnel_id.clone();
                let scope = watcher_scope.clone();
                tokio::spawn(async move {
                    additional_connection_loop(client, tunnel, connector, pool, tunnel_id, scope, i)
                        .await;
                });
            }
        });

        let result = connect_and_serve(&client, &tunnel, &connector, &pool, None, Some(reg_tx)).await;

        scope.cancel();
        watcher.abort();

        match result {
            Ok(()) => debug!("Session ended"),
            Err(e) => {
                if e.is_expected_disconnect() {
                    debug!(error = %e, "Session disconnected");
                } else {
                    warn!(error = %e, "Session failed");
                }
            }
        }

        if registered.load(Ordering::Acquire) {
            attempt = 0;
        }
        attempt = attempt.saturating_add(1);

        if MAX_RECONNECT_ATTEMPTS > 0 && attempt > MAX_RECONNECT_ATTEMPTS {
            error!("Reconnect attempts exhausted, giving up");
            return;
        }

        let delay = reconnect_delay(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting...");
        tokio::time::sleep(delay).await;
    }
}

/// 附加数据连接：凭 tunnel_id 加入组，主会话存活期间保持重连
async fn additional_connection_loop(
    client: crate::config::ClientConfig,
    tunnel: TunnelConfig,
    connector: TlsConnector,
    pool: BufferPool,
    tunnel_id: String,
    scope: CancellationToken,
    index: usize,
) {
    let mut attempt: u32 = 0;

    while !scope.is_cancelled() {
        let serve = connect_and_serve(
            &client,
            &tunnel,
            &connector,
            &pool,
            Some(tunnel_id.clone()),
            None,
        );

        let result = tokio::select! {
            _ = scope.cancelled() => return,
            result = serve => result,
        };

        match result {
            Ok(()) => attempt = 0,
            Err(e) => {
                debug!(index, error = %e, "Additional connection failed");
                attempt = attempt.saturating_add(1);
            }
        }

        let delay = reconnect_delay(attempt.max(1));
        tokio::select! {
            _ = scope.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// 指数退避 + 满抖动：delay = rand(0, min(max, base * 2^attempt))
fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ceiling = RECONNECT_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(exp))
        .min(RECONNECT_MAX_DELAY);
    let millis = ceiling.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}
