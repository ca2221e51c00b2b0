mod connection;
mod group;
mod http_router;
mod listener;
mod port_alloc;
mod tcp_proxy;

pub use group::{ConnectionGroup, GroupManager, TunnelConn};
pub use http_router::HttpRouter;
pub use port_alloc::PortAllocator;
pub use tcp_proxy::TunnelProxy;

use crate::config::ServerConfig;
use crate::pool::{BufferPool, WorkerPool};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::recovery::{PanicMetrics, Supervisor};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 服务器共享状态
pub struct ServerState {
    pub config: ServerConfig,
    pub manager: Arc<GroupManager>,
    pub router: Arc<HttpRouter>,
    pub port_alloc: Arc<PortAllocator>,
    pub rate_limiter: RateLimiter,
    pub pool: BufferPool,
    pub supervisor: Supervisor,
    pub worker_pool: WorkerPool,
    pub stop: CancellationToken,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let pool = BufferPool::new();
        let manager = GroupManager::with_defaults();
        let router = HttpRouter::new(Arc::clone(&manager), config.domain.clone(), pool.clone());
        let port_alloc = Arc::new(PortAllocator::new(config.tcp_port_min, config.tcp_port_max));

        let rate_limiter = match &config.rate_limit {
            Some(rl) => RateLimiter::new(RateLimiterConfig {
                requests_per_second: rl.requests_per_second,
                burst_size: rl.burst_size,
            }),
            None => RateLimiter::with_defaults(),
        };

        Arc::new(Self {
            config,
            manager,
            router,
            port_alloc,
            rate_limiter,
            pool,
            supervisor: Supervisor::new(PanicMetrics::new()),
            worker_pool: WorkerPool::with_default_sizing(),
            stop: CancellationToken::new(),
        })
    }
}

/// 运行服务器：控制监听（TLS 1.3）+ 边缘 HTTP 监听
pub async fn run_server(config: ServerConfig, acceptor: TlsAcceptor) -> Result<()> {
    let control_addr = format!("{}:{}", config.bind_addr, config.control_port);
    let edge_addr = format!("{}:{}", config.bind_addr, config.http_port);
    let behind_proxy = config.behind_proxy;

    info!(
        control = %control_addr,
        edge = %edge_addr,
        domain = %config.domain,
        "Starting tunnel server"
    );

    let state = ServerState::new(config);

    let control_listener = TcpListener::bind(&control_addr)
        .await
        .with_context(|| format!("Failed to bind control listener on {}", control_addr))?;
    let edge_listener = TcpListener::bind(&edge_addr)
        .await
        .with_context(|| format!("Failed to bind edge listener on {}", edge_addr))?;

    // 边缘监听：反代部署时退化为明文 HTTP
    let edge_tls = if behind_proxy {
        None
    } else {
        Some(acceptor.clone())
    };
    let edge_task = tokio::spawn(http_router::run_edge_listener(
        Arc::clone(&state.router),
        edge_listener,
        edge_tls,
        state.supervisor.clone(),
        state.stop.clone(),
    ));

    info!("Waiting for tunnel connections... (Press Ctrl+C to stop)");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        _ = listener::run_control_listener(Arc::clone(&state), acceptor, control_listener) => {}
        _ = &mut shutdown => {
            info!("Received shutdown signal, stopping server...");
        }
    }

    state.stop.cancel();
    state.manager.close().await;
    if let Err(e) = edge_task.await {
        error!(error = %e, "Edge listener task failed");
    }

    info!("Server stopped gracefully");
    Ok(())
}
