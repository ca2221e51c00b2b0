/// 隧道组与组管理器
///
/// 一个组对应一个隧道：一条主控制连接加 N 条同客户端的附加数据
/// 连接。组内所有连接共享令牌与子域名；清理循环定期摘除失活的组
use super::tcp_proxy::TunnelProxy;
use crate::hpack;
use crate::protocol::{FrameWriter, TunnelType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 组清理周期
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// 超过该时长无活动的组视为失活
pub const STALE_TIMEOUT: Duration = Duration::from_secs(300);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// 生成 16 字节随机隧道 ID（hex 编码）
pub fn generate_tunnel_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// 隧道会话连接：帧写入器 + 每方向一对 HPACK 表
pub struct TunnelConn {
    pub id: u64,
    pub remote_addr: String,
    pub writer: Arc<FrameWriter>,
    pub done: CancellationToken,
    pub healthy: AtomicBool,
    pub joined_at: Instant,
    /// 该连接上发出的请求头编码器
    pub hpack_encoder: hpack::Encoder,
    /// 该连接上收到的响应头解码器
    pub hpack_decoder: hpack::Decoder,
}

impl TunnelConn {
    pub fn new(remote_addr: String, writer: Arc<FrameWriter>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            writer,
            done: CancellationToken::new(),
            healthy: AtomicBool::new(true),
            joined_at: Instant::now(),
            hpack_encoder: hpack::Encoder::new(0),
            hpack_decoder: hpack::Decoder::new(0),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}

struct GroupConns {
    primary: Option<Arc<TunnelConn>>,
    additional: Vec<Arc<TunnelConn>>,
}

/// 隧道组
pub struct ConnectionGroup {
    pub tunnel_id: String,
    pub subdomain: String,
    pub token: String,
    pub tunnel_type: TunnelType,
    pub tcp_port: Option<u16>,
    conns: RwLock<GroupConns>,
    rr_counter: AtomicUsize,
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
    tcp_proxy: Mutex<Option<Arc<TunnelProxy>>>,
    closed: AtomicBool,
}

impl ConnectionGroup {
    pub fn new(
        tunnel_id: String,
        subdomain: String,
        token: String,
        tunnel_type: TunnelType,
        tcp_port: Option<u16>,
        primary: Arc<TunnelConn>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tunnel_id,
            subdomain,
            token,
            tunnel_type,
            tcp_port,
            conns: RwLock::new(GroupConns {
                primary: Some(primary),
                additional: Vec::new(),
            }),
            rr_counter: AtomicUsize::new(0),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            tcp_proxy: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// 记录活动时间
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    /// 是否失活
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_activity
            .lock()
            .map(|last| last.elapsed() > timeout)
            .unwrap_or(true)
    }

    /// 加入附加数据连接
    pub fn add_connection(&self, conn: Arc<TunnelConn>) {
        self.touch();
        if let Ok(mut conns) = self.conns.write() {
            conns.additional.push(conn);
        }
    }

    /// 摘除连接；主连接被摘除时提升最早加入的附加连接
    ///
    /// 返回组内剩余连接数
    pub fn remove_connection(&self, conn_id: u64) -> usize {
        let mut conns = match self.conns.write() {
            Ok(conns) => conns,
            Err(_) => return 0,
        };

        if conns.primary.as_ref().map(|c| c.id) == Some(conn_id) {
            conns.primary = None;
            if !conns.additional.is_empty() {
                let promoted = conns.additional.remove(0);
                debug!(
                    tunnel_id = %self.tunnel_id,
                    conn_id = promoted.id,
                    "Promoted additional connection to primary"
                );
                conns.primary = Some(promoted);
            }
        } else {
            conns.additional.retain(|c| c.id != conn_id);
        }

        conns.primary.iter().count() + conns.additional.len()
    }

    /// 轮转选择一条健康连接
    pub fn pick_connection(&self) -> Option<Arc<TunnelConn>> {
        let conns = self.conns.read().ok()?;
        let mut candidates: Vec<&Arc<TunnelConn>> = Vec::new();
        if let Some(primary) = conns.primary.as_ref() {
            candidates.push(primary);
        }
        candidates.extend(conns.additional.iter());
        candidates.retain(|c| c.is_healthy());

        if candidates.is_empty() {
            return None;
        }

        let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(candidates[idx]))
    }

    /// 当前连接数
    pub fn connection_count(&self) -> usize {
        self.conns
            .read()
            .map(|c| c.primary.iter().count() + c.additional.len())
            .unwrap_or(0)
    }

    /// 绑定 TCP 隧道代理
    pub fn set_tcp_proxy(&self, proxy: Arc<TunnelProxy>) {
        if let Ok(mut slot) = self.tcp_proxy.lock() {
            *slot = Some(proxy);
        }
    }

    pub fn tcp_proxy(&self) -> Option<Arc<TunnelProxy>> {
        self.tcp_proxy.lock().ok().and_then(|slot| slot.clone())
    }

    /// 关闭组：停止代理、断开全部连接；幂等
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let proxy = self.tcp_proxy.lock().ok().and_then(|mut slot| slot.take());
        if let Some(proxy) = proxy {
            proxy.stop().await;
        }

        let conns: Vec<Arc<TunnelConn>> = {
            let mut guard = match self.conns.write() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let mut all = Vec::with_capacity(1 + guard.additional.len());
            if let Some(primary) = guard.primary.take() {
                all.push(primary);
            }
            all.append(&mut guard.additional);
            all
        };

        for conn in conns {
            conn.done.cancel();
            conn.writer.close().await;
        }

        info!(tunnel_id = %self.tunnel_id, subdomain = %self.subdomain, "Tunnel group closed");
    }
}

/// 组管理器：隧道 ID 与子域名两个索引 + 失活清理循环
pub struct GroupManager {
    groups: RwLock<HashMap<String, Arc<ConnectionGroup>>>,
    subdomains: RwLock<HashMap<String, String>>,
    stale_timeout: Duration,
    stop: CancellationToken,
}

impl GroupManager {
    pub fn new(cleanup_interval: Duration, stale_timeout: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            groups: RwLock::new(HashMap::new()),
            subdomains: RwLock::new(HashMap::new()),
            stale_timeout,
            stop: CancellationToken::new(),
        });

        let cleanup = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { cleanup.reap_stale_groups().await; },
                    _ = cleanup.stop.cancelled() => break,
                }
            }
        });

        manager
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(CLEANUP_INTERVAL, STALE_TIMEOUT)
    }

    /// 注册新组
    pub fn insert_group(&self, group: Arc<ConnectionGroup>) {
        if let Ok(mut groups) = self.groups.write() {
            groups.insert(group.tunnel_id.clone(), Arc::clone(&group));
        }
        if let Ok(mut subdomains) = self.subdomains.write() {
            subdomains.insert(group.subdomain.clone(), group.tunnel_id.clone());
        }
    }

    /// 按隧道 ID 查组
    pub fn get_group(&self, tunnel_id: &str) -> Option<Arc<ConnectionGroup>> {
        self.groups.read().ok()?.get(tunnel_id).cloned()
    }

    /// 按子域名查组
    pub fn lookup_subdomain(&self, subdomain: &str) -> Option<Arc<ConnectionGroup>> {
        let tunnel_id = self.subdomains.read().ok()?.get(subdomain).cloned()?;
        self.get_group(&tunnel_id)
    }

    /// 子域名是否已被占用
    pub fn subdomain_taken(&self, subdomain: &str) -> bool {
        self.subdomains
            .read()
            .map(|map| map.contains_key(subdomain))
            .unwrap_or(true)
    }

    /// 摘除并关闭组；返回被摘除的组（调用方负责释放端口）
    pub async fn remove_group(&self, tunnel_id: &str) -> Option<Arc<ConnectionGroup>> {
        let group = {
            let mut groups = self.groups.write().ok()?;
            groups.remove(tunnel_id)
        }?;
        if let Ok(mut subdomains) = self.subdomains.write() {
            subdomains.remove(&group.subdomain);
        }
        group.close().await;
        Some(group)
    }

    /// 摘除失活组：持锁收集并摘除，出锁后关闭，避免阻塞并发注册
    pub async fn reap_stale_groups(&self) -> Vec<Arc<ConnectionGroup>> {
        let stale: Vec<Arc<ConnectionGroup>> = {
            let mut groups = match self.groups.write() {
                Ok(groups) => groups,
                Err(_) => return Vec::new(),
            };
            let stale_ids: Vec<String> = groups
                .iter()
                .filter(|(_, g)| g.is_stale(self.stale_timeout))
                .map(|(id, _)| id.clone())
                .collect();
            stale_ids
                .iter()
                .filter_map(|id| groups.remove(id))
                .collect()
        };

        if stale.is_empty() {
            return stale;
        }

        if let Ok(mut subdomains) = self.subdomains.write() {
            for group in &stale {
                subdomains.remove(&group.subdomain);
            }
        }

        for group in &stale {
            info!(
                tunnel_id = %group.tunnel_id,
                subdomain = %group.subdomain,
                "Reaping stale tunnel group"
            );
            group.close().await;
        }

        stale
    }

    /// 当前组数量
    pub fn group_count(&self) -> usize {
        self.groups.read().map(|g| g.len()).unwrap_or(0)
    }

    /// 停止管理器并关闭所有组；幂等
    pub async fn close(&self) {
        self.stop.cancel();

        let groups: Vec<Arc<ConnectionGroup>> = {
            match self.groups.write() {
                Ok(mut guard) => guard.drain().map(|(_, g)| g).collect(),
                Err(_) => return,
            }
        };
        if let Ok(mut subdomains) = self.subdomains.write() {
            subdomains.clear();
        }

        for group in groups {
            group.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameWriterConfig;

    fn test_conn() -> Arc<TunnelConn> {
        let writer = FrameWriter::with_config(Vec::new(), FrameWriterConfig::default());
        TunnelConn::new("127.0.0.1:1".to_string(), writer)
    }

    fn test_group(subdomain: &str) -> Arc<ConnectionGroup> {
        ConnectionGroup::new(
            generate_tunnel_id(),
            subdomain.to_string(),
            "token".to_string(),
            TunnelType::Http,
            None,
            test_conn(),
        )
    }

    #[test]
    fn test_tunnel_id_format() {
        let id = generate_tunnel_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_tunnel_id());
    }

    #[tokio::test]
    async fn test_group_lookup_by_subdomain() {
        let manager = GroupManager::with_defaults();
        let group = test_group("foo");
        manager.insert_group(Arc::clone(&group));

        assert!(manager.subdomain_taken("foo"));
        assert!(!manager.subdomain_taken("bar"));

        let found = manager.lookup_subdomain("foo").unwrap();
        assert_eq!(found.tunnel_id, group.tunnel_id);
        assert!(manager.lookup_subdomain("bar").is_none());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_remove_group_clears_indexes() {
        let manager = GroupManager::with_defaults();
        let group = test_group("foo");
        let tunnel_id = group.tunnel_id.clone();
        manager.insert_group(group);

        assert!(manager.remove_group(&tunnel_id).await.is_some());
        assert!(manager.get_group(&tunnel_id).is_none());
        assert!(!manager.subdomain_taken("foo"));
        assert!(manager.remove_group(&tunnel_id).await.is_none());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_stale_reaping() {
        let manager = GroupManager::new(Duration::from_secs(3600), Duration::from_millis(10));
        let group = test_group("foo");
        manager.insert_group(Arc::clone(&group));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let reaped = manager.reap_stale_groups().await;
        assert_eq!(reaped.len(), 1);
        assert_eq!(manager.group_count(), 0);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_touch_prevents_reaping() {
        let manager = GroupManager::new(Duration::from_secs(3600), Duration::from_millis(100));
        let group = test_group("foo");
        manager.insert_group(Arc::clone(&group));

        tokio::time::sleep(Duration::from_millis(60)).await;
        group.touch();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(manager.reap_stale_groups().await.is_empty());
        assert_eq!(manager.group_count(), 1);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_primary_promotion() {
        let group = test_group("foo");
        let primary_id = group.pick_connection().unwrap().id;

        let extra = test_conn();
        let extra_id = extra.id;
        group.add_connection(extra);
        assert_eq!(group.connection_count(), 2);

        let remaining = group.remove_connection(primary_id);
        assert_eq!(remaining, 1);

        // 附加连接被提升为主连接
        let picked = group.pick_connection().unwrap();
        assert_eq!(picked.id, extra_id);

        group.close().await;
    }

    #[tokio::test]
    async fn test_round_robin_skips_unhealthy() {
        let group = test_group("foo");
        let extra = test_conn();
        let extra_id = extra.id;
        group.add_connection(extra);

        // 主连接标记不健康后只会选中附加连接
        let primary = {
            let conns = group.conns.read().unwrap();
            Arc::clone(conns.primary.as_ref().unwrap())
        };
        primary.mark_unhealthy();

        for _ in 0..4 {
            assert_eq!(group.pick_connection().unwrap().id, extra_id);
        }

        group.close().await;
    }

    #[tokio::test]
    async fn test_group_close_idempotent() {
        let group = test_group("foo");
        group.close().await;
        group.close().await;
        assert_eq!(group.connection_count(), 0);
    }
}
