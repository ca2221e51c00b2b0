/// 协议常量定义
///
/// 所有超时、端口范围与线路错误码集中在此，客户端与服务端共用
use std::time::Duration;

/// 隧道服务器默认监听端口（客户端注册连接）
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// 边缘 HTTP 监听默认端口
pub const DEFAULT_HTTP_PORT: u16 = 443;

/// 客户端心跳发送间隔
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// 超过该时长未收到任何帧则认为对端失联
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(6);

/// 等待客户端响应 HTTP 请求的最长时间
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 重连初始退避
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// 重连最大退避
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// 最大重连次数（0 表示无限）
pub const MAX_RECONNECT_ATTEMPTS: u32 = 0;

/// TCP 隧道端口分配范围
pub const DEFAULT_TCP_PORT_MIN: u16 = 20000;
pub const DEFAULT_TCP_PORT_MAX: u16 = 40000;

/// 默认隧道域名
pub const DEFAULT_DOMAIN: &str = "tunnel.localhost";

/// TLS 握手超时
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 单帧最大负载（会话建立时固定，读取侧强制校验）
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

// 线路错误码
pub const ERR_CODE_TUNNEL_NOT_FOUND: &str = "TUNNEL_NOT_FOUND";
pub const ERR_CODE_TIMEOUT: &str = "TIMEOUT";
pub const ERR_CODE_CONNECTION_FAILED: &str = "CONNECTION_FAILED";
pub const ERR_CODE_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERR_CODE_AUTH_FAILED: &str = "AUTH_FAILED";
pub const ERR_CODE_RATE_LIMITED: &str = "RATE_LIMITED";
pub const ERR_CODE_PORT_EXHAUSTED: &str = "PORT_EXHAUSTED";
