/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error
/// 这样可以让调用者进行更精确的错误处理和恢复
use crate::constants;
use std::io;
use thiserror::Error;

/// 隧道系统的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 认证失败
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// 协议错误（帧解码失败、非法帧序等，对会话致命）
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// HPACK 编解码错误（对会话致命）
    #[error("HPACK error: {0}")]
    HpackError(String),

    /// 帧超过会话允许的最大长度
    #[error("Frame payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// 写入端已关闭
    #[error("Writer closed")]
    WriterClosed,

    /// 入队等待被取消
    #[error("Write cancelled")]
    WriteCancelled,

    /// 队列已满且等待超时
    #[error("Write queue full timeout")]
    QueueFullTimeout,

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 隧道未找到
    #[error("Tunnel '{0}' not found")]
    TunnelNotFound(String),

    /// 端口范围耗尽
    #[error("No free port in tunnel port range")]
    PortExhausted,

    /// 注册被限流
    #[error("Registration rate limited")]
    RateLimited,

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建认证失败错误
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// 创建 HPACK 错误
    pub fn hpack(msg: impl Into<String>) -> Self {
        Self::HpackError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为认证失败
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }

    /// 映射为线路错误码（用于 Error 帧）
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => constants::ERR_CODE_AUTH_FAILED,
            Self::TunnelNotFound(_) => constants::ERR_CODE_TUNNEL_NOT_FOUND,
            Self::PortExhausted => constants::ERR_CODE_PORT_EXHAUSTED,
            Self::RateLimited => constants::ERR_CODE_RATE_LIMITED,
            Self::Timeout { .. } => constants::ERR_CODE_TIMEOUT,
            Self::ConnectionFailed { .. } => constants::ERR_CODE_CONNECTION_FAILED,
            _ => constants::ERR_CODE_INVALID_REQUEST,
        }
    }

    /// 是否为预期内的断连错误（记录为 debug 而非 error）
    pub fn is_expected_disconnect(&self) -> bool {
        match self {
            Self::Io(e) | Self::ConnectionFailed { source: e, .. } => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_creation() {
        let err = TunnelError::auth_failed("Invalid token");
        assert!(err.is_auth_failed());
        assert_eq!(err.to_string(), "Authentication failed: Invalid token");
    }

    #[test]
    fn test_timeout_error() {
        let err = TunnelError::timeout(Duration::from_secs(30));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_wire_code_mapping() {
        assert_eq!(
            TunnelError::auth_failed("x").wire_code(),
            constants::ERR_CODE_AUTH_FAILED
        );
        assert_eq!(
            TunnelError::TunnelNotFound("foo".into()).wire_code(),
            constants::ERR_CODE_TUNNEL_NOT_FOUND
        );
        assert_eq!(
            TunnelError::PortExhausted.wire_code(),
            constants::ERR_CODE_PORT_EXHAUSTED
        );
        assert_eq!(
            TunnelError::RateLimited.wire_code(),
            constants::ERR_CODE_RATE_LIMITED
        );
        assert_eq!(
            TunnelError::protocol("bad frame").wire_code(),
            constants::ERR_CODE_INVALID_REQUEST
        );
    }

    #[test]
    fn test_expected_disconnect() {
        let reset = TunnelError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_expected_disconnect());

        let auth = TunnelError::auth_failed("nope");
        assert!(!auth.is_expected_disconnect());
    }
}
