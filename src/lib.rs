/// 反向隧道库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod hpack;
pub mod http_util;
pub mod io_util;
pub mod pool;
pub mod protocol;
pub mod rate_limiter;
pub mod recovery;
pub mod server;
pub mod tls;

// 重新导出常用类型
pub use config::{AppConfig, ClientConfig, ClientFullConfig, ServerConfig, TunnelConfig};
pub use error::{Result, TunnelError};
pub use pool::BufferPool;
pub use protocol::{DataHeader, DataType, Frame, FrameKind, FrameWriter, TunnelType};
