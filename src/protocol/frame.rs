/// 帧编解码
///
/// 线路格式：kind(1) + flags(1) + length(4, 大端) + 负载。
/// 负载长度超过会话上限时读取侧立即报错，该错误对会话致命
use super::writer::BacklogStamp;
use crate::error::{Result, TunnelError};
use crate::pool::{BufferPool, PooledBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 帧头固定长度
pub const FRAME_HEADER_SIZE: usize = 6;

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// 隧道注册请求/响应
    Register = 0x01,
    /// 数据面帧（负载内嵌 DataHeader 子头）
    Data = 0x02,
    /// 心跳请求
    Ping = 0x03,
    /// 心跳响应
    Pong = 0x04,
    /// 会话关闭
    Close = 0x05,
    /// 错误通知
    Error = 0x06,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(FrameKind::Register),
            0x02 => Ok(FrameKind::Data),
            0x03 => Ok(FrameKind::Ping),
            0x04 => Ok(FrameKind::Pong),
            0x05 => Ok(FrameKind::Close),
            0x06 => Ok(FrameKind::Error),
            other => Err(TunnelError::protocol(format!(
                "unknown frame kind: {:#04x}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Register => "register",
            FrameKind::Data => "data",
            FrameKind::Ping => "ping",
            FrameKind::Pong => "pong",
            FrameKind::Close => "close",
            FrameKind::Error => "error",
        }
    }
}

/// 帧负载：普通堆分配或池持有缓冲
///
/// 池缓冲随负载一起转移所有权，帧被释放时自动归还
pub enum FramePayload {
    Heap(Vec<u8>),
    Pooled(PooledBuf),
}

impl FramePayload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            FramePayload::Heap(v) => v,
            FramePayload::Pooled(b) => b.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::ops::Deref for FramePayload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// 传输单元：类型 + 负载
///
/// 入队后独占归帧写入器所有；backlog 戳随帧释放一次性回退积压计数
pub struct Frame {
    kind: FrameKind,
    payload: FramePayload,
    pub(super) backlog: Option<BacklogStamp>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload: FramePayload::Heap(payload),
            backlog: None,
        }
    }

    pub fn new_pooled(kind: FrameKind, payload: FramePayload) -> Self {
        Self {
            kind,
            payload,
            backlog: None,
        }
    }

    pub fn empty(kind: FrameKind) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// 线路占用字节数（帧头 + 负载）
    pub fn wire_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// 编码帧头
    pub fn encode_header(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0] = self.kind as u8;
        header[1] = 0; // flags 保留
        header[2..6].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        header
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind.as_str())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// 从流中读取一个完整帧
///
/// 负载缓冲从池中取出并随帧转移所有权
pub async fn read_frame<R>(reader: &mut R, max_payload: usize, pool: &BufferPool) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let kind = FrameKind::from_u8(header[0])?;
    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;

    if len > max_payload {
        return Err(TunnelError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }

    if len == 0 {
        return Ok(Frame::empty(kind));
    }

    let mut buf = pool.get(len);
    buf.resize(len, 0);
    reader.read_exact(buf.as_mut_slice()).await?;

    Ok(Frame::new_pooled(kind, FramePayload::Pooled(buf)))
}

/// 直接写出一个帧（注册握手等批处理之外的路径）
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode_header()).await?;
    if !frame.payload().is_empty() {
        writer.write_all(frame.payload()).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let pool = BufferPool::new();
        let frame = Frame::new(FrameKind::Data, b"hello world".to_vec());

        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.unwrap();
        assert_eq!(wire.len(), FRAME_HEADER_SIZE + 11);

        let mut cursor = std::io::Cursor::new(wire);
        let decoded = read_frame(&mut cursor, 1024, &pool).await.unwrap();
        assert_eq!(decoded.kind(), FrameKind::Data);
        assert_eq!(decoded.payload(), b"hello world");
    }

    #[tokio::test]
    async fn test_empty_payload_roundtrip() {
        let pool = BufferPool::new();
        let frame = Frame::empty(FrameKind::Ping);

        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let decoded = read_frame(&mut cursor, 1024, &pool).await.unwrap();
        assert_eq!(decoded.kind(), FrameKind::Ping);
        assert!(decoded.payload().is_empty());
    }

    #[tokio::test]
    async fn test_oversize_rejected() {
        let pool = BufferPool::new();
        let frame = Frame::new(FrameKind::Data, vec![0u8; 64]);

        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let err = read_frame(&mut cursor, 32, &pool).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::PayloadTooLarge { size: 64, max: 32 }
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let pool = BufferPool::new();
        let wire = vec![0x7F, 0, 0, 0, 0, 0];
        let mut cursor = std::io::Cursor::new(wire);
        assert!(read_frame(&mut cursor, 1024, &pool).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let pool = BufferPool::new();
        // 声明 10 字节负载但只有 3 字节
        let wire = vec![0x02, 0, 0, 0, 0, 10, b'a', b'b', b'c'];
        let mut cursor = std::io::Cursor::new(wire);
        assert!(read_frame(&mut cursor, 1024, &pool).await.is_err());
    }
}
