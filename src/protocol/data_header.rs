/// Data 帧二进制子头
///
/// 线路格式（大端）：
///
/// ```text
/// +--------+-----------------+----------------+
/// | Flags  | StreamID Length | RequestID Len  |
/// | 1 byte | 2 bytes         | 2 bytes        |
/// +--------+-----------------+----------------+
/// | StreamID (变长) | RequestID (变长) | 负载 |
/// +------------------------------------------+
/// ```
///
/// Flags: bit 0-2 类型，bit 3 is_last，bit 4-7 保留
use super::frame::FramePayload;
use crate::error::{Result, TunnelError};
use crate::pool::{BufferPool, POOL_THRESHOLD, SIZE_LARGE};

/// 子头最小长度：1 字节 flags + 2x2 字节长度
pub const DATA_HEADER_MIN_SIZE: usize = 5;

/// Data 帧负载类型（3 位编码）
///
/// `HttpHead` 与 `HttpBodyChunk` 为请求与响应两个方向共用的编码，
/// 方向由会话角色推断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Data = 0x00,
    Response = 0x01,
    Close = 0x02,
    HttpRequest = 0x03,
    HttpResponse = 0x04,
    HttpHead = 0x05,
    HttpBodyChunk = 0x06,
}

impl DataType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(DataType::Data),
            0x01 => Ok(DataType::Response),
            0x02 => Ok(DataType::Close),
            0x03 => Ok(DataType::HttpRequest),
            0x04 => Ok(DataType::HttpResponse),
            0x05 => Ok(DataType::HttpHead),
            0x06 => Ok(DataType::HttpBodyChunk),
            other => Err(TunnelError::protocol(format!(
                "unknown data type: {:#04x}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Data => "data",
            DataType::Response => "response",
            DataType::Close => "close",
            DataType::HttpRequest => "http_request",
            DataType::HttpResponse => "http_response",
            DataType::HttpHead => "http_head",
            DataType::HttpBodyChunk => "http_body_chunk",
        }
    }
}

/// Data 帧子头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
    pub data_type: DataType,
    pub is_last: bool,
    pub stream_id: String,
    pub request_id: String,
}

impl DataHeader {
    pub fn new(
        data_type: DataType,
        is_last: bool,
        stream_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            data_type,
            is_last,
            stream_id: stream_id.into(),
            request_id: request_id.into(),
        }
    }

    /// 编码后的子头长度
    pub fn size(&self) -> usize {
        DATA_HEADER_MIN_SIZE + self.stream_id.len() + self.request_id.len()
    }

    fn flags(&self) -> u8 {
        let mut flags = (self.data_type as u8) & 0x07;
        if self.is_last {
            flags |= 0x08;
        }
        flags
    }

    fn write_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.flags());
        buf.extend_from_slice(&(self.stream_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.request_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.stream_id.as_bytes());
        buf.extend_from_slice(self.request_id.as_bytes());
    }

    /// 编码子头
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.write_into(&mut buf);
        buf
    }

    /// 解码子头；data 可以带有尾随负载
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < DATA_HEADER_MIN_SIZE {
            return Err(TunnelError::protocol("invalid data header: too short"));
        }

        let flags = data[0];
        let data_type = DataType::from_u8(flags & 0x07)?;
        let is_last = flags & 0x08 != 0;

        let stream_id_len = u16::from_be_bytes([data[1], data[2]]) as usize;
        let request_id_len = u16::from_be_bytes([data[3], data[4]]) as usize;

        let expected = DATA_HEADER_MIN_SIZE + stream_id_len + request_id_len;
        if data.len() < expected {
            return Err(TunnelError::protocol("invalid data header: length mismatch"));
        }

        let stream_id = std::str::from_utf8(&data[DATA_HEADER_MIN_SIZE..DATA_HEADER_MIN_SIZE + stream_id_len])
            .map_err(|_| TunnelError::protocol("stream id is not valid utf-8"))?
            .to_string();
        let request_id = std::str::from_utf8(
            &data[DATA_HEADER_MIN_SIZE + stream_id_len..expected],
        )
        .map_err(|_| TunnelError::protocol("request id is not valid utf-8"))?
        .to_string();

        Ok(Self {
            data_type,
            is_last,
            stream_id,
            request_id,
        })
    }
}

/// 编码 Data 帧负载：子头 + 数据
pub fn encode_data_payload(header: &DataHeader, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header.size() + data.len());
    header.write_into(&mut buf);
    buf.extend_from_slice(data);
    buf
}

/// 池化编码：长负载从缓冲池取缓冲，过小或过大的负载直接堆分配
pub fn encode_data_payload_pooled(
    header: &DataHeader,
    data: &[u8],
    pool: &BufferPool,
) -> FramePayload {
    let total = header.size() + data.len();

    if total < POOL_THRESHOLD || total > SIZE_LARGE {
        return FramePayload::Heap(encode_data_payload(header, data));
    }

    let mut buf = pool.get(total);
    buf.push(header.flags());
    buf.extend_from_slice(&(header.stream_id.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(header.request_id.len() as u16).to_be_bytes());
    buf.extend_from_slice(header.stream_id.as_bytes());
    buf.extend_from_slice(header.request_id.as_bytes());
    buf.extend_from_slice(data);
    FramePayload::Pooled(buf)
}

/// 解码 Data 帧负载，返回子头与数据切片
pub fn decode_data_payload(payload: &[u8]) -> Result<(DataHeader, &[u8])> {
    let header = DataHeader::unmarshal(payload)?;
    let data = &payload[header.size()..];
    Ok((header, data))
}
