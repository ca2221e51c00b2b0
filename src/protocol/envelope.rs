/// 控制与 HTTP 信封
///
/// 编码始终输出 msgpack；解码按首字节自动识别：`{`(0x7B) 视为
/// 历史版本的 JSON，其余视为 msgpack
use crate::error::{Result, TunnelError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 隧道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    #[default]
    Http,
    Https,
    Tcp,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Http => "http",
            TunnelType::Https => "https",
            TunnelType::Tcp => "tcp",
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, TunnelType::Http | TunnelType::Https)
    }
}

impl std::fmt::Display for TunnelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 注册请求（会话建立后的第一帧）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// 静态认证令牌
    pub token: String,
    /// 隧道类型
    #[serde(default)]
    pub tunnel_type: TunnelType,
    /// 期望的子域名（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    /// 加入既有隧道组时携带（附加数据连接）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
}

/// 注册成功响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// 分配的子域名
    pub subdomain: String,
    /// 对外访问地址
    pub url: String,
    /// 隧道组标识（附加连接凭此加入）
    pub tunnel_id: String,
    /// TCP 隧道分配的服务器端口
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

/// Error 帧信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

/// 完整 HTTP 请求（非流式兼容路径）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// 流式 HTTP 请求头（不含包体）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestHead {
    pub method: String,
    pub url: String,
    /// HPACK 编码的头部块
    #[serde(with = "serde_bytes")]
    pub hpack_headers: Vec<u8>,
    /// -1 表示长度未知 / 分块
    pub content_length: i64,
}

/// 完整 HTTP 响应（非流式兼容路径）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status: String,
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// 流式 HTTP 响应头（不含包体）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponseHead {
    pub status_code: u16,
    pub status: String,
    /// HPACK 编码的头部块
    #[serde(with = "serde_bytes")]
    pub hpack_headers: Vec<u8>,
    /// -1 表示长度未知 / 分块
    pub content_length: i64,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| TunnelError::protocol(format!("msgpack encode: {}", e)))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    if data.is_empty() {
        return Err(TunnelError::protocol("empty envelope"));
    }

    if data[0] == b'{' {
        serde_json::from_slice(data)
            .map_err(|e| TunnelError::protocol(format!("json decode: {}", e)))
    } else {
        rmp_serde::from_slice(data)
            .map_err(|e| TunnelError::protocol(format!("msgpack decode: {}", e)))
    }
}

pub fn encode_register_request(req: &RegisterRequest) -> Result<Vec<u8>> {
    encode(req)
}

pub fn decode_register_request(data: &[u8]) -> Result<RegisterRequest> {
    decode(data)
}

pub fn encode_register_response(resp: &RegisterResponse) -> Result<Vec<u8>> {
    encode(resp)
}

pub fn decode_register_response(data: &[u8]) -> Result<RegisterResponse> {
    decode(data)
}

pub fn encode_error(code: &str, message: &str) -> Result<Vec<u8>> {
    encode(&ErrorEnvelope {
        code: code.to_string(),
        message: message.to_string(),
    })
}

pub fn decode_error(data: &[u8]) -> Result<ErrorEnvelope> {
    decode(data)
}

pub fn encode_http_request(req: &HttpRequest) -> Result<Vec<u8>> {
    encode(req)
}

pub fn decode_http_request(data: &[u8]) -> Result<HttpRequest> {
    decode(data)
}

pub fn encode_http_response(resp: &HttpResponse) -> Result<Vec<u8>> {
    encode(resp)
}

pub fn decode_http_response(data: &[u8]) -> Result<HttpResponse> {
    decode(data)
}

pub fn encode_request_head(head: &HttpRequestHead) -> Result<Vec<u8>> {
    encode(head)
}

pub fn decode_request_head(data: &[u8]) -> Result<HttpRequestHead> {
    decode(data)
}

pub fn encode_response_head(head: &HttpResponseHead) -> Result<Vec<u8>> {
    encode(head)
}

pub fn decode_response_head(data: &[u8]) -> Result<HttpResponseHead> {
    decode(data)
}
