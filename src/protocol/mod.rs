/// 隧道线路协议
///
/// 会话建立后，单条 TLS 连接上只流动帧：定长帧头 + 负载。
/// Data 帧负载内嵌二进制子头标识流、请求与类型；HTTP 信封使用
/// msgpack 优先、JSON 兜底的编码
mod data_header;
mod envelope;
mod frame;
mod writer;

pub use data_header::{
    decode_data_payload, encode_data_payload, encode_data_payload_pooled, DataHeader, DataType,
    DATA_HEADER_MIN_SIZE,
};
pub use envelope::{
    decode_error, decode_http_request, decode_http_response, decode_register_request,
    decode_register_response, decode_request_head, decode_response_head, encode_error,
    encode_http_request, encode_http_response, encode_register_request, encode_register_response,
    encode_request_head, encode_response_head, ErrorEnvelope, HttpRequest, HttpRequestHead,
    HttpResponse, HttpResponseHead, RegisterRequest, RegisterResponse, TunnelType,
};
pub use frame::{read_frame, write_frame, Frame, FrameKind, FramePayload, FRAME_HEADER_SIZE};
pub use writer::{BacklogStamp, FrameWriter, FrameWriterConfig};
