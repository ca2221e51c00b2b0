/// HPACK 解码器
///
/// 与编码器配对使用：同一方向一对表，起始为空且最大大小一致。
/// 越界索引、整数溢出、Huffman 标志均为致命解码错误，调用方
/// 应当断开会话
use super::dynamic_table::DynamicTable;
use super::static_table::static_table;
use super::DEFAULT_DYNAMIC_TABLE_SIZE;
use crate::error::{Result, TunnelError};
use std::sync::Mutex;

struct DecoderState {
    dynamic_table: DynamicTable,
    max_table_size: u32,
}

pub struct Decoder {
    state: Mutex<DecoderState>,
}

/// 输入字节游标
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| TunnelError::hpack("unexpected end of header block"))
    }

    fn read_byte(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(TunnelError::hpack(format!(
                "string length {} exceeds remaining {}",
                n,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

impl Decoder {
    pub fn new(max_table_size: u32) -> Self {
        let max_table_size = if max_table_size == 0 {
            DEFAULT_DYNAMIC_TABLE_SIZE
        } else {
            max_table_size
        };

        Self {
            state: Mutex::new(DecoderState {
                dynamic_table: DynamicTable::new(max_table_size),
                max_table_size,
            }),
        }
    }

    /// 解码 HPACK 头部块
    pub fn decode(&self, data: &[u8]) -> Result<Vec<(String, String)>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TunnelError::hpack("decoder lock poisoned"))?;

        let mut headers = Vec::new();
        let mut cur = Cursor::new(data);

        while cur.remaining() > 0 {
            let b = cur.peek()?;

            let (name, value) = if b & 0x80 != 0 {
                // 完全索引（1xxxxxxx）
                state.decode_indexed(&mut cur)?
            } else if b & 0x40 != 0 {
                // 增量索引字面量（01xxxxxx）
                state.decode_literal(&mut cur, 6, true)?
            } else {
                // 无索引字面量（0000xxxx）
                state.decode_literal(&mut cur, 4, false)?
            };

            headers.push((name, value));
        }

        Ok(headers)
    }

    /// 更新动态表大小
    pub fn set_max_table_size(&self, size: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.max_table_size = size;
            state.dynamic_table.set_max_size(size);
        }
    }

    /// 清空动态表
    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            let max = state.max_table_size;
            state.dynamic_table = DynamicTable::new(max);
        }
    }

    /// 动态表当前字节大小（测试用）
    pub fn dynamic_table_size(&self) -> u32 {
        self.state
            .lock()
            .map(|s| s.dynamic_table.current_size())
            .unwrap_or(0)
    }
}

impl DecoderState {
    fn decode_indexed(&mut self, cur: &mut Cursor<'_>) -> Result<(String, String)> {
        let index = read_integer(cur, 7)?;
        if index == 0 {
            return Err(TunnelError::hpack("invalid index: 0"));
        }
        let (name, value) = self.lookup(index)?;
        Ok((name, value))
    }

    fn decode_literal(
        &mut self,
        cur: &mut Cursor<'_>,
        prefix_bits: u8,
        index_into_table: bool,
    ) -> Result<(String, String)> {
        let name_index = read_integer(cur, prefix_bits)?;

        let name = if name_index == 0 {
            read_string(cur)?
        } else {
            self.lookup(name_index)?.0
        };

        let value = read_string(cur)?;

        if index_into_table {
            self.dynamic_table.add(name.clone(), value.clone());
        }

        Ok((name, value))
    }

    /// 按线路索引（1 起）查静态表或动态表
    fn lookup(&self, index: u32) -> Result<(String, String)> {
        let st = static_table();
        let static_len = st.len();

        if index <= static_len {
            let field = st
                .get(index - 1)
                .ok_or_else(|| TunnelError::hpack(format!("static index {} out of range", index)))?;
            return Ok((field.name.clone(), field.value.clone()));
        }

        let dyn_index = index - static_len - 1;
        let field = self.dynamic_table.get(dyn_index)?;
        Ok((field.name.clone(), field.value.clone()))
    }
}

/// HPACK 整数前缀解码；连续字节超过 28 位为溢出错误
fn read_integer(cur: &mut Cursor<'_>, prefix_bits: u8) -> Result<u32> {
    if prefix_bits < 1 || prefix_bits > 8 {
        return Err(TunnelError::hpack(format!(
            "invalid prefix bits: {}",
            prefix_bits
        )));
    }

    let b = cur.read_byte()?;
    let max_prefix: u32 = (1u32 << prefix_bits) - 1;
    let value = u32::from(b) & max_prefix;
    if value < max_prefix {
        return Ok(value);
    }

    let mut value = value as u64;
    let mut m: u32 = 0;
    loop {
        let b = cur.read_byte()?;
        value += u64::from(b & 0x7F) << m;
        m += 7;

        if b & 0x80 == 0 {
            break;
        }
        if m > 28 {
            return Err(TunnelError::hpack("integer overflow"));
        }
    }

    u32::try_from(value).map_err(|_| TunnelError::hpack("integer overflow"))
}

/// HPACK 字符串解码；Huffman 标志置位为致命错误
fn read_string(cur: &mut Cursor<'_>) -> Result<String> {
    let huffman = cur.peek()? & 0x80 != 0;
    if huffman {
        return Err(TunnelError::hpack("huffman not implemented"));
    }

    let length = read_integer(cur, 7)? as usize;
    if length == 0 {
        return Ok(String::new());
    }

    let bytes = cur.read_bytes(length)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| TunnelError::hpack("header string is not valid utf-8"))
}

#[cfg(test)]
mod tests {
    use super::super::encoder::Encoder;
    use super::*;

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_read_integer_prefix() {
        let mut cur = Cursor::new(&[0x0A]);
        assert_eq!(read_integer(&mut cur, 5).unwrap(), 10);
    }

    #[test]
    fn test_read_integer_multibyte() {
        let mut cur = Cursor::new(&[0x1F, 0x9A, 0x0A]);
        assert_eq!(read_integer(&mut cur, 5).unwrap(), 1337);
    }

    #[test]
    fn test_read_integer_overflow() {
        // 过长的连续字节触发溢出
        let data = [0xFF, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        let mut cur = Cursor::new(&data);
        assert!(read_integer(&mut cur, 7).is_err());
    }

    #[test]
    fn test_huffman_rejected() {
        // 高位置位表示 Huffman 编码字符串
        let dec = Decoder::new(0);
        let data = [0x40, 0x83, b'a', b'b', b'c'];
        let err = dec.decode(&data).unwrap_err();
        assert!(err.to_string().contains("huffman"));
    }

    #[test]
    fn test_index_zero_rejected() {
        let dec = Decoder::new(0);
        assert!(dec.decode(&[0x80]).is_err());
    }

    #[test]
    fn test_index_out_of_range() {
        let dec = Decoder::new(0);
        // 索引 100 超出静态表且动态表为空
        let mut data = Vec::new();
        super::super::encoder::write_integer(&mut data, 100, 7, 0x80).unwrap();
        assert!(dec.decode(&data).is_err());
    }

    #[test]
    fn test_roundtrip_simple() {
        let enc = Encoder::new(0);
        let dec = Decoder::new(0);

        let headers = pairs(&[
            (":method", "GET"),
            (":path", "/"),
            ("host", "example.com"),
            ("x-custom", "foo"),
        ]);

        let encoded = enc.encode(&headers).unwrap();
        let decoded = dec.decode(&encoded).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn test_roundtrip_stateful_sequence() {
        let enc = Encoder::new(0);
        let dec = Decoder::new(0);

        // 多轮编码后两侧动态表保持同步
        let rounds = vec![
            pairs(&[("x-request-id", "aaa"), ("host", "example.com")]),
            pairs(&[("x-request-id", "aaa"), ("host", "example.com")]),
            pairs(&[("x-request-id", "bbb"), ("cookie", "session=1")]),
            pairs(&[("x-request-id", "aaa"), ("cookie", "session=1")]),
        ];

        for headers in rounds {
            let encoded = enc.encode(&headers).unwrap();
            let decoded = dec.decode(&encoded).unwrap();
            assert_eq!(decoded, headers);
            assert_eq!(enc.dynamic_table_size(), dec.dynamic_table_size());
        }
    }

    #[test]
    fn test_decoder_table_size_after_unknown_header() {
        let enc = Encoder::new(0);
        let dec = Decoder::new(0);

        let headers = pairs(&[("x-custom", "foo")]);
        let encoded = enc.encode(&headers).unwrap();
        let decoded = dec.decode(&encoded).unwrap();

        assert_eq!(decoded, headers);
        assert_eq!(enc.dynamic_table_size(), 43);
        assert_eq!(dec.dynamic_table_size(), 43);
    }

    #[test]
    fn test_empty_block() {
        let dec = Decoder::new(0);
        assert!(dec.decode(&[]).unwrap().is_empty());
    }
}
