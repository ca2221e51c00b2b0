/// HPACK 编码器
///
/// 每条连接的每个方向必须持有独立实例；实例内部用互斥锁串行化，
/// 因此同方向的并发调用是安全的
use super::dynamic_table::DynamicTable;
use super::static_table::static_table;
use super::DEFAULT_DYNAMIC_TABLE_SIZE;
use crate::error::{Result, TunnelError};
use std::sync::Mutex;

/// 完全索引表示（1xxxxxxx）
const INDEXED_HEADER_FIELD: u8 = 0x80;

/// 增量索引字面量表示（01xxxxxx）
const LITERAL_WITH_INDEXING: u8 = 0x40;

struct EncoderState {
    dynamic_table: DynamicTable,
    max_table_size: u32,
}

pub struct Encoder {
    state: Mutex<EncoderState>,
}

impl Encoder {
    pub fn new(max_table_size: u32) -> Self {
        let max_table_size = if max_table_size == 0 {
            DEFAULT_DYNAMIC_TABLE_SIZE
        } else {
            max_table_size
        };

        Self {
            state: Mutex::new(EncoderState {
                dynamic_table: DynamicTable::new(max_table_size),
                max_table_size,
            }),
        }
    }

    /// 将头部列表编码为 HPACK 二进制块
    pub fn encode(&self, headers: &[(String, String)]) -> Result<Vec<u8>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TunnelError::hpack("encoder lock poisoned"))?;

        let mut buf = Vec::with_capacity(headers.len() * 32);
        for (name, value) in headers {
            state
                .encode_header_field(&mut buf, name, value)
                .map_err(|e| TunnelError::hpack(format!("encode header {}: {}", name, e)))?;
        }
        Ok(buf)
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

impl EncoderState {
    fn encode_header_field(&mut self, buf: &mut Vec<u8>, name: &str, value: &str) -> Result<()> {
        // HTTP/2 要求头部名称小写（RFC 7540 §8.1.2），统一转换后查表与存储
        let name_lower = name.to_ascii_lowercase();
        let st = static_table();

        // 查找顺序：静态精确 → 静态名称 → 动态精确 → 动态名称 → 新名字面量
        if let Some(index) = st.find_exact(&name_lower, value) {
            return write_integer(buf, index + 1, 7, INDEXED_HEADER_FIELD);
        }

        if let Some(index) = st.find_name(&name_lower) {
            write_integer(buf, index + 1, 6, LITERAL_WITH_INDEXING)?;
            write_string(buf, value)?;
            self.dynamic_table.add(name_lower, value);
            return Ok(());
        }

        if let Some(index) = self.dynamic_table.find_exact(&name_lower, value) {
            // 动态表索引从静态表之后开始
            let dyn_index = st.len() + index + 1;
            return write_integer(buf, dyn_index, 7, INDEXED_HEADER_FIELD);
        }

        if let Some(index) = self.dynamic_table.find_name(&name_lower) {
            let dyn_index = st.len() + index + 1;
            write_integer(buf, dyn_index, 6, LITERAL_WITH_INDEXING)?;
            write_string(buf, value)?;
            self.dynamic_table.add(name_lower, value);
            return Ok(());
        }

        // 名称索引 0：名与值均为字面量
        buf.push(LITERAL_WITH_INDEXING);
        write_string(buf, &name_lower)?;
        write_string(buf, value)?;
        self.dynamic_table.add(name_lower, value);

        Ok(())
    }
}

/// HPACK 整数前缀编码（RFC 7541 §5.1）
pub(crate) fn write_integer(
    buf: &mut Vec<u8>,
    value: u32,
    prefix_bits: u8,
    prefix: u8,
) -> Result<()> {
    if prefix_bits < 1 || prefix_bits > 8 {
        return Err(TunnelError::hpack(format!(
            "invalid prefix bits: {}",
            prefix_bits
        )));
    }

    let max_prefix: u32 = (1u32 << prefix_bits) - 1;

    if value < max_prefix {
        buf.push(prefix | value as u8);
        return Ok(());
    }

    buf.push(prefix | max_prefix as u8);
    let mut value = value - max_prefix;
    while value >= 128 {
        buf.push((value % 128) as u8 | 0x80);
        value /= 128;
    }
    buf.push(value as u8);

    Ok(())
}

/// HPACK 字符串编码（RFC 7541 §5.2）；本实现不使用 Huffman（H=0）
pub(crate) fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    write_integer(buf, s.len() as u32, 7, 0x00)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}
