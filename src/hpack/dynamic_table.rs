/// HPACK 动态表（RFC 7541 §2.3.2）
///
/// FIFO 队列：新条目插入头部（索引 0 为最新），超出最大字节数时
/// 从尾部逐出最旧条目
use super::HeaderField;
use crate::error::{Result, TunnelError};
use std::collections::VecDeque;

pub struct DynamicTable {
    entries: VecDeque<HeaderField>,
    /// 当前字节大小
    size: u32,
    /// 最大字节大小
    max_size: u32,
}

impl DynamicTable {
    pub fn new(max_size: u32) -> Self {
        Self {
            entries: VecDeque::with_capacity(32),
            size: 0,
            max_size,
        }
    }

    /// 插入条目；条目本身超过 max_size 时清空整表（RFC 7541 §4.4）
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let field = HeaderField::new(name, value);
        let field_size = field.size();

        if field_size > self.max_size {
            self.evict_all();
            return;
        }

        while self.size + field_size > self.max_size && !self.entries.is_empty() {
            self.evict_oldest();
        }

        self.size += field_size;
        self.entries.push_front(field);
    }

    /// 按索引取条目（0 为最新）
    pub fn get(&self, index: u32) -> Result<&HeaderField> {
        self.entries.get(index as usize).ok_or_else(|| {
            TunnelError::hpack(format!(
                "index {} out of range (table size: {})",
                index,
                self.entries.len()
            ))
        })
    }

    /// 精确匹配（名 + 值）
    pub fn find_exact(&self, name: &str, value: &str) -> Option<u32> {
        self.entries
            .iter()
            .position(|f| f.name == name && f.value == value)
            .map(|i| i as u32)
    }

    /// 名称匹配
    pub fn find_name(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as u32)
    }

    /// 更新最大大小；缩小时逐出超出的旧条目
    pub fn set_max_size(&mut self, max_size: u32) {
        self.max_size = max_size;
        while self.size > self.max_size && !self.entries.is_empty() {
            self.evict_oldest();
        }
    }

    /// 当前字节大小
    pub fn current_size(&self) -> u32 {
        self.size
    }

    /// 条目数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) {
        if let Some(evicted) = self.entries.pop_back() {
            self.size -= evicted.size();
        }
    }

    fn evict_all(&mut self) {
        self.entries.clear();
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let mut dt = DynamicTable::new(4096);
        dt.add("x-first", "1");
        dt.add("x-second", "2");

        // 索引 0 为最新
        assert_eq!(dt.get(0).unwrap().name, "x-second");
        assert_eq!(dt.get(1).unwrap().name, "x-first");
        assert!(dt.get(2).is_err());
    }

    #[test]
    fn test_size_tracking() {
        let mut dt = DynamicTable::new(4096);
        dt.add("a", "b");
        // 1 + 1 + 32
        assert_eq!(dt.current_size(), 34);
        dt.add("xx", "yyyyy");
        assert_eq!(dt.current_size(), 34 + 39);
    }

    #[test]
    fn test_eviction() {
        let mut dt = DynamicTable::new(64);
        dt.add("a", "b"); // 34
        dt.add("xx", "yyyyy"); // 39，两者合计超过 64

        assert_eq!(dt.len(), 1);
        assert_eq!(dt.current_size(), 39);
        assert_eq!(dt.get(0).unwrap().name, "xx");
    }

    #[test]
    fn test_oversize_entry_clears_table() {
        let mut dt = DynamicTable::new(40);
        dt.add("a", "b");
        assert_eq!(dt.len(), 1);

        // 34 字节条目装得下，72 字节条目清空整表
        dt.add("0123456789", "012345678901234567890123456789");
        assert_eq!(dt.len(), 0);
        assert_eq!(dt.current_size(), 0);
    }

    #[test]
    fn test_set_max_size_evicts() {
        let mut dt = DynamicTable::new(4096);
        dt.add("a", "b");
        dt.add("c", "d");
        assert_eq!(dt.len(), 2);

        dt.set_max_size(34);
        assert_eq!(dt.len(), 1);
        // 留下的是较新的条目
        assert_eq!(dt.get(0).unwrap().name, "c");
    }

    #[test]
    fn test_find() {
        let mut dt = DynamicTable::new(4096);
        dt.add("x-a", "1");
        dt.add("x-b", "2");

        assert_eq!(dt.find_exact("x-a", "1"), Some(1));
        assert_eq!(dt.find_exact("x-b", "2"), Some(0));
        assert_eq!(dt.find_exact("x-a", "9"), None);
        assert_eq!(dt.find_name("x-a"), Some(1));
        assert_eq!(dt.find_name("x-z"), None);
    }
}
