/// HPACK 静态表（RFC 7541 Appendix A 子集）
///
/// 进程级只读单例，所有连接共享
use super::HeaderField;
use std::collections::HashMap;
use std::sync::OnceLock;

/// 静态表：预定义且永不变化
pub struct StaticTable {
    entries: Vec<HeaderField>,
    name_map: HashMap<&'static str, Vec<u32>>,
}

static STATIC_TABLE: OnceLock<StaticTable> = OnceLock::new();

/// 获取静态表单例
pub fn static_table() -> &'static StaticTable {
    STATIC_TABLE.get_or_init(StaticTable::new)
}

const STATIC_ENTRIES: &[(&str, &str)] = &[
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

impl StaticTable {
    fn new() -> Self {
        let entries: Vec<HeaderField> = STATIC_ENTRIES
            .iter()
            .map(|(n, v)| HeaderField::new(*n, *v))
            .collect();

        let mut name_map: HashMap<&'static str, Vec<u32>> = HashMap::new();
        for (i, (name, _)) in STATIC_ENTRIES.iter().enumerate() {
            name_map.entry(name).or_default().push(i as u32);
        }

        Self { entries, name_map }
    }

    /// 按索引取条目（0 起）
    pub fn get(&self, index: u32) -> Option<&HeaderField> {
        self.entries.get(index as usize)
    }

    /// 精确匹配（名 + 值），返回 0 起索引
    pub fn find_exact(&self, name: &str, value: &str) -> Option<u32> {
        let indices = self.name_map.get(name)?;
        indices
            .iter()
            .copied()
            .find(|&i| self.entries[i as usize].value == value)
    }

    /// 名称匹配，返回首个 0 起索引
    pub fn find_name(&self, name: &str) -> Option<u32> {
        self.name_map.get(name).and_then(|v| v.first().copied())
    }

    /// 条目数量
    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
