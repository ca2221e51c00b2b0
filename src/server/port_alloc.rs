/// TCP 隧道端口分配器
///
/// 在配置范围内以位图记录占用，游标线性扫描下一个空闲端口；
/// 范围耗尽时返回 None，注册方以 PORT_EXHAUSTED 拒绝
use std::sync::Mutex;

pub struct PortAllocator {
    state: Mutex<AllocState>,
    min: u16,
    max: u16,
}

struct AllocState {
    bitmap: Vec<u64>,
    cursor: usize,
    in_use: usize,
}

impl PortAllocator {
    /// 创建覆盖 [min, max] 的分配器
    pub fn new(min: u16, max: u16) -> Self {
        assert!(min < max, "invalid port range");
        let span = (max - min) as usize + 1;
        Self {
            state: Mutex::new(AllocState {
                bitmap: vec![0u64; span.div_ceil(64)],
                cursor: 0,
                in_use: 0,
            }),
            min,
            max,
        }
    }

    fn span(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    /// 分配一个空闲端口；从上次分配位置开始扫描
    pub fn allocate(&self) -> Option<u16> {
        let span = self.span();
        let mut state = self.state.lock().expect("port allocator lock poisoned");

        if state.in_use >= span {
            return None;
        }

        for step in 0..span {
            let idx = (state.cursor + step) % span;
            let word = idx / 64;
            let bit = 1u64 << (idx % 64);
            if state.bitmap[word] & bit == 0 {
                state.bitmap[word] |= bit;
                state.in_use += 1;
                state.cursor = (idx + 1) % span;
                return Some(self.min + idx as u16);
            }
        }

        None
    }

    /// 归还端口；范围外或未分配的端口被忽略
    pub fn release(&self, port: u16) {
        if port < self.min || port > self.max {
            return;
        }
        let idx = (port - self.min) as usize;
        let word = idx / 64;
        let bit = 1u64 << (idx % 64);

        let mut state = self.state.lock().expect("port allocator lock poisoned");
        if state.bitmap[word] & bit != 0 {
            state.bitmap[word] &= !bit;
            state.in_use -= 1;
        }
    }

    /// 当前占用数
    pub fn in_use(&self) -> usize {
        self.state.lock().map(|s| s.in_use).unwrap_or(0)
    }
}
