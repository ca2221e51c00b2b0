/// 缓冲池与工作池
///
/// 按尺寸分级复用负载缓冲，减少数据面上的频繁分配；
/// 工作池限制边缘监听的并发处理任务数
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// 小缓冲（控制帧、短消息）
pub const SIZE_SMALL: usize = 2 * 1024;
/// 中缓冲（TCP 读循环默认）
pub const SIZE_MEDIUM: usize = 16 * 1024;
/// 大缓冲（HTTP 响应体分块上限）
pub const SIZE_LARGE: usize = 256 * 1024;

/// 负载长度低于该值时直接堆分配，不走缓冲池
pub const POOL_THRESHOLD: usize = 4 * 1024;

/// 每个尺寸级保留的空闲缓冲上限
const MAX_IDLE_PER_CLASS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    fn capacity(self) -> usize {
        match self {
            SizeClass::Small => SIZE_SMALL,
            SizeClass::Medium => SIZE_MEDIUM,
            SizeClass::Large => SIZE_LARGE,
        }
    }

    /// 能容纳 n 字节的最小级别
    fn fitting(n: usize) -> Option<SizeClass> {
        if n <= SIZE_SMALL {
            Some(SizeClass::Small)
        } else if n <= SIZE_MEDIUM {
            Some(SizeClass::Medium)
        } else if n <= SIZE_LARGE {
            Some(SizeClass::Large)
        } else {
            None
        }
    }
}

struct PoolInner {
    small: Mutex<Vec<Vec<u8>>>,
    medium: Mutex<Vec<Vec<u8>>>,
    large: Mutex<Vec<Vec<u8>>>,
}

impl PoolInner {
    fn class_list(&self, class: SizeClass) -> &Mutex<Vec<Vec<u8>>> {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Medium => &self.medium,
            SizeClass::Large => &self.large,
        }
    }
}

/// 按尺寸分级的缓冲池
///
/// `get(n)` 从能容纳 n 的最小级别取出一块缓冲；n 超过最大级别时
/// 返回普通堆分配（不归池）。归还由 `PooledBuf` 的 Drop 完成
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                small: Mutex::new(Vec::new()),
                medium: Mutex::new(Vec::new()),
                large: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 取出一块容量至少为 n 的缓冲（长度为 0）
    pub fn get(&self, n: usize) -> PooledBuf {
        match SizeClass::fitting(n) {
            Some(class) => {
                let buf = {
                    let mut list = self
                        .inner
                        .class_list(class)
                        .lock()
                        .expect("buffer pool lock poisoned");
                    list.pop()
                };
                let buf = buf.unwrap_or_else(|| Vec::with_capacity(class.capacity()));
                PooledBuf {
                    buf,
                    class: Some(class),
                    pool: Some(Arc::clone(&self.inner)),
                }
            }
            None => PooledBuf {
                buf: Vec::with_capacity(n),
                class: None,
                pool: None,
            },
        }
    }

    /// 当前各级空闲缓冲数（测试用）
    pub fn idle_counts(&self) -> (usize, usize, usize) {
        let s = self.inner.small.lock().unwrap().len();
        let m = self.inner.medium.lock().unwrap().len();
        let l = self.inner.large.lock().unwrap().len();
        (s, m, l)
    }
}

/// 池持有型缓冲：独占所有权，Drop 时归还所属级别
///
/// 不归池的缓冲（超过最大级别）Drop 时直接释放
pub struct PooledBuf {
    buf: Vec<u8>,
    class: Option<SizeClass>,
    pool: Option<Arc<PoolInner>>,
}

impl PooledBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn push(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// 调整长度（读缓冲场景：先填满再截断到实际读取量）
    pub fn resize(&mut self, new_len: usize, value: u8) {
        self.buf.resize(new_len, value);
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let (Some(class), Some(pool)) = (self.class, self.pool.take()) {
            let mut buf = std::mem::take(&mut self.buf);
            buf.clear();
            let mut list = match pool.class_list(class).lock() {
                Ok(list) => list,
                Err(_) => return,
            };
            if list.len() < MAX_IDLE_PER_CLASS {
                list.push(buf);
            }
        }
    }
}

/// 工作池任务
pub type Job = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>>;

/// 有界工作池
///
/// 固定数量的 worker 消费有界队列；队列满时 `try_submit` 返回 false，
/// 调用方回退为直接 spawn，保证接受循环永不阻塞
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            });
        }

        Self {
            tx,
            workers: workers.max(1),
        }
    }

    /// 按 CPU 数推导规模：workers = cpus * 5, queue = workers * 20
    pub fn with_default_sizing() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = cpus * 5;
        let queue_size = workers * 20;
        debug!(cpus, workers, queue_size, "Worker pool configured");
        Self::new(workers, queue_size)
    }

    /// 尝试提交任务；队列已满或池已关闭时原样退回，调用方回退为直接 spawn
    pub fn try_submit(&self, job: Job) -> Result<(), Job> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => job,
            mpsc::error::TrySendError::Closed(job) => job,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_size_class_fitting() {
        assert_eq!(SizeClass::fitting(0), Some(SizeClass::Small));
        assert_eq!(SizeClass::fitting(SIZE_SMALL), Some(SizeClass::Small));
        assert_eq!(SizeClass::fitting(SIZE_SMALL + 1), Some(SizeClass::Medium));
        assert_eq!(SizeClass::fitting(SIZE_MEDIUM), Some(SizeClass::Medium));
        assert_eq!(SizeClass::fitting(SIZE_LARGE), Some(SizeClass::Large));
        assert_eq!(SizeClass::fitting(SIZE_LARGE + 1), None);
    }

    #[test]
    fn test_pool_reuse() {
        let pool = BufferPool::new();

        {
            let mut buf = pool.get(100);
            buf.extend_from_slice(b"hello");
            assert_eq!(buf.as_slice(), b"hello");
        }

        // 归还后再次取出应命中空闲列表
        assert_eq!(pool.idle_counts().0, 1);
        let buf = pool.get(100);
        assert!(buf.is_empty());
        assert!(buf.buf.capacity() >= SIZE_SMALL);
        assert_eq!(pool.idle_counts().0, 0);
    }

    #[test]
    fn test_oversize_not_pooled() {
        let pool = BufferPool::new();
        {
            let _buf = pool.get(SIZE_LARGE + 1);
        }
        assert_eq!(pool.idle_counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_worker_pool_executes() {
        let pool = WorkerPool::new(2, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            let job: Job = Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            assert!(pool.try_submit(job).is_ok());
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_worker_pool_returns_job_when_full() {
        let pool = WorkerPool::new(1, 1);

        // 占住唯一 worker
        let blocker: Job = Box::pin(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        assert!(pool.try_submit(blocker).is_ok());

        // 填满队列后任务被退回
        let mut rejected = 0;
        for _ in 0..8 {
            let job: Job = Box::pin(async {});
            if pool.try_submit(job).is_err() {
                rejected += 1;
            }
        }
        assert!(rejected > 0, "queue should reject once full");
    }
}
