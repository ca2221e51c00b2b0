/// 批量帧写入器
///
/// 多个生产者向两条有界队列投递帧，唯一的写循环任务串行写出：
/// 控制队列严格优先，数据队列按批聚合（上限 256 帧或 2ms），
/// 低并发时自适应立即刷出。写错误只锁存一次并异步回调一次，
/// 之后的入队直接返回该错误，排队中的帧被排空释放
use super::frame::{Frame, FRAME_HEADER_SIZE};
use crate::error::{Result, TunnelError};
use crate::io_util::write_vectored_all;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 写入器配置
#[derive(Debug, Clone)]
pub struct FrameWriterConfig {
    /// 单批最大帧数
    pub max_batch: usize,
    /// 批聚合最长等待
    pub max_batch_wait: Duration,
    /// 数据队列容量
    pub queue_size: usize,
    /// 数据帧入队等待上限（队列满时）
    pub data_enqueue_timeout: Duration,
    /// 控制帧入队等待上限
    pub control_enqueue_timeout: Duration,
}

impl Default for FrameWriterConfig {
    fn default() -> Self {
        Self {
            max_batch: 256,
            max_batch_wait: Duration::from_millis(2),
            queue_size: 4096,
            data_enqueue_timeout: Duration::from_secs(30),
            control_enqueue_timeout: Duration::from_millis(50),
        }
    }
}

/// 积压计数器（帧数 + 字节数）
pub(crate) struct BacklogCounters {
    frames: AtomicI64,
    bytes: AtomicI64,
}

/// 帧入队时打上的一次性积压戳
///
/// 帧被写出、丢弃或在任何失败路径上释放时，Drop 恰好回退一次计数
pub struct BacklogStamp {
    size: i64,
    counters: Arc<BacklogCounters>,
}

impl Drop for BacklogStamp {
    fn drop(&mut self) {
        self.counters.frames.fetch_sub(1, Ordering::AcqRel);
        self.counters.bytes.fetch_sub(self.size, Ordering::AcqRel);
    }
}

type PreWriteHook = Box<dyn Fn(&Frame) + Send + Sync>;
type WriteErrorHandler = Box<dyn Fn(String) + Send + Sync>;
type HeartbeatCallback = Arc<dyn Fn() -> Option<Frame> + Send + Sync>;

#[derive(Default)]
struct HeartbeatState {
    enabled: bool,
    interval: Option<Duration>,
    callback: Option<HeartbeatCallback>,
}

struct Shared {
    closed: AtomicBool,
    error_latched: AtomicBool,
    write_err: Mutex<Option<String>>,
    counters: Arc<BacklogCounters>,
    done: CancellationToken,
    flush_notify: Notify,
    pre_write_hook: Mutex<Option<PreWriteHook>>,
    on_write_error: Mutex<Option<WriteErrorHandler>>,
    heartbeat: Mutex<HeartbeatState>,
    adaptive_flush: AtomicBool,
    low_concurrency_threshold: AtomicUsize,
}

impl Shared {
    /// 锁存首个写错误：记录、标记关闭、异步回调一次
    fn latch_error(&self, err: io::Error) {
        if self.error_latched.swap(true, Ordering::AcqRel) {
            return;
        }
        let msg = err.to_string();
        if let Ok(mut slot) = self.write_err.lock() {
            *slot = Some(msg.clone());
        }
        self.closed.store(true, Ordering::Release);

        let handler = self
            .on_write_error
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handler) = handler {
            tokio::spawn(async move {
                handler(msg);
            });
        }
    }

    fn closed_error(&self) -> TunnelError {
        if let Ok(slot) = self.write_err.lock() {
            if let Some(msg) = slot.as_ref() {
                return TunnelError::Io(io::Error::other(msg.clone()));
            }
        }
        TunnelError::WriterClosed
    }
}

/// 帧写入器句柄；跨任务克隆共享
pub struct FrameWriter {
    data_tx: mpsc::Sender<Frame>,
    control_tx: mpsc::Sender<Frame>,
    heartbeat_signal: mpsc::Sender<()>,
    shared: Arc<Shared>,
    config: FrameWriterConfig,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FrameWriter {
    /// 默认配置并启用自适应刷出（阈值 16）
    pub fn new<W>(conn: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Self::with_config(conn, FrameWriterConfig::default());
        writer.enable_adaptive_flush(16);
        writer
    }

    pub fn with_config<W>(conn: W, config: FrameWriterConfig) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let control_size = config.queue_size.min(256).max(1);
        let (data_tx, data_rx) = mpsc::channel(config.queue_size.max(1));
        let (control_tx, control_rx) = mpsc::channel(control_size);
        // 单槽信号通道：心跳配置变化合并通知写循环
        let (heartbeat_signal, heartbeat_signal_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            error_latched: AtomicBool::new(false),
            write_err: Mutex::new(None),
            counters: Arc::new(BacklogCounters {
                frames: AtomicI64::new(0),
                bytes: AtomicI64::new(0),
            }),
            done: CancellationToken::new(),
            flush_notify: Notify::new(),
            pre_write_hook: Mutex::new(None),
            on_write_error: Mutex::new(None),
            heartbeat: Mutex::new(HeartbeatState::default()),
            adaptive_flush: AtomicBool::new(false),
            low_concurrency_threshold: AtomicUsize::new(0),
        });

        let task = tokio::spawn(write_loop(
            conn,
            data_rx,
            control_rx,
            heartbeat_signal_rx,
            Arc::clone(&shared),
            config.clone(),
        ));

        Arc::new(Self {
            data_tx,
            control_tx,
            heartbeat_signal,
            shared,
            config,
            task: Mutex::new(Some(task)),
        })
    }

    /// 入队数据帧（无取消通道，队列满时最长等待 30 秒）
    pub async fn write_frame(&self, frame: Frame) -> Result<()> {
        self.enqueue(frame, None, false).await
    }

    /// 入队数据帧，携带取消令牌；令牌取消时立即放弃等待
    pub async fn write_frame_with_cancel(
        &self,
        frame: Frame,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.enqueue(frame, Some(cancel), false).await
    }

    /// 入队控制帧（心跳、关闭、错误），优先于数据帧写出
    pub async fn write_control(&self, frame: Frame) -> Result<()> {
        self.enqueue(frame, None, true).await
    }

    async fn enqueue(
        &self,
        mut frame: Frame,
        cancel: Option<&CancellationToken>,
        control: bool,
    ) -> Result<()> {
        // 快速失败
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(self.shared.closed_error());
        }

        // 登记积压并打戳；之后任何路径释放帧都会恰好回退一次
        let size = (frame.payload().len() + FRAME_HEADER_SIZE) as i64;
        self.shared.counters.frames.fetch_add(1, Ordering::AcqRel);
        self.shared.counters.bytes.fetch_add(size, Ordering::AcqRel);
        frame.backlog = Some(BacklogStamp {
            size,
            counters: Arc::clone(&self.shared.counters),
        });

        let tx = if control {
            &self.control_tx
        } else {
            &self.data_tx
        };

        // 先尝试非阻塞投递
        let frame = match tx.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_frame)) => {
                return Err(self.shared.closed_error());
            }
            Err(mpsc::error::TrySendError::Full(frame)) => frame,
        };

        // 队列已满：带取消等待，或带超时等待
        if let Some(cancel) = cancel {
            tokio::select! {
                res = tx.send(frame) => match res {
                    Ok(()) => Ok(()),
                    Err(_) => Err(self.shared.closed_error()),
                },
                _ = self.shared.done.cancelled() => Err(self.shared.closed_error()),
                _ = cancel.cancelled() => Err(TunnelError::WriteCancelled),
            }
        } else {
            let timeout = if control {
                self.config.control_enqueue_timeout
            } else {
                self.config.data_enqueue_timeout
            };
            tokio::select! {
                res = tokio::time::timeout(timeout, tx.send(frame)) => match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(self.shared.closed_error()),
                    Err(_) => Err(TunnelError::QueueFullTimeout),
                },
                _ = self.shared.done.cancelled() => Err(self.shared.closed_error()),
            }
        }
    }

    /// 请求写循环立即刷出当前批；幂等且可并发调用
    pub fn flush(&self) {
        self.shared.flush_notify.notify_one();
    }

    /// 启用心跳：按 interval 周期调用 callback，产出的帧按控制优先级写出
    pub fn enable_heartbeat<F>(&self, interval: Duration, callback: F)
    where
        F: Fn() -> Option<Frame> + Send + Sync + 'static,
    {
        if let Ok(mut hb) = self.shared.heartbeat.lock() {
            hb.enabled = true;
            hb.interval = Some(interval);
            hb.callback = Some(Arc::new(callback));
        }
        let _ = self.heartbeat_signal.try_send(());
    }

    /// 停止心跳
    pub fn disable_heartbeat(&self) {
        if let Ok(mut hb) = self.shared.heartbeat.lock() {
            hb.enabled = false;
        }
        let _ = self.heartbeat_signal.try_send(());
    }

    /// 注册写错误回调；锁存首个错误后异步调用一次
    pub fn set_write_error_handler<F>(&self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.shared.on_write_error.lock() {
            *slot = Some(Box::new(handler));
        }
    }

    /// 注册帧写出前回调（限速器 / 追踪用），不得长时间阻塞
    pub fn set_pre_write_hook<F>(&self, hook: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.shared.pre_write_hook.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// 启用自适应刷出：数据队列深度不超过阈值时逐帧立即刷出
    pub fn enable_adaptive_flush(&self, low_concurrency_threshold: usize) {
        self.shared
            .low_concurrency_threshold
            .store(low_concurrency_threshold, Ordering::Release);
        self.shared.adaptive_flush.store(true, Ordering::Release);
    }

    pub fn disable_adaptive_flush(&self) {
        self.shared.adaptive_flush.store(false, Ordering::Release);
    }

    /// 当前排队帧数（数据 + 控制）
    pub fn queued_frames(&self) -> i64 {
        self.shared.counters.frames.load(Ordering::Acquire)
    }

    /// 当前排队字节数（近似值，含帧头）
    pub fn queued_bytes(&self) -> i64 {
        self.shared.counters.bytes.load(Ordering::Acquire)
    }

    /// 是否已关闭（主动关闭或写错误）
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// 关闭写入器：排空并释放所有排队帧，等待写循环退出
    ///
    /// 幂等；返回后积压计数回到零
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.done.cancel();

        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn write_loop<W>(
    mut conn: W,
    mut data_rx: mpsc::Receiver<Frame>,
    mut control_rx: mpsc::Receiver<Frame>,
    mut heartbeat_signal: mpsc::Receiver<()>,
    shared: Arc<Shared>,
    config: FrameWriterConfig,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut batch: Vec<Frame> = Vec::with_capacity(config.max_batch);
    let mut batch_ticker = tokio::time::interval(config.max_batch_wait);
    batch_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut heartbeat = rebuild_heartbeat(&shared);

    loop {
        // 每轮先清空控制队列，保证控制帧越过已排队的数据帧
        while let Ok(frame) = control_rx.try_recv() {
            flush_frame(&mut conn, frame, &shared).await;
        }

        let heartbeat_active = heartbeat.is_some();

        tokio::select! {
            biased;

            maybe = control_rx.recv() => match maybe {
                Some(frame) => flush_frame(&mut conn, frame, &shared).await,
                None => break,
            },

            _ = shared.done.cancelled() => break,

            maybe = data_rx.recv() => match maybe {
                Some(frame) => {
                    batch.push(frame);

                    let adaptive = shared.adaptive_flush.load(Ordering::Acquire)
                        && data_rx.len()
                            <= shared.low_concurrency_threshold.load(Ordering::Acquire);
                    if batch.len() >= config.max_batch || adaptive {
                        flush_batch(&mut conn, &mut batch, &shared).await;
                    }
                }
                None => break,
            },

            _ = batch_ticker.tick() => {
                if !batch.is_empty() {
                    flush_batch(&mut conn, &mut batch, &shared).await;
                }
            }

            _ = tick_heartbeat(&mut heartbeat), if heartbeat_active => {
                let callback = shared
                    .heartbeat
                    .lock()
                    .ok()
                    .and_then(|hb| hb.callback.clone());
                if let Some(callback) = callback {
                    if let Some(frame) = callback() {
                        flush_frame(&mut conn, frame, &shared).await;
                    }
                }
            }

            _ = heartbeat_signal.recv() => {
                heartbeat = rebuild_heartbeat(&shared);
            }

            _ = shared.flush_notify.notified() => {
                if !batch.is_empty() {
                    flush_batch(&mut conn, &mut batch, &shared).await;
                }
            }
        }
    }

    // 关闭路径：写出已聚合的批，排空队列并释放剩余帧
    flush_batch(&mut conn, &mut batch, &shared).await;
    shared.closed.store(true, Ordering::Release);
    while let Ok(frame) = data_rx.try_recv() {
        drop(frame);
    }
    while let Ok(frame) = control_rx.try_recv() {
        drop(frame);
    }
    data_rx.close();
    control_rx.close();
    debug!("frame writer loop exited");
}

fn rebuild_heartbeat(shared: &Shared) -> Option<tokio::time::Interval> {
    let hb = shared.heartbeat.lock().ok()?;
    if !hb.enabled {
        return None;
    }
    let interval = hb.interval?;
    if interval.is_zero() {
        return None;
    }
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn tick_heartbeat(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// 写出单帧；已锁存错误后不再向底层写任何帧
async fn flush_frame<W>(conn: &mut W, frame: Frame, shared: &Shared)
where
    W: AsyncWrite + Unpin,
{
    if shared.error_latched.load(Ordering::Acquire) {
        drop(frame);
        return;
    }

    if let Ok(hook) = shared.pre_write_hook.lock() {
        if let Some(hook) = hook.as_ref() {
            hook(&frame);
        }
    }

    let header = frame.encode_header();
    let result = write_vectored_all(conn, &[header.as_slice(), frame.payload()]).await;
    if let Err(e) = result {
        shared.latch_error(e);
    }
    drop(frame);
}

/// 按批写出；一次矢量写覆盖整批，减少系统调用
async fn flush_batch<W>(conn: &mut W, batch: &mut Vec<Frame>, shared: &Shared)
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return;
    }

    if shared.error_latched.load(Ordering::Acquire) {
        batch.clear();
        return;
    }

    if let Ok(hook) = shared.pre_write_hook.lock() {
        if let Some(hook) = hook.as_ref() {
            for frame in batch.iter() {
                hook(frame);
            }
        }
    }

    let headers: Vec<[u8; FRAME_HEADER_SIZE]> =
        batch.iter().map(|f| f.encode_header()).collect();
    let mut bufs: Vec<&[u8]> = Vec::with_capacity(batch.len() * 2);
    for (frame, header) in batch.iter().zip(headers.iter()) {
        bufs.push(header);
        bufs.push(frame.payload());
    }

    let result = write_vectored_all(conn, &bufs).await;
    if let Err(e) = result {
        shared.latch_error(e);
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::FrameKind;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};

    /// 捕获写出字节的共享缓冲
    #[derive(Clone, Default)]
    struct CaptureWriter {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        fn captured(&self) -> Vec<u8> {
            self.data.lock().unwrap().clone()
        }

        /// 解析捕获的帧序列
        fn frames(&self) -> Vec<(u8, Vec<u8>)> {
            let data = self.captured();
            let mut frames = Vec::new();
            let mut pos = 0;
            while pos + FRAME_HEADER_SIZE <= data.len() {
                let kind = data[pos];
                let len = u32::from_be_bytes([
                    data[pos + 2],
                    data[pos + 3],
                    data[pos + 4],
                    data[pos + 5],
                ]) as usize;
                let start = pos + FRAME_HEADER_SIZE;
                frames.push((kind, data[start..start + len].to_vec()));
                pos = start + len;
            }
            frames
        }
    }

    impl AsyncWrite for CaptureWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// 永远失败的写端
    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_backlog_returns_to_zero() {
        let capture = CaptureWriter::default();
        let writer = FrameWriter::new(capture.clone());

        for i in 0..10u8 {
            writer
                .write_frame(Frame::new(FrameKind::Data, vec![i; 4]))
                .await
                .unwrap();
        }

        writer.close().await;
        assert_eq!(writer.queued_frames(), 0);
        assert_eq!(writer.queued_bytes(), 0);

        // 底层按入队顺序收到 10 个数据帧
        let frames = capture.frames();
        assert_eq!(frames.len(), 10);
        for (i, (kind, payload)) in frames.iter().enumerate() {
            assert_eq!(*kind, FrameKind::Data as u8);
            assert_eq!(payload, &vec![i as u8; 4]);
        }
    }

    #[tokio::test]
    async fn test_control_priority() {
        let capture = CaptureWriter::default();
        // 长批等待时间让数据帧滞留在队列里
        let writer = FrameWriter::with_config(
            capture.clone(),
            FrameWriterConfig {
                max_batch_wait: Duration::from_secs(5),
                ..Default::default()
            },
        );

        for _ in 0..50 {
            writer
                .write_frame(Frame::new(FrameKind::Data, vec![0; 8]))
                .await
                .unwrap();
        }
        writer.write_control(Frame::empty(FrameKind::Ping)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.close().await;

        let frames = capture.frames();
        assert_eq!(frames.len(), 51);
        let ping_pos = frames
            .iter()
            .position(|(k, _)| *k == FrameKind::Ping as u8)
            .expect("ping frame written");
        let last_data_pos = frames
            .iter()
            .rposition(|(k, _)| *k == FrameKind::Data as u8)
            .unwrap();
        assert!(ping_pos < last_data_pos, "control frame must overtake queued data");
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let writer = FrameWriter::new(CaptureWriter::default());
        writer.close().await;

        let err = writer
            .write_frame(Frame::empty(FrameKind::Data))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::WriterClosed));
        assert_eq!(writer.queued_frames(), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_backlog() {
        let capture = CaptureWriter::default();
        let writer = FrameWriter::with_config(
            capture,
            FrameWriterConfig {
                queue_size: 1,
                max_batch_wait: Duration::from_secs(5),
                ..Default::default()
            },
        );
        // 填满队列与写循环
        for _ in 0..4 {
            let _ = writer
                .write_frame_with_cancel(
                    Frame::new(FrameKind::Data, vec![0; 8]),
                    &CancellationToken::new(),
                )
                .await;
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let before = writer.queued_frames();
        let err = writer
            .write_frame_with_cancel(Frame::new(FrameKind::Data, vec![0; 8]), &cancel)
            .await;
        // 已满时取消立即返回；计数恢复
        if let Err(e) = err {
            assert!(matches!(e, TunnelError::WriteCancelled));
            assert_eq!(writer.queued_frames(), before);
        }

        writer.close().await;
        assert_eq!(writer.queued_frames(), 0);
        assert_eq!(writer.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_write_error_latched_once() {
        let writer = FrameWriter::new(FailingWriter);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        writer.set_write_error_handler(move |_msg| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        writer
            .write_frame(Frame::new(FrameKind::Data, vec![1, 2, 3]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 错误已锁存：后续入队直接失败
        let err = writer
            .write_frame(Frame::new(FrameKind::Data, vec![4]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken pipe"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        writer.close().await;
        assert_eq!(writer.queued_frames(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_frames_emitted() {
        let capture = CaptureWriter::default();
        let writer = FrameWriter::new(capture.clone());

        writer.enable_heartbeat(Duration::from_millis(10), || {
            Some(Frame::empty(FrameKind::Ping))
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        writer.disable_heartbeat();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let pings = capture
            .frames()
            .iter()
            .filter(|(k, _)| *k == FrameKind::Ping as u8)
            .count();
        assert!(pings >= 2, "expected heartbeat frames, got {}", pings);

        writer.close().await;
    }

    #[tokio::test]
    async fn test_pre_write_hook_sees_every_frame() {
        let capture = CaptureWriter::default();
        let writer = FrameWriter::new(capture);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        writer.set_pre_write_hook(move |_frame| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            writer
                .write_frame(Frame::new(FrameKind::Data, vec![0]))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.close().await;

        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
