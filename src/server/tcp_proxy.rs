/// TCP 隧道代理
///
/// 每个 TCP 隧道在分配的端口上监听；每条外部连接成为一个流，
/// 读到的字节封装为 data 帧送往客户端，客户端回传的帧写回原连接。
/// 流表条目消失后收到的帧静默丢弃（流已被对端关闭，属正常时序）
use super::group::ConnectionGroup;
use crate::error::{Result, TunnelError};
use crate::pool::{BufferPool, SIZE_MEDIUM};
use crate::protocol::{
    encode_data_payload_pooled, DataHeader, DataType, Frame, FrameKind,
};
use crate::recovery::Supervisor;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ProxyStream {
    write_tx: mpsc::Sender<Bytes>,
    done: CancellationToken,
    closed: AtomicBool,
}

pub struct TunnelProxy {
    port: u16,
    subdomain: String,
    group: Weak<ConnectionGroup>,
    streams: Mutex<HashMap<String, Arc<ProxyStream>>>,
    pool: BufferPool,
    stop: CancellationToken,
}

impl TunnelProxy {
    pub fn new(port: u16, subdomain: String, group: Weak<ConnectionGroup>, pool: BufferPool) -> Arc<Self> {
        Arc::new(Self {
            port,
            subdomain,
            group,
            streams: Mutex::new(HashMap::new()),
            pool,
            stop: CancellationToken::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 绑定端口并启动接受循环
    pub async fn start(self: &Arc<Self>, supervisor: &Supervisor) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TunnelError::connection_failed(addr.clone(), e))?;

        info!(port = self.port, subdomain = %self.subdomain, "TCP proxy started");

        let proxy = Arc::clone(self);
        supervisor.spawn(format!("tcp-proxy-accept-{}", self.port), async move {
            proxy.accept_loop(listener).await;
        });

        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((conn, peer)) => {
                        debug!(port = self.port, peer = %peer, "TCP proxy accepted connection");
                        let proxy = Arc::clone(&self);
                        tokio::spawn(async move {
                            proxy.handle_connection(conn).await;
                        });
                    }
                    Err(e) => {
                        if self.stop.is_cancelled() {
                            break;
                        }
                        warn!(port = self.port, error = %e, "TCP proxy accept failed");
                    }
                },
            }
        }
        debug!(port = self.port, "TCP proxy accept loop exited");
    }

    async fn handle_connection(self: Arc<Self>, conn: TcpStream) {
        let _ = conn.set_nodelay(true);

        let stream_id = format!(
            "{}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0),
            self.port
        );

        let (mut read_half, mut write_half) = conn.into_split();
        let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(32);

        let stream = Arc::new(ProxyStream {
            write_tx,
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        if let Ok(mut streams) = self.streams.lock() {
            streams.insert(stream_id.clone(), Arc::clone(&stream));
        }

        // 写半路：客户端回传的数据写回外部连接
        let stream_writer = Arc::clone(&stream);
        let write_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stream_writer.done.cancelled() => break,
                    maybe = write_rx.recv() => match maybe {
                        Some(data) => {
                            if write_half.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = write_half.shutdown().await;
        });

        // 读半路：外部连接的数据封帧送往客户端
        let mut buf = self.pool.get(SIZE_MEDIUM);
        buf.resize(SIZE_MEDIUM, 0);

        loop {
            if stream.closed.load(Ordering::Acquire) {
                break;
            }

            let n = tokio::select! {
                _ = stream.done.cancelled() => break,
                result = read_half.read(buf.as_mut_slice()) => match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
            };

            if let Err(e) = self.send_data(&stream_id, &stream, &buf.as_slice()[..n]).await {
                debug!(stream_id = %stream_id, error = %e, "Send to tunnel failed");
                break;
            }
        }

        if !self.stop.is_cancelled() {
            self.send_close(&stream_id).await;
        }

        stream.done.cancel();
        let _ = write_task.await;

        if let Ok(mut streams) = self.streams.lock() {
            streams.remove(&stream_id);
        }
    }

    /// 外部字节封装为 data 帧发往客户端
    async fn send_data(&self, stream_id: &str, stream: &ProxyStream, data: &[u8]) -> Result<()> {
        let group = self
            .group
            .upgrade()
            .ok_or_else(|| TunnelError::protocol("tunnel group gone"))?;
        let conn = group
            .pick_connection()
            .ok_or_else(|| TunnelError::protocol("no healthy tunnel connection"))?;

        let header = DataHeader::new(DataType::Data, false, stream_id, stream_id);
        let payload = encode_data_payload_pooled(&header, data, &self.pool);
        let frame = Frame::new_pooled(FrameKind::Data, payload);

        conn.writer.write_frame_with_cancel(frame, &stream.done).await
    }

    /// 通知客户端流结束
    async fn send_close(&self, stream_id: &str) {
        let Some(group) = self.group.upgrade() else {
            return;
        };
        let Some(conn) = group.pick_connection() else {
            return;
        };

        let header = DataHeader::new(DataType::Close, true, stream_id, stream_id);
        let payload = encode_data_payload_pooled(&header, &[], &self.pool);
        let frame = Frame::new_pooled(FrameKind::Data, payload);
        let _ = conn.writer.write_frame(frame).await;
    }

    /// 客户端回传数据写回外部连接；流不存在时静默丢弃
    pub async fn handle_response(&self, stream_id: &str, data: &[u8]) {
        let stream = {
            let streams = match self.streams.lock() {
                Ok(streams) => streams,
                Err(_) => return,
            };
            match streams.get(stream_id) {
                Some(stream) => Arc::clone(stream),
                None => return,
            }
        };

        if stream.closed.load(Ordering::Acquire) {
            return;
        }

        let data = Bytes::copy_from_slice(data);
        tokio::select! {
            _ = stream.done.cancelled() => {}
            _ = stream.write_tx.send(data) => {}
        }
    }

    /// 关闭单个流；套接字恰好关闭一次
    pub fn close_stream(&self, stream_id: &str) {
        let stream = {
            let mut streams = match self.streams.lock() {
                Ok(streams) => streams,
                Err(_) => return,
            };
            streams.remove(stream_id)
        };

        if let Some(stream) = stream {
            if !stream.closed.swap(true, Ordering::AcqRel) {
                stream.done.cancel();
            }
        }
    }

    /// 停止代理：关闭监听与全部流
    pub async fn stop(&self) {
        info!(port = self.port, subdomain = %self.subdomain, "Stopping TCP proxy");
        self.stop.cancel();

        let streams: Vec<Arc<ProxyStream>> = {
            match self.streams.lock() {
                Ok(mut streams) => streams.drain().map(|(_, s)| s).collect(),
                Err(_) => return,
            }
        };

        for stream in streams {
            stream.closed.store(true, Ordering::Release);
            stream.done.cancel();
        }
    }

    /// 活跃流数量
    pub fn stream_count(&self) -> usize {
        self.streams.lock().map(|s| s.len()).unwrap_or(0)
    }
}
