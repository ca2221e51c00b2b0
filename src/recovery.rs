/// 任务故障隔离
///
/// 每个长生命周期的并发任务包一层监督：捕获 panic、记录指标，
/// 避免单个任务的故障波及兄弟任务
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// panic 计数指标
#[derive(Default)]
pub struct PanicMetrics {
    total: AtomicU64,
}

impl PanicMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, location: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        error!(location, "task panic recorded");
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// 任务监督器
#[derive(Clone)]
pub struct Supervisor {
    metrics: Arc<PanicMetrics>,
}

impl Supervisor {
    pub fn new(metrics: Arc<PanicMetrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &Arc<PanicMetrics> {
        &self.metrics
    }

    /// 包装 future：panic 被捕获并计入指标
    pub fn wrap<F>(&self, name: impl Into<String>, fut: F) -> impl Future<Output = ()> + Send + 'static
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let metrics = Arc::clone(&self.metrics);
        async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let msg = panic_message(&panic);
                error!(task = %name, panic = %msg, "task panicked");
                metrics.record(&name);
            }
        }
    }

    /// 启动受监督任务：panic 被捕获并计入指标
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.wrap(name, fut))
    }

    /// 启动受监督任务，panic 后执行清理回调
    pub fn spawn_with_cleanup<F, C>(
        &self,
        name: impl Into<String>,
        fut: F,
        cleanup: C,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let msg = panic_message(&panic);
                error!(task = %name, panic = %msg, "task panicked");
                metrics.record(&name);
                cleanup();
            }
        })
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_panic_is_caught_and_counted() {
        let supervisor = Supervisor::new(PanicMetrics::new());

        let handle = supervisor.spawn("boom", async {
            panic!("intentional");
        });
        handle.await.unwrap();

        assert_eq!(supervisor.metrics().total(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_on_panic() {
        let supervisor = Supervisor::new(PanicMetrics::new());
        let cleaned = Arc::new(AtomicBool::new(false));
        let cleaned_clone = Arc::clone(&cleaned);

        let handle = supervisor.spawn_with_cleanup(
            "boom",
            async {
                panic!("intentional");
            },
            move || {
                cleaned_clone.store(true, Ordering::SeqCst);
            },
        );
        handle.await.unwrap();

        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_normal_completion_not_counted() {
        let supervisor = Supervisor::new(PanicMetrics::new());
        supervisor.spawn("ok", async {}).await.unwrap();
        assert_eq!(supervisor.metrics().total(), 0);
    }
}
