//! Shared services and the per-node control plane.
//!
//! [`EngineContext`] bundles what every pipeline of a process shares: the
//! configuration, the diagnostic handler, the cache manager and a handle to
//! the tokio runtime. [`OperatorControl`] is what an operator's generator
//! sees of its execution node: it reports diagnostics through it, wakes the
//! node after asynchronous work completes, and issues requests to other
//! tasks without blocking the node.

use crate::cache::CacheManager;
use crate::config::EngineConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::diagnostic::{Diagnostic, DiagnosticHandler, LoggingHandler, Severity};
use crate::pipeline::id::NodeId;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

/// Process-wide services shared by all pipelines.
#[derive(Clone)]
pub struct EngineContext {
    config: Arc<EngineConfig>,
    diagnostics: Arc<dyn DiagnosticHandler>,
    caches: CacheManager,
    runtime: Handle,
}

impl EngineContext {
    /// Create a context on the current tokio runtime. Diagnostics are only
    /// logged until [`EngineContext::with_diagnostics`] installs a handler.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            PipelineError::Config("an engine context must be created within a tokio runtime".into())
        })?;
        let caches = CacheManager::spawn(config.cache, &runtime);
        Ok(Self {
            config: Arc::new(config),
            diagnostics: Arc::new(LoggingHandler),
            caches,
            runtime,
        })
    }

    pub fn with_diagnostics(mut self, handler: Arc<dyn DiagnosticHandler>) -> Self {
        self.diagnostics = handler;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Arc<dyn DiagnosticHandler> {
        &self.diagnostics
    }

    pub fn caches(&self) -> &CacheManager {
        &self.caches
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

/// Wakes an execution node so it re-runs its generator immediately.
#[derive(Clone, Debug, Default)]
pub struct NodeWaker {
    notify: Arc<Notify>,
}

impl NodeWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.notify.notified().await;
    }
}

/// Pending result of an asynchronous request issued by a generator.
pub struct Request<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Request<T> {
    /// The result if it arrived; `Some(Err)` if the request was abandoned.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PipelineError::logic(
                "request was dropped before it completed",
            ))),
        }
    }
}

struct ControlInner {
    node: NodeId,
    operator: String,
    engine: EngineContext,
    waker: NodeWaker,
    fatal: Mutex<Option<Diagnostic>>,
    seen: Mutex<HashSet<Diagnostic>>,
}

/// Control plane of one execution node, handed to its operator.
#[derive(Clone)]
pub struct OperatorControl {
    inner: Arc<ControlInner>,
}

impl OperatorControl {
    pub fn new(node: NodeId, operator: impl Into<String>, engine: EngineContext) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                node,
                operator: operator.into(),
                engine,
                waker: NodeWaker::new(),
                fatal: Mutex::new(None),
                seen: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node
    }

    pub fn operator_name(&self) -> &str {
        &self.inner.operator
    }

    pub fn engine(&self) -> &EngineContext {
        &self.inner.engine
    }

    pub fn config(&self) -> &EngineConfig {
        self.inner.engine.config()
    }

    pub fn waker(&self) -> NodeWaker {
        self.inner.waker.clone()
    }

    /// Report a diagnostic. Errors become the node's termination reason
    /// after the current generator step; repeated warnings and notes are
    /// only forwarded once.
    pub fn emit(&self, diag: Diagnostic) {
        if diag.severity == Severity::Error {
            let mut fatal = self.inner.fatal.lock().unwrap_or_else(PoisonError::into_inner);
            if fatal.is_none() {
                *fatal = Some(diag);
            }
            drop(fatal);
            self.inner.waker.wake();
            return;
        }
        let first = self
            .inner
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(diag.clone());
        if first {
            let diag = diag.with_note(format!("from `{}` ({})", self.inner.operator, self.inner.node));
            self.inner.engine.diagnostics().emit(diag);
        }
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(Diagnostic::warning(message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(Diagnostic::error(message));
    }

    pub(crate) fn take_fatal(&self) -> Option<Diagnostic> {
        self.inner
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Spawn a task on the engine runtime.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.engine.runtime().spawn(fut)
    }

    /// Run `fut` on the engine runtime and wake this node once it is done.
    /// The generator keeps returning `Pending` until `try_take` yields.
    pub fn request<T, F>(&self, fut: F) -> Request<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let waker = self.waker();
        self.spawn(async move {
            let value = fut.await;
            let _ = tx.send(value);
            waker.wake();
        });
        Request { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use std::time::Duration;

    mock! {
        Handler {}
        impl DiagnosticHandler for Handler {
            fn emit(&self, diag: Diagnostic);
        }
    }

    #[tokio::test]
    async fn test_warnings_are_deduplicated() {
        let mut handler = MockHandler::new();
        handler
            .expect_emit()
            .withf(|d| d.severity == Severity::Warning && d.message == "slow")
            .times(1)
            .return_const(());
        let engine = EngineContext::new(EngineConfig::default())
            .unwrap()
            .with_diagnostics(Arc::new(handler));
        let ctrl = OperatorControl::new(NodeId(1), "test", engine);
        ctrl.warn("slow");
        ctrl.warn("slow");
    }

    #[tokio::test]
    async fn test_error_is_recorded_not_forwarded() {
        let mut handler = MockHandler::new();
        handler.expect_emit().times(0);
        let engine = EngineContext::new(EngineConfig::default())
            .unwrap()
            .with_diagnostics(Arc::new(handler));
        let ctrl = OperatorControl::new(NodeId(2), "test", engine);
        ctrl.error("first");
        ctrl.error("second");
        assert_eq!(ctrl.take_fatal().unwrap().message, "first");
        assert!(ctrl.take_fatal().is_none());
    }

    #[tokio::test]
    async fn test_request_wakes_node() {
        let engine = EngineContext::new(EngineConfig::default()).unwrap();
        let ctrl = OperatorControl::new(NodeId(3), "test", engine);
        let mut request = ctrl.request(async { 7u32 });
        tokio::time::timeout(Duration::from_secs(1), ctrl.waker().woken())
            .await
            .unwrap();
        assert_eq!(request.try_take().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_context_requires_runtime() {
        assert!(EngineContext::new(EngineConfig::default()).is_err());
    }
}
