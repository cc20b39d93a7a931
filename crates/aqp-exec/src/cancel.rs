//! Plan-wide cancellation.
//!
//! `abort` stops every queued or running node. `stop_progressive` lets
//! progressive nodes finish the increment in flight and report it as their
//! final estimate; other nodes are unaffected.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelLevel {
    None,
    StopProgressive,
    Abort,
}

#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<CancelLevel>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CancelLevel::None);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.raise(CancelLevel::Abort);
    }

    pub fn stop_progressive(&self) {
        self.raise(CancelLevel::StopProgressive);
    }

    pub fn level(&self) -> CancelLevel {
        *self.tx.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.level() == CancelLevel::Abort
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    // Levels only ever increase.
    fn raise(&self, level: CancelLevel) {
        self.tx.send_if_modified(|current| {
            if level > *current {
                *current = level;
                true
            } else {
                false
            }
        });
    }
}

/// Per-task view of a `CancelHandle`.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<CancelLevel>,
}

impl CancelToken {
    pub fn level(&self) -> CancelLevel {
        *self.rx.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.level() == CancelLevel::Abort
    }

    pub fn should_stop_progressive(&self) -> bool {
        self.level() >= CancelLevel::StopProgressive
    }

    /// Resolves once the plan is aborted.
    pub async fn aborted(&mut self) {
        // The sender lives as long as any handle; if it is gone nobody can abort.
        if self.rx.wait_for(|l| *l == CancelLevel::Abort).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_only_increase() {
        let handle = CancelHandle::new();
        let token = handle.token();
        assert_eq!(token.level(), CancelLevel::None);
        handle.abort();
        handle.stop_progressive();
        assert!(token.is_aborted());
        assert!(token.should_stop_progressive());
    }

    #[tokio::test]
    async fn aborted_resolves_after_abort() {
        let handle = CancelHandle::new();
        let mut token = handle.token();
        let waiter = tokio::spawn(async move { token.aborted().await });
        handle.stop_progressive();
        handle.abort();
        waiter.await.unwrap();
        assert!(handle.is_aborted());
    }
}
