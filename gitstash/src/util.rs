//! Small async utilities.

use std::future::Future;
use std::pin::Pin;

/// Runs a cleanup future when dropped, unless `cancel` is called first.
///
/// Used to undo partially-applied side effects on early returns: create the
/// guard right after the side effect, cancel it once the whole operation has
/// committed.
pub struct Finally {
    cleanup: Option<Pin<Box<dyn Future<Output = ()> + Send + 'static>>>,
}

impl Finally {
    pub fn new(cleanup: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            cleanup: Some(Box::pin(cleanup)),
        }
    }

    /// Defuses the guard so the cleanup never runs.
    pub fn cancel(mut self) {
        self.cleanup.take();
    }
}

impl Drop for Finally {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            tokio::spawn(cleanup);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_cleanup_on_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            let _guard = Finally::new(async move {
                fired.store(true, Ordering::SeqCst);
            });
        }
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_defuses_cleanup() {
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            let guard = Finally::new(async move {
                fired.store(true, Ordering::SeqCst);
            });
            guard.cancel();
        }
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
