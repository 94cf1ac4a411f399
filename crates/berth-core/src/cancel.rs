//! Cooperative cancellation over a `tokio::sync::watch` flag.
//!
//! The parent run owns the [`CancelHandle`]; every child task holds a
//! [`CancelSignal`] clone and selects on [`CancelSignal::cancelled`] around
//! its blocking call.

use std::sync::Arc;

use tokio::sync::watch;

/// Sender side: flips the flag once.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiver side, cheap to clone into child tasks.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    /// Holds the sender of a signal that can never fire.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

/// Create a linked handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { tx },
        CancelSignal {
            rx,
            _keepalive: None,
        },
    )
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelSignal {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_fires_after_cancel() {
        let (handle, mut signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("signal should fire");
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signal_does_not_fire() {
        let mut signal = CancelSignal::never();
        let fired = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_does_not_fire() {
        let (handle, mut signal) = cancel_pair();
        drop(handle);
        let fired = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(fired.is_err());
    }

    #[test]
    fn test_subscribed_signal_sees_cancel() {
        let (handle, _) = cancel_pair();
        let late = handle.signal();
        handle.cancel();
        assert!(late.is_cancelled());
    }
}
