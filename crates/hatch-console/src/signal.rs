//! Close-once disconnect notification shared by the local and remote sides.

use std::sync::Arc;

/// Which side ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The user detached locally, or local input ended.
    Detached,
    /// The remote stream closed or the operation finished.
    RemoteClosed,
}

/// One-shot disconnect notification.
///
/// Any clone may close it; only the first close takes effect and later
/// closes are silently ignored. Observers await [`DisconnectSignal::closed`].
#[derive(Debug, Clone)]
pub struct DisconnectSignal {
    tx: Arc<tokio::sync::watch::Sender<Option<DisconnectReason>>>,
}

impl Default for DisconnectSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl DisconnectSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = tokio::sync::watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Close the signal. Returns `true` if this call closed it.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        let closed = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if closed {
            tracing::debug!("disconnect signalled: {reason:?}");
        }
        closed
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    #[must_use]
    pub fn reason(&self) -> Option<DisconnectReason> {
        *self.tx.borrow()
    }

    /// Wait until the signal is closed and return the winning reason.
    pub async fn closed(&self) -> DisconnectReason {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            Err(_) => None,
        };
        // The sender lives as long as `self`, so the wait cannot fail.
        reason.unwrap_or(DisconnectReason::RemoteClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_close_is_noop() {
        let signal = DisconnectSignal::new();
        assert!(signal.close(DisconnectReason::Detached));
        assert!(!signal.close(DisconnectReason::RemoteClosed));
        assert_eq!(signal.reason(), Some(DisconnectReason::Detached));
    }

    #[test]
    fn test_close_from_clone() {
        let signal = DisconnectSignal::new();
        let remote = signal.clone();
        assert!(!signal.is_closed());
        remote.close(DisconnectReason::RemoteClosed);
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let signal = DisconnectSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.closed().await })
        };
        tokio::task::yield_now().await;
        signal.close(DisconnectReason::RemoteClosed);
        assert_eq!(waiter.await.unwrap(), DisconnectReason::RemoteClosed);
    }

    #[tokio::test]
    async fn test_closed_resolves_when_already_closed() {
        let signal = DisconnectSignal::new();
        signal.close(DisconnectReason::Detached);
        assert_eq!(signal.closed().await, DisconnectReason::Detached);
    }

    #[tokio::test]
    async fn test_concurrent_closers_race_safely() {
        let signal = DisconnectSignal::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let signal = signal.clone();
            handles.push(tokio::spawn(async move {
                let reason = if i % 2 == 0 {
                    DisconnectReason::Detached
                } else {
                    DisconnectReason::RemoteClosed
                };
                signal.close(reason)
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
