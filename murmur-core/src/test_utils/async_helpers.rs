//! Async test helpers
//!
//! Channel receive with timeout and waiting on watch channels.

use std::future::Future;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Helper for receiving from a channel with a timeout
pub async fn recv_timeout<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    timeout(duration, rx.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl std::fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Wait until the watched value satisfies `pred` and return a copy of it.
///
/// Panics after `TEST_TIMEOUT`, reporting the last value seen.
pub async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, mut pred: F) -> T
where
    T: Clone + std::fmt::Debug,
    F: FnMut(&T) -> bool,
{
    let reached = timeout(TEST_TIMEOUT, rx.wait_for(|value| pred(value)))
        .await
        .map(|result| result.map(|value| value.clone()));
    match reached {
        Ok(Ok(value)) => value,
        Ok(Err(_)) => panic!("watch sender dropped while waiting"),
        Err(_) => panic!("condition not reached in time, last value: {:?}", *rx.borrow()),
    }
}

/// Resolve once `gate` holds `true`; `false` if the gate was dropped first
pub(crate) async fn gate_open(gate: &watch::Sender<bool>) -> bool {
    let mut rx = gate.subscribe();
    loop {
        if *rx.borrow_and_update() {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

/// Run a future with the default test timeout, panicking if it takes longer
pub async fn within<F, T>(future: F) -> T
where
    F: Future<Output = T>,
{
    timeout(TEST_TIMEOUT, future).await.expect("operation timed out")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_timeout_success() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(42).unwrap();
        assert_eq!(recv_timeout(&mut rx, Duration::from_millis(100)).await, Ok(42));
    }

    #[tokio::test]
    async fn test_recv_timeout_expires_and_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel::<i32>();
        assert_eq!(
            recv_timeout(&mut rx, Duration::from_millis(10)).await,
            Err(RecvTimeoutError::Timeout)
        );
        drop(tx);
        assert_eq!(
            recv_timeout(&mut rx, Duration::from_millis(10)).await,
            Err(RecvTimeoutError::Closed)
        );
    }

    #[tokio::test]
    async fn test_wait_for_sees_later_value() {
        let (tx, mut rx) = watch::channel(0);
        tokio::spawn(async move {
            for i in 1..=3 {
                let _ = tx.send(i);
            }
        });
        assert_eq!(wait_for(&mut rx, |v| *v == 3).await, 3);
    }
}
