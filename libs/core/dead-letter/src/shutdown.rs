//! Shutdown signalling shared by the pipeline tasks.

use tokio::sync::watch;

/// Create a shutdown channel. Send `true` to stop every task holding a
/// receiver.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once shutdown was requested. A dropped sender counts as a
/// request.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_resolves_on_signal() {
        let (tx, mut rx) = channel();
        assert!(!is_shutdown(&rx));

        let waiter = tokio::spawn(async move {
            wait_for_shutdown(&mut rx).await;
            is_shutdown(&rx)
        });
        tx.send(true).unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = channel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(&mut rx))
            .await
            .unwrap();
    }
}
