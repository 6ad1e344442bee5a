use std::sync::Arc;
use std::time::Duration;

use cairn_util::FastDashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::types::Cid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Released,
    TimedOut,
    Cancelled,
}

/// Per-block wait points of in-flight fetches.
#[derive(Default)]
pub struct Blocker {
    waiters: FastDashMap<Cid, Arc<Notify>>,
}

impl Blocker {
    /// Waits until the block is released, the timeout elapses
    /// or the token is cancelled.
    ///
    /// A release which happened after the previous wait
    /// completes the next wait immediately.
    pub async fn wait(&self, cid: &Cid, timeout: Duration, cancelled: &CancellationToken) -> Wake {
        let notify = self.waiters.entry(*cid).or_default().clone();
        tokio::select! {
            _ = notify.notified() => Wake::Released,
            _ = tokio::time::sleep(timeout) => Wake::TimedOut,
            _ = cancelled.cancelled() => Wake::Cancelled,
        }
    }

    pub fn release(&self, cid: &Cid) {
        if let Some(notify) = self.waiters.get(cid) {
            notify.notify_one();
        }
    }

    /// Forgets the wait point once the fetch is finished.
    pub fn remove(&self, cid: &Cid) {
        self.waiters.remove(cid);
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Codec;

    #[tokio::test(start_paused = true)]
    async fn wait_is_released_or_times_out() {
        let blocker = Arc::new(Blocker::default());
        let cid = Cid::for_data(Codec::RAW, b"block");
        let token = CancellationToken::new();

        let timeout = Duration::from_millis(500);
        assert_eq!(blocker.wait(&cid, timeout, &token).await, Wake::TimedOut);

        let task = tokio::spawn({
            let blocker = blocker.clone();
            let token = token.clone();
            async move { blocker.wait(&cid, Duration::from_secs(60), &token).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        blocker.release(&cid);
        assert_eq!(task.await.unwrap(), Wake::Released);

        // Release before the wait is not lost.
        blocker.release(&cid);
        assert_eq!(blocker.wait(&cid, timeout, &token).await, Wake::Released);

        blocker.remove(&cid);
        assert!(blocker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_cancelled() {
        let blocker = Blocker::default();
        let cid = Cid::for_data(Codec::RAW, b"block");
        let token = CancellationToken::new();
        token.cancel();

        let wake = blocker.wait(&cid, Duration::from_secs(60), &token).await;
        assert_eq!(wake, Wake::Cancelled);
    }
}
