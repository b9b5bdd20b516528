//! An async timeout combinator for tests exercising the executor's
//! streaming cursors, where a stuck `RangeVector` should fail the test
//! instead of hanging the run.
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

/// Extension trait adding a fluent `.with_timeout(dur)` to any future.
#[async_trait]
pub trait FutureTimeout: Future {
    async fn with_timeout(self, duration: Duration) -> Self::Output
    where
        Self: Sized + Send,
        Self::Output: Debug;
}

#[async_trait]
impl<T> FutureTimeout for T
where
    T: Future + Send,
{
    async fn with_timeout(self, duration: Duration) -> Self::Output
    where
        Self: Sized + Send,
        Self::Output: Debug,
    {
        tokio::time::timeout(duration, self)
            .await
            .unwrap_or_else(|_| panic!("future did not complete within {duration:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_timeout() {
        let result = async { 42 }.with_timeout(Duration::from_millis(50)).await;
        assert_eq!(result, 42);
    }

    #[tokio::test]
    #[should_panic(expected = "did not complete")]
    async fn panics_when_future_hangs() {
        tokio::time::sleep(Duration::from_secs(3600))
            .with_timeout(Duration::from_millis(10))
            .await;
    }
}
