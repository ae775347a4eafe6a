/*!
   Cancellation and deadline propagation for engine operations.
*/

use core::future::Future;
use core::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/**
   A cloneable context passed to every public operation.

   Cancelling a context cancels all contexts derived from it. A context
   may also carry a deadline, which is always the earliest deadline of
   its ancestors.
*/
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A root context that is never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child context that is cancelled together with this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };

        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the context is already cancelled or past its deadline.
    pub fn check(&self, operation: &str) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::cancelled(operation.to_string()));
        }

        match self.remaining() {
            Some(remaining) if remaining.is_zero() => Err(Error::timeout(
                operation.to_string(),
                Duration::default(),
            )),
            _ => Ok(()),
        }
    }

    /**
       Run a future to completion unless the context is cancelled or its
       deadline elapses first. The future is dropped in that case, which
       cancels any in-flight I/O it owns.
    */
    pub async fn run<T>(
        &self,
        operation: &str,
        task: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        let started = Instant::now();

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    res = task => res,
                    _ = self.token.cancelled() => Err(Error::cancelled(operation.to_string())),
                    _ = sleep_until(deadline) => Err(Error::timeout(operation.to_string(), started.elapsed())),
                }
            }
            None => {
                tokio::select! {
                    res = task => res,
                    _ = self.token.cancelled() => Err(Error::cancelled(operation.to_string())),
                }
            }
        }
    }

    /// Run a future with an extra timeout on top of this context's deadline.
    pub async fn run_with_timeout<T>(
        &self,
        operation: &str,
        timeout: Duration,
        task: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        self.with_timeout(timeout).run(operation, task).await
    }

    /// Sleep for the given duration, returning early with an error on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Error> {
        self.run("sleep", async {
            sleep(duration).await;
            Ok(())
        })
        .await
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn deadline_produces_timeout() {
        let ctx = Context::background().with_timeout(Duration::from_secs(2));

        let res = ctx
            .run("never", async {
                sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert_eq!(res.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_parent_cancels_child() {
        let parent = Context::background();
        let child = parent.child().with_timeout(Duration::from_secs(60));

        parent.cancel();

        let res = child.sleep(Duration::from_secs(5)).await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Cancelled);
        assert!(child.check("op").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn child_deadline_never_exceeds_parent() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(100));

        assert!(child.remaining().unwrap() <= Duration::from_secs(1));
    }
}
