/*!
   Utilities for retrying test operations.
*/

use core::future::Future;
use core::time::Duration;
use eyre::eyre;
use tracing::trace;

use crate::error::Error;
use crate::types::context::Context;

/**
   Retry an async task at a fixed interval until it succeeds or the
   attempts run out. Cancellation of `ctx` stops the retries.
*/
pub async fn assert_eventually_succeed<R, Fut>(
    ctx: &Context,
    task_name: &str,
    attempts: u16,
    interval: Duration,
    mut task: impl FnMut() -> Fut,
) -> Result<R, Error>
where
    Fut: Future<Output = Result<R, Error>>,
{
    let mut last_error = None;

    for _ in 0..attempts {
        match task().await {
            Ok(res) => return Ok(res),
            Err(e) => {
                trace!("retrying task {} that failed with error: {}", task_name, e);
                last_error = Some(e);
                ctx.sleep(interval).await?;
            }
        }
    }

    Err(Error::generic(eyre!(
        "expected task to eventually succeed, but failed after {} attempts: {}: {}",
        attempts,
        task_name,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let ctx = Context::background();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let res = assert_eventually_succeed(&ctx, "flaky", 5, Duration::from_secs(1), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::assertion("not yet".to_string()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(res, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempts() {
        let ctx = Context::background();

        let res: Result<(), Error> =
            assert_eventually_succeed(&ctx, "never", 3, Duration::from_secs(1), || async {
                Err(Error::assertion("nope".to_string()))
            })
            .await;

        assert!(res.unwrap_err().to_string().contains("never"));
    }
}
