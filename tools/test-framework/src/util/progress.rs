/*!
   A counter shared between a background scenario task and the main
   scenario, so that assertions can wait for the task to have done a
   given amount of work instead of sleeping.
*/

use tokio::sync::watch;

use crate::error::Error;
use crate::types::context::Context;

#[derive(Clone)]
pub struct Progress {
    name: String,
    sender: watch::Sender<u64>,
}

impl Progress {
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, _) = watch::channel(0);

        Self {
            name: name.into(),
            sender,
        }
    }

    /// Record one finished step. Returns the new count.
    pub fn advance(&self) -> u64 {
        let mut count = 0;
        self.sender.send_modify(|value| {
            *value += 1;
            count = *value;
        });
        count
    }

    pub fn count(&self) -> u64 {
        *self.sender.borrow()
    }

    /// Wait until at least `steps` steps were recorded.
    pub async fn wait_for(&self, ctx: &Context, steps: u64) -> Result<u64, Error> {
        let mut receiver = self.sender.subscribe();
        let operation = format!("wait for {} steps of {}", steps, self.name);
        let name = self.name.clone();

        ctx.run(&operation, async move {
            let count = *receiver
                .wait_for(|count| *count >= steps)
                .await
                .map_err(|e| eyre::eyre!("progress {} was dropped: {}", name, e))?;

            Ok(count)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use core::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn waits_for_background_steps() {
        let progress = Progress::new("arbitrage");
        let ctx = Context::background();

        let worker = progress.clone();
        let handle = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(5)).await;
                worker.advance();
            }
        });

        assert!(progress.wait_for(&ctx, 2).await.unwrap() >= 2);
        handle.await.unwrap();
        assert_eq!(progress.count(), 3);

        let short = ctx.with_timeout(Duration::from_secs(1));
        let err = progress.wait_for(&short, 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
