/*!
   The lifecycle supervisor owning cleanup of everything created for a
   test run.
*/

use core::future::Future;
use core::time::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::types::context::Context;

type CleanupThunk = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), Error>> + Send>;

/// How long background tasks get to observe cancellation before being aborted.
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/**
   A LIFO stack of cleanup actions plus the run-scoped cancellation
   token and background tasks.

   The supervisor is cheaply cloneable and every clone refers to the
   same stack. [`close`](Supervisor::close) may be called any number
   of times; each call drains whatever has been registered since the
   previous one.
*/
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    name: String,
    token: CancellationToken,
    cleanups: Mutex<Vec<(String, CleanupThunk)>>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    fatal_sender: mpsc::UnboundedSender<Error>,
    fatal_receiver: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
    closing: AsyncMutex<()>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>) -> Self {
        let (fatal_sender, fatal_receiver) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(SupervisorInner {
                name: name.into(),
                token: CancellationToken::new(),
                cleanups: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                fatal_sender,
                fatal_receiver: Mutex::new(Some(fatal_receiver)),
                closing: AsyncMutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// A context that is cancelled when the supervisor closes.
    pub fn context(&self) -> Context {
        Context::from_token(self.inner.token.child_token())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /**
       Push a cleanup action. Actions run in reverse registration order
       when the supervisor is closed.
    */
    pub fn register<F, Fut>(&self, description: impl Into<String>, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let description = description.into();
        debug!("registering cleanup: {}", description);

        let thunk: CleanupThunk = Box::new(move || cleanup().boxed());

        match self.inner.cleanups.lock() {
            Ok(mut cleanups) => cleanups.push((description, thunk)),
            Err(poisoned) => poisoned.into_inner().push((description, thunk)),
        }
    }

    pub fn pending_cleanups(&self) -> usize {
        match self.inner.cleanups.lock() {
            Ok(cleanups) => cleanups.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /**
       Spawn a background task bound to the lifetime of the run.

       The task is stopped when the supervisor closes. An error returned
       by the task before that is reported on the fatal error channel.
    */
    pub fn spawn_background<Fut>(&self, name: impl Into<String>, task: Fut)
    where
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let name = name.into();
        let token = self.inner.token.clone();
        let sender = self.inner.fatal_sender.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                res = task => {
                    if let Err(e) = res {
                        if !token.is_cancelled() {
                            error!("background task {} failed: {}", task_name, e);
                            let _ = sender.send(e);
                        }
                    }
                }
                _ = token.cancelled() => {
                    debug!("background task {} stopped", task_name);
                }
            }
        });

        match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.push((name, handle)),
            Err(poisoned) => poisoned.into_inner().push((name, handle)),
        }
    }

    /// Report a fatal error from a background task to the main scenario.
    pub fn report_fatal(&self, error: Error) {
        let _ = self.inner.fatal_sender.send(error);
    }

    /**
       Take the receiving end of the fatal error channel. Only the first
       caller gets it.
    */
    pub fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        match self.inner.fatal_receiver.lock() {
            Ok(mut receiver) => receiver.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /**
       Cancel the run, stop background tasks and run all registered
       cleanups in LIFO order. Failing cleanups do not stop the drain;
       their errors are collected into a single `CleanupPartial` error.
    */
    pub async fn close(&self) -> Result<(), Error> {
        let _guard = self.inner.closing.lock().await;

        self.inner.token.cancel();

        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        for (name, mut handle) in tasks {
            if tokio::time::timeout(TASK_SHUTDOWN_GRACE, &mut handle)
                .await
                .is_err()
            {
                warn!("background task {} did not stop in time, aborting", name);
                handle.abort();
            }
        }

        let mut failures = Vec::new();
        let mut count = 0;

        loop {
            let next = match self.inner.cleanups.lock() {
                Ok(mut cleanups) => cleanups.pop(),
                Err(poisoned) => poisoned.into_inner().pop(),
            };

            let Some((description, thunk)) = next else {
                break;
            };

            count += 1;
            debug!("running cleanup: {}", description);

            if let Err(e) = thunk().await {
                warn!("cleanup `{}` failed: {}", description, e);
                failures.push(format!("{description}: {e}"));
            }
        }

        if count > 0 {
            info!(
                "supervisor {} ran {} cleanup(s) with {} failure(s)",
                self.inner.name,
                count,
                failures.len()
            );
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::cleanup_partial(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorDetail, ErrorKind};
    use eyre::eyre;

    fn recorder(order: &Arc<Mutex<Vec<u32>>>, id: u32) -> impl FnOnce() -> BoxFuture<'static, Result<(), Error>> {
        let order = order.clone();
        move || {
            async move {
                order.lock().unwrap().push(id);
                Ok(())
            }
            .boxed()
        }
    }

    #[test_log::test(tokio::test)]
    async fn cleanups_run_in_reverse_order() {
        let supervisor = Supervisor::new("order");
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 1..=3 {
            supervisor.register(format!("step {id}"), recorder(&order, id));
        }

        supervisor.close().await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test_log::test(tokio::test)]
    async fn close_continues_past_failures_and_is_idempotent() {
        let supervisor = Supervisor::new("failures");
        let order = Arc::new(Mutex::new(Vec::new()));

        supervisor.register("first", recorder(&order, 1));
        supervisor.register("broken", || async { Err(Error::generic(eyre!("boom"))) });
        supervisor.register("last", recorder(&order, 3));

        let err = supervisor.close().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CleanupPartial);
        match err.detail() {
            ErrorDetail::CleanupPartial(e) => {
                assert_eq!(e.failures.len(), 1);
                assert!(e.failures[0].starts_with("broken"));
            }
            _ => panic!("unexpected error {err}"),
        }

        assert_eq!(*order.lock().unwrap(), vec![3, 1]);

        supervisor.close().await.unwrap();
        supervisor.close().await.unwrap();
        assert_eq!(order.lock().unwrap().len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn close_stops_background_tasks() {
        let supervisor = Supervisor::new("tasks");
        let ctx = supervisor.context();

        supervisor.spawn_background("forever", async move {
            loop {
                ctx.sleep(Duration::from_secs(1)).await?;
            }
        });

        supervisor.close().await.unwrap();

        assert!(supervisor.is_closed());
        assert!(supervisor.context().is_cancelled());
    }

    #[test_log::test(tokio::test)]
    async fn background_failures_reach_the_error_channel() {
        let supervisor = Supervisor::new("fatal");
        let mut receiver = supervisor.take_error_receiver().unwrap();
        assert!(supervisor.take_error_receiver().is_none());

        supervisor.spawn_background("failing", async {
            Err(Error::assertion("pool drained".to_string()))
        });

        let err = receiver.recv().await.unwrap();
        assert_eq!(err.kind(), ErrorKind::Assertion);

        supervisor.close().await.unwrap();
    }
}
