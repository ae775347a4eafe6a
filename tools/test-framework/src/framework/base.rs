/*!
    Base infrastructure for the test framework. Includes basic setup for
    initializing the logger, loading the test configuration and tearing
    down everything a test created.
*/

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bootstrap::init::init_test;
use crate::docker::cli::DockerCli;
use crate::docker::{ContainerRuntime, DockerBroker};
use crate::error::Error;
use crate::framework::supervisor::Supervisor;
use crate::types::config::TestConfig;
use crate::types::context::Context;

/**
   A test case running against containers provisioned for it.

   The test receives a [`DockerBroker`] bound to a fresh
   [`Supervisor`]. Everything created through the broker is removed
   after [`run`](InterchainTest::run) returns, whether it succeeded
   or not.
*/
#[async_trait]
pub trait InterchainTest: Send + Sync {
    /// Name used for container labels, resource names and log files.
    fn test_name(&self) -> &str;

    fn modify_test_config(&self, _config: &mut TestConfig) {}

    /// Test runner
    async fn run(
        &self,
        ctx: &Context,
        config: &TestConfig,
        broker: &DockerBroker,
    ) -> Result<(), Error>;
}

/**
   Runs a test case implementing [`InterchainTest`] against the docker
   CLI configured in the test environment.
*/
pub async fn run_interchain_test<Test: InterchainTest>(test: &Test) -> Result<(), Error> {
    let mut config = init_test()?;
    test.modify_test_config(&mut config);

    info!(
        "starting test {} with test config: {:?}",
        test.test_name(),
        config
    );

    let runtime = Arc::new(DockerCli::new(config.docker_command.clone()));

    run_with_runtime(test, &config, runtime).await
}

/**
   Runs a test case on the given container runtime.

   A fatal error reported by a background task ends the test early.
   The supervisor is always closed afterwards; cleanup failures are
   attached to the test failure, or reported on their own when the
   test passed.
*/
pub async fn run_with_runtime<Test: InterchainTest>(
    test: &Test,
    config: &TestConfig,
    runtime: Arc<dyn ContainerRuntime>,
) -> Result<(), Error> {
    let supervisor = Supervisor::new(test.test_name());
    let broker = DockerBroker::new(runtime, supervisor.clone(), test.test_name());
    let ctx = supervisor.context();

    let result = match supervisor.take_error_receiver() {
        Some(mut fatal) => {
            tokio::select! {
                res = test.run(&ctx, config, &broker) => res,
                Some(e) = fatal.recv() => Err(e),
            }
        }
        None => test.run(&ctx, config, &broker).await,
    };

    if let Err(e) = &result {
        error!("test {} failed: {}", test.test_name(), e);

        if config.hang_on_fail {
            suspend(test.test_name()).await;
        }
    }

    let cleanup = supervisor.close().await;

    match (result, cleanup) {
        (Ok(()), Ok(())) => {
            info!("test {} passed", test.test_name());
            Ok(())
        }
        (Ok(()), Err(cleanup)) => Err(cleanup),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => Err(e.with_cleanup_failure(cleanup)),
    }
}

/**
   Suspend the test indefinitely, keeping every container around for
   manual inspection.
*/
pub async fn suspend(test_name: &str) {
    warn!(
        "suspending test {} indefinitely. you can still interact with any spawned chains and relayers",
        test_name
    );

    core::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::mock::MockRuntime;
    use crate::docker::{ContainerSpec, ImageRef};
    use crate::error::{ErrorKind, ExitStatus};
    use std::path::PathBuf;

    enum Outcome {
        Pass,
        Fail,
        FailingCleanup,
        FatalBackground,
    }

    struct Scenario {
        outcome: Outcome,
    }

    #[async_trait]
    impl InterchainTest for Scenario {
        fn test_name(&self) -> &str {
            "base"
        }

        async fn run(
            &self,
            ctx: &Context,
            _config: &TestConfig,
            broker: &DockerBroker,
        ) -> Result<(), Error> {
            let network = broker.setup_network(ctx).await?;

            broker
                .create_container(
                    ctx,
                    ContainerSpec {
                        name: "node".to_string(),
                        image: Some(ImageRef::new("mock/node", "v1")),
                        network: Some(network),
                        ..Default::default()
                    },
                )
                .await?;

            match self.outcome {
                Outcome::Pass => Ok(()),
                Outcome::Fail => Err(Error::assertion("balances differ".to_string())),
                Outcome::FailingCleanup => {
                    broker.supervisor().register("flaky cleanup", || async {
                        Err(Error::config_invalid("flaky".to_string()))
                    });
                    Ok(())
                }
                Outcome::FatalBackground => {
                    broker.supervisor().spawn_background("watcher", async {
                        Err(Error::config_invalid("watcher gave up".to_string()))
                    });
                    ctx.sleep(core::time::Duration::from_secs(3600)).await
                }
            }
        }
    }

    fn config() -> TestConfig {
        TestConfig {
            chain_store_dir: PathBuf::from("data"),
            docker_command: "docker".to_string(),
            hang_on_fail: false,
            block_database_file: None,
            chains: Vec::new(),
        }
    }

    async fn run(outcome: Outcome) -> (MockRuntime, Result<(), Error>) {
        let runtime = MockRuntime::new();
        let result = run_with_runtime(
            &Scenario { outcome },
            &config(),
            Arc::new(runtime.clone()),
        )
        .await;

        (runtime, result)
    }

    #[tokio::test]
    async fn resources_are_removed_after_success_and_failure() {
        let (runtime, result) = run(Outcome::Pass).await;
        assert!(result.is_ok());
        assert!(runtime.resources().is_empty());

        let (runtime, result) = run(Outcome::Fail).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Assertion);
        assert_eq!(err.exit_status(), ExitStatus::AssertionFailure);
        assert!(runtime.resources().is_empty());
    }

    #[tokio::test]
    async fn cleanup_failures_do_not_hide_a_passing_run() {
        let (runtime, result) = run(Outcome::FailingCleanup).await;
        let err = result.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CleanupPartial);
        assert_eq!(err.exit_status(), ExitStatus::CleanupFailure);
        assert!(runtime.resources().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_background_errors_end_the_test() {
        let (runtime, result) = run(Outcome::FatalBackground).await;

        assert!(result.unwrap_err().to_string().contains("watcher gave up"));
        assert!(runtime.resources().is_empty());
    }
}
