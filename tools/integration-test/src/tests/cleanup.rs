//! A chain whose image tag does not exist fails the build. Closing the
//! supervisor afterwards leaves no container, volume or network of the
//! test behind.

use interchain_test_framework::docker::TEST_NAME_LABEL;
use interchain_test_framework::prelude::*;
use tokio::process::Command;

use crate::util::build_options;

#[tokio::test(flavor = "multi_thread")]
async fn test_cleanup_under_failure() -> Result<(), Error> {
    run_interchain_test(&CleanupTest).await
}

pub struct CleanupTest;

async fn labelled(docker: &str, kind: &str, test_name: &str) -> Result<Vec<String>, Error> {
    let filter = format!("label={TEST_NAME_LABEL}={test_name}");
    let mut args = vec![kind, "ls", "-q", "--filter", &filter];

    if kind == "container" {
        args.push("--all");
    }

    let output = Command::new(docker).args(&args).output().await?;

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| line.to_string())
        .collect())
}

#[async_trait]
impl InterchainTest for CleanupTest {
    fn test_name(&self) -> &str {
        "cleanup-under-failure"
    }

    async fn run(
        &self,
        ctx: &Context,
        config: &TestConfig,
        broker: &DockerBroker,
    ) -> Result<(), Error> {
        let chains = ChainFactory::new([
            ChainSpec::new("healthy")
                .with_chain_name("gaia")
                .with_validators(1)
                .with_full_nodes(0),
            ChainSpec::new("broken")
                .with_chain_name("gaia")
                .with_version("v0.0.0-does-not-exist")
                .with_validators(1)
                .with_full_nodes(0),
        ])
        .chains(self.test_name())?;

        let interchain = Interchain::new()
            .add_chain(chains[0].clone())
            .add_chain(chains[1].clone());

        let result = interchain
            .build(ctx, broker, None, &build_options(config, self.test_name()))
            .await;

        match result {
            Err(e) if matches!(e.kind(), ErrorKind::Readiness | ErrorKind::ImageUnavailable) => {
                info!("build failed as expected: {}", e);
            }
            other => {
                return Err(Error::assertion(format!(
                    "expected the broken chain to fail the build, got {other:?}"
                )))
            }
        }

        broker.supervisor().close().await?;
        broker.supervisor().close().await?;

        for kind in ["container", "volume", "network"] {
            let left = labelled(&config.docker_command, kind, self.test_name()).await?;
            assert_eq(&format!("{kind}s left behind"), &left, &Vec::<String>::new())?;
        }

        Ok(())
    }
}
