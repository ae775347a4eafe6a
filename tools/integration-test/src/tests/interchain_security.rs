//! A provider chain and one consumer chain secured by it. The build
//! only succeeds once the consumer-addition proposal passed, so the
//! provider lists the consumer afterwards and both chains make blocks.

use interchain_test_framework::prelude::*;
use interchain_test_framework::testutil::wait_for_blocks;

use crate::util::{build_options, hermes};

#[tokio::test(flavor = "multi_thread")]
async fn test_provider_consumer() -> Result<(), Error> {
    run_interchain_test(&ProviderConsumerTest).await
}

pub struct ProviderConsumerTest;

#[async_trait]
impl InterchainTest for ProviderConsumerTest {
    fn test_name(&self) -> &str {
        "provider-consumer"
    }

    async fn run(
        &self,
        ctx: &Context,
        config: &TestConfig,
        broker: &DockerBroker,
    ) -> Result<(), Error> {
        let chains = ChainFactory::new([
            ChainSpec::new("prov")
                .with_chain_name("ics-provider")
                .with_validators(1)
                .with_full_nodes(0),
            ChainSpec::new("cons")
                .with_chain_name("ics-consumer")
                .with_validators(1)
                .with_full_nodes(0),
        ])
        .chains(self.test_name())?;

        let relayer = hermes();

        let interchain = Interchain::new()
            .add_chain(chains[0].clone())
            .add_chain(chains[1].clone())
            .add_relayer(relayer.clone())
            .add_provider_consumer_link(ProviderConsumerLink::new(
                "prov",
                "cons",
                "hermes",
                "ics-path",
            ));

        interchain
            .build(ctx, broker, None, &build_options(config, self.test_name()))
            .await?;

        let provider = chains[0]
            .as_ics_provider()
            .ok_or_else(|| eyre!("chain prov is not a provider"))?;

        let consumers = provider.consumer_chains(ctx).await?;
        info!("provider {} secures {:?}", chains[0].chain_id(), consumers);

        if !consumers.iter().any(|id| id == chains[1].chain_id()) {
            return Err(Error::assertion(format!(
                "consumer {} is missing from provider state {:?}",
                chains[1].chain_id(),
                consumers
            )));
        }

        wait_for_blocks(ctx, 1, interchain.chains()).await?;

        for chain in interchain.chains() {
            assert_gt("chain height", &chain.height(ctx).await?, &0)?;
        }

        assert_eq(
            "ccv path state",
            &relayer.path_state("ics-path"),
            &PathState::Relaying,
        )?;

        Ok(())
    }
}
