//! A single THORChain node: native transfers pay the fixed native fee
//! and the mimir table is readable through the REST API.

use interchain_test_framework::prelude::*;

use crate::util::build_options;

#[tokio::test(flavor = "multi_thread")]
async fn test_thorchain_native_transfer() -> Result<(), Error> {
    run_interchain_test(&ThorchainTest).await
}

pub struct ThorchainTest;

#[async_trait]
impl InterchainTest for ThorchainTest {
    fn test_name(&self) -> &str {
        "thorchain"
    }

    async fn run(
        &self,
        ctx: &Context,
        config: &TestConfig,
        broker: &DockerBroker,
    ) -> Result<(), Error> {
        let chains = ChainFactory::new([ChainSpec::new("thorchain")]).chains(self.test_name())?;
        let thorchain = chains[0].clone();

        let interchain = Interchain::new().add_chain(thorchain.clone());

        interchain
            .build(ctx, broker, None, &build_options(config, self.test_name()))
            .await?;

        let api = thorchain
            .as_thorchain()
            .ok_or_else(|| eyre!("chain {} has no thorchain api", thorchain.chain_id()))?;

        let mimirs = api.mimirs(ctx).await?;
        info!("thorchain starts with {} mimir values", mimirs.len());

        let denom = thorchain.denom().to_string();
        let funded = Amount(10_000_000_000);

        let users = get_and_fund_test_users(ctx, "thor", funded, &chains).await?;
        let receiver = thorchain.create_key(ctx, "receiver").await?;

        thorchain
            .send_funds_with_memo(
                ctx,
                &users[0].key_name,
                &WalletAmount::new(receiver.address(), &denom, Amount(100_000_000)),
                "integration transfer",
            )
            .await?;

        assert_eq(
            "sender balance",
            &thorchain.get_balance(ctx, users[0].address(), &denom).await?,
            &(funded - Amount(100_000_000) - thorchain.static_gas()),
        )?;

        assert_eq(
            "receiver balance",
            &thorchain.get_balance(ctx, receiver.address(), &denom).await?,
            &Amount(100_000_000),
        )?;

        Ok(())
    }
}
