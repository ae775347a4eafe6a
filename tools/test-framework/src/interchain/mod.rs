/*!
   Composition of chains, relayers and the links between them into one
   running topology.

   An [`Interchain`] is built in two phases. The `add_*` methods only
   record the topology; nothing touches the container runtime until
   [`Interchain::build`] validated all of it. Every resource created
   during the build is registered with the broker's supervisor, so a
   failed build is cleaned up like a successful one.
*/

use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::chain::{Chain, FAUCET_KEY};
use crate::docker::{DockerBroker, NetworkId};
use crate::error::{collect_results, Error};
use crate::relayer::{IdPair, RelayerDriver};
use crate::reporter::ExecReporter;
use crate::types::context::Context;
use crate::types::env::{prefix_writer, write_env, EnvWriter, ExportEnv};
use crate::types::token::{Amount, WalletAmount};
use crate::util::block_db::{open_block_database, spawn_block_collector};

pub mod link;
pub mod options;
pub mod validate;

pub use link::{ccv_channel_options, InterchainLink, ProviderConsumerLink};
pub use options::InterchainBuildOptions;

/// Name of the key each relayer signs with, on every chain it serves.
pub const RELAYER_KEY: &str = "relayer";

#[derive(Default)]
pub struct Interchain {
    chains: Vec<Arc<dyn Chain>>,
    relayers: Vec<Arc<RelayerDriver>>,
    links: Vec<InterchainLink>,
    ics_links: Vec<ProviderConsumerLink>,
    /// Topology errors found while adding members, reported by `build`.
    problems: Vec<String>,
    network: OnceCell<NetworkId>,
}

impl Interchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chain(mut self, chain: Arc<dyn Chain>) -> Self {
        if self.chain(chain.name()).is_some() {
            self.problems
                .push(format!("chain {} was added twice", chain.name()));
        }

        self.chains.push(chain);
        self
    }

    pub fn add_relayer(mut self, relayer: Arc<RelayerDriver>) -> Self {
        if self.relayer(relayer.name()).is_some() {
            self.problems
                .push(format!("relayer {} was added twice", relayer.name()));
        }

        self.relayers.push(relayer);
        self
    }

    pub fn add_link(mut self, link: InterchainLink) -> Self {
        self.check_members(&link.path, &[link.chain_a.as_str(), link.chain_b.as_str()], &link.relayer);
        self.links.push(link);
        self
    }

    pub fn add_provider_consumer_link(mut self, link: ProviderConsumerLink) -> Self {
        self.check_members(&link.path, &[link.provider.as_str(), link.consumer.as_str()], &link.relayer);
        self.ics_links.push(link);
        self
    }

    fn check_members(&mut self, path: &str, chains: &[&str], relayer: &str) {
        for chain in chains {
            if self.chain(chain).is_none() {
                self.problems.push(format!(
                    "link {path} references chain {chain}, which was not added before it"
                ));
            }
        }

        if self.relayer(relayer).is_none() {
            self.problems.push(format!(
                "link {path} references relayer {relayer}, which was not added before it"
            ));
        }
    }

    pub fn chains(&self) -> &[Arc<dyn Chain>] {
        &self.chains
    }

    pub fn relayers(&self) -> &[Arc<RelayerDriver>] {
        &self.relayers
    }

    pub fn links(&self) -> &[InterchainLink] {
        &self.links
    }

    pub fn provider_consumer_links(&self) -> &[ProviderConsumerLink] {
        &self.ics_links
    }

    pub fn chain(&self, name: &str) -> Option<&Arc<dyn Chain>> {
        self.chains.iter().find(|c| c.name() == name)
    }

    pub fn relayer(&self, name: &str) -> Option<&Arc<RelayerDriver>> {
        self.relayers.iter().find(|r| r.name() == name)
    }

    /// The network the interchain was built on.
    pub fn network(&self) -> Option<&NetworkId> {
        self.network.get()
    }

    fn require_chain(&self, name: &str) -> Result<&Arc<dyn Chain>, Error> {
        self.chain(name)
            .ok_or_else(|| Error::config_invalid(format!("no chain named {name}")))
    }

    fn require_relayer(&self, name: &str) -> Result<&Arc<RelayerDriver>, Error> {
        self.relayer(name)
            .ok_or_else(|| Error::config_invalid(format!("no relayer named {name}")))
    }

    /// Chains served by `relayer`, in declaration order.
    fn relayer_chains(&self, relayer: &str) -> Vec<&Arc<dyn Chain>> {
        let names: BTreeSet<&str> = self
            .links
            .iter()
            .filter(|l| l.relayer == relayer)
            .flat_map(|l| [l.chain_a.as_str(), l.chain_b.as_str()])
            .chain(
                self.ics_links
                    .iter()
                    .filter(|l| l.relayer == relayer)
                    .flat_map(|l| [l.provider.as_str(), l.consumer.as_str()]),
            )
            .collect();

        self.chains
            .iter()
            .filter(|c| names.contains(c.name()))
            .collect()
    }

    /**
       Bring the whole topology up.

       Chains that are not consumers start concurrently, and every one
       of them is waited for before their failures are reported. Consumers then
       start one after the other, each once its provider accepted it.
       Relayers are set up last, and every link is driven to relaying
       unless `skip_path_creation` is set. Provider-consumer links are
       always linked, since a consumer only produces validated blocks
       once its CCV channel exists.
    */
    pub async fn build(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        reporter: Option<&ExecReporter>,
        options: &InterchainBuildOptions,
    ) -> Result<(), Error> {
        let consumer_order = validate::validate(self)?;

        info!(
            "building interchain of test {} with {} chains, {} relayers and {} links",
            options.test_name,
            self.chains.len(),
            self.relayers.len(),
            self.links.len() + self.ics_links.len()
        );

        let mut fresh = false;
        let network = self
            .network
            .get_or_try_init(|| {
                fresh = true;
                async {
                    match &options.network_id {
                        Some(network) => Ok(network.clone()),
                        None => broker.setup_network(ctx).await,
                    }
                }
            })
            .await?
            .clone();

        if !fresh {
            return Err(Error::config_invalid(format!(
                "interchain of test {} was already built",
                options.test_name
            )));
        }

        let consumers: BTreeSet<&str> = self.ics_links.iter().map(|l| l.consumer.as_str()).collect();

        let launched = join_all(
            self.chains
                .iter()
                .filter(|c| !consumers.contains(c.name()))
                .map(|chain| launch_chain(ctx, broker, &network, chain.as_ref())),
        )
        .await;

        collect_results(launched)?;

        for index in consumer_order {
            self.launch_consumer(ctx, broker, &network, &self.ics_links[index])
                .await?;
        }

        for relayer in &self.relayers {
            self.setup_relayer(ctx, broker, &network, relayer, reporter, options)
                .await?;
        }

        for link in &self.links {
            let relayer = self.require_relayer(&link.relayer)?;
            let chain_a = self.require_chain(&link.chain_a)?;
            let chain_b = self.require_chain(&link.chain_b)?;

            relayer
                .generate_path(ctx, &link.path, chain_a.chain_id(), chain_b.chain_id())
                .await?;

            if options.skip_path_creation {
                debug!("leaving path {} of relayer {} unlinked", link.path, link.relayer);
                continue;
            }

            let channel_options = link
                .create_channel_opts
                .as_ref()
                .unwrap_or(&options.create_channel_opts);

            relayer.link_path(ctx, &link.path, channel_options).await?;
            relayer.start_relaying(ctx, &link.path).await?;
        }

        for link in &self.ics_links {
            self.link_consumer(ctx, link).await?;
        }

        if let Some(path) = &options.block_database_file {
            let sink = open_block_database(broker.supervisor(), path)?;

            for chain in &self.chains {
                spawn_block_collector(
                    broker.supervisor(),
                    sink.clone(),
                    &options.test_name,
                    chain.clone(),
                );
            }
        }

        if let Some(path) = &options.env_file {
            write_env(path, self)?;
            info!("wrote topology of test {} to {}", options.test_name, path.display());
        }

        info!("interchain of test {} is up", options.test_name);

        Ok(())
    }

    async fn launch_consumer(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
        link: &ProviderConsumerLink,
    ) -> Result<(), Error> {
        let provider = self.require_chain(&link.provider)?;
        let consumer = self.require_chain(&link.consumer)?;

        let ics_provider = provider.as_ics_provider().ok_or_else(|| {
            Error::unsupported_capability(
                provider.chain_id().to_string(),
                "interchain security provider".to_string(),
            )
        })?;

        let ics_consumer = consumer.as_ics_consumer().ok_or_else(|| {
            Error::unsupported_capability(
                consumer.chain_id().to_string(),
                "interchain security consumer".to_string(),
            )
        })?;

        consumer.initialize(ctx, broker, network).await?;
        consumer.init_genesis(ctx, &[]).await?;

        let proposal = ics_provider
            .submit_consumer_addition(ctx, consumer.chain_id())
            .await?;
        ics_provider.vote_on_proposal(ctx, &proposal).await?;
        ics_provider.wait_for_proposal_passed(ctx, &proposal).await?;

        info!(
            "provider {} accepted consumer {} with proposal {}",
            provider.chain_id(),
            consumer.chain_id(),
            proposal.proposal_id
        );

        let ccv_state = ics_provider.consumer_genesis(ctx, consumer.chain_id()).await?;
        let validator_keys = ics_provider.validator_keys(ctx).await?;

        ics_consumer
            .set_ccv_genesis(ctx, ccv_state, &validator_keys)
            .await?;

        consumer.start(ctx).await?;
        consumer.start_sidecars(ctx).await
    }

    async fn setup_relayer(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
        relayer: &RelayerDriver,
        reporter: Option<&ExecReporter>,
        options: &InterchainBuildOptions,
    ) -> Result<(), Error> {
        relayer
            .initialize(ctx, broker, network, reporter.cloned())
            .await?;

        for chain in self.relayer_chains(relayer.name()) {
            let endpoint = chain.relayer_endpoint().ok_or_else(|| {
                Error::unsupported_capability(chain.chain_id().to_string(), "ibc".to_string())
            })?;

            relayer.add_chain(ctx, &endpoint).await?;

            let wallet = chain
                .create_key(ctx, &format!("relayer-{}", relayer.name()))
                .await?;

            let amount = options
                .relayer_wallet_amount
                .unwrap_or(Amount(chain.config().faucet_amount.0 / 100));

            chain
                .send_funds(
                    ctx,
                    FAUCET_KEY,
                    &WalletAmount::new(wallet.address(), chain.denom(), amount),
                )
                .await?;

            relayer
                .restore_key(ctx, chain.chain_id(), RELAYER_KEY, &wallet.mnemonic)
                .await?;

            debug!(
                "relayer {} signs on {} with {}",
                relayer.name(),
                chain.chain_id(),
                wallet.address()
            );
        }

        Ok(())
    }

    async fn link_consumer(&self, ctx: &Context, link: &ProviderConsumerLink) -> Result<(), Error> {
        let relayer = self.require_relayer(&link.relayer)?;
        let provider = self.require_chain(&link.provider)?;
        let consumer = self.require_chain(&link.consumer)?;

        let (Some(ics_provider), Some(ics_consumer)) =
            (provider.as_ics_provider(), consumer.as_ics_consumer())
        else {
            return Err(Error::config_invalid(format!(
                "path {} does not connect a provider to a consumer",
                link.path
            )));
        };

        relayer
            .generate_path(ctx, &link.path, consumer.chain_id(), provider.chain_id())
            .await?;

        let clients = IdPair {
            a: ics_consumer
                .provider_client_id(ctx, provider.chain_id())
                .await?,
            b: ics_provider
                .consumer_client_id(ctx, consumer.chain_id())
                .await?,
        };

        relayer.adopt_clients(ctx, &link.path, clients).await?;
        relayer.create_connections(ctx, &link.path).await?;
        relayer
            .create_channel(ctx, &link.path, &ccv_channel_options())
            .await?;
        relayer.start_relaying(ctx, &link.path).await?;

        Ok(())
    }
}

async fn launch_chain(
    ctx: &Context,
    broker: &DockerBroker,
    network: &NetworkId,
    chain: &dyn Chain,
) -> Result<(), Error> {
    chain.initialize(ctx, broker, network).await?;
    chain.init_genesis(ctx, &[]).await?;
    chain.start(ctx).await?;
    chain.start_sidecars(ctx).await
}

impl ExportEnv for Interchain {
    fn export_env(&self, writer: &mut impl EnvWriter) {
        for chain in &self.chains {
            let mut chain_writer = prefix_writer(chain.name(), writer);

            chain_writer.write_env("CHAIN_ID", chain.chain_id());
            chain_writer.write_env("FAMILY", chain.family().as_str());
            chain_writer.write_env("DENOM", chain.denom());

            if let Some(endpoint) = chain.relayer_endpoint() {
                chain_writer.write_env("RPC_ADDR", &endpoint.rpc_address);
                chain_writer.write_env("GRPC_ADDR", &endpoint.grpc_address);
            }
        }

        for relayer in &self.relayers {
            for path in relayer.paths() {
                let prefix = format!("{}_{}", relayer.name(), path.name);
                let mut path_writer = prefix_writer(&prefix, writer);

                path_writer.write_env("STATE", path.state.as_str());

                if let Some(clients) = &path.clients {
                    path_writer.write_env("CLIENT_ID_A", &clients.a);
                    path_writer.write_env("CLIENT_ID_B", &clients.b);
                }

                if let Some(connections) = &path.connections {
                    path_writer.write_env("CONNECTION_ID_A", &connections.a);
                    path_writer.write_env("CONNECTION_ID_B", &connections.b);
                }

                for (i, channel) in path.channels.iter().enumerate() {
                    path_writer.write_env(&format!("CHANNEL_ID_A_{i}"), &channel.a_side.channel_id);
                    path_writer.write_env(&format!("CHANNEL_ID_B_{i}"), &channel.b_side.channel_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builtin::builtin_config;
    use crate::chain::mock::MockChain;
    use crate::chain::spec::IcsRole;
    use crate::chain::IcsProvider;
    use crate::docker::mock::MockRuntime;
    use crate::error::ErrorKind;
    use crate::relayer::mock::MockRelayerBackend;
    use crate::relayer::PathState;
    use crate::reporter::Reporter;
    use crate::testutil::mock_broker;

    fn mock_chain(name: &str, role: Option<IcsRole>) -> Arc<MockChain> {
        let mut config = builtin_config("mock").unwrap();
        config.name = name.to_string();
        config.chain_id = format!("{name}-1");
        config.ics_role = role;
        Arc::new(MockChain::new(config))
    }

    fn mock_relayer(name: &str) -> (MockRelayerBackend, Arc<RelayerDriver>) {
        let backend = MockRelayerBackend::new(name);
        let driver = Arc::new(RelayerDriver::new(name, Arc::new(backend.clone())));
        (backend, driver)
    }

    async fn close(broker: &DockerBroker, runtime: &MockRuntime) {
        broker.supervisor().close().await.unwrap();
        assert!(runtime.resources().is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn links_are_relaying_after_build() {
        let (runtime, broker) = mock_broker("links");
        let ctx = Context::background();
        let reporter = Reporter::in_memory();

        let (a, b) = (mock_chain("a", None), mock_chain("b", None));
        let (backend, relayer) = mock_relayer("r");

        let interchain = Interchain::new()
            .add_chain(a.clone())
            .add_chain(b.clone())
            .add_relayer(relayer.clone())
            .add_link(InterchainLink::new("ab", "a", "b", "r"));

        interchain
            .build(
                &ctx,
                &broker,
                Some(&reporter.exec_reporter("links")),
                &InterchainBuildOptions::new("links"),
            )
            .await
            .unwrap();

        let path = relayer.path("ab").unwrap();
        assert_eq!(path.state, PathState::Relaying);
        assert_eq!(path.chain_a, "a-1");
        assert_eq!(path.channels.len(), 1);
        assert_eq!(backend.chains(), vec!["a-1".to_string(), "b-1".to_string()]);

        let wallet = a.keyring().get("relayer-r").unwrap();
        assert_eq!(
            a.get_balance(&ctx, wallet.address(), "umock").await.unwrap(),
            Amount(a.config().faucet_amount.0 / 100)
        );
        assert!(backend.key_address("b-1", RELAYER_KEY).is_some());

        assert!(reporter
            .records()
            .iter()
            .any(|r| r.command.first().map(String::as_str) == Some("mock-relayer")));

        close(&broker, &runtime).await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_topologies_create_nothing() {
        let (runtime, broker) = mock_broker("invalid");

        let (_backend, relayer) = mock_relayer("r");
        let interchain = Interchain::new()
            .add_chain(mock_chain("a", None))
            .add_relayer(relayer)
            .add_link(InterchainLink::new("ab", "a", "missing", "r"));

        let err = interchain
            .build(
                &Context::background(),
                &broker,
                None,
                &InterchainBuildOptions::new("invalid"),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(runtime.resources().is_empty());
        assert_eq!(broker.supervisor().pending_cleanups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_join_after_the_proposal_and_are_always_linked() {
        let (runtime, broker) = mock_broker("ics");
        let ctx = Context::background();

        let provider = mock_chain("provider", Some(IcsRole::Provider));
        let consumer = mock_chain("consumer", Some(IcsRole::Consumer));
        let other = mock_chain("other", None);
        let (backend, relayer) = mock_relayer("r");

        let interchain = Interchain::new()
            .add_chain(provider.clone())
            .add_chain(consumer.clone())
            .add_chain(other)
            .add_relayer(relayer.clone())
            .add_link(InterchainLink::new("transfer", "provider", "other", "r"))
            .add_provider_consumer_link(ProviderConsumerLink::new(
                "provider", "consumer", "r", "ics",
            ));

        interchain
            .build(
                &ctx,
                &broker,
                None,
                &InterchainBuildOptions::new("ics").skip_path_creation(true),
            )
            .await
            .unwrap();

        assert!(consumer.ccv_genesis().is_some());
        assert_eq!(
            provider.consumer_chains(&ctx).await.unwrap(),
            vec!["consumer-1".to_string()]
        );

        assert_eq!(relayer.path_state("transfer"), PathState::Added);

        let ics = relayer.path("ics").unwrap();
        assert_eq!(ics.state, PathState::Relaying);
        assert_eq!(ics.chain_a, "consumer-1");
        assert_eq!(
            ics.clients,
            Some(IdPair {
                a: "07-tendermint-0".to_string(),
                b: "07-tendermint-0".to_string(),
            })
        );
        assert_eq!(ics.channels[0].a_side.port_id, "consumer");
        assert_eq!(backend.calls("create_clients"), 0);
        assert_eq!(backend.calls("update_clients"), 1);

        close(&broker, &runtime).await;
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_failure_after_the_proposal_fails_the_build() {
        let (runtime, broker) = mock_broker("ics-crash");
        let ctx = Context::background();

        let provider = mock_chain("provider", Some(IcsRole::Provider));

        let mut config = builtin_config("mock").unwrap();
        config.name = "consumer".to_string();
        config.chain_id = "consumer-1".to_string();
        config.ics_role = Some(IcsRole::Consumer);
        config.images[0].repository = "mock/consumer".to_string();
        runtime.mark_image_crashing("mock/consumer");

        let (_backend, relayer) = mock_relayer("r");

        let interchain = Interchain::new()
            .add_chain(provider.clone())
            .add_chain(Arc::new(MockChain::new(config)))
            .add_relayer(relayer.clone())
            .add_provider_consumer_link(ProviderConsumerLink::new(
                "provider", "consumer", "r", "ics",
            ));

        let err = interchain
            .build(&ctx, &broker, None, &InterchainBuildOptions::new("ics-crash"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Readiness);
        assert_eq!(
            provider.consumer_chains(&ctx).await.unwrap(),
            vec!["consumer-1".to_string()]
        );
        assert_eq!(relayer.path_state("ics"), PathState::None);

        close(&broker, &runtime).await;
    }

    #[tokio::test(start_paused = true)]
    async fn every_failed_chain_is_reported() {
        let (runtime, broker) = mock_broker("crashes");
        runtime.mark_image_crashing("mock/chain");

        let interchain = Interchain::new()
            .add_chain(mock_chain("alpha", None))
            .add_chain(mock_chain("beta", None));

        let err = interchain
            .build(
                &Context::background(),
                &broker,
                None,
                &InterchainBuildOptions::new("crashes"),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Readiness);
        assert!(err.to_string().contains("alpha-1"));
        assert!(err.to_string().contains("beta-1"));

        close(&broker, &runtime).await;
    }

    #[tokio::test(start_paused = true)]
    async fn topology_is_exported_as_env() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("interchain.env");
        let (runtime, broker) = mock_broker("env");

        let (_backend, relayer) = mock_relayer("r");
        let interchain = Interchain::new()
            .add_chain(mock_chain("a", None))
            .add_chain(mock_chain("b", None))
            .add_relayer(relayer)
            .add_link(InterchainLink::new("ab", "a", "b", "r"));

        interchain
            .build(
                &Context::background(),
                &broker,
                None,
                &InterchainBuildOptions::new("env").with_env_file(&env_file),
            )
            .await
            .unwrap();

        let env = std::fs::read_to_string(&env_file).unwrap();
        assert!(env.contains("A_CHAIN_ID=a-1"));
        assert!(env.contains("R_AB_STATE=RELAYING"));
        assert!(env.contains("R_AB_CHANNEL_ID_A_0=channel-0"));

        let again = interchain
            .build(
                &Context::background(),
                &broker,
                None,
                &InterchainBuildOptions::new("env"),
            )
            .await;
        assert!(again.is_err());

        close(&broker, &runtime).await;
    }
}
