/*!
   The capability set every chain driver implements.
*/

use async_trait::async_trait;
use core::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::chain_type::ChainFamily;
use super::keyring::Keyring;
use super::spec::ChainConfig;
use crate::docker::{DockerBroker, NetworkId};
use crate::error::Error;
use crate::types::context::Context;
use crate::types::token::{Amount, WalletAmount};
use crate::types::wallet::Wallet;

/// Key name of the account holding the genesis faucet funds.
pub const FAUCET_KEY: &str = "faucet";

/// Interval at which heights and balances are polled.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a chain driver can do beyond the common operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainCapabilities {
    pub memo_transfers: bool,
    pub ibc: bool,
    pub ics_provider: bool,
    pub ics_consumer: bool,
    pub sidecars: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHeight {
    pub node: String,
    pub height: u64,
}

/**
   Connection details a relayer needs to talk to a chain.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEndpoint {
    pub chain_id: String,
    pub name: String,
    pub family: ChainFamily,
    pub rpc_address: String,
    pub grpc_address: String,
    pub account_prefix: String,
    pub denom: String,
    pub gas_price: String,
    pub gas_adjustment: f64,
    pub trusting_period: String,
    pub coin_type: u32,
    pub ccv_consumer: bool,
}

/**
   A running chain of any family.

   Drivers are shared as `Arc<dyn Chain>` between the assembler, the
   relayers and the scenario. All mutation goes through these methods.
*/
#[async_trait]
pub trait Chain: Send + Sync + 'static {
    fn config(&self) -> &ChainConfig;

    fn keyring(&self) -> &Keyring;

    fn capabilities(&self) -> ChainCapabilities;

    /// Fee paid by the sender of a plain transfer, in the native denom.
    fn static_gas(&self) -> Amount;

    fn name(&self) -> &str {
        &self.config().name
    }

    fn chain_id(&self) -> &str {
        &self.config().chain_id
    }

    fn family(&self) -> ChainFamily {
        self.config().family
    }

    fn denom(&self) -> &str {
        &self.config().denom
    }

    /// Create the node containers (validators, then full nodes) on the shared network.
    async fn initialize(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
    ) -> Result<(), Error>;

    /// Build the genesis state, crediting `additional` wallets on top of the faucet.
    async fn init_genesis(&self, ctx: &Context, additional: &[WalletAmount]) -> Result<(), Error>;

    /// Launch every node and wait until all of them produce blocks.
    async fn start(&self, ctx: &Context) -> Result<(), Error>;

    /// Start auxiliary processes once validators are live.
    async fn start_sidecars(&self, _ctx: &Context) -> Result<(), Error> {
        Ok(())
    }

    async fn node_heights(&self, ctx: &Context) -> Result<Vec<NodeHeight>, Error>;

    async fn height(&self, ctx: &Context) -> Result<u64, Error> {
        let heights = self.node_heights(ctx).await?;
        Ok(heights.iter().map(|h| h.height).max().unwrap_or(0))
    }

    async fn get_balance(&self, ctx: &Context, address: &str, denom: &str)
        -> Result<Amount, Error>;

    async fn send_funds(
        &self,
        ctx: &Context,
        key_name: &str,
        amount: &WalletAmount,
    ) -> Result<String, Error> {
        self.send_funds_with_memo(ctx, key_name, amount, "").await
    }

    /// Transfer funds with a memo that is observable on chain. Returns the transaction hash.
    async fn send_funds_with_memo(
        &self,
        ctx: &Context,
        key_name: &str,
        amount: &WalletAmount,
        memo: &str,
    ) -> Result<String, Error>;

    async fn create_key(&self, ctx: &Context, key_name: &str) -> Result<Wallet, Error>;

    async fn recover_key(
        &self,
        ctx: &Context,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<Wallet, Error>;

    async fn get_address(&self, _ctx: &Context, key_name: &str) -> Result<String, Error> {
        Ok(self.keyring().get(key_name)?.formatted_address)
    }

    /**
       Wait until every node advanced by `blocks`. Fails with
       `HeightStalled` when no node makes progress for the chain's
       stall timeout.
    */
    async fn wait_for_blocks(&self, ctx: &Context, blocks: u64) -> Result<(), Error> {
        let start = self.node_heights(ctx).await?;
        let targets: Vec<u64> = start.iter().map(|h| h.height + blocks).collect();

        debug!(
            "waiting for {} blocks on chain {} from heights {:?}",
            blocks,
            self.chain_id(),
            start.iter().map(|h| h.height).collect::<Vec<_>>()
        );

        let stall_timeout = self.config().stall_timeout();
        let mut last = start;
        let mut last_progress = Instant::now();

        loop {
            let heights = self.node_heights(ctx).await?;

            if heights
                .iter()
                .zip(targets.iter())
                .all(|(h, target)| h.height >= *target)
            {
                return Ok(());
            }

            let progressed = heights
                .iter()
                .zip(last.iter())
                .any(|(now, before)| now.height > before.height);

            if progressed {
                last_progress = Instant::now();
            } else if last_progress.elapsed() >= stall_timeout {
                let slowest = heights
                    .iter()
                    .zip(targets.iter())
                    .find(|(h, target)| h.height < **target)
                    .map(|(h, _)| h.clone())
                    .unwrap_or_else(|| NodeHeight {
                        node: String::new(),
                        height: 0,
                    });

                return Err(Error::height_stalled(
                    self.chain_id().to_string(),
                    slowest.node,
                    slowest.height,
                ));
            }

            trace!("chain {} at heights {:?}", self.chain_id(), heights);

            last = heights;
            ctx.sleep(POLL_INTERVAL).await?;
        }
    }

    fn as_ics_provider(&self) -> Option<&dyn IcsProvider> {
        None
    }

    fn as_ics_consumer(&self) -> Option<&dyn IcsConsumer> {
        None
    }

    fn as_thorchain(&self) -> Option<&dyn ThorchainApi> {
        None
    }

    /// Connection details for relayers, for chains that support IBC.
    fn relayer_endpoint(&self) -> Option<ChainEndpoint> {
        None
    }
}

/// A consumer addition proposal submitted to a provider chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerProposal {
    pub proposal_id: u64,
    pub consumer_chain_id: String,
}

/**
   Operations of an interchain security provider chain.
*/
#[async_trait]
pub trait IcsProvider: Send + Sync {
    async fn submit_consumer_addition(
        &self,
        ctx: &Context,
        consumer_chain_id: &str,
    ) -> Result<ConsumerProposal, Error>;

    /// Vote yes from every validator.
    async fn vote_on_proposal(&self, ctx: &Context, proposal: &ConsumerProposal)
        -> Result<(), Error>;

    /// Wait until the proposal passed, or fail once it is rejected.
    async fn wait_for_proposal_passed(
        &self,
        ctx: &Context,
        proposal: &ConsumerProposal,
    ) -> Result<(), Error>;

    /// The CCV consumer genesis state the provider exports for a consumer.
    async fn consumer_genesis(
        &self,
        ctx: &Context,
        consumer_chain_id: &str,
    ) -> Result<serde_json::Value, Error>;

    /// Consensus keys of the validators, which the consumer validators reuse.
    async fn validator_keys(&self, ctx: &Context) -> Result<Vec<String>, Error>;

    async fn consumer_chains(&self, ctx: &Context) -> Result<Vec<String>, Error>;

    /// The provider-side light client tracking `consumer_chain_id`.
    async fn consumer_client_id(&self, ctx: &Context, consumer_chain_id: &str)
        -> Result<String, Error>;
}

/**
   Operations of an interchain security consumer chain.
*/
#[async_trait]
pub trait IcsConsumer: Send + Sync {
    /// Install the CCV genesis and validator keys. Must happen before start.
    async fn set_ccv_genesis(
        &self,
        ctx: &Context,
        ccv_state: serde_json::Value,
        validator_keys: &[String],
    ) -> Result<(), Error>;

    /// The consumer-side light client of the provider, created from the CCV genesis.
    async fn provider_client_id(&self, ctx: &Context, provider_chain_id: &str)
        -> Result<String, Error>;
}

/// An inbound vault address reported by THORChain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAddress {
    pub chain: String,
    pub address: String,
    pub router: Option<String>,
    pub halted: bool,
}

/**
   Operations specific to THORChain.
*/
#[async_trait]
pub trait ThorchainApi: Send + Sync {
    /// Native `MsgDeposit` carrying `memo`.
    async fn deposit(
        &self,
        ctx: &Context,
        key_name: &str,
        amount: Amount,
        denom: &str,
        memo: &str,
    ) -> Result<String, Error>;

    async fn set_mimir(
        &self,
        ctx: &Context,
        key_name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    async fn mimirs(&self, ctx: &Context) -> Result<serde_json::Map<String, serde_json::Value>, Error>;

    async fn inbound_address(&self, ctx: &Context, chain: &str) -> Result<InboundAddress, Error>;

    /// Raw GET against the THORNode REST API, e.g. `/thorchain/pools`.
    async fn api_get(&self, ctx: &Context, path: &str) -> Result<serde_json::Value, Error>;
}
