/*!
   Driver for Cosmos SDK chains such as gaia and the interchain
   security provider and consumer daemons.
*/

use async_trait::async_trait;
use core::time::Duration;
use eyre::eyre;
use futures::future::try_join_all;
use serde_json::json;
use std::sync::{Mutex, OnceLock};
use tokio::time::Instant;
use tracing::{debug, info};

use self::cli::{TxOptions, DEFAULT_GAS_LIMIT};
use super::address::AddressCodec;
use super::config;
use super::keyring::Keyring;
use super::node::{create_node, gated_entrypoint, wait_until_ready, ChainNode, NodeSpec, P2P_PORT};
use super::spec::{ChainConfig, IcsRole};
use super::traits::{
    Chain, ChainCapabilities, ChainEndpoint, ConsumerProposal, IcsConsumer, IcsProvider,
    NodeHeight, FAUCET_KEY, POLL_INTERVAL,
};
use crate::docker::{DockerBroker, NetworkId};
use crate::error::{handle_generic_error, Error};
use crate::types::context::Context;
use crate::types::token::{Amount, WalletAmount};
use crate::types::wallet::Wallet;

pub mod cli;

/// Key name of the self-delegating account on every validator node.
pub const VALIDATOR_KEY: &str = "validator";

/// Minimum deposit of a governance proposal, in the staking denom.
const PROPOSAL_DEPOSIT: u128 = 10_000_000;

const PROPOSAL_PASSED: &str = "PROPOSAL_STATUS_PASSED";

/// How a chain obtains its initial validator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorGenesis {
    /// Each validator signs a gentx that is collected on the first validator.
    Gentx,
    /// The validator set comes from elsewhere: the provider for
    /// consumer chains, or node accounts for THORChain.
    External,
}

/// The operator account created on a validator node during genesis.
#[derive(Debug, Clone)]
pub struct ValidatorAccount {
    pub node_index: usize,
    pub address: String,
    pub mnemonic: String,
}

#[derive(Debug, Clone, Copy)]
struct GasSettings {
    limit: u64,
    fee: Amount,
}

pub struct CosmosChain {
    config: ChainConfig,
    keyring: Keyring,
    codec: AddressCodec,
    start_command: String,
    nodes: OnceLock<Vec<ChainNode>>,
    gas: Mutex<GasSettings>,
}

impl CosmosChain {
    pub fn new(config: ChainConfig) -> Self {
        let start_command = format!("{} start --home {}", config.binary, config.home_dir);
        Self::with_start_command(config, start_command)
    }

    /// A chain whose node daemon is launched with `start_command` instead of `<binary> start`.
    pub fn with_start_command(config: ChainConfig, start_command: impl Into<String>) -> Self {
        let fee = cli::fee_for_gas(DEFAULT_GAS_LIMIT, &config.gas_prices).unwrap_or(Amount::ZERO);

        Self {
            keyring: Keyring::new(config.chain_id.clone()),
            codec: AddressCodec::Bech32 {
                prefix: config.bech32_prefix.clone(),
            },
            start_command: start_command.into(),
            nodes: OnceLock::new(),
            gas: Mutex::new(GasSettings {
                limit: DEFAULT_GAS_LIMIT,
                fee,
            }),
            config,
        }
    }

    pub fn binary(&self) -> &str {
        &self.config.binary
    }

    pub fn codec(&self) -> &AddressCodec {
        &self.codec
    }

    pub fn nodes(&self) -> Result<&[ChainNode], Error> {
        self.nodes.get().map(|nodes| nodes.as_slice()).ok_or_else(|| {
            Error::generic(eyre!("chain {} is not initialized", self.config.chain_id))
        })
    }

    pub fn validators(&self) -> Result<Vec<&ChainNode>, Error> {
        Ok(self.nodes()?.iter().filter(|n| n.validator).collect())
    }

    /// The first validator, which holds the keyring used for transactions.
    pub fn primary(&self) -> Result<&ChainNode, Error> {
        self.nodes()?
            .first()
            .ok_or_else(|| Error::generic(eyre!("chain {} has no nodes", self.config.chain_id)))
    }

    fn gas(&self) -> GasSettings {
        match self.gas.lock() {
            Ok(gas) => *gas,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_gas(&self, settings: GasSettings) {
        match self.gas.lock() {
            Ok(mut gas) => *gas = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }

    fn coin(&self, amount: Amount) -> String {
        format!("{}{}", amount, self.config.denom)
    }

    pub fn tx_options<'a>(&'a self, from: &'a str) -> TxOptions<'a> {
        let gas = self.gas();
        TxOptions {
            chain_id: &self.config.chain_id,
            from,
            gas: gas.limit,
            fees: self.coin(gas.fee),
        }
    }

    fn wallet_from_key(&self, key_name: &str, key: cli::KeyOutput) -> Result<Wallet, Error> {
        Ok(Wallet {
            key_name: key_name.to_string(),
            mnemonic: key.mnemonic,
            raw_address: self.codec.decode(&key.address)?,
            formatted_address: key.address,
            chain_id: self.config.chain_id.clone(),
        })
    }

    /**
       Wait until a broadcast transaction is committed. A transaction
       that fails in DeliverTx is reported as `TxRejected`.
    */
    pub async fn wait_for_tx(&self, ctx: &Context, txhash: &str) -> Result<(), Error> {
        let node = self.primary()?;
        let timeout = self.config.tx_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(tx) = cli::query_tx(ctx, node, self.binary(), txhash).await? {
                if tx.code != 0 {
                    return Err(Error::tx_rejected(
                        self.config.chain_id.clone(),
                        tx.code,
                        tx.raw_log,
                    ));
                }

                debug!("tx {} committed at height {}", txhash, tx.height);
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::timeout(format!("inclusion of tx {txhash}"), timeout));
            }

            ctx.sleep(POLL_INTERVAL).await?;
        }
    }

    async fn configure_node(&self, ctx: &Context, node: &ChainNode) -> Result<(), Error> {
        cli::init(ctx, node, self.binary(), &node.name(), &self.config.chain_id).await?;

        let block_time = self.config.block_time();
        node.update_chain_config(ctx, "config/config.toml", |config| {
            config::set_timeout_commit(config, block_time)?;
            config::set_timeout_propose(config, block_time)?;
            config::set_rpc_port(config, super::node::RPC_PORT)?;
            config::set_p2p_port(config, P2P_PORT)?;
            Ok(())
        })
        .await?;

        let min_gas_price = format!("{}{}", self.config.gas_prices, self.config.denom);
        node.update_chain_config(ctx, "config/app.toml", |config| {
            config::set_minimum_gas_price(config, &min_gas_price)?;
            config::set_grpc_port(config, super::node::GRPC_PORT)?;
            config::enable_api(config, super::node::API_PORT)?;
            Ok(())
        })
        .await?;

        let denom = self.config.denom.clone();
        node.update_genesis_file(ctx, |genesis| {
            config::set_staking_denom(genesis, &denom);
            Ok(())
        })
        .await?;

        Ok(())
    }

    async fn setup_validator(
        &self,
        ctx: &Context,
        node: &ChainNode,
        validators: ValidatorGenesis,
    ) -> Result<ValidatorAccount, Error> {
        let key = cli::add_key(ctx, node, self.binary(), VALIDATOR_KEY).await?;

        let balance = self
            .config
            .validator_stake
            .checked_mul(2)
            .ok_or_else(|| eyre!("validator stake overflows"))?;

        cli::add_genesis_account(ctx, node, self.binary(), &key.address, &self.coin(balance))
            .await?;

        if validators == ValidatorGenesis::Gentx {
            cli::gentx(
                ctx,
                node,
                self.binary(),
                &self.config.chain_id,
                &self.coin(self.config.validator_stake),
            )
            .await?;
        }

        Ok(ValidatorAccount {
            node_index: node.index,
            address: key.address,
            mnemonic: key.mnemonic,
        })
    }

    /**
       Initialize every node home, create the validator operator
       accounts and fund the faucet and `additional` wallets in the
       genesis of the first validator. With [`ValidatorGenesis::Gentx`]
       the gentxs are collected as well.
    */
    pub async fn prepare_genesis(
        &self,
        ctx: &Context,
        additional: &[WalletAmount],
        validators: ValidatorGenesis,
    ) -> Result<Vec<ValidatorAccount>, Error> {
        let nodes = self.nodes()?;
        let primary = self.primary()?;

        try_join_all(nodes.iter().map(|node| self.configure_node(ctx, node))).await?;

        let accounts = try_join_all(
            nodes
                .iter()
                .filter(|node| node.validator)
                .map(|node| self.setup_validator(ctx, node, validators)),
        )
        .await?;

        for account in accounts.iter().filter(|a| a.node_index != primary.index) {
            let balance = self
                .config
                .validator_stake
                .checked_mul(2)
                .ok_or_else(|| eyre!("validator stake overflows"))?;

            cli::add_genesis_account(ctx, primary, self.binary(), &account.address, &self.coin(balance))
                .await?;
        }

        let faucet = match &self.config.faucet_mnemonic {
            Some(mnemonic) => self.recover_key(ctx, FAUCET_KEY, mnemonic).await?,
            None => self.create_key(ctx, FAUCET_KEY).await?,
        };

        cli::add_genesis_account(
            ctx,
            primary,
            self.binary(),
            faucet.address(),
            &self.coin(self.config.faucet_amount),
        )
        .await?;

        for wallet in additional {
            cli::add_genesis_account(
                ctx,
                primary,
                self.binary(),
                &wallet.address,
                &format!("{}{}", wallet.amount, wallet.denom),
            )
            .await?;
        }

        if validators == ValidatorGenesis::Gentx {
            for node in nodes.iter().filter(|n| n.validator && n.index != primary.index) {
                for file in cli::list_gentx_files(ctx, node).await? {
                    let path = format!("config/gentx/{file}");
                    let content = node.read_file(ctx, &path).await?;
                    primary.write_file(ctx, &path, &content).await?;
                }
            }

            cli::collect_gentxs(ctx, primary, self.binary()).await?;
        }

        Ok(accounts)
    }

    /**
       Apply the governance settings and genesis overrides on the first
       validator, copy the final genesis to every node and connect the
       nodes as persistent peers.
    */
    pub async fn finalize_genesis(&self, ctx: &Context) -> Result<(), Error> {
        let nodes = self.nodes()?;
        let primary = self.primary()?;

        let voting_period = self.config.voting_period.clone();
        let overrides = self.config.genesis_overrides.clone();

        let genesis = primary
            .update_genesis_file(ctx, |genesis| {
                let has_gov = genesis
                    .get("app_state")
                    .and_then(|s| s.get("gov"))
                    .is_some();

                if has_gov && !voting_period.is_empty() {
                    config::set_voting_period(genesis, &voting_period)?;
                    config::set_max_deposit_period(genesis, &voting_period)?;
                }

                for (path, value) in overrides {
                    config::set_json_path(genesis, &path, value)?;
                }

                Ok(())
            })
            .await?;

        try_join_all(
            nodes
                .iter()
                .filter(|node| node.index != primary.index || !node.validator)
                .map(|node| node.write_genesis(ctx, &genesis)),
        )
        .await?;

        let node_ids = try_join_all(
            nodes
                .iter()
                .map(|node| cli::show_node_id(ctx, node, self.binary())),
        )
        .await?;

        let peers: Vec<String> = nodes
            .iter()
            .zip(node_ids.iter())
            .map(|(node, id)| format!("{}@{}", id, node.p2p_address()))
            .collect();

        try_join_all(nodes.iter().enumerate().map(|(i, node)| {
            let others = peers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, peer)| peer.as_str())
                .collect::<Vec<_>>()
                .join(",");

            async move {
                node.update_chain_config(ctx, "config/config.toml", |config| {
                    config::set_persistent_peers(config, &others)
                })
                .await
            }
        }))
        .await?;

        info!(
            "genesis of chain {} prepared for {} nodes",
            self.config.chain_id,
            nodes.len()
        );

        Ok(())
    }

    async fn discover_static_gas(&self, ctx: &Context) -> Result<(), Error> {
        let node = self.primary()?;
        let faucet = self.keyring.get(FAUCET_KEY)?;

        let estimate = cli::estimate_send_gas(
            ctx,
            node,
            self.binary(),
            &self.config.chain_id,
            FAUCET_KEY,
            faucet.address(),
            &self.coin(Amount(1)),
        )
        .await?;

        let limit = (estimate as f64 * self.config.gas_adjustment).ceil() as u64;
        let fee = cli::fee_for_gas(limit, &self.config.gas_prices)?;

        debug!(
            "static gas of chain {}: limit {} fee {}",
            self.config.chain_id,
            limit,
            self.coin(fee)
        );

        self.set_gas(GasSettings { limit, fee });

        Ok(())
    }

    fn ics_role(&self) -> Option<IcsRole> {
        self.config.ics_role
    }
}

/// The IBC revision number encoded in a chain-id such as `gaia-3`.
pub fn revision_number(chain_id: &str) -> u64 {
    chain_id
        .rsplit_once('-')
        .and_then(|(_, revision)| revision.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl Chain for CosmosChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    fn capabilities(&self) -> ChainCapabilities {
        ChainCapabilities {
            memo_transfers: true,
            ibc: true,
            ics_provider: self.ics_role() == Some(IcsRole::Provider),
            ics_consumer: self.ics_role() == Some(IcsRole::Consumer),
            sidecars: false,
        }
    }

    fn static_gas(&self) -> Amount {
        self.gas().fee
    }

    async fn initialize(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
    ) -> Result<(), Error> {
        let image = self
            .config
            .node_image()
            .ok_or_else(|| Error::config_invalid(format!("chain {} has no image", self.config.name)))?;

        let entrypoint = gated_entrypoint(&self.config.home_dir, &self.start_command);

        let specs = (0..self.config.num_validators)
            .map(|index| (index, true))
            .chain((0..self.config.num_full_nodes).map(|index| (index, false)));

        let nodes = try_join_all(specs.map(|(index, validator)| {
            create_node(
                ctx,
                broker,
                network,
                NodeSpec {
                    chain_id: &self.config.chain_id,
                    index,
                    validator,
                    image,
                    home_dir: &self.config.home_dir,
                    entrypoint: entrypoint.clone(),
                    env: Vec::new(),
                },
            )
        }))
        .await?;

        info!(
            "created {} nodes for chain {}",
            nodes.len(),
            self.config.chain_id
        );

        self.nodes
            .set(nodes)
            .map_err(|_| Error::generic(eyre!("chain {} initialized twice", self.config.chain_id)))
    }

    async fn init_genesis(&self, ctx: &Context, additional: &[WalletAmount]) -> Result<(), Error> {
        let validators = match self.ics_role() {
            Some(IcsRole::Consumer) => ValidatorGenesis::External,
            _ => ValidatorGenesis::Gentx,
        };

        self.prepare_genesis(ctx, additional, validators).await?;
        self.finalize_genesis(ctx).await
    }

    async fn start(&self, ctx: &Context) -> Result<(), Error> {
        let nodes = self.nodes()?;

        try_join_all(nodes.iter().map(|node| node.release(ctx))).await?;

        let timeout = self.config.readiness_timeout();
        try_join_all(nodes.iter().map(|node| {
            wait_until_ready(ctx, node, timeout, 1, move || {
                cli::status_height(ctx, node, self.binary())
            })
        }))
        .await?;

        self.discover_static_gas(ctx).await?;

        info!("chain {} is producing blocks", self.config.chain_id);

        Ok(())
    }

    async fn node_heights(&self, ctx: &Context) -> Result<Vec<NodeHeight>, Error> {
        let nodes = self.nodes()?;

        try_join_all(nodes.iter().map(|node| async move {
            let height = cli::status_height(ctx, node, self.binary()).await?;
            Ok::<_, Error>(NodeHeight {
                node: node.name(),
                height,
            })
        }))
        .await
    }

    async fn get_balance(
        &self,
        ctx: &Context,
        address: &str,
        denom: &str,
    ) -> Result<Amount, Error> {
        cli::query_balance(ctx, self.primary()?, self.binary(), address, denom).await
    }

    async fn send_funds_with_memo(
        &self,
        ctx: &Context,
        key_name: &str,
        amount: &WalletAmount,
        memo: &str,
    ) -> Result<String, Error> {
        self.keyring.get(key_name)?;
        let _guard = self.keyring.lock_key(key_name).await;

        let options = self.tx_options(key_name);
        let coin = format!("{}{}", amount.amount, amount.denom);

        let response = cli::bank_send(
            ctx,
            self.primary()?,
            self.binary(),
            &options,
            &amount.address,
            &coin,
            memo,
        )
        .await?;

        self.wait_for_tx(ctx, &response.txhash).await?;

        debug!(
            "sent {} from {} on chain {} in tx {}",
            amount, key_name, self.config.chain_id, response.txhash
        );

        Ok(response.txhash)
    }

    async fn create_key(&self, ctx: &Context, key_name: &str) -> Result<Wallet, Error> {
        let key = cli::add_key(ctx, self.primary()?, self.binary(), key_name).await?;
        let wallet = self.wallet_from_key(key_name, key)?;

        self.keyring.insert(wallet.clone());

        Ok(wallet)
    }

    async fn recover_key(
        &self,
        ctx: &Context,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<Wallet, Error> {
        let key = cli::recover_key(
            ctx,
            self.primary()?,
            self.binary(),
            key_name,
            mnemonic,
            self.config.coin_type,
        )
        .await?;
        let wallet = self.wallet_from_key(key_name, key)?;

        self.keyring.insert(wallet.clone());

        Ok(wallet)
    }

    fn as_ics_provider(&self) -> Option<&dyn IcsProvider> {
        match self.ics_role() {
            Some(IcsRole::Provider) => Some(self),
            _ => None,
        }
    }

    fn as_ics_consumer(&self) -> Option<&dyn IcsConsumer> {
        match self.ics_role() {
            Some(IcsRole::Consumer) => Some(self),
            _ => None,
        }
    }

    fn relayer_endpoint(&self) -> Option<ChainEndpoint> {
        let node = self.primary().ok()?;

        Some(ChainEndpoint {
            chain_id: self.config.chain_id.clone(),
            name: self.config.name.clone(),
            family: self.config.family,
            rpc_address: node.rpc_address(),
            grpc_address: node.grpc_address(),
            account_prefix: self.config.bech32_prefix.clone(),
            denom: self.config.denom.clone(),
            gas_price: self.config.gas_prices.clone(),
            gas_adjustment: self.config.gas_adjustment,
            trusting_period: self.config.trusting_period.clone(),
            coin_type: self.config.coin_type,
            ccv_consumer: self.ics_role() == Some(IcsRole::Consumer),
        })
    }
}

/**
   The `consumer-addition` proposal document understood by the
   interchain security provider module.
*/
pub fn consumer_addition_proposal(
    consumer_chain_id: &str,
    spawn_time: &str,
    deposit: &str,
) -> serde_json::Value {
    json!({
        "title": format!("Add consumer chain {consumer_chain_id}"),
        "summary": format!("Launch {consumer_chain_id} as a consumer chain"),
        "description": format!("Launch {consumer_chain_id} as a consumer chain"),
        "chain_id": consumer_chain_id,
        "initial_height": {
            "revision_number": revision_number(consumer_chain_id),
            "revision_height": 1
        },
        "genesis_hash": "Z2VuX2hhc2g=",
        "binary_hash": "YmluX2hhc2g=",
        "spawn_time": spawn_time,
        "unbonding_period": 1_728_000_000_000_000u64,
        "ccv_timeout_period": 2_419_200_000_000_000u64,
        "transfer_timeout_period": 3_600_000_000_000u64,
        "consumer_redistribution_fraction": "0.75",
        "blocks_per_distribution_transmission": 1000,
        "historical_entries": 10000,
        "distribution_transmission_channel": "",
        "deposit": deposit
    })
}

#[async_trait]
impl IcsProvider for CosmosChain {
    async fn submit_consumer_addition(
        &self,
        ctx: &Context,
        consumer_chain_id: &str,
    ) -> Result<ConsumerProposal, Error> {
        let node = self.primary()?;

        let spawn_time = node
            .container
            .exec_checked(ctx, &["date", "-u", "+%Y-%m-%dT%H:%M:%SZ"])
            .await?
            .stdout
            .trim()
            .to_string();

        let proposal = consumer_addition_proposal(
            consumer_chain_id,
            &spawn_time,
            &self.coin(Amount(PROPOSAL_DEPOSIT)),
        );

        let file = format!("consumer_proposal_{consumer_chain_id}.json");
        let content = serde_json::to_string_pretty(&proposal).map_err(handle_generic_error)?;
        node.write_file(ctx, &file, &content).await?;

        let response = {
            let _guard = self.keyring.lock_key(VALIDATOR_KEY).await;
            let response = cli::submit_consumer_addition(
                ctx,
                node,
                self.binary(),
                &self.tx_options(VALIDATOR_KEY),
                &node.home_path(&file),
            )
            .await?;
            self.wait_for_tx(ctx, &response.txhash).await?;
            response
        };

        let proposal_id = cli::latest_proposal_id(ctx, node, self.binary()).await?;

        info!(
            "submitted consumer addition proposal {} for {} on {} in tx {}",
            proposal_id, consumer_chain_id, self.config.chain_id, response.txhash
        );

        Ok(ConsumerProposal {
            proposal_id,
            consumer_chain_id: consumer_chain_id.to_string(),
        })
    }

    async fn vote_on_proposal(
        &self,
        ctx: &Context,
        proposal: &ConsumerProposal,
    ) -> Result<(), Error> {
        let validators = self.validators()?;
        let options = self.tx_options(VALIDATOR_KEY);

        try_join_all(validators.into_iter().map(|node| {
            let options = options.clone();
            async move {
                let response =
                    cli::vote_yes(ctx, node, self.binary(), &options, proposal.proposal_id).await?;
                debug!(
                    "validator {} voted yes on proposal {} in tx {}",
                    node.name(),
                    proposal.proposal_id,
                    response.txhash
                );
                Ok::<_, Error>(())
            }
        }))
        .await?;

        Ok(())
    }

    async fn wait_for_proposal_passed(
        &self,
        ctx: &Context,
        proposal: &ConsumerProposal,
    ) -> Result<(), Error> {
        let node = self.primary()?;
        let voting_period = parse_duration(&self.config.voting_period).unwrap_or_default();
        let timeout = voting_period + self.config.tx_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            let status = cli::proposal_status(ctx, node, self.binary(), proposal.proposal_id).await?;

            match status.as_str() {
                PROPOSAL_PASSED => {
                    info!(
                        "proposal {} on chain {} passed",
                        proposal.proposal_id, self.config.chain_id
                    );
                    return Ok(());
                }
                "PROPOSAL_STATUS_REJECTED" | "PROPOSAL_STATUS_FAILED" => {
                    return Err(Error::generic(eyre!(
                        "proposal {} for consumer {} ended with status {}",
                        proposal.proposal_id,
                        proposal.consumer_chain_id,
                        status
                    )));
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(Error::timeout(
                    format!("proposal {} to pass", proposal.proposal_id),
                    timeout,
                ));
            }

            ctx.sleep(POLL_INTERVAL).await?;
        }
    }

    async fn consumer_genesis(
        &self,
        ctx: &Context,
        consumer_chain_id: &str,
    ) -> Result<serde_json::Value, Error> {
        cli::consumer_genesis(ctx, self.primary()?, self.binary(), consumer_chain_id).await
    }

    async fn validator_keys(&self, ctx: &Context) -> Result<Vec<String>, Error> {
        try_join_all(
            self.validators()?
                .into_iter()
                .map(|node| node.read_file(ctx, "config/priv_validator_key.json")),
        )
        .await
    }

    async fn consumer_chains(&self, ctx: &Context) -> Result<Vec<String>, Error> {
        cli::list_consumer_chains(ctx, self.primary()?, self.binary()).await
    }

    async fn consumer_client_id(
        &self,
        ctx: &Context,
        consumer_chain_id: &str,
    ) -> Result<String, Error> {
        cli::client_for_chain(ctx, self.primary()?, self.binary(), consumer_chain_id).await
    }
}

#[async_trait]
impl IcsConsumer for CosmosChain {
    async fn set_ccv_genesis(
        &self,
        ctx: &Context,
        ccv_state: serde_json::Value,
        validator_keys: &[String],
    ) -> Result<(), Error> {
        let nodes = self.nodes()?;

        try_join_all(nodes.iter().map(|node| {
            let ccv_state = ccv_state.clone();
            async move {
                node.update_genesis_file(ctx, |genesis| {
                    config::set_json_path(genesis, "app_state.ccvconsumer", ccv_state)
                })
                .await
            }
        }))
        .await?;

        for (node, key) in nodes
            .iter()
            .filter(|n| n.validator)
            .zip(validator_keys.iter())
        {
            node.write_file(ctx, "config/priv_validator_key.json", key)
                .await?;
        }

        info!(
            "installed ccv genesis and {} validator keys on consumer {}",
            validator_keys.len(),
            self.config.chain_id
        );

        Ok(())
    }

    async fn provider_client_id(
        &self,
        ctx: &Context,
        provider_chain_id: &str,
    ) -> Result<String, Error> {
        cli::client_for_chain(ctx, self.primary()?, self.binary(), provider_chain_id).await
    }
}

/**
   Parse a Go-style duration with a single unit, such as `"15s"`,
   `"500ms"`, `"336h"` or `"2m"`.
*/
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;

    match unit {
        "ms" => Some(Duration::from_millis(number)),
        "s" => Some(Duration::from_secs(number)),
        "m" => Some(Duration::from_secs(number * 60)),
        "h" => Some(Duration::from_secs(number * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builtin::builtin_config;

    #[test]
    fn revision_numbers_follow_chain_ids() {
        assert_eq!(revision_number("consumer-2"), 2);
        assert_eq!(revision_number("thorchain"), 0);
        assert_eq!(revision_number("ics-consumer-1"), 1);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("336h"), Some(Duration::from_secs(336 * 3600)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn proposal_names_the_consumer() {
        let proposal = consumer_addition_proposal("consumer-1", "2024-01-01T00:00:00Z", "10uatom");

        assert_eq!(proposal["chain_id"], "consumer-1");
        assert_eq!(proposal["initial_height"]["revision_number"], 1);
        assert_eq!(proposal["deposit"], "10uatom");
    }

    #[test]
    fn capabilities_follow_the_ics_role() {
        let mut config = builtin_config("ics-provider").unwrap();
        config.chain_id = "provider-1".to_string();
        let provider = CosmosChain::new(config);

        assert!(provider.capabilities().ics_provider);
        assert!(provider.as_ics_provider().is_some());
        assert!(provider.as_ics_consumer().is_none());

        let mut config = builtin_config("gaia").unwrap();
        config.chain_id = "gaia-1".to_string();
        let gaia = CosmosChain::new(config);

        assert!(!gaia.capabilities().ics_provider);
        assert!(gaia.as_ics_provider().is_none());
        assert_eq!(gaia.static_gas(), Amount(2_000));
        assert!(gaia.relayer_endpoint().is_none());
    }
}
