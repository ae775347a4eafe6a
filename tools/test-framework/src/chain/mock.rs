/*!
   An in-memory chain for exercising the engine without real nodes.

   The node containers are still created through the broker, so
   readiness failures and cleanup behave as with a real chain, but
   balances, transfers and governance live in a ledger held by the
   driver. Heights advance with the wall clock (one block per
   `block_time`), which lets tests drive them with a paused tokio clock.
*/

use async_trait::async_trait;
use eyre::eyre;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tokio::time::Instant;
use tracing::{debug, info};

use super::address::AddressCodec;
use super::cosmos::cli::{fee_for_gas, DEFAULT_GAS_LIMIT};
use super::keyring::Keyring;
use super::node::{create_node, gated_entrypoint, wait_until_ready, ChainNode, NodeSpec};
use super::spec::{ChainConfig, IcsRole};
use super::traits::{
    Chain, ChainCapabilities, ChainEndpoint, ConsumerProposal, IcsConsumer, IcsProvider,
    NodeHeight, FAUCET_KEY,
};
use crate::docker::{ContainerState, DockerBroker, NetworkId};
use crate::error::Error;
use crate::types::context::Context;
use crate::types::token::{Amount, WalletAmount};
use crate::types::wallet::Wallet;
use crate::util::random::{random_hash, random_string};

const ADDRESS_LEN: usize = 20;

/// A transfer recorded by a [`MockChain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTx {
    pub hash: String,
    pub height: u64,
    pub from: String,
    pub to: String,
    pub amount: Amount,
    pub denom: String,
    pub memo: String,
}

#[derive(Debug, Default)]
struct Ledger {
    balances: BTreeMap<(String, String), Amount>,
    txs: Vec<MockTx>,
    next_proposal: u64,
    votes: BTreeMap<u64, usize>,
    consumers: Vec<String>,
    ccv_genesis: Option<Value>,
    /// Height at which the chain stopped producing blocks.
    halted_at: Option<u64>,
}

impl Ledger {
    fn balance(&self, address: &str, denom: &str) -> Amount {
        self.balances
            .get(&(address.to_string(), denom.to_string()))
            .copied()
            .unwrap_or_default()
    }

    fn credit(&mut self, address: &str, denom: &str, amount: Amount) {
        let balance = self
            .balances
            .entry((address.to_string(), denom.to_string()))
            .or_default();
        *balance = *balance + amount;
    }

    /// Callers check the balance first.
    fn debit(&mut self, address: &str, denom: &str, amount: Amount) {
        let balance = self
            .balances
            .entry((address.to_string(), denom.to_string()))
            .or_default();
        *balance = *balance - amount;
    }
}

pub struct MockChain {
    config: ChainConfig,
    keyring: Keyring,
    codec: AddressCodec,
    nodes: OnceLock<Vec<ChainNode>>,
    started_at: OnceLock<Instant>,
    ledger: Mutex<Ledger>,
}

/// Derive the address bytes of a mock key from its mnemonic.
fn derive_address(mnemonic: &str) -> Vec<u8> {
    let mut raw = [0u8; ADDRESS_LEN];

    for (i, b) in mnemonic.bytes().enumerate() {
        let slot = &mut raw[i % ADDRESS_LEN];
        *slot = slot.rotate_left(3) ^ b;
    }

    raw.to_vec()
}

fn random_mnemonic() -> String {
    (0..24).map(|_| random_string(5)).collect::<Vec<_>>().join(" ")
}

impl MockChain {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            keyring: Keyring::new(config.chain_id.clone()),
            codec: AddressCodec::Bech32 {
                prefix: config.bech32_prefix.clone(),
            },
            nodes: OnceLock::new(),
            started_at: OnceLock::new(),
            ledger: Mutex::new(Ledger::default()),
            config,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        match self.ledger.lock() {
            Ok(ledger) => ledger,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn nodes(&self) -> &[ChainNode] {
        self.nodes.get().map(|n| n.as_slice()).unwrap_or_default()
    }

    fn ics_role(&self) -> Option<IcsRole> {
        self.config.ics_role
    }

    fn current_height(&self) -> u64 {
        let Some(started_at) = self.started_at.get() else {
            return 0;
        };

        let block_ms = self.config.block_time_ms.max(1) as u128;
        let height = 1 + (started_at.elapsed().as_millis() / block_ms) as u64;

        match self.ledger().halted_at {
            Some(halted) => height.min(halted),
            None => height,
        }
    }

    /// Credit `amount` to `address` out of thin air.
    pub fn credit(&self, address: &str, denom: &str, amount: Amount) {
        self.ledger().credit(address, denom, amount);
    }

    /// Stop producing blocks, as a node that lost consensus would.
    pub fn halt(&self) {
        let height = self.current_height();
        self.ledger().halted_at = Some(height);
    }

    pub fn transactions(&self) -> Vec<MockTx> {
        self.ledger().txs.clone()
    }

    /// Memos of the transfers received by `address`, oldest first.
    pub fn memos_to(&self, address: &str) -> Vec<String> {
        self.ledger()
            .txs
            .iter()
            .filter(|tx| tx.to == address)
            .map(|tx| tx.memo.clone())
            .collect()
    }

    pub fn ccv_genesis(&self) -> Option<Value> {
        self.ledger().ccv_genesis.clone()
    }

    fn wallet(&self, key_name: &str, mnemonic: String) -> Result<Wallet, Error> {
        let raw_address = derive_address(&mnemonic);

        let wallet = Wallet {
            key_name: key_name.to_string(),
            formatted_address: self.codec.encode(&raw_address)?,
            raw_address,
            mnemonic,
            chain_id: self.config.chain_id.clone(),
        };

        self.keyring.insert(wallet.clone());
        Ok(wallet)
    }

    fn not_initialized(&self) -> Error {
        Error::generic(eyre!("chain {} is not initialized", self.config.chain_id))
    }
}

#[async_trait]
impl Chain for MockChain {
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
        fee_for_gas(DEFAULT_GAS_LIMIT, &self.config.gas_prices).unwrap_or(Amount::ZERO)
    }

    async fn initialize(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
    ) -> Result<(), Error> {
        let image = self.config.node_image().ok_or_else(|| {
            Error::config_invalid(format!("chain {} has no image", self.config.name))
        })?;

        let home = &self.config.home_dir;
        let command = format!("{} start --home {home}", self.config.binary);

        let mut nodes = Vec::new();
        let layout = (0..self.config.num_validators)
            .map(|i| (i, true))
            .chain((0..self.config.num_full_nodes).map(|i| (i, false)));

        for (index, validator) in layout {
            let node = create_node(
                ctx,
                broker,
                network,
                NodeSpec {
                    chain_id: &self.config.chain_id,
                    index,
                    validator,
                    image,
                    home_dir: home,
                    entrypoint: gated_entrypoint(home, &command),
                    env: Vec::new(),
                },
            )
            .await?;

            nodes.push(node);
        }

        self.nodes
            .set(nodes)
            .map_err(|_| Error::generic(eyre!("chain {} initialized twice", self.config.chain_id)))
    }

    async fn init_genesis(&self, _ctx: &Context, additional: &[WalletAmount]) -> Result<(), Error> {
        let mnemonic = self
            .config
            .faucet_mnemonic
            .clone()
            .unwrap_or_else(random_mnemonic);

        let faucet = self.wallet(FAUCET_KEY, mnemonic)?;
        self.credit(faucet.address(), &self.config.denom, self.config.faucet_amount);

        for funding in additional {
            self.credit(&funding.address, &funding.denom, funding.amount);
        }

        debug!(
            "mock genesis of {} credits {} accounts",
            self.config.chain_id,
            additional.len() + 1
        );

        Ok(())
    }

    async fn start(&self, ctx: &Context) -> Result<(), Error> {
        if self.nodes().is_empty() {
            return Err(self.not_initialized());
        }

        for node in self.nodes() {
            if let Err(e) = node.release(ctx).await {
                // a node that already crashed is reported by the readiness check below
                if !matches!(node.container.state(ctx).await?, ContainerState::Exited(_)) {
                    return Err(e);
                }
            }
        }

        let _ = self.started_at.set(Instant::now());

        for node in self.nodes() {
            wait_until_ready(ctx, node, self.config.readiness_timeout(), 1, move || async move {
                Ok(self.current_height())
            })
            .await?;
        }

        info!("mock chain {} is producing blocks", self.config.chain_id);

        Ok(())
    }

    async fn node_heights(&self, _ctx: &Context) -> Result<Vec<NodeHeight>, Error> {
        let height = self.current_height();

        Ok(self
            .nodes()
            .iter()
            .map(|node| NodeHeight {
                node: node.name(),
                height,
            })
            .collect())
    }

    async fn get_balance(
        &self,
        _ctx: &Context,
        address: &str,
        denom: &str,
    ) -> Result<Amount, Error> {
        Ok(self.ledger().balance(address, denom))
    }

    /// The sender pays `amount` plus the static fee, charged in the native denom.
    async fn send_funds_with_memo(
        &self,
        _ctx: &Context,
        key_name: &str,
        amount: &WalletAmount,
        memo: &str,
    ) -> Result<String, Error> {
        let sender = self.keyring.get(key_name)?;
        let fee = self.static_gas();
        let native = self.config.denom.clone();
        let height = self.current_height();

        let mut ledger = self.ledger();
        let from = sender.formatted_address.clone();

        let (required, available) = if amount.denom == native {
            (amount.amount + fee, ledger.balance(&from, &native))
        } else {
            let gas = ledger.balance(&from, &native);
            if gas < fee {
                return Err(Error::insufficient_funds(
                    self.config.chain_id.clone(),
                    from,
                    fee,
                    gas,
                ));
            }
            (amount.amount, ledger.balance(&from, &amount.denom))
        };

        if available < required {
            return Err(Error::insufficient_funds(
                self.config.chain_id.clone(),
                from,
                required,
                available,
            ));
        }

        ledger.debit(&from, &amount.denom, amount.amount);
        ledger.debit(&from, &native, fee);
        ledger.credit(&amount.address, &amount.denom, amount.amount);

        let hash = random_hash();
        ledger.txs.push(MockTx {
            hash: hash.clone(),
            height,
            from,
            to: amount.address.clone(),
            amount: amount.amount,
            denom: amount.denom.clone(),
            memo: memo.to_string(),
        });

        Ok(hash)
    }

    async fn create_key(&self, _ctx: &Context, key_name: &str) -> Result<Wallet, Error> {
        self.wallet(key_name, random_mnemonic())
    }

    async fn recover_key(
        &self,
        _ctx: &Context,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<Wallet, Error> {
        self.wallet(key_name, mnemonic.to_string())
    }

    fn as_ics_provider(&self) -> Option<&dyn IcsProvider> {
        (self.ics_role() == Some(IcsRole::Provider)).then_some(self as &dyn IcsProvider)
    }

    fn as_ics_consumer(&self) -> Option<&dyn IcsConsumer> {
        (self.ics_role() == Some(IcsRole::Consumer)).then_some(self as &dyn IcsConsumer)
    }

    fn relayer_endpoint(&self) -> Option<ChainEndpoint> {
        let node = self.nodes().first()?;

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

#[async_trait]
impl IcsProvider for MockChain {
    async fn submit_consumer_addition(
        &self,
        _ctx: &Context,
        consumer_chain_id: &str,
    ) -> Result<ConsumerProposal, Error> {
        let mut ledger = self.ledger();
        ledger.next_proposal += 1;

        Ok(ConsumerProposal {
            proposal_id: ledger.next_proposal,
            consumer_chain_id: consumer_chain_id.to_string(),
        })
    }

    async fn vote_on_proposal(
        &self,
        _ctx: &Context,
        proposal: &ConsumerProposal,
    ) -> Result<(), Error> {
        let validators = self.config.num_validators;
        self.ledger().votes.insert(proposal.proposal_id, validators);
        Ok(())
    }

    async fn wait_for_proposal_passed(
        &self,
        _ctx: &Context,
        proposal: &ConsumerProposal,
    ) -> Result<(), Error> {
        let mut ledger = self.ledger();

        match ledger.votes.get(&proposal.proposal_id) {
            Some(votes) if *votes > 0 => {
                ledger.consumers.push(proposal.consumer_chain_id.clone());
                Ok(())
            }
            _ => Err(Error::generic(eyre!(
                "proposal {} on {} was rejected",
                proposal.proposal_id,
                self.config.chain_id
            ))),
        }
    }

    async fn consumer_genesis(
        &self,
        _ctx: &Context,
        consumer_chain_id: &str,
    ) -> Result<Value, Error> {
        if !self.ledger().consumers.iter().any(|c| c == consumer_chain_id) {
            return Err(Error::generic(eyre!(
                "no consumer chain {} registered on {}",
                consumer_chain_id,
                self.config.chain_id
            )));
        }

        Ok(json!({
            "params": { "enabled": true },
            "provider": { "client_state": { "chain_id": self.config.chain_id } },
            "new_chain": true,
        }))
    }

    async fn validator_keys(&self, _ctx: &Context) -> Result<Vec<String>, Error> {
        Ok((0..self.config.num_validators)
            .map(|i| format!("{{\"address\":\"{}-val-{i}\"}}", self.config.chain_id))
            .collect())
    }

    async fn consumer_chains(&self, _ctx: &Context) -> Result<Vec<String>, Error> {
        Ok(self.ledger().consumers.clone())
    }

    async fn consumer_client_id(
        &self,
        _ctx: &Context,
        consumer_chain_id: &str,
    ) -> Result<String, Error> {
        self.ledger()
            .consumers
            .iter()
            .position(|c| c == consumer_chain_id)
            .map(|i| format!("07-tendermint-{i}"))
            .ok_or_else(|| {
                Error::generic(eyre!("no client for consumer {} exists", consumer_chain_id))
            })
    }
}

#[async_trait]
impl IcsConsumer for MockChain {
    async fn set_ccv_genesis(
        &self,
        _ctx: &Context,
        ccv_state: Value,
        validator_keys: &[String],
    ) -> Result<(), Error> {
        if self.started_at.get().is_some() {
            return Err(Error::generic(eyre!(
                "consumer {} is already running",
                self.config.chain_id
            )));
        }

        if validator_keys.len() < self.config.num_validators {
            return Err(Error::config_invalid(format!(
                "consumer {} has {} validators but only {} provider keys were given",
                self.config.chain_id,
                self.config.num_validators,
                validator_keys.len()
            )));
        }

        self.ledger().ccv_genesis = Some(ccv_state);
        Ok(())
    }

    async fn provider_client_id(
        &self,
        _ctx: &Context,
        provider_chain_id: &str,
    ) -> Result<String, Error> {
        match self.ccv_genesis() {
            Some(_) => Ok("07-tendermint-0".to_string()),
            None => Err(Error::generic(eyre!(
                "consumer {} has no client of provider {}",
                self.config.chain_id,
                provider_chain_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builtin::builtin_config;
    use crate::error::ErrorKind;
    use crate::testutil::mock_broker;
    use core::time::Duration;

    fn mock_config(chain_id: &str) -> ChainConfig {
        let mut config = builtin_config("mock").unwrap();
        config.chain_id = chain_id.to_string();
        config
    }

    async fn started(chain_id: &str) -> MockChain {
        let (_runtime, broker) = mock_broker("mock-chain");
        let ctx = Context::background();
        let network = broker.setup_network(&ctx).await.unwrap();

        let chain = MockChain::new(mock_config(chain_id));
        chain.initialize(&ctx, &broker, &network).await.unwrap();
        chain.init_genesis(&ctx, &[]).await.unwrap();
        chain.start(&ctx).await.unwrap();
        chain
    }

    #[tokio::test(start_paused = true)]
    async fn heights_follow_the_clock() {
        let chain = started("mock-1").await;
        let ctx = Context::background();

        let before = chain.height(&ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(chain.config.block_time_ms * 3)).await;

        assert_eq!(chain.height(&ctx).await.unwrap(), before + 3);
        chain.wait_for_blocks(&ctx, 2).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn halted_chain_stalls() {
        let chain = started("mock-1").await;
        chain.halt();

        let err = chain
            .wait_for_blocks(&Context::background(), 5)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::HeightStalled);
    }

    #[tokio::test(start_paused = true)]
    async fn transfers_charge_the_fee() {
        let chain = started("mock-1").await;
        let ctx = Context::background();

        let user = chain.create_key(&ctx, "user").await.unwrap();
        let faucet = chain.keyring().get(FAUCET_KEY).unwrap();
        let amount = WalletAmount::new(user.address(), "umock", Amount(1_000));

        chain
            .send_funds_with_memo(&ctx, FAUCET_KEY, &amount, "hello")
            .await
            .unwrap();

        assert_eq!(
            chain.get_balance(&ctx, user.address(), "umock").await.unwrap(),
            Amount(1_000)
        );
        assert_eq!(
            chain.get_balance(&ctx, faucet.address(), "umock").await.unwrap(),
            chain.config.faucet_amount - Amount(1_000) - chain.static_gas()
        );
        assert_eq!(chain.memos_to(user.address()), vec!["hello".to_string()]);

        let err = chain
            .send_funds(&ctx, "user", &WalletAmount::new(faucet.address(), "umock", Amount(1_000)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FundingMismatch);
    }

    #[tokio::test]
    async fn recovered_keys_match_created_ones() {
        let chain = MockChain::new(mock_config("mock-1"));
        let ctx = Context::background();

        let created = chain.create_key(&ctx, "a").await.unwrap();
        let recovered = chain.recover_key(&ctx, "b", &created.mnemonic).await.unwrap();

        assert_eq!(created.formatted_address, recovered.formatted_address);
        assert!(created.formatted_address.starts_with("mock1"));
    }

    #[tokio::test(start_paused = true)]
    async fn crashing_nodes_fail_readiness_with_logs() {
        let (runtime, broker) = mock_broker("mock-crash");
        runtime.mark_image_crashing("mock/chain");

        let ctx = Context::background();
        let network = broker.setup_network(&ctx).await.unwrap();

        let chain = MockChain::new(mock_config("mock-1"));
        chain.initialize(&ctx, &broker, &network).await.unwrap();
        chain.init_genesis(&ctx, &[]).await.unwrap();

        let err = chain.start(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Readiness);
        assert!(err.to_string().contains("failed to load genesis"));
    }
}
