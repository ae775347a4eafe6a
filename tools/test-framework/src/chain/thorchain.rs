/*!
   Driver for THORChain, built on the Cosmos driver.

   THORChain has no staking module: its validator set comes from the
   node accounts in genesis, and every validator runs a bifrost sidecar
   observing the external chains.
*/

use async_trait::async_trait;
use eyre::eyre;
use futures::future::try_join_all;
use serde_json::{json, Map, Value};
use std::sync::Mutex;
use subtle_encoding::{base64, bech32};
use tracing::{debug, info};

use super::cosmos::{cli, CosmosChain, ValidatorAccount, ValidatorGenesis};
use super::keyring::Keyring;
use super::node::{ChainNode, API_PORT};
use super::spec::ChainConfig;
use super::traits::{
    Chain, ChainCapabilities, ChainEndpoint, InboundAddress, NodeHeight, ThorchainApi,
};
use crate::docker::{ContainerSpec, DockerBroker, NetworkId};
use crate::error::{handle_generic_error, Error};
use crate::types::context::Context;
use crate::types::token::{Amount, WalletAmount};
use crate::types::wallet::Wallet;

/// The fixed native fee charged for every THORChain transaction, in 1e-8 RUNE.
pub const NATIVE_FEE: Amount = Amount(2_000_000);

/// Amino prefix of an ed25519 public key.
const ED25519_AMINO_PREFIX: [u8; 5] = [0x16, 0x24, 0xde, 0x64, 0x20];

pub struct ThorchainChain {
    cosmos: CosmosChain,
    network: Mutex<Option<NetworkId>>,
    broker: Mutex<Option<DockerBroker>>,
    validators: Mutex<Vec<ValidatorAccount>>,
}

impl ThorchainChain {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            cosmos: CosmosChain::new(config),
            network: Mutex::new(None),
            broker: Mutex::new(None),
            validators: Mutex::new(Vec::new()),
        }
    }

    pub fn cosmos(&self) -> &CosmosChain {
        &self.cosmos
    }

    fn binary(&self) -> &str {
        self.cosmos.binary()
    }

    fn asset(&self, denom: &str) -> String {
        format!("THOR.{}", denom.to_uppercase())
    }

    /// The node account entry describing a validator in genesis.
    async fn node_account(
        &self,
        ctx: &Context,
        node: &ChainNode,
        account: &ValidatorAccount,
        version: &str,
    ) -> Result<Value, Error> {
        let config = self.cosmos.config();

        let pubkey = node
            .container
            .exec_checked(
                ctx,
                &[
                    self.binary(),
                    "keys",
                    "show",
                    super::cosmos::VALIDATOR_KEY,
                    "--bech",
                    "pub",
                    "--address",
                    "--keyring-backend",
                    "test",
                    "--home",
                    &node.home_dir,
                ],
            )
            .await?;
        let pubkey = cli::output_text(&pubkey).to_string();

        let validator = node
            .container
            .exec_checked(
                ctx,
                &[
                    self.binary(),
                    "tendermint",
                    "show-validator",
                    "--home",
                    &node.home_dir,
                ],
            )
            .await?;

        let cons_pubkey = consensus_pubkey(
            cli::output_text(&validator),
            &format!("{}cpub", config.bech32_prefix),
        )?;

        Ok(json!({
            "node_address": account.address,
            "version": version,
            "ip_address": node.hostname(),
            "status": "Active",
            "bond": config.validator_stake.to_string(),
            "active_block_height": "0",
            "bond_address": account.address,
            "signer_membership": [],
            "validator_cons_pub_key": cons_pubkey,
            "pub_key_set": {
                "secp256k1": pubkey,
                "ed25519": pubkey
            }
        }))
    }

    async fn add_node_accounts(
        &self,
        ctx: &Context,
        accounts: &[ValidatorAccount],
    ) -> Result<(), Error> {
        let nodes = self.cosmos.nodes()?;
        let primary = self.cosmos.primary()?;

        let version = primary
            .container
            .exec_checked(ctx, &[self.binary(), "version"])
            .await?;
        let version = cli::output_text(&version).trim_start_matches('v').to_string();

        let mut entries = Vec::new();
        for account in accounts {
            let node = nodes
                .iter()
                .find(|n| n.validator && n.index == account.node_index)
                .ok_or_else(|| eyre!("no validator node {}", account.node_index))?;

            entries.push(self.node_account(ctx, node, account, &version).await?);
        }

        primary
            .update_genesis_file(ctx, |genesis| {
                let thorchain = genesis
                    .get_mut("app_state")
                    .and_then(|s| s.get_mut("thorchain"))
                    .and_then(|t| t.as_object_mut())
                    .ok_or_else(|| eyre!("genesis has no thorchain module state"))?;

                let node_accounts = thorchain
                    .entry("node_accounts")
                    .or_insert_with(|| Value::Array(Vec::new()));

                match node_accounts.as_array_mut() {
                    Some(existing) => existing.extend(entries),
                    None => *node_accounts = Value::Array(entries),
                }

                Ok(())
            })
            .await?;

        debug!(
            "added {} node accounts to the genesis of {}",
            accounts.len(),
            self.chain_id()
        );

        Ok(())
    }

    async fn api_get_on(
        &self,
        ctx: &Context,
        node: &ChainNode,
        path: &str,
    ) -> Result<Value, Error> {
        let url = format!("http://localhost:{API_PORT}{path}");
        let output = node
            .container
            .exec_checked(ctx, &["curl", "-sf", &url])
            .await?;

        serde_json::from_str(&output.stdout).map_err(handle_generic_error)
    }

    fn stored_validators(&self) -> Vec<ValidatorAccount> {
        match self.validators.lock() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/**
   Convert the JSON printed by `tendermint show-validator` into a
   bech32 consensus public key with the given prefix.
*/
pub fn consensus_pubkey(show_validator: &str, prefix: &str) -> Result<String, Error> {
    let value: Value = serde_json::from_str(show_validator).map_err(handle_generic_error)?;

    let key = value
        .get("key")
        .and_then(|k| k.as_str())
        .ok_or_else(|| eyre!("expected key in {}", show_validator))?;

    let raw = base64::decode(key).map_err(handle_generic_error)?;

    let mut data = ED25519_AMINO_PREFIX.to_vec();
    data.extend_from_slice(&raw);

    Ok(bech32::encode(prefix, data))
}

/// Parse one entry of `/thorchain/inbound_addresses`.
pub fn parse_inbound_address(entries: &Value, chain: &str) -> Option<InboundAddress> {
    entries.as_array()?.iter().find_map(|entry| {
        let entry_chain = entry.get("chain")?.as_str()?;
        if !entry_chain.eq_ignore_ascii_case(chain) {
            return None;
        }

        Some(InboundAddress {
            chain: entry_chain.to_string(),
            address: entry.get("address")?.as_str()?.to_string(),
            router: entry
                .get("router")
                .and_then(|r| r.as_str())
                .map(|r| r.to_string()),
            halted: entry.get("halted").and_then(|h| h.as_bool()).unwrap_or(false),
        })
    })
}

#[async_trait]
impl Chain for ThorchainChain {
    fn config(&self) -> &ChainConfig {
        self.cosmos.config()
    }

    fn keyring(&self) -> &Keyring {
        self.cosmos.keyring()
    }

    fn capabilities(&self) -> ChainCapabilities {
        ChainCapabilities {
            memo_transfers: true,
            ibc: false,
            ics_provider: false,
            ics_consumer: false,
            sidecars: self.config().images.len() > 1,
        }
    }

    fn static_gas(&self) -> Amount {
        NATIVE_FEE
    }

    async fn initialize(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
    ) -> Result<(), Error> {
        self.cosmos.initialize(ctx, broker, network).await?;

        if let Ok(mut stored) = self.network.lock() {
            *stored = Some(network.clone());
        }
        if let Ok(mut stored) = self.broker.lock() {
            *stored = Some(broker.clone());
        }

        Ok(())
    }

    async fn init_genesis(&self, ctx: &Context, additional: &[WalletAmount]) -> Result<(), Error> {
        let accounts = self
            .cosmos
            .prepare_genesis(ctx, additional, ValidatorGenesis::External)
            .await?;

        self.add_node_accounts(ctx, &accounts).await?;

        if let Ok(mut stored) = self.validators.lock() {
            *stored = accounts;
        }

        self.cosmos.finalize_genesis(ctx).await
    }

    async fn start(&self, ctx: &Context) -> Result<(), Error> {
        self.cosmos.start(ctx).await
    }

    /// One bifrost container per validator, signing with the validator key.
    async fn start_sidecars(&self, ctx: &Context) -> Result<(), Error> {
        let Some(image) = self.config().images.get(1).cloned() else {
            return Ok(());
        };

        let broker = self
            .broker
            .lock()
            .ok()
            .and_then(|b| b.clone())
            .ok_or_else(|| eyre!("chain {} is not initialized", self.chain_id()))?;
        let network = self
            .network
            .lock()
            .ok()
            .and_then(|n| n.clone())
            .ok_or_else(|| eyre!("chain {} is not initialized", self.chain_id()))?;

        let nodes = self.cosmos.nodes()?;
        let validators = self.stored_validators();

        try_join_all(validators.iter().map(|account| {
            let image = image.clone();
            let broker = broker.clone();
            let network = network.clone();

            async move {
                let node = nodes
                    .iter()
                    .find(|n| n.validator && n.index == account.node_index)
                    .ok_or_else(|| eyre!("no validator node {}", account.node_index))?;

                let name = broker.resource_name(&format!(
                    "{}-bifrost-{}",
                    self.chain_id(),
                    account.node_index
                ));

                let container = broker
                    .create_container(
                        ctx,
                        ContainerSpec {
                            name: name.clone(),
                            hostname: name,
                            image: Some(image),
                            entrypoint: vec!["/docker/scripts/bifrost.sh".to_string()],
                            cmd: vec!["bifrost".to_string(), "-p".to_string()],
                            env: vec![
                                ("CHAIN_ID".to_string(), self.chain_id().to_string()),
                                ("CHAIN_API".to_string(), format!("{}:{}", node.hostname(), API_PORT)),
                                ("CHAIN_RPC".to_string(), format!("{}:{}", node.hostname(), super::node::RPC_PORT)),
                                ("SIGNER_NAME".to_string(), super::cosmos::VALIDATOR_KEY.to_string()),
                                ("SIGNER_PASSWD".to_string(), "password".to_string()),
                                ("SIGNER_SEED_PHRASE".to_string(), account.mnemonic.clone()),
                            ],
                            network: Some(network),
                            ..Default::default()
                        },
                    )
                    .await?;

                container.start(ctx).await?;

                info!("started bifrost sidecar {}", container.name());

                Ok::<_, Error>(())
            }
        }))
        .await?;

        Ok(())
    }

    async fn node_heights(&self, ctx: &Context) -> Result<Vec<NodeHeight>, Error> {
        self.cosmos.node_heights(ctx).await
    }

    async fn get_balance(
        &self,
        ctx: &Context,
        address: &str,
        denom: &str,
    ) -> Result<Amount, Error> {
        self.cosmos.get_balance(ctx, address, denom).await
    }

    /// A transfer without recipient is a native `MsgDeposit` carrying the memo.
    async fn send_funds_with_memo(
        &self,
        ctx: &Context,
        key_name: &str,
        amount: &WalletAmount,
        memo: &str,
    ) -> Result<String, Error> {
        if amount.address.is_empty() {
            self.deposit(ctx, key_name, amount.amount, &amount.denom, memo)
                .await
        } else {
            self.cosmos
                .send_funds_with_memo(ctx, key_name, amount, memo)
                .await
        }
    }

    async fn create_key(&self, ctx: &Context, key_name: &str) -> Result<Wallet, Error> {
        self.cosmos.create_key(ctx, key_name).await
    }

    async fn recover_key(
        &self,
        ctx: &Context,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<Wallet, Error> {
        self.cosmos.recover_key(ctx, key_name, mnemonic).await
    }

    fn as_thorchain(&self) -> Option<&dyn ThorchainApi> {
        Some(self)
    }

    fn relayer_endpoint(&self) -> Option<ChainEndpoint> {
        None
    }
}

#[async_trait]
impl ThorchainApi for ThorchainChain {
    async fn deposit(
        &self,
        ctx: &Context,
        key_name: &str,
        amount: Amount,
        denom: &str,
        memo: &str,
    ) -> Result<String, Error> {
        self.keyring().get(key_name)?;
        let _guard = self.keyring().lock_key(key_name).await;

        let node = self.cosmos.primary()?;
        let options = self.cosmos.tx_options(key_name);
        let amount = amount.to_string();
        let asset = self.asset(denom);
        let gas = options.gas.to_string();

        let output = node
            .container
            .exec_checked(
                ctx,
                &[
                    self.binary(),
                    "tx",
                    "thorchain",
                    "deposit",
                    &amount,
                    &asset,
                    memo,
                    "--from",
                    key_name,
                    "--chain-id",
                    self.chain_id(),
                    "--keyring-backend",
                    "test",
                    "--gas",
                    &gas,
                    "--output",
                    "json",
                    "--yes",
                    "--home",
                    &node.home_dir,
                ],
            )
            .await?;

        let response = cli::parse_tx_response(cli::output_text(&output))?;
        if response.code != 0 {
            return Err(Error::tx_rejected(
                self.chain_id().to_string(),
                response.code,
                response.raw_log,
            ));
        }

        self.cosmos.wait_for_tx(ctx, &response.txhash).await?;

        debug!("deposit `{}` from {} in tx {}", memo, key_name, response.txhash);

        Ok(response.txhash)
    }

    async fn set_mimir(
        &self,
        ctx: &Context,
        key_name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        self.keyring().get(key_name)?;
        let _guard = self.keyring().lock_key(key_name).await;

        let node = self.cosmos.primary()?;

        let output = node
            .container
            .exec_checked(
                ctx,
                &[
                    self.binary(),
                    "tx",
                    "thorchain",
                    "mimir",
                    key,
                    value,
                    "--from",
                    key_name,
                    "--chain-id",
                    self.chain_id(),
                    "--keyring-backend",
                    "test",
                    "--output",
                    "json",
                    "--yes",
                    "--home",
                    &node.home_dir,
                ],
            )
            .await?;

        let response = cli::parse_tx_response(cli::output_text(&output))?;
        if response.code != 0 {
            return Err(Error::tx_rejected(
                self.chain_id().to_string(),
                response.code,
                response.raw_log,
            ));
        }

        self.cosmos.wait_for_tx(ctx, &response.txhash).await?;

        info!("set mimir {} = {} on {}", key, value, self.chain_id());

        Ok(())
    }

    async fn mimirs(&self, ctx: &Context) -> Result<Map<String, Value>, Error> {
        let value = self.api_get(ctx, "/thorchain/mimir").await?;

        match value {
            Value::Object(map) => Ok(map),
            other => Err(Error::generic(eyre!("unexpected mimir response {}", other))),
        }
    }

    async fn inbound_address(&self, ctx: &Context, chain: &str) -> Result<InboundAddress, Error> {
        let entries = self.api_get(ctx, "/thorchain/inbound_addresses").await?;

        parse_inbound_address(&entries, chain)
            .ok_or_else(|| Error::generic(eyre!("no inbound address for chain {}", chain)))
    }

    async fn api_get(&self, ctx: &Context, path: &str) -> Result<Value, Error> {
        self.api_get_on(ctx, self.cosmos.primary()?, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builtin::builtin_config;

    #[test]
    fn consensus_keys_are_bech32() {
        let show_validator = r#"{"@type":"/cosmos.crypto.ed25519.PubKey","key":"AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8="}"#;

        let key = consensus_pubkey(show_validator, "tthorcpub").unwrap();
        let (hrp, data) = bech32::decode(&key).unwrap();

        assert_eq!(hrp, "tthorcpub");
        assert_eq!(&data[..5], &ED25519_AMINO_PREFIX);
        assert_eq!(data.len(), 37);
    }

    #[test]
    fn finds_inbound_addresses() {
        let entries = json!([
            { "chain": "BTC", "address": "bcrt1qvault", "halted": false },
            { "chain": "ETH", "address": "0xvault", "router": "0xrouter", "halted": true }
        ]);

        let eth = parse_inbound_address(&entries, "eth").unwrap();
        assert_eq!(eth.address, "0xvault");
        assert_eq!(eth.router.as_deref(), Some("0xrouter"));
        assert!(eth.halted);

        assert!(parse_inbound_address(&entries, "DOGE").is_none());
    }

    #[test]
    fn thorchain_uses_the_native_fee() {
        let mut config = builtin_config("thorchain").unwrap();
        config.chain_id = "thorchain".to_string();
        let chain = ThorchainChain::new(config);

        assert_eq!(chain.static_gas(), NATIVE_FEE);
        assert!(chain.as_thorchain().is_some());
        assert!(chain.capabilities().sidecars);
        assert_eq!(chain.asset("rune"), "THOR.RUNE");
    }
}
