/*!
   Driver for EVM chains, running an `anvil` dev node and talking to it
   with `cast` inside the same container.
*/

use async_trait::async_trait;
use eyre::eyre;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};
use subtle_encoding::hex;
use tracing::{debug, info};

use super::address::AddressCodec;
use super::keyring::Keyring;
use super::node::{create_node, gated_entrypoint, wait_until_ready, ChainNode, NodeSpec};
use super::spec::{ChainConfig, EvmConfig};
use super::traits::{Chain, ChainCapabilities, NodeHeight, FAUCET_KEY};
use crate::docker::{DockerBroker, NetworkId};
use crate::error::{handle_generic_error, Error};
use crate::types::context::Context;
use crate::types::token::{Amount, WalletAmount};
use crate::types::wallet::Wallet;

pub const JSON_RPC_PORT: u16 = 8545;

/// Gas used by a plain value transfer between externally owned accounts.
pub const TRANSFER_GAS: u64 = 21_000;

const GENESIS_FILE: &str = "genesis.json";

pub struct EvmChain {
    config: ChainConfig,
    keyring: Keyring,
    private_keys: Mutex<BTreeMap<String, String>>,
    node: OnceLock<ChainNode>,
    router: Mutex<Option<String>>,
    token: Mutex<Option<String>>,
}

/// Fields printed by `cast wallet new` and `cast wallet new-mnemonic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastWallet {
    pub address: String,
    pub private_key: String,
    pub mnemonic: Option<String>,
}

impl EvmChain {
    pub fn new(config: ChainConfig) -> Self {
        let router = config.evm.as_ref().and_then(|e| e.router_address.clone());
        let token = config.evm.as_ref().and_then(|e| e.token_address.clone());

        Self {
            keyring: Keyring::new(config.chain_id.clone()),
            private_keys: Mutex::new(BTreeMap::new()),
            node: OnceLock::new(),
            router: Mutex::new(router),
            token: Mutex::new(token),
            config,
        }
    }

    fn evm(&self) -> Result<&EvmConfig, Error> {
        self.config.evm.as_ref().ok_or_else(|| {
            Error::config_invalid(format!("chain {} has no evm settings", self.config.name))
        })
    }

    fn node(&self) -> Result<&ChainNode, Error> {
        self.node
            .get()
            .ok_or_else(|| Error::generic(eyre!("chain {} is not initialized", self.config.chain_id)))
    }

    fn rpc_url(&self) -> String {
        format!("http://localhost:{JSON_RPC_PORT}")
    }

    fn private_key(&self, key_name: &str) -> Result<String, Error> {
        let keys = match self.private_keys.lock() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        };

        keys.get(key_name)
            .cloned()
            .ok_or_else(|| Error::key_not_found(self.config.chain_id.clone(), key_name.to_string()))
    }

    fn store_key(&self, key_name: &str, wallet: &CastWallet) -> Result<Wallet, Error> {
        match self.private_keys.lock() {
            Ok(mut keys) => keys.insert(key_name.to_string(), wallet.private_key.clone()),
            Err(poisoned) => poisoned
                .into_inner()
                .insert(key_name.to_string(), wallet.private_key.clone()),
        };

        let wallet = Wallet {
            key_name: key_name.to_string(),
            mnemonic: wallet.mnemonic.clone().unwrap_or_default(),
            raw_address: AddressCodec::Hex.decode(&wallet.address)?,
            formatted_address: wallet.address.clone(),
            chain_id: self.config.chain_id.clone(),
        };

        self.keyring.insert(wallet.clone());

        Ok(wallet)
    }

    async fn cast(&self, ctx: &Context, args: &[&str]) -> Result<String, Error> {
        let mut argv = vec!["cast"];
        argv.extend_from_slice(args);

        let output = self.node()?.container.exec_checked(ctx, &argv).await?;

        Ok(output.stdout.trim().to_string())
    }

    /// The router contract, if one is configured or was deployed at start.
    pub fn router_address(&self) -> Option<String> {
        self.router.lock().ok().and_then(|r| r.clone())
    }

    /// The ERC-20 test token, if one is configured or was deployed at start.
    pub fn token_address(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    /**
       Deploy the test token and the router from their configured
       bytecode, unless their address is configured or already known.
       Addresses are cached, so repeated calls deploy nothing.
    */
    pub async fn deploy_contracts(&self, ctx: &Context) -> Result<(), Error> {
        let evm = self.evm()?;

        self.deploy_contract(ctx, "token", &self.token, evm.token_bytecode.as_deref())
            .await?;
        self.deploy_contract(ctx, "router", &self.router, evm.router_bytecode.as_deref())
            .await
    }

    async fn deploy_contract(
        &self,
        ctx: &Context,
        contract: &str,
        slot: &Mutex<Option<String>>,
        bytecode: Option<&str>,
    ) -> Result<(), Error> {
        let known = match slot.lock() {
            Ok(address) => address.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        };

        let Some(bytecode) = bytecode.filter(|_| !known) else {
            return Ok(());
        };

        let private_key = self.private_key(FAUCET_KEY)?;
        let rpc_url = self.rpc_url();

        let receipt = self
            .cast(
                ctx,
                &[
                    "send",
                    "--create",
                    bytecode,
                    "--private-key",
                    &private_key,
                    "--rpc-url",
                    &rpc_url,
                    "--json",
                ],
            )
            .await?;

        let receipt: Value = serde_json::from_str(&receipt).map_err(handle_generic_error)?;
        let address = receipt
            .get("contractAddress")
            .and_then(|a| a.as_str())
            .ok_or_else(|| eyre!("{} deployment receipt has no contract address", contract))?
            .to_string();

        info!("deployed {} at {} on {}", contract, address, self.config.chain_id);

        match slot.lock() {
            Ok(mut cached) => *cached = Some(address),
            Err(poisoned) => *poisoned.into_inner() = Some(address),
        }

        Ok(())
    }

    fn gas_price(&self) -> &str {
        &self.config.gas_prices
    }

    fn check_receipt(&self, receipt: &str) -> Result<String, Error> {
        let receipt: Value = serde_json::from_str(receipt).map_err(handle_generic_error)?;

        let hash = receipt
            .get("transactionHash")
            .and_then(|h| h.as_str())
            .ok_or_else(|| eyre!("receipt has no transaction hash"))?
            .to_string();

        let status = receipt.get("status").and_then(|s| s.as_str()).unwrap_or("0x1");
        if status != "0x1" && status != "1" {
            return Err(Error::tx_rejected(
                self.config.chain_id.clone(),
                0,
                format!("transaction {hash} reverted"),
            ));
        }

        Ok(hash)
    }
}

/// The anvil genesis allocating `balances` (address to wei).
pub fn anvil_genesis(evm_chain_id: u64, balances: &[(String, Amount)]) -> Value {
    let alloc: serde_json::Map<String, Value> = balances
        .iter()
        .map(|(address, amount)| {
            (
                address.trim_start_matches("0x").to_lowercase(),
                json!({ "balance": format!("0x{:x}", amount.0) }),
            )
        })
        .collect();

    json!({
        "config": {
            "chainId": evm_chain_id,
            "homesteadBlock": 0,
            "eip150Block": 0,
            "eip155Block": 0,
            "eip158Block": 0,
            "byzantiumBlock": 0,
            "constantinopleBlock": 0,
            "petersburgBlock": 0,
            "istanbulBlock": 0,
            "berlinBlock": 0,
            "londonBlock": 0
        },
        "nonce": "0x0",
        "timestamp": "0x0",
        "extraData": "0x",
        "gasLimit": "0x1c9c380",
        "difficulty": "0x0",
        "alloc": alloc
    })
}

/// Parse the human readable output of `cast wallet new` or `cast wallet new-mnemonic`.
pub fn parse_cast_wallet(text: &str) -> Option<CastWallet> {
    let mut address = None;
    let mut private_key = None;
    let mut mnemonic = None;

    let mut lines = text.lines().map(|l| l.trim()).peekable();

    while let Some(line) = lines.next() {
        if let Some(value) = line.strip_prefix("Address:") {
            address.get_or_insert_with(|| value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Private key:") {
            private_key.get_or_insert_with(|| value.trim().to_string());
        } else if line.starts_with("Phrase:") {
            let inline = line.trim_start_matches("Phrase:").trim();
            if inline.is_empty() {
                mnemonic = lines.next().map(|l| l.to_string());
            } else {
                mnemonic = Some(inline.to_string());
            }
        }
    }

    Some(CastWallet {
        address: address?,
        private_key: private_key?,
        mnemonic,
    })
}

/// Hex call data argument for a memo.
pub fn memo_bytes(memo: &str) -> String {
    format!("0x{}", String::from_utf8_lossy(&hex::encode(memo)))
}

/// The first token of `cast` numeric output such as `1000 [1e3]`.
pub fn parse_cast_number(text: &str) -> Result<Amount, Error> {
    let token = text
        .split_whitespace()
        .next()
        .ok_or_else(|| eyre!("empty numeric output"))?;

    match token.strip_prefix("0x") {
        Some(hex) => u128::from_str_radix(hex, 16)
            .map(Amount)
            .map_err(handle_generic_error),
        None => token.parse(),
    }
}

#[async_trait]
impl Chain for EvmChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    fn capabilities(&self) -> ChainCapabilities {
        ChainCapabilities {
            memo_transfers: true,
            ..Default::default()
        }
    }

    fn static_gas(&self) -> Amount {
        cli_fee(TRANSFER_GAS, self.gas_price())
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

        let evm = self.evm()?;
        let block_time = (self.config.block_time_ms / 1000).max(1);
        let home = &self.config.home_dir;

        let command = format!(
            "anvil --host 0.0.0.0 --port {JSON_RPC_PORT} --chain-id {} --block-time {} --init {home}/{GENESIS_FILE}",
            evm.evm_chain_id, block_time
        );

        let node = create_node(
            ctx,
            broker,
            network,
            NodeSpec {
                chain_id: &self.config.chain_id,
                index: 0,
                validator: true,
                image,
                home_dir: home,
                entrypoint: gated_entrypoint(home, &command),
                env: Vec::new(),
            },
        )
        .await?;

        self.node
            .set(node)
            .map_err(|_| Error::generic(eyre!("chain {} initialized twice", self.config.chain_id)))
    }

    async fn init_genesis(&self, ctx: &Context, additional: &[WalletAmount]) -> Result<(), Error> {
        let private_key = self.evm()?.faucet_private_key.clone();

        let address = self
            .cast(ctx, &["wallet", "address", "--private-key", &private_key])
            .await?;

        self.store_key(
            FAUCET_KEY,
            &CastWallet {
                address: address.clone(),
                private_key,
                mnemonic: None,
            },
        )?;

        let mut balances = vec![(address, self.config.faucet_amount)];
        balances.extend(
            additional
                .iter()
                .map(|w| (w.address.clone(), w.amount)),
        );

        let genesis = anvil_genesis(self.evm()?.evm_chain_id, &balances);
        let content = serde_json::to_string_pretty(&genesis).map_err(handle_generic_error)?;

        self.node()?.write_file(ctx, GENESIS_FILE, &content).await?;

        debug!(
            "wrote anvil genesis for {} with {} allocations",
            self.config.chain_id,
            balances.len()
        );

        Ok(())
    }

    async fn start(&self, ctx: &Context) -> Result<(), Error> {
        let node = self.node()?;
        node.release(ctx).await?;

        let rpc_url = self.rpc_url();
        let rpc_url = rpc_url.as_str();
        wait_until_ready(ctx, node, self.config.readiness_timeout(), 1, move || async move {
            let height = self
                .cast(ctx, &["block-number", "--rpc-url", rpc_url])
                .await?;
            height.parse::<u64>().map_err(handle_generic_error)
        })
        .await?;

        self.deploy_contracts(ctx).await?;

        info!("evm chain {} is producing blocks", self.config.chain_id);

        Ok(())
    }

    async fn node_heights(&self, ctx: &Context) -> Result<Vec<NodeHeight>, Error> {
        let rpc_url = self.rpc_url();
        let height = self
            .cast(ctx, &["block-number", "--rpc-url", &rpc_url])
            .await?;

        Ok(vec![NodeHeight {
            node: self.node()?.name(),
            height: height.parse().map_err(handle_generic_error)?,
        }])
    }

    /// Native balance for the chain denom, ERC-20 balance when `denom` is a token address.
    async fn get_balance(
        &self,
        ctx: &Context,
        address: &str,
        denom: &str,
    ) -> Result<Amount, Error> {
        let rpc_url = self.rpc_url();

        let output = if denom == self.config.denom {
            self.cast(ctx, &["balance", address, "--rpc-url", &rpc_url])
                .await?
        } else {
            self.cast(
                ctx,
                &[
                    "call",
                    denom,
                    "balanceOf(address)(uint256)",
                    address,
                    "--rpc-url",
                    &rpc_url,
                ],
            )
            .await?
        };

        parse_cast_number(&output)
    }

    /**
       A plain value transfer without memo. With a memo the value goes
       through the router's `deposit(address,uint256,bytes)` with the
       recipient as vault.
    */
    async fn send_funds_with_memo(
        &self,
        ctx: &Context,
        key_name: &str,
        amount: &WalletAmount,
        memo: &str,
    ) -> Result<String, Error> {
        let private_key = self.private_key(key_name)?;
        let _guard = self.keyring.lock_key(key_name).await;

        let rpc_url = self.rpc_url();
        let value = amount.amount.to_string();
        let gas_price = self.gas_price().to_string();

        let receipt = if memo.is_empty() {
            self.cast(
                ctx,
                &[
                    "send",
                    &amount.address,
                    "--value",
                    &value,
                    "--legacy",
                    "--gas-price",
                    &gas_price,
                    "--private-key",
                    &private_key,
                    "--rpc-url",
                    &rpc_url,
                    "--json",
                ],
            )
            .await?
        } else {
            let router = self.router_address().ok_or_else(|| {
                Error::unsupported_capability(
                    self.config.chain_id.clone(),
                    "memo transfers without a router contract".to_string(),
                )
            })?;

            self.cast(
                ctx,
                &[
                    "send",
                    &router,
                    "deposit(address,uint256,bytes)",
                    &amount.address,
                    &value,
                    &memo_bytes(memo),
                    "--value",
                    &value,
                    "--legacy",
                    "--gas-price",
                    &gas_price,
                    "--private-key",
                    &private_key,
                    "--rpc-url",
                    &rpc_url,
                    "--json",
                ],
            )
            .await?
        };

        let hash = self.check_receipt(&receipt)?;

        debug!("sent {} from {} in tx {}", amount, key_name, hash);

        Ok(hash)
    }

    async fn create_key(&self, ctx: &Context, key_name: &str) -> Result<Wallet, Error> {
        let output = self.cast(ctx, &["wallet", "new-mnemonic"]).await?;

        let wallet = parse_cast_wallet(&output)
            .ok_or_else(|| eyre!("unexpected output of cast wallet new-mnemonic: {}", output))?;

        self.store_key(key_name, &wallet)
    }

    async fn recover_key(
        &self,
        ctx: &Context,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<Wallet, Error> {
        let address = self
            .cast(ctx, &["wallet", "address", "--mnemonic", mnemonic])
            .await?;
        let private_key = self
            .cast(ctx, &["wallet", "private-key", "--mnemonic", mnemonic])
            .await?;

        self.store_key(
            key_name,
            &CastWallet {
                address,
                private_key,
                mnemonic: Some(mnemonic.to_string()),
            },
        )
    }
}

fn cli_fee(gas: u64, gas_price: &str) -> Amount {
    gas_price
        .parse::<u128>()
        .ok()
        .and_then(|price| price.checked_mul(gas as u128))
        .map(Amount)
        .unwrap_or(Amount::ZERO)
}
