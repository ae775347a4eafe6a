/*!
   Driver for bitcoind-style UTXO chains in regtest mode: bitcoin,
   bitcoin cash, litecoin and dogecoin.

   The node wallet holds every key. A background block producer,
   registered with the supervisor, mines to a dedicated miner address
   so that transfers confirm without touching the faucet balance.
*/

use async_trait::async_trait;
use core::time::Duration;
use eyre::eyre;
use serde_json::Value;
use std::sync::{Mutex, OnceLock};
use subtle_encoding::hex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use self::coin_select::{select_coins, TxShape, Utxo};
use super::chain_type::ChainFamily;
use super::keyring::Keyring;
use super::node::{create_node, gated_entrypoint, wait_until_ready, ChainNode, NodeSpec};
use super::spec::{ChainConfig, UtxoConfig};
use super::traits::{Chain, ChainCapabilities, NodeHeight, FAUCET_KEY, POLL_INTERVAL};
use crate::docker::{Container, DockerBroker, NetworkId};
use crate::error::{handle_generic_error, Error};
use crate::types::context::Context;
use crate::types::token::{Amount, WalletAmount, COIN_DECIMALS};
use crate::types::wallet::Wallet;

pub mod coin_select;

/// Key name of the address receiving background block rewards.
pub const MINER_KEY: &str = "miner";

const WALLET_NAME: &str = "default";

/// Consecutive failures after which the block producer gives up.
const MAX_MINER_FAILURES: u32 = 10;

pub struct UtxoChain {
    config: ChainConfig,
    keyring: Keyring,
    node: OnceLock<ChainNode>,
    broker: OnceLock<DockerBroker>,
    pending_funding: Mutex<Vec<WalletAmount>>,
    /// The daemon runs one `scantxoutset` at a time.
    scan: AsyncMutex<()>,
}

/// Daemon and CLI binaries of a UTXO flavor.
pub fn binaries(family: ChainFamily, binary: &str) -> (String, String) {
    if !binary.is_empty() {
        let cli = format!("{}-cli", binary.trim_end_matches('d'));
        return (binary.to_string(), cli);
    }

    let (daemon, cli) = match family {
        ChainFamily::Litecoin => ("litecoind", "litecoin-cli"),
        ChainFamily::Dogecoin => ("dogecoind", "dogecoin-cli"),
        _ => ("bitcoind", "bitcoin-cli"),
    };

    (daemon.to_string(), cli.to_string())
}

/// Arguments prefixing every RPC call made through the CLI.
fn rpc_args(cli: &str, utxo: &UtxoConfig) -> Vec<String> {
    vec![
        cli.to_string(),
        "-regtest".to_string(),
        format!("-rpcuser={}", utxo.rpc_user),
        format!("-rpcpassword={}", utxo.rpc_password),
        format!("-rpcport={}", utxo.rpc_port),
    ]
}

async fn rpc_on(
    ctx: &Context,
    container: &Container,
    prefix: &[String],
    args: &[&str],
) -> Result<String, Error> {
    let mut argv: Vec<&str> = prefix.iter().map(|s| s.as_str()).collect();
    argv.extend_from_slice(args);

    let output = container.exec_checked(ctx, &argv).await?;

    Ok(output.stdout.trim().to_string())
}

fn is_method_not_found(error: &Error) -> bool {
    error.to_string().contains("Method not found")
}

/// Parse a coin amount printed by the node, e.g. `50.00000000` or `1e-05`.
pub fn parse_coin(value: &Value) -> Result<Amount, Error> {
    match value {
        Value::Number(n) => Amount::from_decimal_str(&n.to_string(), COIN_DECIMALS),
        Value::String(s) => Amount::from_decimal_str(s, COIN_DECIMALS),
        other => Err(Error::generic(eyre!("invalid coin amount {}", other))),
    }
}

pub fn parse_unspent(text: &str) -> Result<Vec<Utxo>, Error> {
    let value: Value = serde_json::from_str(text).map_err(handle_generic_error)?;

    value
        .as_array()
        .ok_or_else(|| eyre!("expected a list of unspent outputs"))?
        .iter()
        .map(|entry| -> Result<Utxo, Error> {
            Ok(Utxo {
                txid: entry
                    .get("txid")
                    .and_then(|t| t.as_str())
                    .ok_or_else(|| eyre!("unspent output without txid"))?
                    .to_string(),
                vout: entry
                    .get("vout")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| eyre!("unspent output without vout"))? as u32,
                amount: parse_coin(
                    entry
                        .get("amount")
                        .ok_or_else(|| eyre!("unspent output without amount"))?,
                )?,
            })
        })
        .collect()
}

fn json_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

/**
   The outputs object for `createrawtransaction`. Amounts are written
   as decimal literals so that no precision is lost on the way.
*/
pub fn raw_outputs(payments: &[(String, Amount)], memo: Option<&str>) -> String {
    let mut entries: Vec<String> = payments
        .iter()
        .map(|(address, amount)| {
            format!(
                "{}:{}",
                json_string(address),
                amount.to_decimal_string(COIN_DECIMALS)
            )
        })
        .collect();

    if let Some(memo) = memo {
        let data = String::from_utf8_lossy(&hex::encode(memo)).to_string();
        entries.push(format!("\"data\":{}", json_string(&data)));
    }

    format!("{{{}}}", entries.join(","))
}

/**
   The text carried by the OP_RETURN output of a decoded transaction.

   The raw script is decoded rather than its `asm` form, which prints
   short pushes as numbers.
*/
pub fn memo_from_transaction(tx: &Value) -> Option<String> {
    tx.get("vout")?.as_array()?.iter().find_map(|output| {
        let script = output.get("scriptPubKey")?;
        if script.get("type")?.as_str()? != "nulldata" {
            return None;
        }

        let script = hex::decode(script.get("hex")?.as_str()?).ok()?;
        String::from_utf8(op_return_payload(&script)?).ok()
    })
}

const OP_RETURN: u8 = 0x6a;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;

/// Concatenated data pushes following `OP_RETURN`, or `None` for any other script.
pub fn op_return_payload(script: &[u8]) -> Option<Vec<u8>> {
    let (&opcode, mut rest) = script.split_first()?;
    if opcode != OP_RETURN {
        return None;
    }

    let mut payload = Vec::new();

    while let Some((&opcode, tail)) = rest.split_first() {
        let (length, tail) = match opcode {
            0..=0x4b => (opcode as usize, tail),
            OP_PUSHDATA1 => {
                let (&length, tail) = tail.split_first()?;
                (length as usize, tail)
            }
            OP_PUSHDATA2 => {
                let (length, tail) = split_array::<2>(tail)?;
                (u16::from_le_bytes(length) as usize, tail)
            }
            OP_PUSHDATA4 => {
                let (length, tail) = split_array::<4>(tail)?;
                (u32::from_le_bytes(length) as usize, tail)
            }
            _ => return None,
        };

        if tail.len() < length {
            return None;
        }

        let (data, tail) = tail.split_at(length);
        payload.extend_from_slice(data);
        rest = tail;
    }

    Some(payload)
}

fn split_array<const N: usize>(bytes: &[u8]) -> Option<([u8; N], &[u8])> {
    if bytes.len() < N {
        return None;
    }

    let (head, tail) = bytes.split_at(N);
    Some((head.try_into().ok()?, tail))
}

impl UtxoChain {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            keyring: Keyring::new(config.chain_id.clone()),
            node: OnceLock::new(),
            broker: OnceLock::new(),
            pending_funding: Mutex::new(Vec::new()),
            scan: AsyncMutex::new(()),
            config,
        }
    }

    fn utxo(&self) -> Result<&UtxoConfig, Error> {
        self.config.utxo.as_ref().ok_or_else(|| {
            Error::config_invalid(format!("chain {} has no utxo settings", self.config.name))
        })
    }

    fn node(&self) -> Result<&ChainNode, Error> {
        self.node
            .get()
            .ok_or_else(|| Error::generic(eyre!("chain {} is not initialized", self.config.chain_id)))
    }

    fn rpc_prefix(&self) -> Result<Vec<String>, Error> {
        let (_, cli) = binaries(self.config.family, &self.config.binary);
        Ok(rpc_args(&cli, self.utxo()?))
    }

    async fn rpc(&self, ctx: &Context, args: &[&str]) -> Result<String, Error> {
        rpc_on(ctx, &self.node()?.container, &self.rpc_prefix()?, args).await
    }

    async fn rpc_json(&self, ctx: &Context, args: &[&str]) -> Result<Value, Error> {
        let output = self.rpc(ctx, args).await?;
        serde_json::from_str(&output).map_err(handle_generic_error)
    }

    fn shape(&self, memo: &str) -> Result<TxShape, Error> {
        Ok(TxShape {
            segwit: self.utxo()?.segwit,
            outputs: 1,
            memo_len: (!memo.is_empty()).then_some(memo.len()),
        })
    }

    async fn ensure_wallet(&self, ctx: &Context) -> Result<(), Error> {
        // name, disable_private_keys, blank, passphrase, avoid_reuse, descriptors
        match self
            .rpc(
                ctx,
                &["createwallet", WALLET_NAME, "false", "false", "", "false", "false"],
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_method_not_found(&e) || e.to_string().contains("already exists") => {
                debug!("using the built-in wallet of {}", self.config.chain_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn addresses_by_label(&self, ctx: &Context, label: &str) -> Result<Vec<String>, Error> {
        match self.rpc_json(ctx, &["getaddressesbylabel", label]).await {
            Ok(Value::Object(map)) => Ok(map.keys().cloned().collect()),
            Ok(other) => Err(Error::generic(eyre!("unexpected addresses {}", other))),
            Err(e) if is_method_not_found(&e) => {
                let value = self.rpc_json(ctx, &["getaddressesbyaccount", label]).await?;
                Ok(value
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default())
            }
            Err(e) => Err(e),
        }
    }

    fn wallet(&self, key_name: &str, address: String, secret: String) -> Wallet {
        let wallet = Wallet {
            key_name: key_name.to_string(),
            mnemonic: secret,
            raw_address: address.as_bytes().to_vec(),
            formatted_address: address,
            chain_id: self.config.chain_id.clone(),
        };

        self.keyring.insert(wallet.clone());
        wallet
    }

    async fn wait_for_confirmation(&self, ctx: &Context, txid: &str) -> Result<(), Error> {
        let timeout = self.config.tx_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            if let Ok(tx) = self.rpc_json(ctx, &["getrawtransaction", txid, "1"]).await {
                let confirmations = tx
                    .get("confirmations")
                    .and_then(|c| c.as_u64())
                    .unwrap_or(0);

                if confirmations > 0 {
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::timeout(format!("confirmation of tx {txid}"), timeout));
            }

            ctx.sleep(POLL_INTERVAL).await?;
        }
    }

    async fn sign(&self, ctx: &Context, raw: &str) -> Result<String, Error> {
        let signed = match self.rpc_json(ctx, &["signrawtransactionwithwallet", raw]).await {
            Err(e) if is_method_not_found(&e) => {
                self.rpc_json(ctx, &["signrawtransaction", raw]).await?
            }
            res => res?,
        };

        let complete = signed.get("complete").and_then(|c| c.as_bool()).unwrap_or(false);
        if !complete {
            return Err(Error::generic(eyre!(
                "wallet could not sign transaction: {}",
                signed
            )));
        }

        signed
            .get("hex")
            .and_then(|h| h.as_str())
            .map(|h| h.to_string())
            .ok_or_else(|| Error::generic(eyre!("signed transaction has no hex")))
    }

    /// Mine `blocks` blocks with rewards going to `address`.
    pub async fn mine(&self, ctx: &Context, blocks: u64, address: &str) -> Result<(), Error> {
        let blocks = blocks.to_string();
        self.rpc(ctx, &["generatetoaddress", &blocks, address]).await?;
        Ok(())
    }

    /// The memo of a transaction sent by this chain, if it has one.
    pub async fn transaction_memo(&self, ctx: &Context, txid: &str) -> Result<Option<String>, Error> {
        let tx = self.rpc_json(ctx, &["getrawtransaction", txid, "1"]).await?;
        Ok(memo_from_transaction(&tx))
    }

    fn spawn_block_producer(&self, miner_address: String) -> Result<(), Error> {
        let broker = self
            .broker
            .get()
            .ok_or_else(|| eyre!("chain {} is not initialized", self.config.chain_id))?;

        let supervisor = broker.supervisor().clone();
        let ctx = supervisor.context();
        let container = self.node()?.container.clone();
        let prefix = self.rpc_prefix()?;
        let interval = Duration::from_millis(self.utxo()?.block_interval_ms.max(100));
        let chain_id = self.config.chain_id.clone();

        supervisor.spawn_background(format!("block producer of {chain_id}"), async move {
            let mut failures = 0;

            loop {
                ctx.sleep(interval).await?;

                match rpc_on(
                    &ctx,
                    &container,
                    &prefix,
                    &["generatetoaddress", "1", &miner_address],
                )
                .await
                {
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        warn!("failed to mine a block on {}: {}", chain_id, e);

                        if failures >= MAX_MINER_FAILURES {
                            return Err(e);
                        }
                    }
                }
            }
        });

        Ok(())
    }

    fn take_pending_funding(&self) -> Vec<WalletAmount> {
        match self.pending_funding.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl Chain for UtxoChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    fn capabilities(&self) -> ChainCapabilities {
        ChainCapabilities {
            memo_transfers: true,
            sidecars: false,
            ..Default::default()
        }
    }

    /// Fee of a one-input transfer with change.
    fn static_gas(&self) -> Amount {
        match &self.config.utxo {
            Some(utxo) => TxShape {
                segwit: utxo.segwit,
                outputs: 1,
                memo_len: None,
            }
            .fee(utxo.fee_rate, 1, true),
            None => Amount::ZERO,
        }
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

        let utxo = self.utxo()?;
        let (daemon, _) = binaries(self.config.family, &self.config.binary);
        let home = &self.config.home_dir;

        let command = format!(
            "{daemon} -regtest -server -txindex -datadir={home} -rpcuser={} -rpcpassword={} -rpcport={} -rpcbind=0.0.0.0 -rpcallowip=0.0.0.0/0 -fallbackfee=0.0002",
            utxo.rpc_user, utxo.rpc_password, utxo.rpc_port
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
            .map_err(|_| Error::generic(eyre!("chain {} initialized twice", self.config.chain_id)))?;

        let _ = self.broker.set(broker.clone());

        Ok(())
    }

    /// UTXO chains have no genesis file; `additional` wallets are funded by the faucet at start.
    async fn init_genesis(&self, _ctx: &Context, additional: &[WalletAmount]) -> Result<(), Error> {
        match self.pending_funding.lock() {
            Ok(mut pending) => pending.extend_from_slice(additional),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(additional),
        }

        Ok(())
    }

    async fn start(&self, ctx: &Context) -> Result<(), Error> {
        let node = self.node()?;
        node.release(ctx).await?;

        let timeout = self.config.readiness_timeout();
        wait_until_ready(ctx, node, timeout, 0, move || async move {
            self.rpc(ctx, &["getblockcount"])
                .await?
                .parse::<u64>()
                .map_err(handle_generic_error)
        })
        .await?;

        self.ensure_wallet(ctx).await?;

        let faucet = self.create_key(ctx, FAUCET_KEY).await?;
        let miner = self.create_key(ctx, MINER_KEY).await?;

        let maturity = self.utxo()?.maturity_blocks;
        self.mine(ctx, maturity, faucet.address()).await?;

        wait_until_ready(ctx, node, timeout, maturity, move || async move {
            self.rpc(ctx, &["getblockcount"])
                .await?
                .parse::<u64>()
                .map_err(handle_generic_error)
        })
        .await?;

        self.spawn_block_producer(miner.formatted_address)?;

        for funding in self.take_pending_funding() {
            self.send_funds(ctx, FAUCET_KEY, &funding).await?;
        }

        info!(
            "utxo chain {} ready with a matured faucet",
            self.config.chain_id
        );

        Ok(())
    }

    async fn node_heights(&self, ctx: &Context) -> Result<Vec<NodeHeight>, Error> {
        let height = self
            .rpc(ctx, &["getblockcount"])
            .await?
            .parse()
            .map_err(handle_generic_error)?;

        Ok(vec![NodeHeight {
            node: self.node()?.name(),
            height,
        }])
    }

    /// Sum of the confirmed outputs paying `address`.
    async fn get_balance(
        &self,
        ctx: &Context,
        address: &str,
        _denom: &str,
    ) -> Result<Amount, Error> {
        let descriptor = format!("[\"addr({address})\"]");

        let scanned = {
            let _scan = self.scan.lock().await;
            self.rpc_json(ctx, &["scantxoutset", "start", &descriptor])
                .await
        };

        match scanned {
            Ok(result) => parse_coin(
                result
                    .get("total_amount")
                    .ok_or_else(|| eyre!("scan result without total_amount"))?,
            ),
            Err(e) if is_method_not_found(&e) => {
                let addresses = format!("[\"{address}\"]");
                let unspent = self
                    .rpc(ctx, &["listunspent", "1", "9999999", &addresses])
                    .await?;

                let total = parse_unspent(&unspent)?
                    .iter()
                    .fold(Amount::ZERO, |sum, u| sum + u.amount);

                Ok(total)
            }
            Err(e) => Err(e),
        }
    }

    /**
       Build, sign and broadcast a transfer from the key's address.
       A memo travels in an OP_RETURN output and change returns to the
       sender's own address.
    */
    async fn send_funds_with_memo(
        &self,
        ctx: &Context,
        key_name: &str,
        amount: &WalletAmount,
        memo: &str,
    ) -> Result<String, Error> {
        if let Some(max) = self.config.family.max_memo_len() {
            if memo.len() > max {
                return Err(Error::memo_too_long(
                    self.config.chain_id.clone(),
                    memo.len(),
                    max,
                ));
            }
        }

        let sender = self.keyring.get(key_name)?;
        let _guard = self.keyring.lock_key(key_name).await;

        let utxo = self.utxo()?;
        let addresses = format!("[\"{}\"]", sender.address());
        let unspent = self
            .rpc(ctx, &["listunspent", "1", "9999999", &addresses])
            .await?;
        let unspent = parse_unspent(&unspent)?;

        let selection = select_coins(
            &unspent,
            amount.amount,
            utxo.fee_rate,
            utxo.dust_limit,
            self.shape(memo)?,
        )
        .map_err(|shortfall| {
            Error::insufficient_funds(
                self.config.chain_id.clone(),
                sender.address().to_string(),
                shortfall.required,
                shortfall.available,
            )
        })?;

        let inputs = Value::Array(
            selection
                .inputs
                .iter()
                .map(|u| serde_json::json!({ "txid": u.txid, "vout": u.vout }))
                .collect(),
        )
        .to_string();

        let mut payments = vec![(amount.address.clone(), amount.amount)];
        if !selection.change.is_zero() {
            match payments.iter_mut().find(|(a, _)| a == sender.address()) {
                Some((_, paid)) => *paid = *paid + selection.change,
                None => payments.push((sender.address().to_string(), selection.change)),
            }
        }

        let outputs = raw_outputs(&payments, (!memo.is_empty()).then_some(memo));

        let raw = self
            .rpc(ctx, &["createrawtransaction", &inputs, &outputs])
            .await?;
        let signed = self.sign(ctx, &raw).await?;
        let txid = self.rpc(ctx, &["sendrawtransaction", &signed]).await?;

        debug!(
            "sent {} from {} with fee {} in tx {}",
            amount, key_name, selection.fee, txid
        );

        self.wait_for_confirmation(ctx, &txid).await?;

        Ok(txid)
    }

    async fn create_key(&self, ctx: &Context, key_name: &str) -> Result<Wallet, Error> {
        let address = self.rpc(ctx, &["getnewaddress", key_name]).await?;

        let secret = self.rpc(ctx, &["dumpprivkey", &address]).await?;

        Ok(self.wallet(key_name, address, secret))
    }

    /// Import a WIF private key under `key_name`.
    async fn recover_key(
        &self,
        ctx: &Context,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<Wallet, Error> {
        self.rpc(ctx, &["importprivkey", mnemonic, key_name, "false"])
            .await?;

        let address = self
            .addresses_by_label(ctx, key_name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| eyre!("no address imported for key {}", key_name))?;

        Ok(self.wallet(key_name, address, mnemonic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builtin::builtin_config;
    use crate::docker::ExecOutput;
    use crate::error::ErrorKind;
    use crate::testutil::mock_broker;
    use std::sync::Arc;

    #[test]
    fn flavors_use_their_binaries() {
        assert_eq!(
            binaries(ChainFamily::Dogecoin, ""),
            ("dogecoind".to_string(), "dogecoin-cli".to_string())
        );
        assert_eq!(
            binaries(ChainFamily::BitcoinCash, ""),
            ("bitcoind".to_string(), "bitcoin-cli".to_string())
        );
        assert_eq!(
            binaries(ChainFamily::Bitcoin, "bitcoind"),
            ("bitcoind".to_string(), "bitcoin-cli".to_string())
        );
    }

    #[test]
    fn parses_unspent_outputs() {
        let text = r#"[
            {"txid":"aa","vout":0,"address":"bcrt1q","amount":50.00000000,"confirmations":101},
            {"txid":"bb","vout":2,"address":"bcrt1q","amount":0.00001,"confirmations":3}
        ]"#;

        let utxos = parse_unspent(text).unwrap();

        assert_eq!(utxos.len(), 2);
        assert_eq!(utxos[0].amount, Amount(5_000_000_000));
        assert_eq!(utxos[1].amount, Amount(1_000));
        assert_eq!(utxos[1].vout, 2);
    }

    #[test]
    fn outputs_keep_exact_amounts_and_memo() {
        let outputs = raw_outputs(
            &[
                ("bcrt1qrecipient".to_string(), Amount(10_000)),
                ("bcrt1qsender".to_string(), Amount(123_456_789)),
            ],
            Some("SWAP:ETH.ETH"),
        );

        assert_eq!(
            outputs,
            r#"{"bcrt1qrecipient":0.00010000,"bcrt1qsender":1.23456789,"data":"535741503a4554482e455448"}"#
        );

        let parsed: Value = serde_json::from_str(&outputs).unwrap();
        assert_eq!(parsed["data"], "535741503a4554482e455448");
    }

    #[test]
    fn memo_is_read_back_from_the_op_return_output() {
        let tx = serde_json::json!({
            "vout": [
                {"value": 1.0, "scriptPubKey": {"type": "witness_v0_keyhash", "asm": "0 abcd", "hex": "0014abcd"}},
                {"value": 0.0, "scriptPubKey": {
                    "type": "nulldata",
                    "asm": "OP_RETURN 535741503a4554482e455448",
                    "hex": "6a0c535741503a4554482e455448"
                }}
            ]
        });

        assert_eq!(memo_from_transaction(&tx).as_deref(), Some("SWAP:ETH.ETH"));
        assert_eq!(memo_from_transaction(&serde_json::json!({"vout": []})), None);
    }

    #[tokio::test(start_paused = true)]
    async fn balance_scans_run_one_at_a_time() {
        let (runtime, broker) = mock_broker("utxo-scan");
        runtime.set_exec_handler(|exec| {
            exec.argv
                .iter()
                .any(|a| a == "scantxoutset")
                .then(|| ExecOutput::success(r#"{"success":true,"total_amount":1.5}"#))
        });

        let ctx = Context::background();
        let network = broker.setup_network(&ctx).await.unwrap();

        let mut config = builtin_config("bitcoin").unwrap();
        config.chain_id = "bitcoin".to_string();
        let chain = Arc::new(UtxoChain::new(config));
        chain.initialize(&ctx, &broker, &network).await.unwrap();

        let running = chain.scan.lock().await;

        let waiting = {
            let chain = chain.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { chain.get_balance(&ctx, "bcrt1qsender", "btc").await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!waiting.is_finished());
        assert!(!runtime
            .exec_log()
            .iter()
            .any(|e| e.argv.iter().any(|a| a == "scantxoutset")));

        drop(running);

        assert_eq!(waiting.await.unwrap().unwrap(), Amount(150_000_000));

        broker.supervisor().close().await.unwrap();
    }

    #[tokio::test]
    async fn keys_without_a_private_key_are_errors() {
        let (runtime, broker) = mock_broker("utxo-keys");
        runtime.set_exec_handler(|exec| {
            let command = exec.argv.iter().find(|a| !a.starts_with('-') && !a.ends_with("-cli"))?;

            match command.as_str() {
                "getnewaddress" => Some(ExecOutput::success("bcrt1qfresh")),
                "dumpprivkey" => Some(ExecOutput::failure(
                    4,
                    "error code: -4\nerror message:\nPrivate key for address bcrt1qfresh is not known",
                )),
                _ => None,
            }
        });

        let ctx = Context::background();
        let network = broker.setup_network(&ctx).await.unwrap();

        let mut config = builtin_config("bitcoin").unwrap();
        config.chain_id = "bitcoin".to_string();
        let chain = UtxoChain::new(config);
        chain.initialize(&ctx, &broker, &network).await.unwrap();

        let err = chain.create_key(&ctx, "user").await.unwrap_err();
        assert!(err.to_string().contains("Private key for address bcrt1qfresh"));

        broker.supervisor().close().await.unwrap();
    }

    #[test]
    fn short_memos_survive_numeric_asm() {
        let tx = serde_json::json!({
            "vout": [
                {"value": 0.0, "scriptPubKey": {"type": "nulldata", "asm": "OP_RETURN 6437419", "hex": "6a032b3a62"}}
            ]
        });

        assert_eq!(memo_from_transaction(&tx).as_deref(), Some("+:b"));
    }

    #[test]
    fn op_return_pushes_are_decoded() {
        let memo = "=:ETH.ETH:0x8d2a6a1d2d8a0b0c4b5c2d1f0e9e8f7a6b5c4d3e:0/1/0";
        let mut script = vec![OP_RETURN, OP_PUSHDATA1, memo.len() as u8];
        script.extend_from_slice(memo.as_bytes());

        assert_eq!(op_return_payload(&script).unwrap(), memo.as_bytes());
        assert_eq!(op_return_payload(&[OP_RETURN]).unwrap(), Vec::<u8>::new());
        assert_eq!(op_return_payload(&[OP_RETURN, 0x05, 0x01]), None);
        assert_eq!(op_return_payload(&[0x76, 0xa9]), None);
    }

    #[tokio::test]
    async fn long_memos_are_rejected_before_any_rpc() {
        let mut config = builtin_config("bitcoin").unwrap();
        config.chain_id = "bitcoin".to_string();
        let chain = UtxoChain::new(config);

        let memo = "x".repeat(81);
        let err = chain
            .send_funds_with_memo(
                &Context::background(),
                FAUCET_KEY,
                &WalletAmount::new("bcrt1q", "BTC", Amount(1_000)),
                &memo,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert_eq!(chain.static_gas(), Amount(141 * 10));
    }
}
