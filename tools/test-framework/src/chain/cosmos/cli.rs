/*!
   Wrappers around the node CLI of Cosmos SDK chains, executed inside
   the node containers.

   Output formats drift between SDK versions (some commands print JSON
   to stderr, some subcommands moved), so the parsers here accept the
   known variants.
*/

use eyre::eyre;
use serde_json as json;
use tracing::{debug, trace};

use crate::chain::node::{ChainNode, RPC_PORT};
use crate::docker::ExecOutput;
use crate::error::{handle_generic_error, Error};
use crate::types::context::Context;
use crate::types::token::Amount;
use crate::util::json::find_field;

/// Gas limit used until the static gas of a chain is discovered.
pub const DEFAULT_GAS_LIMIT: u64 = 200_000;

const GAS_PRICE_DECIMALS: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOutput {
    pub name: String,
    pub address: String,
    pub mnemonic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResponse {
    pub txhash: String,
    pub code: u64,
    pub raw_log: String,
    pub height: u64,
}

/// Signing options shared by every transaction command.
#[derive(Debug, Clone)]
pub struct TxOptions<'a> {
    pub chain_id: &'a str,
    pub from: &'a str,
    pub gas: u64,
    pub fees: String,
}

fn node_flag() -> String {
    format!("tcp://localhost:{RPC_PORT}")
}

/// The text a command produced, preferring stdout.
pub fn output_text(output: &ExecOutput) -> &str {
    if output.stdout.trim().is_empty() {
        output.stderr.trim()
    } else {
        output.stdout.trim()
    }
}

async fn exec_node(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    args: &[&str],
) -> Result<ExecOutput, Error> {
    let mut argv = vec![binary];
    argv.extend_from_slice(args);
    argv.extend_from_slice(&["--home", &node.home_dir]);

    node.container.exec_checked(ctx, &argv).await
}

fn is_unknown_command(error: &Error) -> bool {
    let message = error.to_string();
    message.contains("unknown command") || message.contains("unknown flag")
}

/**
   Run `args` under the `genesis` subcommand introduced in SDK 0.47,
   falling back to the older top-level form.
*/
async fn exec_genesis(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    args: &[&str],
) -> Result<ExecOutput, Error> {
    let mut modern = vec!["genesis"];
    modern.extend_from_slice(args);

    match exec_node(ctx, node, binary, &modern).await {
        Err(e) if is_unknown_command(&e) => {
            debug!("falling back to legacy genesis command {}", args.join(" "));
            exec_node(ctx, node, binary, args).await
        }
        res => res,
    }
}

pub async fn init(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    moniker: &str,
    chain_id: &str,
) -> Result<(), Error> {
    exec_node(
        ctx,
        node,
        binary,
        &["init", moniker, "--chain-id", chain_id, "--overwrite"],
    )
    .await?;

    Ok(())
}

pub fn parse_key_output(text: &str) -> Result<KeyOutput, Error> {
    // Some versions print a warning line before the JSON document.
    let start = text
        .find('{')
        .ok_or_else(|| eyre!("no JSON in key output: {}", text))?;

    let value: json::Value = json::from_str(&text[start..]).map_err(handle_generic_error)?;

    let field = |name: &str| {
        value
            .get(name)
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
    };

    Ok(KeyOutput {
        name: field("name").unwrap_or_default(),
        address: field("address").ok_or_else(|| eyre!("expected address field"))?,
        mnemonic: field("mnemonic").unwrap_or_default(),
    })
}

pub async fn add_key(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    key_name: &str,
) -> Result<KeyOutput, Error> {
    let output = exec_node(
        ctx,
        node,
        binary,
        &[
            "keys",
            "add",
            key_name,
            "--keyring-backend",
            "test",
            "--output",
            "json",
        ],
    )
    .await?;

    parse_key_output(output_text(&output))
}

pub async fn recover_key(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    key_name: &str,
    mnemonic: &str,
    coin_type: u32,
) -> Result<KeyOutput, Error> {
    let coin_type = coin_type.to_string();
    let argv: [&str; 13] = [
        binary,
        "keys",
        "add",
        key_name,
        "--recover",
        "--coin-type",
        coin_type.as_str(),
        "--keyring-backend",
        "test",
        "--output",
        "json",
        "--home",
        node.home_dir.as_str(),
    ];

    let output = node
        .container
        .exec_checked_with_stdin(ctx, &argv, format!("{mnemonic}\n").as_bytes())
        .await?;

    let mut key = parse_key_output(output_text(&output))?;
    key.mnemonic = mnemonic.to_string();

    Ok(key)
}

pub async fn add_genesis_account(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    address: &str,
    coins: &str,
) -> Result<(), Error> {
    exec_genesis(ctx, node, binary, &["add-genesis-account", address, coins]).await?;
    Ok(())
}

pub async fn gentx(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    chain_id: &str,
    stake: &str,
) -> Result<(), Error> {
    exec_genesis(
        ctx,
        node,
        binary,
        &[
            "gentx",
            "validator",
            stake,
            "--chain-id",
            chain_id,
            "--keyring-backend",
            "test",
        ],
    )
    .await?;

    Ok(())
}

pub async fn collect_gentxs(ctx: &Context, node: &ChainNode, binary: &str) -> Result<(), Error> {
    exec_genesis(ctx, node, binary, &["collect-gentxs"]).await?;
    Ok(())
}

/// File names of the gentx documents written by [`gentx`].
pub async fn list_gentx_files(ctx: &Context, node: &ChainNode) -> Result<Vec<String>, Error> {
    let dir = node.home_path("config/gentx");
    let output = node.container.exec_checked(ctx, &["ls", &dir]).await?;

    Ok(output
        .stdout
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| line.ends_with(".json"))
        .collect())
}

pub async fn show_node_id(ctx: &Context, node: &ChainNode, binary: &str) -> Result<String, Error> {
    let output = match exec_node(ctx, node, binary, &["tendermint", "show-node-id"]).await {
        Err(e) if is_unknown_command(&e) => {
            exec_node(ctx, node, binary, &["comet", "show-node-id"]).await?
        }
        res => res?,
    };

    Ok(output_text(&output).to_string())
}

/// Extract the latest block height from `status` output of any SDK version.
pub fn parse_status_height(text: &str) -> Result<u64, Error> {
    let value: json::Value = json::from_str(text).map_err(handle_generic_error)?;

    let height = ["SyncInfo", "sync_info"]
        .iter()
        .find_map(|key| value.get(key))
        .and_then(|info| info.get("latest_block_height"))
        .ok_or_else(|| eyre!("expected latest_block_height in status output"))?;

    match height {
        json::Value::String(s) => s.parse().map_err(handle_generic_error),
        json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| Error::generic(eyre!("invalid block height {}", n))),
        _ => Err(Error::generic(eyre!("invalid block height {}", height))),
    }
}

pub async fn status_height(ctx: &Context, node: &ChainNode, binary: &str) -> Result<u64, Error> {
    let output = node
        .container
        .exec_checked(ctx, &[binary, "status", "--node", &node_flag()])
        .await?;

    parse_status_height(output_text(&output))
}

pub fn parse_balance(text: &str) -> Result<Amount, Error> {
    let value: json::Value = json::from_str(text).map_err(handle_generic_error)?;

    let amount = value
        .get("balance")
        .unwrap_or(&value)
        .get("amount")
        .ok_or_else(|| eyre!("expected amount field"))?
        .as_str()
        .ok_or_else(|| eyre!("expected string field"))?;

    amount.parse()
}

pub async fn query_balance(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    address: &str,
    denom: &str,
) -> Result<Amount, Error> {
    let output = node
        .container
        .exec_checked(
            ctx,
            &[
                binary,
                "query",
                "bank",
                "balances",
                address,
                "--denom",
                denom,
                "--node",
                &node_flag(),
                "--output",
                "json",
            ],
        )
        .await?;

    parse_balance(output_text(&output))
}

pub fn parse_tx_response(text: &str) -> Result<TxResponse, Error> {
    let start = text
        .find('{')
        .ok_or_else(|| eyre!("no JSON in tx output: {}", text))?;

    let value: json::Value = json::from_str(&text[start..]).map_err(handle_generic_error)?;

    let as_u64 = |v: Option<&json::Value>| match v {
        Some(json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    };

    Ok(TxResponse {
        txhash: value
            .get("txhash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| eyre!("expected txhash field"))?
            .to_string(),
        code: as_u64(value.get("code")),
        raw_log: value
            .get("raw_log")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        height: as_u64(value.get("height")),
    })
}

async fn exec_tx(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    options: &TxOptions<'_>,
    args: &[&str],
) -> Result<TxResponse, Error> {
    let gas = options.gas.to_string();
    let node_address = node_flag();

    let mut argv: Vec<&str> = vec!["tx"];
    argv.extend_from_slice(args);
    argv.extend_from_slice(&[
        "--from",
        options.from,
        "--chain-id",
        options.chain_id,
        "--keyring-backend",
        "test",
        "--gas",
        &gas,
        "--fees",
        &options.fees,
        "--node",
        &node_address,
        "--output",
        "json",
        "--yes",
    ]);

    let output = exec_node(ctx, node, binary, &argv).await?;
    let response = parse_tx_response(output_text(&output))?;

    trace!("tx {} broadcast with code {}", response.txhash, response.code);

    if response.code != 0 {
        return Err(Error::tx_rejected(
            options.chain_id.to_string(),
            response.code,
            response.raw_log,
        ));
    }

    Ok(response)
}

pub async fn bank_send(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    options: &TxOptions<'_>,
    recipient: &str,
    coin: &str,
    memo: &str,
) -> Result<TxResponse, Error> {
    let sender = options.from;
    exec_tx(
        ctx,
        node,
        binary,
        options,
        &["bank", "send", sender, recipient, coin, "--note", memo],
    )
    .await
}

/// The committed transaction, or `None` while it is not yet indexed.
pub async fn query_tx(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    txhash: &str,
) -> Result<Option<TxResponse>, Error> {
    let output = node
        .container
        .exec(
            ctx,
            &[
                binary,
                "query",
                "tx",
                txhash,
                "--node",
                &node_flag(),
                "--output",
                "json",
            ],
        )
        .await?;

    if !output.is_success() {
        return Ok(None);
    }

    parse_tx_response(output_text(&output)).map(Some)
}

/// Parse the `gas estimate: N` line printed by `--dry-run`.
pub fn parse_gas_estimate(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.trim().strip_prefix("gas estimate:"))
        .and_then(|n| n.trim().parse().ok())
}

/**
   Gas used by a bank send, measured with `--gas auto --dry-run`. A
   failed simulation or an output without an estimate is an error.
*/
pub async fn estimate_send_gas(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    chain_id: &str,
    from: &str,
    recipient: &str,
    coin: &str,
) -> Result<u64, Error> {
    let output = node
        .container
        .exec_checked(
            ctx,
            &[
                binary,
                "tx",
                "bank",
                "send",
                from,
                recipient,
                coin,
                "--chain-id",
                chain_id,
                "--keyring-backend",
                "test",
                "--node",
                &node_flag(),
                "--gas",
                "auto",
                "--dry-run",
                "--home",
                &node.home_dir,
            ],
        )
        .await?;

    let text = format!("{}\n{}", output.stdout, output.stderr);

    parse_gas_estimate(&text).ok_or_else(|| {
        Error::generic(eyre!(
            "no gas estimate in the dry run of a send on chain {}: {}",
            chain_id,
            text.trim()
        ))
    })
}

/**
   Fee for `gas` units at a decimal `gas_price` such as `"0.025"`,
   rounded up to the smallest unit.
*/
pub fn fee_for_gas(gas: u64, gas_price: &str) -> Result<Amount, Error> {
    let price = Amount::from_decimal_str(gas_price, GAS_PRICE_DECIMALS)?;
    let scale = 10u128.pow(GAS_PRICE_DECIMALS);

    let total = price
        .0
        .checked_mul(gas as u128)
        .ok_or_else(|| eyre!("fee overflow for {} gas at {}", gas, gas_price))?;

    Ok(Amount((total + scale - 1) / scale))
}

pub async fn submit_consumer_addition(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    options: &TxOptions<'_>,
    proposal_file: &str,
) -> Result<TxResponse, Error> {
    match exec_tx(
        ctx,
        node,
        binary,
        options,
        &[
            "gov",
            "submit-legacy-proposal",
            "consumer-addition",
            proposal_file,
        ],
    )
    .await
    {
        Err(e) if is_unknown_command(&e) => {
            exec_tx(
                ctx,
                node,
                binary,
                options,
                &["gov", "submit-proposal", "consumer-addition", proposal_file],
            )
            .await
        }
        res => res,
    }
}

pub async fn vote_yes(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    options: &TxOptions<'_>,
    proposal_id: u64,
) -> Result<TxResponse, Error> {
    let id = proposal_id.to_string();
    exec_tx(ctx, node, binary, options, &["gov", "vote", &id, "yes"]).await
}

async fn query_json(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    args: &[&str],
) -> Result<json::Value, Error> {
    let node_address = node_flag();

    let mut argv = vec!["query"];
    argv.extend_from_slice(args);
    argv.extend_from_slice(&["--node", &node_address, "--output", "json"]);

    let output = exec_node(ctx, node, binary, &argv).await?;

    json::from_str(output_text(&output)).map_err(handle_generic_error)
}

pub fn parse_proposal_status(value: &json::Value) -> Result<String, Error> {
    find_field(value, "status")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::generic(eyre!("expected proposal status in {}", value)))
}

pub async fn proposal_status(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    proposal_id: u64,
) -> Result<String, Error> {
    let id = proposal_id.to_string();
    let value = query_json(ctx, node, binary, &["gov", "proposal", &id]).await?;
    parse_proposal_status(&value)
}

/// Highest proposal id known to the chain.
pub fn parse_latest_proposal_id(value: &json::Value) -> Option<u64> {
    value
        .get("proposals")?
        .as_array()?
        .iter()
        .filter_map(|p| {
            let id = p.get("id").or_else(|| p.get("proposal_id"))?;
            match id {
                json::Value::String(s) => s.parse().ok(),
                json::Value::Number(n) => n.as_u64(),
                _ => None,
            }
        })
        .max()
}

pub async fn latest_proposal_id(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
) -> Result<u64, Error> {
    let value = query_json(ctx, node, binary, &["gov", "proposals"]).await?;

    parse_latest_proposal_id(&value)
        .ok_or_else(|| Error::generic(eyre!("no governance proposal found")))
}

pub async fn consumer_genesis(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    consumer_chain_id: &str,
) -> Result<json::Value, Error> {
    query_json(
        ctx,
        node,
        binary,
        &["provider", "consumer-genesis", consumer_chain_id],
    )
    .await
}

pub async fn list_consumer_chains(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
) -> Result<Vec<String>, Error> {
    let value = query_json(ctx, node, binary, &["provider", "list-consumer-chains"]).await?;

    Ok(value
        .get("chains")
        .and_then(|c| c.as_array())
        .map(|chains| {
            chains
                .iter()
                .filter_map(|c| c.get("chain_id").and_then(|id| id.as_str()))
                .map(|id| id.to_string())
                .collect()
        })
        .unwrap_or_default())
}

/// Id of the light client tracking `counterparty_chain_id`, if any.
pub fn parse_client_for_chain(value: &json::Value, counterparty_chain_id: &str) -> Option<String> {
    value
        .get("client_states")?
        .as_array()?
        .iter()
        .find(|state| {
            find_field(state, "chain_id").and_then(|id| id.as_str()) == Some(counterparty_chain_id)
        })
        .and_then(|state| state.get("client_id"))
        .and_then(|id| id.as_str())
        .map(|id| id.to_string())
}

pub async fn client_for_chain(
    ctx: &Context,
    node: &ChainNode,
    binary: &str,
    counterparty_chain_id: &str,
) -> Result<String, Error> {
    let value = query_json(ctx, node, binary, &["ibc", "client", "states"]).await?;

    parse_client_for_chain(&value, counterparty_chain_id).ok_or_else(|| {
        Error::generic(eyre!(
            "no light client for chain {} on node {}",
            counterparty_chain_id,
            node.name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::node::{create_node, NodeSpec};
    use crate::docker::mock::MockRuntime;
    use crate::docker::ImageRef;
    use crate::error::ErrorKind;
    use crate::testutil::mock_broker;
    use serde_json::json;

    async fn simulating_node(
        runtime: &MockRuntime,
        broker: &crate::docker::DockerBroker,
        simulation: ExecOutput,
    ) -> ChainNode {
        runtime.set_exec_handler(move |exec| {
            exec.argv
                .iter()
                .any(|a| a == "--dry-run")
                .then(|| simulation.clone())
        });

        let ctx = Context::background();
        let network = broker.setup_network(&ctx).await.unwrap();

        create_node(
            &ctx,
            broker,
            &network,
            NodeSpec {
                chain_id: "gaia-1",
                index: 0,
                validator: true,
                image: &ImageRef::new("mock/gaia", "v1"),
                home_dir: "/home/gaia",
                entrypoint: Vec::new(),
                env: Vec::new(),
            },
        )
        .await
        .unwrap()
    }

    async fn estimate(node: &ChainNode) -> Result<u64, Error> {
        estimate_send_gas(
            &Context::background(),
            node,
            "gaiad",
            "gaia-1",
            "faucet",
            "cosmos1faucet",
            "1stake",
        )
        .await
    }

    #[tokio::test]
    async fn gas_is_read_from_the_dry_run() {
        let (runtime, broker) = mock_broker("gas");
        let mut output = ExecOutput::success("");
        output.stderr = "gas estimate: 81234\n".to_string();

        let node = simulating_node(&runtime, &broker, output).await;

        assert_eq!(estimate(&node).await.unwrap(), 81234);

        broker.supervisor().close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_simulations_are_errors() {
        let (runtime, broker) = mock_broker("gas-fail");
        let node = simulating_node(
            &runtime,
            &broker,
            ExecOutput::failure(1, "account cosmos1faucet not found"),
        )
        .await;

        let err = estimate(&node).await.unwrap_err();
        assert!(err.to_string().contains("account cosmos1faucet not found"));
        broker.supervisor().close().await.unwrap();

        let (runtime, broker) = mock_broker("gas-missing");
        let node = simulating_node(&runtime, &broker, ExecOutput::success("{}")).await;

        let err = estimate(&node).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(err.to_string().contains("no gas estimate"));

        broker.supervisor().close().await.unwrap();
    }

    #[test]
    fn parses_status_of_any_version() {
        let old = r#"{"NodeInfo":{},"SyncInfo":{"latest_block_height":"17"}}"#;
        let new = r#"{"node_info":{},"sync_info":{"latest_block_height":"4"}}"#;

        assert_eq!(parse_status_height(old).unwrap(), 17);
        assert_eq!(parse_status_height(new).unwrap(), 4);
        assert!(parse_status_height(r#"{"sync_info":{}}"#).is_err());
    }

    #[test]
    fn parses_key_output_after_warning() {
        let text = "WARNING: keyring is insecure\n{\"name\":\"alice\",\"type\":\"local\",\"address\":\"cosmos1abc\",\"mnemonic\":\"word word\"}";
        let key = parse_key_output(text).unwrap();

        assert_eq!(key.name, "alice");
        assert_eq!(key.address, "cosmos1abc");
        assert_eq!(key.mnemonic, "word word");
    }

    #[test]
    fn parses_tx_responses() {
        let ok = parse_tx_response(r#"{"height":"0","txhash":"ABCD","code":0,"raw_log":"[]"}"#)
            .unwrap();
        assert_eq!(ok.txhash, "ABCD");
        assert_eq!(ok.code, 0);

        let rejected = parse_tx_response(
            r#"{"height":"0","txhash":"EF01","code":5,"raw_log":"insufficient funds"}"#,
        )
        .unwrap();
        assert_eq!(rejected.code, 5);
        assert_eq!(rejected.raw_log, "insufficient funds");
    }

    #[test]
    fn parses_balances_and_gas() {
        assert_eq!(parse_balance(r#"{"denom":"uatom","amount":"1500"}"#).unwrap(), Amount(1500));
        assert_eq!(
            parse_balance(r#"{"balance":{"denom":"uatom","amount":"7"}}"#).unwrap(),
            Amount(7)
        );

        assert_eq!(parse_gas_estimate("gas estimate: 81234\n"), Some(81234));
        assert_eq!(parse_gas_estimate("nothing"), None);
    }

    #[test]
    fn fees_round_up() {
        assert_eq!(fee_for_gas(200_000, "0.01").unwrap(), Amount(2_000));
        assert_eq!(fee_for_gas(3, "0.5").unwrap(), Amount(2));
        assert_eq!(fee_for_gas(100, "0").unwrap(), Amount::ZERO);
    }

    #[test]
    fn finds_proposals_and_clients() {
        let proposals = json!({ "proposals": [{ "id": "1" }, { "proposal_id": "3" }] });
        assert_eq!(parse_latest_proposal_id(&proposals), Some(3));

        let proposal = json!({ "proposal": { "status": "PROPOSAL_STATUS_PASSED" } });
        assert_eq!(parse_proposal_status(&proposal).unwrap(), "PROPOSAL_STATUS_PASSED");

        let clients = json!({
            "client_states": [
                { "client_id": "07-tendermint-0", "client_state": { "chain_id": "provider-1" } },
                { "client_id": "07-tendermint-1", "client_state": { "chain_id": "other-1" } }
            ]
        });
        assert_eq!(
            parse_client_for_chain(&clients, "other-1").as_deref(),
            Some("07-tendermint-1")
        );
        assert_eq!(parse_client_for_chain(&clients, "missing-1"), None);
    }
}
