/*!
   Backend driving the hermes relayer CLI inside its container.

   Hermes runs a single relay loop for every configured chain, so
   starting the first path launches `hermes start` and stopping the last
   relaying path kills it.
*/

use async_trait::async_trait;
use eyre::eyre;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::{debug, warn};

use super::{
    default_image, ChannelEnd, ChannelInfo, ChannelOrdering, CreateChannelOptions, IdPair,
    PathRecord, PendingPackets, RelayerBackend, RelayerHost, RelayerKind,
};
use crate::chain::traits::ChainEndpoint;
use crate::docker::{DockerBroker, ImageRef, NetworkId};
use crate::error::{handle_generic_error, Error};
use crate::reporter::ExecReporter;
use crate::types::context::Context;
use crate::util::json::find_str;

const CONFIG_FILE: &str = "config.toml";
const KEY_NAME: &str = "relayer";

#[derive(Debug, Clone, Serialize)]
pub struct HermesConfig {
    pub global: GlobalConfig,
    pub mode: ModeConfig,
    pub rest: Toggle,
    pub telemetry: Toggle,
    pub chains: Vec<HermesChainConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Toggle {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeConfig {
    pub clients: ClientsMode,
    pub connections: Toggle,
    pub channels: Toggle,
    pub packets: PacketsMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientsMode {
    pub enabled: bool,
    pub refresh: bool,
    pub misbehaviour: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PacketsMode {
    pub enabled: bool,
    pub clear_interval: u64,
    pub clear_on_start: bool,
    pub tx_confirmation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventSource {
    pub mode: String,
    pub url: String,
    pub batch_delay: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GasPrice {
    pub price: f64,
    pub denom: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrustThreshold {
    pub numerator: String,
    pub denominator: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HermesChainConfig {
    pub id: String,
    pub r#type: String,
    pub rpc_addr: String,
    pub grpc_addr: String,
    pub event_source: EventSource,
    pub rpc_timeout: String,
    pub account_prefix: String,
    pub key_name: String,
    pub key_store_type: String,
    pub store_prefix: String,
    pub max_gas: u64,
    pub gas_multiplier: f64,
    pub gas_price: GasPrice,
    pub max_block_time: String,
    pub clock_drift: String,
    pub trusting_period: String,
    pub ccv_consumer_chain: bool,
    pub trust_threshold: TrustThreshold,
}

impl HermesConfig {
    pub fn new(chains: Vec<HermesChainConfig>) -> Self {
        Self {
            global: GlobalConfig {
                log_level: "info".to_string(),
            },
            mode: ModeConfig {
                clients: ClientsMode {
                    enabled: true,
                    refresh: true,
                    misbehaviour: false,
                },
                connections: Toggle { enabled: false },
                channels: Toggle { enabled: false },
                packets: PacketsMode {
                    enabled: true,
                    clear_interval: 100,
                    clear_on_start: true,
                    tx_confirmation: true,
                },
            },
            rest: Toggle { enabled: false },
            telemetry: Toggle { enabled: false },
            chains,
        }
    }

    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(handle_generic_error)
    }
}

/// `http://host:26657` becomes `ws://host:26657/websocket`.
pub fn websocket_address(rpc_address: &str) -> String {
    let host = rpc_address
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');

    format!("ws://{host}/websocket")
}

pub fn chain_config(chain: &ChainEndpoint) -> HermesChainConfig {
    HermesChainConfig {
        id: chain.chain_id.clone(),
        r#type: "CosmosSdk".to_string(),
        rpc_addr: chain.rpc_address.clone(),
        grpc_addr: chain.grpc_address.clone(),
        event_source: EventSource {
            mode: "push".to_string(),
            url: websocket_address(&chain.rpc_address),
            batch_delay: "500ms".to_string(),
        },
        rpc_timeout: "10s".to_string(),
        account_prefix: chain.account_prefix.clone(),
        key_name: KEY_NAME.to_string(),
        key_store_type: "Test".to_string(),
        store_prefix: "ibc".to_string(),
        max_gas: 3_000_000,
        gas_multiplier: chain.gas_adjustment.max(1.1),
        gas_price: GasPrice {
            price: chain.gas_price.parse().unwrap_or(0.0),
            denom: chain.denom.clone(),
        },
        max_block_time: "30s".to_string(),
        clock_drift: "5s".to_string(),
        trusting_period: if chain.trusting_period.is_empty() {
            "14days".to_string()
        } else {
            chain.trusting_period.clone()
        },
        ccv_consumer_chain: chain.ccv_consumer,
        trust_threshold: TrustThreshold {
            numerator: "1".to_string(),
            denominator: "3".to_string(),
        },
    }
}

/**
   The result of a `hermes --json` command: the last stdout line that
   carries a `status` field. An `error` status fails.
*/
pub fn parse_json_result(stdout: &str) -> Result<Value, Error> {
    let line = stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .find(|value| value.get("status").is_some())
        .ok_or_else(|| eyre!("no hermes result found in output: {}", stdout))?;

    match line.get("status").and_then(|s| s.as_str()) {
        Some("success") => Ok(line.get("result").cloned().unwrap_or(Value::Null)),
        _ => Err(Error::generic(eyre!(
            "hermes command failed: {}",
            line.get("result").cloned().unwrap_or(Value::Null)
        ))),
    }
}

fn side_id(result: &Value, side: &str, field: &str) -> Result<String, Error> {
    result
        .get(side)
        .and_then(|s| find_str(s, field))
        .map(|s| s.to_string())
        .ok_or_else(|| Error::generic(eyre!("no {} for {} in hermes result {}", field, side, result)))
}

fn count_entries(value: &Value, side: &str, field: &str) -> usize {
    value
        .get(side)
        .and_then(|s| s.get(field))
        .and_then(|f| f.as_array())
        .map(|a| a.len())
        .unwrap_or(0)
}

/// The address in `Restored key 'relayer' (cosmos1...) on chain gaia-1`.
pub fn parse_restored_address(result: &Value) -> Option<String> {
    let text = result.as_str()?;
    let start = text.find('(')? + 1;
    let end = text[start..].find(')')? + start;
    Some(text[start..end].to_string())
}

pub struct HermesBackend {
    name: String,
    image: ImageRef,
    home_dir: String,
    host: OnceLock<RelayerHost>,
    chains: Mutex<BTreeMap<String, ChainEndpoint>>,
    relaying: Mutex<BTreeSet<String>>,
}

impl HermesBackend {
    pub fn new(name: &str) -> Self {
        let (image, home_dir) = default_image(RelayerKind::Hermes);
        Self::with_image(name, image, home_dir)
    }

    pub fn with_image(name: &str, image: ImageRef, home_dir: &str) -> Self {
        Self {
            name: name.to_string(),
            image,
            home_dir: home_dir.to_string(),
            host: OnceLock::new(),
            chains: Mutex::new(BTreeMap::new()),
            relaying: Mutex::new(BTreeSet::new()),
        }
    }

    fn host(&self) -> Result<&RelayerHost, Error> {
        self.host
            .get()
            .ok_or_else(|| Error::generic(eyre!("relayer {} is not set up", self.name)))
    }

    fn chains(&self) -> MutexGuard<'_, BTreeMap<String, ChainEndpoint>> {
        match self.chains.lock() {
            Ok(chains) => chains,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn relaying(&self) -> MutexGuard<'_, BTreeSet<String>> {
        match self.relaying.lock() {
            Ok(relaying) => relaying,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn config_path(&self) -> String {
        format!("{}/{}", self.home_dir, CONFIG_FILE)
    }

    /// Run `hermes --config <file> --json <args>` and return its result.
    async fn hermes(&self, ctx: &Context, args: &[&str]) -> Result<Value, Error> {
        let config = self.config_path();

        let mut argv = vec!["hermes", "--config", config.as_str(), "--json"];
        argv.extend_from_slice(args);

        let output = self.host()?.exec(ctx, &argv).await?;
        parse_json_result(&output.stdout)
    }

    async fn write_config(&self, ctx: &Context) -> Result<(), Error> {
        let chains = self.chains().values().map(chain_config).collect();
        let config = HermesConfig::new(chains).to_toml()?;

        self.host()?.write_file(ctx, CONFIG_FILE, &config).await?;
        Ok(())
    }

    async fn create_client(&self, ctx: &Context, host_chain: &str, reference_chain: &str) -> Result<String, Error> {
        let result = self
            .hermes(
                ctx,
                &[
                    "create",
                    "client",
                    "--host-chain",
                    host_chain,
                    "--reference-chain",
                    reference_chain,
                ],
            )
            .await?;

        find_str(&result, "client_id")
            .map(|s| s.to_string())
            .ok_or_else(|| Error::generic(eyre!("no client id in hermes result {}", result)))
    }
}

#[async_trait]
impl RelayerBackend for HermesBackend {
    fn kind(&self) -> RelayerKind {
        RelayerKind::Hermes
    }

    async fn setup(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
        reporter: Option<ExecReporter>,
    ) -> Result<(), Error> {
        let host = RelayerHost::create(
            ctx,
            broker,
            network,
            &self.name,
            &self.image,
            &self.home_dir,
            reporter,
        )
        .await?;

        self.host
            .set(host)
            .map_err(|_| Error::generic(eyre!("relayer {} set up twice", self.name)))?;

        self.write_config(ctx).await
    }

    async fn add_chain(&self, ctx: &Context, chain: &ChainEndpoint) -> Result<(), Error> {
        self.chains()
            .insert(chain.chain_id.clone(), chain.clone());

        self.write_config(ctx).await
    }

    async fn restore_key(
        &self,
        ctx: &Context,
        chain_id: &str,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<String, Error> {
        let coin_type = self
            .chains()
            .get(chain_id)
            .map(|c| c.coin_type)
            .ok_or_else(|| eyre!("chain {} was not added to relayer {}", chain_id, self.name))?;

        let mnemonic_file = self
            .host()?
            .write_file(ctx, &format!("{chain_id}.mnemonic"), mnemonic)
            .await?;

        let hd_path = format!("m/44'/{coin_type}'/0'/0/0");

        let result = self
            .hermes(
                ctx,
                &[
                    "keys",
                    "add",
                    "--chain",
                    chain_id,
                    "--key-name",
                    key_name,
                    "--mnemonic-file",
                    &mnemonic_file,
                    "--hd-path",
                    &hd_path,
                    "--overwrite",
                ],
            )
            .await?;

        let address = parse_restored_address(&result).unwrap_or_default();
        debug!("restored hermes key {} on {}: {}", key_name, chain_id, address);

        Ok(address)
    }

    async fn generate_path(&self, _ctx: &Context, path: &PathRecord) -> Result<(), Error> {
        let chains = self.chains();

        for chain_id in [&path.chain_a, &path.chain_b] {
            if !chains.contains_key(chain_id) {
                return Err(Error::config_invalid(format!(
                    "chain {} of path {} was not added to relayer {}",
                    chain_id, path.name, self.name
                )));
            }
        }

        Ok(())
    }

    async fn create_clients(&self, ctx: &Context, path: &PathRecord) -> Result<IdPair, Error> {
        let a = self.create_client(ctx, &path.chain_a, &path.chain_b).await?;
        let b = self.create_client(ctx, &path.chain_b, &path.chain_a).await?;

        Ok(IdPair { a, b })
    }

    async fn create_connections(
        &self,
        ctx: &Context,
        path: &PathRecord,
        clients: &IdPair,
    ) -> Result<IdPair, Error> {
        let result = self
            .hermes(
                ctx,
                &[
                    "create",
                    "connection",
                    "--a-chain",
                    &path.chain_a,
                    "--a-client",
                    &clients.a,
                    "--b-client",
                    &clients.b,
                ],
            )
            .await?;

        Ok(IdPair {
            a: side_id(&result, "a_side", "connection_id")?,
            b: side_id(&result, "b_side", "connection_id")?,
        })
    }

    async fn create_channel(
        &self,
        ctx: &Context,
        path: &PathRecord,
        connections: &IdPair,
        options: &CreateChannelOptions,
    ) -> Result<ChannelInfo, Error> {
        let result = self
            .hermes(
                ctx,
                &[
                    "create",
                    "channel",
                    "--a-chain",
                    &path.chain_a,
                    "--a-connection",
                    &connections.a,
                    "--a-port",
                    &options.source_port,
                    "--b-port",
                    &options.destination_port,
                    "--order",
                    options.ordering.as_str(),
                    "--channel-version",
                    &options.version,
                ],
            )
            .await?;

        Ok(ChannelInfo {
            a_side: ChannelEnd {
                port_id: options.source_port.clone(),
                channel_id: side_id(&result, "a_side", "channel_id")?,
            },
            b_side: ChannelEnd {
                port_id: options.destination_port.clone(),
                channel_id: side_id(&result, "b_side", "channel_id")?,
            },
            ordering: match find_str(&result, "ordering") {
                Some(o) if o.eq_ignore_ascii_case("ordered") => ChannelOrdering::Ordered,
                Some(_) => ChannelOrdering::Unordered,
                None => options.ordering,
            },
            version: options.version.clone(),
        })
    }

    async fn start(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error> {
        let first = {
            let mut relaying = self.relaying();
            let first = relaying.is_empty();
            relaying.insert(path.name.clone());
            first
        };

        if !first {
            debug!("hermes {} is already relaying", self.name);
            return Ok(());
        }

        let config = self.config_path();
        let log = format!("{}/hermes.log", self.home_dir);
        let command = format!("hermes --config {config} start > {log} 2>&1");

        self.host()?
            .exec_detached(ctx, &["sh", "-c", &command])
            .await
    }

    async fn stop(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error> {
        let last = {
            let mut relaying = self.relaying();
            relaying.remove(&path.name);
            relaying.is_empty()
        };

        if !last {
            return Ok(());
        }

        if let Err(e) = self.host()?.exec(ctx, &["pkill", "-f", "hermes --config"]).await {
            warn!("failed to stop hermes {}: {}", self.name, e);
        }

        Ok(())
    }

    async fn pending_packets(
        &self,
        ctx: &Context,
        path: &PathRecord,
        channel: &ChannelInfo,
    ) -> Result<PendingPackets, Error> {
        let result = self
            .hermes(
                ctx,
                &[
                    "query",
                    "packet",
                    "pending",
                    "--chain",
                    &path.chain_a,
                    "--port",
                    &channel.a_side.port_id,
                    "--channel",
                    &channel.a_side.channel_id,
                ],
            )
            .await?;

        Ok(PendingPackets {
            unreceived_packets: count_entries(&result, "src", "unreceived_packets")
                + count_entries(&result, "dst", "unreceived_packets"),
            unreceived_acks: count_entries(&result, "src", "unreceived_acks")
                + count_entries(&result, "dst", "unreceived_acks"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::chain_type::ChainFamily;
    use serde_json::json;

    fn endpoint(chain_id: &str) -> ChainEndpoint {
        ChainEndpoint {
            chain_id: chain_id.to_string(),
            name: "gaia".to_string(),
            family: ChainFamily::Cosmos,
            rpc_address: format!("http://{chain_id}-val-0:26657"),
            grpc_address: format!("http://{chain_id}-val-0:9090"),
            account_prefix: "cosmos".to_string(),
            denom: "uatom".to_string(),
            gas_price: "0.01".to_string(),
            gas_adjustment: 1.3,
            trusting_period: "336h".to_string(),
            coin_type: 118,
            ccv_consumer: false,
        }
    }

    #[test]
    fn config_renders_chains() {
        let config = HermesConfig::new(vec![chain_config(&endpoint("gaia-1"))])
            .to_toml()
            .unwrap();

        let parsed: toml::Value = toml::from_str(&config).unwrap();
        let chain = &parsed["chains"][0];

        assert_eq!(chain["id"].as_str(), Some("gaia-1"));
        assert_eq!(chain["type"].as_str(), Some("CosmosSdk"));
        assert_eq!(
            chain["event_source"]["url"].as_str(),
            Some("ws://gaia-1-val-0:26657/websocket")
        );
        assert_eq!(chain["gas_price"]["denom"].as_str(), Some("uatom"));
        assert_eq!(parsed["mode"]["packets"]["enabled"].as_bool(), Some(true));
    }

    #[test]
    fn results_are_taken_from_the_status_line() {
        let stdout = r#"{"timestamp":"...","level":"INFO","fields":{"message":"creating connection"}}
{"result":{"a_side":{"client_id":"07-tendermint-0","connection_id":"connection-0"},"b_side":{"client_id":"07-tendermint-1","connection_id":"connection-3"}},"status":"success"}"#;

        let result = parse_json_result(stdout).unwrap();

        assert_eq!(side_id(&result, "a_side", "connection_id").unwrap(), "connection-0");
        assert_eq!(side_id(&result, "b_side", "connection_id").unwrap(), "connection-3");

        let failed = parse_json_result(r#"{"result":"client not found","status":"error"}"#);
        assert!(failed.unwrap_err().to_string().contains("client not found"));
    }

    #[test]
    fn restored_address_and_pending_counts() {
        let restored = json!("Restored key 'relayer' (cosmos1abc) on chain gaia-1");
        assert_eq!(parse_restored_address(&restored).as_deref(), Some("cosmos1abc"));

        let pending = json!({
            "src": { "unreceived_packets": [1, 2], "unreceived_acks": [] },
            "dst": { "unreceived_packets": [], "unreceived_acks": [7] },
        });

        assert_eq!(count_entries(&pending, "src", "unreceived_packets"), 2);
        assert_eq!(count_entries(&pending, "dst", "unreceived_acks"), 1);
    }
}
