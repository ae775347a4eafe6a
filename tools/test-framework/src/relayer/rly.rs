/*!
   Backend driving the cosmos go relayer (`rly`) inside its container.
   Each path gets its own `rly start` process.
*/

use async_trait::async_trait;
use eyre::eyre;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::{debug, warn};

use super::{
    default_image, ChannelEnd, ChannelInfo, CreateChannelOptions, IdPair, PathRecord,
    PendingPackets, RelayerBackend, RelayerHost, RelayerKind,
};
use crate::chain::traits::ChainEndpoint;
use crate::docker::{DockerBroker, ExecOutput, ImageRef, NetworkId};
use crate::error::{handle_generic_error, Error};
use crate::reporter::ExecReporter;
use crate::types::context::Context;
use crate::util::json::find_str;

pub struct RlyBackend {
    name: String,
    image: ImageRef,
    home_dir: String,
    host: OnceLock<RelayerHost>,
    chains: Mutex<BTreeMap<String, ChainEndpoint>>,
}

/// The chain file consumed by `rly chains add --file`.
pub fn chain_file(chain: &ChainEndpoint, key_name: &str) -> Value {
    json!({
        "type": "cosmos",
        "value": {
            "key": key_name,
            "chain-id": chain.chain_id,
            "rpc-addr": chain.rpc_address,
            "account-prefix": chain.account_prefix,
            "keyring-backend": "test",
            "gas-adjustment": chain.gas_adjustment,
            "gas-prices": format!("{}{}", chain.gas_price, chain.denom),
            "coin-type": chain.coin_type,
            "debug": false,
            "timeout": "20s",
            "output-format": "json",
            "sign-mode": "direct",
        }
    })
}

/// Parse `rly` output made of one JSON document per line.
pub fn parse_json_lines(stdout: &str) -> Vec<Value> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str(line.trim()).ok())
        .collect()
}

/// Client or connection ids of both ends from `rly paths show --json`.
pub fn path_ids(show: &Value, field: &str) -> Result<IdPair, Error> {
    let path = show.get("path").unwrap_or(show);

    let side = |name: &str| {
        path.get(name)
            .and_then(|s| find_str(s, field))
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
            .ok_or_else(|| Error::generic(eyre!("path has no {} on {}: {}", field, name, show)))
    };

    Ok(IdPair {
        a: side("src")?,
        b: side("dst")?,
    })
}

/**
   The newest channel on `port_id` among the entries printed by
   `rly q connection-channels`.
*/
pub fn latest_channel(channels: &[Value], port_id: &str) -> Option<(String, String, String)> {
    channels
        .iter()
        .filter(|c| find_str(c, "port_id") == Some(port_id))
        .filter_map(|c| {
            let channel_id = c.get("channel_id")?.as_str()?.to_string();
            let counterparty = c.get("counterparty")?;
            Some((
                channel_id,
                counterparty.get("port_id")?.as_str()?.to_string(),
                counterparty.get("channel_id")?.as_str()?.to_string(),
            ))
        })
        .max_by_key(|(id, _, _)| {
            id.trim_start_matches("channel-")
                .parse::<u64>()
                .unwrap_or(0)
        })
}

fn count_side(value: &Value, side: &str) -> usize {
    value
        .get(side)
        .and_then(|s| s.as_array())
        .map(|a| a.len())
        .unwrap_or(0)
}

impl RlyBackend {
    pub fn new(name: &str) -> Self {
        let (image, home_dir) = default_image(RelayerKind::Rly);
        Self::with_image(name, image, home_dir)
    }

    pub fn with_image(name: &str, image: ImageRef, home_dir: &str) -> Self {
        Self {
            name: name.to_string(),
            image,
            home_dir: home_dir.to_string(),
            host: OnceLock::new(),
            chains: Mutex::new(BTreeMap::new()),
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

    /// Run `rly <args> --home <home>`.
    async fn rly(&self, ctx: &Context, args: &[&str]) -> Result<ExecOutput, Error> {
        let mut argv = vec!["rly"];
        argv.extend_from_slice(args);
        argv.extend_from_slice(&["--home", &self.home_dir]);

        self.host()?.exec(ctx, &argv).await
    }

    async fn show_path(&self, ctx: &Context, path: &PathRecord) -> Result<Value, Error> {
        let output = self.rly(ctx, &["paths", "show", &path.name, "--json"]).await?;
        serde_json::from_str(output.stdout.trim()).map_err(handle_generic_error)
    }

    async fn unrelayed(&self, ctx: &Context, query: &str, path: &PathRecord, channel_id: &str) -> Result<Value, Error> {
        let output = self
            .rly(ctx, &["q", query, &path.name, channel_id])
            .await?;

        serde_json::from_str(output.stdout.trim()).map_err(handle_generic_error)
    }
}

#[async_trait]
impl RelayerBackend for RlyBackend {
    fn kind(&self) -> RelayerKind {
        RelayerKind::Rly
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

        self.rly(ctx, &["config", "init"]).await?;
        Ok(())
    }

    async fn add_chain(&self, ctx: &Context, chain: &ChainEndpoint) -> Result<(), Error> {
        let file = chain_file(chain, &format!("{}-key", chain.chain_id)).to_string();
        let path = self
            .host()?
            .write_file(ctx, &format!("{}.json", chain.chain_id), &file)
            .await?;

        self.rly(ctx, &["chains", "add", "--file", &path, &chain.chain_id])
            .await?;

        self.chains()
            .insert(chain.chain_id.clone(), chain.clone());

        Ok(())
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
            .map(|c| c.coin_type.to_string())
            .ok_or_else(|| eyre!("chain {} was not added to relayer {}", chain_id, self.name))?;

        let output = self
            .rly(
                ctx,
                &[
                    "keys",
                    "restore",
                    chain_id,
                    key_name,
                    mnemonic,
                    "--coin-type",
                    &coin_type,
                ],
            )
            .await?;

        self.rly(ctx, &["keys", "use", chain_id, key_name]).await?;

        let address = output.stdout.trim().to_string();
        debug!("restored rly key {} on {}: {}", key_name, chain_id, address);

        Ok(address)
    }

    async fn generate_path(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error> {
        self.rly(ctx, &["paths", "new", &path.chain_a, &path.chain_b, &path.name])
            .await?;
        Ok(())
    }

    async fn create_clients(&self, ctx: &Context, path: &PathRecord) -> Result<IdPair, Error> {
        self.rly(ctx, &["tx", "clients", &path.name]).await?;
        path_ids(&self.show_path(ctx, path).await?, "client-id")
    }

    async fn update_clients(
        &self,
        ctx: &Context,
        path: &PathRecord,
        clients: &IdPair,
    ) -> Result<(), Error> {
        self.rly(
            ctx,
            &[
                "paths",
                "update",
                &path.name,
                "--src-client-id",
                &clients.a,
                "--dst-client-id",
                &clients.b,
            ],
        )
        .await?;

        Ok(())
    }

    async fn create_connections(
        &self,
        ctx: &Context,
        path: &PathRecord,
        _clients: &IdPair,
    ) -> Result<IdPair, Error> {
        self.rly(ctx, &["tx", "connection", &path.name]).await?;
        path_ids(&self.show_path(ctx, path).await?, "connection-id")
    }

    async fn create_channel(
        &self,
        ctx: &Context,
        path: &PathRecord,
        connections: &IdPair,
        options: &CreateChannelOptions,
    ) -> Result<ChannelInfo, Error> {
        self.rly(
            ctx,
            &[
                "tx",
                "channel",
                &path.name,
                "--src-port",
                &options.source_port,
                "--dst-port",
                &options.destination_port,
                "--order",
                options.ordering.as_str(),
                "--version",
                &options.version,
            ],
        )
        .await?;

        let output = self
            .rly(ctx, &["q", "connection-channels", &path.chain_a, &connections.a])
            .await?;

        let (channel_id, counterparty_port, counterparty_channel) =
            latest_channel(&parse_json_lines(&output.stdout), &options.source_port).ok_or_else(
                || eyre!("no channel on port {} found for path {}", options.source_port, path.name),
            )?;

        Ok(ChannelInfo {
            a_side: ChannelEnd {
                port_id: options.source_port.clone(),
                channel_id,
            },
            b_side: ChannelEnd {
                port_id: counterparty_port,
                channel_id: counterparty_channel,
            },
            ordering: options.ordering,
            version: options.version.clone(),
        })
    }

    async fn start(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error> {
        let command = format!(
            "rly start {} --home {} > {}/{}.log 2>&1",
            path.name, self.home_dir, self.home_dir, path.name
        );

        self.host()?
            .exec_detached(ctx, &["sh", "-c", &command])
            .await
    }

    async fn stop(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error> {
        let pattern = format!("rly start {}", path.name);

        if let Err(e) = self.host()?.exec(ctx, &["pkill", "-f", &pattern]).await {
            warn!("failed to stop rly path {}: {}", path.name, e);
        }

        Ok(())
    }

    async fn pending_packets(
        &self,
        ctx: &Context,
        path: &PathRecord,
        channel: &ChannelInfo,
    ) -> Result<PendingPackets, Error> {
        let packets = self
            .unrelayed(ctx, "unrelayed-packets", path, &channel.a_side.channel_id)
            .await?;
        let acks = self
            .unrelayed(ctx, "unrelayed-acknowledgements", path, &channel.a_side.channel_id)
            .await?;

        Ok(PendingPackets {
            unreceived_packets: count_side(&packets, "src") + count_side(&packets, "dst"),
            unreceived_acks: count_side(&acks, "src") + count_side(&acks, "dst"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_ids_are_read_from_both_ends() {
        let show = json!({
            "path": {
                "src": { "chain-id": "gaia-1", "client-id": "07-tendermint-0", "connection-id": "connection-0" },
                "dst": { "chain-id": "osmosis-1", "client-id": "07-tendermint-2", "connection-id": "" },
            },
            "status": { "chains": true, "clients": true },
        });

        let clients = path_ids(&show, "client-id").unwrap();
        assert_eq!(clients.a, "07-tendermint-0");
        assert_eq!(clients.b, "07-tendermint-2");

        assert!(path_ids(&show, "connection-id").is_err());
    }

    #[test]
    fn newest_channel_on_port_wins() {
        let stdout = r#"{"state":"STATE_OPEN","port_id":"transfer","channel_id":"channel-0","counterparty":{"port_id":"transfer","channel_id":"channel-4"}}
{"state":"STATE_OPEN","port_id":"icahost","channel_id":"channel-7","counterparty":{"port_id":"icacontroller","channel_id":"channel-1"}}
{"state":"STATE_OPEN","port_id":"transfer","channel_id":"channel-10","counterparty":{"port_id":"transfer","channel_id":"channel-9"}}"#;

        let channels = parse_json_lines(stdout);
        let (id, port, counterparty) = latest_channel(&channels, "transfer").unwrap();

        assert_eq!(id, "channel-10");
        assert_eq!(port, "transfer");
        assert_eq!(counterparty, "channel-9");
    }

    #[test]
    fn chain_files_carry_gas_settings() {
        use crate::chain::chain_type::ChainFamily;

        let chain = ChainEndpoint {
            chain_id: "gaia-1".to_string(),
            name: "gaia".to_string(),
            family: ChainFamily::Cosmos,
            rpc_address: "http://gaia-1-val-0:26657".to_string(),
            grpc_address: "http://gaia-1-val-0:9090".to_string(),
            account_prefix: "cosmos".to_string(),
            denom: "uatom".to_string(),
            gas_price: "0.01".to_string(),
            gas_adjustment: 1.3,
            trusting_period: "336h".to_string(),
            coin_type: 118,
            ccv_consumer: false,
        };

        let file = chain_file(&chain, "gaia-1-key");
        assert_eq!(file["value"]["gas-prices"], "0.01uatom");
        assert_eq!(file["value"]["chain-id"], "gaia-1");
    }
}
