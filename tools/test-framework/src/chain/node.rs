/*!
   A single node container of a chain.
*/

use core::future::Future;
use core::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::traits::POLL_INTERVAL;
use crate::docker::{Container, ContainerSpec, ContainerState, DockerBroker, NetworkId};
use crate::error::{handle_generic_error, Error};
use crate::types::context::Context;

pub const RPC_PORT: u16 = 26657;
pub const P2P_PORT: u16 = 26656;
pub const GRPC_PORT: u16 = 9090;
pub const API_PORT: u16 = 1317;

/// Marker file whose creation lets a waiting node container start its daemon.
pub const START_MARKER: &str = ".start";

#[derive(Clone)]
pub struct ChainNode {
    pub index: usize,
    pub validator: bool,
    pub chain_id: String,
    pub home_dir: String,
    pub container: Container,
}

impl ChainNode {
    /// Short name such as `val-0` or `fn-1`.
    pub fn name(&self) -> String {
        node_name(self.validator, self.index)
    }

    pub fn hostname(&self) -> &str {
        self.container.hostname()
    }

    pub fn rpc_address(&self) -> String {
        format!("http://{}:{}", self.hostname(), RPC_PORT)
    }

    pub fn grpc_address(&self) -> String {
        format!("http://{}:{}", self.hostname(), GRPC_PORT)
    }

    pub fn api_address(&self) -> String {
        format!("http://{}:{}", self.hostname(), API_PORT)
    }

    pub fn p2p_address(&self) -> String {
        format!("{}:{}", self.hostname(), P2P_PORT)
    }

    pub fn home_path(&self, file: &str) -> String {
        format!("{}/{}", self.home_dir, file)
    }

    /**
       Read a file relative to the node home directory.
    */
    pub async fn read_file(&self, ctx: &Context, file: &str) -> Result<String, Error> {
        self.container.read_file(ctx, &self.home_path(file)).await
    }

    /**
       Write a file relative to the node home directory.
    */
    pub async fn write_file(&self, ctx: &Context, file: &str, content: &str) -> Result<(), Error> {
        self.container
            .write_file(ctx, &self.home_path(file), content)
            .await
    }

    /**
       Modify a node config file saved in TOML format, such as
       `config/config.toml` or `config/app.toml`.
    */
    pub async fn update_chain_config(
        &self,
        ctx: &Context,
        file: &str,
        cont: impl FnOnce(&mut toml::Value) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let config1 = self.read_file(ctx, file).await?;

        let mut config2 = toml::from_str(&config1).map_err(handle_generic_error)?;

        cont(&mut config2)?;

        let config3 = toml::to_string_pretty(&config2).map_err(handle_generic_error)?;

        self.write_file(ctx, file, &config3).await?;

        debug!("updated {} on node {}", file, self.container.name());

        Ok(())
    }

    pub async fn read_genesis(&self, ctx: &Context) -> Result<serde_json::Value, Error> {
        let content = self.read_file(ctx, "config/genesis.json").await?;
        serde_json::from_str(&content).map_err(handle_generic_error)
    }

    pub async fn write_genesis(
        &self,
        ctx: &Context,
        genesis: &serde_json::Value,
    ) -> Result<(), Error> {
        let content = serde_json::to_string_pretty(genesis).map_err(handle_generic_error)?;
        self.write_file(ctx, "config/genesis.json", &content).await
    }

    /**
       Modify the genesis file of the node.
    */
    pub async fn update_genesis_file(
        &self,
        ctx: &Context,
        cont: impl FnOnce(&mut serde_json::Value) -> Result<(), Error>,
    ) -> Result<serde_json::Value, Error> {
        let mut genesis = self.read_genesis(ctx).await?;

        cont(&mut genesis)?;

        self.write_genesis(ctx, &genesis).await?;

        Ok(genesis)
    }

    /// Let the waiting entrypoint exec the node daemon.
    pub async fn release(&self, ctx: &Context) -> Result<(), Error> {
        self.write_file(ctx, START_MARKER, "").await
    }
}

/**
   Poll `probe` until it reports a height of at least `min_height`.

   A container that exited, or a node still not at `min_height` once
   `timeout` elapsed, fails with `Readiness` carrying the last lines of
   the container log.
*/
pub async fn wait_until_ready<F, Fut>(
    ctx: &Context,
    node: &ChainNode,
    timeout: Duration,
    min_height: u64,
    mut probe: F,
) -> Result<u64, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<u64, Error>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if let ContainerState::Exited(code) = node.container.state(ctx).await? {
            return Err(Error::readiness(
                node.chain_id.clone(),
                node.name(),
                format!("container exited with status {code}"),
                node.container.log_tail().await,
            ));
        }

        match probe().await {
            Ok(height) if height >= min_height => {
                debug!(
                    "node {} of chain {} ready at height {}",
                    node.name(),
                    node.chain_id,
                    height
                );
                return Ok(height);
            }
            Ok(height) => trace!("node {} at height {}", node.name(), height),
            Err(e) => trace!("node {} not ready yet: {}", node.name(), e),
        }

        if Instant::now() >= deadline {
            return Err(Error::readiness(
                node.chain_id.clone(),
                node.name(),
                format!("height {min_height} not reached within {timeout:?}"),
                node.container.log_tail().await,
            ));
        }

        ctx.sleep(POLL_INTERVAL).await?;
    }
}

pub fn node_name(validator: bool, index: usize) -> String {
    if validator {
        format!("val-{index}")
    } else {
        format!("fn-{index}")
    }
}

/**
   Entrypoint script that idles until the start marker exists in the
   home directory, then replaces itself with `command`. Genesis is
   prepared with `exec` while the container idles.
*/
pub fn gated_entrypoint(home_dir: &str, command: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "mkdir -p {home_dir}; while [ ! -f {home_dir}/{START_MARKER} ]; do sleep 0.5; done; exec {command}"
        ),
    ]
}

/**
   Create and start the idle container of one node, attached to the
   shared network.
*/
pub async fn create_node(
    ctx: &Context,
    broker: &DockerBroker,
    network: &NetworkId,
    spec: NodeSpec<'_>,
) -> Result<ChainNode, Error> {
    let name = broker.resource_name(&format!(
        "{}-{}",
        spec.chain_id,
        node_name(spec.validator, spec.index)
    ));

    let container = broker
        .create_container(
            ctx,
            ContainerSpec {
                name: name.clone(),
                hostname: name,
                image: Some(spec.image.clone()),
                entrypoint: spec.entrypoint,
                cmd: Vec::new(),
                env: spec.env,
                network: Some(network.clone()),
                ..Default::default()
            },
        )
        .await?;

    container.start(ctx).await?;

    Ok(ChainNode {
        index: spec.index,
        validator: spec.validator,
        chain_id: spec.chain_id.to_string(),
        home_dir: spec.home_dir.to_string(),
        container,
    })
}

pub struct NodeSpec<'a> {
    pub chain_id: &'a str,
    pub index: usize,
    pub validator: bool,
    pub image: &'a crate::docker::ImageRef,
    pub home_dir: &'a str,
    pub entrypoint: Vec<String>,
    pub env: Vec<(String, String)>,
}
