/*!
   A relayer backend that hands out deterministic identifiers without
   talking to any chain.

   Once set up it still runs each command as a no-op exec in its
   container, so that exec reporting and cleanup can be observed.
*/

use async_trait::async_trait;
use eyre::eyre;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use super::{
    default_image, ChannelEnd, ChannelInfo, CreateChannelOptions, IdPair, PathRecord, PathState,
    PendingPackets, RelayerBackend, RelayerHost, RelayerKind,
};
use crate::chain::traits::ChainEndpoint;
use crate::docker::{DockerBroker, NetworkId};
use crate::error::Error;
use crate::reporter::ExecReporter;
use crate::types::context::Context;

#[derive(Default)]
struct MockRelayerState {
    chains: Vec<String>,
    keys: BTreeMap<(String, String), String>,
    /// Next client, connection and channel number per chain.
    counters: BTreeMap<(String, &'static str), usize>,
    calls: BTreeMap<&'static str, usize>,
    pending: BTreeMap<String, PendingPackets>,
}

#[derive(Clone)]
pub struct MockRelayerBackend {
    name: String,
    fail_on: Option<PathState>,
    host: Arc<OnceLock<RelayerHost>>,
    state: Arc<Mutex<MockRelayerState>>,
}

impl MockRelayerBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail_on: None,
            host: Arc::new(OnceLock::new()),
            state: Arc::new(Mutex::new(MockRelayerState::default())),
        }
    }

    /// Make the transition into `state` fail.
    pub fn fail_on(mut self, state: PathState) -> Self {
        self.fail_on = Some(state);
        self
    }

    /// How many times the backend operation `op` ran.
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn chains(&self) -> Vec<String> {
        self.lock().chains.clone()
    }

    pub fn key_address(&self, chain_id: &str, key_name: &str) -> Option<String> {
        self.lock()
            .keys
            .get(&(chain_id.to_string(), key_name.to_string()))
            .cloned()
    }

    /// Report `pending` for the channel `channel_id` from now on.
    pub fn set_pending(&self, channel_id: &str, pending: PendingPackets) {
        self.lock().pending.insert(channel_id.to_string(), pending);
    }

    fn lock(&self) -> MutexGuard<'_, MockRelayerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn next_id(&self, chain_id: &str, kind: &'static str) -> usize {
        let mut state = self.lock();
        let counter = state.counters.entry((chain_id.to_string(), kind)).or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }

    async fn call(
        &self,
        ctx: &Context,
        op: &'static str,
        transition: Option<PathState>,
        args: &[&str],
    ) -> Result<(), Error> {
        *self.lock().calls.entry(op).or_insert(0) += 1;

        if let Some(host) = self.host.get() {
            let mut argv = vec!["mock-relayer", op];
            argv.extend_from_slice(args);
            host.exec(ctx, &argv).await?;
        }

        match (transition, self.fail_on) {
            (Some(target), Some(failing)) if target == failing => Err(Error::generic(eyre!(
                "mock relayer {} failed to {}",
                self.name,
                op
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RelayerBackend for MockRelayerBackend {
    fn kind(&self) -> RelayerKind {
        RelayerKind::Mock
    }

    async fn setup(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
        reporter: Option<ExecReporter>,
    ) -> Result<(), Error> {
        let (image, home) = default_image(RelayerKind::Mock);
        let host = RelayerHost::create(ctx, broker, network, &self.name, &image, home, reporter).await?;
        let _ = self.host.set(host);

        self.call(ctx, "setup", None, &[]).await
    }

    async fn add_chain(&self, ctx: &Context, chain: &ChainEndpoint) -> Result<(), Error> {
        self.call(ctx, "add_chain", None, &[&chain.chain_id]).await?;

        let mut state = self.lock();
        if !state.chains.contains(&chain.chain_id) {
            state.chains.push(chain.chain_id.clone());
        }

        Ok(())
    }

    async fn restore_key(
        &self,
        ctx: &Context,
        chain_id: &str,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<String, Error> {
        self.call(ctx, "restore_key", None, &[chain_id, key_name]).await?;

        let address = format!("{}-{}", key_name, mnemonic.len());
        self.lock().keys.insert(
            (chain_id.to_string(), key_name.to_string()),
            address.clone(),
        );

        Ok(address)
    }

    async fn generate_path(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error> {
        self.call(ctx, "generate_path", Some(PathState::Added), &[&path.name])
            .await
    }

    async fn create_clients(&self, ctx: &Context, path: &PathRecord) -> Result<IdPair, Error> {
        self.call(ctx, "create_clients", Some(PathState::Clients), &[&path.name])
            .await?;

        Ok(IdPair {
            a: format!("07-tendermint-{}", self.next_id(&path.chain_a, "client")),
            b: format!("07-tendermint-{}", self.next_id(&path.chain_b, "client")),
        })
    }

    async fn update_clients(
        &self,
        ctx: &Context,
        path: &PathRecord,
        clients: &IdPair,
    ) -> Result<(), Error> {
        self.call(
            ctx,
            "update_clients",
            Some(PathState::Clients),
            &[&path.name, &clients.a, &clients.b],
        )
        .await
    }

    async fn create_connections(
        &self,
        ctx: &Context,
        path: &PathRecord,
        _clients: &IdPair,
    ) -> Result<IdPair, Error> {
        self.call(ctx, "create_connections", Some(PathState::Connected), &[&path.name])
            .await?;

        Ok(IdPair {
            a: format!("connection-{}", self.next_id(&path.chain_a, "connection")),
            b: format!("connection-{}", self.next_id(&path.chain_b, "connection")),
        })
    }

    async fn create_channel(
        &self,
        ctx: &Context,
        path: &PathRecord,
        _connections: &IdPair,
        options: &CreateChannelOptions,
    ) -> Result<ChannelInfo, Error> {
        self.call(ctx, "create_channel", Some(PathState::Opened), &[&path.name])
            .await?;

        Ok(ChannelInfo {
            a_side: ChannelEnd {
                port_id: options.source_port.clone(),
                channel_id: format!("channel-{}", self.next_id(&path.chain_a, "channel")),
            },
            b_side: ChannelEnd {
                port_id: options.destination_port.clone(),
                channel_id: format!("channel-{}", self.next_id(&path.chain_b, "channel")),
            },
            ordering: options.ordering,
            version: options.version.clone(),
        })
    }

    async fn start(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error> {
        self.call(ctx, "start", Some(PathState::Relaying), &[&path.name])
            .await
    }

    async fn stop(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error> {
        self.call(ctx, "stop", Some(PathState::Stopped), &[&path.name])
            .await
    }

    async fn pending_packets(
        &self,
        ctx: &Context,
        path: &PathRecord,
        channel: &ChannelInfo,
    ) -> Result<PendingPackets, Error> {
        self.call(ctx, "pending_packets", None, &[&path.name, &channel.a_side.channel_id])
            .await?;

        Ok(self
            .lock()
            .pending
            .get(&channel.a_side.channel_id)
            .copied()
            .unwrap_or_default())
    }
}
