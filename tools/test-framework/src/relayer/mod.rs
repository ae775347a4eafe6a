/*!
   Relayer drivers.

   A [`RelayerDriver`] owns the per-path state machine
   `NONE → ADDED → CLIENTS → CONNECTED → OPENED → RELAYING → STOPPED`
   once for every relayer implementation. The implementation specific
   commands live behind the [`RelayerBackend`] trait: [`hermes`],
   [`rly`] and the in-memory [`mock`] backend.

   Transitions are idempotent. A failing transition marks the path as
   failed and attaches the error, which every later transition on that
   path returns again. There is no retry.
*/

use async_trait::async_trait;
use core::fmt::{self, Display};
use core::future::Future;
use core::str::FromStr;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::chain::traits::ChainEndpoint;
use crate::docker::{Container, ContainerSpec, DockerBroker, ExecOutput, ImageRef, NetworkId};
use crate::error::Error;
use crate::reporter::ExecReporter;
use crate::types::context::Context;

pub mod hermes;
pub mod mock;
pub mod path;
pub mod rly;

pub use path::{
    ChannelEnd, ChannelInfo, ChannelOrdering, CreateChannelOptions, IdPair, PathRecord,
    PathState, PendingPackets,
};

/// Default time allowed for one path transition.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayerKind {
    Hermes,
    Rly,
    Mock,
}

impl RelayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hermes => "hermes",
            Self::Rly => "rly",
            Self::Mock => "mock",
        }
    }
}

impl Display for RelayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RelayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hermes" => Ok(Self::Hermes),
            "rly" | "cosmos-relayer" | "go-relayer" => Ok(Self::Rly),
            "mock" => Ok(Self::Mock),
            _ => Err(Error::config_invalid(format!("unknown relayer {s}"))),
        }
    }
}

/**
   The container a relayer runs its commands in. Every command is
   reported to the optional [`ExecReporter`].
*/
#[derive(Clone)]
pub struct RelayerHost {
    pub container: Container,
    pub home_dir: String,
    reporter: Option<ExecReporter>,
}

impl RelayerHost {
    /**
       Create the idle relayer container on the shared network. Commands
       are run in it with `exec`.
    */
    pub async fn create(
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
        name: &str,
        image: &ImageRef,
        home_dir: &str,
        reporter: Option<ExecReporter>,
    ) -> Result<Self, Error> {
        let resource = broker.resource_name(name);

        let container = broker
            .create_container(
                ctx,
                ContainerSpec {
                    name: resource.clone(),
                    hostname: resource,
                    image: Some(image.clone()),
                    entrypoint: vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        format!("mkdir -p {home_dir}; trap 'exit 0' TERM; while :; do sleep 1; done"),
                    ],
                    network: Some(network.clone()),
                    ..Default::default()
                },
            )
            .await?;

        container.start(ctx).await?;

        Ok(Self {
            container,
            home_dir: home_dir.to_string(),
            reporter,
        })
    }

    fn report(&self, argv: &[&str], started: SystemTime, elapsed: Duration, res: &Result<ExecOutput, Error>) {
        if let Some(reporter) = &self.reporter {
            reporter.track_exec(self.container.name(), argv, started, elapsed, res);
        }
    }

    /// Run a relayer command, failing on a non-zero exit status.
    pub async fn exec(&self, ctx: &Context, argv: &[&str]) -> Result<ExecOutput, Error> {
        let started = SystemTime::now();
        let timer = Instant::now();

        let res = self.container.exec_checked(ctx, argv).await;
        self.report(argv, started, timer.elapsed(), &res);

        res
    }

    pub async fn exec_detached(&self, ctx: &Context, argv: &[&str]) -> Result<(), Error> {
        let started = SystemTime::now();
        let timer = Instant::now();

        let res = self
            .container
            .exec_detached(ctx, argv)
            .await
            .map(|_| ExecOutput::default());
        self.report(argv, started, timer.elapsed(), &res);

        res.map(|_| ())
    }

    pub async fn write_file(&self, ctx: &Context, file: &str, content: &str) -> Result<String, Error> {
        let path = format!("{}/{}", self.home_dir, file);
        self.container.write_file(ctx, &path, content).await?;
        Ok(path)
    }
}

/**
   The commands of one relayer implementation. The
   [`RelayerDriver`] calls them in state machine order and records the
   identifiers they return.
*/
#[async_trait]
pub trait RelayerBackend: Send + Sync + 'static {
    fn kind(&self) -> RelayerKind;

    /// Create the relayer container and its base configuration.
    async fn setup(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
        reporter: Option<ExecReporter>,
    ) -> Result<(), Error>;

    async fn add_chain(&self, ctx: &Context, chain: &ChainEndpoint) -> Result<(), Error>;

    /// Import the key the relayer signs with on `chain_id`. Returns its address.
    async fn restore_key(
        &self,
        ctx: &Context,
        chain_id: &str,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<String, Error>;

    async fn generate_path(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error>;

    async fn create_clients(&self, ctx: &Context, path: &PathRecord) -> Result<IdPair, Error>;

    /// Make the path use light clients that already exist on both chains.
    async fn update_clients(
        &self,
        _ctx: &Context,
        _path: &PathRecord,
        _clients: &IdPair,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn create_connections(
        &self,
        ctx: &Context,
        path: &PathRecord,
        clients: &IdPair,
    ) -> Result<IdPair, Error>;

    async fn create_channel(
        &self,
        ctx: &Context,
        path: &PathRecord,
        connections: &IdPair,
        options: &CreateChannelOptions,
    ) -> Result<ChannelInfo, Error>;

    /// Launch the relay loop for the path, detached from the caller.
    async fn start(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error>;

    async fn stop(&self, ctx: &Context, path: &PathRecord) -> Result<(), Error>;

    async fn pending_packets(
        &self,
        ctx: &Context,
        path: &PathRecord,
        channel: &ChannelInfo,
    ) -> Result<PendingPackets, Error>;
}

/**
   A relayer taking part in an interchain, with the state of each of
   its paths.
*/
pub struct RelayerDriver {
    name: String,
    backend: Arc<dyn RelayerBackend>,
    paths: Mutex<BTreeMap<String, PathRecord>>,
    transitions: AsyncMutex<()>,
    setup_timeout: Duration,
}

impl RelayerDriver {
    pub fn new(name: impl Into<String>, backend: Arc<dyn RelayerBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            paths: Mutex::new(BTreeMap::new()),
            transitions: AsyncMutex::new(()),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }

    /// A driver using the backend of `kind` with its default image.
    pub fn from_kind(name: impl Into<String>, kind: RelayerKind) -> Self {
        let name = name.into();

        let backend: Arc<dyn RelayerBackend> = match kind {
            RelayerKind::Hermes => Arc::new(hermes::HermesBackend::new(&name)),
            RelayerKind::Rly => Arc::new(rly::RlyBackend::new(&name)),
            RelayerKind::Mock => Arc::new(mock::MockRelayerBackend::new(&name)),
        };

        Self::new(name, backend)
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RelayerKind {
        self.backend.kind()
    }

    pub fn backend(&self) -> &Arc<dyn RelayerBackend> {
        &self.backend
    }

    fn lock_paths(&self) -> MutexGuard<'_, BTreeMap<String, PathRecord>> {
        match self.paths.lock() {
            Ok(paths) => paths,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A snapshot of the record of `path_name`.
    pub fn path(&self, path_name: &str) -> Option<PathRecord> {
        self.lock_paths().get(path_name).cloned()
    }

    pub fn paths(&self) -> Vec<PathRecord> {
        self.lock_paths().values().cloned().collect()
    }

    pub fn path_state(&self, path_name: &str) -> PathState {
        self.path(path_name)
            .map(|p| p.state)
            .unwrap_or(PathState::None)
    }

    pub async fn initialize(
        &self,
        ctx: &Context,
        broker: &DockerBroker,
        network: &NetworkId,
        reporter: Option<ExecReporter>,
    ) -> Result<(), Error> {
        self.backend.setup(ctx, broker, network, reporter).await
    }

    pub async fn add_chain(&self, ctx: &Context, chain: &ChainEndpoint) -> Result<(), Error> {
        debug!("adding chain {} to relayer {}", chain.chain_id, self.name);
        self.backend.add_chain(ctx, chain).await
    }

    pub async fn restore_key(
        &self,
        ctx: &Context,
        chain_id: &str,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<String, Error> {
        self.backend
            .restore_key(ctx, chain_id, key_name, mnemonic)
            .await
    }

    fn stuck(&self, record: &PathRecord, reason: impl Display) -> Error {
        Error::relayer_stuck(record.name.clone(), record.state, reason.to_string())
    }

    /**
       Move `path_name` to `target` by running `op` on the current
       record. A path already at or beyond `target` is returned as is.
       The path must be exactly one step before `target` otherwise.
    */
    async fn advance<F, Fut>(
        &self,
        ctx: &Context,
        path_name: &str,
        target: PathState,
        op: F,
    ) -> Result<PathRecord, Error>
    where
        F: FnOnce(PathRecord) -> Fut,
        Fut: Future<Output = Result<PathRecord, Error>>,
    {
        let _transition = self.transitions.lock().await;

        let record = self.path(path_name).ok_or_else(|| {
            Error::config_invalid(format!(
                "relayer {} has no path named {}",
                self.name, path_name
            ))
        })?;

        if let Some(error) = &record.error {
            return Err(error.clone());
        }

        if record.has_reached(target) {
            return Ok(record);
        }

        if !is_next_state(record.state, target) {
            return Err(self.stuck(
                &record,
                format!("cannot move from {} to {}", record.state, target),
            ));
        }

        let operation = format!("{} path {} to {}", self.name, path_name, target);
        let res = ctx
            .run_with_timeout(&operation, self.setup_timeout, op(record.clone()))
            .await;

        let mut paths = self.lock_paths();

        match res {
            Ok(mut updated) => {
                updated.state = target;
                paths.insert(path_name.to_string(), updated.clone());

                info!("relayer {} moved path {} to {}", self.name, path_name, target);
                Ok(updated)
            }
            Err(e) => {
                let error = self.stuck(&record, &e);

                let mut failed = record;
                failed.state = PathState::Failed;
                failed.error = Some(error.clone());
                paths.insert(path_name.to_string(), failed);

                Err(error)
            }
        }
    }

    /**
       Register a path between two chains already added to the relayer.
       Registering the same path twice is a no-op; reusing its name for
       different chains is rejected.
    */
    pub async fn generate_path(
        &self,
        ctx: &Context,
        path_name: &str,
        chain_a: &str,
        chain_b: &str,
    ) -> Result<PathRecord, Error> {
        {
            let mut paths = self.lock_paths();

            match paths.get(path_name) {
                Some(existing) if existing.chain_a == chain_a && existing.chain_b == chain_b => {}
                Some(existing) => {
                    return Err(Error::config_invalid(format!(
                        "path {} of relayer {} already connects {} and {}",
                        path_name, self.name, existing.chain_a, existing.chain_b
                    )))
                }
                None => {
                    paths.insert(
                        path_name.to_string(),
                        PathRecord::new(path_name, chain_a, chain_b),
                    );
                }
            }
        }

        let backend = self.backend.clone();
        self.advance(ctx, path_name, PathState::Added, |record| async move {
            backend.generate_path(ctx, &record).await?;
            Ok(record)
        })
        .await
    }

    pub async fn create_clients(&self, ctx: &Context, path_name: &str) -> Result<PathRecord, Error> {
        let backend = self.backend.clone();

        self.advance(ctx, path_name, PathState::Clients, |mut record| async move {
            record.clients = Some(backend.create_clients(ctx, &record).await?);
            Ok(record)
        })
        .await
    }

    /// Use the given existing light clients instead of creating new ones.
    pub async fn adopt_clients(
        &self,
        ctx: &Context,
        path_name: &str,
        clients: IdPair,
    ) -> Result<PathRecord, Error> {
        let backend = self.backend.clone();

        self.advance(ctx, path_name, PathState::Clients, |mut record| async move {
            backend.update_clients(ctx, &record, &clients).await?;
            record.clients = Some(clients);
            Ok(record)
        })
        .await
    }

    pub async fn create_connections(
        &self,
        ctx: &Context,
        path_name: &str,
    ) -> Result<PathRecord, Error> {
        let backend = self.backend.clone();

        self.advance(ctx, path_name, PathState::Connected, |mut record| async move {
            let clients = record
                .clients
                .clone()
                .ok_or_else(|| Error::config_invalid(format!("path {} has no clients", record.name)))?;

            record.connections = Some(backend.create_connections(ctx, &record, &clients).await?);
            Ok(record)
        })
        .await
    }

    pub async fn create_channel(
        &self,
        ctx: &Context,
        path_name: &str,
        options: &CreateChannelOptions,
    ) -> Result<PathRecord, Error> {
        let backend = self.backend.clone();

        self.advance(ctx, path_name, PathState::Opened, |mut record| async move {
            let connections = record.connections.clone().ok_or_else(|| {
                Error::config_invalid(format!("path {} has no connections", record.name))
            })?;

            let channel = backend
                .create_channel(ctx, &record, &connections, options)
                .await?;
            record.channels.push(channel);
            Ok(record)
        })
        .await
    }

    /// Create clients, a connection and a channel for the path.
    pub async fn link_path(
        &self,
        ctx: &Context,
        path_name: &str,
        options: &CreateChannelOptions,
    ) -> Result<PathRecord, Error> {
        self.create_clients(ctx, path_name).await?;
        self.create_connections(ctx, path_name).await?;
        self.create_channel(ctx, path_name, options).await
    }

    pub async fn start_relaying(&self, ctx: &Context, path_name: &str) -> Result<PathRecord, Error> {
        let backend = self.backend.clone();

        self.advance(ctx, path_name, PathState::Relaying, |record| async move {
            backend.start(ctx, &record).await?;
            Ok(record)
        })
        .await
    }

    pub async fn stop_relaying(&self, ctx: &Context, path_name: &str) -> Result<PathRecord, Error> {
        let backend = self.backend.clone();

        self.advance(ctx, path_name, PathState::Stopped, |record| async move {
            backend.stop(ctx, &record).await?;
            Ok(record)
        })
        .await
    }

    /// Pending packets on every channel of the path, in channel order.
    pub async fn query_packets(
        &self,
        ctx: &Context,
        path_name: &str,
    ) -> Result<Vec<PendingPackets>, Error> {
        let record = self.path(path_name).ok_or_else(|| {
            Error::config_invalid(format!("relayer {} has no path named {}", self.name, path_name))
        })?;

        let mut pending = Vec::new();
        for channel in &record.channels {
            pending.push(self.backend.pending_packets(ctx, &record, channel).await?);
        }

        Ok(pending)
    }
}

/// Whether `to` directly follows `from` in the path lifecycle.
pub fn is_next_state(from: PathState, to: PathState) -> bool {
    use PathState::*;

    matches!(
        (from, to),
        (None, Added)
            | (Added, Clients)
            | (Clients, Connected)
            | (Connected, Opened)
            | (Opened, Relaying)
            | (Relaying, Stopped)
    )
}

/// The default image and home directory of each relayer kind.
pub fn default_image(kind: RelayerKind) -> (ImageRef, &'static str) {
    match kind {
        RelayerKind::Hermes => (
            ImageRef::new("ghcr.io/informalsystems/hermes", "1.8.0"),
            "/home/hermes",
        ),
        RelayerKind::Rly => (
            ImageRef::new("ghcr.io/cosmos/relayer", "v2.4.2"),
            "/home/relayer",
        ),
        RelayerKind::Mock => (ImageRef::new("mock/relayer", "latest"), "/home/relayer"),
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockRelayerBackend;
    use super::*;
    use crate::error::{ErrorDetail, ErrorKind};

    fn driver(backend: MockRelayerBackend) -> RelayerDriver {
        RelayerDriver::new("relayer", Arc::new(backend))
    }

    #[tokio::test]
    async fn paths_walk_the_state_machine() {
        let relayer = driver(MockRelayerBackend::new("relayer"));
        let ctx = Context::background();

        relayer
            .generate_path(&ctx, "gaia-osmo", "gaia-1", "osmosis-1")
            .await
            .unwrap();
        assert_eq!(relayer.path_state("gaia-osmo"), PathState::Added);

        let record = relayer
            .link_path(&ctx, "gaia-osmo", &CreateChannelOptions::default())
            .await
            .unwrap();

        assert_eq!(record.state, PathState::Opened);
        assert_eq!(record.clients.unwrap().a, "07-tendermint-0");
        assert_eq!(record.channels[0].a_side.channel_id, "channel-0");

        relayer.start_relaying(&ctx, "gaia-osmo").await.unwrap();
        relayer.stop_relaying(&ctx, "gaia-osmo").await.unwrap();
        assert_eq!(relayer.path_state("gaia-osmo"), PathState::Stopped);
    }

    #[tokio::test]
    async fn transitions_are_idempotent() {
        let backend = MockRelayerBackend::new("relayer");
        let relayer = driver(backend.clone());
        let ctx = Context::background();

        relayer
            .generate_path(&ctx, "p", "a-1", "b-1")
            .await
            .unwrap();
        relayer
            .link_path(&ctx, "p", &CreateChannelOptions::default())
            .await
            .unwrap();
        let again = relayer
            .link_path(&ctx, "p", &CreateChannelOptions::default())
            .await
            .unwrap();

        assert_eq!(again.channels.len(), 1);
        assert_eq!(backend.calls("create_clients"), 1);
        assert_eq!(backend.calls("create_channel"), 1);

        relayer
            .generate_path(&ctx, "p", "a-1", "b-1")
            .await
            .unwrap();
        assert_eq!(relayer.path_state("p"), PathState::Opened);

        let conflict = relayer.generate_path(&ctx, "p", "a-1", "c-1").await;
        assert_eq!(conflict.unwrap_err().kind(), ErrorKind::ConfigInvalid);
    }

    #[tokio::test]
    async fn failures_are_sticky() {
        let backend = MockRelayerBackend::new("relayer").fail_on(PathState::Connected);
        let relayer = driver(backend.clone());
        let ctx = Context::background();

        relayer
            .generate_path(&ctx, "p", "a-1", "b-1")
            .await
            .unwrap();

        let err = relayer
            .link_path(&ctx, "p", &CreateChannelOptions::default())
            .await
            .unwrap_err();

        match err.detail() {
            ErrorDetail::RelayerStuck(e) => {
                assert_eq!(e.path, "p");
                assert_eq!(e.state, PathState::Clients);
            }
            e => panic!("unexpected error {e:?}"),
        }

        assert_eq!(relayer.path_state("p"), PathState::Failed);

        let again = relayer.start_relaying(&ctx, "p").await.unwrap_err();
        assert_eq!(again.kind(), ErrorKind::RelayerStuck);
        assert_eq!(backend.calls("create_connections"), 1);
    }

    #[tokio::test]
    async fn out_of_order_transitions_are_rejected() {
        let backend = MockRelayerBackend::new("relayer");
        let relayer = driver(backend.clone());
        let ctx = Context::background();

        relayer
            .generate_path(&ctx, "p", "a-1", "b-1")
            .await
            .unwrap();

        let err = relayer.start_relaying(&ctx, "p").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RelayerStuck);
        assert_eq!(relayer.path_state("p"), PathState::Added);
        assert_eq!(backend.calls("start"), 0);
    }

    #[tokio::test]
    async fn adopted_clients_skip_creation() {
        let backend = MockRelayerBackend::new("relayer");
        let relayer = driver(backend.clone());
        let ctx = Context::background();

        relayer
            .generate_path(&ctx, "ics", "provider-1", "consumer-1")
            .await
            .unwrap();
        relayer
            .adopt_clients(
                &ctx,
                "ics",
                IdPair {
                    a: "07-tendermint-5".to_string(),
                    b: "07-tendermint-0".to_string(),
                },
            )
            .await
            .unwrap();

        let record = relayer
            .link_path(&ctx, "ics", &CreateChannelOptions::default())
            .await
            .unwrap();

        assert_eq!(backend.calls("create_clients"), 0);
        assert_eq!(record.clients.unwrap().a, "07-tendermint-5");
        assert_eq!(record.state, PathState::Opened);
    }

    #[test]
    fn relayer_kinds_parse() {
        assert_eq!("Hermes".parse::<RelayerKind>().unwrap(), RelayerKind::Hermes);
        assert_eq!("go-relayer".parse::<RelayerKind>().unwrap(), RelayerKind::Rly);
        assert!("ts-relayer".parse::<RelayerKind>().is_err());
    }
}
