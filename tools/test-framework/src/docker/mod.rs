/*!
   The container broker.

   All interaction with the container runtime goes through the
   [`ContainerRuntime`] trait. [`DockerCli`] drives a real runtime
   through its command line, while [`MockRuntime`](mock::MockRuntime)
   keeps everything in memory for tests.

   Chain and relayer drivers never talk to the runtime directly. They go
   through a [`DockerBroker`], which registers the removal of every
   resource it creates with the [`Supervisor`](crate::framework::supervisor::Supervisor)
   before handing it out.
*/

use async_trait::async_trait;
use core::fmt::{self, Display};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Error;

pub mod broker;
pub mod cli;
pub mod exec;
pub mod mock;

pub use broker::{Container, DockerBroker};
pub use cli::DockerCli;
pub use exec::ExecOutput;

/// Label attached to every resource, carrying the test name.
pub const TEST_NAME_LABEL: &str = "interchain-test.test-name";

/// Number of log lines attached to readiness and exec failures.
pub const LOG_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeId(pub String);

/// A container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub version: String,
    /// Optional `uid:gid` the container process runs as.
    #[serde(default)]
    pub uid_gid: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub hostname: String,
    pub image: Option<ImageRef>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub network: Option<NetworkId>,
    /// Volume name and mount path inside the container.
    pub mounts: Vec<(VolumeId, String)>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited(i64),
}

/**
   The operations the engine needs from a container runtime.

   Runtime methods are not bound to a [`Context`](crate::types::context::Context)
   so that cleanup can still reach the runtime after the run has been
   cancelled. Callers wrap them with the context they hold.
*/
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn ensure_image(&self, image: &ImageRef) -> Result<(), Error>;

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<NetworkId, Error>;

    async fn remove_network(&self, network: &NetworkId) -> Result<(), Error>;

    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<VolumeId, Error>;

    async fn remove_volume(&self, volume: &VolumeId) -> Result<(), Error>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, Error>;

    async fn start_container(&self, container: &ContainerId) -> Result<(), Error>;

    async fn stop_container(&self, container: &ContainerId, grace: Duration)
        -> Result<(), Error>;

    async fn remove_container(&self, container: &ContainerId) -> Result<(), Error>;

    /// Wait for the container to exit and return its exit code.
    async fn wait_container(&self, container: &ContainerId) -> Result<i64, Error>;

    async fn inspect_container(&self, container: &ContainerId) -> Result<ContainerState, Error>;

    /**
       Run a command inside a running container. A non-zero exit code is
       not an error at this level; it is reported in [`ExecOutput`].
    */
    async fn exec(
        &self,
        container: &ContainerId,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, Error>;

    /// Run a command in the background inside a running container.
    async fn exec_detached(&self, container: &ContainerId, argv: &[String]) -> Result<(), Error>;

    /// Return the last `tail` lines of the container logs, or all of them.
    async fn logs(&self, container: &ContainerId, tail: Option<usize>) -> Result<String, Error>;
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            version: version.into(),
            uid_gid: None,
        }
    }
}

impl Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.version)
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Turn a test name into something usable in resource names.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    sanitized.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_test_names() {
        assert_eq!(sanitize_name("TestICS/provider consumer"), "testics-provider-consumer");
        assert_eq!(sanitize_name("utxo_start"), "utxo_start");
    }
}
