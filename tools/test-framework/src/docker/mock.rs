/*!
   An in-memory [`ContainerRuntime`] for testing the engine without a
   container daemon.

   Each container gets a tiny filesystem so that
   [`Container::read_file`](super::Container::read_file) and
   [`Container::write_file`](super::Container::write_file) behave as
   they would against a real runtime. Other commands are answered by an
   optional scripted handler.
*/

use async_trait::async_trait;
use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::{
    ContainerId, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, ImageRef,
    NetworkId, VolumeId,
};
use crate::error::Error;

/// A command executed in a mock container, as seen by an [`ExecHandler`].
#[derive(Debug, Clone)]
pub struct MockExec {
    pub container: String,
    pub hostname: String,
    pub image: String,
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

pub type ExecHandler = Arc<dyn Fn(&MockExec) -> Option<ExecOutput> + Send + Sync>;

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    state: ContainerState,
    files: BTreeMap<String, String>,
    logs: Vec<String>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    networks: BTreeMap<NetworkId, String>,
    volumes: BTreeMap<VolumeId, String>,
    containers: BTreeMap<ContainerId, MockContainer>,
    exec_log: Vec<MockExec>,
}

/// Snapshot of the resources currently alive in a [`MockRuntime`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockResources {
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
    pub containers: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    unavailable_images: Arc<Mutex<BTreeSet<String>>>,
    crashing_images: Arc<Mutex<BTreeSet<String>>>,
    handler: Arc<Mutex<Option<ExecHandler>>>,
}

impl MockResources {
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.volumes.is_empty() && self.containers.is_empty()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulling an image with this repository fails with `ImageUnavailable`.
    pub fn mark_image_unavailable(&self, repository: &str) {
        if let Ok(mut images) = self.unavailable_images.lock() {
            images.insert(repository.to_string());
        }
    }

    /// Containers with this image repository exit immediately after start.
    pub fn mark_image_crashing(&self, repository: &str) {
        if let Ok(mut images) = self.crashing_images.lock() {
            images.insert(repository.to_string());
        }
    }

    /**
       Answer commands not handled by the built-in filesystem. Returning
       `None` falls back to an empty successful output.
    */
    pub fn set_exec_handler(
        &self,
        handler: impl Fn(&MockExec) -> Option<ExecOutput> + Send + Sync + 'static,
    ) {
        if let Ok(mut current) = self.handler.lock() {
            *current = Some(Arc::new(handler));
        }
    }

    pub fn resources(&self) -> MockResources {
        match self.state.lock() {
            Ok(state) => MockResources {
                networks: state.networks.values().cloned().collect(),
                volumes: state.volumes.values().cloned().collect(),
                containers: state
                    .containers
                    .values()
                    .map(|c| c.spec.name.clone())
                    .collect(),
            },
            Err(_) => MockResources::default(),
        }
    }

    pub fn exec_log(&self) -> Vec<MockExec> {
        self.state
            .lock()
            .map(|state| state.exec_log.clone())
            .unwrap_or_default()
    }

    /// Read a file from a mock container by container name.
    pub fn file(&self, container_name: &str, path: &str) -> Option<String> {
        let state = self.state.lock().ok()?;
        state
            .containers
            .values()
            .find(|c| c.spec.name == container_name)
            .and_then(|c| c.files.get(path).cloned())
    }

    pub fn append_log(&self, container_name: &str, line: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(container) = state
                .containers
                .values_mut()
                .find(|c| c.spec.name == container_name)
            {
                container.logs.push(line.to_string());
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::runtime_unavailable("mock runtime state poisoned".to_string()))
    }

    fn next_id(state: &mut MockState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}{:012x}", state.next_id)
    }
}

fn is_listed(set: &Mutex<BTreeSet<String>>, repository: &str) -> bool {
    set.lock()
        .map(|set| set.contains(repository))
        .unwrap_or(false)
}

/// Extract the target of `sh -c "... cat > 'path'"`.
fn write_target(argv: &[String]) -> Option<String> {
    match argv {
        [sh, flag, script] if sh == "sh" && flag == "-c" => {
            let (_, rest) = script.split_once("cat > '")?;
            rest.strip_suffix('\'').map(|p| p.to_string())
        }
        _ => None,
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_image(&self, image: &ImageRef) -> Result<(), Error> {
        if is_listed(&self.unavailable_images, &image.repository) {
            Err(Error::image_unavailable(
                image.to_string(),
                "pull access denied".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    async fn create_network(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<NetworkId, Error> {
        let mut state = self.lock()?;

        if state.networks.values().any(|n| n == name) {
            return Err(Error::container_conflict(name.to_string()));
        }

        let id = NetworkId(Self::next_id(&mut state, "net"));
        state.networks.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn remove_network(&self, network: &NetworkId) -> Result<(), Error> {
        let mut state = self.lock()?;

        if state
            .containers
            .values()
            .any(|c| c.spec.network.as_ref() == Some(network))
        {
            return Err(Error::container_conflict(network.0.clone()));
        }

        state
            .networks
            .remove(network)
            .map(|_| ())
            .ok_or_else(|| Error::container_not_found(network.0.clone()))
    }

    async fn create_volume(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<VolumeId, Error> {
        let mut state = self.lock()?;
        let id = VolumeId(name.to_string());
        state.volumes.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn remove_volume(&self, volume: &VolumeId) -> Result<(), Error> {
        let mut state = self.lock()?;
        state
            .volumes
            .remove(volume)
            .map(|_| ())
            .ok_or_else(|| Error::container_not_found(volume.0.clone()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, Error> {
        let mut state = self.lock()?;

        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(Error::container_conflict(spec.name.clone()));
        }

        if let Some(network) = &spec.network {
            if !state.networks.contains_key(network) {
                return Err(Error::container_not_found(network.0.clone()));
            }
        }

        let id = ContainerId(Self::next_id(&mut state, "ctr"));
        state.containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                state: ContainerState::Created,
                files: BTreeMap::new(),
                logs: Vec::new(),
            },
        );

        Ok(id)
    }

    async fn start_container(&self, container: &ContainerId) -> Result<(), Error> {
        let mut state = self.lock()?;
        let entry = state
            .containers
            .get_mut(container)
            .ok_or_else(|| Error::container_not_found(container.0.clone()))?;

        let crashing = entry
            .spec
            .image
            .as_ref()
            .map(|image| is_listed(&self.crashing_images, &image.repository))
            .unwrap_or(false);

        if crashing {
            entry.state = ContainerState::Exited(1);
            entry
                .logs
                .push("panic: failed to load genesis: invalid character".to_string());
        } else {
            entry.state = ContainerState::Running;
            entry.logs.push(format!("{} started", entry.spec.name));
        }

        Ok(())
    }

    async fn stop_container(
        &self,
        container: &ContainerId,
        _grace: Duration,
    ) -> Result<(), Error> {
        let mut state = self.lock()?;
        let entry = state
            .containers
            .get_mut(container)
            .ok_or_else(|| Error::container_not_found(container.0.clone()))?;

        entry.state = ContainerState::Exited(0);
        Ok(())
    }

    async fn remove_container(&self, container: &ContainerId) -> Result<(), Error> {
        let mut state = self.lock()?;
        state
            .containers
            .remove(container)
            .map(|_| ())
            .ok_or_else(|| Error::container_not_found(container.0.clone()))
    }

    async fn wait_container(&self, container: &ContainerId) -> Result<i64, Error> {
        loop {
            match self.inspect_container(container).await? {
                ContainerState::Exited(code) => return Ok(code),
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }

    async fn inspect_container(&self, container: &ContainerId) -> Result<ContainerState, Error> {
        let state = self.lock()?;
        state
            .containers
            .get(container)
            .map(|c| c.state)
            .ok_or_else(|| Error::container_not_found(container.0.clone()))
    }

    async fn exec(
        &self,
        container: &ContainerId,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, Error> {
        let request = {
            let mut state = self.lock()?;
            let entry = state
                .containers
                .get_mut(container)
                .ok_or_else(|| Error::container_not_found(container.0.clone()))?;

            if entry.state != ContainerState::Running {
                return Err(Error::exec(
                    entry.spec.name.clone(),
                    argv.join(" "),
                    126,
                    "container is not running".to_string(),
                ));
            }

            if let Some(path) = write_target(argv) {
                let content = String::from_utf8_lossy(stdin.unwrap_or_default()).to_string();
                entry.files.insert(path, content);
                return Ok(ExecOutput::default());
            }

            if let [cat, path] = argv {
                if cat == "cat" {
                    return Ok(match entry.files.get(path) {
                        Some(content) => ExecOutput::success(content.clone()),
                        None => ExecOutput::failure(
                            1,
                            format!("cat: {path}: No such file or directory"),
                        ),
                    });
                }
            }

            let request = MockExec {
                container: entry.spec.name.clone(),
                hostname: entry.spec.hostname.clone(),
                image: entry
                    .spec
                    .image
                    .as_ref()
                    .map(|i| i.repository.clone())
                    .unwrap_or_default(),
                argv: argv.to_vec(),
                stdin: stdin.map(|s| s.to_vec()),
            };

            state.exec_log.push(request.clone());
            request
        };

        let handler = self.handler.lock().ok().and_then(|h| h.clone());

        Ok(handler
            .and_then(|handler| handler(&request))
            .unwrap_or_default())
    }

    async fn exec_detached(&self, container: &ContainerId, argv: &[String]) -> Result<(), Error> {
        self.exec(container, argv, None).await.map(|_| ())
    }

    async fn logs(&self, container: &ContainerId, tail: Option<usize>) -> Result<String, Error> {
        let state = self.lock()?;
        let entry = state
            .containers
            .get(container)
            .ok_or_else(|| Error::container_not_found(container.0.clone()))?;

        let skip = match tail {
            Some(tail) => entry.logs.len().saturating_sub(tail),
            None => 0,
        };

        Ok(entry.logs[skip..].join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::DockerBroker;
    use crate::error::ErrorKind;
    use crate::framework::supervisor::Supervisor;
    use crate::types::context::Context;

    fn spec(name: &str, network: &NetworkId, repository: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            hostname: name.to_string(),
            image: Some(ImageRef::new(repository, "latest")),
            network: Some(network.clone()),
            ..Default::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn broker_registers_every_resource_for_cleanup() {
        let runtime = MockRuntime::new();
        let supervisor = Supervisor::new("broker");
        let broker = DockerBroker::new(Arc::new(runtime.clone()), supervisor.clone(), "broker");
        let ctx = Context::background();

        let network = broker.setup_network(&ctx).await.unwrap();
        broker.create_volume(&ctx, "data").await.unwrap();

        let container = broker
            .create_container(&ctx, spec(&broker.resource_name("node"), &network, "gaia"))
            .await
            .unwrap();
        container.start(&ctx).await.unwrap();

        container
            .write_file(&ctx, "/root/config/genesis.json", "{}")
            .await
            .unwrap();
        assert_eq!(
            container.read_file(&ctx, "/root/config/genesis.json").await.unwrap(),
            "{}"
        );

        let resources = runtime.resources();
        assert_eq!(resources.networks.len(), 1);
        assert_eq!(resources.volumes.len(), 1);
        assert_eq!(resources.containers.len(), 1);

        supervisor.close().await.unwrap();

        assert!(runtime.resources().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn unavailable_image_fails_before_creation() {
        let runtime = MockRuntime::new();
        runtime.mark_image_unavailable("missing");

        let supervisor = Supervisor::new("image");
        let broker = DockerBroker::new(Arc::new(runtime.clone()), supervisor.clone(), "image");
        let ctx = Context::background();

        let network = broker.setup_network(&ctx).await.unwrap();
        let err = broker
            .create_container(&ctx, spec("node", &network, "missing"))
            .await
            .err()
            .unwrap();

        assert_eq!(err.kind(), ErrorKind::ImageUnavailable);
        assert!(runtime.resources().containers.is_empty());

        supervisor.close().await.unwrap();
        assert!(runtime.resources().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn exec_checked_reports_stderr() {
        let runtime = MockRuntime::new();
        runtime.set_exec_handler(|exec| {
            (exec.argv[0] == "false").then(|| ExecOutput::failure(2, "nope"))
        });

        let supervisor = Supervisor::new("exec");
        let broker = DockerBroker::new(Arc::new(runtime.clone()), supervisor.clone(), "exec");
        let ctx = Context::background();

        let network = broker.setup_network(&ctx).await.unwrap();
        let container = broker
            .create_container(&ctx, spec("node", &network, "gaia"))
            .await
            .unwrap();
        container.start(&ctx).await.unwrap();

        let err = container.exec_checked(&ctx, &["false"]).await.unwrap_err();
        assert!(err.to_string().contains("nope"));

        assert!(container.exec_checked(&ctx, &["true"]).await.is_ok());

        supervisor.close().await.unwrap();
    }
}
