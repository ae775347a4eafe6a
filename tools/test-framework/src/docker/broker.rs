use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    sanitize_name, ContainerId, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput,
    ImageRef, NetworkId, VolumeId, LOG_TAIL_LINES, TEST_NAME_LABEL,
};
use crate::error::Error;
use crate::framework::supervisor::Supervisor;
use crate::types::context::Context;
use crate::util::file::LogSink;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/**
   Creates containers, volumes and networks for a single test run and
   registers their removal with the run's [`Supervisor`].

   Nothing leaves the broker without a matching cleanup registration.
*/
#[derive(Clone)]
pub struct DockerBroker {
    runtime: Arc<dyn ContainerRuntime>,
    supervisor: Supervisor,
    test_name: String,
    run_id: u64,
}

impl DockerBroker {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        supervisor: Supervisor,
        test_name: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            supervisor,
            test_name: test_name.into(),
            run_id: RUN_COUNTER.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Resource name unique to this run, e.g. `gaia-1-val-0-testics-3`.
    pub fn resource_name(&self, suffix: &str) -> String {
        format!("{}-{}-{}", suffix, sanitize_name(&self.test_name), self.run_id)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(TEST_NAME_LABEL.to_string(), self.test_name.clone())])
    }

    /// Create the user-defined network shared by every container of the run.
    pub async fn setup_network(&self, ctx: &Context) -> Result<NetworkId, Error> {
        let name = format!(
            "interchaintest-{}-{}",
            sanitize_name(&self.test_name),
            self.run_id
        );

        let labels = self.labels();
        let network = ctx
            .run("create network", self.runtime.create_network(&name, &labels))
            .await?;

        let runtime = self.runtime.clone();
        let removed = network.clone();
        self.supervisor
            .register(format!("remove network {name}"), move || async move {
                runtime.remove_network(&removed).await
            });

        info!("created network {}", name);

        Ok(network)
    }

    pub async fn create_volume(&self, ctx: &Context, suffix: &str) -> Result<VolumeId, Error> {
        let name = self.resource_name(suffix);
        let labels = self.labels();

        let volume = ctx
            .run("create volume", self.runtime.create_volume(&name, &labels))
            .await?;

        let runtime = self.runtime.clone();
        let removed = volume.clone();
        self.supervisor
            .register(format!("remove volume {name}"), move || async move {
                runtime.remove_volume(&removed).await
            });

        Ok(volume)
    }

    /**
       Pull the image if needed, then create (but do not start) a
       container. Its removal is registered before the handle is
       returned.
    */
    pub async fn create_container(
        &self,
        ctx: &Context,
        mut spec: ContainerSpec,
    ) -> Result<Container, Error> {
        let image = spec
            .image
            .clone()
            .ok_or_else(|| Error::config_invalid(format!("container {} has no image", spec.name)))?;

        ctx.run("pull image", self.runtime.ensure_image(&image))
            .await?;

        spec.labels.extend(self.labels());

        let id = ctx
            .run("create container", self.runtime.create_container(&spec))
            .await?;

        let runtime = self.runtime.clone();
        let removed = id.clone();
        self.supervisor
            .register(format!("remove container {}", spec.name), move || async move {
                runtime.remove_container(&removed).await
            });

        debug!("created container {} ({})", spec.name, id);

        Ok(Container {
            id,
            name: spec.name,
            hostname: spec.hostname,
            image,
            runtime: self.runtime.clone(),
        })
    }
}

/// A handle to a container created through a [`DockerBroker`].
#[derive(Clone)]
pub struct Container {
    id: ContainerId,
    name: String,
    hostname: String,
    image: ImageRef,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Container {
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    pub async fn start(&self, ctx: &Context) -> Result<(), Error> {
        ctx.run("start container", self.runtime.start_container(&self.id))
            .await
    }

    pub async fn stop(&self, ctx: &Context, grace: Duration) -> Result<(), Error> {
        ctx.run("stop container", self.runtime.stop_container(&self.id, grace))
            .await
    }

    pub async fn state(&self, ctx: &Context) -> Result<ContainerState, Error> {
        ctx.run("inspect container", self.runtime.inspect_container(&self.id))
            .await
    }

    pub async fn exec(&self, ctx: &Context, argv: &[&str]) -> Result<ExecOutput, Error> {
        self.exec_with_stdin(ctx, argv, None).await
    }

    pub async fn exec_with_stdin(
        &self,
        ctx: &Context,
        argv: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, Error> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();

        ctx.run("exec", self.runtime.exec(&self.id, &argv, stdin))
            .await
    }

    /// Like [`exec`](Self::exec), but a non-zero exit code is an error.
    pub async fn exec_checked(&self, ctx: &Context, argv: &[&str]) -> Result<ExecOutput, Error> {
        let output = self.exec(ctx, argv).await?;
        self.check_output(argv, output)
    }

    pub async fn exec_checked_with_stdin(
        &self,
        ctx: &Context,
        argv: &[&str],
        stdin: &[u8],
    ) -> Result<ExecOutput, Error> {
        let output = self.exec_with_stdin(ctx, argv, Some(stdin)).await?;
        self.check_output(argv, output)
    }

    fn check_output(&self, argv: &[&str], output: ExecOutput) -> Result<ExecOutput, Error> {
        if output.is_success() {
            Ok(output)
        } else {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout
            } else {
                output.stderr
            };

            Err(Error::exec(
                self.name.clone(),
                argv.join(" "),
                output.exit_code,
                detail.trim().to_string(),
            ))
        }
    }

    pub async fn exec_detached(&self, ctx: &Context, argv: &[&str]) -> Result<(), Error> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();

        ctx.run("exec detached", self.runtime.exec_detached(&self.id, &argv))
            .await
    }

    /// The last lines of the container log, or an empty string if they cannot be read.
    pub async fn log_tail(&self) -> String {
        self.runtime
            .logs(&self.id, Some(LOG_TAIL_LINES))
            .await
            .unwrap_or_default()
    }

    pub async fn read_file(&self, ctx: &Context, path: &str) -> Result<String, Error> {
        let output = self.exec_checked(ctx, &["cat", path]).await?;
        Ok(output.stdout)
    }

    pub async fn write_file(&self, ctx: &Context, path: &str, content: &str) -> Result<(), Error> {
        let script = format!("mkdir -p \"$(dirname '{path}')\" && cat > '{path}'");

        self.exec_checked_with_stdin(ctx, &["sh", "-c", &script], content.as_bytes())
            .await?;

        debug!("wrote file {} in container {}", path, self.name);

        Ok(())
    }

    /**
       Copy the full container log into `sink` when the supervisor
       closes. Registered after the container itself, so it runs before
       the container is removed.
    */
    pub fn capture_logs(&self, supervisor: &Supervisor, sink: LogSink) {
        let runtime = self.runtime.clone();
        let id = self.id.clone();
        let name = self.name.clone();

        supervisor.register(format!("capture logs of {name}"), move || async move {
            let logs = runtime.logs(&id, None).await?;
            sink.write_line(&format!("===== {name} ====="))?;
            sink.write_raw(logs.as_bytes())
        });
    }
}
