/*!
   A [`ContainerRuntime`] driving the `docker` command line.
*/

use async_trait::async_trait;
use core::time::Duration;
use std::collections::BTreeMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::exec::{exec_output, ExecOutput};
use super::{ContainerId, ContainerRuntime, ContainerSpec, ContainerState, ImageRef, NetworkId, VolumeId};
use crate::error::{Error, ErrorDetail};

pub struct DockerCli {
    command_path: String,
    available: OnceCell<String>,
}

impl DockerCli {
    pub fn new(command_path: impl Into<String>) -> Self {
        Self {
            command_path: command_path.into(),
            available: OnceCell::new(),
        }
    }

    pub fn command_path(&self) -> &str {
        &self.command_path
    }

    /**
       Check that the runtime daemon is reachable. The check runs once,
       on the first call that needs the runtime.
    */
    pub async fn server_version(&self) -> Result<&str, Error> {
        let version = self
            .available
            .get_or_try_init(|| async {
                let output = exec_output(
                    "docker version",
                    &self.command_path,
                    &args(["version", "--format", "{{.Server.Version}}"]),
                    None,
                )
                .await
                .map_err(|e| match e.detail() {
                    ErrorDetail::CommandNotFound(_) => Error::runtime_unavailable(format!(
                        "command `{}` not found",
                        self.command_path
                    )),
                    _ => e,
                })?;

                if !output.is_success() {
                    return Err(Error::runtime_unavailable(output.stderr.trim().to_string()));
                }

                let version = output.stdout.trim().to_string();
                info!("connected to container runtime version {}", version);

                Ok(version)
            })
            .await?;

        Ok(version.as_str())
    }

    async fn run(&self, desc: &str, args: Vec<String>) -> Result<String, Error> {
        self.run_with_stdin(desc, args, None)
            .await
            .map(|output| output.stdout.trim().to_string())
    }

    async fn run_with_stdin(
        &self,
        desc: &str,
        args: Vec<String>,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, Error> {
        self.server_version().await?;

        let output = exec_output(desc, &self.command_path, &args, stdin).await?;

        if output.is_success() {
            Ok(output)
        } else {
            Err(classify_failure(desc, &output.stderr))
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Map the runtime's stderr to a structured error.
pub fn classify_failure(subject: &str, stderr: &str) -> Error {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
    {
        Error::runtime_unavailable(message)
    } else if lower.contains("pull access denied")
        || lower.contains("manifest unknown")
        || lower.contains("repository does not exist")
        || lower.contains("manifest for")
    {
        Error::image_unavailable(subject.to_string(), message)
    } else if lower.contains("no such container")
        || lower.contains("no such network")
        || lower.contains("no such volume")
        || lower.contains("not found")
    {
        Error::container_not_found(subject.to_string())
    } else if lower.contains("already in use")
        || lower.contains("already exists")
        || lower.contains("conflict")
    {
        Error::container_conflict(subject.to_string())
    } else {
        Error::exec(subject.to_string(), "docker".to_string(), 1, message)
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn label_args(labels: &BTreeMap<String, String>) -> Vec<String> {
    labels
        .iter()
        .flat_map(|(k, v)| ["--label".to_string(), format!("{k}={v}")])
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ensure_image(&self, image: &ImageRef) -> Result<(), Error> {
        let reference = image.to_string();

        if self
            .run("image inspect", args(["image", "inspect", &reference]))
            .await
            .is_ok()
        {
            return Ok(());
        }

        debug!("pulling image {}", reference);

        self.run(&reference, args(["pull", &reference]))
            .await
            .map_err(|e| match e.detail() {
                ErrorDetail::RuntimeUnavailable(_) => e,
                _ => Error::image_unavailable(reference.clone(), e.to_string()),
            })?;

        Ok(())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<NetworkId, Error> {
        let mut cmd = args(["network", "create", "--driver", "bridge"]);
        cmd.extend(label_args(labels));
        cmd.push(name.to_string());

        let id = self.run(name, cmd).await?;
        Ok(NetworkId(id))
    }

    async fn remove_network(&self, network: &NetworkId) -> Result<(), Error> {
        self.run(&network.0, args(["network", "rm", &network.0]))
            .await?;
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<VolumeId, Error> {
        let mut cmd = args(["volume", "create"]);
        cmd.extend(label_args(labels));
        cmd.push(name.to_string());

        let id = self.run(name, cmd).await?;
        Ok(VolumeId(id))
    }

    async fn remove_volume(&self, volume: &VolumeId) -> Result<(), Error> {
        self.run(&volume.0, args(["volume", "rm", "-f", &volume.0]))
            .await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, Error> {
        let image = spec
            .image
            .as_ref()
            .ok_or_else(|| Error::config_invalid(format!("container {} has no image", spec.name)))?;

        let mut cmd = args(["create", "--name", &spec.name]);

        if !spec.hostname.is_empty() {
            cmd.extend(args(["--hostname", &spec.hostname]));
        }

        if let Some(network) = &spec.network {
            cmd.extend(args(["--network", &network.0]));
        }

        if let Some(user) = &image.uid_gid {
            cmd.extend(args(["--user", user]));
        }

        for (key, value) in &spec.env {
            cmd.push("-e".to_string());
            cmd.push(format!("{key}={value}"));
        }

        for (volume, path) in &spec.mounts {
            cmd.push("-v".to_string());
            cmd.push(format!("{}:{}", volume.0, path));
        }

        cmd.extend(label_args(&spec.labels));

        // `--entrypoint` takes a single executable, the rest goes in front of the command
        let mut entrypoint = spec.entrypoint.iter();
        if let Some(program) = entrypoint.next() {
            cmd.extend(args(["--entrypoint", program]));
        }

        cmd.push(image.to_string());
        cmd.extend(entrypoint.cloned());
        cmd.extend(spec.cmd.iter().cloned());

        let id = self.run(&spec.name, cmd).await?;
        Ok(ContainerId(id))
    }

    async fn start_container(&self, container: &ContainerId) -> Result<(), Error> {
        self.run(&container.0, args(["start", &container.0]))
            .await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        container: &ContainerId,
        grace: Duration,
    ) -> Result<(), Error> {
        let seconds = grace.as_secs().to_string();
        self.run(&container.0, args(["stop", "-t", &seconds, &container.0]))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, container: &ContainerId) -> Result<(), Error> {
        self.run(&container.0, args(["rm", "-f", "-v", &container.0]))
            .await?;
        Ok(())
    }

    async fn wait_container(&self, container: &ContainerId) -> Result<i64, Error> {
        let code = self
            .run(&container.0, args(["wait", &container.0]))
            .await?;

        code.parse().map_err(|_| {
            Error::exec(
                container.0.clone(),
                "wait".to_string(),
                -1,
                format!("unexpected exit code output `{code}`"),
            )
        })
    }

    async fn inspect_container(&self, container: &ContainerId) -> Result<ContainerState, Error> {
        let output = self
            .run(
                &container.0,
                args([
                    "inspect",
                    "--format",
                    "{{.State.Status}} {{.State.ExitCode}}",
                    &container.0,
                ]),
            )
            .await?;

        parse_state(&output).ok_or_else(|| {
            Error::exec(
                container.0.clone(),
                "inspect".to_string(),
                -1,
                format!("unexpected container state `{output}`"),
            )
        })
    }

    async fn exec(
        &self,
        container: &ContainerId,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, Error> {
        self.server_version().await?;

        let mut cmd = vec!["exec".to_string()];
        if stdin.is_some() {
            cmd.push("-i".to_string());
        }
        cmd.push(container.0.clone());
        cmd.extend(argv.iter().cloned());

        let output = exec_output("docker exec", &self.command_path, &cmd, stdin).await?;

        // the runtime itself reports failures with status 125
        if output.exit_code == 125 {
            return Err(classify_failure(&container.0, &output.stderr));
        }

        Ok(output)
    }

    async fn exec_detached(&self, container: &ContainerId, argv: &[String]) -> Result<(), Error> {
        let mut cmd = args(["exec", "-d", &container.0]);
        cmd.extend(argv.iter().cloned());

        self.run(&container.0, cmd).await?;
        Ok(())
    }

    async fn logs(&self, container: &ContainerId, tail: Option<usize>) -> Result<String, Error> {
        let mut cmd = vec!["logs".to_string()];
        if let Some(tail) = tail {
            cmd.push("--tail".to_string());
            cmd.push(tail.to_string());
        }
        cmd.push(container.0.clone());

        let output = self.run_with_stdin(&container.0, cmd, None).await?;

        // node binaries log to stderr
        Ok(format!("{}{}", output.stdout, output.stderr))
    }
}

fn parse_state(output: &str) -> Option<ContainerState> {
    let mut parts = output.split_whitespace();
    let status = parts.next()?;
    let code: i64 = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);

    match status {
        "created" => Some(ContainerState::Created),
        "running" | "restarting" | "paused" => Some(ContainerState::Running),
        "exited" | "dead" | "removing" => Some(ContainerState::Exited(code)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn classifies_runtime_errors() {
        assert_eq!(
            classify_failure("x", "Cannot connect to the Docker daemon at unix:///var/run/docker.sock")
                .kind(),
            ErrorKind::RuntimeUnavailable
        );
        assert_eq!(
            classify_failure("img", "Error response from daemon: manifest unknown").kind(),
            ErrorKind::ImageUnavailable
        );
        assert!(matches!(
            classify_failure("c", "Error: No such container: c").detail(),
            ErrorDetail::ContainerNotFound(_)
        ));
        assert!(matches!(
            classify_failure("c", "Conflict. The container name \"/c\" is already in use").detail(),
            ErrorDetail::ContainerConflict(_)
        ));
    }

    #[test]
    fn parses_inspect_output() {
        assert_eq!(parse_state("running 0"), Some(ContainerState::Running));
        assert_eq!(parse_state("exited 137"), Some(ContainerState::Exited(137)));
        assert_eq!(parse_state("bogus"), None);
    }
}
