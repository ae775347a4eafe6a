/*!
   Functions for initializing each test at the beginning of a Rust test
   session.
*/

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing::debug;
use tracing_subscriber::{
    self as ts,
    filter::{EnvFilter, LevelFilter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::Error;
use crate::types::config::{TestConfig, TestConfigFile};
use crate::util::random::random_u32;

static INIT: Once = Once::new();

/**
   Initialize the test with a global logger and error handlers,
   read the environment variables and return a [`TestConfig`].
*/
pub fn init_test() -> Result<TestConfig, Error> {
    let no_color_log = env_flag("NO_COLOR_LOG");

    INIT.call_once(|| {
        if !no_color_log {
            // Fails only when a handler is already installed.
            let _ = color_eyre::install();
        }
        install_logger(!no_color_log);
    });

    let file = match env::var("INTERCHAIN_TEST_CONFIG") {
        Ok(path) => load_config_file(path)?,
        Err(_) => TestConfigFile::default(),
    };

    let config = resolve_config(file, |name| env::var(name).ok())?;

    debug!("loaded test config: {:?}", config);

    Ok(config)
}

/**
   Merge the optional config file with the environment. Environment
   variables win over the file.
*/
pub fn resolve_config(
    file: TestConfigFile,
    var: impl Fn(&str) -> Option<String>,
) -> Result<TestConfig, Error> {
    let base_chain_store_dir = var("CHAIN_STORE_DIR")
        .map(PathBuf::from)
        .or(file.chain_store_dir)
        .unwrap_or_else(|| PathBuf::from("data"));

    let chain_store_dir = base_chain_store_dir.join(format!("test-{}", random_u32()));

    fs::create_dir_all(&chain_store_dir)?;

    let chain_store_dir = fs::canonicalize(chain_store_dir)?;

    let docker_command = var("DOCKER_COMMAND")
        .or(file.docker_command)
        .unwrap_or_else(|| "docker".to_string());

    let hang_on_fail = var("HANG_ON_FAIL")
        .map(|val| val == "1")
        .or(file.hang_on_fail)
        .unwrap_or(false);

    let block_database_file = var("BLOCK_DATABASE_FILE")
        .map(PathBuf::from)
        .or(file.block_database_file);

    Ok(TestConfig {
        chain_store_dir,
        docker_command,
        hang_on_fail,
        block_database_file,
        chains: file.chains,
    })
}

pub fn load_config_file(path: impl AsRef<Path>) -> Result<TestConfigFile, Error> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;

    toml::from_str(&content).map_err(|e| {
        Error::config_invalid(format!(
            "failed to parse test config {}: {}",
            path.display(),
            e
        ))
    })
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|val| val == "1").unwrap_or(false)
}

/**
   Install the [`tracing_subscriber`] logger handlers so that logs will
   be displayed during test.
*/
pub fn install_logger(with_color: bool) {
    // Use log level INFO by default if RUST_LOG is not set.
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let layer = ts::fmt::layer().with_ansi(with_color);

    if let Err(e) = ts::registry().with(env_filter).with(layer).try_init() {
        eprintln!("logger already installed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |name| map.get(name).cloned()
    }

    #[test]
    fn environment_overrides_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_store = dir.path().join("from-file");
        let env_store = dir.path().join("from-env");

        let file = TestConfigFile {
            chain_store_dir: Some(file_store),
            docker_command: Some("podman".to_string()),
            hang_on_fail: Some(true),
            ..Default::default()
        };

        let config = resolve_config(
            file,
            vars(&[
                ("CHAIN_STORE_DIR", env_store.to_str().unwrap()),
                ("HANG_ON_FAIL", "0"),
                ("BLOCK_DATABASE_FILE", "/tmp/blocks.jsonl"),
            ]),
        )
        .unwrap();

        assert!(config.chain_store_dir.starts_with(env_store.canonicalize().unwrap()));
        assert_eq!(config.docker_command, "podman");
        assert!(!config.hang_on_fail);
        assert_eq!(
            config.block_database_file,
            Some(PathBuf::from("/tmp/blocks.jsonl"))
        );
    }

    #[test]
    fn config_file_is_parsed_as_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interchain.toml");

        fs::write(
            &path,
            r#"
docker_command = "/usr/local/bin/docker"
hang_on_fail = true

[[chains]]
name = "gaia"
"#,
        )
        .unwrap();

        let file = load_config_file(&path).unwrap();
        assert_eq!(file.docker_command.as_deref(), Some("/usr/local/bin/docker"));
        assert_eq!(file.chains.len(), 1);
        assert_eq!(file.chains[0].template_name(), "gaia");

        fs::write(&path, "unknown_field = 1\n").unwrap();
        assert!(load_config_file(&path).is_err());
    }
}
