/*!
   Definition for the test configuration.
*/

use core::fmt::Debug;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::chain::spec::ChainSpec;

/**
   The test config to be passed to each test case. Currently this is
   loaded from the [`init_test`](crate::bootstrap::init::init_test)
   function based on the test environment variables.
*/
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /**
       The directory where logs, env files and the block database of
       the test run are written.

       Configured through the `CHAIN_STORE_DIR` environment variable.
    */
    pub chain_store_dir: PathBuf,

    /**
       Path to the container runtime command line.

       Configured through the `DOCKER_COMMAND` environment variable,
       defaulting to `docker`.
    */
    pub docker_command: String,

    /**
       Whether to suspend a test case when it fails, so that the
       containers can be inspected before cleanup.

       Configured through the `HANG_ON_FAIL` environment variable.
    */
    pub hang_on_fail: bool,

    /**
       When set, every block observed on every chain is appended to this
       file as JSON lines.

       Configured through the `BLOCK_DATABASE_FILE` environment variable.
    */
    pub block_database_file: Option<PathBuf>,

    /**
       Extra chain descriptors loaded from the TOML file pointed to by
       `INTERCHAIN_TEST_CONFIG`.
    */
    #[serde(default)]
    pub chains: Vec<ChainSpec>,
}

/// The layout of the optional TOML file pointed to by `INTERCHAIN_TEST_CONFIG`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConfigFile {
    pub chain_store_dir: Option<PathBuf>,
    pub docker_command: Option<String>,
    pub hang_on_fail: Option<bool>,
    pub block_database_file: Option<PathBuf>,
    #[serde(default)]
    pub chains: Vec<ChainSpec>,
}
