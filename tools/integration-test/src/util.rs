/*!
   Helpers shared by the scenarios.
*/

use interchain_test_framework::prelude::*;

/**
   Build options honoring the test config: the block database when one
   is configured, and the topology env file in the test store directory.
*/
pub fn build_options(config: &TestConfig, test_name: &str) -> InterchainBuildOptions {
    let options = InterchainBuildOptions::new(test_name)
        .with_env_file(config.chain_store_dir.join(format!("{test_name}.env")));

    match &config.block_database_file {
        Some(path) => options.with_block_database(path.clone()),
        None => options,
    }
}

pub fn hermes() -> Arc<RelayerDriver> {
    Arc::new(RelayerDriver::from_kind("hermes", RelayerKind::Hermes))
}
