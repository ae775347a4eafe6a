use std::path::PathBuf;

use crate::docker::NetworkId;
use crate::relayer::CreateChannelOptions;
use crate::types::token::Amount;

/**
   Options of [`Interchain::build`](super::Interchain::build).
*/
#[derive(Debug, Clone, Default)]
pub struct InterchainBuildOptions {
    pub test_name: String,

    /// Use an existing network instead of creating one for the run.
    pub network_id: Option<NetworkId>,

    /// Leave generic links at `Added` instead of linking and relaying them.
    pub skip_path_creation: bool,

    /// Default channel options of links that do not carry their own.
    pub create_channel_opts: CreateChannelOptions,

    /// Append the height of every chain, each block, to this file.
    pub block_database_file: Option<PathBuf>,

    /// Write the topology as `KEY=VALUE` lines to this file once built.
    pub env_file: Option<PathBuf>,

    /// Funds given to each relayer wallet. Defaults to a hundredth of the faucet.
    pub relayer_wallet_amount: Option<Amount>,
}

impl InterchainBuildOptions {
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            ..Default::default()
        }
    }

    pub fn skip_path_creation(mut self, skip: bool) -> Self {
        self.skip_path_creation = skip;
        self
    }

    pub fn with_network(mut self, network_id: NetworkId) -> Self {
        self.network_id = Some(network_id);
        self
    }

    pub fn with_channel_options(mut self, options: CreateChannelOptions) -> Self {
        self.create_channel_opts = options;
        self
    }

    pub fn with_block_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.block_database_file = Some(path.into());
        self
    }

    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    pub fn with_relayer_wallet_amount(mut self, amount: Amount) -> Self {
        self.relayer_wallet_amount = Some(amount);
        self
    }
}
