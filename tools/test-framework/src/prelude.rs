/*!
   Re-export of common constructs that are used by test cases.
*/

pub use async_trait::async_trait;
pub use core::time::Duration;
pub use eyre::eyre;
pub use std::sync::Arc;
pub use tracing::{debug, error, info, warn};

pub use crate::chain::builtin::builtin_config;
pub use crate::chain::chain_type::ChainFamily;
pub use crate::chain::factory::ChainFactory;
pub use crate::chain::spec::{ChainConfig, ChainConfigOverrides, ChainSpec, IcsRole};
pub use crate::chain::{
    get_and_fund_user, Chain, ChainCapabilities, ChainEndpoint, IcsConsumer, IcsProvider,
    ThorchainApi, FAUCET_KEY,
};
pub use crate::docker::{ContainerRuntime, DockerBroker, ImageRef, NetworkId};
pub use crate::error::{handle_generic_error, Error, ErrorKind, ExitStatus};
pub use crate::framework::base::{run_interchain_test, run_with_runtime, InterchainTest};
pub use crate::framework::supervisor::Supervisor;
pub use crate::interchain::{
    ccv_channel_options, Interchain, InterchainBuildOptions, InterchainLink, ProviderConsumerLink,
};
pub use crate::relayer::{
    ChannelOrdering, CreateChannelOptions, PathState, RelayerDriver, RelayerKind,
};
pub use crate::reporter::{ExecReporter, Reporter};
pub use crate::testutil::{
    create_log_file, get_and_fund_test_users, poll_for, poll_for_balance_change,
    wait_for_blocks,
};
pub use crate::types::config::TestConfig;
pub use crate::types::context::Context;
pub use crate::types::token::{Amount, WalletAmount};
pub use crate::types::wallet::Wallet;
pub use crate::util::assert::*;
pub use crate::util::progress::Progress;
pub use crate::util::retry::assert_eventually_succeed;
