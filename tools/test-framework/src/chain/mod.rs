/*!
   Chain drivers.

   Every supported chain family implements the [`Chain`] trait. The
   [`factory`] turns declarative [`ChainSpec`](spec::ChainSpec)s into
   driver instances, which the interchain assembler then initializes
   and starts.
*/

pub mod address;
pub mod builtin;
pub mod chain_type;
pub mod config;
pub mod cosmos;
pub mod evm;
pub mod factory;
pub mod funding;
pub mod keyring;
pub mod mock;
pub mod node;
pub mod spec;
pub mod thorchain;
pub mod traits;
pub mod utxo;

pub use funding::get_and_fund_user;
pub use traits::{
    Chain, ChainCapabilities, ChainEndpoint, ConsumerProposal, IcsConsumer, IcsProvider,
    InboundAddress, NodeHeight, ThorchainApi, FAUCET_KEY, POLL_INTERVAL,
};
