// #![deny(warnings)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]
#![doc = include_str!("../README.md")]

//!
//! ## Example Test
//!
//! ```rust,no_run
//! use interchain_test_framework::prelude::*;
//!
//! pub struct TransferTest;
//!
//! #[async_trait]
//! impl InterchainTest for TransferTest {
//!     fn test_name(&self) -> &str {
//!         "transfer"
//!     }
//!
//!     async fn run(
//!         &self,
//!         ctx: &Context,
//!         config: &TestConfig,
//!         broker: &DockerBroker,
//!     ) -> Result<(), Error> {
//!         let chains = ChainFactory::new([
//!             ChainSpec::new("gaia"),
//!             ChainSpec::new("osmosis").with_chain_name("gaia"),
//!         ])
//!         .chains(self.test_name())?;
//!
//!         let interchain = Interchain::new()
//!             .add_chain(chains[0].clone())
//!             .add_chain(chains[1].clone())
//!             .add_relayer(Arc::new(RelayerDriver::from_kind("hermes", RelayerKind::Hermes)))
//!             .add_link(InterchainLink::new("transfer", "gaia", "osmosis", "hermes"));
//!
//!         interchain
//!             .build(ctx, broker, None, &InterchainBuildOptions::new(self.test_name()))
//!             .await?;
//!
//!         let users =
//!             get_and_fund_test_users(ctx, "user", Amount(10_000_000), interchain.chains())
//!                 .await?;
//!
//!         info!("funded {} users under {}", users.len(), config.chain_store_dir.display());
//!
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     run_interchain_test(&TransferTest).await
//! }
//! ```

pub mod bootstrap;
pub mod chain;
pub mod docker;
pub mod error;
pub mod framework;
pub mod interchain;
pub mod prelude;
pub mod relayer;
pub mod reporter;
pub mod testutil;
pub mod types;
pub mod util;
