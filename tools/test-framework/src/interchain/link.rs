/*!
   Links between the chains of an interchain.
*/

use crate::relayer::{ChannelOrdering, CreateChannelOptions};

/// Port of the CCV channel on the consumer side.
pub const CONSUMER_PORT: &str = "consumer";

/// Port of the CCV channel on the provider side.
pub const PROVIDER_PORT: &str = "provider";

/// Version of the CCV channel.
pub const CCV_VERSION: &str = "1";

/**
   A generic IBC path between two chains, served by one relayer.
   Chains and the relayer are referenced by their logical names.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterchainLink {
    pub path: String,
    pub chain_a: String,
    pub chain_b: String,
    pub relayer: String,
    /// Channel options of this link. Falls back to the build options when unset.
    pub create_channel_opts: Option<CreateChannelOptions>,
}

impl InterchainLink {
    pub fn new(
        path: impl Into<String>,
        chain_a: impl Into<String>,
        chain_b: impl Into<String>,
        relayer: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            chain_a: chain_a.into(),
            chain_b: chain_b.into(),
            relayer: relayer.into(),
            create_channel_opts: None,
        }
    }

    pub fn with_channel_options(mut self, options: CreateChannelOptions) -> Self {
        self.create_channel_opts = Some(options);
        self
    }
}

/**
   An interchain security link. The consumer is started only once the
   provider accepted it, and the relayer path between the two reuses
   the light clients created from the CCV genesis.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConsumerLink {
    pub provider: String,
    pub consumer: String,
    pub relayer: String,
    pub path: String,
}

impl ProviderConsumerLink {
    pub fn new(
        provider: impl Into<String>,
        consumer: impl Into<String>,
        relayer: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            consumer: consumer.into(),
            relayer: relayer.into(),
            path: path.into(),
        }
    }
}

/// Options of the ordered channel carrying the CCV protocol.
pub fn ccv_channel_options() -> CreateChannelOptions {
    CreateChannelOptions {
        source_port: CONSUMER_PORT.to_string(),
        destination_port: PROVIDER_PORT.to_string(),
        ordering: ChannelOrdering::Ordered,
        version: CCV_VERSION.to_string(),
    }
}
