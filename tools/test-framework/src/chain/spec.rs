/*!
   Chain descriptors and the merged per-chain configuration.

   A [`ChainSpec`] is what a test writes down. The
   [`ChainFactory`](super::factory::ChainFactory) resolves it against a
   builtin template into a [`ChainConfig`], where every field has a
   concrete value.
*/

use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::chain_type::ChainFamily;
use crate::docker::ImageRef;
use crate::types::token::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IcsRole {
    Provider,
    Consumer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvmConfig {
    /// The numeric EIP-155 chain id.
    pub evm_chain_id: u64,
    /// Address of an already deployed router contract.
    pub router_address: Option<String>,
    /// Creation bytecode deployed at start when no router address is set.
    pub router_bytecode: Option<String>,
    /// Address of an already deployed ERC-20 test token.
    pub token_address: Option<String>,
    /// Creation bytecode of the test token, deployed at start when no token address is set.
    pub token_bytecode: Option<String>,
    /// Private key funding the faucet account allocated in genesis.
    pub faucet_private_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtxoConfig {
    pub rpc_user: String,
    pub rpc_password: String,
    pub rpc_port: u16,
    /// Fee rate in the smallest unit per virtual byte.
    pub fee_rate: Amount,
    pub dust_limit: Amount,
    /// Interval of the background block producer.
    pub block_interval_ms: u64,
    /// Blocks mined to the faucet at start, so that its coinbase matures.
    pub maturity_blocks: u64,
    /// Whether the daemon understands segwit (`-addresstype=bech32`).
    pub segwit: bool,
}

/**
   The fully merged configuration of a chain.
*/
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Logical name, unique inside an interchain.
    pub name: String,
    /// Key of the builtin template this config was derived from.
    pub chain_name: String,
    pub family: ChainFamily,
    /// Template for the chain-id; `{name}` and `{n}` are substituted.
    pub chain_id_template: String,
    /// Rendered chain-id, set by the factory.
    pub chain_id: String,
    /// Node image first, sidecar images after it.
    pub images: Vec<ImageRef>,
    pub binary: String,
    pub home_dir: String,
    pub bech32_prefix: String,
    pub denom: String,
    pub decimals: u32,
    /// Price of one unit of gas, in `denom`.
    pub gas_prices: String,
    pub gas_adjustment: f64,
    pub trusting_period: String,
    pub num_validators: usize,
    pub num_full_nodes: usize,
    pub block_time_ms: u64,
    pub voting_period: String,
    pub faucet_amount: Amount,
    pub validator_stake: Amount,
    /// Genesis fields to overwrite, keyed by dotted path such as `app_state.gov.params.voting_period`.
    pub genesis_overrides: BTreeMap<String, serde_json::Value>,
    pub ics_role: Option<IcsRole>,
    pub coin_type: u32,
    pub faucet_mnemonic: Option<String>,
    pub evm: Option<EvmConfig>,
    pub utxo: Option<UtxoConfig>,
    pub readiness_timeout_secs: u64,
    pub tx_timeout_secs: u64,
    pub stall_timeout_secs: u64,
}

impl ChainConfig {
    pub fn node_image(&self) -> Option<&ImageRef> {
        self.images.first()
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvmOverrides {
    pub router_address: Option<String>,
    pub router_bytecode: Option<String>,
    pub token_address: Option<String>,
    pub token_bytecode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UtxoOverrides {
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub fee_rate: Option<Amount>,
    pub block_interval_ms: Option<u64>,
}

/**
   Per-chain overrides applied on top of a builtin template. Unset
   fields keep the template value.
*/
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainConfigOverrides {
    pub chain_id: Option<String>,
    pub images: Option<Vec<ImageRef>>,
    pub binary: Option<String>,
    pub bech32_prefix: Option<String>,
    pub denom: Option<String>,
    pub decimals: Option<u32>,
    pub gas_prices: Option<String>,
    pub gas_adjustment: Option<f64>,
    pub trusting_period: Option<String>,
    pub block_time_ms: Option<u64>,
    pub voting_period: Option<String>,
    pub faucet_amount: Option<Amount>,
    pub validator_stake: Option<Amount>,
    pub genesis_overrides: BTreeMap<String, serde_json::Value>,
    pub ics_role: Option<IcsRole>,
    pub coin_type: Option<u32>,
    pub faucet_mnemonic: Option<String>,
    pub evm: Option<EvmOverrides>,
    pub utxo: Option<UtxoOverrides>,
    pub readiness_timeout_secs: Option<u64>,
    pub tx_timeout_secs: Option<u64>,
    pub stall_timeout_secs: Option<u64>,
}

impl ChainConfigOverrides {
    /// Apply the overrides to a copy of `base`.
    pub fn apply(&self, base: &ChainConfig) -> ChainConfig {
        let mut config = base.clone();

        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = &self.$field {
                        config.$field = value.clone();
                    }
                )*
            };
        }

        set!(
            images,
            binary,
            bech32_prefix,
            denom,
            decimals,
            gas_prices,
            gas_adjustment,
            trusting_period,
            block_time_ms,
            voting_period,
            faucet_amount,
            validator_stake,
            coin_type,
            readiness_timeout_secs,
            tx_timeout_secs,
            stall_timeout_secs,
        );

        if let Some(template) = &self.chain_id {
            config.chain_id_template = template.clone();
        }

        if let Some(role) = self.ics_role {
            config.ics_role = Some(role);
        }

        if let Some(mnemonic) = &self.faucet_mnemonic {
            config.faucet_mnemonic = Some(mnemonic.clone());
        }

        config.genesis_overrides.extend(
            self.genesis_overrides
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        if let (Some(evm), Some(overrides)) = (config.evm.as_mut(), &self.evm) {
            if let Some(address) = &overrides.router_address {
                evm.router_address = Some(address.clone());
            }
            if let Some(bytecode) = &overrides.router_bytecode {
                evm.router_bytecode = Some(bytecode.clone());
            }
            if let Some(address) = &overrides.token_address {
                evm.token_address = Some(address.clone());
            }
            if let Some(bytecode) = &overrides.token_bytecode {
                evm.token_bytecode = Some(bytecode.clone());
            }
        }

        if let (Some(utxo), Some(overrides)) = (config.utxo.as_mut(), &self.utxo) {
            if let Some(user) = &overrides.rpc_user {
                utxo.rpc_user = user.clone();
            }
            if let Some(password) = &overrides.rpc_password {
                utxo.rpc_password = password.clone();
            }
            if let Some(rate) = overrides.fee_rate {
                utxo.fee_rate = rate;
            }
            if let Some(interval) = overrides.block_interval_ms {
                utxo.block_interval_ms = interval;
            }
        }

        config
    }
}

/**
   The declarative description of a chain taking part in a test.
*/
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSpec {
    /// Logical name of the chain inside the interchain.
    pub name: String,

    /// Builtin template to start from. Defaults to `name`.
    #[serde(default)]
    pub chain_name: Option<String>,

    /// Driver family. Defaults to the family of the builtin template.
    #[serde(default)]
    pub family: Option<ChainFamily>,

    /// Version of the node image.
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub num_validators: Option<usize>,

    #[serde(default)]
    pub num_full_nodes: Option<usize>,

    #[serde(default)]
    pub config: ChainConfigOverrides,
}

impl ChainSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn template_name(&self) -> &str {
        self.chain_name.as_deref().unwrap_or(&self.name)
    }

    pub fn with_chain_name(mut self, chain_name: impl Into<String>) -> Self {
        self.chain_name = Some(chain_name.into());
        self
    }

    pub fn with_family(mut self, family: ChainFamily) -> Self {
        self.family = Some(family);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_validators(mut self, count: usize) -> Self {
        self.num_validators = Some(count);
        self
    }

    pub fn with_full_nodes(mut self, count: usize) -> Self {
        self.num_full_nodes = Some(count);
        self
    }

    pub fn with_config(mut self, config: ChainConfigOverrides) -> Self {
        self.config = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builtin::builtin_config;

    #[test]
    fn overrides_do_not_touch_the_template() {
        let base = builtin_config("gaia").unwrap();

        let overrides = ChainConfigOverrides {
            bech32_prefix: Some("osmo".to_string()),
            gas_adjustment: Some(2.0),
            genesis_overrides: BTreeMap::from([(
                "app_state.staking.params.unbonding_time".to_string(),
                serde_json::json!("60s"),
            )]),
            ..Default::default()
        };

        let merged = overrides.apply(&base);

        assert_eq!(merged.bech32_prefix, "osmo");
        assert_eq!(merged.gas_adjustment, 2.0);
        assert_eq!(merged.denom, base.denom);
        assert_eq!(base.bech32_prefix, "cosmos");
        assert!(base.genesis_overrides.is_empty());
        assert_eq!(merged.genesis_overrides.len(), 1);
    }

    #[test]
    fn chain_specs_deserialize_from_toml() {
        let spec: ChainSpec = toml::from_str(
            r#"
            name = "btc"
            chain_name = "bitcoin"
            version = "26.1"
            num_validators = 1

            [config.utxo]
            rpc_user = "thorchain"
            rpc_password = "password"
            "#,
        )
        .unwrap();

        assert_eq!(spec.template_name(), "bitcoin");
        assert_eq!(
            spec.config.utxo.unwrap().rpc_user.as_deref(),
            Some("thorchain")
        );
    }
}
