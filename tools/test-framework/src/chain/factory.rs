/*!
   Resolution of chain descriptors into chain drivers.
*/

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::builtin::builtin_config;
use super::chain_type::ChainFamily;
use super::cosmos::CosmosChain;
use super::evm::EvmChain;
use super::mock::MockChain;
use super::spec::{ChainConfig, ChainSpec};
use super::thorchain::ThorchainChain;
use super::traits::Chain;
use super::utxo::UtxoChain;
use crate::error::Error;

/**
   Turns a list of [`ChainSpec`]s into driver instances.

   Resolution is pure: two factories built from the same specs produce
   equivalent configurations, differing only in the containers created
   later.
*/
pub struct ChainFactory {
    specs: Vec<ChainSpec>,
}

impl ChainFactory {
    pub fn new(specs: impl IntoIterator<Item = ChainSpec>) -> Self {
        Self {
            specs: specs.into_iter().collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.specs.len()
    }

    /// The merged configurations, in spec order.
    pub fn configs(&self) -> Result<Vec<ChainConfig>, Error> {
        let mut ordinals: BTreeMap<String, usize> = BTreeMap::new();

        self.specs
            .iter()
            .map(|spec| {
                let ordinal = ordinals.entry(spec.name.clone()).or_insert(0);
                *ordinal += 1;
                resolve_config(spec, *ordinal)
            })
            .collect()
    }

    /// Build one driver per spec, in spec order.
    pub fn chains(&self, test_name: &str) -> Result<Vec<Arc<dyn Chain>>, Error> {
        let chains = self
            .configs()?
            .into_iter()
            .map(new_chain)
            .collect::<Vec<_>>();

        debug!(
            "test {} resolved chains {:?}",
            test_name,
            chains.iter().map(|c| c.chain_id().to_string()).collect::<Vec<_>>()
        );

        Ok(chains)
    }
}

/// Instantiate the driver matching the family of `config`.
pub fn new_chain(config: ChainConfig) -> Arc<dyn Chain> {
    match config.family {
        ChainFamily::Cosmos => Arc::new(CosmosChain::new(config)),
        ChainFamily::Thorchain => Arc::new(ThorchainChain::new(config)),
        ChainFamily::Ethereum => Arc::new(EvmChain::new(config)),
        ChainFamily::Bitcoin
        | ChainFamily::BitcoinCash
        | ChainFamily::Litecoin
        | ChainFamily::Dogecoin => Arc::new(UtxoChain::new(config)),
        ChainFamily::Mock => Arc::new(MockChain::new(config)),
    }
}

/**
   Merge a spec onto its builtin template. `ordinal` counts specs with
   the same name, starting at 1, and fills the `{n}` placeholder of the
   chain-id template.
*/
pub fn resolve_config(spec: &ChainSpec, ordinal: usize) -> Result<ChainConfig, Error> {
    let template = builtin_config(spec.template_name());

    let base = match (template, spec.family) {
        (Some(base), _) => base,
        (None, Some(family)) => family_template(family).ok_or_else(|| {
            Error::unknown_family(spec.template_name().to_string())
        })?,
        (None, None) => return Err(Error::unknown_family(spec.template_name().to_string())),
    };

    let mut config = spec.config.apply(&base);
    config.name = spec.name.clone();

    if let Some(family) = spec.family {
        config.family = family;
    }

    if let Some(version) = &spec.version {
        match config.images.first_mut() {
            Some(image) => image.version = version.clone(),
            None => {
                return Err(Error::image_unavailable(
                    spec.name.clone(),
                    "no image to apply the version to".to_string(),
                ))
            }
        }
    }

    if let Some(validators) = spec.num_validators {
        config.num_validators = validators;
    }

    if let Some(full_nodes) = spec.num_full_nodes {
        config.num_full_nodes = full_nodes;
    }

    validate_config(&config)?;

    config.chain_id = render_chain_id(&config.chain_id_template, &spec.name, ordinal);

    Ok(config)
}

/// The template used for a family when the chain name is not a builtin.
fn family_template(family: ChainFamily) -> Option<ChainConfig> {
    let name = match family {
        ChainFamily::Cosmos => "gaia",
        ChainFamily::Thorchain => "thorchain",
        ChainFamily::Ethereum => "ethereum",
        ChainFamily::Bitcoin => "bitcoin",
        ChainFamily::BitcoinCash => "bitcoincash",
        ChainFamily::Litecoin => "litecoin",
        ChainFamily::Dogecoin => "dogecoin",
        ChainFamily::Mock => "mock",
    };

    builtin_config(name)
}

fn validate_config(config: &ChainConfig) -> Result<(), Error> {
    if config.name.is_empty() {
        return Err(Error::config_invalid("chain name must not be empty".to_string()));
    }

    let image = config.node_image().ok_or_else(|| {
        Error::image_unavailable(config.name.clone(), "no node image configured".to_string())
    })?;

    if image.repository.is_empty() || image.version.is_empty() {
        return Err(Error::image_unavailable(
            image.to_string(),
            format!("chain {} needs both an image repository and a version", config.name),
        ));
    }

    if config.num_validators == 0 {
        return Err(Error::config_invalid(format!(
            "chain {} needs at least one validator",
            config.name
        )));
    }

    if config.family.is_utxo() && config.utxo.is_none() {
        return Err(Error::config_invalid(format!(
            "utxo chain {} has no rpc settings",
            config.name
        )));
    }

    if config.family == ChainFamily::Ethereum && config.evm.is_none() {
        return Err(Error::config_invalid(format!(
            "evm chain {} has no evm settings",
            config.name
        )));
    }

    if config.gas_adjustment <= 0.0 {
        return Err(Error::config_invalid(format!(
            "gas adjustment of chain {} must be positive",
            config.name
        )));
    }

    Ok(())
}

pub fn render_chain_id(template: &str, name: &str, ordinal: usize) -> String {
    template
        .replace("{name}", name)
        .replace("{n}", &ordinal.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::spec::{ChainConfigOverrides, IcsRole};
    use crate::docker::ImageRef;
    use crate::error::{ErrorDetail, ErrorKind};

    #[test]
    fn chain_ids_count_equal_names() {
        let factory = ChainFactory::new([
            ChainSpec::new("gaia"),
            ChainSpec::new("gaia"),
            ChainSpec::new("ethereum"),
            ChainSpec::new("btc").with_chain_name("bitcoin"),
        ]);

        let ids: Vec<String> = factory
            .configs()
            .unwrap()
            .into_iter()
            .map(|c| c.chain_id)
            .collect();

        assert_eq!(ids, vec!["gaia-1", "gaia-2", "ethereum-1", "btc"]);
    }

    #[test]
    fn resolution_is_repeatable() {
        let specs = vec![
            ChainSpec::new("provider").with_chain_name("ics-provider"),
            ChainSpec::new("consumer")
                .with_chain_name("ics-consumer")
                .with_version("v3.2.0")
                .with_validators(1),
        ];

        let first = ChainFactory::new(specs.clone()).configs().unwrap();
        let second = ChainFactory::new(specs).configs().unwrap();

        assert_eq!(first, second);
        assert_eq!(first[1].images[0].version, "v3.2.0");
        assert_eq!(first[1].num_validators, 1);
        assert_eq!(first[1].ics_role, Some(IcsRole::Consumer));
    }

    #[test]
    fn unknown_chains_need_a_family() {
        let err = ChainFactory::new([ChainSpec::new("solana")])
            .configs()
            .unwrap_err();

        match err.detail() {
            ErrorDetail::UnknownFamily(e) => assert_eq!(e.chain_name, "solana"),
            e => panic!("unexpected error {e:?}"),
        }

        let config = resolve_config(
            &ChainSpec::new("osmosis").with_family(ChainFamily::Cosmos),
            1,
        )
        .unwrap();
        assert_eq!(config.chain_id, "osmosis-1");
    }

    #[test]
    fn missing_image_versions_are_rejected() {
        let spec = ChainSpec::new("gaia").with_config(ChainConfigOverrides {
            images: Some(vec![ImageRef::new("ghcr.io/example/gaia", "")]),
            ..Default::default()
        });

        let Err(err) = ChainFactory::new([spec]).chains("factory") else {
            panic!("a chain image without a version was accepted");
        };
        assert_eq!(err.kind(), ErrorKind::ImageUnavailable);
    }

    #[test]
    fn drivers_match_families() {
        let chains = ChainFactory::new([
            ChainSpec::new("thorchain"),
            ChainSpec::new("doge").with_chain_name("dogecoin"),
            ChainSpec::new("mock"),
        ])
        .chains("factory")
        .unwrap();

        assert!(chains[0].as_thorchain().is_some());
        assert_eq!(chains[1].family(), ChainFamily::Dogecoin);
        assert!(chains[1].capabilities().memo_transfers);
        assert_eq!(chains[2].chain_id(), "mock-1");
    }
}
