/*!
   Static checks of an interchain topology, run before any container
   is created.
*/

use std::collections::{BTreeMap, BTreeSet};

use super::Interchain;
use crate::error::Error;

/**
   Check the topology and return the indices of the provider-consumer
   links in the order their consumers must be started: a consumer that
   is itself a provider comes before its own consumers.
*/
pub fn validate(interchain: &Interchain) -> Result<Vec<usize>, Error> {
    if !interchain.problems.is_empty() {
        return Err(Error::config_invalid(interchain.problems.join("; ")));
    }

    if interchain.chains.is_empty() {
        return Err(Error::config_invalid("interchain has no chains".to_string()));
    }

    let mut chain_ids = BTreeSet::new();
    for chain in &interchain.chains {
        if !chain_ids.insert(chain.chain_id()) {
            return Err(Error::config_invalid(format!(
                "chain-id {} is used by more than one chain",
                chain.chain_id()
            )));
        }
    }

    let mut paths = BTreeSet::new();
    let relayer_paths = interchain
        .links
        .iter()
        .map(|l| (l.relayer.as_str(), l.path.as_str()))
        .chain(
            interchain
                .ics_links
                .iter()
                .map(|l| (l.relayer.as_str(), l.path.as_str())),
        );

    for (relayer, path) in relayer_paths {
        if !paths.insert((relayer, path)) {
            return Err(Error::config_invalid(format!(
                "relayer {relayer} has more than one path named {path}"
            )));
        }
    }

    for link in &interchain.links {
        if link.chain_a == link.chain_b {
            return Err(Error::config_invalid(format!(
                "path {} links chain {} to itself",
                link.path, link.chain_a
            )));
        }

        for name in [&link.chain_a, &link.chain_b] {
            require_ibc(interchain, name)?;
        }
    }

    let mut providers: BTreeMap<&str, &str> = BTreeMap::new();

    for link in &interchain.ics_links {
        if let Some(existing) = providers.insert(&link.consumer, &link.provider) {
            return Err(Error::config_invalid(format!(
                "consumer {} has two providers: {} and {}",
                link.consumer, existing, link.provider
            )));
        }

        let provider = interchain.require_chain(&link.provider)?;
        if !provider.capabilities().ics_provider {
            return Err(Error::unsupported_capability(
                provider.chain_id().to_string(),
                "interchain security provider".to_string(),
            ));
        }

        let consumer = interchain.require_chain(&link.consumer)?;
        if !consumer.capabilities().ics_consumer {
            return Err(Error::unsupported_capability(
                consumer.chain_id().to_string(),
                "interchain security consumer".to_string(),
            ));
        }
    }

    consumer_order(interchain, &providers)
}

fn require_ibc(interchain: &Interchain, name: &str) -> Result<(), Error> {
    let chain = interchain.require_chain(name)?;

    if chain.capabilities().ibc {
        Ok(())
    } else {
        Err(Error::unsupported_capability(
            chain.chain_id().to_string(),
            "ibc".to_string(),
        ))
    }
}

fn consumer_order(
    interchain: &Interchain,
    providers: &BTreeMap<&str, &str>,
) -> Result<Vec<usize>, Error> {
    let mut started = BTreeSet::new();
    let mut order = Vec::new();
    let mut remaining: Vec<usize> = (0..interchain.ics_links.len()).collect();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<usize>, Vec<usize>) = remaining.into_iter().partition(|i| {
            let provider = interchain.ics_links[*i].provider.as_str();
            !providers.contains_key(provider) || started.contains(provider)
        });

        if ready.is_empty() {
            let cycle: Vec<&str> = blocked
                .iter()
                .map(|i| interchain.ics_links[*i].consumer.as_str())
                .collect();

            return Err(Error::config_invalid(format!(
                "provider-consumer links form a cycle between {}",
                cycle.join(", ")
            )));
        }

        for i in ready {
            started.insert(interchain.ics_links[i].consumer.as_str());
            order.push(i);
        }

        remaining = blocked;
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builtin::builtin_config;
    use crate::chain::mock::MockChain;
    use crate::chain::spec::IcsRole;
    use crate::chain::Chain;
    use crate::error::ErrorKind;
    use crate::interchain::{InterchainLink, ProviderConsumerLink};
    use crate::relayer::{RelayerDriver, RelayerKind};
    use std::sync::Arc;

    fn chain(name: &str, role: Option<IcsRole>) -> Arc<dyn Chain> {
        let mut config = builtin_config("mock").unwrap();
        config.name = name.to_string();
        config.chain_id = format!("{name}-1");
        config.ics_role = role;
        Arc::new(MockChain::new(config))
    }

    fn relayer(name: &str) -> Arc<RelayerDriver> {
        Arc::new(RelayerDriver::from_kind(name, RelayerKind::Mock))
    }

    #[test]
    fn members_must_be_added_before_links() {
        let interchain = Interchain::new()
            .add_chain(chain("a", None))
            .add_relayer(relayer("r"))
            .add_link(InterchainLink::new("ab", "a", "b", "r"))
            .add_chain(chain("b", None));

        let err = validate(&interchain).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(err.to_string().contains("chain b"));
    }

    #[test]
    fn duplicate_names_and_paths_are_rejected() {
        let duplicate_chain = Interchain::new()
            .add_chain(chain("a", None))
            .add_chain(chain("a", None));
        assert!(validate(&duplicate_chain).is_err());

        let duplicate_path = Interchain::new()
            .add_chain(chain("a", None))
            .add_chain(chain("b", None))
            .add_chain(chain("c", None))
            .add_relayer(relayer("r"))
            .add_link(InterchainLink::new("p", "a", "b", "r"))
            .add_link(InterchainLink::new("p", "b", "c", "r"));

        let err = validate(&duplicate_path).unwrap_err();
        assert!(err.to_string().contains("more than one path named p"));

        let other_relayer = Interchain::new()
            .add_chain(chain("a", None))
            .add_chain(chain("b", None))
            .add_chain(chain("c", None))
            .add_relayer(relayer("r"))
            .add_relayer(relayer("s"))
            .add_link(InterchainLink::new("p", "a", "b", "r"))
            .add_link(InterchainLink::new("p", "b", "c", "s"));

        assert!(validate(&other_relayer).is_ok());
    }

    #[test]
    fn independent_consumers_keep_declaration_order() {
        let interchain = Interchain::new()
            .add_chain(chain("hub", Some(IcsRole::Provider)))
            .add_chain(chain("mid", Some(IcsRole::Provider)))
            .add_chain(chain("leaf", Some(IcsRole::Consumer)))
            .add_chain(chain("side", Some(IcsRole::Consumer)))
            .add_relayer(relayer("r"))
            .add_provider_consumer_link(ProviderConsumerLink::new("mid", "leaf", "r", "mid-leaf"))
            .add_provider_consumer_link(ProviderConsumerLink::new("hub", "side", "r", "hub-side"));

        assert_eq!(validate(&interchain).unwrap(), vec![0, 1]);
    }

    #[test]
    fn nested_consumers_start_after_their_provider() {
        let providers = BTreeMap::from([("leaf", "mid"), ("mid", "hub")]);
        let interchain = Interchain::new()
            .add_chain(chain("hub", Some(IcsRole::Provider)))
            .add_chain(chain("mid", Some(IcsRole::Provider)))
            .add_chain(chain("leaf", Some(IcsRole::Consumer)))
            .add_relayer(relayer("r"))
            .add_provider_consumer_link(ProviderConsumerLink::new("mid", "leaf", "r", "mid-leaf"))
            .add_provider_consumer_link(ProviderConsumerLink::new("hub", "mid", "r", "hub-mid"));

        assert_eq!(consumer_order(&interchain, &providers).unwrap(), vec![1, 0]);
    }

    #[test]
    fn provider_cycles_and_second_providers_are_rejected() {
        let mut config = builtin_config("mock").unwrap();
        config.name = "x".to_string();
        config.chain_id = "x-1".to_string();
        config.ics_role = Some(IcsRole::Consumer);

        let both: Arc<dyn Chain> = Arc::new(MockChain::new(config));

        let two_providers = Interchain::new()
            .add_chain(chain("p1", Some(IcsRole::Provider)))
            .add_chain(chain("p2", Some(IcsRole::Provider)))
            .add_chain(chain("c", Some(IcsRole::Consumer)))
            .add_relayer(relayer("r"))
            .add_provider_consumer_link(ProviderConsumerLink::new("p1", "c", "r", "one"))
            .add_provider_consumer_link(ProviderConsumerLink::new("p2", "c", "r", "two"));

        let err = validate(&two_providers).unwrap_err();
        assert!(err.to_string().contains("two providers"));

        let not_a_provider = Interchain::new()
            .add_chain(both)
            .add_chain(chain("c", Some(IcsRole::Consumer)))
            .add_relayer(relayer("r"))
            .add_provider_consumer_link(ProviderConsumerLink::new("x", "c", "r", "xc"));

        assert_eq!(
            validate(&not_a_provider).unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );
    }

    #[test]
    fn self_provision_is_a_cycle() {
        let providers = BTreeMap::from([("a", "a")]);
        let interchain = Interchain::new()
            .add_chain(chain("a", Some(IcsRole::Provider)))
            .add_relayer(relayer("r"))
            .add_provider_consumer_link(ProviderConsumerLink::new("a", "a", "r", "aa"));

        let err = consumer_order(&interchain, &providers).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }
}
