/*!
    Helper functions for modifying the node config in TOML and the
    genesis file in JSON.

    Since we do not need to understand the full structure of the
    CosmosSDK config, we are updating the config as dynamic TOML
    values instead of serializing them into proper types.
*/

use core::time::Duration;
use eyre::eyre;
use toml::Value;

use crate::error::Error;

fn section<'a>(config: &'a mut Value, name: &str) -> Result<&'a mut toml::value::Table, Error> {
    Ok(config
        .get_mut(name)
        .ok_or_else(|| eyre!("expect {} section", name))?
        .as_table_mut()
        .ok_or_else(|| eyre!("expect object"))?)
}

/// Set the `rpc` field in the full node config.
pub fn set_rpc_port(config: &mut Value, port: u16) -> Result<(), Error> {
    section(config, "rpc")?.insert("laddr".to_string(), format!("tcp://0.0.0.0:{port}").into());

    Ok(())
}

/// Set the `p2p` field in the full node config.
pub fn set_p2p_port(config: &mut Value, port: u16) -> Result<(), Error> {
    section(config, "p2p")?.insert("laddr".to_string(), format!("tcp://0.0.0.0:{port}").into());

    Ok(())
}

pub fn set_persistent_peers(config: &mut Value, peers: &str) -> Result<(), Error> {
    let p2p = section(config, "p2p")?;
    p2p.insert("persistent_peers".to_string(), peers.into());
    p2p.insert("allow_duplicate_ip".to_string(), true.into());
    p2p.insert("addr_book_strict".to_string(), false.into());

    Ok(())
}

/// Set the `consensus.timeout_commit` field in the full node config.
pub fn set_timeout_commit(config: &mut Value, duration: Duration) -> Result<(), Error> {
    section(config, "consensus")?.insert(
        "timeout_commit".to_string(),
        format!("{}ms", duration.as_millis()).into(),
    );

    Ok(())
}

/// Set the `consensus.timeout_propose` field in the full node config.
pub fn set_timeout_propose(config: &mut Value, duration: Duration) -> Result<(), Error> {
    section(config, "consensus")?.insert(
        "timeout_propose".to_string(),
        format!("{}ms", duration.as_millis()).into(),
    );

    Ok(())
}

pub fn set_grpc_port(config: &mut Value, port: u16) -> Result<(), Error> {
    section(config, "grpc")?.insert("address".to_string(), format!("0.0.0.0:{port}").into());

    Ok(())
}

pub fn enable_api(config: &mut Value, port: u16) -> Result<(), Error> {
    if config.get("api").is_some() {
        let api = section(config, "api")?;
        api.insert("enable".to_string(), true.into());
        api.insert("address".to_string(), format!("tcp://0.0.0.0:{port}").into());
    }

    Ok(())
}

pub fn set_minimum_gas_price(config: &mut Value, price: &str) -> Result<(), Error> {
    config
        .as_table_mut()
        .ok_or_else(|| eyre!("expect object"))?
        .insert("minimum-gas-prices".to_string(), price.into());

    Ok(())
}

/**
   Set the governance voting period. The field moved between SDK
   versions, so every known location that exists is updated.
*/
pub fn set_voting_period(genesis: &mut serde_json::Value, period: &str) -> Result<(), Error> {
    let gov = genesis
        .get_mut("app_state")
        .and_then(|app_state| app_state.get_mut("gov"))
        .ok_or_else(|| eyre!("failed to update voting_period in genesis file"))?;

    let mut updated = false;

    for params in ["voting_params", "params"] {
        if let Some(params) = gov.get_mut(params).and_then(|p| p.as_object_mut()) {
            params.insert(
                "voting_period".to_owned(),
                serde_json::Value::String(period.to_string()),
            );
            updated = true;
        }
    }

    if updated {
        Ok(())
    } else {
        Err(Error::generic(eyre!(
            "failed to update voting_period in genesis file"
        )))
    }
}

pub fn set_max_deposit_period(genesis: &mut serde_json::Value, period: &str) -> Result<(), Error> {
    let gov = genesis
        .get_mut("app_state")
        .and_then(|app_state| app_state.get_mut("gov"))
        .ok_or_else(|| eyre!("failed to update max_deposit_period in genesis file"))?;

    for params in ["deposit_params", "params"] {
        if let Some(params) = gov.get_mut(params).and_then(|p| p.as_object_mut()) {
            params.insert(
                "max_deposit_period".to_owned(),
                serde_json::Value::String(period.to_string()),
            );
        }
    }

    Ok(())
}

/**
   Replace the SDK default `stake` denom in every denom field of the
   genesis (staking, mint, gov deposits, crisis fee) with `denom`.
*/
pub fn set_staking_denom(genesis: &mut serde_json::Value, denom: &str) {
    match genesis {
        serde_json::Value::Object(object) => {
            for (key, value) in object.iter_mut() {
                let is_denom_field = matches!(key.as_str(), "denom" | "bond_denom" | "mint_denom");

                if is_denom_field && value.as_str() == Some("stake") {
                    *value = serde_json::Value::String(denom.to_string());
                } else {
                    set_staking_denom(value, denom);
                }
            }
        }
        serde_json::Value::Array(values) => {
            for value in values {
                set_staking_denom(value, denom);
            }
        }
        _ => {}
    }
}

/**
   Set the value at a dotted path such as `app_state.staking.params.bond_denom`,
   creating intermediate objects as needed.
*/
pub fn set_json_path(
    genesis: &mut serde_json::Value,
    path: &str,
    value: serde_json::Value,
) -> Result<(), Error> {
    let mut current = genesis;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let object = current
            .as_object_mut()
            .ok_or_else(|| eyre!("genesis path {} crosses a non-object at {}", path, segment))?;

        if segments.peek().is_none() {
            object.insert(segment.to_string(), value);
            return Ok(());
        }

        current = object
            .entry(segment.to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
    }

    Err(Error::generic(eyre!("empty genesis path")))
}
