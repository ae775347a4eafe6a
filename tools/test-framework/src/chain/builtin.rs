/*!
   Builtin chain templates, keyed by chain name.
*/

use std::collections::BTreeMap;

use super::chain_type::ChainFamily;
use super::spec::{ChainConfig, ChainSpec, EvmConfig, IcsRole, UtxoConfig, UtxoOverrides};
use crate::docker::ImageRef;
use crate::types::token::Amount;

const HEIGHLINER: &str = "ghcr.io/strangelove-ventures/heighliner";

/// First pre-funded account of the anvil dev node.
pub const ANVIL_FAUCET_PRIVATE_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_TX_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 30;

pub fn builtin_names() -> &'static [&'static str] {
    &[
        "gaia",
        "ics-provider",
        "ics-consumer",
        "thorchain",
        "bitcoin",
        "bitcoincash",
        "litecoin",
        "dogecoin",
        "ethereum",
        "mock",
    ]
}

pub fn builtin_config(chain_name: &str) -> Option<ChainConfig> {
    let config = match chain_name {
        "gaia" => cosmos_base("gaia", ImageRef::new(format!("{HEIGHLINER}/gaia"), "v14.1.0"), "gaiad"),
        "ics-provider" => ChainConfig {
            ics_role: Some(IcsRole::Provider),
            home_dir: "/var/cosmos-chain/provider".to_string(),
            voting_period: "10s".to_string(),
            ..cosmos_base(
                "ics-provider",
                ImageRef::new(format!("{HEIGHLINER}/ics"), "v3.1.0"),
                "interchain-security-pd",
            )
        },
        "ics-consumer" => ChainConfig {
            ics_role: Some(IcsRole::Consumer),
            home_dir: "/var/cosmos-chain/consumer".to_string(),
            denom: "stake".to_string(),
            ..cosmos_base(
                "ics-consumer",
                ImageRef::new(format!("{HEIGHLINER}/ics"), "v3.1.0"),
                "interchain-security-cd",
            )
        },
        "thorchain" => ChainConfig {
            family: ChainFamily::Thorchain,
            chain_id_template: "thorchain".to_string(),
            images: vec![
                ImageRef::new("registry.gitlab.com/thorchain/thornode", "mocknet"),
                ImageRef::new("registry.gitlab.com/thorchain/thornode", "mocknet"),
            ],
            home_dir: "/var/data/thornode".to_string(),
            bech32_prefix: "tthor".to_string(),
            denom: "rune".to_string(),
            decimals: 8,
            gas_prices: "0".to_string(),
            num_validators: 1,
            coin_type: 931,
            faucet_amount: Amount(100_000_000_000_000_000),
            validator_stake: Amount(1_000_000_000_000),
            ..cosmos_base(
                "thorchain",
                ImageRef::new("registry.gitlab.com/thorchain/thornode", "mocknet"),
                "thornode",
            )
        },
        "bitcoin" => utxo_base(
            "bitcoin",
            ChainFamily::Bitcoin,
            ImageRef::new("ruimarinho/bitcoin-core", "24.0.1"),
            "BTC",
            UtxoConfig {
                rpc_port: 18443,
                fee_rate: Amount(10),
                dust_limit: Amount(546),
                segwit: true,
                ..default_utxo()
            },
        ),
        "bitcoincash" => utxo_base(
            "bitcoincash",
            ChainFamily::BitcoinCash,
            ImageRef::new("zquestz/bitcoin-cash-node", "26.1.0"),
            "BCH",
            UtxoConfig {
                rpc_port: 18443,
                fee_rate: Amount(2),
                dust_limit: Amount(546),
                segwit: false,
                ..default_utxo()
            },
        ),
        "litecoin" => utxo_base(
            "litecoin",
            ChainFamily::Litecoin,
            ImageRef::new("uphold/litecoin-core", "0.21.2"),
            "LTC",
            UtxoConfig {
                rpc_port: 19443,
                fee_rate: Amount(10),
                dust_limit: Amount(546),
                segwit: true,
                ..default_utxo()
            },
        ),
        "dogecoin" => utxo_base(
            "dogecoin",
            ChainFamily::Dogecoin,
            ImageRef::new("registry.gitlab.com/thorchain/devops/dogecoin-core", "1.14.6"),
            "DOGE",
            UtxoConfig {
                rpc_port: 18332,
                fee_rate: Amount(1_000),
                dust_limit: Amount(1_000_000),
                segwit: false,
                ..default_utxo()
            },
        ),
        "ethereum" => ChainConfig {
            name: "ethereum".to_string(),
            chain_name: "ethereum".to_string(),
            family: ChainFamily::Ethereum,
            chain_id_template: "{name}-{n}".to_string(),
            chain_id: String::new(),
            images: vec![ImageRef::new("ghcr.io/foundry-rs/foundry", "nightly")],
            binary: "anvil".to_string(),
            home_dir: "/home/foundry".to_string(),
            bech32_prefix: String::new(),
            denom: "wei".to_string(),
            decimals: 18,
            gas_prices: "1000000000".to_string(),
            gas_adjustment: 1.0,
            trusting_period: String::new(),
            num_validators: 1,
            num_full_nodes: 0,
            block_time_ms: 1_000,
            voting_period: String::new(),
            faucet_amount: Amount(10_000_000_000_000_000_000_000),
            validator_stake: Amount::ZERO,
            genesis_overrides: BTreeMap::new(),
            ics_role: None,
            coin_type: 60,
            faucet_mnemonic: None,
            evm: Some(EvmConfig {
                evm_chain_id: 31337,
                router_address: None,
                router_bytecode: None,
                token_address: None,
                token_bytecode: None,
                faucet_private_key: ANVIL_FAUCET_PRIVATE_KEY.to_string(),
            }),
            utxo: None,
            readiness_timeout_secs: DEFAULT_READINESS_TIMEOUT_SECS,
            tx_timeout_secs: DEFAULT_TX_TIMEOUT_SECS,
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
        },
        "mock" => ChainConfig {
            family: ChainFamily::Mock,
            images: vec![ImageRef::new("mock/chain", "latest")],
            bech32_prefix: "mock".to_string(),
            denom: "umock".to_string(),
            num_validators: 1,
            faucet_amount: Amount(1_000_000_000_000_000),
            readiness_timeout_secs: 10,
            ..cosmos_base("mock", ImageRef::new("mock/chain", "latest"), "mockd")
        },
        _ => return None,
    };

    Some(config)
}

fn cosmos_base(chain_name: &str, image: ImageRef, binary: &str) -> ChainConfig {
    ChainConfig {
        name: chain_name.to_string(),
        chain_name: chain_name.to_string(),
        family: ChainFamily::Cosmos,
        chain_id_template: "{name}-{n}".to_string(),
        chain_id: String::new(),
        images: vec![image],
        binary: binary.to_string(),
        home_dir: format!("/var/cosmos-chain/{chain_name}"),
        bech32_prefix: "cosmos".to_string(),
        denom: "uatom".to_string(),
        decimals: 6,
        gas_prices: "0.01".to_string(),
        gas_adjustment: 1.3,
        trusting_period: "336h".to_string(),
        num_validators: 2,
        num_full_nodes: 0,
        block_time_ms: 2_000,
        voting_period: "15s".to_string(),
        faucet_amount: Amount(10_000_000_000_000),
        validator_stake: Amount(5_000_000_000_000),
        genesis_overrides: BTreeMap::new(),
        ics_role: None,
        coin_type: 118,
        faucet_mnemonic: None,
        evm: None,
        utxo: None,
        readiness_timeout_secs: DEFAULT_READINESS_TIMEOUT_SECS,
        tx_timeout_secs: DEFAULT_TX_TIMEOUT_SECS,
        stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
    }
}

fn default_utxo() -> UtxoConfig {
    UtxoConfig {
        rpc_user: "user".to_string(),
        rpc_password: "password".to_string(),
        rpc_port: 18443,
        fee_rate: Amount(10),
        dust_limit: Amount(546),
        block_interval_ms: 1_000,
        maturity_blocks: 101,
        segwit: true,
    }
}

fn utxo_base(
    chain_name: &str,
    family: ChainFamily,
    image: ImageRef,
    denom: &str,
    utxo: UtxoConfig,
) -> ChainConfig {
    ChainConfig {
        family,
        chain_id_template: "{name}".to_string(),
        home_dir: "/home/bitcoin".to_string(),
        bech32_prefix: String::new(),
        denom: denom.to_string(),
        decimals: 8,
        gas_prices: "0".to_string(),
        num_validators: 1,
        block_time_ms: utxo.block_interval_ms,
        faucet_amount: Amount::ZERO,
        validator_stake: Amount::ZERO,
        coin_type: 1,
        utxo: Some(utxo),
        ..cosmos_base(chain_name, image, "")
    }
}

/**
   A ready-made descriptor for a UTXO chain with the given RPC
   credentials. `chain_name` selects the flavor (`bitcoin`,
   `bitcoincash`, `litecoin` or `dogecoin`).
*/
pub fn default_utxo_chain_spec(
    name: &str,
    chain_name: &str,
    rpc_user: &str,
    rpc_password: &str,
) -> ChainSpec {
    let mut spec = ChainSpec::new(name).with_chain_name(chain_name);

    spec.config.utxo = Some(UtxoOverrides {
        rpc_user: Some(rpc_user.to_string()),
        rpc_password: Some(rpc_password.to_string()),
        ..Default::default()
    });

    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_resolves() {
        for name in builtin_names() {
            let config = builtin_config(name).unwrap();
            assert_eq!(&config.chain_name, name);
            assert!(config.node_image().is_some());
        }

        assert!(builtin_config("solana").is_none());
    }

    #[test]
    fn utxo_templates_carry_rpc_settings() {
        let doge = builtin_config("dogecoin").unwrap();
        assert_eq!(doge.family, ChainFamily::Dogecoin);
        assert!(!doge.utxo.as_ref().unwrap().segwit);

        let spec = default_utxo_chain_spec("btc", "bitcoin", "thorchain", "password");
        let merged = spec.config.apply(&builtin_config("bitcoin").unwrap());
        assert_eq!(merged.utxo.unwrap().rpc_user, "thorchain");
    }
}
