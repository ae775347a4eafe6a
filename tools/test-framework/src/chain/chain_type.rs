use core::fmt::{self, Display};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::Error;

const COSMOS_HD_PATH: &str = "m/44'/118'/0'/0/0";
const THORCHAIN_HD_PATH: &str = "m/44'/931'/0'/0/0";
const ETHEREUM_HD_PATH: &str = "m/44'/60'/0'/0/0";

/**
   The family of a chain, which selects the driver used to run it.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Cosmos,
    Thorchain,
    Ethereum,
    Bitcoin,
    BitcoinCash,
    Litecoin,
    Dogecoin,
    /// In-memory chain without any node process.
    Mock,
}

impl ChainFamily {
    pub fn hd_path(&self) -> &str {
        match self {
            Self::Cosmos | Self::Mock => COSMOS_HD_PATH,
            Self::Thorchain => THORCHAIN_HD_PATH,
            Self::Ethereum => ETHEREUM_HD_PATH,
            Self::Bitcoin => "m/84'/1'/0'/0/0",
            Self::BitcoinCash => "m/44'/1'/0'/0/0",
            Self::Litecoin => "m/84'/1'/0'/0/0",
            Self::Dogecoin => "m/44'/1'/0'/0/0",
        }
    }

    pub fn is_utxo(&self) -> bool {
        matches!(
            self,
            Self::Bitcoin | Self::BitcoinCash | Self::Litecoin | Self::Dogecoin
        )
    }

    pub fn is_cosmos_based(&self) -> bool {
        matches!(self, Self::Cosmos | Self::Thorchain)
    }

    /// Largest memo the family can carry in a transfer, if bounded.
    pub fn max_memo_len(&self) -> Option<usize> {
        if self.is_utxo() {
            Some(80)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosmos => "cosmos",
            Self::Thorchain => "thorchain",
            Self::Ethereum => "ethereum",
            Self::Bitcoin => "bitcoin",
            Self::BitcoinCash => "bitcoincash",
            Self::Litecoin => "litecoin",
            Self::Dogecoin => "dogecoin",
            Self::Mock => "mock",
        }
    }
}

impl Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChainFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cosmos" | "gaia" => Ok(Self::Cosmos),
            "thorchain" => Ok(Self::Thorchain),
            "ethereum" | "evm" => Ok(Self::Ethereum),
            "bitcoin" | "utxo" => Ok(Self::Bitcoin),
            "bitcoincash" => Ok(Self::BitcoinCash),
            "litecoin" => Ok(Self::Litecoin),
            "dogecoin" => Ok(Self::Dogecoin),
            "mock" => Ok(Self::Mock),
            _ => Err(Error::unknown_family(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_family_names() {
        assert_eq!("gaia".parse::<ChainFamily>().unwrap(), ChainFamily::Cosmos);
        assert_eq!(
            "BitcoinCash".parse::<ChainFamily>().unwrap(),
            ChainFamily::BitcoinCash
        );
        assert!("solana".parse::<ChainFamily>().is_err());
        assert_eq!(ChainFamily::Dogecoin.max_memo_len(), Some(80));
        assert_eq!(ChainFamily::Cosmos.max_memo_len(), None);
    }
}
