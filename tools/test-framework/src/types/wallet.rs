/*!
   Wallets held in a chain's keyring.
*/

use core::fmt::{self, Display};
use serde::{Deserialize, Serialize};

/**
   A key created on, or recovered into, a chain.

   `formatted_address` is the address in the chain's native text format
   (bech32, `0x` hex or a base58 UTXO address). `raw_address` holds the
   decoded bytes when the format is decodable, or the address bytes
   otherwise.
*/
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub key_name: String,
    pub mnemonic: String,
    pub formatted_address: String,
    pub raw_address: Vec<u8>,
    pub chain_id: String,
}

impl Wallet {
    pub fn address(&self) -> &str {
        &self.formatted_address
    }
}

impl Display for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) on {}",
            self.key_name, self.formatted_address, self.chain_id
        )
    }
}
