/*!
   Conversion between formatted and raw addresses.
*/

use eyre::eyre;
use subtle_encoding::{bech32, hex};

use crate::error::{handle_generic_error, Error};

/// How a family formats account addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressCodec {
    Bech32 { prefix: String },
    /// `0x`-prefixed hex, as used by EVM chains.
    Hex,
    /// Addresses treated as opaque strings, as for UTXO chains.
    Opaque,
}

impl AddressCodec {
    pub fn decode(&self, address: &str) -> Result<Vec<u8>, Error> {
        match self {
            Self::Bech32 { prefix } => {
                let (hrp, data) = bech32::decode(address).map_err(handle_generic_error)?;
                if &hrp != prefix {
                    return Err(Error::generic(eyre!(
                        "address {address} has prefix {hrp}, expected {prefix}"
                    )));
                }
                Ok(data)
            }
            Self::Hex => {
                let stripped = address
                    .strip_prefix("0x")
                    .or_else(|| address.strip_prefix("0X"))
                    .unwrap_or(address);
                hex::decode(stripped.to_lowercase()).map_err(handle_generic_error)
            }
            Self::Opaque => Ok(address.as_bytes().to_vec()),
        }
    }

    pub fn encode(&self, raw: &[u8]) -> Result<String, Error> {
        match self {
            Self::Bech32 { prefix } => Ok(bech32::encode(prefix, raw)),
            Self::Hex => {
                let encoded = String::from_utf8(hex::encode(raw)).map_err(handle_generic_error)?;
                Ok(format!("0x{encoded}"))
            }
            Self::Opaque => String::from_utf8(raw.to_vec()).map_err(handle_generic_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bech32_checks_prefix() {
        let codec = AddressCodec::Bech32 {
            prefix: "cosmos".to_string(),
        };
        let raw: Vec<u8> = (1..=20).collect();

        let address = codec.encode(&raw).unwrap();
        assert!(address.starts_with("cosmos1"));
        assert_eq!(codec.decode(&address).unwrap(), raw);

        let thor = AddressCodec::Bech32 {
            prefix: "tthor".to_string(),
        };
        assert!(thor.decode(&address).is_err());
    }

    #[test]
    fn hex_addresses() {
        let raw = AddressCodec::Hex
            .decode("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
            .unwrap();
        assert_eq!(raw.len(), 20);
        assert_eq!(
            AddressCodec::Hex.encode(&raw).unwrap(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }
}
