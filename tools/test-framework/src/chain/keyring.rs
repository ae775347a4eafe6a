/*!
   The per-chain keyring.
*/

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::Error;
use crate::types::wallet::Wallet;

/**
   Wallets known to a chain driver, by key name.

   Only the owning driver mutates the keyring. Each key also has an
   async lock that the driver holds while a transaction signed by that
   key is in flight, so that account sequences stay monotonic.
*/
#[derive(Debug, Default)]
pub struct Keyring {
    chain_id: String,
    wallets: Mutex<BTreeMap<String, Wallet>>,
    locks: Mutex<BTreeMap<String, Arc<AsyncMutex<()>>>>,
}

impl Keyring {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            ..Default::default()
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Insert a wallet, replacing any previous wallet with the same key name.
    pub fn insert(&self, wallet: Wallet) {
        let mut wallets = match self.wallets.lock() {
            Ok(wallets) => wallets,
            Err(poisoned) => poisoned.into_inner(),
        };
        wallets.insert(wallet.key_name.clone(), wallet);
    }

    pub fn get(&self, key_name: &str) -> Result<Wallet, Error> {
        let wallets = match self.wallets.lock() {
            Ok(wallets) => wallets,
            Err(poisoned) => poisoned.into_inner(),
        };

        wallets
            .get(key_name)
            .cloned()
            .ok_or_else(|| Error::key_not_found(self.chain_id.clone(), key_name.to_string()))
    }

    pub fn contains(&self, key_name: &str) -> bool {
        self.get(key_name).is_ok()
    }

    pub fn find_by_address(&self, address: &str) -> Option<Wallet> {
        let wallets = match self.wallets.lock() {
            Ok(wallets) => wallets,
            Err(poisoned) => poisoned.into_inner(),
        };

        wallets
            .values()
            .find(|w| w.formatted_address == address)
            .cloned()
    }

    /// All wallets, ordered by key name.
    pub fn export(&self) -> Vec<Wallet> {
        match self.wallets.lock() {
            Ok(wallets) => wallets.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    pub fn import(&self, wallets: impl IntoIterator<Item = Wallet>) {
        for wallet in wallets {
            self.insert(wallet);
        }
    }

    /// Serialize transactions signed by `key_name`.
    pub async fn lock_key(&self, key_name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(key_name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorDetail;

    fn wallet(key_name: &str) -> Wallet {
        Wallet {
            key_name: key_name.to_string(),
            mnemonic: String::new(),
            formatted_address: format!("addr-{key_name}"),
            raw_address: key_name.as_bytes().to_vec(),
            chain_id: "gaia-1".to_string(),
        }
    }

    #[test]
    fn missing_keys_are_reported() {
        let keyring = Keyring::new("gaia-1");
        keyring.insert(wallet("faucet"));

        assert!(keyring.contains("faucet"));
        assert_eq!(
            keyring.find_by_address("addr-faucet").unwrap().key_name,
            "faucet"
        );

        match keyring.get("admin").unwrap_err().detail() {
            ErrorDetail::KeyNotFound(e) => assert_eq!(e.key_name, "admin"),
            e => panic!("unexpected error {e:?}"),
        }
    }

    #[tokio::test]
    async fn key_locks_are_exclusive() {
        let keyring = Keyring::new("gaia-1");

        let guard = keyring.lock_key("faucet").await;
        let other = keyring.lock_key("user").await;

        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            keyring.lock_key("faucet"),
        )
        .await;
        assert!(second.is_err());

        drop(guard);
        drop(other);
        let _again = keyring.lock_key("faucet").await;
    }
}
