//! Private keys the node decrypts with besides its own identity.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use missive_shared::identity::Identity;
use missive_shared::types::PublicKey;

pub trait KeyStore: Send + Sync {
    fn insert(&self, key: Identity);
    fn get(&self, public_key: &PublicKey) -> Option<Identity>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ephemeral keys indexed by hex public key.
///
/// Entries live until the process exits. Transport topics are not
/// recalculated on removal, so evicting a key would gain nothing.
#[derive(Debug, Default)]
pub struct EphemeralKeyStore {
    keys: RwLock<HashMap<String, Identity>>,
}

impl EphemeralKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for EphemeralKeyStore {
    fn insert(&self, key: Identity) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.public_key().to_hex(), key);
    }

    fn get(&self, public_key: &PublicKey) -> Option<Identity> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&public_key.to_hex())
            .cloned()
    }

    fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_public_key() {
        let store = EphemeralKeyStore::new();
        let key = Identity::generate();
        assert!(store.get(&key.public_key()).is_none());

        store.insert(key.clone());
        store.insert(key.clone());

        let found = store.get(&key.public_key()).unwrap();
        assert_eq!(found.public_key(), key.public_key());
        assert_eq!(store.len(), 1);
    }
}
