//! Packet-key bookkeeping for the meta protocol.
//!
//! The daemon never touches the cipher itself (that lives below the
//! tunnel seam); it stores, answers, routes and invalidates the key
//! material the protocol carries.

use std::collections::HashMap;

use rand::RngCore;
use tinc_core::{Config, Error, Result};

/// Key material learned from a peer's `ANS_KEY`.
#[derive(Debug, Clone)]
pub struct PeerKey {
    pub cipher_key: String,
    pub digest_key: String,
    pub cipher: i32,
    pub digest: i32,
    pub maclength: i32,
    pub compression: i32,
}

/// Our own key material plus everything learned from peers.
#[derive(Debug)]
pub struct KeyStore {
    cipher_key: String,
    digest_key: String,
    cipher: i32,
    digest: i32,
    maclength: i32,
    compression: i32,
    /// Set once anyone asked for our key; gates `KEY_CHANGED` broadcasts.
    my_key_used: bool,
    peers: HashMap<String, PeerKey>,
}

fn random_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

const CIPHERS: &[(&str, i32)] = &[("none", 0), ("blowfish", 1), ("aes128", 2), ("aes256", 3)];
const DIGESTS: &[(&str, i32)] = &[("none", 0), ("sha1", 1), ("sha256", 2)];

impl KeyStore {
    /// Algorithm selection from our host configuration.
    pub fn from_config(host: &Config) -> Result<KeyStore> {
        let cipher = match host.first("Cipher") {
            Some(entry) => entry
                .as_choice(CIPHERS)
                .or_else(|_| entry.as_int().map(|v| v as i32))?,
            None => 1,
        };
        let digest = match host.first("Digest") {
            Some(entry) => entry
                .as_choice(DIGESTS)
                .or_else(|_| entry.as_int().map(|v| v as i32))?,
            None => 1,
        };
        let maclength = host.get_int("MACLength", 4)? as i32;
        let compression = host.get_int("Compression", 0)? as i32;
        if !(0..=11).contains(&compression) {
            return Err(Error::config("Compression must be between 0 and 11"));
        }

        Ok(KeyStore {
            cipher_key: random_key(),
            digest_key: random_key(),
            cipher,
            digest,
            maclength,
            compression,
            my_key_used: false,
            peers: HashMap::new(),
        })
    }

    /// Replace our key material (periodic rotation).
    pub fn regenerate(&mut self) {
        self.cipher_key = random_key();
        self.digest_key = random_key();
    }

    pub fn my_key_used(&self) -> bool {
        self.my_key_used
    }

    pub fn mark_my_key_used(&mut self) {
        self.my_key_used = true;
    }

    /// Fields for an `ANS_KEY` answering a request from `_for`.
    pub fn my_key(&self) -> (String, String, i32, i32, i32, i32) {
        (
            self.cipher_key.clone(),
            self.digest_key.clone(),
            self.cipher,
            self.digest,
            self.maclength,
            self.compression,
        )
    }

    /// Install key material for a peer; bogus parameters are protocol
    /// errors.
    pub fn install(&mut self, from: &str, key: PeerKey) -> Result<()> {
        if key.cipher < 0 || key.digest < 0 {
            return Err(Error::protocol(format!(
                "node {from} uses unknown cipher or digest"
            )));
        }
        if !(0..=64).contains(&key.maclength) {
            return Err(Error::protocol(format!("node {from} uses bogus MAC length")));
        }
        if !(0..=11).contains(&key.compression) {
            return Err(Error::protocol(format!(
                "node {from} uses bogus compression level"
            )));
        }
        self.peers.insert(from.to_owned(), key);
        Ok(())
    }

    pub fn invalidate(&mut self, name: &str) {
        self.peers.remove(name);
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KeyStore {
        KeyStore::from_config(&Config::new()).unwrap()
    }

    #[test]
    fn defaults_and_rotation() {
        let mut keys = store();
        let (cipher_key, digest_key, cipher, digest, maclength, compression) = keys.my_key();
        assert_eq!(cipher_key.len(), 64);
        assert_eq!(digest_key.len(), 64);
        assert_eq!((cipher, digest, maclength, compression), (1, 1, 4, 0));

        keys.regenerate();
        assert_ne!(keys.my_key().0, cipher_key);
    }

    #[test]
    fn cipher_names_and_numbers() {
        let mut cfg = Config::new();
        cfg.parse("Cipher = aes256\nDigest = 2\nMACLength = 8\n", "host").unwrap();
        let keys = KeyStore::from_config(&cfg).unwrap();
        let (_, _, cipher, digest, maclength, _) = keys.my_key();
        assert_eq!((cipher, digest, maclength), (3, 2, 8));
    }

    #[test]
    fn install_validates_parameters() {
        let mut keys = store();
        let good = PeerKey {
            cipher_key: "00ff".into(),
            digest_key: "aabb".into(),
            cipher: 1,
            digest: 1,
            maclength: 4,
            compression: 0,
        };
        keys.install("beta", good.clone()).unwrap();
        assert!(keys.has_key("beta"));

        let bogus = PeerKey {
            compression: 12,
            ..good
        };
        assert!(keys.install("beta", bogus).is_err());

        keys.invalidate("beta");
        assert!(!keys.has_key("beta"));
    }
}
