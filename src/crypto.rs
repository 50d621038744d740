//! MAC-based capability tokens: transient-file cookies, block write/erase
//! certificates, and signed-message integrity tags.
//!
//! All of them are an 8-byte truncation of an AES-128 CBC-MAC with a zero
//! IV and zero padding. The inputs are either fixed-size (inode ids,
//! zero-padded certificate buffers) or length-framed by the enclosing
//! message, so plain zero padding is safe here.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;

pub const SECRET_KEY_SIZE: usize = 16;
pub const MAC_SIZE: usize = 8;

pub type SecretKey = [u8; SECRET_KEY_SIZE];
pub type Mac = [u8; MAC_SIZE];

/// An expanded AES key, cached so the per-request MACs skip the key
/// schedule.
#[derive(Clone)]
pub struct MacKey {
    cipher: Aes128,
}

impl MacKey {
    pub fn new(key: &SecretKey) -> Self {
        MacKey { cipher: Aes128::new(key.into()) }
    }

    pub fn cbc_mac(&self, data: &[u8]) -> Mac {
        let mut state = aes::Block::default();
        for chunk in data.chunks(16) {
            for (s, b) in state.iter_mut().zip(chunk) {
                *s ^= b;
            }
            self.cipher.encrypt_block(&mut state);
        }
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&state[..MAC_SIZE]);
        mac
    }
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MacKey(..)")
    }
}

pub fn generate_secret_key() -> SecretKey {
    let mut key = [0u8; SECRET_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_deterministic_and_key_dependent() {
        let k1 = MacKey::new(&[7u8; 16]);
        let k2 = MacKey::new(&[8u8; 16]);
        let mac = k1.cbc_mac(b"some data");
        assert_eq!(mac, k1.cbc_mac(b"some data"));
        assert_ne!(mac, k1.cbc_mac(b"some datb"));
        assert_ne!(mac, k2.cbc_mac(b"some data"));
    }

    #[test]
    fn mac_chains_across_blocks() {
        let key = MacKey::new(&[1u8; 16]);
        let long = [0x5Au8; 48];
        assert_ne!(key.cbc_mac(&long[..16]), key.cbc_mac(&long));
        // zero padding: a 16-byte block and its 17-byte zero-extension differ
        let mut padded = long[..16].to_vec();
        padded.push(0);
        assert_ne!(key.cbc_mac(&long[..16]), key.cbc_mac(&padded));
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(generate_secret_key(), generate_secret_key());
    }
}
