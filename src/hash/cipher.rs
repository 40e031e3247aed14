//! BASE64 and AES-CFB-128.
//!
//! AES key material comes from a one-round (configurable) SHA-256 digest
//! chain over `(password, salt)`, the `EVP_BytesToKey` construction: the
//! key is the first bytes of the chain, the IV the bytes after it, zero
//! padded to the 16-byte CFB block.

use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cfb_mode::{Decryptor, Encryptor};
use cipher::{AsyncStreamCipher, KeyIvInit};
use sha2::{Digest, Sha256};

use super::{Cipher, Hash};
use crate::error::{Error, Result};

/// Key and IV lengths per variant. The IV is shorter than the CFB block for
/// the smaller keys; the remainder of the block stays zero.
fn key_iv_len(cipher: Cipher) -> (usize, usize) {
    match cipher {
        Cipher::Aes128 => (16, 8),
        Cipher::Aes192 => (24, 12),
        Cipher::Aes256 => (32, 16),
        Cipher::None | Cipher::Base64 => (0, 0),
    }
}

/// `EVP_BytesToKey`-style derivation with SHA-256.
pub(crate) fn bytes_to_key(
    password: &[u8],
    salt: &[u8],
    rounds: u32,
    key_len: usize,
    iv_len: usize,
) -> (Vec<u8>, [u8; 16]) {
    let mut derived: Vec<u8> = Vec::with_capacity(key_len + iv_len + 32);
    let mut block: Vec<u8> = Vec::new();
    while derived.len() < key_len + iv_len {
        let mut hasher = Sha256::new();
        hasher.update(&block);
        hasher.update(password);
        hasher.update(salt);
        let mut digest = hasher.finalize().to_vec();
        for _ in 1..rounds.max(1) {
            digest = Sha256::digest(&digest).to_vec();
        }
        derived.extend_from_slice(&digest);
        block = digest;
    }
    let key = derived[..key_len].to_vec();
    let mut iv = [0u8; 16];
    iv[..iv_len].copy_from_slice(&derived[key_len..key_len + iv_len]);
    (key, iv)
}

pub(crate) fn encode(hash: &Hash, data: &[u8], cipher: Cipher) -> Result<Vec<u8>> {
    match cipher {
        Cipher::None => Ok(data.to_vec()),
        Cipher::Base64 => Ok(BASE64.encode(data).into_bytes()),
        Cipher::Aes128 | Cipher::Aes192 | Cipher::Aes256 => {
            aes_apply(hash, data, cipher, true)
        }
    }
}

pub(crate) fn decode(hash: &Hash, data: &[u8], cipher: Cipher) -> Result<Vec<u8>> {
    match cipher {
        Cipher::None => Ok(data.to_vec()),
        Cipher::Base64 => BASE64
            .decode(data)
            .map_err(|err| Error::codec("base64", err.to_string())),
        Cipher::Aes128 | Cipher::Aes192 | Cipher::Aes256 => {
            aes_apply(hash, data, cipher, false)
        }
    }
}

fn aes_apply(hash: &Hash, data: &[u8], cipher: Cipher, encrypt: bool) -> Result<Vec<u8>> {
    let (password, salt, rounds) = hash.key_material();
    let (key_len, iv_len) = key_iv_len(cipher);
    let (key, iv) = bytes_to_key(password, salt, rounds, key_len, iv_len);

    let mut buffer = data.to_vec();
    let invalid = |_| Error::codec("aes-cfb", "derived key material has the wrong length");
    match (cipher, encrypt) {
        (Cipher::Aes128, true) => Encryptor::<Aes128>::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .encrypt(&mut buffer),
        (Cipher::Aes128, false) => Decryptor::<Aes128>::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .decrypt(&mut buffer),
        (Cipher::Aes192, true) => Encryptor::<Aes192>::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .encrypt(&mut buffer),
        (Cipher::Aes192, false) => Decryptor::<Aes192>::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .decrypt(&mut buffer),
        (Cipher::Aes256, true) => Encryptor::<Aes256>::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .encrypt(&mut buffer),
        (Cipher::Aes256, false) => Decryptor::<Aes256>::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .decrypt(&mut buffer),
        _ => unreachable!("non-AES ciphers are handled by the caller"),
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_and_salted() {
        let (key_a, iv_a) = bytes_to_key(b"password", b"salt", 1, 32, 16);
        let (key_b, iv_b) = bytes_to_key(b"password", b"salt", 1, 32, 16);
        assert_eq!(key_a, key_b);
        assert_eq!(iv_a, iv_b);

        let (key_c, _) = bytes_to_key(b"password", b"pepper", 1, 32, 16);
        assert_ne!(key_a, key_c);

        let (key_d, _) = bytes_to_key(b"password", b"salt", 2, 32, 16);
        assert_ne!(key_a, key_d);
    }

    #[test]
    fn short_iv_variants_zero_pad_the_block() {
        let (_, iv) = bytes_to_key(b"password", b"salt", 1, 16, 8);
        assert_eq!(&iv[8..], &[0u8; 8]);
    }

    #[test]
    fn derivation_chain_extends_for_long_keys() {
        // 32 key + 16 iv needs two SHA-256 blocks.
        let (key, iv) = bytes_to_key(b"p", b"s", 1, 32, 16);
        assert_eq!(key.len(), 32);
        assert!(iv.iter().any(|&b| b != 0));
    }
}
